mod common;

use common::{max_abs_diff, rmse, tabular_regression};
use nystrom_krr::{
    EvaluationHook, FitSession, KernelSpec, KrrConfig, ModelArtifact, ResourceBudget,
    SolverStatus, fit, fit_with_session,
};
use tempfile::tempdir;

fn reference_config(m: usize) -> KrrConfig {
    KrrConfig::new(KernelSpec::Gaussian { sigma: 5.0 }, 1e-5, m)
        .unwrap()
        .with_maxiter(20)
}

#[test]
fn all_training_points_as_centers_generalizes() {
    let split = tabular_regression(7);
    let n_train = split.x_train.nrows();
    assert_eq!(n_train, 404);

    let hook = EvaluationHook::rmse(split.x_test.clone(), split.y_test.clone());
    let mut session = FitSession::new(ResourceBudget::unbounded()).with_evaluation(hook);
    let outcome = fit_with_session(
        split.x_train.view(),
        split.y_train.view(),
        &reference_config(n_train),
        &mut session,
    )
    .unwrap();

    let report = &outcome.report;
    assert_eq!(report.status, SolverStatus::Converged);
    assert!(report.iterations <= 10, "took {} iterations", report.iterations);
    let residuals = report.residual_norms();
    assert!(residuals.last().unwrap() < residuals.first().unwrap());

    let model = &outcome.model;
    assert_eq!(model.num_centers(), n_train);
    assert_eq!(model.center_indices.as_deref(), Some(&(0..n_train).collect::<Vec<_>>()[..]));

    let train_rmse = rmse(&split.y_train, &model.predict(split.x_train.view()).unwrap());
    let test_predictions = model.predict(split.x_test.view()).unwrap();
    let test_rmse = rmse(&split.y_test, &test_predictions);
    let test_mean = split.y_train.mean().unwrap();
    let baseline = rmse(&split.y_test, &split.y_test.mapv(|_| test_mean));
    assert!(
        train_rmse <= test_rmse,
        "train rmse {train_rmse} above test rmse {test_rmse}"
    );
    assert!(
        test_rmse < 0.8 * baseline,
        "test rmse {test_rmse} does not beat the mean predictor ({baseline})"
    );

    assert_eq!(report.evaluations.len(), report.iterations);
    let last = report.evaluations.last().unwrap();
    assert_eq!(last.metric, "rmse");
    assert!((last.value - test_rmse).abs() < 1e-8);
}

#[test]
fn saved_model_reproduces_predictions() {
    let split = tabular_regression(11);
    let model = fit(
        split.x_train.view(),
        split.y_train.view(),
        &reference_config(120).with_seed(3),
    )
    .unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    model.save(&path).unwrap();
    let loaded = ModelArtifact::load(&path).unwrap();
    assert_eq!(loaded.num_centers(), 120);
    assert_eq!(loaded.kernel, model.kernel);

    let before = model.predict(split.x_test.view()).unwrap();
    let after = loaded.predict(split.x_test.view()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn fits_are_reproducible_from_the_seed() {
    let split = tabular_regression(5);
    let config = reference_config(60).with_seed(42);
    let first = fit(split.x_train.view(), split.y_train.view(), &config).unwrap();
    let second = fit(split.x_train.view(), split.y_train.view(), &config).unwrap();
    assert_eq!(first.center_indices, second.center_indices);
    assert_eq!(first.coefficients, second.coefficients);

    let other = fit(
        split.x_train.view(),
        split.y_train.view(),
        &config.clone().with_seed(43),
    )
    .unwrap();
    assert_ne!(first.center_indices, other.center_indices);

    let drift = max_abs_diff(
        &first.predict(split.x_test.view()).unwrap(),
        &other.predict(split.x_test.view()).unwrap(),
    );
    assert!(drift > 0.0);
}
