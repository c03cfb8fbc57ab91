//! Preconditioned conjugate gradient over the Nystrom normal equations.
//!
//! With `N` training points, `M` landmarks and kernel block `K_NM`, the
//! coefficients `alpha` solve
//!
//! ```text
//! (K_NM^T K_NM / N + lambda K_MM) alpha = K_NM^T Y / N
//! ```
//!
//! where `K_MM` enters through the preconditioner's first factor. Each target
//! column runs its own scalar recurrences; the loop stops when the largest
//! relative change in any column falls below the configured threshold.

use crate::centers::CenterSet;
use crate::config::KrrConfig;
use crate::dispatch::{
    Materialization, OperationKind, OperationProfile, ResourceBudget, Strategy, select_strategy,
};
use crate::estimate::KrrError;
use crate::hooks::{CancellationToken, EvaluationHook, EvaluationRecord};
use crate::kernel::{KernelEvaluator, KernelSpec};
use crate::plan::TilePlan;
use crate::preconditioner::Preconditioner;
use crate::progress::{FitProgressObserver, FitProgressStage};
use log::Level;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStatus {
    Converged,
    MaxIterationsReached,
    Cancelled,
}

/// Diagnostics of one solver iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Frobenius norm of the residual `g - H alpha`.
    pub residual_norm: f64,
    /// Quadratic objective `alpha^T H alpha / 2 - g^T alpha`; never increases.
    pub objective: f64,
    /// Largest relative coefficient change over the target columns.
    pub relative_change: f64,
    /// Whether the residual was recomputed from its definition this iteration.
    pub full_gradient: bool,
}

#[derive(Debug, Clone)]
pub struct SolverReport {
    pub status: SolverStatus,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
    pub evaluations: Vec<EvaluationRecord>,
    /// Whether the `N x M` kernel matrix was materialized at any point.
    pub kernel_stored: bool,
    pub elapsed: Duration,
}

impl SolverReport {
    pub fn residual_norms(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.residual_norm).collect()
    }

    pub fn objectives(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.objective).collect()
    }

    pub fn full_gradient_iterations(&self) -> Vec<usize> {
        self.history
            .iter()
            .filter(|r| r.full_gradient)
            .map(|r| r.iteration)
            .collect()
    }
}

pub struct SolverOutput {
    pub coefficients: Array2<f64>,
    pub report: SolverReport,
}

/// Training data and model definition for one solve.
pub struct Problem<'a> {
    pub points: ArrayView2<'a, f64>,
    pub targets: ArrayView2<'a, f64>,
    pub centers: &'a CenterSet,
    pub kernel: &'a KernelSpec,
    pub penalty: f64,
}

/// Everything a solve needs besides the problem itself.
pub struct SolverContext<'a> {
    pub config: &'a KrrConfig,
    pub budget: &'a ResourceBudget,
    pub plan: TilePlan,
    pub cancellation: &'a CancellationToken,
    pub evaluation: Option<&'a EvaluationHook>,
    pub progress: &'a mut dyn FitProgressObserver,
}

/// Products with the system matrix, dispatched per call.
struct NormalOperator<'a> {
    points: ArrayView2<'a, f64>,
    targets: ArrayView2<'a, f64>,
    centers: ArrayView2<'a, f64>,
    penalty: f64,
    inv_n: f64,
    preconditioner: &'a Preconditioner,
    evaluator: KernelEvaluator<'a>,
    config: &'a KrrConfig,
    budget: &'a ResourceBudget,
    plan: TilePlan,
    stored: Option<Array2<f64>>,
}

impl<'a> NormalOperator<'a> {
    fn strategy_for(&self, rows: usize) -> Result<Strategy, KrrError> {
        let profile = OperationProfile::kernel_apply(
            rows,
            self.centers.nrows(),
            self.centers.ncols(),
            self.targets.ncols(),
        )
        .with_preferred_tile_rows(self.plan.rows_per_tile);
        let strategy = select_strategy(&profile, self.config, self.budget)?;
        let device = strategy.executing_device(OperationKind::KernelApply);
        log::trace!(
            "Kernel product over {rows} rows on {device:?} ({:?}, tiles of {})",
            strategy.materialize,
            strategy.tile
        );
        Ok(strategy)
    }

    fn stored_kernel(&mut self) -> &Array2<f64> {
        let (evaluator, points, centers) = (self.evaluator, self.points, self.centers);
        self.stored.get_or_insert_with(|| {
            log::debug!(
                "Materializing the {}x{} kernel matrix",
                points.nrows(),
                centers.nrows()
            );
            evaluator.evaluate(points, centers)
        })
    }

    /// Right-hand side `K_NM^T Y / N`.
    fn rhs(&mut self) -> Result<Array2<f64>, KrrError> {
        let strategy = self.strategy_for(self.points.nrows())?;
        let targets = self.targets;
        let product = match strategy.materialize {
            Materialization::Dense => self.stored_kernel().t().dot(&targets),
            Materialization::Fused => {
                self.evaluator
                    .apply_transpose(self.points, self.centers, targets, &strategy)
            }
        };
        Ok(product * self.inv_n)
    }

    /// `H v = K_NM^T K_NM v / N + lambda T^T T v`
    fn apply(&mut self, v: ArrayView2<f64>) -> Result<Array2<f64>, KrrError> {
        let strategy = self.strategy_for(self.points.nrows())?;
        let mut out = match strategy.materialize {
            Materialization::Dense => {
                let kernel = self.stored_kernel();
                kernel.t().dot(&kernel.dot(&v))
            }
            Materialization::Fused => {
                self.evaluator
                    .apply_normal(self.points, self.centers, v, &strategy)
            }
        };
        out *= self.inv_n;
        out.scaled_add(self.penalty, &self.preconditioner.regularizer(v));
        Ok(out)
    }

    /// `K(reference, centers) alpha`, always tile by tile.
    fn predict(
        &self,
        reference: ArrayView2<f64>,
        alpha: ArrayView2<f64>,
    ) -> Result<Array2<f64>, KrrError> {
        let mut strategy = self.strategy_for(reference.nrows())?;
        strategy.tile = strategy.tile.min(self.plan.rows_per_tile);
        Ok(self.evaluator.apply(reference, self.centers, alpha, &strategy))
    }
}

fn column_dots(a: &Array2<f64>, b: &Array2<f64>) -> Array1<f64> {
    Zip::from(a.axis_iter(Axis(1)))
        .and(b.axis_iter(Axis(1)))
        .map_collect(|x, y| x.dot(&y))
}

fn column_norms(a: &Array2<f64>) -> Array1<f64> {
    a.axis_iter(Axis(1)).map(|col| col.dot(&col).sqrt()).collect()
}

/// Runs preconditioned conjugate gradient and returns the coefficients.
pub fn solve(
    problem: &Problem<'_>,
    preconditioner: &Preconditioner,
    ctx: SolverContext<'_>,
) -> Result<SolverOutput, KrrError> {
    let start = Instant::now();
    let config = ctx.config;
    let options = &config.options;
    let threshold = options.convergence_threshold(config.precision);
    let guard = options.cg_epsilon(config.precision);
    let level = if options.debug { Level::Info } else { Level::Debug };
    let n = problem.points.nrows();

    let mut operator = NormalOperator {
        points: problem.points.view(),
        targets: problem.targets.view(),
        centers: problem.centers.view(),
        penalty: problem.penalty,
        inv_n: 1.0 / n as f64,
        preconditioner,
        evaluator: KernelEvaluator::new(problem.kernel, config.precision),
        config,
        budget: ctx.budget,
        plan: ctx.plan,
        stored: None,
    };

    let g = operator.rhs()?;
    let mut alpha = Array2::<f64>::zeros(g.raw_dim());
    let mut r = g.clone();
    let mut z = preconditioner.precondition(r.view());
    let mut p = z.clone();
    let mut rz = column_dots(&r, &z);

    let mut history = Vec::with_capacity(config.maxiter);
    let mut evaluations = Vec::new();
    let mut status = SolverStatus::MaxIterationsReached;
    let mut iterations = 0;

    ctx.progress
        .on_stage_start(FitProgressStage::ConjugateGradient, config.maxiter);
    for iteration in 1..=config.maxiter {
        if ctx.cancellation.is_cancelled() {
            log::info!("Solver cancelled after {iterations} iterations");
            status = SolverStatus::Cancelled;
            break;
        }

        let w = operator.apply(p.view())?;
        let pw = column_dots(&p, &w);
        let steps: Array1<f64> = Zip::from(&rz).and(&pw).map_collect(|&rz, &pw| rz / (pw + guard));

        let step_norms = &column_norms(&p) * &steps.mapv(f64::abs);
        alpha += &(&p * &steps);
        let alpha_norms = column_norms(&alpha);
        let relative_change = Zip::from(&step_norms)
            .and(&alpha_norms)
            .fold(0.0_f64, |worst, &delta, &size| {
                let ratio = if size > 0.0 {
                    delta / size
                } else if delta > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                };
                worst.max(ratio)
            });

        let full_gradient = iteration % options.cg_full_gradient_every == 0;
        if full_gradient {
            r = &g - &operator.apply(alpha.view())?;
        } else {
            r -= &(&w * &steps);
        }
        z = preconditioner.precondition(r.view());
        let rz_next = column_dots(&r, &z);

        let record = IterationRecord {
            iteration,
            residual_norm: r.iter().map(|v| v * v).sum::<f64>().sqrt(),
            objective: -0.5 * (&alpha * &(&g + &r)).sum(),
            relative_change,
            full_gradient,
        };
        log::log!(
            level,
            "Iteration {iteration}: residual {:.3e}, objective {:.6e}, change {:.3e}{}",
            record.residual_norm,
            record.objective,
            record.relative_change,
            if full_gradient { " (full gradient)" } else { "" }
        );
        ctx.progress.on_iteration(&record);
        history.push(record);
        iterations = iteration;

        if let Some(hook) = ctx.evaluation {
            if iteration % options.error_every == 0 {
                let predicted = operator.predict(hook.reference_points(), alpha.view())?;
                evaluations.extend(hook.evaluate(iteration, predicted.view()));
            }
        }

        if relative_change < threshold {
            status = SolverStatus::Converged;
            break;
        }

        let beta = Zip::from(&rz_next)
            .and(&rz)
            .map_collect(|&next, &prev| if prev != 0.0 { next / prev } else { 0.0 });
        p = &z + &(&p * &beta);
        rz = rz_next;
    }
    ctx.progress
        .on_stage_finish(FitProgressStage::ConjugateGradient);

    let report = SolverReport {
        status,
        iterations,
        history,
        evaluations,
        kernel_stored: operator.stored.is_some(),
        elapsed: start.elapsed(),
    };
    log::info!(
        "Conjugate gradient finished: {:?} after {} iterations in {:.3?}",
        report.status,
        report.iterations,
        report.elapsed
    );
    Ok(SolverOutput {
        coefficients: alpha,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::centers::{CenterStrategy, select_centers};
    use crate::config::SolverOptions;
    use crate::dispatch::Residency;
    use crate::hooks::EvaluationHook;
    use crate::plan::KernelPlanCache;
    use crate::progress::NoopFitProgress;
    use crate::test_fixtures::smooth_regression;

    struct Fixture {
        x: Array2<f64>,
        y: Array2<f64>,
        centers: CenterSet,
        config: KrrConfig,
        preconditioner: Preconditioner,
        plan: TilePlan,
    }

    fn fixture(n: usize, m: usize, options: SolverOptions, maxiter: usize) -> Fixture {
        let (x, y) = smooth_regression(n, 3, 31);
        let kernel = KernelSpec::Gaussian { sigma: 1.5 };
        let config = KrrConfig::new(kernel, 1e-3, m)
            .unwrap()
            .with_maxiter(maxiter)
            .with_options(options);
        let centers = select_centers(x.view(), m, &CenterStrategy::Uniform, 5).unwrap();
        let pc_profile = OperationProfile::preconditioner(m, 3);
        let strategy = select_strategy(&pc_profile, &config, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.residency, Residency::InCore);
        let preconditioner =
            Preconditioner::build(&centers, &config.kernel, config.penalty, &strategy, &config.options)
                .unwrap();
        let plan = KernelPlanCache::with_cache_bytes(1 << 16)
            .warm_up(&config.kernel, config.precision, 3, m)
            .unwrap();
        Fixture {
            x,
            y,
            centers,
            config,
            preconditioner,
            plan,
        }
    }

    fn run(
        f: &Fixture,
        cancellation: &CancellationToken,
        hook: Option<&EvaluationHook>,
    ) -> SolverOutput {
        run_observed(f, cancellation, hook, &mut NoopFitProgress)
    }

    fn run_observed(
        f: &Fixture,
        cancellation: &CancellationToken,
        hook: Option<&EvaluationHook>,
        progress: &mut dyn FitProgressObserver,
    ) -> SolverOutput {
        let problem = Problem {
            points: f.x.view(),
            targets: f.y.view(),
            centers: &f.centers,
            kernel: &f.config.kernel,
            penalty: f.config.penalty,
        };
        let budget = ResourceBudget::unbounded();
        let ctx = SolverContext {
            config: &f.config,
            budget: &budget,
            plan: f.plan,
            cancellation,
            evaluation: hook,
            progress,
        };
        solve(&problem, &f.preconditioner, ctx).unwrap()
    }

    #[test]
    fn objective_never_increases() {
        let f = fixture(120, 25, SolverOptions::default(), 15);
        let out = run(&f, &CancellationToken::new(), None);
        let objectives = out.report.objectives();
        assert!(!objectives.is_empty());
        for pair in objectives.windows(2) {
            let slack = 1e-9 * pair[0].abs().max(1.0);
            assert!(
                pair[1] <= pair[0] + slack,
                "objective rose from {} to {}",
                pair[0],
                pair[1]
            );
        }
        assert!(out.report.kernel_stored);
    }

    #[test]
    fn full_gradient_follows_cadence() {
        let options = SolverOptions {
            cg_full_gradient_every: 3,
            cg_tolerance: 0.0,
            ..SolverOptions::default()
        };
        let f = fixture(90, 20, options, 8);
        let out = run(&f, &CancellationToken::new(), None);
        let expected: Vec<usize> = [3, 6]
            .into_iter()
            .filter(|&i| i <= out.report.iterations)
            .collect();
        assert_eq!(out.report.full_gradient_iterations(), expected);
        assert_eq!(out.report.history.len(), out.report.iterations);
    }

    #[test]
    fn pre_cancelled_solve_returns_zero_coefficients() {
        let f = fixture(40, 10, SolverOptions::default(), 10);
        let token = CancellationToken::new();
        token.cancel();
        let out = run(&f, &token, None);
        assert_eq!(out.report.status, SolverStatus::Cancelled);
        assert_eq!(out.report.iterations, 0);
        assert!(out.coefficients.iter().all(|&v| v == 0.0));
        assert_eq!(out.coefficients.dim(), (10, 1));
    }

    /// Cancels the token once the solver reports iteration `after`.
    struct CancelAfter {
        token: CancellationToken,
        after: usize,
    }

    impl FitProgressObserver for CancelAfter {
        fn on_iteration(&mut self, record: &IterationRecord) {
            if record.iteration == self.after {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn cancellation_mid_solve_keeps_the_latest_coefficients() {
        let options = SolverOptions {
            cg_tolerance: 0.0,
            ..SolverOptions::default()
        };
        let f = fixture(90, 20, options.clone(), 10);
        let token = CancellationToken::new();
        let mut observer = CancelAfter {
            token: token.clone(),
            after: 2,
        };
        let out = run_observed(&f, &token, None, &mut observer);
        assert_eq!(out.report.status, SolverStatus::Cancelled);
        assert_eq!(out.report.iterations, 2);
        assert_eq!(out.report.history.len(), 2);
        assert!(out.coefficients.iter().any(|&v| v != 0.0));

        let capped = fixture(90, 20, options, 2);
        let reference = run(&capped, &CancellationToken::new(), None);
        assert_eq!(reference.report.status, SolverStatus::MaxIterationsReached);
        assert_eq!(out.coefficients, reference.coefficients);
    }

    #[test]
    fn evaluation_hook_runs_on_cadence_and_survives_failures() {
        let options = SolverOptions {
            error_every: 2,
            cg_tolerance: 0.0,
            ..SolverOptions::default()
        };
        let f = fixture(60, 15, options, 6);
        let reference = f.x.slice(ndarray::s![..10, ..]).to_owned();
        let truth = f.y.slice(ndarray::s![..10, ..]).to_owned();

        let good = EvaluationHook::rmse(reference.clone(), truth.clone());
        let out = run(&f, &CancellationToken::new(), Some(&good));
        let evaluated: Vec<usize> = out.report.evaluations.iter().map(|e| e.iteration).collect();
        let expected: Vec<usize> = (1..=out.report.iterations).filter(|i| i % 2 == 0).collect();
        assert_eq!(evaluated, expected);
        assert!(out.report.evaluations.iter().all(|e| e.value.is_finite()));

        let bad = EvaluationHook::new(reference, truth, |_, _| panic!("bad metric"));
        let with_bad = run(&f, &CancellationToken::new(), Some(&bad));
        assert!(with_bad.report.evaluations.is_empty());
        assert_eq!(with_bad.coefficients, out.coefficients);
    }

    #[test]
    fn fused_products_reach_the_same_solution() {
        let stored = fixture(80, 20, SolverOptions::default(), 20);
        let fused = fixture(
            80,
            20,
            SolverOptions {
                never_store_kernel: true,
                ..SolverOptions::default()
            },
            20,
        );
        let a = run(&stored, &CancellationToken::new(), None);
        let b = run(&fused, &CancellationToken::new(), None);
        assert!(a.report.kernel_stored);
        assert!(!b.report.kernel_stored);
        let scale = a.coefficients.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        for (x, y) in a.coefficients.iter().zip(b.coefficients.iter()) {
            assert!((x - y).abs() <= 1e-6 * scale, "{x} vs {y}");
        }
    }
}
