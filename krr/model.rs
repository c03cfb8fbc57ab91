use crate::config::Precision;
use crate::dispatch::Strategy;
use crate::kernel::{KernelEvaluator, KernelSpec};
use crate::solver::SolverStatus;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Rows per tile when predicting from a saved model.
const PREDICT_TILE_ROWS: usize = 1024;
const PREDICT_STREAMS: usize = 2;

/// Custom error type for model loading, saving, and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Input data has {found} feature columns but the model was trained on {expected}.")]
    DimensionMismatch { found: usize, expected: usize },

    #[error("Model file is inconsistent: {0}")]
    Inconsistent(String),

    #[error("Input data contains non-finite values.")]
    NonFiniteInput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse model file: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize model: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Everything needed to predict: the kernel, the landmarks and one coefficient
/// column per target, together with how the fit ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub penalty: f64,
    pub precision: Precision,
    pub status: SolverStatus,
    pub iterations: usize,
    pub num_training_points: usize,
    /// Training-row indices of the landmarks, when drawn from the data.
    pub center_indices: Option<Vec<usize>>,
    /// Feature column names, in the order the model expects them. Empty when
    /// the model was fitted from in-memory arrays.
    #[serde(default)]
    pub feature_names: Vec<String>,
    #[serde(default)]
    pub target_names: Vec<String>,
    pub kernel: KernelSpec,
    /// `M x d` landmark coordinates.
    pub centers: Array2<f64>,
    /// `M x T` coefficients.
    pub coefficients: Array2<f64>,
}

impl ModelArtifact {
    pub fn num_centers(&self) -> usize {
        self.centers.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.centers.ncols()
    }

    pub fn num_targets(&self) -> usize {
        self.coefficients.ncols()
    }

    /// `K(x, centers) alpha` as an `n x T` matrix.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        if x.ncols() != self.num_features() {
            return Err(ModelError::DimensionMismatch {
                found: x.ncols(),
                expected: self.num_features(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteInput);
        }
        let evaluator = KernelEvaluator::new(&self.kernel, self.precision);
        let strategy = Strategy::cpu_fused(self.precision, PREDICT_TILE_ROWS, PREDICT_STREAMS);
        Ok(evaluator.apply(x, self.centers.view(), self.coefficients.view(), &strategy))
    }

    fn check_consistency(&self) -> Result<(), ModelError> {
        if self.centers.nrows() != self.coefficients.nrows() {
            return Err(ModelError::Inconsistent(format!(
                "{} centers but {} coefficient rows",
                self.centers.nrows(),
                self.coefficients.nrows()
            )));
        }
        if let Some(indices) = &self.center_indices {
            if indices.len() != self.centers.nrows() {
                return Err(ModelError::Inconsistent(format!(
                    "{} center indices for {} centers",
                    indices.len(),
                    self.centers.nrows()
                )));
            }
        }
        if !self.feature_names.is_empty() && self.feature_names.len() != self.centers.ncols() {
            return Err(ModelError::Inconsistent(format!(
                "{} feature names for {} features",
                self.feature_names.len(),
                self.centers.ncols()
            )));
        }
        self.kernel
            .validate()
            .map_err(|e| ModelError::Inconsistent(e.to_string()))
    }

    /// Saves the model to a human-readable TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks its shapes agree.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: ModelArtifact = toml::from_str(&toml_string)?;
        model.check_consistency()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::gaussian_points;
    use tempfile::NamedTempFile;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            penalty: 1e-4,
            precision: Precision::Double,
            status: SolverStatus::Converged,
            iterations: 3,
            num_training_points: 40,
            center_indices: Some(vec![4, 9, 17, 22, 30]),
            feature_names: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            target_names: vec!["y1".to_string(), "y2".to_string()],
            kernel: KernelSpec::Gaussian { sigma: 1.2 },
            centers: gaussian_points(5, 3, 1),
            coefficients: gaussian_points(5, 2, 2),
        }
    }

    #[test]
    fn saved_model_predicts_identically_after_loading() {
        let model = artifact();
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        let loaded = ModelArtifact::load(file.path()).unwrap();
        assert_eq!(loaded, model);

        let x = gaussian_points(12, 3, 3);
        assert_eq!(model.predict(x.view()).unwrap(), loaded.predict(x.view()).unwrap());
    }

    #[test]
    fn prediction_matches_explicit_kernel_sum() {
        let model = artifact();
        let x = gaussian_points(4, 3, 5);
        let predicted = model.predict(x.view()).unwrap();
        assert_eq!(predicted.dim(), (4, 2));
        for i in 0..4 {
            for t in 0..2 {
                let expected: f64 = (0..5)
                    .map(|c| {
                        model.kernel.value(x.row(i), model.centers.row(c)) * model.coefficients[[c, t]]
                    })
                    .sum();
                approx::assert_abs_diff_eq!(predicted[[i, t]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn rejects_wrong_feature_count() {
        let model = artifact();
        let x = gaussian_points(4, 2, 5);
        assert!(matches!(
            model.predict(x.view()),
            Err(ModelError::DimensionMismatch { found: 2, expected: 3 })
        ));
    }

    #[test]
    fn load_rejects_inconsistent_shapes() {
        let mut model = artifact();
        model.coefficients = gaussian_points(4, 2, 2);
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        assert!(matches!(
            ModelArtifact::load(file.path()),
            Err(ModelError::Inconsistent(_))
        ));
    }
}
