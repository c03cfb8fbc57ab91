//! # Solver Configuration
//!
//! One explicit, fully specified configuration structure. Every numeric knob has
//! a documented default and a validated range; invalid combinations are rejected
//! by [`KrrConfig::validate`] before any numerical work starts.

use crate::centers::CenterStrategy;
use crate::estimate::KrrError;
use crate::kernel::KernelSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Working precision of kernel arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// Kernel tiles evaluated in `f32`; reductions still accumulate in `f64`.
    Single,
    #[default]
    Double,
}

impl Precision {
    /// Size in bytes of one kernel tile element at this precision.
    pub fn element_size(self) -> usize {
        match self {
            Precision::Single => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }

    /// Unit roundoff of the kernel arithmetic.
    pub fn machine_epsilon(self) -> f64 {
        match self {
            Precision::Single => f64::from(f32::EPSILON),
            Precision::Double => f64::EPSILON,
        }
    }
}

/// Numeric thresholds and flags of the solver and the dispatcher.
///
/// Memory ceilings are in bytes; `None` means no ceiling beyond what the resource budget allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Relative change in the coefficients below which the solver stops.
    pub cg_tolerance: f64,
    /// Precision floor of the stopping threshold, and the guard added to the
    /// step-length denominator, in single precision.
    pub cg_epsilon_32: f64,
    /// Same as `cg_epsilon_32` for double precision.
    pub cg_epsilon_64: f64,
    /// Per-landmark diagonal jitter added before factorization (single precision).
    pub pc_epsilon_32: f64,
    /// Per-landmark diagonal jitter added before factorization (double precision).
    pub pc_epsilon_64: f64,
    /// Recompute the residual from its definition every this many iterations.
    pub cg_full_gradient_every: usize,
    pub chol_force_in_core: bool,
    pub chol_force_ooc: bool,
    /// Minimum number of tiles per row in the out-of-core Cholesky.
    pub chol_par_blk_multiplier: usize,
    /// Minimum number of tiles per row in the out-of-core triangular product.
    pub lauum_par_blk_multiplier: usize,
    /// Never dispatch to an accelerator.
    pub use_cpu: bool,
    pub max_cpu_mem: Option<u64>,
    pub max_gpu_mem: Option<u64>,
    pub min_cuda_pc_size_32: usize,
    pub min_cuda_pc_size_64: usize,
    pub min_cuda_iter_size_32: u64,
    pub min_cuda_iter_size_64: u64,
    /// Forbid materializing the N x M kernel matrix; every product is fused.
    pub never_store_kernel: bool,
    /// Maximum number of kernel tiles in flight at once.
    pub num_fmm_streams: usize,
    /// Cadence of the evaluation hook, when one is supplied.
    pub error_every: usize,
    /// Promote per-iteration diagnostics from `debug` to `info` level.
    pub debug: bool,
    /// Directory for out-of-core spill files. Defaults to the system temp dir.
    pub spill_dir: Option<PathBuf>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            cg_tolerance: 1e-7,
            cg_epsilon_32: 1e-7,
            cg_epsilon_64: 1e-15,
            pc_epsilon_32: 1e-5,
            pc_epsilon_64: 1e-13,
            cg_full_gradient_every: 10,
            chol_force_in_core: false,
            chol_force_ooc: false,
            chol_par_blk_multiplier: 2,
            lauum_par_blk_multiplier: 8,
            use_cpu: false,
            max_cpu_mem: None,
            max_gpu_mem: None,
            min_cuda_pc_size_32: 10_000,
            min_cuda_pc_size_64: 30_000,
            min_cuda_iter_size_32: 300_000_000,
            min_cuda_iter_size_64: 900_000_000,
            never_store_kernel: false,
            num_fmm_streams: 2,
            error_every: 1,
            debug: false,
            spill_dir: None,
        }
    }
}

impl SolverOptions {
    pub fn cg_epsilon(&self, precision: Precision) -> f64 {
        match precision {
            Precision::Single => self.cg_epsilon_32,
            Precision::Double => self.cg_epsilon_64,
        }
    }

    pub fn pc_epsilon(&self, precision: Precision) -> f64 {
        match precision {
            Precision::Single => self.pc_epsilon_32,
            Precision::Double => self.pc_epsilon_64,
        }
    }

    pub fn min_pc_size(&self, precision: Precision) -> usize {
        match precision {
            Precision::Single => self.min_cuda_pc_size_32,
            Precision::Double => self.min_cuda_pc_size_64,
        }
    }

    pub fn min_iter_size(&self, precision: Precision) -> u64 {
        match precision {
            Precision::Single => self.min_cuda_iter_size_32,
            Precision::Double => self.min_cuda_iter_size_64,
        }
    }

    /// The relative-change threshold the solver stops at.
    ///
    /// Coefficient changes below the square root of the unit roundoff are not
    /// resolvable from kernel tiles of that precision, so that value floors the
    /// threshold next to `cg_tolerance` and the precision's `cg_epsilon`. With
    /// the defaults this leaves double precision at `cg_tolerance` and widens
    /// single precision to about `3.5e-4`.
    pub fn convergence_threshold(&self, precision: Precision) -> f64 {
        self.cg_tolerance
            .max(self.cg_epsilon(precision))
            .max(precision.machine_epsilon().sqrt())
    }

    fn validate(&self) -> Result<(), KrrError> {
        let positive_finite = [
            ("cg_epsilon_32", self.cg_epsilon_32),
            ("cg_epsilon_64", self.cg_epsilon_64),
            ("pc_epsilon_32", self.pc_epsilon_32),
            ("pc_epsilon_64", self.pc_epsilon_64),
        ];
        for (name, value) in positive_finite {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{name} must be positive and finite, got {value}")));
            }
        }
        if !(self.cg_tolerance.is_finite() && self.cg_tolerance >= 0.0) {
            return Err(invalid(format!(
                "cg_tolerance must be non-negative and finite, got {}",
                self.cg_tolerance
            )));
        }
        let at_least_one = [
            ("cg_full_gradient_every", self.cg_full_gradient_every),
            ("chol_par_blk_multiplier", self.chol_par_blk_multiplier),
            ("lauum_par_blk_multiplier", self.lauum_par_blk_multiplier),
            ("num_fmm_streams", self.num_fmm_streams),
            ("error_every", self.error_every),
        ];
        for (name, value) in at_least_one {
            if value == 0 {
                return Err(invalid(format!("{name} must be at least 1")));
            }
        }
        if self.chol_force_in_core && self.chol_force_ooc {
            return Err(invalid(
                "chol_force_in_core and chol_force_ooc cannot both be set".to_string(),
            ));
        }
        for (name, ceiling) in [("max_cpu_mem", self.max_cpu_mem), ("max_gpu_mem", self.max_gpu_mem)]
        {
            if ceiling == Some(0) {
                return Err(invalid(format!("{name} must be positive when given")));
            }
        }
        Ok(())
    }
}

/// The complete configuration of one fit/predict cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KrrConfig {
    /// Regularization strength of the normal equations.
    pub penalty: f64,
    /// Number of Nystrom landmarks, M.
    pub num_centers: usize,
    #[serde(default = "default_maxiter")]
    pub maxiter: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    pub kernel: KernelSpec,
    #[serde(default)]
    pub centers: CenterStrategy,
    #[serde(default)]
    pub options: SolverOptions,
}

fn default_maxiter() -> usize {
    20
}

impl KrrConfig {
    /// Creates a configuration with default solver options and validates it.
    pub fn new(kernel: KernelSpec, penalty: f64, num_centers: usize) -> Result<Self, KrrError> {
        let config = Self {
            penalty,
            num_centers,
            maxiter: default_maxiter(),
            seed: 0,
            precision: Precision::default(),
            kernel,
            centers: CenterStrategy::default(),
            options: SolverOptions::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_centers(mut self, centers: CenterStrategy) -> Self {
        self.centers = centers;
        self
    }

    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Checks every range and cross-field constraint that does not depend on data.
    pub fn validate(&self) -> Result<(), KrrError> {
        if !(self.penalty.is_finite() && self.penalty > 0.0) {
            return Err(invalid(format!(
                "penalty must be positive and finite, got {}",
                self.penalty
            )));
        }
        if self.num_centers == 0 {
            return Err(invalid("num_centers must be at least 1".to_string()));
        }
        if self.maxiter == 0 {
            return Err(invalid("maxiter must be at least 1".to_string()));
        }
        self.kernel.validate()?;
        self.centers.validate(self.num_centers)?;
        self.options.validate()
    }

    /// Parses and validates a TOML configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, KrrError> {
        let config: KrrConfig = toml::from_str(text)
            .map_err(|e| invalid(format!("could not parse configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KrrError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

fn invalid(message: String) -> KrrError {
    KrrError::InvalidConfiguration(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian() -> KernelSpec {
        KernelSpec::Gaussian { sigma: 5.0 }
    }

    #[test]
    fn defaults_match_reference_options() {
        let options = SolverOptions::default();
        assert_eq!(options.cg_full_gradient_every, 10);
        assert_eq!(options.num_fmm_streams, 2);
        assert_eq!(options.pc_epsilon(Precision::Double), 1e-13);
        assert_eq!(options.pc_epsilon(Precision::Single), 1e-5);
        assert_eq!(options.convergence_threshold(Precision::Double), 1e-7);
        assert!(
            options.convergence_threshold(Precision::Single)
                > options.convergence_threshold(Precision::Double)
        );
    }

    #[test]
    fn single_precision_threshold_stays_wider_than_double() {
        let mut options = SolverOptions::default();
        options.cg_tolerance = 0.0;
        let single = options.convergence_threshold(Precision::Single);
        let double = options.convergence_threshold(Precision::Double);
        assert!(single > 1e-4 && single < 1e-3, "single threshold {single}");
        assert!(double < 1e-7, "double threshold {double}");

        options.cg_tolerance = 1e-2;
        assert_eq!(options.convergence_threshold(Precision::Single), 1e-2);
        assert_eq!(options.convergence_threshold(Precision::Double), 1e-2);
    }

    #[test]
    fn rejects_non_positive_penalty() {
        for penalty in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = KrrConfig::new(gaussian(), penalty, 10).unwrap_err();
            assert!(matches!(err, KrrError::InvalidConfiguration(_)), "{penalty}");
        }
    }

    #[test]
    fn rejects_zero_centers_and_zero_maxiter() {
        assert!(KrrConfig::new(gaussian(), 1e-3, 0).is_err());
        let config = KrrConfig::new(gaussian(), 1e-3, 4).unwrap().with_maxiter(0);
        assert!(matches!(
            config.validate(),
            Err(KrrError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_conflicting_factorization_overrides() {
        let options = SolverOptions {
            chol_force_in_core: true,
            chol_force_ooc: true,
            ..SolverOptions::default()
        };
        let config = KrrConfig::new(gaussian(), 1e-3, 4)
            .unwrap()
            .with_options(options);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("chol_force_in_core"));
    }

    #[test]
    fn rejects_zero_cadences_and_ceilings() {
        let zero_streams = SolverOptions {
            num_fmm_streams: 0,
            ..SolverOptions::default()
        };
        assert!(zero_streams.validate().is_err());
        let zero_ceiling = SolverOptions {
            max_cpu_mem: Some(0),
            ..SolverOptions::default()
        };
        assert!(zero_ceiling.validate().is_err());
    }

    #[test]
    fn parses_toml_with_partial_options() {
        let text = r#"
            penalty = 1e-5
            num_centers = 404
            maxiter = 20
            seed = 7

            [kernel]
            type = "gaussian"
            sigma = 5.0

            [options]
            cg_full_gradient_every = 5
            never_store_kernel = true
        "#;
        let config = KrrConfig::from_toml_str(text).unwrap();
        assert_eq!(config.num_centers, 404);
        assert_eq!(config.seed, 7);
        assert_eq!(config.kernel, KernelSpec::Gaussian { sigma: 5.0 });
        assert_eq!(config.options.cg_full_gradient_every, 5);
        assert!(config.options.never_store_kernel);
        assert_eq!(config.options.num_fmm_streams, 2);
        assert_eq!(config.precision, Precision::Double);
    }

    #[test]
    fn indefinite_kernels_are_rejected_at_construction() {
        let linear = KernelSpec::Linear { beta: 0.0, gamma: -1.0 };
        assert!(matches!(
            KrrConfig::new(linear, 1e-3, 4),
            Err(KrrError::InvalidConfiguration(_))
        ));

        let text = r#"
            penalty = 1e-3
            num_centers = 4

            [kernel]
            type = "polynomial"
            alpha = 1.0
            beta = -2.0
            degree = 2
        "#;
        let err = KrrConfig::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("beta"), "{err}");
    }

    #[test]
    fn toml_parse_errors_are_configuration_errors() {
        let err = KrrConfig::from_toml_str("penalty = \"large\"").unwrap_err();
        assert!(matches!(err, KrrError::InvalidConfiguration(_)));
    }
}
