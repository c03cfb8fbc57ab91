//! # Model Estimation
//!
//! Entry points for fitting. A fit runs three stages: landmark selection,
//! preconditioner construction, and the conjugate gradient solve. State that
//! outlives a single fit (the resource budget, memoized warm-up plans, a
//! reusable preconditioner, caller hooks) lives in an explicit [`FitSession`]
//! rather than in globals, so concurrent sessions never interfere.

use crate::centers::{CenterSet, select_centers};
use crate::config::KrrConfig;
use crate::dispatch::{OperationProfile, Residency, ResourceBudget, select_strategy};
use crate::hooks::{CancellationToken, EvaluationHook};
use crate::model::ModelArtifact;
use crate::plan::KernelPlanCache;
use crate::preconditioner::{Preconditioner, PreconditionerKey};
use crate::progress::{FitProgressObserver, FitProgressStage, NoopFitProgress};
use crate::solver::{Problem, SolverContext, SolverReport, solve};
use ndarray::ArrayView2;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A comprehensive error type for the fitting pipeline.
#[derive(Error, Debug)]
pub enum KrrError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    #[error(
        "Not enough memory for the {operation}: at least {required_bytes} bytes are needed but the ceiling is {ceiling_bytes} bytes."
    )]
    ResourceExhaustion {
        operation: String,
        required_bytes: u64,
        ceiling_bytes: u64,
    },

    #[error("Spill file I/O failed: {0}")]
    Spill(#[from] std::io::Error),
}

/// Caller-owned state shared by consecutive fits.
pub struct FitSession {
    pub budget: ResourceBudget,
    pub plan_cache: Arc<KernelPlanCache>,
    pub cancellation: CancellationToken,
    pub evaluation: Option<EvaluationHook>,
    pub progress: Option<Box<dyn FitProgressObserver>>,
    retain_preconditioner: bool,
    retained: Option<Arc<Preconditioner>>,
}

impl Default for FitSession {
    fn default() -> Self {
        Self::new(ResourceBudget::detect())
    }
}

impl FitSession {
    pub fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            plan_cache: Arc::new(KernelPlanCache::new()),
            cancellation: CancellationToken::new(),
            evaluation: None,
            progress: None,
            retain_preconditioner: false,
            retained: None,
        }
    }

    /// A session sized against the memory currently available on this host.
    pub fn detect() -> Self {
        Self::default()
    }

    pub fn with_plan_cache(mut self, cache: Arc<KernelPlanCache>) -> Self {
        self.plan_cache = cache;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_evaluation(mut self, hook: EvaluationHook) -> Self {
        self.evaluation = Some(hook);
        self
    }

    pub fn with_progress(mut self, observer: Box<dyn FitProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Keep the most recent preconditioner and reuse it when a later fit has
    /// the same landmarks, kernel, penalty and precision.
    pub fn retain_preconditioners(mut self, retain: bool) -> Self {
        self.retain_preconditioner = retain;
        if !retain {
            self.retained = None;
        }
        self
    }

    pub fn retained_preconditioner(&self) -> Option<&Arc<Preconditioner>> {
        self.retained.as_ref()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FitTimings {
    pub centers: Duration,
    pub preconditioner: Duration,
    pub solver: Duration,
}

/// A fitted model plus diagnostics of how it was obtained.
pub struct FitOutcome {
    pub model: ModelArtifact,
    pub report: SolverReport,
    pub preconditioner_residency: Residency,
    pub preconditioner_reused: bool,
    pub timings: FitTimings,
}

/// Fits a model with a fresh session sized from the host's available memory.
pub fn fit(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    config: &KrrConfig,
) -> Result<ModelArtifact, KrrError> {
    let mut session = FitSession::detect();
    Ok(fit_with_session(x, y, config, &mut session)?.model)
}

fn validate_inputs(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    config: &KrrConfig,
    evaluation: Option<&EvaluationHook>,
) -> Result<(), KrrError> {
    let (n, d) = x.dim();
    if n == 0 || d == 0 {
        return Err(KrrError::InvalidConfiguration(format!(
            "training data must be non-empty, got {n}x{d}"
        )));
    }
    if y.nrows() != n {
        return Err(KrrError::InvalidConfiguration(format!(
            "{n} training points but {} target rows",
            y.nrows()
        )));
    }
    if y.ncols() == 0 {
        return Err(KrrError::InvalidConfiguration(
            "targets must have at least one column".to_string(),
        ));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(KrrError::InvalidConfiguration(
            "training data contains non-finite values".to_string(),
        ));
    }
    if config.num_centers > n {
        return Err(KrrError::InvalidConfiguration(format!(
            "num_centers ({}) exceeds the number of training points ({n})",
            config.num_centers
        )));
    }
    if let Some(hook) = evaluation {
        let (rn, rd) = hook.reference_points().dim();
        let (tn, tt) = hook.reference_targets().dim();
        if rd != d || tt != y.ncols() || rn != tn {
            return Err(KrrError::InvalidConfiguration(format!(
                "evaluation data is {rn}x{rd} with {tn}x{tt} targets; expected {d} features and {} targets",
                y.ncols()
            )));
        }
    }
    Ok(())
}

/// Fits a model, reusing whatever `session` carries between fits.
pub fn fit_with_session(
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    config: &KrrConfig,
    session: &mut FitSession,
) -> Result<FitOutcome, KrrError> {
    config.validate()?;
    validate_inputs(x, y, config, session.evaluation.as_ref())?;
    let (n, d) = x.dim();
    let m = config.num_centers;
    log::info!(
        "Fitting {:?} kernel ridge regression: {n} points, {d} features, {} targets, {m} centers, penalty {:e}",
        config.kernel.kind(),
        y.ncols(),
        config.penalty
    );

    let FitSession {
        budget,
        plan_cache,
        cancellation,
        evaluation,
        progress,
        retain_preconditioner,
        retained,
    } = session;
    let mut noop = NoopFitProgress;
    let progress: &mut dyn FitProgressObserver = match progress.as_mut() {
        Some(observer) => &mut **observer,
        None => &mut noop,
    };
    let mut timings = FitTimings::default();

    let stage_start = Instant::now();
    progress.on_stage_start(FitProgressStage::CenterSelection, m);
    let centers: CenterSet = select_centers(x, m, &config.centers, config.seed)?;
    progress.on_stage_finish(FitProgressStage::CenterSelection);
    timings.centers = stage_start.elapsed();

    let plan = plan_cache.warm_up(&config.kernel, config.precision, d, m)?;

    let stage_start = Instant::now();
    progress.on_stage_start(FitProgressStage::Preconditioner, m);
    let key = PreconditionerKey::new(&centers, &config.kernel, config.penalty, config.precision);
    let reusable = retained
        .as_ref()
        .filter(|pc| *retain_preconditioner && pc.key() == &key)
        .cloned();
    let preconditioner_reused = reusable.is_some();
    let preconditioner = match reusable {
        Some(pc) => {
            log::info!("Reusing the retained {m}x{m} preconditioner");
            pc
        }
        None => {
            let profile = OperationProfile::preconditioner(m, d);
            let strategy = select_strategy(&profile, config, budget)?;
            let pc = Arc::new(Preconditioner::build(
                &centers,
                &config.kernel,
                config.penalty,
                &strategy,
                &config.options,
            )?);
            if *retain_preconditioner {
                *retained = Some(Arc::clone(&pc));
            }
            pc
        }
    };
    progress.on_stage_finish(FitProgressStage::Preconditioner);
    timings.preconditioner = stage_start.elapsed();

    let stage_start = Instant::now();
    let problem = Problem {
        points: x.view(),
        targets: y.view(),
        centers: &centers,
        kernel: &config.kernel,
        penalty: config.penalty,
    };
    let output = solve(
        &problem,
        &preconditioner,
        SolverContext {
            config,
            budget,
            plan,
            cancellation,
            evaluation: evaluation.as_ref(),
            progress,
        },
    )?;
    timings.solver = stage_start.elapsed();

    let model = ModelArtifact {
        penalty: config.penalty,
        precision: config.precision,
        status: output.report.status,
        iterations: output.report.iterations,
        num_training_points: n,
        center_indices: centers.indices,
        feature_names: Vec::new(),
        target_names: Vec::new(),
        kernel: config.kernel,
        centers: centers.points,
        coefficients: output.coefficients,
    };
    Ok(FitOutcome {
        model,
        report: output.report,
        preconditioner_residency: preconditioner.residency(),
        preconditioner_reused,
        timings,
    })
}
