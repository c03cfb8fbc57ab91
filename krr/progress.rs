use crate::solver::IterationRecord;
use std::fmt;

/// Stages reported while fitting a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitProgressStage {
    CenterSelection,
    Preconditioner,
    ConjugateGradient,
}

impl FitProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::CenterSelection => "center selection",
            Self::Preconditioner => "preconditioner factorization",
            Self::ConjugateGradient => "conjugate gradient",
        }
    }
}

impl fmt::Display for FitProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while fitting a model.
///
/// `total` is the number of steps the stage can take at most: centers to pick,
/// landmarks to factorize, or the iteration cap of the solver.
pub trait FitProgressObserver {
    fn on_stage_start(&mut self, stage: FitProgressStage, total: usize) {
        let _ = (stage, total);
    }
    fn on_iteration(&mut self, record: &IterationRecord) {
        let _ = record;
    }
    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}
