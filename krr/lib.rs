#![warn(dead_code)]
#![warn(unused_imports)]

//! Nystrom-approximate kernel ridge regression.
//!
//! The fitting pipeline selects landmark points, builds a two-factor triangular
//! preconditioner from the landmark kernel matrix, and runs a preconditioned
//! conjugate gradient over the Nystrom-reduced normal equations. Every heavy
//! operation asks the dispatcher for an execution strategy first, so the same
//! code path runs fully in memory, tile by tile, or spilled to disk.

pub mod centers;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod estimate;
pub mod faer_ndarray;
pub mod hooks;
pub mod kernel;
pub mod model;
pub mod plan;
pub mod preconditioner;
pub mod progress;
pub mod solver;
pub mod spill;

#[cfg(test)]
mod test_fixtures;

pub use centers::{CenterSet, CenterStrategy};
pub use config::{KrrConfig, Precision, SolverOptions};
pub use dispatch::{Device, ResourceBudget, Strategy};
pub use estimate::{FitOutcome, FitSession, KrrError, fit, fit_with_session};
pub use hooks::{CancellationToken, EvaluationHook};
pub use kernel::KernelSpec;
pub use model::{ModelArtifact, ModelError};
pub use solver::{SolverReport, SolverStatus};
