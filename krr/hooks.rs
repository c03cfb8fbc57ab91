//! Caller hooks into a running fit: periodic evaluation on reference data and
//! cooperative cancellation.

use ndarray::{Array2, ArrayView2};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Metric over `(y_true, y_pred)` returning a name and a value.
pub type MetricFn =
    dyn Fn(ArrayView2<f64>, ArrayView2<f64>) -> Result<(String, f64), String> + Send + Sync;

/// One successful evaluation of the caller's metric.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRecord {
    pub iteration: usize,
    pub metric: String,
    pub value: f64,
}

/// Reference data plus a metric, evaluated every `error_every` solver iterations.
///
/// A metric that returns an error or panics is logged and skipped; it never
/// aborts the fit.
pub struct EvaluationHook {
    reference_points: Array2<f64>,
    reference_targets: Array2<f64>,
    metric: Box<MetricFn>,
}

impl fmt::Debug for EvaluationHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationHook")
            .field("reference_points", &self.reference_points.dim())
            .field("reference_targets", &self.reference_targets.dim())
            .finish()
    }
}

impl EvaluationHook {
    pub fn new<F>(reference_points: Array2<f64>, reference_targets: Array2<f64>, metric: F) -> Self
    where
        F: Fn(ArrayView2<f64>, ArrayView2<f64>) -> Result<(String, f64), String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            reference_points,
            reference_targets,
            metric: Box::new(metric),
        }
    }

    /// Root-mean-squared error on the reference data.
    pub fn rmse(reference_points: Array2<f64>, reference_targets: Array2<f64>) -> Self {
        Self::new(reference_points, reference_targets, |truth, predicted| {
            Ok(("rmse".to_string(), rmse(truth, predicted)))
        })
    }

    pub fn reference_points(&self) -> ArrayView2<'_, f64> {
        self.reference_points.view()
    }

    pub fn reference_targets(&self) -> ArrayView2<'_, f64> {
        self.reference_targets.view()
    }

    /// Runs the metric on `predicted`, isolating any failure.
    pub(crate) fn evaluate(
        &self,
        iteration: usize,
        predicted: ArrayView2<f64>,
    ) -> Option<EvaluationRecord> {
        let truth = self.reference_targets.view();
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.metric)(truth, predicted)));
        match outcome {
            Ok(Ok((metric, value))) => {
                log::info!("Iteration {iteration}: {metric} = {value:.6}");
                Some(EvaluationRecord {
                    iteration,
                    metric,
                    value,
                })
            }
            Ok(Err(message)) => {
                log::warn!("Evaluation hook failed at iteration {iteration}: {message}");
                None
            }
            Err(_) => {
                log::warn!("Evaluation hook panicked at iteration {iteration}; continuing");
                None
            }
        }
    }
}

/// Root-mean-squared error over all entries.
pub fn rmse(truth: ArrayView2<f64>, predicted: ArrayView2<f64>) -> f64 {
    let count = truth.len().max(1) as f64;
    let sum_sq: f64 = truth
        .iter()
        .zip(predicted.iter())
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    (sum_sq / count).sqrt()
}

/// Shared flag polled by the solver between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
