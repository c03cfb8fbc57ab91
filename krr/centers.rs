//! Landmark (center) selection for the Nystrom approximation.

use crate::estimate::KrrError;
use ndarray::{Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

/// How the `M` landmarks are chosen from the training points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CenterStrategy {
    /// Uniform sampling without replacement, reproducible from the seed.
    #[default]
    Uniform,
    /// Caller-supplied landmark coordinates.
    Fixed { points: Array2<f64> },
}

impl CenterStrategy {
    pub(crate) fn validate(&self, num_centers: usize) -> Result<(), KrrError> {
        match self {
            CenterStrategy::Uniform => Ok(()),
            CenterStrategy::Fixed { points } => {
                if points.nrows() != num_centers {
                    return Err(KrrError::InvalidConfiguration(format!(
                        "fixed centers have {} rows but num_centers is {}",
                        points.nrows(),
                        num_centers
                    )));
                }
                if points.iter().any(|v| !v.is_finite()) {
                    return Err(KrrError::InvalidConfiguration(
                        "fixed centers contain non-finite coordinates".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// The selected landmarks, plus their row indices when drawn from the data.
#[derive(Debug, Clone, PartialEq)]
pub struct CenterSet {
    pub points: Array2<f64>,
    pub indices: Option<Vec<usize>>,
}

impl CenterSet {
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.points.view()
    }
}

/// Chooses `m` landmarks from `x`.
///
/// Uniform selection requires `m <= N`. When `m == N` every training point is a
/// landmark and they are taken in their original order, which makes the
/// approximation exact.
pub fn select_centers(
    x: ArrayView2<f64>,
    m: usize,
    strategy: &CenterStrategy,
    seed: u64,
) -> Result<CenterSet, KrrError> {
    let n = x.nrows();
    match strategy {
        CenterStrategy::Fixed { points } => {
            if points.nrows() != m {
                return Err(KrrError::InvalidConfiguration(format!(
                    "fixed centers have {} rows but num_centers is {m}",
                    points.nrows()
                )));
            }
            if points.ncols() != x.ncols() {
                return Err(KrrError::InvalidConfiguration(format!(
                    "fixed centers have {} columns but the data has {}",
                    points.ncols(),
                    x.ncols()
                )));
            }
            Ok(CenterSet {
                points: points.clone(),
                indices: None,
            })
        }
        CenterStrategy::Uniform => {
            if m > n {
                return Err(KrrError::InvalidConfiguration(format!(
                    "cannot draw {m} centers from {n} training points"
                )));
            }
            let indices = if m == n {
                (0..n).collect::<Vec<_>>()
            } else {
                let mut rng = StdRng::seed_from_u64(seed);
                index::sample(&mut rng, n, m).into_vec()
            };
            log::debug!("Selected {m} of {n} training points as centers (seed {seed})");
            Ok(CenterSet {
                points: x.select(Axis(0), &indices),
                indices: Some(indices),
            })
        }
    }
}
