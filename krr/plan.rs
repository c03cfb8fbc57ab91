//! Warm-up plans for kernel evaluation.
//!
//! Before the first heavy product for a given kernel family, precision and
//! problem shape, a short trial evaluation checks the kernel evaluates cleanly
//! and a tile size is fixed for that shape class. The result is memoized in a
//! concurrent map owned by the caller's session, so repeated fits of similar
//! shape skip the trial. Tile sizes are derived from the cache geometry, never from timings,
//! which keeps fused reductions bitwise reproducible across runs.

use crate::config::Precision;
use crate::estimate::KrrError;
use crate::kernel::{KernelEvaluator, KernelKind, KernelSpec};
use ahash::RandomState;
use dashmap::DashMap;
use ndarray::Array2;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const FALLBACK_CACHE_BYTES: usize = 256 * 1024;
pub const MIN_TILE_ROWS: usize = 32;
pub const MAX_TILE_ROWS: usize = 8192;
const TRIAL_ROWS: usize = 4;

/// Problem dimensions rounded up to powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeClass {
    pub dims_bucket: usize,
    pub centers_bucket: usize,
}

impl ShapeClass {
    pub fn of(dims: usize, centers: usize) -> Self {
        Self {
            dims_bucket: dims.max(1).next_power_of_two(),
            centers_bucket: centers.max(1).next_power_of_two(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub kind: KernelKind,
    pub precision: Precision,
    pub shape: ShapeClass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlan {
    /// Rows of the data matrix evaluated per fused tile.
    pub rows_per_tile: usize,
    /// How long the trial evaluation took when the plan was created.
    pub warm_up: Duration,
}

/// Session-scoped memo of warm-up plans.
pub struct KernelPlanCache {
    plans: DashMap<PlanKey, TilePlan, RandomState>,
    cache_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for KernelPlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelPlanCache {
    /// Sizes tiles against the detected L2 cache.
    pub fn new() -> Self {
        let detected = cache_size::l2_cache_size();
        if detected.is_none() {
            log::debug!("L2 cache size unavailable; assuming {FALLBACK_CACHE_BYTES} bytes");
        }
        Self::with_cache_bytes(detected.unwrap_or(FALLBACK_CACHE_BYTES))
    }

    pub fn with_cache_bytes(cache_bytes: usize) -> Self {
        Self {
            plans: DashMap::with_hasher(RandomState::new()),
            cache_bytes: cache_bytes.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn key(spec: &KernelSpec, precision: Precision, dims: usize, centers: usize) -> PlanKey {
        PlanKey {
            kind: spec.kind(),
            precision,
            shape: ShapeClass::of(dims, centers),
        }
    }

    /// Returns the plan for this kernel and shape, probing the kernel first if
    /// no plan exists yet.
    pub fn warm_up(
        &self,
        spec: &KernelSpec,
        precision: Precision,
        dims: usize,
        centers: usize,
    ) -> Result<TilePlan, KrrError> {
        let key = Self::key(spec, precision, dims, centers);
        if let Some(plan) = self.plans.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*plan);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        trial_evaluation(spec, precision, dims)?;
        let plan = TilePlan {
            rows_per_tile: self.rows_for(&key),
            warm_up: start.elapsed(),
        };
        log::debug!(
            "Warm-up plan for {:?}/{:?} (d<={}, M<={}): {} rows per tile",
            key.kind,
            key.precision,
            key.shape.dims_bucket,
            key.shape.centers_bucket,
            plan.rows_per_tile
        );
        Ok(*self.plans.entry(key).or_insert(plan))
    }

    pub fn lookup(&self, key: &PlanKey) -> Option<TilePlan> {
        self.plans.get(key).map(|plan| *plan)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// A tile of `rows` data rows touches the row block itself plus the kernel
    /// block against all centers; both should stay cache resident.
    fn rows_for(&self, key: &PlanKey) -> usize {
        let per_row = key.precision.element_size()
            * (key.shape.dims_bucket + key.shape.centers_bucket);
        (self.cache_bytes / per_row).clamp(MIN_TILE_ROWS, MAX_TILE_ROWS)
    }
}

/// Evaluates the kernel on a few deterministic points and checks the values.
fn trial_evaluation(spec: &KernelSpec, precision: Precision, dims: usize) -> Result<(), KrrError> {
    let dims = dims.max(1);
    let points = Array2::from_shape_fn((TRIAL_ROWS, dims), |(i, j)| {
        (i as f64 - 1.5) * 0.5 + j as f64 * 0.01
    });
    let block = KernelEvaluator::new(spec, precision).evaluate(points.view(), points.view());
    if block.iter().any(|v| !v.is_finite()) {
        return Err(KrrError::InvalidConfiguration(format!(
            "{:?} kernel produced non-finite values during warm-up",
            spec.kind()
        )));
    }
    if block.diag().iter().any(|&v| v < 0.0) {
        return Err(KrrError::InvalidConfiguration(format!(
            "{:?} kernel produced a negative self-similarity during warm-up",
            spec.kind()
        )));
    }
    Ok(())
}
