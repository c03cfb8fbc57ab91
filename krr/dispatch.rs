//! Backend and strategy selection.
//!
//! Every heavy operation describes itself with an [`OperationProfile`] and asks
//! [`select_strategy`] how to run: on which device, whether the kernel matrix
//! is stored or evaluated tile by tile, whether a factorization fits in memory
//! or is spilled, and with which tile sizes. The rules are applied in a fixed
//! order so the decision is reproducible from the configuration and budget.

use crate::config::{KrrConfig, Precision};
use crate::estimate::KrrError;
use std::fmt;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Accelerator,
}

/// Whether the `N x M` kernel matrix is stored or recomputed per product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Materialization {
    Dense,
    Fused,
}

/// Whether a factorization works on an in-memory matrix or a spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    InCore,
    OutOfCore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Factorizing the `M x M` landmark kernel and its triangular product.
    PreconditionerBuild,
    /// One product with the `N x M` kernel matrix.
    KernelApply,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::PreconditionerBuild => f.write_str("preconditioner build"),
            OperationKind::KernelApply => f.write_str("kernel product"),
        }
    }
}

/// The size of one operation as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationProfile {
    pub kind: OperationKind,
    pub rows: usize,
    pub centers: usize,
    pub dims: usize,
    pub targets: usize,
    /// Upper bound on fused tile rows, usually the warm-up plan's choice.
    pub preferred_tile_rows: usize,
}

const BYTES_PER_ENTRY: u64 = std::mem::size_of::<f64>() as u64;

/// Square tiles an out-of-core factorization keeps resident at once.
pub const RESIDENT_TILES: u64 = 4;

/// Smallest tile side an out-of-core factorization may use.
pub const MIN_TILE_SIDE: usize = 8;

impl OperationProfile {
    pub fn preconditioner(centers: usize, dims: usize) -> Self {
        Self {
            kind: OperationKind::PreconditionerBuild,
            rows: centers,
            centers,
            dims,
            targets: 0,
            preferred_tile_rows: centers.max(1),
        }
    }

    pub fn kernel_apply(rows: usize, centers: usize, dims: usize, targets: usize) -> Self {
        Self {
            kind: OperationKind::KernelApply,
            rows,
            centers,
            dims,
            targets,
            preferred_tile_rows: rows.max(1),
        }
    }

    pub fn with_preferred_tile_rows(mut self, rows: usize) -> Self {
        self.preferred_tile_rows = rows.max(1);
        self
    }

    /// Size compared against the accelerator thresholds: `M` for a
    /// factorization, `N * M * d` for a kernel product.
    pub fn size(&self) -> u64 {
        match self.kind {
            OperationKind::PreconditionerBuild => self.centers as u64,
            OperationKind::KernelApply => (self.rows as u64)
                .saturating_mul(self.centers as u64)
                .saturating_mul(self.dims as u64),
        }
    }

    /// Bytes needed to run the operation entirely in memory.
    ///
    /// Factorization holds the two `M x M` factors. A stored kernel product holds
    /// the `N x M` matrix plus one intermediate and one result per target column.
    pub fn in_core_bytes(&self) -> u64 {
        let m = self.centers as u64;
        match self.kind {
            OperationKind::PreconditionerBuild => {
                2u64.saturating_mul(m).saturating_mul(m).saturating_mul(BYTES_PER_ENTRY)
            }
            OperationKind::KernelApply => {
                let n = self.rows as u64;
                let t = self.targets.max(1) as u64;
                n.saturating_mul(m)
                    .saturating_add(n.saturating_add(m).saturating_mul(t))
                    .saturating_mul(BYTES_PER_ENTRY)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorBudget {
    pub memory_bytes: u64,
}

/// Memory available to the solver, per device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub cpu_memory_bytes: u64,
    pub accelerator: Option<AcceleratorBudget>,
}

impl ResourceBudget {
    /// Reads available system memory. No accelerator runtime is linked, so the
    /// detected budget never offers one.
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        let cpu_memory_bytes = if available == 0 { u64::MAX } else { available };
        log::debug!("Detected {cpu_memory_bytes} bytes of available host memory");
        Self {
            cpu_memory_bytes,
            accelerator: None,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            cpu_memory_bytes: u64::MAX,
            accelerator: None,
        }
    }

    pub fn with_cpu_memory(mut self, bytes: u64) -> Self {
        self.cpu_memory_bytes = bytes;
        self
    }

    pub fn with_accelerator(mut self, memory_bytes: u64) -> Self {
        self.accelerator = Some(AcceleratorBudget { memory_bytes });
        self
    }
}

/// How one operation will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub device: Device,
    pub materialize: Materialization,
    pub residency: Residency,
    pub precision: Precision,
    /// Minimum tiles per row for blocked factorizations; 1 for kernel products.
    pub block_multiplier: usize,
    /// Tile side for factorizations, rows per tile for kernel products.
    pub tile: usize,
    /// Maximum tiles in flight.
    pub streams: usize,
    /// Memory ceiling the plan was sized against.
    pub ceiling_bytes: u64,
}

impl Strategy {
    /// Fused CPU strategy, used where no dispatch decision is needed.
    pub fn cpu_fused(precision: Precision, tile: usize, streams: usize) -> Self {
        Self {
            device: Device::Cpu,
            materialize: Materialization::Fused,
            residency: Residency::InCore,
            precision,
            block_multiplier: 1,
            tile: tile.max(1),
            streams: streams.max(1),
            ceiling_bytes: u64::MAX,
        }
    }

    /// The device the work actually runs on. An accelerator decision degrades
    /// to the CPU because this build links no accelerator runtime.
    pub fn executing_device(&self, operation: OperationKind) -> Device {
        match self.device {
            Device::Cpu => Device::Cpu,
            Device::Accelerator => {
                log::debug!(
                    "Accelerator selected for {operation} but no accelerator runtime is linked; running on CPU"
                );
                Device::Cpu
            }
        }
    }
}

/// Side length of square tiles for a blocked factorization of an `m x m` matrix.
///
/// The side is the largest that keeps [`RESIDENT_TILES`] tiles under `ceiling`,
/// capped so each tile row splits into at least `multiplier` tiles.
pub fn out_of_core_tile_side(
    m: usize,
    multiplier: usize,
    ceiling: u64,
) -> Result<usize, KrrError> {
    let per_tile = ceiling / (RESIDENT_TILES * BYTES_PER_ENTRY);
    let max_side = (per_tile as f64).sqrt().floor() as usize;
    let min_side = m.min(MIN_TILE_SIDE).max(1);
    if max_side < min_side {
        let required = RESIDENT_TILES
            .saturating_mul(min_side as u64 * min_side as u64)
            .saturating_mul(BYTES_PER_ENTRY);
        return Err(KrrError::ResourceExhaustion {
            operation: OperationKind::PreconditionerBuild.to_string(),
            required_bytes: required,
            ceiling_bytes: ceiling,
        });
    }
    let preferred = m.div_ceil(multiplier.max(1));
    Ok(preferred.min(max_side).max(min_side))
}

fn choose_device(profile: &OperationProfile, config: &KrrConfig, budget: &ResourceBudget) -> Device {
    let options = &config.options;
    if options.use_cpu {
        log::debug!("{}: use_cpu is set, staying on CPU", profile.kind);
        return Device::Cpu;
    }
    if budget.accelerator.is_none() {
        log::debug!("{}: no accelerator available, staying on CPU", profile.kind);
        return Device::Cpu;
    }
    let threshold = match profile.kind {
        OperationKind::PreconditionerBuild => options.min_pc_size(config.precision) as u64,
        OperationKind::KernelApply => options.min_iter_size(config.precision),
    };
    if profile.size() < threshold {
        log::debug!(
            "{}: size {} below accelerator threshold {threshold}, staying on CPU",
            profile.kind,
            profile.size()
        );
        return Device::Cpu;
    }
    Device::Accelerator
}

fn memory_ceiling(device: Device, config: &KrrConfig, budget: &ResourceBudget) -> u64 {
    let (configured, available) = match device {
        Device::Cpu => (config.options.max_cpu_mem, budget.cpu_memory_bytes),
        Device::Accelerator => (
            config.options.max_gpu_mem,
            budget
                .accelerator
                .map(|acc| acc.memory_bytes)
                .unwrap_or(0),
        ),
    };
    configured.map_or(available, |limit| limit.min(available))
}

/// Rows per fused tile such that `streams` tiles in flight fit under `ceiling`.
fn fused_tile_rows(
    profile: &OperationProfile,
    precision: Precision,
    streams: usize,
    ceiling: u64,
) -> Result<usize, KrrError> {
    let m = profile.centers as u64;
    let t = profile.targets.max(1) as u64;
    let streams = streams.max(1) as u64;
    let block_entry = match precision {
        Precision::Double => BYTES_PER_ENTRY,
        Precision::Single => BYTES_PER_ENTRY + precision.element_size() as u64,
    };
    let per_row = m
        .saturating_mul(block_entry)
        .saturating_add(2 * t * BYTES_PER_ENTRY)
        .saturating_mul(streams);
    let fixed = m
        .saturating_mul(t)
        .saturating_mul(BYTES_PER_ENTRY)
        .saturating_mul(streams);
    let required = fixed.saturating_add(per_row);
    if ceiling < required {
        return Err(KrrError::ResourceExhaustion {
            operation: profile.kind.to_string(),
            required_bytes: required,
            ceiling_bytes: ceiling,
        });
    }
    let rows = ((ceiling - fixed) / per_row).min(usize::MAX as u64) as usize;
    Ok(rows
        .min(profile.preferred_tile_rows)
        .min(profile.rows.max(1))
        .max(1))
}

/// Picks the execution strategy for one operation.
///
/// Rules, in order: explicit overrides; `use_cpu` or no accelerator means CPU;
/// operations below the accelerator thresholds stay on CPU; whatever must run
/// in memory has to fit the device's ceiling, otherwise the operation falls
/// back to its blocked form; if even the blocked form exceeds the ceiling the
/// request fails with [`KrrError::ResourceExhaustion`].
pub fn select_strategy(
    profile: &OperationProfile,
    config: &KrrConfig,
    budget: &ResourceBudget,
) -> Result<Strategy, KrrError> {
    let options = &config.options;
    let device = choose_device(profile, config, budget);
    let ceiling = memory_ceiling(device, config, budget);
    let streams = options.num_fmm_streams.max(1);
    let in_core_bytes = profile.in_core_bytes();

    let strategy = match profile.kind {
        OperationKind::PreconditionerBuild => {
            let residency = if options.chol_force_ooc {
                Residency::OutOfCore
            } else if options.chol_force_in_core || in_core_bytes <= ceiling {
                Residency::InCore
            } else {
                log::info!(
                    "Preconditioner needs {in_core_bytes} bytes but the ceiling is {ceiling}; factorizing out of core"
                );
                Residency::OutOfCore
            };
            let tile = match residency {
                Residency::InCore => profile.centers.max(1),
                Residency::OutOfCore => out_of_core_tile_side(
                    profile.centers,
                    options.chol_par_blk_multiplier,
                    ceiling,
                )?,
            };
            Strategy {
                device,
                materialize: Materialization::Dense,
                residency,
                precision: config.precision,
                block_multiplier: options.chol_par_blk_multiplier,
                tile,
                streams,
                ceiling_bytes: ceiling,
            }
        }
        OperationKind::KernelApply => {
            let fits = in_core_bytes <= ceiling;
            let materialize = if !options.never_store_kernel && fits {
                Materialization::Dense
            } else {
                Materialization::Fused
            };
            let tile = match materialize {
                Materialization::Dense => profile.rows.max(1),
                Materialization::Fused => {
                    fused_tile_rows(profile, config.precision, streams, ceiling)?
                }
            };
            Strategy {
                device,
                materialize,
                residency: if fits {
                    Residency::InCore
                } else {
                    Residency::OutOfCore
                },
                precision: config.precision,
                block_multiplier: 1,
                tile,
                streams,
                ceiling_bytes: ceiling,
            }
        }
    };
    log::debug!("Strategy for {}: {strategy:?}", profile.kind);
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverOptions;
    use crate::kernel::KernelSpec;

    fn config_with(options: SolverOptions) -> KrrConfig {
        KrrConfig::new(KernelSpec::Gaussian { sigma: 1.0 }, 1e-3, 100)
            .unwrap()
            .with_options(options)
    }

    #[test]
    fn stays_on_cpu_without_accelerator() {
        let config = config_with(SolverOptions::default());
        let profile = OperationProfile::kernel_apply(1_000_000, 100_000, 100, 1);
        let strategy = select_strategy(&profile, &config, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.device, Device::Cpu);
    }

    #[test]
    fn accelerator_requires_size_above_threshold() {
        let config = config_with(SolverOptions::default());
        let budget = ResourceBudget::unbounded().with_accelerator(u64::MAX);

        let small = OperationProfile::preconditioner(1_000, 10);
        let large = OperationProfile::preconditioner(40_000, 10);
        assert_eq!(
            select_strategy(&small, &config, &budget).unwrap().device,
            Device::Cpu
        );
        let chosen = select_strategy(&large, &config, &budget).unwrap();
        assert_eq!(chosen.device, Device::Accelerator);
        assert_eq!(
            chosen.executing_device(OperationKind::PreconditionerBuild),
            Device::Cpu
        );

        let iter_small = OperationProfile::kernel_apply(1_000, 1_000, 10, 1);
        let iter_large = OperationProfile::kernel_apply(100_000, 10_000, 10, 1);
        assert_eq!(
            select_strategy(&iter_small, &config, &budget).unwrap().device,
            Device::Cpu
        );
        assert_eq!(
            select_strategy(&iter_large, &config, &budget).unwrap().device,
            Device::Accelerator
        );
    }

    #[test]
    fn single_precision_lowers_the_threshold() {
        let budget = ResourceBudget::unbounded().with_accelerator(u64::MAX);
        let profile = OperationProfile::preconditioner(20_000, 10);
        let double = config_with(SolverOptions::default());
        let single = double.clone().with_precision(Precision::Single);
        assert_eq!(
            select_strategy(&profile, &double, &budget).unwrap().device,
            Device::Cpu
        );
        assert_eq!(
            select_strategy(&profile, &single, &budget).unwrap().device,
            Device::Accelerator
        );
    }

    #[test]
    fn use_cpu_overrides_accelerator() {
        let config = config_with(SolverOptions {
            use_cpu: true,
            ..SolverOptions::default()
        });
        let budget = ResourceBudget::unbounded().with_accelerator(u64::MAX);
        let profile = OperationProfile::preconditioner(100_000, 10);
        assert_eq!(
            select_strategy(&profile, &config, &budget).unwrap().device,
            Device::Cpu
        );
    }

    #[test]
    fn memory_ceiling_drives_out_of_core_factorization() {
        let config = config_with(SolverOptions {
            max_cpu_mem: Some(2 * 100 * 100 * 8 - 1),
            ..SolverOptions::default()
        });
        let profile = OperationProfile::preconditioner(100, 5);
        let strategy = select_strategy(&profile, &config, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.residency, Residency::OutOfCore);
        assert!(strategy.tile >= MIN_TILE_SIDE && strategy.tile <= 50);
        assert!(RESIDENT_TILES * (strategy.tile * strategy.tile * 8) as u64 <= strategy.ceiling_bytes);

        let roomy = config_with(SolverOptions::default());
        let strategy = select_strategy(&profile, &roomy, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.residency, Residency::InCore);
        assert_eq!(strategy.tile, 100);
    }

    #[test]
    fn forced_overrides_are_honored() {
        let forced_ooc = config_with(SolverOptions {
            chol_force_ooc: true,
            chol_par_blk_multiplier: 4,
            ..SolverOptions::default()
        });
        let profile = OperationProfile::preconditioner(100, 5);
        let strategy =
            select_strategy(&profile, &forced_ooc, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.residency, Residency::OutOfCore);
        assert_eq!(strategy.tile, 25);

        let forced_in_core = config_with(SolverOptions {
            chol_force_in_core: true,
            ..SolverOptions::default()
        });
        let budget = ResourceBudget::unbounded().with_cpu_memory(1_000);
        let strategy = select_strategy(&profile, &forced_in_core, &budget).unwrap();
        assert_eq!(strategy.residency, Residency::InCore);
    }

    #[test]
    fn tiny_ceiling_is_resource_exhaustion() {
        let config = config_with(SolverOptions::default());
        let budget = ResourceBudget::unbounded().with_cpu_memory(64);
        let profile = OperationProfile::preconditioner(100, 5);
        match select_strategy(&profile, &config, &budget) {
            Err(KrrError::ResourceExhaustion {
                required_bytes,
                ceiling_bytes,
                ..
            }) => {
                assert_eq!(ceiling_bytes, 64);
                assert!(required_bytes > ceiling_bytes);
            }
            other => panic!("expected resource exhaustion, got {other:?}"),
        }

        let apply = OperationProfile::kernel_apply(1_000, 100, 5, 1);
        assert!(matches!(
            select_strategy(&apply, &config, &budget),
            Err(KrrError::ResourceExhaustion { .. })
        ));
    }

    #[test]
    fn kernel_products_fuse_when_the_matrix_does_not_fit() {
        let config = config_with(SolverOptions::default());
        let profile = OperationProfile::kernel_apply(10_000, 100, 5, 1).with_preferred_tile_rows(512);
        let dense = select_strategy(&profile, &config, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(dense.materialize, Materialization::Dense);

        let budget = ResourceBudget::unbounded().with_cpu_memory(1_000_000);
        let fused = select_strategy(&profile, &config, &budget).unwrap();
        assert_eq!(fused.materialize, Materialization::Fused);
        assert!(fused.tile <= 512);
        assert!(fused.tile >= 1);

        let never = config_with(SolverOptions {
            never_store_kernel: true,
            ..SolverOptions::default()
        });
        let strategy = select_strategy(&profile, &never, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.materialize, Materialization::Fused);
        assert_eq!(strategy.tile, 512);
    }

    #[test]
    fn configured_ceiling_caps_the_detected_budget() {
        let config = config_with(SolverOptions {
            max_cpu_mem: Some(10_000),
            ..SolverOptions::default()
        });
        let profile = OperationProfile::preconditioner(10, 5);
        let strategy = select_strategy(&profile, &config, &ResourceBudget::unbounded()).unwrap();
        assert_eq!(strategy.ceiling_bytes, 10_000);
        let budget = ResourceBudget::unbounded().with_cpu_memory(5_000);
        let strategy = select_strategy(&profile, &config, &budget).unwrap();
        assert_eq!(strategy.ceiling_bytes, 5_000);
    }
}
