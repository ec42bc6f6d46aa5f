use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::bounds::{BoundReport, ResolvedRange};
use crate::analysis::OffloadPlan;
use crate::config::{BoundCheckMode, TuningConfig};
use crate::error::Result;
use crate::exec::device::DeviceHandle;
use crate::hashing::{fnv1a_bytes, fnv1a_init};
use crate::ir::program::Program;
use crate::ir::types::Literal;
use crate::symbols::Bindings;

/// Result of one guarded call. Loop nests mutate bound arrays in place and
/// yield `Unit`; reductions yield the folded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Unit,
    Value(Literal),
}

/// Which accesses the generated kernel instruments with bound checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckConfig {
    /// Every access proven for the current call; no instrumentation.
    None,
    /// Instrument exactly these walk ids.
    Selective(BTreeSet<u32>),
    /// Instrument every access.
    All,
}

impl CheckConfig {
    pub fn from_report(report: &BoundReport, mode: BoundCheckMode) -> CheckConfig {
        match mode {
            BoundCheckMode::Off => CheckConfig::None,
            BoundCheckMode::All => CheckConfig::All,
            BoundCheckMode::Auto => {
                if report.all_proven() {
                    CheckConfig::None
                } else {
                    CheckConfig::Selective(report.checked.clone())
                }
            }
        }
    }

    pub fn instruments(&self, id: u32) -> bool {
        match self {
            CheckConfig::None => false,
            CheckConfig::Selective(ids) => ids.contains(&id),
            CheckConfig::All => true,
        }
    }

    pub fn elides_any(&self) -> bool {
        !matches!(self, CheckConfig::All)
    }

    /// Stable digest for the kernel cache key.
    pub fn signature(&self) -> u64 {
        let mut h = fnv1a_init();
        match self {
            CheckConfig::None => h = fnv1a_bytes(h, b"none"),
            CheckConfig::All => h = fnv1a_bytes(h, b"all"),
            CheckConfig::Selective(ids) => {
                h = fnv1a_bytes(h, b"sel");
                for id in ids {
                    h = fnv1a_bytes(h, &id.to_le_bytes());
                }
            }
        }
        h
    }
}

/// What one launch reports back to the guard.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub device: String,
    /// Device-reported kernel execution time, summed over relaunches.
    pub kernel_time: Duration,
    /// Time spent building the device program, zero when recycled.
    pub compile_time: Duration,
    /// Wall time spent staging data and reading results back.
    pub transfer_time: Duration,
    /// Bytes moved between host and device for this call.
    pub transfer_bytes: u64,
    /// Folded value for reductions.
    pub value: Option<Literal>,
}

impl LaunchReport {
    pub fn on(device: impl Into<String>) -> LaunchReport {
        LaunchReport {
            device: device.into(),
            kernel_time: Duration::ZERO,
            compile_time: Duration::ZERO,
            transfer_time: Duration::ZERO,
            transfer_bytes: 0,
            value: None,
        }
    }
}

/// The sequential reference path. Runs the program with full guest
/// semantics: checked integer arithmetic, floored division, bound errors.
pub trait BaselineExecutor: Send + Sync {
    fn execute(&self, program: &Program, bindings: &Bindings) -> Result<Outcome>;
}

/// One compiled kernel, reusable across calls and devices. Implementations
/// keep per-device compiled state internally.
pub trait PreparedKernel: Send + Sync {
    /// Entry point name, derived from the structural fingerprint.
    fn entry(&self) -> &str;

    /// Generated source text, for inspection and tests.
    fn source(&self) -> &str;

    /// Bind the current call's values, stage data, launch, and read back.
    /// On any violation the bound arrays are left exactly as before the
    /// call.
    fn execute(
        &self,
        bindings: &Bindings,
        ranges: &[ResolvedRange],
        device: &DeviceHandle,
    ) -> Result<LaunchReport>;
}

/// A device backend: enumerates devices and turns plans into kernels.
pub trait OffloadBackend: Send + Sync {
    fn name(&self) -> &str;

    fn devices(&self) -> Vec<DeviceHandle>;

    fn prepare(
        &self,
        program: &Program,
        plan: &OffloadPlan,
        checks: &CheckConfig,
        config: &TuningConfig,
    ) -> Result<Arc<dyn PreparedKernel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_config_follows_the_report() {
        let mut report = BoundReport::default();
        assert_eq!(
            CheckConfig::from_report(&report, BoundCheckMode::Auto),
            CheckConfig::None
        );
        report.checked.insert(2);
        let selective = CheckConfig::from_report(&report, BoundCheckMode::Auto);
        assert!(selective.instruments(2));
        assert!(!selective.instruments(1));
        assert_eq!(
            CheckConfig::from_report(&report, BoundCheckMode::Off),
            CheckConfig::None
        );
        let all = CheckConfig::from_report(&report, BoundCheckMode::All);
        assert!(all.instruments(7));
        assert!(!all.elides_any());
    }

    #[test]
    fn signatures_distinguish_configurations() {
        let none = CheckConfig::None.signature();
        let all = CheckConfig::All.signature();
        let sel = CheckConfig::Selective([1u32, 2].into_iter().collect()).signature();
        assert_ne!(none, all);
        assert_ne!(none, sel);
        assert_ne!(all, sel);
    }
}
