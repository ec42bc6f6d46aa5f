use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Where a call-site is allowed to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetMode {
    /// Adaptive selection between device classes.
    #[default]
    Auto,
    Gpu,
    Cpu,
    /// Never offload; run the sequential executor only.
    BaselineOnly,
}

impl TargetMode {
    pub fn parse(value: &str) -> Option<TargetMode> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(TargetMode::Auto),
            "gpu" => Some(TargetMode::Gpu),
            "cpu" => Some(TargetMode::Cpu),
            "baseline" | "baseline-only" => Some(TargetMode::BaselineOnly),
            _ => None,
        }
    }
}

/// Per-call-site knobs. Defaults leave every safety net on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopOptions {
    /// Skip the dependence verdict for the outermost loop only.
    pub disable_dependence_check: bool,
    /// Skip dependence analysis for every fused level. The caller asserts
    /// independence; bound and overflow instrumentation stays on.
    pub disable_all_dependence_checks: bool,
    /// Accept any two-parameter combining function as a reduction even when
    /// it is not on the built-in whitelist.
    pub reduction_override: bool,
    pub target_mode: TargetMode,
    /// Math builtins the call-site refuses to offload. Names match
    /// [`crate::ir::MathFn::name`].
    pub math_fn_blacklist: HashSet<String>,
    /// 0 silent, 1 decisions, 2 per-phase detail.
    pub debug_level: u8,
}

impl LoopOptions {
    pub fn baseline_only(mut self) -> Self {
        self.target_mode = TargetMode::BaselineOnly;
        self
    }

    pub fn with_reduction_override(mut self) -> Self {
        self.reduction_override = true;
        self
    }

    pub fn blacklist_math(mut self, name: impl Into<String>) -> Self {
        self.math_fn_blacklist.insert(name.into());
        self
    }

    pub fn dependence_checks_disabled(&self, level: usize) -> bool {
        self.disable_all_dependence_checks || (level == 0 && self.disable_dependence_check)
    }
}
