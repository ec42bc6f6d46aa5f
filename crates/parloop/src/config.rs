use std::env;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::options::TargetMode;

/// How observed kernel times are folded into the schedule table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingMethod {
    /// Keep the fastest observation per side.
    #[default]
    Min,
    /// Running average of observations per side.
    Average,
}

/// Bound instrumentation policy for generated kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundCheckMode {
    /// Instrument only accesses the bound analyzer could not prove.
    #[default]
    Auto,
    /// Instrument every access, the demotion path after a violation.
    All,
    /// No instrumentation at all. The caller vouches for every index.
    Off,
}

/// Which platform the offload backend binds to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlatformKind {
    /// Native driver when present, simulator otherwise.
    #[default]
    Auto,
    Native,
    Sim,
}

impl PlatformKind {
    pub fn parse(value: &str) -> Option<PlatformKind> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(PlatformKind::Auto),
            "native" | "opencl" => Some(PlatformKind::Native),
            "sim" | "simulator" => Some(PlatformKind::Sim),
            _ => None,
        }
    }
}

/// Process-wide tuning knobs with conservative defaults. Every field can be
/// overridden from the environment; per-call-site [`crate::LoopOptions`]
/// narrow them further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Timed attempts granted to each device class before committing.
    pub trial_budget: u32,
    /// Relative speed margin one side must win by to be committed.
    pub margin: f64,
    pub timing: TimingMethod,
    /// Fused iteration counts below this never offload.
    pub offload_threshold: i64,
    /// Fraction of a device's global memory the broker may occupy.
    pub memory_portion: f64,
    /// Runtime failures tolerated before a call-site stops offloading.
    pub relief_valve: u32,
    pub bound_checks: BoundCheckMode,
    pub target: TargetMode,
    pub platform: PlatformKind,
    pub debug_level: u8,
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            trial_budget: 1,
            margin: 0.05,
            timing: TimingMethod::Min,
            offload_threshold: 1000,
            memory_portion: 0.7,
            relief_valve: 5,
            bound_checks: BoundCheckMode::Auto,
            target: TargetMode::Auto,
            platform: PlatformKind::Auto,
            debug_level: 0,
        }
    }
}

impl TuningConfig {
    /// Defaults with `PARLOOP_*` environment overrides applied. Unparsable
    /// values fall back to the default silently; offload tuning must never
    /// break a run.
    pub fn from_env() -> TuningConfig {
        let mut config = TuningConfig::default();
        if let Some(v) = env_var("PARLOOP_TRIES") {
            if let Ok(n) = v.parse::<u32>() {
                config.trial_budget = n;
            }
        }
        if let Some(v) = env_var("PARLOOP_MARGIN") {
            if let Ok(m) = v.parse::<f64>() {
                if m.is_finite() && m >= 0.0 {
                    config.margin = m;
                }
            }
        }
        if let Some(v) = env_var("PARLOOP_THRESHOLD") {
            if let Ok(n) = v.parse::<i64>() {
                config.offload_threshold = n.max(0);
            }
        }
        if let Some(v) = env_var("PARLOOP_MEMORY_PORTION") {
            if let Ok(p) = v.parse::<f64>() {
                if p.is_finite() && p > 0.0 && p <= 1.0 {
                    config.memory_portion = p;
                }
            }
        }
        if let Some(v) = env_var("PARLOOP_TIMING") {
            match v.trim().to_ascii_lowercase().as_str() {
                "min" => config.timing = TimingMethod::Min,
                "avg" | "average" => config.timing = TimingMethod::Average,
                _ => {}
            }
        }
        if let Some(v) = env_var("PARLOOP_BOUND_CHECKS") {
            match v.trim().to_ascii_lowercase().as_str() {
                "auto" => config.bound_checks = BoundCheckMode::Auto,
                "all" => config.bound_checks = BoundCheckMode::All,
                "off" | "none" => config.bound_checks = BoundCheckMode::Off,
                _ => {}
            }
        }
        if let Some(v) = env_var("PARLOOP_TARGET") {
            if let Some(mode) = TargetMode::parse(&v) {
                config.target = mode;
            }
        }
        if let Some(v) = env_var("PARLOOP_PLATFORM") {
            if let Some(platform) = PlatformKind::parse(&v) {
                config.platform = platform;
            }
        }
        if let Some(v) = env_var("PARLOOP_DEBUG") {
            if parse_bool(&v) {
                config.debug_level = config.debug_level.max(1);
            }
            if let Ok(level) = v.trim().parse::<u8>() {
                config.debug_level = level;
            }
        }
        config
    }

    /// Shared instance read once per process.
    pub fn global() -> &'static TuningConfig {
        static CONFIG: Lazy<TuningConfig> = Lazy::new(TuningConfig::from_env);
        &CONFIG
    }
}

fn env_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}
