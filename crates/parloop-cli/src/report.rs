//! Serializable shapes and formatting helpers for the tool's output.

use std::time::Duration;

use serde::Serialize;

use parloop::exec::{CheckConfig, DeviceHandle};
use parloop::symbols::ArrayData;

/// The `parloop devices` result document.
#[derive(Debug, Serialize)]
pub struct DevicesReport {
    pub backend: String,
    pub devices: Vec<DeviceReport>,
}

/// One enumerated device, flattened for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub index: usize,
    pub name: String,
    pub class: &'static str,
    pub side: &'static str,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub global_mem_bytes: u64,
}

impl DeviceReport {
    pub fn new(device: &DeviceHandle) -> DeviceReport {
        DeviceReport {
            index: device.index,
            name: device.name.clone(),
            class: device.class.label(),
            side: device.class.schedule_side().label(),
            max_work_group_size: device.limits.max_work_group_size,
            max_work_item_sizes: device.limits.max_work_item_sizes,
            global_mem_bytes: device.limits.global_mem_bytes,
        }
    }
}

/// Wall-time digest over repeated runs of one path.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimingSummary {
    pub min_us: u64,
    pub mean_us: u64,
    pub max_us: u64,
}

pub fn summarize(samples: &[Duration]) -> TimingSummary {
    if samples.is_empty() {
        return TimingSummary {
            min_us: 0,
            mean_us: 0,
            max_us: 0,
        };
    }
    let us: Vec<u64> = samples.iter().map(duration_us).collect();
    let total: u64 = us.iter().sum();
    TimingSummary {
        min_us: us.iter().copied().min().unwrap_or(0),
        mean_us: total / us.len() as u64,
        max_us: us.iter().copied().max().unwrap_or(0),
    }
}

fn duration_us(d: &Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Ratio of the fastest baseline run to the fastest offloaded run.
pub fn speedup(baseline: TimingSummary, offload: TimingSummary) -> f64 {
    baseline.min_us as f64 / offload.min_us.max(1) as f64
}

/// The `parloop bench` result document.
#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub program: String,
    pub backend: String,
    pub repeat: u32,
    pub baseline: TimingSummary,
    pub offload: TimingSummary,
    pub speedup: f64,
    pub guard_state: String,
    pub baseline_reason: Option<String>,
}

/// Short spelling of a check configuration for log lines.
pub fn check_label(checks: &CheckConfig) -> String {
    match checks {
        CheckConfig::None => "none".to_string(),
        CheckConfig::All => "all".to_string(),
        CheckConfig::Selective(ids) => format!("selective({})", ids.len()),
    }
}

/// Extents joined as `AxB`, matching how launches are logged.
pub fn dims_label(data: &ArrayData) -> String {
    data.dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// First elements of an array, truncated with an ellipsis.
pub fn preview(data: &ArrayData, limit: usize) -> String {
    let shown = data.len().min(limit);
    let mut parts: Vec<String> = (0..shown).map(|flat| data.get(flat).to_string()).collect();
    if data.len() > shown {
        parts.push("...".to_string());
    }
    format!("[{}]", parts.join(", "))
}
