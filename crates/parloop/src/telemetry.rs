use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;

/// Phase timings for one guarded call, in microseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PhaseTimings {
    pub translation_us: u64,
    pub dependence_us: u64,
    pub bounds_us: u64,
    pub codegen_us: u64,
    pub compile_us: u64,
    pub transfer_us: u64,
    pub kernel_us: u64,
    pub total_us: u64,
}

/// One structured record per guarded call, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Program name of the call-site.
    pub site: String,
    /// Structural fingerprint, zero when analysis never got that far.
    pub kernel_hash: u64,
    pub iterations: i64,
    /// Device identity for offloaded runs, "baseline" otherwise.
    pub device: String,
    /// Schedule mode at launch ("gpu", "cpu", "try-gpu", ...).
    pub mode: String,
    /// True when a cached kernel program was reused.
    pub recycled: bool,
    /// True when proven accesses ran without bound instrumentation.
    pub checks_elided: bool,
    /// "offloaded", "baseline", or an error class tag.
    pub outcome: String,
    pub transfer_bytes: u64,
    pub timings: PhaseTimings,
}

impl ExecutionRecord {
    pub fn baseline(site: impl Into<String>, iterations: i64, outcome: &str) -> ExecutionRecord {
        ExecutionRecord {
            site: site.into(),
            kernel_hash: 0,
            iterations,
            device: "baseline".to_string(),
            mode: "baseline".to_string(),
            recycled: false,
            checks_elided: false,
            outcome: outcome.to_string(),
            transfer_bytes: 0,
            timings: PhaseTimings::default(),
        }
    }
}

/// Monotonic counters over the whole process.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub parallel_loops: u64,
    pub generated_kernels: u64,
    pub kernel_executions: u64,
    pub baseline_executions: u64,
}

#[derive(Default)]
pub struct TelemetryHub {
    records: Mutex<Vec<ExecutionRecord>>,
    parallel_loops: AtomicU64,
    generated_kernels: AtomicU64,
    kernel_executions: AtomicU64,
    baseline_executions: AtomicU64,
}

impl TelemetryHub {
    pub fn record(&self, record: ExecutionRecord) {
        self.records
            .lock()
            .expect("telemetry record lock poisoned")
            .push(record);
    }

    /// Drain collected records, oldest first.
    pub fn take_records(&self) -> Vec<ExecutionRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .expect("telemetry record lock poisoned"),
        )
    }

    pub fn note_parallel_loop(&self) {
        self.parallel_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_generated_kernel(&self) {
        self.generated_kernels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_kernel_execution(&self) {
        self.kernel_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_baseline_execution(&self) {
        self.baseline_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Counters {
        Counters {
            parallel_loops: self.parallel_loops.load(Ordering::Relaxed),
            generated_kernels: self.generated_kernels.load(Ordering::Relaxed),
            kernel_executions: self.kernel_executions.load(Ordering::Relaxed),
            baseline_executions: self.baseline_executions.load(Ordering::Relaxed),
        }
    }
}

pub fn hub() -> &'static TelemetryHub {
    static HUB: Lazy<TelemetryHub> = Lazy::new(TelemetryHub::default);
    &HUB
}

/// Wall-clock stopwatch for one phase.
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Stopwatch {
        Stopwatch {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_us(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Stderr trace gated on the configured debug level. The closure only runs
/// when the message will be printed.
pub fn debug_log(debug_level: u8, min_level: u8, message: impl FnOnce() -> String) {
    if debug_level >= min_level {
        eprintln!("[parloop] {}", message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_drain_in_order() {
        let hub = TelemetryHub::default();
        hub.record(ExecutionRecord::baseline("first", 10, "baseline"));
        hub.record(ExecutionRecord::baseline("second", 20, "baseline"));
        let records = hub.take_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].site, "first");
        assert_eq!(records[1].iterations, 20);
        assert!(hub.take_records().is_empty());
    }

    #[test]
    fn counters_accumulate() {
        let hub = TelemetryHub::default();
        hub.note_kernel_execution();
        hub.note_kernel_execution();
        hub.note_baseline_execution();
        let counters = hub.counters();
        assert_eq!(counters.kernel_executions, 2);
        assert_eq!(counters.baseline_executions, 1);
    }

    #[test]
    fn records_serialize_to_json() {
        let record = ExecutionRecord::baseline("saxpy", 1000, "baseline");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"site\":\"saxpy\""));
        assert!(json.contains("\"total_us\":0"));
    }
}
