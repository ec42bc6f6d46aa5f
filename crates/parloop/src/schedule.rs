//! Adaptive device selection. Each (kernel, workload) pair runs timed
//! trials on both sides, then commits to whichever is faster by a clear
//! margin. Ties keep alternating so a drifting workload can still swing
//! the decision. A launch in flight pins its side, and calls that start
//! under it ride along untimed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{TimingMethod, TuningConfig};
use crate::exec::device::ScheduleSide;

/// What the schedule tells the executor to do for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run on this side and report the observed time back.
    Try(ScheduleSide),
    /// The choice is settled; run untimed.
    Committed(ScheduleSide),
}

impl Decision {
    pub fn side(self) -> ScheduleSide {
        match self {
            Decision::Try(side) | Decision::Committed(side) => side,
        }
    }

    pub fn is_trial(self) -> bool {
        matches!(self, Decision::Try(_))
    }

    pub fn label(self) -> String {
        match self {
            Decision::Try(side) => format!("try-{}", side.label()),
            Decision::Committed(side) => side.label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    committed: Option<ScheduleSide>,
    next: ScheduleSide,
    time_gpu: Option<u64>,
    time_cpu: Option<u64>,
    tries_gpu: u32,
    tries_cpu: u32,
    samples_gpu: u32,
    samples_cpu: u32,
}

impl Entry {
    fn fresh(budget: u32) -> Entry {
        Entry {
            committed: None,
            // The CPU side is cheap to reach, so it opens the audition.
            next: ScheduleSide::Cpu,
            time_gpu: None,
            time_cpu: None,
            tries_gpu: budget,
            tries_cpu: budget,
            samples_gpu: 0,
            samples_cpu: 0,
        }
    }
}

/// Per-process decision table keyed by kernel fingerprint and fused
/// iteration count. The same kernel over two workload sizes is two
/// separate auditions.
pub struct ScheduleTable {
    entries: Mutex<HashMap<(u64, i64), Entry>>,
    /// Sides of launches currently in flight, innermost last.
    pinned: Mutex<Vec<ScheduleSide>>,
    trial_budget: u32,
    margin: f64,
    timing: TimingMethod,
}

impl ScheduleTable {
    pub fn new(config: &TuningConfig) -> ScheduleTable {
        ScheduleTable {
            entries: Mutex::new(HashMap::new()),
            pinned: Mutex::new(Vec::new()),
            trial_budget: config.trial_budget.max(1),
            margin: config.margin,
            timing: config.timing,
        }
    }

    /// Decide where this call runs. `sides` lists what the backend can
    /// actually offer; a single side commits immediately. A pinned side
    /// overrides the audition without touching it, so the workload still
    /// gets its own trials once the outer launch lands.
    pub fn decide(&self, kernel: u64, iterations: i64, sides: &[ScheduleSide]) -> Decision {
        if let Some(side) = self.pinned_side() {
            if sides.contains(&side) {
                return Decision::Committed(side);
            }
        }
        let mut entries = self.lock();
        let entry = entries
            .entry((kernel, iterations))
            .or_insert_with(|| Entry::fresh(self.trial_budget));
        if let Some(side) = entry.committed {
            return Decision::Committed(side);
        }
        let has_gpu = sides.contains(&ScheduleSide::Gpu);
        let has_cpu = sides.contains(&ScheduleSide::Cpu);
        match (has_gpu, has_cpu) {
            (true, true) => {}
            (true, false) => {
                entry.committed = Some(ScheduleSide::Gpu);
                return Decision::Committed(ScheduleSide::Gpu);
            }
            (false, true) => {
                entry.committed = Some(ScheduleSide::Cpu);
                return Decision::Committed(ScheduleSide::Cpu);
            }
            (false, false) => {
                // Caller guarantees at least one side; fall back sanely.
                return Decision::Committed(ScheduleSide::Cpu);
            }
        }
        let side = match entry.next {
            ScheduleSide::Cpu if entry.tries_cpu > 0 || entry.tries_gpu == 0 => ScheduleSide::Cpu,
            ScheduleSide::Cpu => ScheduleSide::Gpu,
            ScheduleSide::Gpu if entry.tries_gpu > 0 || entry.tries_cpu == 0 => ScheduleSide::Gpu,
            ScheduleSide::Gpu => ScheduleSide::Cpu,
        };
        Decision::Try(side)
    }

    /// Fold one observed time into the audition and commit if both sides
    /// are exhausted and one wins by more than the margin.
    pub fn record(&self, kernel: u64, iterations: i64, side: ScheduleSide, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let mut entries = self.lock();
        let entry = entries
            .entry((kernel, iterations))
            .or_insert_with(|| Entry::fresh(self.trial_budget));
        if entry.committed.is_some() {
            return;
        }
        let (time, tries, samples) = match side {
            ScheduleSide::Gpu => (
                &mut entry.time_gpu,
                &mut entry.tries_gpu,
                &mut entry.samples_gpu,
            ),
            ScheduleSide::Cpu => (
                &mut entry.time_cpu,
                &mut entry.tries_cpu,
                &mut entry.samples_cpu,
            ),
        };
        *time = Some(match (*time, self.timing) {
            (None, _) => nanos,
            (Some(prev), TimingMethod::Min) => prev.min(nanos),
            (Some(prev), TimingMethod::Average) => {
                let n = u64::from(*samples).max(1);
                (prev.saturating_mul(n).saturating_add(nanos)) / (n + 1)
            }
        });
        *samples += 1;
        *tries = tries.saturating_sub(1);
        entry.next = side.other();

        if entry.tries_gpu == 0 && entry.tries_cpu == 0 {
            if let (Some(gpu), Some(cpu)) = (entry.time_gpu, entry.time_cpu) {
                let (gpu_t, cpu_t) = (gpu as f64, cpu as f64);
                if gpu_t < cpu_t * (1.0 - self.margin) {
                    entry.committed = Some(ScheduleSide::Gpu);
                } else if cpu_t < gpu_t * (1.0 - self.margin) {
                    entry.committed = Some(ScheduleSide::Cpu);
                }
                // Inside the margin: stay uncommitted and keep alternating.
            }
        }
    }

    /// The settled side for a workload, if the audition has concluded.
    pub fn committed(&self, kernel: u64, iterations: i64) -> Option<ScheduleSide> {
        self.lock()
            .get(&(kernel, iterations))
            .and_then(|e| e.committed)
    }

    /// Pin the side of a launch for as long as the returned guard lives.
    /// Decisions made under the pin follow the same side rather than
    /// running their own timed trials inside the outer launch.
    pub fn pin(&self, side: ScheduleSide) -> ModePin<'_> {
        self.pinned
            .lock()
            .expect("schedule pin lock poisoned")
            .push(side);
        ModePin { table: self }
    }

    fn pinned_side(&self) -> Option<ScheduleSide> {
        self.pinned
            .lock()
            .expect("schedule pin lock poisoned")
            .last()
            .copied()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(u64, i64), Entry>> {
        self.entries.lock().expect("schedule table lock poisoned")
    }
}

/// Unpins its side on drop.
pub struct ModePin<'a> {
    table: &'a ScheduleTable,
}

impl Drop for ModePin<'_> {
    fn drop(&mut self) {
        if let Ok(mut pinned) = self.table.pinned.lock() {
            pinned.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> Vec<ScheduleSide> {
        vec![ScheduleSide::Gpu, ScheduleSide::Cpu]
    }

    fn table(budget: u32) -> ScheduleTable {
        ScheduleTable::new(&TuningConfig {
            trial_budget: budget,
            ..TuningConfig::default()
        })
    }

    #[test]
    fn audition_alternates_then_commits_the_faster_side() {
        let table = table(1);
        let d1 = table.decide(7, 100, &both());
        assert_eq!(d1, Decision::Try(ScheduleSide::Cpu));
        table.record(7, 100, ScheduleSide::Cpu, Duration::from_micros(20));

        let d2 = table.decide(7, 100, &both());
        assert_eq!(d2, Decision::Try(ScheduleSide::Gpu));
        table.record(7, 100, ScheduleSide::Gpu, Duration::from_micros(200));

        assert_eq!(table.committed(7, 100), Some(ScheduleSide::Cpu));
        assert_eq!(
            table.decide(7, 100, &both()),
            Decision::Committed(ScheduleSide::Cpu)
        );
    }

    #[test]
    fn near_ties_keep_alternating() {
        let table = table(1);
        table.record(3, 50, ScheduleSide::Cpu, Duration::from_micros(100));
        table.record(3, 50, ScheduleSide::Gpu, Duration::from_micros(102));
        // Two percent apart, inside the five percent margin.
        assert_eq!(table.committed(3, 50), None);
        assert!(table.decide(3, 50, &both()).is_trial());
    }

    #[test]
    fn workload_sizes_audition_independently() {
        let table = table(1);
        table.record(9, 10, ScheduleSide::Cpu, Duration::from_micros(10));
        table.record(9, 10, ScheduleSide::Gpu, Duration::from_micros(500));
        table.record(9, 100_000, ScheduleSide::Cpu, Duration::from_millis(30));
        table.record(9, 100_000, ScheduleSide::Gpu, Duration::from_millis(2));
        assert_eq!(table.committed(9, 10), Some(ScheduleSide::Cpu));
        assert_eq!(table.committed(9, 100_000), Some(ScheduleSide::Gpu));
    }

    #[test]
    fn single_side_commits_without_trials() {
        let table = table(3);
        let d = table.decide(1, 42, &[ScheduleSide::Cpu]);
        assert_eq!(d, Decision::Committed(ScheduleSide::Cpu));
        assert_eq!(table.committed(1, 42), Some(ScheduleSide::Cpu));
    }

    #[test]
    fn pinned_launches_ride_the_in_flight_side() {
        let table = table(1);
        {
            let _pin = table.pin(ScheduleSide::Gpu);
            assert_eq!(
                table.decide(11, 500, &both()),
                Decision::Committed(ScheduleSide::Gpu)
            );
            // Riding along neither opens nor settles an audition.
            assert_eq!(table.committed(11, 500), None);
        }
        assert_eq!(
            table.decide(11, 500, &both()),
            Decision::Try(ScheduleSide::Cpu)
        );
    }

    #[test]
    fn pin_defers_to_the_sides_on_offer() {
        let table = table(1);
        let _pin = table.pin(ScheduleSide::Gpu);
        assert_eq!(
            table.decide(12, 500, &[ScheduleSide::Cpu]),
            Decision::Committed(ScheduleSide::Cpu)
        );
    }

    #[test]
    fn nested_pins_follow_the_innermost_launch() {
        let table = table(1);
        let _outer = table.pin(ScheduleSide::Cpu);
        {
            let _inner = table.pin(ScheduleSide::Gpu);
            assert_eq!(
                table.decide(13, 64, &both()),
                Decision::Committed(ScheduleSide::Gpu)
            );
        }
        assert_eq!(
            table.decide(13, 64, &both()),
            Decision::Committed(ScheduleSide::Cpu)
        );
    }

    #[test]
    fn minimum_folding_keeps_the_best_observation() {
        let table = table(2);
        table.record(5, 7, ScheduleSide::Cpu, Duration::from_micros(90));
        table.record(5, 7, ScheduleSide::Cpu, Duration::from_micros(40));
        table.record(5, 7, ScheduleSide::Gpu, Duration::from_micros(60));
        table.record(5, 7, ScheduleSide::Gpu, Duration::from_micros(80));
        // Min folding: cpu 40 vs gpu 60; cpu wins by more than 5%.
        assert_eq!(table.committed(5, 7), Some(ScheduleSide::Cpu));
    }
}
