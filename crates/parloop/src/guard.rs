//! Per-call-site specialization guard. A guard owns one program and walks
//! it through analysis, bound proofs, device selection, and launch on every
//! call, falling back to the sequential baseline whenever any step cannot
//! be trusted. Embedders only ever observe a correct result or the error
//! the sequential semantics would have produced.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::analysis::bounds::{analyze_bounds, resolve_ranges, ResolvedRange};
use crate::analysis::{alias_groups, build_plan, typecheck, OffloadPlan};
use crate::config::BoundCheckMode;
use crate::context::{CompilerContext, KernelKey};
use crate::error::{OffloadError, Result};
use crate::exec::backend::{BaselineExecutor, CheckConfig, OffloadBackend, Outcome};
use crate::exec::device::{DeviceHandle, ScheduleSide};
use crate::exec::registry;
use crate::ir::program::{Program, ProgramKind};
use crate::options::{LoopOptions, TargetMode};
use crate::symbols::Bindings;
use crate::telemetry::{debug_log, hub, ExecutionRecord, PhaseTimings, Stopwatch};

enum GuardState {
    Uninitialized,
    /// Call-independent analysis running on a helper thread; calls take the
    /// baseline until it lands.
    Preparing(JoinHandle<Result<OffloadPlan>>),
    Ready(ReadyState),
    /// No offload attempts ever again for this site.
    Baseline { reason: String },
}

struct ReadyState {
    plan: Arc<OffloadPlan>,
    backend: Arc<dyn OffloadBackend>,
    bound_mode: BoundCheckMode,
    /// Set when a tripped bound flag forced full instrumentation.
    demoted: bool,
    /// Transient failures left before the site stops offloading.
    relief: u32,
}

/// What one offload attempt decided about the guard's future.
enum Resolution {
    Done(Result<Outcome>),
    StopOffloading {
        reason: String,
        result: Result<Outcome>,
    },
}

/// The guarded entry point for one call-site.
pub struct OffloadGuard {
    program: Program,
    options: LoopOptions,
    baseline: Arc<dyn BaselineExecutor>,
    backend_override: Option<Arc<dyn OffloadBackend>>,
    context: Arc<CompilerContext>,
    state: Mutex<GuardState>,
}

impl OffloadGuard {
    pub fn new(
        program: Program,
        options: LoopOptions,
        baseline: Arc<dyn BaselineExecutor>,
    ) -> OffloadGuard {
        OffloadGuard {
            program,
            options,
            baseline,
            backend_override: None,
            context: CompilerContext::shared(),
            state: Mutex::new(GuardState::Uninitialized),
        }
    }

    /// Pin the backend instead of discovering one through the registry.
    /// Builder style, use before the first call.
    pub fn with_backend(mut self, backend: Arc<dyn OffloadBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    /// Use a private context instead of the process-wide one. Builder
    /// style, use before the first call.
    pub fn with_context(mut self, context: Arc<CompilerContext>) -> Self {
        self.context = context;
        self
    }

    pub fn site(&self) -> &str {
        &self.program.name
    }

    pub fn state_label(&self) -> &'static str {
        match &*self.lock_state() {
            GuardState::Uninitialized => "uninitialized",
            GuardState::Preparing(_) => "preparing",
            GuardState::Ready(_) => "ready",
            GuardState::Baseline { .. } => "baseline",
        }
    }

    /// Why the site stopped offloading, if it has.
    pub fn baseline_reason(&self) -> Option<String> {
        match &*self.lock_state() {
            GuardState::Baseline { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Kick off call-independent analysis on a helper thread. Calls made
    /// before it completes run on the baseline; the first call after
    /// completion folds the result in.
    pub fn prepare_async(&self, bindings: &Bindings) {
        let mut state = self.lock_state();
        if !matches!(*state, GuardState::Uninitialized) {
            return;
        }
        if self.target() == TargetMode::BaselineOnly {
            *state = GuardState::Baseline {
                reason: "baseline-only target".to_string(),
            };
            return;
        }
        let program = self.program.clone();
        let options = self.options.clone();
        let bindings = bindings.clone();
        *state = GuardState::Preparing(std::thread::spawn(move || {
            build_plan(&program, &bindings, &options)
        }));
    }

    /// Run the program once. Offloads when the site is proven safe and the
    /// schedule picks a device; otherwise runs the baseline executor.
    pub fn call(&self, bindings: &Bindings) -> Result<Outcome> {
        let total = Stopwatch::start();
        let mut carry = PhaseTimings::default();
        let mut state = self.lock_state();
        loop {
            match &mut *state {
                GuardState::Baseline { .. } => {
                    return self.run_baseline(bindings, 0, 0, "baseline", carry, &total);
                }
                GuardState::Uninitialized => {
                    let (next, timings) = self.initialize(bindings);
                    carry = timings;
                    *state = next;
                }
                GuardState::Preparing(handle) if handle.is_finished() => {
                    let taken = std::mem::replace(&mut *state, GuardState::Uninitialized);
                    *state = match taken {
                        GuardState::Preparing(handle) => match handle.join() {
                            Ok(built) => self.finish_init(built),
                            Err(_) => GuardState::Baseline {
                                reason: "background preparation panicked".to_string(),
                            },
                        },
                        other => other,
                    };
                }
                GuardState::Preparing(_) => {
                    return self.run_baseline(bindings, 0, 0, "preparing", carry, &total);
                }
                GuardState::Ready(ready) => {
                    match self.offload_call(ready, bindings, carry, &total) {
                        Resolution::Done(result) => return result,
                        Resolution::StopOffloading { reason, result } => {
                            debug_log(self.debug(), 1, || {
                                format!("'{}' stops offloading: {reason}", self.program.name)
                            });
                            *state = GuardState::Baseline { reason };
                            return result;
                        }
                    }
                }
            }
        }
    }

    fn initialize(&self, bindings: &Bindings) -> (GuardState, PhaseTimings) {
        let mut timings = PhaseTimings::default();
        if self.target() == TargetMode::BaselineOnly {
            return (
                GuardState::Baseline {
                    reason: "baseline-only target".to_string(),
                },
                timings,
            );
        }
        let sw = Stopwatch::start();
        if let Err(e) = typecheck::validate_program(&self.program) {
            debug_log(self.debug(), 1, || {
                format!("'{}' will not offload: {e}", self.program.name)
            });
            return (
                GuardState::Baseline {
                    reason: e.to_string(),
                },
                timings,
            );
        }
        timings.translation_us = sw.elapsed_us();
        let sw = Stopwatch::start();
        let built = build_plan(&self.program, bindings, &self.options);
        timings.dependence_us = sw.elapsed_us();
        (self.finish_init(built), timings)
    }

    fn finish_init(&self, built: Result<OffloadPlan>) -> GuardState {
        let plan = match built {
            Ok(plan) => plan,
            Err(e) => {
                debug_log(self.debug(), 1, || {
                    format!("'{}' will not offload: {e}", self.program.name)
                });
                return GuardState::Baseline {
                    reason: e.to_string(),
                };
            }
        };
        let backend = match self
            .backend_override
            .clone()
            .or_else(registry::default_backend)
        {
            Some(backend) => backend,
            None => {
                return GuardState::Baseline {
                    reason: "no offload backend available".to_string(),
                }
            }
        };
        if plan.is_reduce() || plan.verdict.allows_parallel() {
            hub().note_parallel_loop();
        }
        let config = self.context.config();
        GuardState::Ready(ReadyState {
            plan: Arc::new(plan),
            backend,
            bound_mode: config.bound_checks,
            demoted: false,
            relief: config.relief_valve.max(1),
        })
    }

    fn offload_call(
        &self,
        ready: &mut ReadyState,
        bindings: &Bindings,
        carry: PhaseTimings,
        total: &Stopwatch,
    ) -> Resolution {
        let mut timings = carry;
        let config = self.context.config();
        let hash = ready.plan.structural_hash;

        // The dependence verdict is only valid for the aliasing it was
        // computed under, and aliasing is a property of the bound data.
        let sw = Stopwatch::start();
        match alias_groups(&ready.plan.accesses, bindings) {
            Ok(groups) => {
                if groups != ready.plan.alias_groups {
                    match build_plan(&self.program, bindings, &self.options) {
                        Ok(plan) => ready.plan = Arc::new(plan),
                        Err(e) => {
                            timings.dependence_us += sw.elapsed_us();
                            return self
                                .per_call_failure(ready, bindings, hash, 0, e, timings, total);
                        }
                    }
                }
            }
            Err(e) => {
                timings.dependence_us += sw.elapsed_us();
                return self.per_call_failure(ready, bindings, hash, 0, e, timings, total);
            }
        }
        timings.dependence_us += sw.elapsed_us();

        if !ready.plan.is_reduce() && !ready.plan.verdict.allows_parallel() {
            return Resolution::Done(self.run_baseline(
                bindings,
                hash,
                0,
                "dependent",
                timings,
                total,
            ));
        }

        let sw = Stopwatch::start();
        let ranges = match resolve_ranges(&ready.plan.levels, bindings) {
            Ok(ranges) => ranges,
            Err(e) => {
                timings.bounds_us += sw.elapsed_us();
                return self.per_call_failure(ready, bindings, hash, 0, e, timings, total);
            }
        };
        let iterations = match &self.program.kind {
            ProgramKind::Reduce(spec) => match bindings.array(&spec.array) {
                Ok(array) => array.lock().len() as i64,
                Err(e) => {
                    timings.bounds_us += sw.elapsed_us();
                    return self.per_call_failure(ready, bindings, hash, 0, e, timings, total);
                }
            },
            ProgramKind::Loop(_) => total_iterations(&ranges),
        };
        timings.bounds_us += sw.elapsed_us();

        if iterations < config.offload_threshold {
            return Resolution::Done(self.run_baseline(
                bindings,
                hash,
                iterations,
                "threshold",
                timings,
                total,
            ));
        }

        let devices = ready.backend.devices();
        let sides = available_sides(&devices, self.target());
        if sides.is_empty() {
            return Resolution::Done(self.run_baseline(
                bindings,
                hash,
                iterations,
                "no-device",
                timings,
                total,
            ));
        }

        let level_vars = ready.plan.level_vars();
        let mut attempts = 0;
        loop {
            attempts += 1;

            let sw = Stopwatch::start();
            let checks = if ready.plan.is_reduce() {
                // Reduction kernels index strictly inside [0, n).
                CheckConfig::None
            } else {
                match ready.bound_mode {
                    BoundCheckMode::Off => CheckConfig::None,
                    BoundCheckMode::All => CheckConfig::All,
                    BoundCheckMode::Auto => {
                        match analyze_bounds(
                            &ready.plan.body,
                            &ready.plan.accesses,
                            &level_vars,
                            &ranges,
                            bindings,
                        ) {
                            Ok(report) => CheckConfig::from_report(&report, BoundCheckMode::Auto),
                            Err(e) => {
                                timings.bounds_us += sw.elapsed_us();
                                return self.per_call_failure(
                                    ready, bindings, hash, iterations, e, timings, total,
                                );
                            }
                        }
                    }
                }
            };
            timings.bounds_us += sw.elapsed_us();

            let key = KernelKey {
                structural: hash,
                checks: checks.signature(),
            };
            let sw = Stopwatch::start();
            let obtained = self.context.obtain(key, || {
                ready
                    .backend
                    .prepare(&self.program, &ready.plan, &checks, config)
            });
            timings.codegen_us += sw.elapsed_us();
            let (kernel, recycled) = match obtained {
                Ok(pair) => pair,
                Err(e) => {
                    return self.failed_offload(ready, bindings, hash, iterations, e, timings, total)
                }
            };
            if !recycled {
                hub().note_generated_kernel();
            }

            let decision = self.context.schedule().decide(hash, iterations, &sides);
            let side = decision.side();
            let device = match devices.iter().find(|d| d.class.schedule_side() == side) {
                Some(device) => device.clone(),
                None => {
                    return Resolution::Done(self.run_baseline(
                        bindings,
                        hash,
                        iterations,
                        "no-device",
                        timings,
                        total,
                    ))
                }
            };

            debug_log(self.debug(), 2, || {
                format!(
                    "'{}' launching {} on {} ({})",
                    self.program.name,
                    kernel.entry(),
                    device.identity(),
                    decision.label()
                )
            });

            // Guard calls that start while this launch is in flight follow
            // its side instead of opening trials under it.
            let launched = {
                let _pin = self.context.schedule().pin(side);
                kernel.execute(bindings, &ranges, &device)
            };
            match launched {
                Ok(report) => {
                    if decision.is_trial() {
                        self.context
                            .schedule()
                            .record(hash, iterations, side, report.kernel_time);
                    }
                    ready.relief = config.relief_valve.max(1);
                    hub().note_kernel_execution();
                    let outcome = if ready.plan.is_reduce() {
                        match report.value {
                            Some(value) => Outcome::Value(value),
                            None => {
                                let e =
                                    OffloadError::device("reduction launch returned no value");
                                return self.failed_offload(
                                    ready, bindings, hash, iterations, e, timings, total,
                                );
                            }
                        }
                    } else {
                        Outcome::Unit
                    };
                    timings.compile_us += duration_us(report.compile_time);
                    timings.transfer_us += duration_us(report.transfer_time);
                    timings.kernel_us += duration_us(report.kernel_time);
                    timings.total_us = total.elapsed_us();
                    hub().record(ExecutionRecord {
                        site: self.program.name.clone(),
                        kernel_hash: hash,
                        iterations,
                        device: report.device,
                        mode: decision.label(),
                        recycled,
                        checks_elided: checks.elides_any(),
                        outcome: "offloaded".to_string(),
                        transfer_bytes: report.transfer_bytes,
                        timings,
                    });
                    return Resolution::Done(Ok(outcome));
                }
                Err(e) => {
                    let tripped_with_elision = matches!(e, OffloadError::BoundViolation { .. })
                        && ready.bound_mode == BoundCheckMode::Auto;
                    if tripped_with_elision && attempts < 2 {
                        // The elision proof held for earlier values, not
                        // these. Retry once with every access instrumented;
                        // a second trip is the program's own violation.
                        debug_log(self.debug(), 1, || {
                            format!(
                                "'{}' bound flag tripped, retrying with full checks",
                                self.program.name
                            )
                        });
                        ready.demoted = true;
                        ready.bound_mode = BoundCheckMode::All;
                        continue;
                    }
                    return self.failed_offload(ready, bindings, hash, iterations, e, timings, total);
                }
            }
        }
    }

    /// A this-call analysis failure: ranges or bounds did not work out for
    /// the current values. The baseline decides the real outcome; repeats
    /// drain the relief valve so a hopeless site stops paying for analysis.
    #[allow(clippy::too_many_arguments)]
    fn per_call_failure(
        &self,
        ready: &mut ReadyState,
        bindings: &Bindings,
        hash: u64,
        iterations: i64,
        e: OffloadError,
        timings: PhaseTimings,
        total: &Stopwatch,
    ) -> Resolution {
        debug_log(self.debug(), 1, || {
            format!("'{}' cannot offload this call: {e}", self.program.name)
        });
        let mode = format!("fallback:{}", e.class());
        let result = self.run_baseline(bindings, hash, iterations, &mode, timings, total);
        ready.relief = ready.relief.saturating_sub(1);
        if ready.relief == 0 {
            return Resolution::StopOffloading {
                reason: format!("repeated offload failures, last: {e}"),
                result,
            };
        }
        Resolution::Done(result)
    }

    /// A failure from compilation or the device. Sticky classes and
    /// full-instrumentation bound trips end offloading; transient classes
    /// drain the relief valve.
    #[allow(clippy::too_many_arguments)]
    fn failed_offload(
        &self,
        ready: &mut ReadyState,
        bindings: &Bindings,
        hash: u64,
        iterations: i64,
        e: OffloadError,
        timings: PhaseTimings,
        total: &Stopwatch,
    ) -> Resolution {
        debug_log(self.debug(), 1, || {
            format!("'{}' offload failed: {e}", self.program.name)
        });
        let mode = format!("fallback:{}", e.class());
        let result = self.run_baseline(bindings, hash, iterations, &mode, timings, total);
        if e.is_sticky() || matches!(e, OffloadError::BoundViolation { .. }) {
            return Resolution::StopOffloading {
                reason: e.to_string(),
                result,
            };
        }
        ready.relief = ready.relief.saturating_sub(1);
        if ready.relief == 0 {
            return Resolution::StopOffloading {
                reason: format!("repeated offload failures, last: {e}"),
                result,
            };
        }
        Resolution::Done(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_baseline(
        &self,
        bindings: &Bindings,
        hash: u64,
        iterations: i64,
        mode: &str,
        mut timings: PhaseTimings,
        total: &Stopwatch,
    ) -> Result<Outcome> {
        hub().note_baseline_execution();
        let result = self.baseline.execute(&self.program, bindings);
        timings.total_us = total.elapsed_us();
        let outcome = match &result {
            Ok(_) => "baseline".to_string(),
            Err(e) => e.class().to_string(),
        };
        hub().record(ExecutionRecord {
            site: self.program.name.clone(),
            kernel_hash: hash,
            iterations,
            device: "baseline".to_string(),
            mode: mode.to_string(),
            recycled: false,
            checks_elided: false,
            outcome,
            transfer_bytes: 0,
            timings,
        });
        result
    }

    fn target(&self) -> TargetMode {
        if self.options.target_mode != TargetMode::Auto {
            self.options.target_mode
        } else {
            self.context.config().target
        }
    }

    fn debug(&self) -> u8 {
        self.options.debug_level.max(self.context.config().debug_level)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().expect("guard state lock poisoned")
    }
}

/// Fused iteration count, the product over all parallel levels.
fn total_iterations(ranges: &[ResolvedRange]) -> i64 {
    let mut total: i128 = 1;
    for range in ranges {
        total = total.saturating_mul(range.count() as i128);
    }
    total.clamp(0, i64::MAX as i128) as i64
}

/// Schedule sides the call may use, after the target mode filter.
fn available_sides(devices: &[DeviceHandle], target: TargetMode) -> Vec<ScheduleSide> {
    let mut sides = Vec::new();
    for device in devices {
        let side = device.class.schedule_side();
        let allowed = match target {
            TargetMode::Auto => true,
            TargetMode::Gpu => side == ScheduleSide::Gpu,
            TargetMode::Cpu => side == ScheduleSide::Cpu,
            TargetMode::BaselineOnly => false,
        };
        if allowed && !sides.contains(&side) {
            sides.push(side);
        }
    }
    sides
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
