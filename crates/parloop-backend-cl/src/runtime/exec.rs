//! Staged execution of generated kernels.
//!
//! One [`ClKernel`] per generated translation unit. A call stages its
//! arrays through the broker, binds launch arguments in the lowered
//! parameter order, runs the NDRange, reads the violation flags, and
//! copies written arrays back. Loop nests run as one launch; reductions
//! fold the scratch buffer in halving passes. Any failure after the
//! launch discards the written device copies, so host arrays only ever
//! change through a clean read-back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parloop::analysis::bounds::ResolvedRange;
use parloop::config::TuningConfig;
use parloop::error::{OffloadError, Result};
use parloop::exec::{DeviceHandle, LaunchReport, PreparedKernel};
use parloop::ir::types::{Literal, ScalarType};
use parloop::symbols::{ArrayData, Bindings};
use parloop::telemetry::{debug_log, Stopwatch};

use crate::codegen::lower::{KernelBody, LoweredReduce, ParamKind};
use crate::codegen::KernelBundle;
use crate::driver::{ClDriver, Handle, LaunchArg};
use crate::runtime::broker::{DataBroker, StageRequest};
use crate::runtime::geometry::GeometryCache;

const FLAG_BYTES: u64 = 8;

/// Serializes source generation and device program builds across the
/// process. Vendor compilers are not reliably reentrant.
static COMPILE_GATE: Mutex<()> = Mutex::new(());

pub(crate) fn compile_guard() -> MutexGuard<'static, ()> {
    COMPILE_GATE.lock().expect("compile gate poisoned")
}

/// One execution lock per enumerated device. A device runs one staged
/// launch at a time; distinct devices proceed concurrently.
pub struct DeviceLocks {
    locks: HashMap<String, Mutex<()>>,
}

impl DeviceLocks {
    pub fn for_devices(devices: &[DeviceHandle]) -> DeviceLocks {
        DeviceLocks {
            locks: devices
                .iter()
                .map(|d| (d.identity(), Mutex::new(())))
                .collect(),
        }
    }

    pub fn hold(&self, device: &DeviceHandle) -> Result<MutexGuard<'_, ()>> {
        let lock = self.locks.get(&device.identity()).ok_or_else(|| {
            OffloadError::device(format!("'{}' is not an enumerated device", device.identity()))
        })?;
        Ok(lock.lock().expect("device execution lock poisoned"))
    }
}

/// Device buffer freed on drop. Used for the violation flags and the
/// reduction scratch, which live for one call only.
struct DeviceBuffer<'a> {
    driver: &'a dyn ClDriver,
    device: &'a DeviceHandle,
    handle: Handle,
}

impl<'a> DeviceBuffer<'a> {
    fn alloc(
        driver: &'a dyn ClDriver,
        device: &'a DeviceHandle,
        bytes: u64,
    ) -> Result<DeviceBuffer<'a>> {
        let handle = driver.alloc(device, bytes)?;
        Ok(DeviceBuffer {
            driver,
            device,
            handle,
        })
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        self.driver.free(self.device, self.handle);
    }
}

/// The bound and overflow flag words of one call.
struct FlagPair<'a> {
    bound: DeviceBuffer<'a>,
    overflow: DeviceBuffer<'a>,
}

impl<'a> FlagPair<'a> {
    fn alloc(driver: &'a dyn ClDriver, device: &'a DeviceHandle) -> Result<FlagPair<'a>> {
        let bound = DeviceBuffer::alloc(driver, device, FLAG_BYTES)?;
        let overflow = DeviceBuffer::alloc(driver, device, FLAG_BYTES)?;
        Ok(FlagPair { bound, overflow })
    }

    fn arm(&self) -> Result<()> {
        let zero = 0i64.to_ne_bytes();
        let d = self.bound.driver;
        d.upload(self.bound.device, self.bound.handle, &zero)?;
        d.upload(self.overflow.device, self.overflow.handle, &zero)
    }

    fn read(&self) -> Result<(i64, i64)> {
        let d = self.bound.driver;
        let mut word = [0u8; 8];
        d.download(self.bound.device, self.bound.handle, &mut word)?;
        let bound = i64::from_ne_bytes(word);
        d.download(self.overflow.device, self.overflow.handle, &mut word)?;
        Ok((bound, i64::from_ne_bytes(word)))
    }
}

/// A prepared kernel bound to one driver. Device programs are compiled
/// lazily per device and cached for the life of the kernel.
pub struct ClKernel {
    bundle: KernelBundle,
    driver: Arc<dyn ClDriver>,
    broker: Arc<DataBroker>,
    geometry: Arc<GeometryCache>,
    locks: Arc<DeviceLocks>,
    debug: u8,
    programs: Mutex<HashMap<String, Handle>>,
}

impl ClKernel {
    pub(crate) fn new(
        bundle: KernelBundle,
        driver: Arc<dyn ClDriver>,
        broker: Arc<DataBroker>,
        geometry: Arc<GeometryCache>,
        locks: Arc<DeviceLocks>,
        config: &TuningConfig,
    ) -> ClKernel {
        ClKernel {
            bundle,
            driver,
            broker,
            geometry,
            locks,
            debug: config.debug_level,
            programs: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled program handle for `device`, building it on first use.
    /// The returned duration is the build time, zero when cached.
    fn program_for(&self, device: &DeviceHandle) -> Result<(Handle, Duration)> {
        let key = device.identity();
        {
            let programs = self.programs.lock().expect("program cache poisoned");
            if let Some(handle) = programs.get(&key) {
                return Ok((*handle, Duration::ZERO));
            }
        }
        let _gate = compile_guard();
        let mut programs = self.programs.lock().expect("program cache poisoned");
        if let Some(handle) = programs.get(&key) {
            return Ok((*handle, Duration::ZERO));
        }
        let watch = Stopwatch::start();
        let handle = self.driver.compile(device, &self.bundle)?;
        let elapsed = watch.elapsed();
        debug_log(self.debug, 2, || {
            format!("built '{}' for {key}", self.bundle.entry)
        });
        programs.insert(key, handle);
        Ok((handle, elapsed))
    }

    fn stage_requests(&self, bindings: &Bindings) -> Result<Vec<StageRequest>> {
        let mut requests = Vec::new();
        for (name, _, _, written, write_only) in self.bundle.lowered.arrays() {
            requests.push(StageRequest {
                name: name.to_string(),
                array: bindings.array(name)?.clone(),
                written,
                write_only,
            });
        }
        Ok(requests)
    }

    /// Launch arguments in the lowered parameter order.
    fn build_args(
        &self,
        bindings: &Bindings,
        ranges: &[ResolvedRange],
        handles: &HashMap<String, Handle>,
        flags: &FlagPair<'_>,
        fold: (i64, i64),
    ) -> Result<Vec<LaunchArg>> {
        let mut args = Vec::with_capacity(self.bundle.lowered.params.len());
        for param in &self.bundle.lowered.params {
            let arg = match &param.kind {
                ParamKind::Array { .. } => LaunchArg::Buffer(handles[param.name.as_str()]),
                ParamKind::Extent { array, dim } => {
                    let data = bindings.array(array)?.lock();
                    LaunchArg::Scalar(Literal::I64(data.dims[*dim] as i64))
                }
                ParamKind::Scalar { ty, .. } => LaunchArg::Scalar(coerce_scalar(
                    &param.name,
                    bindings.scalar(&param.name)?,
                    *ty,
                )?),
                ParamKind::Offset { level } => LaunchArg::Scalar(Literal::I64(ranges[*level].start)),
                ParamKind::Step { level } => LaunchArg::Scalar(Literal::I64(ranges[*level].step)),
                ParamKind::Half => LaunchArg::Scalar(Literal::I64(fold.0)),
                ParamKind::Count => LaunchArg::Scalar(Literal::I64(fold.1)),
                ParamKind::BoundFlag => LaunchArg::Buffer(flags.bound.handle),
                ParamKind::OverflowFlag => LaunchArg::Buffer(flags.overflow.handle),
            };
            args.push(arg);
        }
        Ok(args)
    }

    fn execute_loop(
        &self,
        bindings: &Bindings,
        ranges: &[ResolvedRange],
        device: &DeviceHandle,
    ) -> Result<LaunchReport> {
        let mut report = LaunchReport::on(device.identity());
        let global: Vec<usize> = ranges.iter().map(|r| r.count() as usize).collect();
        if global.iter().any(|&g| g == 0) {
            return Ok(report);
        }
        let requests = self.stage_requests(bindings)?;
        let written: Vec<StageRequest> =
            requests.iter().filter(|r| r.written).cloned().collect();

        let _device = self.locks.hold(device)?;
        let (program, compile_time) = self.program_for(device)?;
        report.compile_time = compile_time;
        match self.run_loop_on(device, program, bindings, ranges, &requests, &global, &mut report)
        {
            Ok(()) => Ok(report),
            Err(err) => {
                // Whatever the launch wrote on the device is unusable.
                self.broker.discard(device, &written);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_loop_on(
        &self,
        device: &DeviceHandle,
        program: Handle,
        bindings: &Bindings,
        ranges: &[ResolvedRange],
        requests: &[StageRequest],
        global: &[usize],
        report: &mut LaunchReport,
    ) -> Result<()> {
        let transfer = Stopwatch::start();
        let staged = self.broker.stage(device, requests)?;
        let flags = FlagPair::alloc(self.driver.as_ref(), device)?;
        flags.arm()?;
        report.transfer_bytes += staged.uploaded_bytes + 2 * FLAG_BYTES;
        report.transfer_time += transfer.elapsed();
        let mut handles = staged.handles;

        loop {
            let args = self.build_args(bindings, ranges, &handles, &flags, (0, 0))?;
            let local = self.geometry.local_for(&self.bundle.entry, device, global);
            match self.driver.launch(device, program, &args, global, &local) {
                Ok(duration) => {
                    report.kernel_time += duration;
                    break;
                }
                Err(err) if err.class() == "device" => {
                    if !self.geometry.shrink(&self.bundle.entry, device, &local) {
                        return Err(minimal_group_failure(&self.bundle.entry, device, &err));
                    }
                    debug_log(self.debug, 1, || {
                        format!(
                            "launch of '{}' on {} rejected ({err}); retrying with a smaller work group",
                            self.bundle.entry,
                            device.identity()
                        )
                    });
                    // The failed launch may have written partial results.
                    // Drop those copies and stage the pristine host data
                    // again before retrying.
                    let dirty: Vec<StageRequest> =
                        requests.iter().filter(|r| r.written).cloned().collect();
                    let transfer = Stopwatch::start();
                    self.broker.discard(device, &dirty);
                    let restaged = self.broker.stage(device, requests)?;
                    flags.arm()?;
                    report.transfer_bytes += restaged.uploaded_bytes + 2 * FLAG_BYTES;
                    report.transfer_time += transfer.elapsed();
                    handles = restaged.handles;
                }
                Err(err) => return Err(err),
            }
        }

        let transfer = Stopwatch::start();
        let (bound, overflow) = flags.read()?;
        report.transfer_bytes += 2 * FLAG_BYTES;
        if bound != 0 {
            return Err(OffloadError::bound(
                &self.bundle.entry,
                "an instrumented access left its array",
            ));
        }
        if overflow != 0 {
            return Err(OffloadError::overflow(
                "integer arithmetic left its representable range",
            ));
        }
        report.transfer_bytes += self.broker.read_back(device, requests)?;
        report.transfer_time += transfer.elapsed();
        Ok(())
    }

    fn execute_reduce(
        &self,
        spec: &LoweredReduce,
        bindings: &Bindings,
        device: &DeviceHandle,
    ) -> Result<LaunchReport> {
        let array = bindings.array(&spec.array)?;
        let mut report = LaunchReport::on(device.identity());
        let image: Vec<u8>;
        {
            let data = array.lock();
            match data.len() {
                0 => {
                    return Err(OffloadError::bound(
                        &spec.array,
                        "reduction over an empty array",
                    ))
                }
                // A single element is its own fold; the combiner never runs.
                1 => {
                    report.value = Some(data.get(0));
                    return Ok(report);
                }
                _ => image = widened_image(&data, &spec.array, spec.elem)?,
            }
        }

        let _device = self.locks.hold(device)?;
        let (program, compile_time) = self.program_for(device)?;
        report.compile_time = compile_time;
        let value = self.run_reduce_on(device, program, bindings, spec, &image, &mut report)?;
        report.value = Some(value);
        Ok(report)
    }

    fn run_reduce_on(
        &self,
        device: &DeviceHandle,
        program: Handle,
        bindings: &Bindings,
        spec: &LoweredReduce,
        image: &[u8],
        report: &mut LaunchReport,
    ) -> Result<Literal> {
        let scratch = DeviceBuffer::alloc(self.driver.as_ref(), device, image.len() as u64)?;
        let flags = FlagPair::alloc(self.driver.as_ref(), device)?;
        let handles: HashMap<String, Handle> =
            HashMap::from([(spec.array.clone(), scratch.handle)]);
        let total = (image.len() / spec.elem.byte_width()) as i64;

        'attempt: loop {
            let transfer = Stopwatch::start();
            self.driver.upload(device, scratch.handle, image)?;
            flags.arm()?;
            report.transfer_bytes += image.len() as u64 + 2 * FLAG_BYTES;
            report.transfer_time += transfer.elapsed();

            let mut live = total;
            while live > 1 {
                let half = (live + 1) / 2;
                let global = [half as usize];
                let local = self.geometry.local_for(&self.bundle.entry, device, &global);
                let args = self.build_args(bindings, &[], &handles, &flags, (half, live))?;
                match self.driver.launch(device, program, &args, &global, &local) {
                    Ok(duration) => {
                        report.kernel_time += duration;
                        live = half;
                    }
                    Err(err) if err.class() == "device" => {
                        if !self.geometry.shrink(&self.bundle.entry, device, &local) {
                            return Err(minimal_group_failure(&self.bundle.entry, device, &err));
                        }
                        debug_log(self.debug, 1, || {
                            format!(
                                "launch of '{}' on {} rejected ({err}); restarting the fold",
                                self.bundle.entry,
                                device.identity()
                            )
                        });
                        // Completed passes left the scratch half folded.
                        // Start over from the host image under the new
                        // ceiling.
                        continue 'attempt;
                    }
                    Err(err) => return Err(err),
                }
            }

            let transfer = Stopwatch::start();
            let (bound, overflow) = flags.read()?;
            report.transfer_bytes += 2 * FLAG_BYTES;
            if bound != 0 {
                return Err(OffloadError::bound(
                    &spec.array,
                    "an instrumented access left the reduction scratch",
                ));
            }
            if overflow != 0 {
                return Err(OffloadError::overflow(
                    "integer arithmetic left its representable range while combining",
                ));
            }
            let mut bytes = vec![0u8; image.len()];
            self.driver.download(device, scratch.handle, &mut bytes)?;
            report.transfer_bytes += image.len() as u64;
            report.transfer_time += transfer.elapsed();
            return Ok(narrow_result(first_element(&bytes, spec.elem), spec.ret));
        }
    }
}

impl PreparedKernel for ClKernel {
    fn entry(&self) -> &str {
        &self.bundle.entry
    }

    fn source(&self) -> &str {
        &self.bundle.source
    }

    fn execute(
        &self,
        bindings: &Bindings,
        ranges: &[ResolvedRange],
        device: &DeviceHandle,
    ) -> Result<LaunchReport> {
        match &self.bundle.lowered.body {
            KernelBody::Loop(_) => self.execute_loop(bindings, ranges, device),
            KernelBody::Reduce(spec) => self.execute_reduce(spec, bindings, device),
        }
    }
}

fn minimal_group_failure(entry: &str, device: &DeviceHandle, err: &OffloadError) -> OffloadError {
    OffloadError::compilation(format!(
        "'{entry}' fails on '{}' at the minimal work group size: {err}",
        device.name
    ))
}

/// Widen a bound scalar to the type the kernel parameter declares.
fn coerce_scalar(name: &str, value: Literal, ty: ScalarType) -> Result<Literal> {
    if value.ty() == ty {
        return Ok(value);
    }
    match (value, ty) {
        (Literal::I32(v), ScalarType::I64) => Ok(Literal::I64(i64::from(v))),
        (Literal::I32(v), ScalarType::F64) => Ok(Literal::F64(f64::from(v))),
        (Literal::I64(v), ScalarType::F64) => Ok(Literal::F64(v as f64)),
        _ => Err(OffloadError::unsupported(
            "launch binding",
            format!(
                "'{name}' is bound as {} where {} is expected",
                value.ty(),
                ty
            ),
        )),
    }
}

/// The array's elements widened to the scratch element type, in device
/// byte order.
fn widened_image(data: &ArrayData, name: &str, elem: ScalarType) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * elem.byte_width());
    for flat in 0..data.len() {
        let value = coerce_scalar(name, data.get(flat), elem)?;
        match value {
            Literal::I32(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Literal::I64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Literal::F64(v) => out.extend_from_slice(&v.to_ne_bytes()),
            Literal::Bool(v) => out.push(u8::from(v)),
        }
    }
    Ok(out)
}

fn first_element(bytes: &[u8], elem: ScalarType) -> Literal {
    match elem {
        ScalarType::I32 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[..4]);
            Literal::I32(i32::from_ne_bytes(b))
        }
        ScalarType::I64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            Literal::I64(i64::from_ne_bytes(b))
        }
        ScalarType::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            Literal::F64(f64::from_ne_bytes(b))
        }
        ScalarType::Bool => Literal::Bool(bytes[0] != 0),
    }
}

/// The last combine produced a value of the combiner's result type,
/// widened into the scratch element type, so this cast is exact.
fn narrow_result(value: Literal, ret: ScalarType) -> Literal {
    if value.ty() == ret {
        return value;
    }
    match (value, ret) {
        (Literal::I64(v), ScalarType::I32) => Literal::I32(v as i32),
        (Literal::F64(v), ScalarType::I32) => Literal::I32(v as i32),
        (Literal::F64(v), ScalarType::I64) => Literal::I64(v as i64),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parloop::analysis::bounds::resolve_ranges;
    use parloop::analysis::build_plan;
    use parloop::exec::CheckConfig;
    use parloop::ir::program::{Expr, Function, LoopLevel, Program, Stmt};
    use parloop::options::LoopOptions;
    use parloop::symbols::{ArrayRef, SymbolTable};

    use crate::codegen::generate;
    use crate::driver::sim::SimDriver;

    struct Rig {
        driver: Arc<dyn ClDriver>,
        broker: Arc<DataBroker>,
        geometry: Arc<GeometryCache>,
        locks: Arc<DeviceLocks>,
        devices: Vec<DeviceHandle>,
    }

    fn rig_with(driver: Arc<dyn ClDriver>, portion: f64) -> Rig {
        let devices = driver.devices().unwrap();
        Rig {
            broker: Arc::new(DataBroker::new(Arc::clone(&driver), portion)),
            geometry: Arc::new(GeometryCache::new()),
            locks: Arc::new(DeviceLocks::for_devices(&devices)),
            driver,
            devices,
        }
    }

    fn sim_rig() -> Rig {
        rig_with(Arc::new(SimDriver::new()), 0.7)
    }

    impl Rig {
        fn kernel(
            &self,
            program: &Program,
            bindings: &Bindings,
            checks: &CheckConfig,
        ) -> (ClKernel, Vec<ResolvedRange>) {
            let plan = build_plan(program, bindings, &LoopOptions::default()).unwrap();
            let ranges = resolve_ranges(&plan.levels, bindings).unwrap();
            let bundle = generate(program, &plan, checks).unwrap();
            let kernel = ClKernel::new(
                bundle,
                Arc::clone(&self.driver),
                Arc::clone(&self.broker),
                Arc::clone(&self.geometry),
                Arc::clone(&self.locks),
                &TuningConfig::default(),
            );
            (kernel, ranges)
        }

        fn gpu(&self) -> &DeviceHandle {
            &self.devices[0]
        }
    }

    fn saxpy(n: i64) -> (Program, Bindings, ArrayRef) {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("a", ScalarType::F64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "saxpy",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(
                    Expr::mul(Expr::scalar("a"), Expr::load("x", vec![Expr::scalar("i")])),
                    Expr::load("y", vec![Expr::scalar("i")]),
                ),
            }],
        );
        let xs: Vec<f64> = (0..8).map(f64::from).collect();
        let y = ArrayRef::new(ArrayData::from_f64(vec![1.0; 8]));
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(n)).unwrap();
        bindings.set_scalar("a", Literal::F64(2.0)).unwrap();
        bindings
            .set_array("x", ArrayRef::new(ArrayData::from_f64(xs)))
            .unwrap();
        bindings.set_array("y", y.clone()).unwrap();
        (program, bindings, y)
    }

    fn sum_program(values: Vec<f64>) -> (Program, Bindings, ArrayRef) {
        let combine = Function {
            name: "combine".into(),
            params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::add(Expr::scalar("a"), Expr::scalar("b")))],
        };
        let symbols = SymbolTable::new().array("data", ScalarType::F64, 1);
        let program = Program::reduction("total", symbols, "data", combine);
        let data = ArrayRef::new(ArrayData::from_f64(values));
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_array("data", data.clone()).unwrap();
        (program, bindings, data)
    }

    fn y_values(y: &ArrayRef) -> Vec<f64> {
        let data = y.lock();
        (0..data.len())
            .map(|i| match data.get(i) {
                Literal::F64(v) => v,
                other => panic!("unexpected element {other:?}"),
            })
            .collect()
    }

    #[test]
    fn saxpy_runs_and_reads_back() {
        let rig = sim_rig();
        let (program, bindings, y) = saxpy(8);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);

        let report = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        let expect: Vec<f64> = (0..8).map(|i| 2.0 * i as f64 + 1.0).collect();
        assert_eq!(y_values(&y), expect);
        assert_eq!(report.value, None);
        // x and y up, flags armed and read, y down.
        assert_eq!(report.transfer_bytes, 64 + 64 + 16 + 16 + 64);
        assert_eq!(report.kernel_time, Duration::from_nanos(200_008));

        // The second call reuses the program and the resident x.
        let report = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(report.compile_time, Duration::ZERO);
        assert_eq!(report.transfer_bytes, 16 + 16 + 64);
        let expect: Vec<f64> = (0..8).map(|i| 4.0 * i as f64 + 1.0).collect();
        assert_eq!(y_values(&y), expect);
    }

    #[test]
    fn empty_ranges_launch_nothing() {
        let rig = sim_rig();
        let (program, bindings, y) = saxpy(0);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let report = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(report.transfer_bytes, 0);
        assert_eq!(report.kernel_time, Duration::ZERO);
        assert_eq!(y_values(&y), vec![1.0; 8]);
    }

    #[test]
    fn bound_violations_roll_back_written_arrays() {
        let rig = sim_rig();
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("idx", ScalarType::I64, 1)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "gather",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::load("x", vec![Expr::load("idx", vec![Expr::scalar("i")])]),
            }],
        );
        let idx = ArrayRef::new(ArrayData::from_i64(vec![100, 1, 2, 3]));
        let y = ArrayRef::new(ArrayData::from_f64(vec![0.0; 4]));
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_array("idx", idx.clone()).unwrap();
        bindings
            .set_array(
                "x",
                ArrayRef::new(ArrayData::from_f64(vec![10.0, 20.0, 30.0, 40.0])),
            )
            .unwrap();
        bindings.set_array("y", y.clone()).unwrap();

        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::All);
        let err = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap_err();
        assert_eq!(err.class(), "bound");
        assert!(!err.is_sticky());
        assert_eq!(y_values(&y), vec![0.0; 4]);

        // With the index repaired the same kernel succeeds.
        idx.lock().set(0, Literal::I64(1)).unwrap();
        kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(y_values(&y), vec![20.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn overflow_trips_the_flag_and_leaves_the_host_alone() {
        let rig = sim_rig();
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("v", ScalarType::I64, 1);
        let program = Program::loop_nest(
            "bump",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "v".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(Expr::load("v", vec![Expr::scalar("i")]), Expr::i64(1)),
            }],
        );
        let v = ArrayRef::new(ArrayData::from_i64(vec![i64::MAX; 4]));
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_array("v", v.clone()).unwrap();

        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let err = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap_err();
        assert_eq!(err.class(), "overflow");
        assert!(err.is_sticky());
        assert_eq!(v.lock().get(0), Literal::I64(i64::MAX));
    }

    #[test]
    fn reductions_fold_on_the_device() {
        let rig = sim_rig();
        let (program, bindings, data) = sum_program((1..=8).map(f64::from).collect());
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let report = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(report.value, Some(Literal::F64(36.0)));
        // Three halving passes over 8, 4, and 2 live elements.
        assert_eq!(report.kernel_time, Duration::from_nanos(600_007));
        // Scratch up and down plus the flag round trip.
        assert_eq!(report.transfer_bytes, 64 + 16 + 16 + 64);
        // The fold ran on a scratch copy.
        assert_eq!(data.lock().get(0), Literal::F64(1.0));
    }

    #[test]
    fn single_element_reductions_skip_the_device() {
        let rig = sim_rig();
        let (program, bindings, _) = sum_program(vec![42.0]);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let report = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(report.value, Some(Literal::F64(42.0)));
        assert_eq!(report.transfer_bytes, 0);
        assert_eq!(report.kernel_time, Duration::ZERO);
    }

    #[test]
    fn empty_reductions_are_bound_violations() {
        let rig = sim_rig();
        let (program, bindings, _) = sum_program(Vec::new());
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let err = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap_err();
        assert_eq!(err.class(), "bound");
        assert!(err.to_string().contains("reduction over an empty array"));
    }

    #[test]
    fn oversized_working_sets_are_capacity_failures() {
        let rig = rig_with(Arc::new(SimDriver::new()), 0.0);
        let (program, bindings, _) = saxpy(8);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        let err = kernel.execute(&bindings, &ranges, rig.gpu()).unwrap_err();
        assert_eq!(err.class(), "capacity");
        assert_eq!(err.to_string(), "Data too large for 'SimGPU' memory.");
    }

    /// Runs the launch, then rejects work groups over the cap. Models a
    /// device that fails after the kernel already touched memory.
    struct CappedDriver {
        inner: SimDriver,
        cap: usize,
        launches: AtomicUsize,
    }

    impl CappedDriver {
        fn new(cap: usize) -> CappedDriver {
            CappedDriver {
                inner: SimDriver::new(),
                cap,
                launches: AtomicUsize::new(0),
            }
        }
    }

    impl ClDriver for CappedDriver {
        fn name(&self) -> &str {
            "capped"
        }

        fn devices(&self) -> Result<Vec<DeviceHandle>> {
            self.inner.devices()
        }

        fn compile(&self, device: &DeviceHandle, bundle: &KernelBundle) -> Result<Handle> {
            self.inner.compile(device, bundle)
        }

        fn alloc(&self, device: &DeviceHandle, bytes: u64) -> Result<Handle> {
            self.inner.alloc(device, bytes)
        }

        fn upload(&self, device: &DeviceHandle, buffer: Handle, bytes: &[u8]) -> Result<()> {
            self.inner.upload(device, buffer, bytes)
        }

        fn download(&self, device: &DeviceHandle, buffer: Handle, into: &mut [u8]) -> Result<()> {
            self.inner.download(device, buffer, into)
        }

        fn free(&self, device: &DeviceHandle, buffer: Handle) {
            self.inner.free(device, buffer);
        }

        fn launch(
            &self,
            device: &DeviceHandle,
            program: Handle,
            args: &[LaunchArg],
            global: &[usize],
            local: &[usize],
        ) -> Result<Duration> {
            self.launches.fetch_add(1, Ordering::Relaxed);
            let result = self.inner.launch(device, program, args, global, local)?;
            if local.first().copied().unwrap_or(1) > self.cap {
                return Err(OffloadError::device(format!(
                    "work group of {} rejected",
                    local[0]
                )));
            }
            Ok(result)
        }
    }

    #[test]
    fn rejected_launches_shrink_until_accepted() {
        let driver = Arc::new(CappedDriver::new(2));
        let rig = rig_with(Arc::clone(&driver) as Arc<dyn ClDriver>, 0.7);
        let (program, bindings, y) = saxpy(8);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);

        kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        // Groups of 8 and 4 were rejected before 2 was accepted, and each
        // rejected launch had already run, so the result must come from a
        // single clean pass.
        assert_eq!(driver.launches.load(Ordering::Relaxed), 3);
        let expect: Vec<f64> = (0..8).map(|i| 2.0 * i as f64 + 1.0).collect();
        assert_eq!(y_values(&y), expect);

        // The ceiling is remembered; the next call launches once.
        kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        assert_eq!(driver.launches.load(Ordering::Relaxed), 4);
        let expect: Vec<f64> = (0..8).map(|i| 4.0 * i as f64 + 1.0).collect();
        assert_eq!(y_values(&y), expect);
    }

    struct CountingDriver {
        inner: SimDriver,
        compiles: AtomicUsize,
    }

    impl ClDriver for CountingDriver {
        fn name(&self) -> &str {
            "counting"
        }

        fn devices(&self) -> Result<Vec<DeviceHandle>> {
            self.inner.devices()
        }

        fn compile(&self, device: &DeviceHandle, bundle: &KernelBundle) -> Result<Handle> {
            self.compiles.fetch_add(1, Ordering::Relaxed);
            self.inner.compile(device, bundle)
        }

        fn alloc(&self, device: &DeviceHandle, bytes: u64) -> Result<Handle> {
            self.inner.alloc(device, bytes)
        }

        fn upload(&self, device: &DeviceHandle, buffer: Handle, bytes: &[u8]) -> Result<()> {
            self.inner.upload(device, buffer, bytes)
        }

        fn download(&self, device: &DeviceHandle, buffer: Handle, into: &mut [u8]) -> Result<()> {
            self.inner.download(device, buffer, into)
        }

        fn free(&self, device: &DeviceHandle, buffer: Handle) {
            self.inner.free(device, buffer);
        }

        fn launch(
            &self,
            device: &DeviceHandle,
            program: Handle,
            args: &[LaunchArg],
            global: &[usize],
            local: &[usize],
        ) -> Result<Duration> {
            self.inner.launch(device, program, args, global, local)
        }
    }

    #[test]
    fn one_build_per_device() {
        let driver = Arc::new(CountingDriver {
            inner: SimDriver::new(),
            compiles: AtomicUsize::new(0),
        });
        let rig = rig_with(Arc::clone(&driver) as Arc<dyn ClDriver>, 0.7);
        let (program, bindings, _) = saxpy(8);
        let (kernel, ranges) = rig.kernel(&program, &bindings, &CheckConfig::None);
        kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        kernel.execute(&bindings, &ranges, rig.gpu()).unwrap();
        kernel.execute(&bindings, &ranges, &rig.devices[1]).unwrap();
        assert_eq!(driver.compiles.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn scalars_widen_to_the_declared_parameter_type() {
        assert_eq!(
            coerce_scalar("a", Literal::I32(3), ScalarType::F64).unwrap(),
            Literal::F64(3.0)
        );
        assert_eq!(
            coerce_scalar("n", Literal::I32(7), ScalarType::I64).unwrap(),
            Literal::I64(7)
        );
        assert!(coerce_scalar("flag", Literal::Bool(true), ScalarType::I64).is_err());
        assert!(coerce_scalar("n", Literal::I64(1), ScalarType::I32).is_err());
        assert_eq!(
            narrow_result(Literal::I64(9), ScalarType::I32),
            Literal::I32(9)
        );
    }
}
