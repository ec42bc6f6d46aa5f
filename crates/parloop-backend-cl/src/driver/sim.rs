//! Deterministic in-process platform.
//!
//! Two fake devices interpret the lowered kernel tree with device
//! arithmetic: integer operations saturate and raise the overflow flag,
//! clamped accesses raise the bound flag, and an access that leaves a
//! buffer altogether is a device fault. Reported kernel times are a pure
//! function of the launch size, so scheduling decisions replay the same
//! way on every run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parloop::analysis::reduction::ReductionKind;
use parloop::error::{OffloadError, Result};
use parloop::exec::{DeviceClass, DeviceHandle, DeviceLimits};
use parloop::ir::program::{BinOp, UnOp};
use parloop::ir::types::{Literal, MathFn, ScalarType};

use crate::codegen::lower::{
    Combine, KernelBody, LExpr, LFunction, LStmt, LoweredKernel, LoweredLoop, LoweredReduce,
    ParamKind,
};
use crate::codegen::KernelBundle;

use super::{ClDriver, Handle, LaunchArg};

/// Simulated kernel cost: a fixed launch overhead plus a per-item term.
/// The GPU amortizes a large overhead over cheap items and the CPU the
/// reverse, which gives the scheduler a real crossover to find.
const GPU_BASE_NS: u64 = 200_000;
const GPU_ITEM_NS: u64 = 1;
const CPU_BASE_NS: u64 = 20_000;
const CPU_ITEM_NS: u64 = 25;

const MAX_CALL_DEPTH: u32 = 256;

fn sim_devices() -> Vec<DeviceHandle> {
    vec![
        DeviceHandle {
            index: 0,
            name: "SimGPU".to_string(),
            class: DeviceClass::Gpu,
            limits: DeviceLimits {
                max_work_group_size: 1024,
                max_work_item_sizes: [1024, 1024, 64],
                global_mem_bytes: 1 << 28,
            },
        },
        DeviceHandle {
            index: 1,
            name: "SimCPU".to_string(),
            class: DeviceClass::Cpu,
            limits: DeviceLimits {
                max_work_group_size: 256,
                max_work_item_sizes: [256, 256, 64],
                global_mem_bytes: 1 << 29,
            },
        },
    ]
}

/// The simulator platform. All state sits behind one lock; launches run
/// on the calling thread.
pub struct SimDriver {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next: Handle,
    buffers: HashMap<Handle, Buffer>,
    programs: HashMap<Handle, Arc<LoweredKernel>>,
    /// Allocated bytes per device index, checked against the device limit.
    used: HashMap<usize, u64>,
}

struct Buffer {
    device: usize,
    bytes: Vec<u8>,
}

impl State {
    fn fresh(&mut self) -> Handle {
        self.next += 1;
        self.next
    }
}

impl SimDriver {
    pub fn new() -> SimDriver {
        SimDriver {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        SimDriver::new()
    }
}

impl ClDriver for SimDriver {
    fn name(&self) -> &str {
        "sim"
    }

    fn devices(&self) -> Result<Vec<DeviceHandle>> {
        Ok(sim_devices())
    }

    fn compile(&self, _device: &DeviceHandle, bundle: &KernelBundle) -> Result<Handle> {
        let mut state = self.state.lock().expect("simulator state lock poisoned");
        let handle = state.fresh();
        state.programs.insert(handle, Arc::clone(&bundle.lowered));
        Ok(handle)
    }

    fn alloc(&self, device: &DeviceHandle, bytes: u64) -> Result<Handle> {
        let mut state = self.state.lock().expect("simulator state lock poisoned");
        {
            let used = state.used.entry(device.index).or_insert(0);
            if *used + bytes > device.limits.global_mem_bytes {
                return Err(OffloadError::device(format!(
                    "allocation of {bytes} bytes exceeds the remaining memory of '{}'",
                    device.name
                )));
            }
            *used += bytes;
        }
        let handle = state.fresh();
        state.buffers.insert(
            handle,
            Buffer {
                device: device.index,
                bytes: vec![0; bytes as usize],
            },
        );
        Ok(handle)
    }

    fn upload(&self, device: &DeviceHandle, buffer: Handle, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("simulator state lock poisoned");
        let buf = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| OffloadError::device("upload into an unknown buffer handle"))?;
        if buf.device != device.index {
            return Err(OffloadError::device("upload into a buffer on another device"));
        }
        if bytes.len() != buf.bytes.len() {
            return Err(OffloadError::device(format!(
                "upload of {} bytes into a {} byte buffer",
                bytes.len(),
                buf.bytes.len()
            )));
        }
        buf.bytes.copy_from_slice(bytes);
        Ok(())
    }

    fn download(&self, device: &DeviceHandle, buffer: Handle, into: &mut [u8]) -> Result<()> {
        let state = self.state.lock().expect("simulator state lock poisoned");
        let buf = state
            .buffers
            .get(&buffer)
            .ok_or_else(|| OffloadError::device("download from an unknown buffer handle"))?;
        if buf.device != device.index {
            return Err(OffloadError::device(
                "download from a buffer on another device",
            ));
        }
        if into.len() != buf.bytes.len() {
            return Err(OffloadError::device(format!(
                "download of {} bytes from a {} byte buffer",
                into.len(),
                buf.bytes.len()
            )));
        }
        into.copy_from_slice(&buf.bytes);
        Ok(())
    }

    fn free(&self, _device: &DeviceHandle, buffer: Handle) {
        let mut state = self.state.lock().expect("simulator state lock poisoned");
        if let Some(buf) = state.buffers.remove(&buffer) {
            if let Some(used) = state.used.get_mut(&buf.device) {
                *used = used.saturating_sub(buf.bytes.len() as u64);
            }
        }
    }

    fn launch(
        &self,
        device: &DeviceHandle,
        program: Handle,
        args: &[LaunchArg],
        global: &[usize],
        local: &[usize],
    ) -> Result<Duration> {
        let mut state = self.state.lock().expect("simulator state lock poisoned");
        let kernel = state
            .programs
            .get(&program)
            .map(Arc::clone)
            .ok_or_else(|| OffloadError::device("launch of an uncompiled program handle"))?;
        check_geometry(device, global, local)?;

        // Buffers move out of the pool for the launch, one slot per
        // distinct handle so aliased parameters share one storage.
        let mut slots: Vec<Vec<u8>> = Vec::new();
        let mut owners: Vec<Handle> = Vec::new();
        let bound = build_binding(&kernel, args, device, &mut state, &mut slots, &mut owners);
        let outcome = match bound {
            Ok(bind) => {
                let mut machine = Machine {
                    kernel: &kernel,
                    bind,
                    bufs: slots,
                    depth: 0,
                };
                let outcome = machine.run(global);
                slots = machine.bufs;
                outcome
            }
            Err(e) => Err(e),
        };
        for (handle, bytes) in owners.into_iter().zip(slots) {
            state.buffers.insert(
                handle,
                Buffer {
                    device: device.index,
                    bytes,
                },
            );
        }
        outcome?;

        let items: u64 = global.iter().map(|&n| n as u64).product();
        let (base, per_item) = match device.class {
            DeviceClass::Cpu => (CPU_BASE_NS, CPU_ITEM_NS),
            _ => (GPU_BASE_NS, GPU_ITEM_NS),
        };
        Ok(Duration::from_nanos(base + per_item * items))
    }
}

fn check_geometry(device: &DeviceHandle, global: &[usize], local: &[usize]) -> Result<()> {
    if global.is_empty() || global.len() > 3 || global.len() != local.len() {
        return Err(OffloadError::device(format!(
            "launch rank {} with local rank {} is not supported",
            global.len(),
            local.len()
        )));
    }
    let mut group = 1usize;
    for d in 0..global.len() {
        if local[d] == 0 || global[d] % local[d] != 0 {
            return Err(OffloadError::device(format!(
                "local size {} does not divide global size {} in dimension {d}",
                local[d], global[d]
            )));
        }
        if local[d] > device.limits.max_work_item_sizes[d] {
            return Err(OffloadError::device(format!(
                "local size {} exceeds the dimension {d} limit {} of '{}'",
                local[d], device.limits.max_work_item_sizes[d], device.name
            )));
        }
        group *= local[d];
    }
    if group > device.limits.max_work_group_size {
        return Err(OffloadError::device(format!(
            "work group of {group} items exceeds the limit {} of '{}'",
            device.limits.max_work_group_size, device.name
        )));
    }
    Ok(())
}

struct ArrayBind {
    slot: usize,
    elem: ScalarType,
    extents: Vec<i64>,
}

/// Launch arguments resolved against the kernel parameter list.
struct Binding {
    arrays: HashMap<String, ArrayBind>,
    scalars: HashMap<String, Literal>,
    offsets: Vec<i64>,
    steps: Vec<i64>,
    half: i64,
    count: i64,
    bound_slot: usize,
    overflow_slot: usize,
}

fn build_binding(
    kernel: &LoweredKernel,
    args: &[LaunchArg],
    device: &DeviceHandle,
    state: &mut State,
    slots: &mut Vec<Vec<u8>>,
    owners: &mut Vec<Handle>,
) -> Result<Binding> {
    if args.len() != kernel.params.len() {
        return Err(OffloadError::device(format!(
            "kernel '{}' takes {} arguments, got {}",
            kernel.entry,
            kernel.params.len(),
            args.len()
        )));
    }
    let mut slot_of: HashMap<Handle, usize> = HashMap::new();
    let mut arrays = HashMap::new();
    let mut scalars = HashMap::new();
    let mut offsets = Vec::new();
    let mut steps = Vec::new();
    let mut half = 0i64;
    let mut count = 0i64;
    let mut bound_slot = None;
    let mut overflow_slot = None;

    for (spec, arg) in kernel.params.iter().zip(args) {
        match (&spec.kind, arg) {
            (ParamKind::Array { elem, .. }, LaunchArg::Buffer(handle)) => {
                let slot =
                    take_slot(state, device, slots, owners, &mut slot_of, *handle, &spec.name)?;
                arrays.insert(
                    spec.name.clone(),
                    ArrayBind {
                        slot,
                        elem: *elem,
                        extents: Vec::new(),
                    },
                );
            }
            (ParamKind::Extent { array, dim }, LaunchArg::Scalar(lit)) => {
                let v = scalar_i64(&spec.name, *lit)?;
                let bind: &mut ArrayBind = arrays.get_mut(array).ok_or_else(|| {
                    OffloadError::device(format!("extent '{}' precedes its array", spec.name))
                })?;
                if bind.extents.len() <= *dim {
                    bind.extents.resize(dim + 1, 0);
                }
                bind.extents[*dim] = v;
            }
            (ParamKind::Scalar { ty, .. }, LaunchArg::Scalar(lit)) => {
                let v = widen(*lit, *ty).map_err(|_| {
                    OffloadError::device(format!(
                        "parameter '{}' expects {ty}, got {}",
                        spec.name,
                        lit.ty()
                    ))
                })?;
                scalars.insert(spec.name.clone(), v);
            }
            (ParamKind::Offset { level }, LaunchArg::Scalar(lit)) => {
                if offsets.len() <= *level {
                    offsets.resize(level + 1, 0);
                }
                offsets[*level] = scalar_i64(&spec.name, *lit)?;
            }
            (ParamKind::Step { level }, LaunchArg::Scalar(lit)) => {
                if steps.len() <= *level {
                    steps.resize(level + 1, 0);
                }
                steps[*level] = scalar_i64(&spec.name, *lit)?;
            }
            (ParamKind::Half, LaunchArg::Scalar(lit)) => half = scalar_i64(&spec.name, *lit)?,
            (ParamKind::Count, LaunchArg::Scalar(lit)) => count = scalar_i64(&spec.name, *lit)?,
            (ParamKind::BoundFlag, LaunchArg::Buffer(handle)) => {
                bound_slot = Some(take_slot(
                    state,
                    device,
                    slots,
                    owners,
                    &mut slot_of,
                    *handle,
                    &spec.name,
                )?);
            }
            (ParamKind::OverflowFlag, LaunchArg::Buffer(handle)) => {
                overflow_slot = Some(take_slot(
                    state,
                    device,
                    slots,
                    owners,
                    &mut slot_of,
                    *handle,
                    &spec.name,
                )?);
            }
            _ => {
                return Err(OffloadError::device(format!(
                    "parameter '{}' does not match its launch argument",
                    spec.name
                )));
            }
        }
    }

    Ok(Binding {
        arrays,
        scalars,
        offsets,
        steps,
        half,
        count,
        bound_slot: bound_slot
            .ok_or_else(|| internal("kernel parameters miss the bound flag"))?,
        overflow_slot: overflow_slot
            .ok_or_else(|| internal("kernel parameters miss the overflow flag"))?,
    })
}

/// Move a buffer out of the pool for the launch. A handle that already
/// holds a slot reuses it, so aliased parameters share storage.
fn take_slot(
    state: &mut State,
    device: &DeviceHandle,
    slots: &mut Vec<Vec<u8>>,
    owners: &mut Vec<Handle>,
    slot_of: &mut HashMap<Handle, usize>,
    handle: Handle,
    name: &str,
) -> Result<usize> {
    if let Some(slot) = slot_of.get(&handle) {
        return Ok(*slot);
    }
    let buf = state.buffers.remove(&handle).ok_or_else(|| {
        OffloadError::device(format!("parameter '{name}' bound to an unknown buffer"))
    })?;
    if buf.device != device.index {
        state.buffers.insert(handle, buf);
        return Err(OffloadError::device(format!(
            "parameter '{name}' bound to a buffer on another device"
        )));
    }
    slots.push(buf.bytes);
    owners.push(handle);
    slot_of.insert(handle, slots.len() - 1);
    Ok(slots.len() - 1)
}

fn scalar_i64(name: &str, lit: Literal) -> Result<i64> {
    lit.as_i64().ok_or_else(|| {
        OffloadError::device(format!(
            "parameter '{name}' expects an integer, got {}",
            lit.ty()
        ))
    })
}

/// One launch in flight: the lowered tree, its resolved arguments, and
/// the buffer storage taken out of the pool for the duration.
struct Machine<'k> {
    kernel: &'k LoweredKernel,
    bind: Binding,
    bufs: Vec<Vec<u8>>,
    depth: u32,
}

enum Flow {
    Normal,
    Break,
    Return(Literal),
}

/// Scalar scope of one work item or one function activation. Function
/// frames resolve against their own locals only, never against kernel
/// parameters, mirroring C scope rules in the emitted source.
struct Frame {
    locals: HashMap<String, Literal>,
    kernel_scope: bool,
}

impl Frame {
    fn item() -> Frame {
        Frame {
            locals: HashMap::new(),
            kernel_scope: true,
        }
    }

    fn call() -> Frame {
        Frame {
            locals: HashMap::new(),
            kernel_scope: false,
        }
    }
}

impl<'k> Machine<'k> {
    fn run(&mut self, global: &[usize]) -> Result<()> {
        if global.iter().any(|&n| n == 0) {
            return Ok(());
        }
        let kernel = self.kernel;
        match &kernel.body {
            KernelBody::Loop(body) => self.run_loop(body, global),
            KernelBody::Reduce(reduce) => self.run_reduce(reduce, global),
        }
    }

    fn run_loop(&mut self, body: &'k LoweredLoop, global: &[usize]) -> Result<()> {
        if global.len() != body.level_vars.len() {
            return Err(internal(format!(
                "launch rank {} against a {}-level kernel",
                global.len(),
                body.level_vars.len()
            )));
        }
        if self.bind.offsets.len() < global.len() || self.bind.steps.len() < global.len() {
            return Err(internal("launch arguments miss a level range"));
        }
        let mut gid = vec![0usize; global.len()];
        loop {
            self.run_item(body, &gid)?;
            let mut d = global.len();
            loop {
                if d == 0 {
                    return Ok(());
                }
                d -= 1;
                gid[d] += 1;
                if gid[d] < global[d] {
                    break;
                }
                gid[d] = 0;
            }
        }
    }

    fn run_item(&mut self, body: &'k LoweredLoop, gid: &[usize]) -> Result<()> {
        let mut frame = Frame::item();
        for (d, var) in body.level_vars.iter().enumerate() {
            let v = (gid[d] as i64)
                .wrapping_mul(self.bind.steps[d])
                .wrapping_add(self.bind.offsets[d]);
            frame.locals.insert(var.clone(), Literal::I64(v));
        }
        for (name, ty) in &body.decls {
            frame.locals.insert(name.clone(), Literal::zero(*ty));
        }
        match self.exec_body(&body.stmts, &mut frame)? {
            Flow::Normal => Ok(()),
            Flow::Break => Err(internal("break reached the item scope")),
            Flow::Return(_) => Err(internal("return reached the item scope")),
        }
    }

    /// One pairwise fold pass. Item i combines elements i and i + half of
    /// the scratch buffer in place; the guard keeps items past the live
    /// prefix idle, exactly like the emitted kernel.
    fn run_reduce(&mut self, reduce: &'k LoweredReduce, global: &[usize]) -> Result<()> {
        if global.len() != 1 {
            return Err(internal(format!("reduction launch rank {}", global.len())));
        }
        let (slot, elem) = {
            let bind = self.bind.arrays.get(&reduce.array).ok_or_else(|| {
                internal(format!("reduction array '{}' is unbound", reduce.array))
            })?;
            (bind.slot, bind.elem)
        };
        let half = self.bind.half;
        let live = self.bind.count;
        for gid in 0..global[0] as i64 {
            if gid < half && gid + half < live {
                let a = self.read_slot(slot, elem, gid, &reduce.array)?;
                let b = self.read_slot(slot, elem, gid + half, &reduce.array)?;
                let v = self.combine(reduce, a, b)?;
                let v = widen(v, elem)?;
                write_elem(&mut self.bufs[slot], elem, gid as usize, v)?;
            }
        }
        Ok(())
    }

    fn combine(&mut self, reduce: &'k LoweredReduce, a: Literal, b: Literal) -> Result<Literal> {
        match &reduce.combine {
            Combine::Builtin(kind) => match kind {
                ReductionKind::Add => self.binary_device(BinOp::Add, reduce.elem, a, b),
                ReductionKind::Mul => self.binary_device(BinOp::Mul, reduce.elem, a, b),
                ReductionKind::Min => self.math_device(MathFn::Min, reduce.elem, &[a, b]),
                ReductionKind::Max => self.math_device(MathFn::Max, reduce.elem, &[a, b]),
                ReductionKind::Custom => {
                    Err(internal("custom reduction without a combining function"))
                }
            },
            Combine::Custom(function) => {
                let caller = Frame::item();
                self.call_function(function, vec![a, b], &caller)
            }
        }
    }

    fn exec_body(&mut self, body: &'k [LStmt], frame: &mut Frame) -> Result<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, frame)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &'k LStmt, frame: &mut Frame) -> Result<Flow> {
        match stmt {
            LStmt::Assign { name, ty, value } => {
                let value = self.eval(value, frame)?;
                // Writing a kernel parameter lands in the frame, so each
                // work item mutates a private copy.
                frame.locals.insert(name.clone(), widen(value, *ty)?);
                Ok(Flow::Normal)
            }
            LStmt::Store {
                array,
                elem,
                index,
                checked,
                value,
            } => {
                let value = self.eval(value, frame)?;
                let value = widen(value, *elem)?;
                let (slot, at) = self.element_at(array, index, *checked, frame)?;
                write_elem(&mut self.bufs[slot], *elem, at, value)?;
                Ok(Flow::Normal)
            }
            LStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval_bool(cond, frame)? {
                    self.exec_body(then_body, frame)
                } else {
                    self.exec_body(else_body, frame)
                }
            }
            LStmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => {
                let start = self.eval_i64(start, frame)?;
                let stop = self.eval_i64(stop, frame)?;
                let step = self.eval_i64(step, frame)?;
                if step == 0 {
                    // The emitted form raises the flag and skips the loop.
                    self.raise_overflow();
                    return Ok(Flow::Normal);
                }
                let saved = frame.locals.remove(var);
                let mut v = start;
                let mut flow = Flow::Normal;
                while (step > 0 && v < stop) || (step < 0 && v > stop) {
                    frame.locals.insert(var.clone(), Literal::I64(v));
                    match self.exec_body(body, frame)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => {
                            flow = ret;
                            break;
                        }
                    }
                    v = v.wrapping_add(step);
                }
                match saved {
                    Some(prev) => {
                        frame.locals.insert(var.clone(), prev);
                    }
                    None => {
                        frame.locals.remove(var);
                    }
                }
                Ok(flow)
            }
            LStmt::While { cond, body } => {
                loop {
                    if !self.eval_bool(cond, frame)? {
                        break;
                    }
                    match self.exec_body(body, frame)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            LStmt::Break => Ok(Flow::Break),
            LStmt::Return(value) => {
                let value = self.eval(value, frame)?;
                Ok(Flow::Return(value))
            }
        }
    }

    fn eval(&mut self, expr: &'k LExpr, frame: &mut Frame) -> Result<Literal> {
        match expr {
            LExpr::Const(lit) => Ok(*lit),
            LExpr::Scalar(name) => self.lookup(frame, name),
            LExpr::Load {
                array,
                elem,
                index,
                checked,
            } => {
                let (slot, at) = self.element_at(array, index, *checked, frame)?;
                Ok(read_elem(&self.bufs[slot], *elem, at))
            }
            LExpr::Unary { op, ty, operand } => {
                let value = self.eval(operand, frame)?;
                self.unary_device(*op, *ty, value)
            }
            LExpr::Binary { op, ty, lhs, rhs } => {
                if op.is_logical() {
                    let l = self.eval_bool(lhs, frame)?;
                    return match op {
                        BinOp::And if !l => Ok(Literal::Bool(false)),
                        BinOp::Or if l => Ok(Literal::Bool(true)),
                        _ => Ok(Literal::Bool(self.eval_bool(rhs, frame)?)),
                    };
                }
                let l = self.eval(lhs, frame)?;
                let r = self.eval(rhs, frame)?;
                self.binary_device(*op, *ty, l, r)
            }
            LExpr::Math { func, ty, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, frame)?);
                }
                self.math_device(*func, *ty, &values)
            }
            LExpr::Call { func, args } => {
                let function = self.function(func)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, frame)?);
                }
                self.call_function(function, values, frame)
            }
            LExpr::Cast { to, operand } => {
                let value = self.eval(operand, frame)?;
                cast(value, *to)
            }
        }
    }

    fn function(&self, name: &str) -> Result<&'k LFunction> {
        let kernel = self.kernel;
        let functions: &'k [LFunction] = match &kernel.body {
            KernelBody::Loop(body) => &body.functions,
            KernelBody::Reduce(reduce) => match &reduce.combine {
                Combine::Custom(f) => std::slice::from_ref(f),
                Combine::Builtin(_) => &[],
            },
        };
        functions
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| internal(format!("call of unlowered function '{name}'")))
    }

    fn call_function(
        &mut self,
        function: &'k LFunction,
        args: Vec<Literal>,
        caller: &Frame,
    ) -> Result<Literal> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(internal(format!(
                "call depth limit reached in '{}'",
                function.name
            )));
        }
        let mut frame = Frame::call();
        for ((name, ty), value) in function.params.iter().zip(args) {
            frame.locals.insert(name.clone(), widen(value, *ty)?);
        }
        // Forwarded symbol scalars carry the caller's current values, the
        // same ones the emitted call site passes by value.
        for (name, _) in &function.extras {
            let value = self.lookup(caller, name)?;
            frame.locals.insert(name.clone(), value);
        }
        for (name, ty) in &function.decls {
            frame.locals.insert(name.clone(), Literal::zero(*ty));
        }
        self.depth += 1;
        let flow = self.exec_body(&function.body, &mut frame);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => widen(value, function.ret),
            Flow::Normal | Flow::Break => Err(internal(format!(
                "function '{}' ended without a return",
                function.name
            ))),
        }
    }

    fn lookup(&self, frame: &Frame, name: &str) -> Result<Literal> {
        if let Some(value) = frame.locals.get(name) {
            return Ok(*value);
        }
        if frame.kernel_scope {
            if let Some(value) = self.bind.scalars.get(name) {
                return Ok(*value);
            }
        }
        Err(internal(format!("read of unbound scalar '{name}'")))
    }

    /// Resolve an access to a flat element offset. Checked coordinates
    /// clamp to zero and raise the bound flag; an offset that still leaves
    /// the backing buffer is a device fault.
    fn element_at(
        &mut self,
        array: &str,
        index: &'k [LExpr],
        checked: bool,
        frame: &mut Frame,
    ) -> Result<(usize, usize)> {
        let (slot, width, extents) = {
            let bind = self
                .bind
                .arrays
                .get(array)
                .ok_or_else(|| internal(format!("access to unbound array '{array}'")))?;
            (bind.slot, bind.elem.byte_width(), bind.extents.clone())
        };
        if index.len() != extents.len() {
            return Err(internal(format!(
                "rank {} access into '{array}' of rank {}",
                index.len(),
                extents.len()
            )));
        }
        let mut linear: i64 = 0;
        for (d, expr) in index.iter().enumerate() {
            let mut c = self.eval_i64(expr, frame)?;
            if checked && (c < 0 || c >= extents[d]) {
                self.raise_bound();
                c = 0;
            }
            linear = if d == 0 {
                c
            } else {
                linear.wrapping_mul(extents[d]).wrapping_add(c)
            };
        }
        let total = (self.bufs[slot].len() / width) as i64;
        if linear < 0 || linear >= total {
            return Err(OffloadError::device(format!(
                "access beyond the buffer of '{array}'"
            )));
        }
        Ok((slot, linear as usize))
    }

    fn read_slot(&self, slot: usize, elem: ScalarType, at: i64, array: &str) -> Result<Literal> {
        let total = (self.bufs[slot].len() / elem.byte_width()) as i64;
        if at < 0 || at >= total {
            return Err(OffloadError::device(format!(
                "access beyond the buffer of '{array}'"
            )));
        }
        Ok(read_elem(&self.bufs[slot], elem, at as usize))
    }

    fn unary_device(&mut self, op: UnOp, ty: ScalarType, value: Literal) -> Result<Literal> {
        match (op, ty) {
            (UnOp::Not, _) => {
                let b = value
                    .as_bool()
                    .ok_or_else(|| internal("boolean operand expected"))?;
                Ok(Literal::Bool(!b))
            }
            (UnOp::Neg, ScalarType::F64) => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| internal("float operand expected"))?;
                Ok(Literal::F64(-v))
            }
            (UnOp::Neg, ScalarType::I32) => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| internal("integer operand expected"))?;
                let v = self.sat32(0 - v);
                Ok(Literal::I32(v as i32))
            }
            (UnOp::Neg, ScalarType::I64) => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| internal("integer operand expected"))?;
                match v.checked_neg() {
                    Some(n) => Ok(Literal::I64(n)),
                    None => {
                        self.raise_overflow();
                        Ok(Literal::I64(i64::MAX))
                    }
                }
            }
            (op, ty) => Err(internal(format!("{op:?} at type {ty}"))),
        }
    }

    /// Arithmetic at the promoted node type with the saturate-and-flag
    /// behavior of the emitted helpers.
    fn binary_device(
        &mut self,
        op: BinOp,
        ty: ScalarType,
        l: Literal,
        r: Literal,
    ) -> Result<Literal> {
        if op.is_comparison() {
            return compare(op, l, r).map(Literal::Bool);
        }
        if ty == ScalarType::F64 {
            let a = l.as_f64().ok_or_else(|| internal("float operand expected"))?;
            let b = r.as_f64().ok_or_else(|| internal("float operand expected"))?;
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => return Err(internal(format!("'{}' on f64 operands", op.symbol()))),
            };
            return Ok(Literal::F64(v));
        }
        let a = l.as_i64().ok_or_else(|| internal("integer operand expected"))?;
        let b = r.as_i64().ok_or_else(|| internal("integer operand expected"))?;
        match ty {
            ScalarType::I64 => self.int64_op(op, a, b),
            ScalarType::I32 => self.int32_op(op, a, b),
            other => Err(internal(format!("'{}' at type {other}", op.symbol()))),
        }
    }

    fn int64_op(&mut self, op: BinOp, a: i64, b: i64) -> Result<Literal> {
        let v = match op {
            BinOp::Add => match a.checked_add(b) {
                Some(v) => v,
                None => {
                    self.raise_overflow();
                    if b > 0 {
                        i64::MAX
                    } else {
                        i64::MIN
                    }
                }
            },
            BinOp::Sub => match a.checked_sub(b) {
                Some(v) => v,
                None => {
                    self.raise_overflow();
                    if b > 0 {
                        i64::MIN
                    } else {
                        i64::MAX
                    }
                }
            },
            BinOp::Mul => match a.checked_mul(b) {
                Some(v) => v,
                None => {
                    self.raise_overflow();
                    if (a < 0) == (b < 0) {
                        i64::MAX
                    } else {
                        i64::MIN
                    }
                }
            },
            BinOp::Div => self.div_device(a, b, i64::MIN),
            BinOp::Mod => self.mod_device(a, b),
            other => {
                return Err(internal(format!(
                    "'{}' on integer operands",
                    other.symbol()
                )))
            }
        };
        Ok(Literal::I64(v))
    }

    /// i32 operands fit an i64 product, so the op runs wide and the result
    /// saturates back, like the generated helper.
    fn int32_op(&mut self, op: BinOp, a: i64, b: i64) -> Result<Literal> {
        let v = match op {
            BinOp::Add => self.sat32(a + b),
            BinOp::Sub => self.sat32(a - b),
            BinOp::Mul => self.sat32(a * b),
            BinOp::Div => self.div_device(a, b, i64::from(i32::MIN)),
            BinOp::Mod => self.mod_device(a, b),
            other => {
                return Err(internal(format!(
                    "'{}' on integer operands",
                    other.symbol()
                )))
            }
        };
        Ok(Literal::I32(v as i32))
    }

    fn sat32(&mut self, v: i64) -> i64 {
        const MAX: i64 = i32::MAX as i64;
        const MIN: i64 = i32::MIN as i64;
        if v > MAX {
            self.raise_overflow();
            MAX
        } else if v < MIN {
            self.raise_overflow();
            MIN
        } else {
            v
        }
    }

    /// Floored division with the device fallbacks: a zero divisor and the
    /// minimum-over-minus-one case flag and yield zero.
    fn div_device(&mut self, a: i64, b: i64, min: i64) -> i64 {
        if b == 0 {
            self.raise_overflow();
            return 0;
        }
        if a == min && b == -1 {
            self.raise_overflow();
            return 0;
        }
        let q = a / b;
        let rem = a % b;
        if rem != 0 && (rem < 0) != (b < 0) {
            q - 1
        } else {
            q
        }
    }

    fn mod_device(&mut self, a: i64, b: i64) -> i64 {
        if b == 0 {
            self.raise_overflow();
            return 0;
        }
        if b == -1 {
            return 0;
        }
        let rem = a % b;
        if rem != 0 && (rem < 0) != (b < 0) {
            rem + b
        } else {
            rem
        }
    }

    fn math_device(&mut self, func: MathFn, ty: ScalarType, args: &[Literal]) -> Result<Literal> {
        if args.len() != func.arity() {
            return Err(internal(format!(
                "math function '{}' takes {} arguments, got {}",
                func.name(),
                func.arity(),
                args.len()
            )));
        }
        if ty == ScalarType::F64 {
            let a = args[0]
                .as_f64()
                .ok_or_else(|| internal("float operand expected"))?;
            let v = match func {
                MathFn::Sqrt => a.sqrt(),
                MathFn::Fabs | MathFn::Abs => a.abs(),
                MathFn::Exp => a.exp(),
                MathFn::Log => a.ln(),
                MathFn::Sin => a.sin(),
                MathFn::Cos => a.cos(),
                MathFn::Floor => a.floor(),
                MathFn::Ceil => a.ceil(),
                MathFn::Pow | MathFn::Min | MathFn::Max => {
                    let b = args[1]
                        .as_f64()
                        .ok_or_else(|| internal("float operand expected"))?;
                    match func {
                        MathFn::Pow => a.powf(b),
                        MathFn::Min => a.min(b),
                        _ => a.max(b),
                    }
                }
            };
            return Ok(Literal::F64(v));
        }
        let a = args[0]
            .as_i64()
            .ok_or_else(|| internal("integer operand expected"))?;
        let v = match func {
            MathFn::Abs => {
                if ty == ScalarType::I32 {
                    if a == i64::from(i32::MIN) {
                        self.raise_overflow();
                        i64::from(i32::MAX)
                    } else {
                        a.abs()
                    }
                } else {
                    match a.checked_abs() {
                        Some(v) => v,
                        None => {
                            self.raise_overflow();
                            i64::MAX
                        }
                    }
                }
            }
            MathFn::Min | MathFn::Max => {
                let b = args[1]
                    .as_i64()
                    .ok_or_else(|| internal("integer operand expected"))?;
                if func == MathFn::Min {
                    a.min(b)
                } else {
                    a.max(b)
                }
            }
            other => {
                return Err(internal(format!(
                    "math function '{}' on integer operands",
                    other.name()
                )))
            }
        };
        match ty {
            ScalarType::I64 => Ok(Literal::I64(v)),
            ScalarType::I32 => Ok(Literal::I32(v as i32)),
            other => Err(internal(format!("integer math result of type {other}"))),
        }
    }

    fn eval_i64(&mut self, expr: &'k LExpr, frame: &mut Frame) -> Result<i64> {
        let value = self.eval(expr, frame)?;
        value
            .as_i64()
            .ok_or_else(|| internal(format!("integer expected, got {}", value.ty())))
    }

    fn eval_bool(&mut self, expr: &'k LExpr, frame: &mut Frame) -> Result<bool> {
        let value = self.eval(expr, frame)?;
        value
            .as_bool()
            .ok_or_else(|| internal(format!("condition is {}, not a boolean", value.ty())))
    }

    fn raise_bound(&mut self) {
        raise(&mut self.bufs[self.bind.bound_slot]);
    }

    fn raise_overflow(&mut self) {
        raise(&mut self.bufs[self.bind.overflow_slot]);
    }
}

fn raise(bytes: &mut [u8]) {
    if bytes.len() >= 8 {
        bytes[..8].copy_from_slice(&1i64.to_ne_bytes());
    }
}

fn internal(reason: impl Into<String>) -> OffloadError {
    OffloadError::unsupported("simulation", reason)
}

/// Exact widening along i32 -> i64 and i32 -> f64; identity otherwise.
fn widen(value: Literal, to: ScalarType) -> Result<Literal> {
    match (value, to) {
        (v, t) if v.ty() == t => Ok(v),
        (Literal::I32(v), ScalarType::I64) => Ok(Literal::I64(i64::from(v))),
        (Literal::I32(v), ScalarType::F64) => Ok(Literal::F64(f64::from(v))),
        (v, t) => Err(internal(format!("no implicit widening {} -> {t}", v.ty()))),
    }
}

fn compare(op: BinOp, lhs: Literal, rhs: Literal) -> Result<bool> {
    if let (Literal::Bool(l), Literal::Bool(r)) = (lhs, rhs) {
        return match op {
            BinOp::Eq => Ok(l == r),
            BinOp::Ne => Ok(l != r),
            _ => Err(internal(format!("'{}' cannot order booleans", op.symbol()))),
        };
    }
    let joined = lhs.ty().promote(rhs.ty())?;
    let ordering = if joined == ScalarType::F64 {
        let l = lhs.as_f64().ok_or_else(|| internal("float operand expected"))?;
        let r = rhs.as_f64().ok_or_else(|| internal("float operand expected"))?;
        l.partial_cmp(&r)
    } else {
        let l = lhs.as_i64().ok_or_else(|| internal("integer operand expected"))?;
        let r = rhs.as_i64().ok_or_else(|| internal("integer operand expected"))?;
        Some(l.cmp(&r))
    };
    // NaN compares false everywhere except `!=`.
    let Some(ordering) = ordering else {
        return Ok(op == BinOp::Ne);
    };
    Ok(match op {
        BinOp::Eq => ordering.is_eq(),
        BinOp::Ne => !ordering.is_eq(),
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => return Err(internal("comparison expected")),
    })
}

/// Explicit casts: truncation toward zero from f64, two's-complement wrap
/// on integer narrowing.
fn cast(value: Literal, to: ScalarType) -> Result<Literal> {
    let out = match (value, to) {
        (Literal::I32(v), ScalarType::I32) => Literal::I32(v),
        (Literal::I32(v), ScalarType::I64) => Literal::I64(i64::from(v)),
        (Literal::I32(v), ScalarType::F64) => Literal::F64(f64::from(v)),
        (Literal::I64(v), ScalarType::I32) => Literal::I32(v as i32),
        (Literal::I64(v), ScalarType::I64) => Literal::I64(v),
        (Literal::I64(v), ScalarType::F64) => Literal::F64(v as f64),
        (Literal::F64(v), ScalarType::I32) => Literal::I32(v as i32),
        (Literal::F64(v), ScalarType::I64) => Literal::I64(v as i64),
        (Literal::F64(v), ScalarType::F64) => Literal::F64(v),
        (v, t) => return Err(internal(format!("cast {} -> {t} is not defined", v.ty()))),
    };
    Ok(out)
}

fn read_elem(bytes: &[u8], elem: ScalarType, at: usize) -> Literal {
    let w = elem.byte_width();
    let src = &bytes[at * w..at * w + w];
    match elem {
        ScalarType::I32 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(src);
            Literal::I32(i32::from_ne_bytes(raw))
        }
        ScalarType::I64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            Literal::I64(i64::from_ne_bytes(raw))
        }
        ScalarType::F64 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            Literal::F64(f64::from_ne_bytes(raw))
        }
        ScalarType::Bool => Literal::Bool(src[0] != 0),
    }
}

fn write_elem(bytes: &mut [u8], elem: ScalarType, at: usize, value: Literal) -> Result<()> {
    let w = elem.byte_width();
    let dst = &mut bytes[at * w..at * w + w];
    match (elem, value) {
        (ScalarType::I32, Literal::I32(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (ScalarType::I64, Literal::I64(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (ScalarType::F64, Literal::F64(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (ScalarType::Bool, Literal::Bool(v)) => dst[0] = u8::from(v),
        (elem, value) => {
            return Err(internal(format!(
                "store of {} into a {elem} array",
                value.ty()
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generate;
    use parloop::analysis::build_plan;
    use parloop::exec::CheckConfig;
    use parloop::ir::program::{Expr, Function, LoopLevel, Program, Stmt};
    use parloop::options::LoopOptions;
    use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};

    fn build(program: &Program, bindings: &Bindings, checks: &CheckConfig) -> KernelBundle {
        let plan = build_plan(program, bindings, &LoopOptions::default()).unwrap();
        generate(program, &plan, checks).unwrap()
    }

    fn f64_bytes(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn i64_bytes(values: &[i64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn f64_back(bytes: &[u8]) -> Vec<f64> {
        bytes
            .chunks(8)
            .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn i64_back(bytes: &[u8]) -> Vec<i64> {
        bytes
            .chunks(8)
            .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn flag_value(driver: &SimDriver, device: &DeviceHandle, handle: Handle) -> i64 {
        let mut bytes = [0u8; 8];
        driver.download(device, handle, &mut bytes).unwrap();
        i64::from_ne_bytes(bytes)
    }

    /// Full-range launch arguments in kernel parameter order.
    fn launch_args(
        kernel: &LoweredKernel,
        buffers: &HashMap<&str, Handle>,
        scalars: &HashMap<&str, Literal>,
        extents: &HashMap<&str, Vec<i64>>,
        flags: (Handle, Handle),
        fold: (i64, i64),
    ) -> Vec<LaunchArg> {
        kernel
            .params
            .iter()
            .map(|p| match &p.kind {
                ParamKind::Array { .. } => LaunchArg::Buffer(buffers[p.name.as_str()]),
                ParamKind::Extent { array, dim } => {
                    LaunchArg::Scalar(Literal::I64(extents[array.as_str()][*dim]))
                }
                ParamKind::Scalar { .. } => LaunchArg::Scalar(scalars[p.name.as_str()]),
                ParamKind::Offset { .. } => LaunchArg::Scalar(Literal::I64(0)),
                ParamKind::Step { .. } => LaunchArg::Scalar(Literal::I64(1)),
                ParamKind::Half => LaunchArg::Scalar(Literal::I64(fold.0)),
                ParamKind::Count => LaunchArg::Scalar(Literal::I64(fold.1)),
                ParamKind::BoundFlag => LaunchArg::Buffer(flags.0),
                ParamKind::OverflowFlag => LaunchArg::Buffer(flags.1),
            })
            .collect()
    }

    fn gather_program() -> (Program, Bindings) {
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
                value: Expr::load(
                    "x",
                    vec![Expr::load("idx", vec![Expr::scalar("i")])],
                ),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("idx", ArrayRef::new(ArrayData::from_i64(vec![100, 1, 2, 3])))
            .unwrap();
        bindings
            .set_array(
                "x",
                ArrayRef::new(ArrayData::from_f64(vec![10.0, 20.0, 30.0, 40.0])),
            )
            .unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
            .unwrap();
        (program, bindings)
    }

    #[test]
    fn fixed_devices_in_a_stable_order() {
        let driver = SimDriver::new();
        let devices = driver.devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "SimGPU");
        assert_eq!(devices[0].class, DeviceClass::Gpu);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[1].name, "SimCPU");
        assert_eq!(devices[1].class, DeviceClass::Cpu);
        assert!(devices[0].limits.global_mem_bytes < devices[1].limits.global_mem_bytes);
    }

    #[test]
    fn saxpy_matches_the_sequential_result() {
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
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(8)).unwrap();
        bindings.set_scalar("a", Literal::F64(2.0)).unwrap();
        bindings
            .set_array("x", ArrayRef::new(ArrayData::from_f64(xs.clone())))
            .unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![1.0; 8])))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let x_h = driver.alloc(&gpu, 64).unwrap();
        driver.upload(&gpu, x_h, &f64_bytes(&xs)).unwrap();
        let y_h = driver.alloc(&gpu, 64).unwrap();
        driver.upload(&gpu, y_h, &f64_bytes(&[1.0; 8])).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("x", x_h), ("y", y_h)]);
        let scalars = HashMap::from([("a", Literal::F64(2.0)), ("n", Literal::I64(8))]);
        let extents = HashMap::from([("x", vec![8]), ("y", vec![8])]);
        let args = launch_args(&bundle.lowered, &buffers, &scalars, &extents, (bf, of), (0, 0));

        let time = driver.launch(&gpu, prog, &args, &[8], &[4]).unwrap();
        assert_eq!(time, Duration::from_nanos(GPU_BASE_NS + 8));

        let mut out = vec![0u8; 64];
        driver.download(&gpu, y_h, &mut out).unwrap();
        let want: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        assert_eq!(f64_back(&out), want);
        assert_eq!(flag_value(&driver, &gpu, bf), 0);
        assert_eq!(flag_value(&driver, &gpu, of), 0);
    }

    #[test]
    fn clamped_access_raises_the_bound_flag() {
        let (program, bindings) = gather_program();
        let bundle = build(&program, &bindings, &CheckConfig::All);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let idx_h = driver.alloc(&gpu, 32).unwrap();
        driver.upload(&gpu, idx_h, &i64_bytes(&[100, 1, 2, 3])).unwrap();
        let x_h = driver.alloc(&gpu, 32).unwrap();
        driver
            .upload(&gpu, x_h, &f64_bytes(&[10.0, 20.0, 30.0, 40.0]))
            .unwrap();
        let y_h = driver.alloc(&gpu, 32).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("idx", idx_h), ("x", x_h), ("y", y_h)]);
        let extents = HashMap::from([("idx", vec![4]), ("x", vec![4]), ("y", vec![4])]);
        let args = launch_args(
            &bundle.lowered,
            &buffers,
            &HashMap::new(),
            &extents,
            (bf, of),
            (0, 0),
        );
        driver.launch(&gpu, prog, &args, &[4], &[1]).unwrap();

        // Item 0 clamps its escaped index to zero and reads x[0].
        let mut out = vec![0u8; 32];
        driver.download(&gpu, y_h, &mut out).unwrap();
        assert_eq!(f64_back(&out), vec![10.0, 20.0, 30.0, 40.0]);
        assert_eq!(flag_value(&driver, &gpu, bf), 1);
        assert_eq!(flag_value(&driver, &gpu, of), 0);
    }

    #[test]
    fn unchecked_escape_faults_the_device() {
        let (program, bindings) = gather_program();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let idx_h = driver.alloc(&gpu, 32).unwrap();
        driver.upload(&gpu, idx_h, &i64_bytes(&[100, 1, 2, 3])).unwrap();
        let x_h = driver.alloc(&gpu, 32).unwrap();
        let y_h = driver.alloc(&gpu, 32).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("idx", idx_h), ("x", x_h), ("y", y_h)]);
        let extents = HashMap::from([("idx", vec![4]), ("x", vec![4]), ("y", vec![4])]);
        let args = launch_args(
            &bundle.lowered,
            &buffers,
            &HashMap::new(),
            &extents,
            (bf, of),
            (0, 0),
        );
        let err = driver.launch(&gpu, prog, &args, &[4], &[1]).unwrap_err();
        assert_eq!(err.class(), "device");
        assert!(!err.is_sticky());

        // The pool keeps the buffers; a later download still works.
        let mut out = vec![0u8; 32];
        driver.download(&gpu, y_h, &mut out).unwrap();
    }

    #[test]
    fn integer_overflow_saturates_and_flags() {
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
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("v", ArrayRef::new(ArrayData::from_i64(vec![i64::MAX; 4])))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let v_h = driver.alloc(&gpu, 32).unwrap();
        driver.upload(&gpu, v_h, &i64_bytes(&[i64::MAX; 4])).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("v", v_h)]);
        let extents = HashMap::from([("v", vec![4])]);
        let args = launch_args(
            &bundle.lowered,
            &buffers,
            &HashMap::new(),
            &extents,
            (bf, of),
            (0, 0),
        );
        driver.launch(&gpu, prog, &args, &[4], &[2]).unwrap();

        let mut out = vec![0u8; 32];
        driver.download(&gpu, v_h, &mut out).unwrap();
        assert_eq!(i64_back(&out), vec![i64::MAX; 4]);
        assert_eq!(flag_value(&driver, &gpu, of), 1);
        assert_eq!(flag_value(&driver, &gpu, bf), 0);
    }

    #[test]
    fn aliased_parameters_share_one_storage() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "shift",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(Expr::load("x", vec![Expr::scalar("i")]), Expr::f64(1.0)),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("x", ArrayRef::new(ArrayData::from_f64(vec![1.0, 2.0, 3.0, 4.0])))
            .unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        // Both names bind to one buffer, the way the broker stages an
        // alias group.
        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let shared = driver.alloc(&gpu, 32).unwrap();
        driver
            .upload(&gpu, shared, &f64_bytes(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("x", shared), ("y", shared)]);
        let extents = HashMap::from([("x", vec![4]), ("y", vec![4])]);
        let args = launch_args(
            &bundle.lowered,
            &buffers,
            &HashMap::new(),
            &extents,
            (bf, of),
            (0, 0),
        );
        driver.launch(&gpu, prog, &args, &[4], &[1]).unwrap();

        let mut out = vec![0u8; 32];
        driver.download(&gpu, shared, &mut out).unwrap();
        assert_eq!(f64_back(&out), vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn forwarded_scalars_reach_function_calls() {
        let scale = Function {
            name: "scale".into(),
            params: vec![("v".into(), ScalarType::F64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::mul(
                Expr::scalar("v"),
                Expr::scalar("alpha"),
            ))],
        };
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("alpha", ScalarType::F64)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "scaled",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::Call {
                    func: "scale".into(),
                    args: vec![Expr::load("y", vec![Expr::scalar("i")])],
                },
            }],
        )
        .with_functions(vec![scale]);
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_scalar("alpha", Literal::F64(3.0)).unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![1.0, 2.0, 3.0, 4.0])))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let y_h = driver.alloc(&gpu, 32).unwrap();
        driver
            .upload(&gpu, y_h, &f64_bytes(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("y", y_h)]);
        let scalars = HashMap::from([("alpha", Literal::F64(3.0))]);
        let extents = HashMap::from([("y", vec![4])]);
        let args = launch_args(&bundle.lowered, &buffers, &scalars, &extents, (bf, of), (0, 0));
        driver.launch(&gpu, prog, &args, &[4], &[1]).unwrap();

        let mut out = vec![0u8; 32];
        driver.download(&gpu, y_h, &mut out).unwrap();
        assert_eq!(f64_back(&out), vec![3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn zero_step_inner_loop_flags_and_does_nothing() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("stride", ScalarType::I64)
            .array("v", ScalarType::I64, 1);
        let program = Program::loop_nest(
            "strided",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::For {
                var: "k".into(),
                start: Expr::i64(0),
                stop: Expr::i64(10),
                step: Expr::scalar("stride"),
                body: vec![Stmt::Store {
                    array: "v".into(),
                    index: vec![Expr::scalar("i")],
                    value: Expr::scalar("k"),
                }],
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_scalar("stride", Literal::I64(3)).unwrap();
        bindings
            .set_array("v", ArrayRef::new(ArrayData::from_i64(vec![-1; 4])))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let v_h = driver.alloc(&gpu, 32).unwrap();
        driver.upload(&gpu, v_h, &i64_bytes(&[-1; 4])).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("v", v_h)]);
        let scalars = HashMap::from([("stride", Literal::I64(0))]);
        let extents = HashMap::from([("v", vec![4])]);
        let args = launch_args(&bundle.lowered, &buffers, &scalars, &extents, (bf, of), (0, 0));
        driver.launch(&gpu, prog, &args, &[4], &[1]).unwrap();

        let mut out = vec![0u8; 32];
        driver.download(&gpu, v_h, &mut out).unwrap();
        assert_eq!(i64_back(&out), vec![-1; 4]);
        assert_eq!(flag_value(&driver, &gpu, of), 1);
    }

    #[test]
    fn reduction_passes_fold_in_place() {
        let combine = Function {
            name: "combine".into(),
            params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::add(Expr::scalar("a"), Expr::scalar("b")))],
        };
        let symbols = SymbolTable::new().array("data", ScalarType::F64, 1);
        let program = Program::reduction("total", symbols, "data", combine);
        let values: Vec<f64> = (1..=8).map(f64::from).collect();
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings
            .set_array("data", ArrayRef::new(ArrayData::from_f64(values.clone())))
            .unwrap();
        let bundle = build(&program, &bindings, &CheckConfig::None);

        let driver = SimDriver::new();
        let gpu = driver.devices().unwrap().remove(0);
        let prog = driver.compile(&gpu, &bundle).unwrap();
        let data_h = driver.alloc(&gpu, 64).unwrap();
        driver.upload(&gpu, data_h, &f64_bytes(&values)).unwrap();
        let bf = driver.alloc(&gpu, 8).unwrap();
        let of = driver.alloc(&gpu, 8).unwrap();

        let buffers = HashMap::from([("data", data_h)]);
        let mut live = 8i64;
        while live > 1 {
            let half = (live + 1) / 2;
            let args = launch_args(
                &bundle.lowered,
                &buffers,
                &HashMap::new(),
                &HashMap::new(),
                (bf, of),
                (half, live),
            );
            driver
                .launch(&gpu, prog, &args, &[half as usize], &[1])
                .unwrap();
            live = half;
        }

        let mut out = vec![0u8; 64];
        driver.download(&gpu, data_h, &mut out).unwrap();
        assert_eq!(f64_back(&out)[0], 36.0);
    }

    #[test]
    fn allocation_respects_the_device_budget() {
        let driver = SimDriver::new();
        let devices = driver.devices().unwrap();
        let gpu = &devices[0];
        let a = driver.alloc(gpu, 1 << 27).unwrap();
        let _b = driver.alloc(gpu, 1 << 27).unwrap();
        let err = driver.alloc(gpu, 1).unwrap_err();
        assert_eq!(err.class(), "device");
        assert!(!err.is_sticky());
        driver.free(gpu, a);
        driver.alloc(gpu, 1 << 27).unwrap();

        // The CPU budget is independent of the GPU one.
        driver.alloc(&devices[1], 1 << 27).unwrap();
    }
}
