//! Tree-walking interpreter over the loop IR. This is the reference
//! semantics: every offloaded run must be indistinguishable from what this
//! module computes, including which calls fail and how.
//!
//! Guest numerics: i32/i64 add, sub, mul and negation are range-checked,
//! integer division and modulo are floored and reject a zero divisor, f64
//! follows IEEE. Scalar assignment shadows the activation record for the
//! rest of the call; bound storage is only mutated through array stores.

use std::collections::HashMap;

use parloop::error::{OffloadError, Result};
use parloop::exec::backend::{BaselineExecutor, Outcome};
use parloop::ir::program::{
    BinOp, Expr, Function, LoopNest, Program, ProgramKind, ReduceSpec, Stmt, UnOp,
};
use parloop::ir::types::{Literal, MathFn, ScalarType};
use parloop::symbols::Bindings;

/// Nested user-function calls deeper than this abort the run. The analysis
/// rejects recursion before offload; the baseline has to survive it too.
const MAX_CALL_DEPTH: u32 = 256;

/// The sequential execution engine.
#[derive(Debug, Default)]
pub struct HostExecutor;

impl HostExecutor {
    pub fn new() -> HostExecutor {
        HostExecutor
    }
}

impl BaselineExecutor for HostExecutor {
    fn execute(&self, program: &Program, bindings: &Bindings) -> Result<Outcome> {
        match &program.kind {
            ProgramKind::Loop(nest) => {
                run_nest(program, bindings, nest)?;
                Ok(Outcome::Unit)
            }
            ProgramKind::Reduce(spec) => {
                run_reduction(program, bindings, spec).map(Outcome::Value)
            }
        }
    }
}

fn run_nest(program: &Program, bindings: &Bindings, nest: &LoopNest) -> Result<()> {
    let mut frame = Frame::root(program, bindings);
    match frame.run_counted(
        &nest.level.var,
        &nest.level.start,
        &nest.level.stop,
        &nest.level.step,
        &nest.body,
    )? {
        Flow::Normal => Ok(()),
        Flow::Break | Flow::Return(_) => Err(internal("control escaped the loop nest")),
    }
}

fn run_reduction(program: &Program, bindings: &Bindings, spec: &ReduceSpec) -> Result<Literal> {
    let function = program
        .function(&spec.func)
        .ok_or_else(|| internal(format!("combining function '{}' is not declared", spec.func)))?;
    let array = bindings.array(&spec.array)?;
    let len = array.lock().len();
    if len == 0 {
        return Err(OffloadError::bound(
            &spec.array,
            "reduction over an empty array",
        ));
    }
    let frame = Frame::root(program, bindings);
    // Lock per element so a combiner is never run under the storage lock.
    let mut acc = array.lock().get(0);
    for i in 1..len {
        let elem = array.lock().get(i);
        acc = frame.call_function(function, vec![acc, elem])?;
    }
    Ok(acc)
}

enum Flow {
    Normal,
    Break,
    Return(Literal),
}

struct Frame<'p> {
    program: &'p Program,
    bindings: &'p Bindings,
    locals: HashMap<String, Literal>,
    depth: u32,
}

impl<'p> Frame<'p> {
    fn root(program: &'p Program, bindings: &'p Bindings) -> Frame<'p> {
        Frame {
            program,
            bindings,
            locals: HashMap::new(),
            depth: 0,
        }
    }

    /// A half-open counted loop in either direction. Range expressions are
    /// evaluated once, before the first iteration.
    fn run_counted(
        &mut self,
        var: &str,
        start: &Expr,
        stop: &Expr,
        step: &Expr,
        body: &[Stmt],
    ) -> Result<Flow> {
        let start = self.eval_i64(start)?;
        let stop = self.eval_i64(stop)?;
        let step = self.eval_i64(step)?;
        if step == 0 {
            return Err(OffloadError::overflow(format!(
                "loop over '{var}' has step zero"
            )));
        }
        let saved = self.locals.remove(var);
        let mut v = start;
        let mut flow = Flow::Normal;
        while (step > 0 && v < stop) || (step < 0 && v > stop) {
            self.locals.insert(var.to_string(), Literal::I64(v));
            match self.exec_body(body)? {
                Flow::Normal => {}
                Flow::Break => break,
                ret @ Flow::Return(_) => {
                    flow = ret;
                    break;
                }
            }
            v = v.checked_add(step).ok_or_else(|| {
                OffloadError::overflow(format!("loop variable '{var}' leaves the i64 range"))
            })?;
        }
        match saved {
            Some(prev) => {
                self.locals.insert(var.to_string(), prev);
            }
            None => {
                self.locals.remove(var);
            }
        }
        Ok(flow)
    }

    fn exec_body(&mut self, body: &[Stmt]) -> Result<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::DeclScalar { name, ty, init } => {
                match init {
                    Some(expr) => {
                        let value = widen(self.eval(expr)?, *ty)?;
                        self.locals.insert(name.clone(), value);
                    }
                    None => {
                        // A bare declaration only zeroes on first reach,
                        // matching the hoisted form the generator emits.
                        self.locals
                            .entry(name.clone())
                            .or_insert_with(|| Literal::zero(*ty));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::AssignScalar { name, value } => {
                let target = match self.locals.get(name) {
                    Some(current) => current.ty(),
                    None => self
                        .program
                        .symbols
                        .scalar_type(name)
                        .ok_or_else(|| internal(format!("assignment to undeclared '{name}'")))?,
                };
                let value = widen(self.eval(value)?, target)?;
                self.locals.insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Store {
                array,
                index,
                value,
            } => {
                let idx = self.eval_index(array, index)?;
                let value = self.eval(value)?;
                let storage = self.bindings.array(array)?;
                let mut data = storage.lock();
                let flat = data.flatten(&idx).ok_or_else(|| {
                    OffloadError::bound(
                        array,
                        format!("index {idx:?} is outside extents {:?}", data.dims),
                    )
                })?;
                let value = widen(value, data.elem())?;
                data.set(flat, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval_bool(cond)? {
                    self.exec_body(then_body)
                } else {
                    self.exec_body(else_body)
                }
            }
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => match self.run_counted(var, start, stop, step, body)? {
                // A break inside the loop body stops this loop only.
                Flow::Normal | Flow::Break => Ok(Flow::Normal),
                ret @ Flow::Return(_) => Ok(ret),
            },
            Stmt::While { cond, body } => {
                loop {
                    if !self.eval_bool(cond)? {
                        break;
                    }
                    match self.exec_body(body)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Return(value) => {
                let value = self.eval(value)?;
                Ok(Flow::Return(value))
            }
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Literal> {
        match expr {
            Expr::Const(lit) => Ok(*lit),
            Expr::Scalar(name) => match self.locals.get(name) {
                Some(value) => Ok(*value),
                None => self.bindings.scalar(name),
            },
            Expr::Load { array, index } => {
                let idx = self.eval_index(array, index)?;
                let storage = self.bindings.array(array)?;
                let data = storage.lock();
                let flat = data.flatten(&idx).ok_or_else(|| {
                    OffloadError::bound(
                        array,
                        format!("index {idx:?} is outside extents {:?}", data.dims),
                    )
                })?;
                Ok(data.get(flat))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                eval_unary(*op, value)
            }
            Expr::Binary { op, lhs, rhs } => {
                // Logical operators short-circuit like the generated code.
                if op.is_logical() {
                    let l = self.eval_bool(lhs)?;
                    return match op {
                        BinOp::And if !l => Ok(Literal::Bool(false)),
                        BinOp::Or if l => Ok(Literal::Bool(true)),
                        _ => Ok(Literal::Bool(self.eval_bool(rhs)?)),
                    };
                }
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                eval_binary(*op, l, r)
            }
            Expr::Math { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                eval_math(*func, &values)
            }
            Expr::Call { func, args } => {
                let function = self
                    .program
                    .function(func)
                    .ok_or_else(|| internal(format!("call of undeclared function '{func}'")))?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call_function(function, values)
            }
            Expr::Cast { to, operand } => {
                let value = self.eval(operand)?;
                eval_cast(value, *to)
            }
        }
    }

    fn call_function(&self, function: &Function, args: Vec<Literal>) -> Result<Literal> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(OffloadError::unsupported(
                "interpretation",
                format!("call depth limit reached in '{}'", function.name),
            ));
        }
        let mut frame = Frame {
            program: self.program,
            bindings: self.bindings,
            locals: HashMap::with_capacity(function.params.len()),
            depth: self.depth + 1,
        };
        for ((name, ty), value) in function.params.iter().zip(args) {
            frame.locals.insert(name.clone(), widen(value, *ty)?);
        }
        match frame.exec_body(&function.body)? {
            Flow::Return(value) => widen(value, function.ret),
            Flow::Normal | Flow::Break => Err(internal(format!(
                "function '{}' ended without a return",
                function.name
            ))),
        }
    }

    fn eval_index(&self, array: &str, index: &[Expr]) -> Result<Vec<i64>> {
        let mut idx = Vec::with_capacity(index.len());
        for expr in index {
            let value = self.eval(expr)?;
            idx.push(value.as_i64().ok_or_else(|| {
                internal(format!("index into '{array}' is {}, not an integer", value.ty()))
            })?);
        }
        Ok(idx)
    }

    fn eval_i64(&self, expr: &Expr) -> Result<i64> {
        let value = self.eval(expr)?;
        value
            .as_i64()
            .ok_or_else(|| internal(format!("loop bound is {}, not an integer", value.ty())))
    }

    fn eval_bool(&self, expr: &Expr) -> Result<bool> {
        let value = self.eval(expr)?;
        value
            .as_bool()
            .ok_or_else(|| internal(format!("condition is {}, not a boolean", value.ty())))
    }
}

/// Type-rule breaches the validator should have rejected up front.
fn internal(reason: impl Into<String>) -> OffloadError {
    OffloadError::unsupported("interpretation", reason)
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

fn eval_unary(op: UnOp, value: Literal) -> Result<Literal> {
    match (op, value) {
        (UnOp::Neg, Literal::I32(v)) => v
            .checked_neg()
            .map(Literal::I32)
            .ok_or_else(|| OffloadError::overflow("negation leaves the i32 range")),
        (UnOp::Neg, Literal::I64(v)) => v
            .checked_neg()
            .map(Literal::I64)
            .ok_or_else(|| OffloadError::overflow("negation leaves the i64 range")),
        (UnOp::Neg, Literal::F64(v)) => Ok(Literal::F64(-v)),
        (UnOp::Not, Literal::Bool(v)) => Ok(Literal::Bool(!v)),
        (op, v) => Err(internal(format!("{op:?} applied to {}", v.ty()))),
    }
}

fn eval_binary(op: BinOp, lhs: Literal, rhs: Literal) -> Result<Literal> {
    if op.is_comparison() {
        return compare(op, lhs, rhs).map(Literal::Bool);
    }
    let joined = lhs.ty().promote(rhs.ty())?;
    if joined == ScalarType::F64 {
        let l = lhs.as_f64().ok_or_else(|| internal("float operand expected"))?;
        let r = rhs.as_f64().ok_or_else(|| internal("float operand expected"))?;
        let v = match op {
            BinOp::Add => l + r,
            BinOp::Sub => l - r,
            BinOp::Mul => l * r,
            BinOp::Div => l / r,
            _ => return Err(internal(format!("'{}' on f64 operands", op.symbol()))),
        };
        return Ok(Literal::F64(v));
    }
    let l = lhs.as_i64().ok_or_else(|| internal("integer operand expected"))?;
    let r = rhs.as_i64().ok_or_else(|| internal("integer operand expected"))?;
    let v = match op {
        BinOp::Add => checked(l.checked_add(r), op, joined)?,
        BinOp::Sub => checked(l.checked_sub(r), op, joined)?,
        BinOp::Mul => checked(l.checked_mul(r), op, joined)?,
        BinOp::Div => floored_div(l, r)?,
        BinOp::Mod => floored_mod(l, r)?,
        _ => return Err(internal(format!("'{}' on integer operands", op.symbol()))),
    };
    narrow_int(v, joined, op)
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
    // NaN compares false everywhere except `!=`, matching the device.
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

fn checked(value: Option<i64>, op: BinOp, joined: ScalarType) -> Result<i64> {
    value.ok_or_else(|| {
        OffloadError::overflow(format!("'{}' leaves the {joined} range", op.symbol()))
    })
}

/// Quotient rounded toward negative infinity, the guest's `//`.
fn floored_div(l: i64, r: i64) -> Result<i64> {
    if r == 0 {
        return Err(OffloadError::overflow("integer division by zero"));
    }
    if l == i64::MIN && r == -1 {
        return Err(OffloadError::overflow("'/' leaves the i64 range"));
    }
    let q = l / r;
    let rem = l % r;
    Ok(if rem != 0 && (rem < 0) != (r < 0) { q - 1 } else { q })
}

/// Remainder with the divisor's sign, the guest's `%`.
fn floored_mod(l: i64, r: i64) -> Result<i64> {
    if r == 0 {
        return Err(OffloadError::overflow("integer modulo by zero"));
    }
    if r == -1 {
        return Ok(0);
    }
    let rem = l % r;
    Ok(if rem != 0 && (rem < 0) != (r < 0) { rem + r } else { rem })
}

/// Fold an i64 intermediate back into the joined operand type.
fn narrow_int(value: i64, joined: ScalarType, op: BinOp) -> Result<Literal> {
    match joined {
        ScalarType::I64 => Ok(Literal::I64(value)),
        ScalarType::I32 => i32::try_from(value).map(Literal::I32).map_err(|_| {
            OffloadError::overflow(format!("'{}' leaves the i32 range", op.symbol()))
        }),
        other => Err(internal(format!("integer result of type {other}"))),
    }
}

fn eval_math(func: MathFn, args: &[Literal]) -> Result<Literal> {
    if args.len() != func.arity() {
        return Err(internal(format!(
            "math function '{}' takes {} arguments, got {}",
            func.name(),
            func.arity(),
            args.len()
        )));
    }
    let mut joined = args[0].ty();
    for arg in &args[1..] {
        joined = joined.promote(arg.ty())?;
    }
    func.result_type(joined)?;
    if joined == ScalarType::F64 {
        let a = args[0].as_f64().ok_or_else(|| internal("float operand expected"))?;
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
                let b = args[1].as_f64().ok_or_else(|| internal("float operand expected"))?;
                match func {
                    MathFn::Pow => a.powf(b),
                    MathFn::Min => a.min(b),
                    _ => a.max(b),
                }
            }
        };
        return Ok(Literal::F64(v));
    }
    let a = args[0].as_i64().ok_or_else(|| internal("integer operand expected"))?;
    let v = match func {
        MathFn::Abs => a.checked_abs().ok_or_else(|| {
            OffloadError::overflow(format!("'abs' leaves the {joined} range"))
        })?,
        MathFn::Min | MathFn::Max => {
            let b = args[1].as_i64().ok_or_else(|| internal("integer operand expected"))?;
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
    match joined {
        ScalarType::I64 => Ok(Literal::I64(v)),
        ScalarType::I32 => i32::try_from(v).map(Literal::I32).map_err(|_| {
            OffloadError::overflow(format!("'{}' leaves the i32 range", func.name()))
        }),
        other => Err(internal(format!("integer math result of type {other}"))),
    }
}

/// Explicit casts follow the generated C: truncation toward zero from f64,
/// two's-complement wrap on integer narrowing.
fn eval_cast(value: Literal, to: ScalarType) -> Result<Literal> {
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
