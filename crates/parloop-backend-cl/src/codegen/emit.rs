//! OpenCL C source from the lowered tree.
//!
//! Integer arithmetic goes through checked helpers that saturate and raise
//! the overflow flag instead of wrapping, and bound-checked accesses clamp
//! through `bc` so a violating work item never touches memory out of range.
//! The helpers are emitted on demand, only when an expression needs them.

use std::collections::BTreeSet;

use parloop::analysis::reduction::ReductionKind;
use parloop::ir::program::{BinOp, UnOp};
use parloop::ir::types::{Literal, MathFn, ScalarType};

use super::lower::{
    Combine, KernelBody, LExpr, LFunction, LStmt, LoweredKernel, LoweredLoop, LoweredReduce,
    ParamKind,
};
use super::utils::{literal_text, push_block, push_line};

/// Render a lowered kernel as one self-contained OpenCL C translation unit.
pub(super) fn emit(kernel: &LoweredKernel) -> String {
    let mut em = Emitter {
        kernel,
        helpers: BTreeSet::new(),
        uses_f64: false,
        fors: 0,
    };
    let mut functions = String::new();
    let body = match &kernel.body {
        KernelBody::Loop(body) => {
            for f in &body.functions {
                em.function(f, &mut functions);
            }
            em.loop_kernel(body)
        }
        KernelBody::Reduce(red) => {
            if let Combine::Custom(f) = &red.combine {
                em.function(f, &mut functions);
            }
            em.reduce_kernel(red)
        }
    };

    let mut out = String::new();
    if em.uses_f64 {
        out.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n\n");
    }
    for helper in &em.helpers {
        push_block(&mut out, 0, helper.definition());
        out.push('\n');
    }
    out.push_str(&functions);
    out.push_str(&body);
    out
}

/// Runtime support routines, emitted in this order when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Helper {
    BoundCheck,
    AddI32,
    SubI32,
    MulI32,
    DivI32,
    ModI32,
    AbsI32,
    AddI64,
    SubI64,
    MulI64,
    DivI64,
    ModI64,
    AbsI64,
}

impl Helper {
    fn name(self) -> &'static str {
        match self {
            Helper::BoundCheck => "bc",
            Helper::AddI32 => "ck_add_i32",
            Helper::SubI32 => "ck_sub_i32",
            Helper::MulI32 => "ck_mul_i32",
            Helper::DivI32 => "dv_i32",
            Helper::ModI32 => "md_i32",
            Helper::AbsI32 => "ab_i32",
            Helper::AddI64 => "ck_add_i64",
            Helper::SubI64 => "ck_sub_i64",
            Helper::MulI64 => "ck_mul_i64",
            Helper::DivI64 => "dv_i64",
            Helper::ModI64 => "md_i64",
            Helper::AbsI64 => "ab_i64",
        }
    }

    fn definition(self) -> &'static str {
        match self {
            Helper::BoundCheck => {
                r"
                static long bc(__global long *flag, long idx, long extent) {
                  if (idx < 0 || idx >= extent) {
                    *flag = 1;
                    return 0;
                  }
                  return idx;
                }"
            }
            // The i32 helpers compute in long, where no i32 pair can
            // overflow, then saturate at the i32 bounds.
            Helper::AddI32 => {
                r"
                static int ck_add_i32(__global long *flag, int a, int b) {
                  long r = (long)a + (long)b;
                  if (r > 2147483647L) { *flag = 1; return 2147483647; }
                  if (r < -2147483648L) { *flag = 1; return (-2147483647 - 1); }
                  return (int)r;
                }"
            }
            Helper::SubI32 => {
                r"
                static int ck_sub_i32(__global long *flag, int a, int b) {
                  long r = (long)a - (long)b;
                  if (r > 2147483647L) { *flag = 1; return 2147483647; }
                  if (r < -2147483648L) { *flag = 1; return (-2147483647 - 1); }
                  return (int)r;
                }"
            }
            Helper::MulI32 => {
                r"
                static int ck_mul_i32(__global long *flag, int a, int b) {
                  long r = (long)a * (long)b;
                  if (r > 2147483647L) { *flag = 1; return 2147483647; }
                  if (r < -2147483648L) { *flag = 1; return (-2147483647 - 1); }
                  return (int)r;
                }"
            }
            Helper::DivI32 => {
                r"
                static int dv_i32(__global long *flag, int a, int b) {
                  if (b == 0) {
                    *flag = 1;
                    return 0;
                  }
                  if (a == (-2147483647 - 1) && b == -1) {
                    *flag = 1;
                    return 0;
                  }
                  int q = a / b;
                  if ((a % b != 0) && ((a < 0) != (b < 0))) {
                    q -= 1;
                  }
                  return q;
                }"
            }
            Helper::ModI32 => {
                r"
                static int md_i32(__global long *flag, int a, int b) {
                  if (b == 0) {
                    *flag = 1;
                    return 0;
                  }
                  if (b == -1) {
                    return 0;
                  }
                  int r = a % b;
                  if (r != 0 && ((r < 0) != (b < 0))) {
                    r += b;
                  }
                  return r;
                }"
            }
            Helper::AbsI32 => {
                r"
                static int ab_i32(__global long *flag, int a) {
                  if (a == (-2147483647 - 1)) {
                    *flag = 1;
                    return 2147483647;
                  }
                  return a < 0 ? -a : a;
                }"
            }
            // Signed overflow is undefined in C, so the i64 helpers detect
            // it on the unsigned wrap of the result.
            Helper::AddI64 => {
                r"
                static long ck_add_i64(__global long *flag, long a, long b) {
                  long r = (long)((ulong)a + (ulong)b);
                  if ((b > 0 && r < a) || (b < 0 && r > a)) {
                    *flag = 1;
                    return b > 0 ? 9223372036854775807L : (-9223372036854775807L - 1L);
                  }
                  return r;
                }"
            }
            Helper::SubI64 => {
                r"
                static long ck_sub_i64(__global long *flag, long a, long b) {
                  long r = (long)((ulong)a - (ulong)b);
                  if ((b > 0 && r > a) || (b < 0 && r < a)) {
                    *flag = 1;
                    return b > 0 ? (-9223372036854775807L - 1L) : 9223372036854775807L;
                  }
                  return r;
                }"
            }
            Helper::MulI64 => {
                r"
                static long ck_mul_i64(__global long *flag, long a, long b) {
                  if (a == 0 || b == 0) {
                    return 0;
                  }
                  if (a == (-9223372036854775807L - 1L) || b == (-9223372036854775807L - 1L)) {
                    if (a == 1L) { return b; }
                    if (b == 1L) { return a; }
                    *flag = 1;
                    return ((a < 0) == (b < 0)) ? 9223372036854775807L : (-9223372036854775807L - 1L);
                  }
                  long r = (long)((ulong)a * (ulong)b);
                  if (r / b != a) {
                    *flag = 1;
                    return ((a < 0) == (b < 0)) ? 9223372036854775807L : (-9223372036854775807L - 1L);
                  }
                  return r;
                }"
            }
            Helper::DivI64 => {
                r"
                static long dv_i64(__global long *flag, long a, long b) {
                  if (b == 0) {
                    *flag = 1;
                    return 0;
                  }
                  if (a == (-9223372036854775807L - 1L) && b == -1L) {
                    *flag = 1;
                    return 0;
                  }
                  long q = a / b;
                  if ((a % b != 0) && ((a < 0) != (b < 0))) {
                    q -= 1;
                  }
                  return q;
                }"
            }
            Helper::ModI64 => {
                r"
                static long md_i64(__global long *flag, long a, long b) {
                  if (b == 0) {
                    *flag = 1;
                    return 0;
                  }
                  if (b == -1L) {
                    return 0;
                  }
                  long r = a % b;
                  if (r != 0 && ((r < 0) != (b < 0))) {
                    r += b;
                  }
                  return r;
                }"
            }
            Helper::AbsI64 => {
                r"
                static long ab_i64(__global long *flag, long a) {
                  if (a == (-9223372036854775807L - 1L)) {
                    *flag = 1;
                    return 9223372036854775807L;
                  }
                  return a < 0L ? -a : a;
                }"
            }
        }
    }
}

struct Emitter<'k> {
    kernel: &'k LoweredKernel,
    helpers: BTreeSet<Helper>,
    uses_f64: bool,
    /// Numbers the hoisted loop-bound temporaries across the whole unit.
    fors: usize,
}

impl Emitter<'_> {
    fn cty(&mut self, ty: ScalarType) -> &'static str {
        if ty == ScalarType::F64 {
            self.uses_f64 = true;
        }
        ty.cl_name()
    }

    fn need(&mut self, helper: Helper) -> &'static str {
        self.helpers.insert(helper);
        helper.name()
    }

    fn callee(&self, func: &str) -> Option<&LFunction> {
        let functions: &[LFunction] = match &self.kernel.body {
            KernelBody::Loop(body) => &body.functions,
            KernelBody::Reduce(red) => match &red.combine {
                Combine::Custom(f) => std::slice::from_ref(f),
                Combine::Builtin(_) => &[],
            },
        };
        functions.iter().find(|f| f.name == func)
    }

    /// Forwarded trailing arguments of a helper call: the arrays it reads
    /// with their extents, its scalar extras, and the runtime flags.
    fn call_tail(&self, func: &str) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(f) = self.callee(func) {
            for (name, _, rank) in &f.arrays {
                parts.push(name.clone());
                for d in 0..*rank {
                    parts.push(format!("{name}_dim{d}"));
                }
            }
            for (name, _) in &f.extras {
                parts.push(name.clone());
            }
        }
        parts.push("gv_bound_flag".to_string());
        parts.push("gv_overflow_flag".to_string());
        parts
    }

    fn param_list(&mut self) -> Vec<String> {
        let params = self.kernel.params.clone();
        params
            .iter()
            .map(|p| match &p.kind {
                ParamKind::Array { elem, .. } => {
                    format!("__global {} *{}", self.cty(*elem), p.name)
                }
                ParamKind::Extent { .. }
                | ParamKind::Offset { .. }
                | ParamKind::Step { .. }
                | ParamKind::Half
                | ParamKind::Count => format!("const long {}", p.name),
                ParamKind::Scalar { ty, assigned } => {
                    let c = self.cty(*ty);
                    if *assigned {
                        format!("{c} {}", p.name)
                    } else {
                        format!("const {c} {}", p.name)
                    }
                }
                ParamKind::BoundFlag | ParamKind::OverflowFlag => {
                    format!("__global long *{}", p.name)
                }
            })
            .collect()
    }

    fn loop_kernel(&mut self, body: &LoweredLoop) -> String {
        let mut out = String::new();
        let params = self.param_list();
        push_line(
            &mut out,
            0,
            &format!("__kernel void {}({}) {{", self.kernel.entry, params.join(", ")),
        );
        for (d, var) in body.level_vars.iter().enumerate() {
            push_line(
                &mut out,
                1,
                &format!("long {var} = (long)get_global_id({d}) * gv_step{d} + gv_off{d};"),
            );
        }
        for (name, ty) in &body.decls {
            let c = self.cty(*ty);
            push_line(&mut out, 1, &format!("{c} {name} = 0;"));
        }
        self.body(&body.stmts, &mut out, 1);
        push_line(&mut out, 0, "}");
        out
    }

    fn reduce_kernel(&mut self, red: &LoweredReduce) -> String {
        let mut out = String::new();
        let params = self.param_list();
        push_line(
            &mut out,
            0,
            &format!("__kernel void {}({}) {{", self.kernel.entry, params.join(", ")),
        );
        push_line(&mut out, 1, "long gv_i = (long)get_global_id(0);");
        push_line(&mut out, 1, "if (gv_i < gv_half && gv_i + gv_half < gv_n) {");
        let a = format!("{}[gv_i]", red.array);
        let b = format!("{}[gv_i + gv_half]", red.array);
        let combined = self.combine_text(red, &a, &b);
        push_line(&mut out, 2, &format!("{}[gv_i] = {combined};", red.array));
        push_line(&mut out, 1, "}");
        push_line(&mut out, 0, "}");
        out
    }

    fn combine_text(&mut self, red: &LoweredReduce, a: &str, b: &str) -> String {
        let custom = match &red.combine {
            Combine::Builtin(kind) => {
                return match (kind, red.elem) {
                    (ReductionKind::Add, ScalarType::F64) => format!("({a}) + ({b})"),
                    (ReductionKind::Mul, ScalarType::F64) => format!("({a}) * ({b})"),
                    (ReductionKind::Min, ScalarType::F64) => format!("fmin({a}, {b})"),
                    (ReductionKind::Max, ScalarType::F64) => format!("fmax({a}, {b})"),
                    (ReductionKind::Min, _) => format!("min({a}, {b})"),
                    (ReductionKind::Max, _) => format!("max({a}, {b})"),
                    (kind, elem) => {
                        let helper = match (kind, elem == ScalarType::I32) {
                            (ReductionKind::Add, true) => Helper::AddI32,
                            (ReductionKind::Add, false) => Helper::AddI64,
                            (_, true) => Helper::MulI32,
                            (_, false) => Helper::MulI64,
                        };
                        format!("{}(gv_overflow_flag, {a}, {b})", self.need(helper))
                    }
                };
            }
            Combine::Custom(f) => f,
        };
        let mut parts = vec![a.to_string(), b.to_string()];
        parts.extend(self.call_tail(&custom.name));
        format!("fn_{}({})", custom.name, parts.join(", "))
    }

    fn function(&mut self, f: &LFunction, out: &mut String) {
        let ret = self.cty(f.ret);
        let mut params = Vec::new();
        for (name, ty) in &f.params {
            let c = self.cty(*ty);
            params.push(format!("{c} {name}"));
        }
        for (name, elem, rank) in &f.arrays {
            let c = self.cty(*elem);
            params.push(format!("__global {c} *{name}"));
            for d in 0..*rank {
                params.push(format!("const long {name}_dim{d}"));
            }
        }
        for (name, ty) in &f.extras {
            let c = self.cty(*ty);
            params.push(format!("{c} {name}"));
        }
        params.push("__global long *gv_bound_flag".to_string());
        params.push("__global long *gv_overflow_flag".to_string());
        push_line(
            out,
            0,
            &format!("static {ret} fn_{}({}) {{", f.name, params.join(", ")),
        );
        for (name, ty) in &f.decls {
            let c = self.cty(*ty);
            push_line(out, 1, &format!("{c} {name} = 0;"));
        }
        self.body(&f.body, out, 1);
        push_line(out, 0, "}");
        out.push('\n');
    }

    fn body(&mut self, stmts: &[LStmt], out: &mut String, indent: usize) {
        for stmt in stmts {
            self.stmt(stmt, out, indent);
        }
    }

    fn stmt(&mut self, stmt: &LStmt, out: &mut String, indent: usize) {
        match stmt {
            LStmt::Assign { name, value, .. } => {
                let v = self.expr(value);
                push_line(out, indent, &format!("{name} = {v};"));
            }
            LStmt::Store {
                array,
                index,
                checked,
                value,
                ..
            } => {
                let idx = self.linear(array, index, *checked);
                let v = self.expr(value);
                push_line(out, indent, &format!("{array}[{idx}] = {v};"));
            }
            LStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.expr(cond);
                push_line(out, indent, &format!("if ({c}) {{"));
                self.body(then_body, out, indent + 1);
                if else_body.is_empty() {
                    push_line(out, indent, "}");
                } else {
                    push_line(out, indent, "} else {");
                    self.body(else_body, out, indent + 1);
                    push_line(out, indent, "}");
                }
            }
            LStmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => self.for_stmt(var, start, stop, step, body, out, indent),
            LStmt::While { cond, body } => {
                let c = self.expr(cond);
                push_line(out, indent, &format!("while ({c}) {{"));
                self.body(body, out, indent + 1);
                push_line(out, indent, "}");
            }
            LStmt::Break => push_line(out, indent, "break;"),
            LStmt::Return(value) => {
                let v = self.expr(value);
                push_line(out, indent, &format!("return {v};"));
            }
        }
    }

    /// Bounds are hoisted so they are evaluated once, and the step decides
    /// the loop direction. A step that is only known at run time guards
    /// against zero, which would never terminate.
    #[allow(clippy::too_many_arguments)]
    fn for_stmt(
        &mut self,
        var: &str,
        start: &LExpr,
        stop: &LExpr,
        step: &LExpr,
        body: &[LStmt],
        out: &mut String,
        indent: usize,
    ) {
        let k = self.fors;
        self.fors += 1;
        let s = self.expr(start);
        let e = self.expr(stop);
        let t = self.expr(step);
        push_line(out, indent, &format!("long gv_s{k} = (long)({s});"));
        push_line(out, indent, &format!("long gv_e{k} = (long)({e});"));
        push_line(out, indent, &format!("long gv_t{k} = (long)({t});"));
        match const_step(step) {
            Some(v) if v > 0 => {
                push_line(
                    out,
                    indent,
                    &format!("for (long {var} = gv_s{k}; {var} < gv_e{k}; {var} += gv_t{k}) {{"),
                );
                self.body(body, out, indent + 1);
                push_line(out, indent, "}");
            }
            Some(v) if v < 0 => {
                push_line(
                    out,
                    indent,
                    &format!("for (long {var} = gv_s{k}; {var} > gv_e{k}; {var} += gv_t{k}) {{"),
                );
                self.body(body, out, indent + 1);
                push_line(out, indent, "}");
            }
            Some(_) => {
                push_line(out, indent, "*gv_overflow_flag = 1;");
            }
            None => {
                push_line(out, indent, &format!("if (gv_t{k} == 0) {{"));
                push_line(out, indent + 1, "*gv_overflow_flag = 1;");
                push_line(out, indent, "} else {");
                push_line(
                    out,
                    indent + 1,
                    &format!(
                        "for (long {var} = gv_s{k}; (gv_t{k} > 0) ? ({var} < gv_e{k}) : ({var} > gv_e{k}); {var} += gv_t{k}) {{"
                    ),
                );
                self.body(body, out, indent + 2);
                push_line(out, indent + 1, "}");
                push_line(out, indent, "}");
            }
        }
    }

    /// Row-major flattening of a multi-dimensional access. Checked
    /// accesses route every coordinate through `bc`.
    fn linear(&mut self, array: &str, index: &[LExpr], checked: bool) -> String {
        let mut parts = Vec::with_capacity(index.len());
        for idx in index {
            let text = self.expr(idx);
            parts.push(if checked {
                let name = self.need(Helper::BoundCheck);
                format!("{name}(gv_bound_flag, {text}, {array}_dim{d})", d = parts.len())
            } else {
                format!("({text})")
            });
        }
        let mut acc = parts[0].clone();
        for (d, part) in parts.iter().enumerate().skip(1) {
            acc = format!("({acc}) * {array}_dim{d} + {part}");
        }
        acc
    }

    fn expr(&mut self, expr: &LExpr) -> String {
        match expr {
            LExpr::Const(lit) => {
                if lit.ty() == ScalarType::F64 {
                    self.uses_f64 = true;
                }
                literal_text(*lit)
            }
            LExpr::Scalar(name) => name.clone(),
            LExpr::Load {
                array,
                index,
                checked,
                ..
            } => {
                let idx = self.linear(array, index, *checked);
                format!("{array}[{idx}]")
            }
            LExpr::Unary { op, ty, operand } => {
                let x = self.expr(operand);
                match op {
                    UnOp::Not => format!("(!({x}))"),
                    UnOp::Neg if *ty == ScalarType::F64 => format!("(-({x}))"),
                    UnOp::Neg => {
                        let (helper, zero) = if *ty == ScalarType::I32 {
                            (Helper::SubI32, "0")
                        } else {
                            (Helper::SubI64, "0L")
                        };
                        format!("{}(gv_overflow_flag, {zero}, {x})", self.need(helper))
                    }
                }
            }
            LExpr::Binary { op, ty, lhs, rhs } => {
                let l = self.expr(lhs);
                let r = self.expr(rhs);
                if op.is_logical() || op.is_comparison() || *ty == ScalarType::F64 {
                    return format!("(({l}) {} ({r}))", op.symbol());
                }
                let narrow = *ty == ScalarType::I32;
                let helper = match op {
                    BinOp::Add if narrow => Helper::AddI32,
                    BinOp::Add => Helper::AddI64,
                    BinOp::Sub if narrow => Helper::SubI32,
                    BinOp::Sub => Helper::SubI64,
                    BinOp::Mul if narrow => Helper::MulI32,
                    BinOp::Mul => Helper::MulI64,
                    BinOp::Div if narrow => Helper::DivI32,
                    BinOp::Div => Helper::DivI64,
                    BinOp::Mod if narrow => Helper::ModI32,
                    BinOp::Mod => Helper::ModI64,
                    other => {
                        // Comparisons and logic were handled above.
                        return format!("(({l}) {} ({r}))", other.symbol());
                    }
                };
                format!("{}(gv_overflow_flag, {l}, {r})", self.need(helper))
            }
            LExpr::Math { func, ty, args } => self.math(*func, *ty, args),
            LExpr::Call { func, args } => {
                let mut parts: Vec<String> =
                    args.iter().map(|a| self.expr(a)).collect();
                parts.extend(self.call_tail(func));
                format!("fn_{func}({})", parts.join(", "))
            }
            LExpr::Cast { to, operand } => {
                let x = self.expr(operand);
                let c = self.cty(*to);
                format!("(({c})({x}))")
            }
        }
    }

    fn math(&mut self, func: MathFn, ty: ScalarType, args: &[LExpr]) -> String {
        let texts: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
        if ty.is_integer() {
            return match func {
                MathFn::Min | MathFn::Max => {
                    let c = self.cty(ty);
                    let name = if func == MathFn::Min { "min" } else { "max" };
                    format!("{name}(({c})({}), ({c})({}))", texts[0], texts[1])
                }
                MathFn::Abs => {
                    let helper = if ty == ScalarType::I32 {
                        Helper::AbsI32
                    } else {
                        Helper::AbsI64
                    };
                    format!("{}(gv_overflow_flag, {})", self.need(helper), texts[0])
                }
                // Anything else was rejected as float-only during planning.
                other => format!("{}({})", other.name(), texts.join(", ")),
            };
        }
        // Double overloads, with the arguments pinned to double because a
        // mixed int operand would make the builtin call ambiguous.
        let a = format!("(double)({})", texts[0]);
        self.uses_f64 = true;
        match func {
            MathFn::Sqrt => format!("sqrt({a})"),
            MathFn::Fabs | MathFn::Abs => format!("fabs({a})"),
            MathFn::Exp => format!("exp({a})"),
            MathFn::Log => format!("log({a})"),
            MathFn::Sin => format!("sin({a})"),
            MathFn::Cos => format!("cos({a})"),
            MathFn::Floor => format!("floor({a})"),
            MathFn::Ceil => format!("ceil({a})"),
            MathFn::Pow | MathFn::Min | MathFn::Max => {
                let b = format!("(double)({})", texts[1]);
                match func {
                    MathFn::Pow => format!("pow({a}, {b})"),
                    MathFn::Min => format!("fmin({a}, {b})"),
                    _ => format!("fmax({a}, {b})"),
                }
            }
        }
    }
}

fn const_step(step: &LExpr) -> Option<i64> {
    match step {
        LExpr::Const(Literal::I32(v)) => Some(i64::from(*v)),
        LExpr::Const(Literal::I64(v)) => Some(*v),
        _ => None,
    }
}
