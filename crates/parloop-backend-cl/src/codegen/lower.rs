//! Lowering from an analyzed plan to a device-shaped tree.
//!
//! The lowered tree resolves what the consumers would otherwise re-derive
//! per walk: the promoted type each operation runs at, which accesses carry
//! runtime bound checks, hoisted scalar declarations, and the kernel
//! parameter layout. The text emitter and the simulator both consume this
//! one form, so they cannot disagree about walk ids or operand widths.

use std::collections::BTreeSet;

use parloop::analysis::reduction::ReductionKind;
use parloop::analysis::typecheck::TypeEnv;
use parloop::analysis::{typecheck, OffloadPlan};
use parloop::error::{OffloadError, Result};
use parloop::exec::CheckConfig;
use parloop::ir::program::{BinOp, Expr, Function, Program, ProgramKind, Stmt, UnOp};
use parloop::ir::types::{Literal, MathFn, ScalarType};
use parloop::symbols::SymbolTable;

/// One kernel parameter in signature order. The executor binds launch
/// arguments by walking this list, so it is the single authority on the
/// device-side calling convention.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    /// `__global ELEM *name`, bound to the staged device buffer.
    Array {
        elem: ScalarType,
        rank: usize,
        written: bool,
        write_only: bool,
    },
    /// `const long name_dim{dim}`, one extent of an array.
    Extent { array: String, dim: usize },
    /// `const ELEM name`; non-const when the body assigns it.
    Scalar { ty: ScalarType, assigned: bool },
    /// `const long gv_off{level}`, range start of one launch dimension.
    Offset { level: usize },
    /// `const long gv_step{level}`, range stride of one launch dimension.
    Step { level: usize },
    /// `const long gv_half`, reduction pass split point.
    Half,
    /// `const long gv_n`, live element count of the reduction scratch.
    Count,
    /// `__global long *gv_bound_flag`.
    BoundFlag,
    /// `__global long *gv_overflow_flag`.
    OverflowFlag,
}

/// Expression with operand typing resolved. `ty` on an operator node is
/// the promoted type the operation runs at, which fixes the checked helper
/// variant and the saturation width.
#[derive(Debug, Clone)]
pub enum LExpr {
    Const(Literal),
    Scalar(String),
    Load {
        array: String,
        elem: ScalarType,
        index: Vec<LExpr>,
        checked: bool,
    },
    Unary {
        op: UnOp,
        ty: ScalarType,
        operand: Box<LExpr>,
    },
    Binary {
        op: BinOp,
        ty: ScalarType,
        lhs: Box<LExpr>,
        rhs: Box<LExpr>,
    },
    Math {
        func: MathFn,
        ty: ScalarType,
        args: Vec<LExpr>,
    },
    Call {
        func: String,
        args: Vec<LExpr>,
    },
    Cast {
        to: ScalarType,
        operand: Box<LExpr>,
    },
}

#[derive(Debug, Clone)]
pub enum LStmt {
    /// Scalar assignment. Declarations are hoisted, so initializers lower
    /// to plain assignments at their statement position.
    Assign {
        name: String,
        ty: ScalarType,
        value: LExpr,
    },
    Store {
        array: String,
        elem: ScalarType,
        index: Vec<LExpr>,
        checked: bool,
        value: LExpr,
    },
    If {
        cond: LExpr,
        then_body: Vec<LStmt>,
        else_body: Vec<LStmt>,
    },
    For {
        var: String,
        start: LExpr,
        stop: LExpr,
        step: LExpr,
        body: Vec<LStmt>,
    },
    While {
        cond: LExpr,
        body: Vec<LStmt>,
    },
    Break,
    Return(LExpr),
}

/// A user function lowered for device emission: every access checked, and
/// the symbol scalars its body reaches threaded through as trailing
/// parameters because device helpers have no access to kernel arguments.
#[derive(Debug, Clone)]
pub struct LFunction {
    pub name: String,
    pub params: Vec<(String, ScalarType)>,
    pub ret: ScalarType,
    /// Referenced symbol scalars, own plus transitive callees', sorted.
    /// Appended to the emitted signature and forwarded at every call site.
    pub extras: Vec<(String, ScalarType)>,
    /// Arrays the body reads, with element type and rank. Forwarded as a
    /// pointer plus one extent per dimension, like the kernel parameters.
    pub arrays: Vec<(String, ScalarType, usize)>,
    pub decls: Vec<(String, ScalarType)>,
    pub body: Vec<LStmt>,
}

#[derive(Debug, Clone)]
pub struct LoweredLoop {
    /// Induction variable per launch dimension, outermost first.
    pub level_vars: Vec<String>,
    /// Hoisted kernel-local scalars, zero-initialized at item start.
    pub decls: Vec<(String, ScalarType)>,
    pub stmts: Vec<LStmt>,
    /// Called functions, callees before callers.
    pub functions: Vec<LFunction>,
}

#[derive(Debug, Clone)]
pub struct LoweredReduce {
    pub array: String,
    /// Element type of the device scratch buffer: wide enough for the
    /// array elements and the combiner result.
    pub elem: ScalarType,
    /// Declared result type of the combining function.
    pub ret: ScalarType,
    pub combine: Combine,
}

#[derive(Debug, Clone)]
pub enum Combine {
    Builtin(ReductionKind),
    Custom(LFunction),
}

#[derive(Debug, Clone)]
pub enum KernelBody {
    Loop(LoweredLoop),
    Reduce(LoweredReduce),
}

#[derive(Debug, Clone)]
pub struct LoweredKernel {
    pub entry: String,
    pub params: Vec<ParamSpec>,
    pub body: KernelBody,
}

impl LoweredKernel {
    /// Names and staging facts of every array parameter, in layout order.
    pub fn arrays(&self) -> impl Iterator<Item = (&str, ScalarType, usize, bool, bool)> {
        self.params.iter().filter_map(|p| match &p.kind {
            ParamKind::Array {
                elem,
                rank,
                written,
                write_only,
            } => Some((p.name.as_str(), *elem, *rank, *written, *write_only)),
            _ => None,
        })
    }
}

fn internal(reason: impl Into<String>) -> OffloadError {
    OffloadError::unsupported("code generation", reason)
}

/// Lower a plan into the device tree for one check configuration.
pub fn lower(program: &Program, plan: &OffloadPlan, checks: &CheckConfig) -> Result<LoweredKernel> {
    let entry = format!("pl_{:016x}", plan.structural_hash);
    match &program.kind {
        ProgramKind::Loop(_) => lower_loop(program, plan, checks, entry),
        ProgramKind::Reduce(spec) => lower_reduce(program, plan, &spec.array, &spec.func, entry),
    }
}

fn lower_loop(
    program: &Program,
    plan: &OffloadPlan,
    checks: &CheckConfig,
    entry: String,
) -> Result<LoweredKernel> {
    let symbols = &program.symbols;
    let level_vars = plan.level_vars();

    let env = typecheck::nest_env(symbols, &program.functions, &level_vars)?;
    let mut lowerer = Lowerer {
        env,
        checks,
        next_id: 0,
        all_checked: false,
    };
    let stmts = lowerer.lower_body(&plan.body)?;
    let decls = collect_decls(&plan.body);

    let functions = lower_called_functions(program, &plan.accesses.called)?;

    // Symbol scalars the kernel signature must carry: read or assigned in
    // the body, plus whatever called helpers need forwarded.
    let mut scalars = symbol_scalar_refs(&plan.body, symbols, &[]);
    for f in &functions {
        scalars.extend(f.extras.iter().map(|(name, _)| name.clone()));
    }

    let mut arrays: Vec<String> = plan
        .accesses
        .arrays_touched()
        .into_iter()
        .map(str::to_string)
        .collect();
    arrays.sort_unstable();
    let written = plan.accesses.arrays_written();

    let mut params = Vec::new();
    let mut names: Vec<&String> = arrays.iter().chain(scalars.iter()).collect();
    names.sort_unstable();
    for name in names {
        if let Some(meta) = symbols.array_meta(name) {
            params.push(ParamSpec {
                name: name.clone(),
                kind: ParamKind::Array {
                    elem: meta.elem,
                    rank: meta.dims,
                    written: written.contains(name.as_str()),
                    write_only: meta.flags.write_only,
                },
            });
            for dim in 0..meta.dims {
                params.push(ParamSpec {
                    name: format!("{name}_dim{dim}"),
                    kind: ParamKind::Extent {
                        array: name.clone(),
                        dim,
                    },
                });
            }
        } else {
            let ty = symbols.scalar_type(name).ok_or_else(|| {
                internal(format!("'{name}' is referenced but not declared"))
            })?;
            params.push(ParamSpec {
                name: name.clone(),
                kind: ParamKind::Scalar {
                    ty,
                    assigned: plan.accesses.assigned_scalars.contains(name),
                },
            });
        }
    }
    for level in 0..level_vars.len() {
        params.push(ParamSpec {
            name: format!("gv_off{level}"),
            kind: ParamKind::Offset { level },
        });
        params.push(ParamSpec {
            name: format!("gv_step{level}"),
            kind: ParamKind::Step { level },
        });
    }
    push_flag_params(&mut params);

    let kernel = LoweredKernel {
        entry,
        params,
        body: KernelBody::Loop(LoweredLoop {
            level_vars,
            decls,
            stmts,
            functions,
        }),
    };
    check_names(&kernel, plan)?;
    Ok(kernel)
}

fn lower_reduce(
    program: &Program,
    plan: &OffloadPlan,
    array: &str,
    func: &str,
    entry: String,
) -> Result<LoweredKernel> {
    let symbols = &program.symbols;
    let meta = symbols
        .array_meta(array)
        .ok_or_else(|| internal(format!("reduction array '{array}' is not declared")))?;
    let function = program
        .function(func)
        .ok_or_else(|| internal(format!("combining function '{func}' is not declared")))?;
    let kind = plan
        .reduction
        .ok_or_else(|| internal("plan has no reduction classification"))?;

    // The scratch holds both the array elements and combiner results.
    let elem = if meta.elem == function.ret {
        meta.elem
    } else {
        meta.elem.promote(function.ret)?
    };

    let combine = if kind == ReductionKind::Custom {
        let f = lower_function(program, function)?;
        if !f.arrays.is_empty() {
            return Err(internal(format!(
                "combining function '{}' reads arrays",
                f.name
            )));
        }
        Combine::Custom(f)
    } else {
        Combine::Builtin(kind)
    };
    let extras = match &combine {
        Combine::Custom(f) => f.extras.clone(),
        Combine::Builtin(_) => Vec::new(),
    };

    let mut params = vec![ParamSpec {
        name: array.to_string(),
        kind: ParamKind::Array {
            elem,
            rank: 1,
            written: false,
            write_only: false,
        },
    }];
    for (name, ty) in &extras {
        params.push(ParamSpec {
            name: name.clone(),
            kind: ParamKind::Scalar {
                ty: *ty,
                assigned: false,
            },
        });
    }
    params.push(ParamSpec {
        name: "gv_half".to_string(),
        kind: ParamKind::Half,
    });
    params.push(ParamSpec {
        name: "gv_n".to_string(),
        kind: ParamKind::Count,
    });
    push_flag_params(&mut params);

    let kernel = LoweredKernel {
        entry,
        params,
        body: KernelBody::Reduce(LoweredReduce {
            array: array.to_string(),
            elem,
            ret: function.ret,
            combine,
        }),
    };
    check_names(&kernel, plan)?;
    Ok(kernel)
}

fn push_flag_params(params: &mut Vec<ParamSpec>) {
    params.push(ParamSpec {
        name: "gv_bound_flag".to_string(),
        kind: ParamKind::BoundFlag,
    });
    params.push(ParamSpec {
        name: "gv_overflow_flag".to_string(),
        kind: ParamKind::OverflowFlag,
    });
}

/// Reject name collisions with the generated parameter and temporary
/// namespace. User names never start with `gv_`; duplicate parameter names
/// would not compile on a device.
fn check_names(kernel: &LoweredKernel, plan: &OffloadPlan) -> Result<()> {
    let mut seen = BTreeSet::new();
    for param in &kernel.params {
        let generated = matches!(
            param.kind,
            ParamKind::Offset { .. }
                | ParamKind::Step { .. }
                | ParamKind::Half
                | ParamKind::Count
                | ParamKind::BoundFlag
                | ParamKind::OverflowFlag
        );
        if !generated && param.name.starts_with("gv_") {
            return Err(internal(format!(
                "'{}' uses the reserved prefix 'gv_'",
                param.name
            )));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(internal(format!(
                "parameter name '{}' occurs twice in the kernel signature",
                param.name
            )));
        }
    }
    let locals = plan
        .accesses
        .sequential_vars
        .iter()
        .chain(plan.accesses.declared_scalars.iter());
    for name in locals {
        if name.starts_with("gv_") {
            return Err(internal(format!("'{name}' uses the reserved prefix 'gv_'")));
        }
    }
    Ok(())
}

/// Kernel-local scalar declarations in source order, for hoisting.
pub fn collect_decls(body: &[Stmt]) -> Vec<(String, ScalarType)> {
    let mut out = Vec::new();
    walk_decls(body, &mut out);
    out
}

fn walk_decls(body: &[Stmt], out: &mut Vec<(String, ScalarType)>) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { name, ty, .. } => out.push((name.clone(), *ty)),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                walk_decls(then_body, out);
                walk_decls(else_body, out);
            }
            Stmt::For { body, .. } | Stmt::While { body, .. } => walk_decls(body, out),
            _ => {}
        }
    }
}

/// Symbol-table scalars a body references, reads and assignment targets
/// both. `shadowed` carries the function parameters that hide symbols of
/// the same name.
fn symbol_scalar_refs(
    body: &[Stmt],
    symbols: &SymbolTable,
    shadowed: &[String],
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    scan_stmts_for_scalars(body, symbols, shadowed, &mut out);
    out
}

fn scan_stmts_for_scalars(
    body: &[Stmt],
    symbols: &SymbolTable,
    shadowed: &[String],
    out: &mut BTreeSet<String>,
) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { init, .. } => {
                if let Some(init) = init {
                    scan_expr_for_scalars(init, symbols, shadowed, out);
                }
            }
            Stmt::AssignScalar { name, value } => {
                if !shadowed.iter().any(|s| s == name) && symbols.scalar_type(name).is_some() {
                    out.insert(name.to_string());
                }
                scan_expr_for_scalars(value, symbols, shadowed, out);
            }
            Stmt::Store { index, value, .. } => {
                for idx in index {
                    scan_expr_for_scalars(idx, symbols, shadowed, out);
                }
                scan_expr_for_scalars(value, symbols, shadowed, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr_for_scalars(cond, symbols, shadowed, out);
                scan_stmts_for_scalars(then_body, symbols, shadowed, out);
                scan_stmts_for_scalars(else_body, symbols, shadowed, out);
            }
            Stmt::For {
                start,
                stop,
                step,
                body,
                ..
            } => {
                for e in [start, stop, step] {
                    scan_expr_for_scalars(e, symbols, shadowed, out);
                }
                scan_stmts_for_scalars(body, symbols, shadowed, out);
            }
            Stmt::While { cond, body } => {
                scan_expr_for_scalars(cond, symbols, shadowed, out);
                scan_stmts_for_scalars(body, symbols, shadowed, out);
            }
            Stmt::Break => {}
            Stmt::Return(value) => scan_expr_for_scalars(value, symbols, shadowed, out),
        }
    }
}

fn scan_expr_for_scalars(
    expr: &Expr,
    symbols: &SymbolTable,
    shadowed: &[String],
    out: &mut BTreeSet<String>,
) {
    match expr {
        Expr::Const(_) => {}
        Expr::Scalar(name) => {
            if !shadowed.iter().any(|s| s == name) && symbols.scalar_type(name).is_some() {
                out.insert(name.clone());
            }
        }
        Expr::Load { index, .. } => {
            for idx in index {
                scan_expr_for_scalars(idx, symbols, shadowed, out);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => {
            scan_expr_for_scalars(operand, symbols, shadowed, out)
        }
        Expr::Binary { lhs, rhs, .. } => {
            scan_expr_for_scalars(lhs, symbols, shadowed, out);
            scan_expr_for_scalars(rhs, symbols, shadowed, out);
        }
        Expr::Math { args, .. } | Expr::Call { args, .. } => {
            for arg in args {
                scan_expr_for_scalars(arg, symbols, shadowed, out);
            }
        }
    }
}

fn direct_calls(body: &[Stmt], out: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { init, .. } => {
                if let Some(init) = init {
                    calls_in_expr(init, out);
                }
            }
            Stmt::AssignScalar { value, .. } | Stmt::Return(value) => calls_in_expr(value, out),
            Stmt::Store { index, value, .. } => {
                for idx in index {
                    calls_in_expr(idx, out);
                }
                calls_in_expr(value, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                calls_in_expr(cond, out);
                direct_calls(then_body, out);
                direct_calls(else_body, out);
            }
            Stmt::For {
                start,
                stop,
                step,
                body,
                ..
            } => {
                for e in [start, stop, step] {
                    calls_in_expr(e, out);
                }
                direct_calls(body, out);
            }
            Stmt::While { cond, body } => {
                calls_in_expr(cond, out);
                direct_calls(body, out);
            }
            Stmt::Break => {}
        }
    }
}

fn calls_in_expr(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Const(_) | Expr::Scalar(_) => {}
        Expr::Load { index, .. } => {
            for idx in index {
                calls_in_expr(idx, out);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => calls_in_expr(operand, out),
        Expr::Binary { lhs, rhs, .. } => {
            calls_in_expr(lhs, out);
            calls_in_expr(rhs, out);
        }
        Expr::Math { args, .. } => {
            for arg in args {
                calls_in_expr(arg, out);
            }
        }
        Expr::Call { func, args } => {
            out.insert(func.clone());
            for arg in args {
                calls_in_expr(arg, out);
            }
        }
    }
}

/// Lower every called function, callees before callers so the emitted
/// helpers are defined before use.
fn lower_called_functions(
    program: &Program,
    called: &std::collections::HashSet<String>,
) -> Result<Vec<LFunction>> {
    let mut roots: Vec<&String> = called.iter().collect();
    roots.sort_unstable();
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    for root in roots {
        topo_visit(root, program, &mut visited, &mut order)?;
    }
    order.iter().map(|f| lower_function(program, f)).collect()
}

fn topo_visit<'p>(
    name: &str,
    program: &'p Program,
    visited: &mut BTreeSet<String>,
    order: &mut Vec<&'p Function>,
) -> Result<()> {
    if !visited.insert(name.to_string()) {
        return Ok(());
    }
    let function = program
        .function(name)
        .ok_or_else(|| internal(format!("call of undeclared function '{name}'")))?;
    let mut callees = BTreeSet::new();
    direct_calls(&function.body, &mut callees);
    for callee in &callees {
        topo_visit(callee, program, visited, order)?;
    }
    order.push(function);
    Ok(())
}

fn lower_function(program: &Program, function: &Function) -> Result<LFunction> {
    let env = TypeEnv::function_env(&program.symbols, &program.functions, function);
    let checks = CheckConfig::All;
    let mut lowerer = Lowerer {
        env,
        checks: &checks,
        next_id: 0,
        all_checked: true,
    };
    let body = lowerer.lower_body(&function.body)?;

    let (scalars, arrays) = function_refs(function, program, &mut BTreeSet::new());

    for name in function.params.iter().map(|(n, _)| n.as_str()) {
        if name.starts_with("gv_") {
            return Err(internal(format!("'{name}' uses the reserved prefix 'gv_'")));
        }
        if arrays.contains(name) {
            return Err(internal(format!(
                "parameter '{name}' of '{}' shadows an array the function reads",
                function.name
            )));
        }
    }

    let extras = scalars
        .into_iter()
        .map(|name| {
            let ty = program
                .symbols
                .scalar_type(&name)
                .ok_or_else(|| internal(format!("'{name}' is referenced but not declared")))?;
            Ok((name, ty))
        })
        .collect::<Result<Vec<_>>>()?;
    let arrays = arrays
        .into_iter()
        .map(|name| {
            let meta = program
                .symbols
                .array_meta(&name)
                .ok_or_else(|| internal(format!("'{name}' is referenced but not declared")))?;
            Ok((name, meta.elem, meta.dims))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(LFunction {
        name: function.name.clone(),
        params: function.params.clone(),
        ret: function.ret,
        extras,
        arrays,
        decls: collect_decls(&function.body),
        body,
    })
}

/// Symbol scalars and arrays a function reaches, own accesses plus those
/// of every function it calls.
fn function_refs(
    function: &Function,
    program: &Program,
    visiting: &mut BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    if !visiting.insert(function.name.clone()) {
        return (BTreeSet::new(), BTreeSet::new());
    }
    let params: Vec<String> = function.params.iter().map(|(n, _)| n.clone()).collect();
    let mut scalars = symbol_scalar_refs(&function.body, &program.symbols, &params);
    let mut arrays = array_refs(&function.body);
    let mut callees = BTreeSet::new();
    direct_calls(&function.body, &mut callees);
    for callee in &callees {
        if let Some(f) = program.function(callee) {
            let (s, a) = function_refs(f, program, visiting);
            scalars.extend(s);
            arrays.extend(a);
        }
    }
    (scalars, arrays)
}

fn array_refs(body: &[Stmt]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    walk_array_refs(body, &mut out);
    out
}

fn walk_array_refs(body: &[Stmt], out: &mut BTreeSet<String>) {
    for stmt in body {
        match stmt {
            Stmt::DeclScalar { init, .. } => {
                if let Some(init) = init {
                    arrays_in_expr(init, out);
                }
            }
            Stmt::AssignScalar { value, .. } | Stmt::Return(value) => arrays_in_expr(value, out),
            Stmt::Store {
                array,
                index,
                value,
            } => {
                out.insert(array.clone());
                for idx in index {
                    arrays_in_expr(idx, out);
                }
                arrays_in_expr(value, out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                arrays_in_expr(cond, out);
                walk_array_refs(then_body, out);
                walk_array_refs(else_body, out);
            }
            Stmt::For {
                start,
                stop,
                step,
                body,
                ..
            } => {
                for e in [start, stop, step] {
                    arrays_in_expr(e, out);
                }
                walk_array_refs(body, out);
            }
            Stmt::While { cond, body } => {
                arrays_in_expr(cond, out);
                walk_array_refs(body, out);
            }
            Stmt::Break => {}
        }
    }
}

fn arrays_in_expr(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Const(_) | Expr::Scalar(_) => {}
        Expr::Load { array, index } => {
            out.insert(array.clone());
            for idx in index {
                arrays_in_expr(idx, out);
            }
        }
        Expr::Unary { operand, .. } | Expr::Cast { operand, .. } => arrays_in_expr(operand, out),
        Expr::Binary { lhs, rhs, .. } => {
            arrays_in_expr(lhs, out);
            arrays_in_expr(rhs, out);
        }
        Expr::Math { args, .. } | Expr::Call { args, .. } => {
            for arg in args {
                arrays_in_expr(arg, out);
            }
        }
    }
}

struct Lowerer<'a> {
    env: TypeEnv<'a>,
    checks: &'a CheckConfig,
    /// Walk id counter, aligned with the access collector's numbering.
    next_id: u32,
    /// Inside function bodies every access is checked and ids stay with
    /// the enclosing body.
    all_checked: bool,
}

impl Lowerer<'_> {
    fn take_check(&mut self) -> bool {
        if self.all_checked {
            return true;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.checks.instruments(id)
    }

    fn lower_body(&mut self, body: &[Stmt]) -> Result<Vec<LStmt>> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            if let Some(lowered) = self.lower_stmt(stmt)? {
                out.push(lowered);
            }
        }
        Ok(out)
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<Option<LStmt>> {
        match stmt {
            Stmt::DeclScalar { name, ty, init } => {
                let lowered = match init {
                    Some(init) => Some(LStmt::Assign {
                        name: name.clone(),
                        ty: *ty,
                        value: self.lower_expr(init)?.0,
                    }),
                    // Zeroed by the hoisted declaration.
                    None => None,
                };
                self.env.declare_local(name, *ty)?;
                Ok(lowered)
            }
            Stmt::AssignScalar { name, value } => {
                let ty = self.env.scalar_type(name)?;
                let value = self.lower_expr(value)?.0;
                Ok(Some(LStmt::Assign {
                    name: name.clone(),
                    ty,
                    value,
                }))
            }
            Stmt::Store {
                array,
                index,
                value,
            } => {
                let mut idx = Vec::with_capacity(index.len());
                for e in index {
                    idx.push(self.lower_expr(e)?.0);
                }
                let value = self.lower_expr(value)?.0;
                let checked = self.take_check();
                let meta = self
                    .env
                    .symbols
                    .array_meta(array)
                    .ok_or_else(|| internal(format!("store to undeclared array '{array}'")))?;
                Ok(Some(LStmt::Store {
                    array: array.clone(),
                    elem: meta.elem,
                    index: idx,
                    checked,
                    value,
                }))
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.lower_expr(cond)?.0;
                let then_body = self.lower_body(then_body)?;
                let else_body = self.lower_body(else_body)?;
                Ok(Some(LStmt::If {
                    cond,
                    then_body,
                    else_body,
                }))
            }
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => {
                let start = self.lower_expr(start)?.0;
                let stop = self.lower_expr(stop)?.0;
                let step = self.lower_expr(step)?.0;
                self.env.declare_local(var, ScalarType::I64)?;
                let body = self.lower_body(body);
                self.env.forget_local(var);
                Ok(Some(LStmt::For {
                    var: var.clone(),
                    start,
                    stop,
                    step,
                    body: body?,
                }))
            }
            Stmt::While { cond, body } => {
                let cond = self.lower_expr(cond)?.0;
                let body = self.lower_body(body)?;
                Ok(Some(LStmt::While { cond, body }))
            }
            Stmt::Break => Ok(Some(LStmt::Break)),
            Stmt::Return(value) => {
                let value = self.lower_expr(value)?.0;
                Ok(Some(LStmt::Return(value)))
            }
        }
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<(LExpr, ScalarType)> {
        match expr {
            Expr::Const(lit) => Ok((LExpr::Const(*lit), lit.ty())),
            Expr::Scalar(name) => {
                let ty = self.env.scalar_type(name)?;
                Ok((LExpr::Scalar(name.clone()), ty))
            }
            Expr::Load { array, index } => {
                let mut idx = Vec::with_capacity(index.len());
                for e in index {
                    idx.push(self.lower_expr(e)?.0);
                }
                let checked = self.take_check();
                let meta = self
                    .env
                    .symbols
                    .array_meta(array)
                    .ok_or_else(|| internal(format!("load from undeclared array '{array}'")))?;
                Ok((
                    LExpr::Load {
                        array: array.clone(),
                        elem: meta.elem,
                        index: idx,
                        checked,
                    },
                    meta.elem,
                ))
            }
            Expr::Unary { op, operand } => {
                let (inner, ty) = self.lower_expr(operand)?;
                Ok((
                    LExpr::Unary {
                        op: *op,
                        ty,
                        operand: Box::new(inner),
                    },
                    ty,
                ))
            }
            Expr::Binary { op, lhs, rhs } => {
                let (l, lt) = self.lower_expr(lhs)?;
                let (r, rt) = self.lower_expr(rhs)?;
                let (node_ty, out_ty) = if op.is_logical() {
                    (ScalarType::Bool, ScalarType::Bool)
                } else if op.is_comparison() {
                    let joined = if lt == ScalarType::Bool {
                        ScalarType::Bool
                    } else {
                        lt.promote(rt)?
                    };
                    (joined, ScalarType::Bool)
                } else {
                    let joined = lt.promote(rt)?;
                    (joined, joined)
                };
                Ok((
                    LExpr::Binary {
                        op: *op,
                        ty: node_ty,
                        lhs: Box::new(l),
                        rhs: Box::new(r),
                    },
                    out_ty,
                ))
            }
            Expr::Math { func, args } => {
                let mut lowered = Vec::with_capacity(args.len());
                let mut joined: Option<ScalarType> = None;
                for arg in args {
                    let (e, t) = self.lower_expr(arg)?;
                    lowered.push(e);
                    joined = Some(match joined {
                        Some(j) => j.promote(t)?,
                        None => t,
                    });
                }
                let ty = joined.ok_or_else(|| {
                    internal(format!("math function '{}' has no arguments", func.name()))
                })?;
                let out = func.result_type(ty)?;
                Ok((
                    LExpr::Math {
                        func: *func,
                        ty,
                        args: lowered,
                    },
                    out,
                ))
            }
            Expr::Call { func, args } => {
                let ret = self
                    .env
                    .functions
                    .iter()
                    .find(|f| &f.name == func)
                    .ok_or_else(|| internal(format!("call of undeclared function '{func}'")))?
                    .ret;
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    lowered.push(self.lower_expr(arg)?.0);
                }
                Ok((
                    LExpr::Call {
                        func: func.clone(),
                        args: lowered,
                    },
                    ret,
                ))
            }
            Expr::Cast { to, operand } => {
                let (inner, _) = self.lower_expr(operand)?;
                Ok((
                    LExpr::Cast {
                        to: *to,
                        operand: Box::new(inner),
                    },
                    *to,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parloop::analysis::build_plan;
    use parloop::ir::program::LoopLevel;
    use parloop::options::LoopOptions;
    use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};

    fn gather() -> (Program, Bindings) {
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
            .set_array("idx", ArrayRef::new(ArrayData::from_i64(vec![0, 1, 2, 3])))
            .unwrap();
        for name in ["x", "y"] {
            bindings
                .set_array(name, ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
                .unwrap();
        }
        (program, bindings)
    }

    #[test]
    fn checks_land_on_the_selected_walk_id() {
        let (program, bindings) = gather();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        // Walk order: read idx (0), read x (1), write y (2).
        let checks = CheckConfig::Selective([1u32].into_iter().collect());
        let kernel = lower(&program, &plan, &checks).unwrap();
        let KernelBody::Loop(ref body) = kernel.body else {
            panic!("expected a loop kernel");
        };
        let LStmt::Store {
            checked: store_checked,
            ref value,
            ..
        } = body.stmts[0]
        else {
            panic!("expected a store");
        };
        assert!(!store_checked);
        let LExpr::Load {
            checked: outer,
            ref index,
            ..
        } = *value
        else {
            panic!("expected a load of x");
        };
        assert!(outer);
        let LExpr::Load { checked: inner, .. } = index[0] else {
            panic!("expected a load of idx");
        };
        assert!(!inner);
    }

    #[test]
    fn params_are_sorted_with_extents_and_ranges() {
        let (program, bindings) = gather();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        let kernel = lower(&program, &plan, &CheckConfig::None).unwrap();
        let names: Vec<&str> = kernel.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "idx",
                "idx_dim0",
                "n",
                "x",
                "x_dim0",
                "y",
                "y_dim0",
                "gv_off0",
                "gv_step0",
                "gv_bound_flag",
                "gv_overflow_flag"
            ]
        );
        let ParamKind::Array { written, .. } = kernel
            .params
            .iter()
            .find(|p| p.name == "y")
            .map(|p| p.kind.clone())
            .unwrap()
        else {
            panic!("y is an array parameter");
        };
        assert!(written);
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let symbols = SymbolTable::new()
            .scalar("gv_off0", ScalarType::I64)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "bad",
            symbols,
            LoopLevel::upto("i", Expr::i64(4)),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::cast(ScalarType::F64, Expr::scalar("gv_off0")),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("gv_off0", Literal::I64(1)).unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
            .unwrap();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        let err = lower(&program, &plan, &CheckConfig::None).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn function_extras_reach_the_kernel_signature() {
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
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![1.0; 4])))
            .unwrap();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        let kernel = lower(&program, &plan, &CheckConfig::None).unwrap();
        // alpha is only read inside the helper, yet the kernel must carry
        // it to forward at the call site.
        assert!(kernel.params.iter().any(|p| p.name == "alpha"));
        let KernelBody::Loop(ref body) = kernel.body else {
            panic!("expected a loop kernel");
        };
        assert_eq!(body.functions.len(), 1);
        assert_eq!(
            body.functions[0].extras,
            vec![("alpha".to_string(), ScalarType::F64)]
        );
    }
}
