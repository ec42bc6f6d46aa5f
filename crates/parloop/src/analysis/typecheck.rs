use std::collections::{HashMap, HashSet};

use crate::error::{OffloadError, Result};
use crate::ir::program::{BinOp, Expr, Function, Program, ProgramKind, Stmt, UnOp};
use crate::ir::types::ScalarType;
use crate::symbols::{SymbolKind, SymbolTable};

/// Typing context for one body walk. Locals cover declared scalars and loop
/// variables; everything else resolves through the symbol table.
pub struct TypeEnv<'a> {
    pub symbols: &'a SymbolTable,
    pub functions: &'a [Function],
    locals: HashMap<String, ScalarType>,
    /// Induction variables currently in scope. Immutable by assignment so
    /// every later pass can reason about their ranges.
    loop_vars: HashSet<String>,
    in_function: Option<ScalarType>,
    loop_depth: usize,
}

impl<'a> TypeEnv<'a> {
    pub fn new(symbols: &'a SymbolTable, functions: &'a [Function]) -> Self {
        TypeEnv {
            symbols,
            functions,
            locals: HashMap::new(),
            loop_vars: HashSet::new(),
            in_function: None,
            loop_depth: 0,
        }
    }

    /// Environment for one function body: parameters in scope, return type
    /// recorded. Parameters may shadow symbol names.
    pub fn function_env(symbols: &'a SymbolTable, functions: &'a [Function], f: &Function) -> Self {
        let mut env = TypeEnv::new(symbols, functions);
        env.in_function = Some(f.ret);
        for (name, ty) in &f.params {
            env.locals.insert(name.clone(), *ty);
        }
        env
    }

    pub fn declare_local(&mut self, name: &str, ty: ScalarType) -> Result<()> {
        if self.locals.contains_key(name) || self.symbols.kind(name).is_some() {
            return Err(err(format!("'{name}' shadows an existing symbol")));
        }
        self.locals.insert(name.to_string(), ty);
        Ok(())
    }

    /// Drop a local at the end of its scope so the name can be reused.
    pub fn forget_local(&mut self, name: &str) {
        self.locals.remove(name);
    }

    pub fn scalar_type(&self, name: &str) -> Result<ScalarType> {
        if let Some(ty) = self.locals.get(name) {
            return Ok(*ty);
        }
        match self.symbols.kind(name) {
            Some(SymbolKind::Scalar(ty)) => Ok(ty),
            Some(SymbolKind::Array(_)) => {
                Err(err(format!("'{name}' is an array used in scalar position")))
            }
            None => Err(err(format!("'{name}' is not declared"))),
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }
}

fn err(reason: String) -> OffloadError {
    OffloadError::unsupported("type check", reason)
}

/// Implicit widenings the body language allows. Everything else needs an
/// explicit cast.
pub fn widens_to(from: ScalarType, to: ScalarType) -> bool {
    from == to
        || matches!(
            (from, to),
            (ScalarType::I32, ScalarType::I64) | (ScalarType::I32, ScalarType::F64)
        )
}

pub fn expr_type(expr: &Expr, env: &TypeEnv<'_>) -> Result<ScalarType> {
    match expr {
        Expr::Const(lit) => Ok(lit.ty()),
        Expr::Scalar(name) => env.scalar_type(name),
        Expr::Load { array, index } => {
            let meta = env
                .symbols
                .array_meta(array)
                .ok_or_else(|| err(format!("'{array}' is not a declared array")))?;
            if index.len() != meta.dims {
                return Err(err(format!(
                    "'{array}' expects {} index dimensions, got {}",
                    meta.dims,
                    index.len()
                )));
            }
            for idx in index {
                let ty = expr_type(idx, env)?;
                if !ty.is_integer() {
                    return Err(err(format!("index into '{array}' is {ty}, not an integer")));
                }
            }
            Ok(meta.elem)
        }
        Expr::Unary { op, operand } => {
            let ty = expr_type(operand, env)?;
            match op {
                UnOp::Neg if ty.is_numeric() => Ok(ty),
                UnOp::Neg => Err(err("negation of a boolean".to_string())),
                UnOp::Not if ty == ScalarType::Bool => Ok(ScalarType::Bool),
                UnOp::Not => Err(err(format!("logical not applied to {ty}"))),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let lt = expr_type(lhs, env)?;
            let rt = expr_type(rhs, env)?;
            if op.is_logical() {
                if lt == ScalarType::Bool && rt == ScalarType::Bool {
                    return Ok(ScalarType::Bool);
                }
                return Err(err(format!("{} needs boolean operands", op.symbol())));
            }
            if op.is_comparison() {
                if lt == ScalarType::Bool && rt == ScalarType::Bool {
                    if matches!(op, BinOp::Eq | BinOp::Ne) {
                        return Ok(ScalarType::Bool);
                    }
                    return Err(err(format!("{} cannot order booleans", op.symbol())));
                }
                lt.promote(rt)?;
                return Ok(ScalarType::Bool);
            }
            let joined = lt.promote(rt)?;
            if *op == BinOp::Mod && !joined.is_integer() {
                return Err(err("modulo needs integer operands".to_string()));
            }
            Ok(joined)
        }
        Expr::Math { func, args } => {
            if args.len() != func.arity() {
                return Err(err(format!(
                    "math function '{}' takes {} arguments, got {}",
                    func.name(),
                    func.arity(),
                    args.len()
                )));
            }
            let mut joined = expr_type(&args[0], env)?;
            for arg in &args[1..] {
                joined = joined.promote(expr_type(arg, env)?)?;
            }
            func.result_type(joined)
        }
        Expr::Call { func, args } => {
            let f = env
                .functions
                .iter()
                .find(|f| &f.name == func)
                .ok_or_else(|| err(format!("call of undeclared function '{func}'")))?;
            if args.len() != f.params.len() {
                return Err(err(format!(
                    "'{func}' takes {} arguments, got {}",
                    f.params.len(),
                    args.len()
                )));
            }
            for (arg, (pname, pty)) in args.iter().zip(&f.params) {
                let at = expr_type(arg, env)?;
                if !widens_to(at, *pty) {
                    return Err(err(format!(
                        "argument '{pname}' of '{func}' needs {pty}, got {at}"
                    )));
                }
            }
            Ok(f.ret)
        }
        Expr::Cast { to, operand } => {
            let from = expr_type(operand, env)?;
            if from.is_numeric() && to.is_numeric() {
                Ok(*to)
            } else {
                Err(err(format!("cast {from} -> {to} is not defined")))
            }
        }
    }
}

fn check_body(body: &[Stmt], env: &mut TypeEnv<'_>) -> Result<()> {
    for stmt in body {
        check_stmt(stmt, env)?;
    }
    Ok(())
}

fn check_stmt(stmt: &Stmt, env: &mut TypeEnv<'_>) -> Result<()> {
    match stmt {
        Stmt::DeclScalar { name, ty, init } => {
            if let Some(init) = init {
                let it = expr_type(init, env)?;
                if !widens_to(it, *ty) {
                    return Err(err(format!("initializer of '{name}' is {it}, needs {ty}")));
                }
            }
            env.declare_local(name, *ty)
        }
        Stmt::AssignScalar { name, value } => {
            if env.loop_vars.contains(name) {
                return Err(err(format!("cannot assign loop variable '{name}'")));
            }
            let target = if env.is_local(name) {
                env.scalar_type(name)?
            } else {
                match env.symbols.kind(name) {
                    Some(SymbolKind::Scalar(ty)) => ty,
                    Some(SymbolKind::Array(_)) => {
                        return Err(err(format!("cannot assign array '{name}' as a scalar")))
                    }
                    None => return Err(err(format!("assignment to undeclared '{name}'"))),
                }
            };
            let vt = expr_type(value, env)?;
            if !widens_to(vt, target) {
                return Err(err(format!("assignment to '{name}' is {vt}, needs {target}")));
            }
            Ok(())
        }
        Stmt::Store {
            array,
            index,
            value,
        } => {
            let meta = env
                .symbols
                .array_meta(array)
                .ok_or_else(|| err(format!("store to undeclared array '{array}'")))?;
            if meta.flags.read_only {
                return Err(err(format!("store to read-only array '{array}'")));
            }
            if index.len() != meta.dims {
                return Err(err(format!(
                    "'{array}' expects {} index dimensions, got {}",
                    meta.dims,
                    index.len()
                )));
            }
            for idx in index {
                let ty = expr_type(idx, env)?;
                if !ty.is_integer() {
                    return Err(err(format!("index into '{array}' is {ty}, not an integer")));
                }
            }
            let vt = expr_type(value, env)?;
            if !widens_to(vt, meta.elem) {
                return Err(err(format!(
                    "store to '{array}' is {vt}, element type is {}",
                    meta.elem
                )));
            }
            Ok(())
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            if expr_type(cond, env)? != ScalarType::Bool {
                return Err(err("if condition is not boolean".to_string()));
            }
            check_body(then_body, env)?;
            check_body(else_body, env)
        }
        Stmt::For {
            var,
            start,
            stop,
            step,
            body,
        } => {
            for (what, e) in [("start", start), ("stop", stop), ("step", step)] {
                let ty = expr_type(e, env)?;
                if !ty.is_integer() {
                    return Err(err(format!("loop {what} bound is {ty}, not an integer")));
                }
            }
            env.declare_local(var, ScalarType::I64)?;
            env.loop_vars.insert(var.clone());
            env.loop_depth += 1;
            let result = check_body(body, env);
            env.loop_depth -= 1;
            env.loop_vars.remove(var);
            env.locals.remove(var);
            result
        }
        Stmt::While { cond, body } => {
            if expr_type(cond, env)? != ScalarType::Bool {
                return Err(err("while condition is not boolean".to_string()));
            }
            env.loop_depth += 1;
            let result = check_body(body, env);
            env.loop_depth -= 1;
            result
        }
        Stmt::Break => {
            if env.loop_depth == 0 {
                return Err(err("break outside a sequential loop".to_string()));
            }
            Ok(())
        }
        Stmt::Return(value) => {
            let Some(ret) = env.in_function else {
                return Err(err("return outside a function body".to_string()));
            };
            let vt = expr_type(value, env)?;
            if !widens_to(vt, ret) {
                return Err(err(format!("return value is {vt}, function returns {ret}")));
            }
            Ok(())
        }
    }
}

/// Whole-program validation run before any other pass. Rejects malformed
/// shapes early so later passes can assume a well-typed body.
pub fn validate_program(program: &Program) -> Result<()> {
    for decl in program.symbols.iter() {
        if let SymbolKind::Array(meta) = decl.kind {
            if meta.flags.scratch {
                return Err(err(format!(
                    "scratch array '{}' has no host storage to offload",
                    decl.name
                )));
            }
            if meta.dims == 0 || meta.dims > 3 {
                return Err(err(format!(
                    "array '{}' has rank {}, supported ranks are 1 to 3",
                    decl.name, meta.dims
                )));
            }
        }
    }
    for function in &program.functions {
        if !matches!(function.body.last(), Some(Stmt::Return(_))) {
            return Err(err(format!(
                "function '{}' does not end with a return",
                function.name
            )));
        }
        let mut env = TypeEnv::function_env(&program.symbols, &program.functions, function);
        check_body(&function.body, &mut env)?;
    }
    match &program.kind {
        ProgramKind::Loop(nest) => {
            let mut env = TypeEnv::new(&program.symbols, &program.functions);
            for (what, e) in [
                ("start", &nest.level.start),
                ("stop", &nest.level.stop),
                ("step", &nest.level.step),
            ] {
                let ty = expr_type(e, &env)?;
                if !ty.is_integer() {
                    return Err(err(format!("loop {what} bound is {ty}, not an integer")));
                }
            }
            env.declare_local(&nest.level.var, ScalarType::I64)?;
            env.loop_vars.insert(nest.level.var.clone());
            check_body(&nest.body, &mut env)
        }
        ProgramKind::Reduce(spec) => {
            let meta = program
                .symbols
                .array_meta(&spec.array)
                .ok_or_else(|| err(format!("reduction over undeclared array '{}'", spec.array)))?;
            if meta.dims != 1 {
                return Err(err(format!(
                    "reduction over '{}' needs a one-dimensional array",
                    spec.array
                )));
            }
            let f = program
                .function(&spec.func)
                .ok_or_else(|| err(format!("reduction function '{}' is not declared", spec.func)))?;
            if f.params.len() != 2 {
                return Err(err(format!(
                    "reduction function '{}' must take two parameters",
                    f.name
                )));
            }
            for (_, pty) in &f.params {
                if !widens_to(meta.elem, *pty) {
                    return Err(err(format!(
                        "reduction function '{}' parameters do not accept {} elements",
                        f.name,
                        meta.elem
                    )));
                }
                // The accumulator cycles through the combiner, so the
                // parameters must also accept its own result.
                if !widens_to(f.ret, *pty) {
                    return Err(err(format!(
                        "reduction function '{}' parameters do not accept its {} result",
                        f.name, f.ret
                    )));
                }
            }
            if !widens_to(f.ret, meta.elem) && !widens_to(meta.elem, f.ret) {
                return Err(err(format!(
                    "reduction function '{}' returns {}, array holds {}",
                    f.name, f.ret, meta.elem
                )));
            }
            Ok(())
        }
    }
}

/// Environment for typing the fused body during code generation: level
/// variables are in scope as i64.
pub fn nest_env<'a>(
    symbols: &'a SymbolTable,
    functions: &'a [Function],
    level_vars: &[String],
) -> Result<TypeEnv<'a>> {
    let mut env = TypeEnv::new(symbols, functions);
    for var in level_vars {
        env.declare_local(var, ScalarType::I64)?;
        env.loop_vars.insert(var.clone());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::program::LoopLevel;
    use crate::ir::types::MathFn;

    fn symbols() -> SymbolTable {
        SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("alpha", ScalarType::F64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1)
    }

    #[test]
    fn well_typed_saxpy_passes() {
        let program = Program::loop_nest(
            "saxpy",
            symbols(),
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(
                    Expr::mul(Expr::scalar("alpha"), Expr::load("x", vec![Expr::scalar("i")])),
                    Expr::load("y", vec![Expr::scalar("i")]),
                ),
            }],
        );
        validate_program(&program).unwrap();
    }

    #[test]
    fn float_index_is_rejected() {
        let program = Program::loop_nest(
            "bad",
            symbols(),
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("alpha")],
                value: Expr::f64(0.0),
            }],
        );
        let message = validate_program(&program).unwrap_err().to_string();
        assert!(message.contains("not an integer"));
    }

    #[test]
    fn store_to_read_only_array_is_rejected() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array_with(
                "x",
                ScalarType::F64,
                1,
                crate::symbols::ArrayFlags::read_only(),
            );
        let program = Program::loop_nest(
            "bad",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "x".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::f64(1.0),
            }],
        );
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn math_on_integers_needs_casts() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("a", ScalarType::I64, 1);
        let program = Program::loop_nest(
            "bad",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "a".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::cast(
                    ScalarType::I64,
                    Expr::math(MathFn::Sqrt, vec![Expr::load("a", vec![Expr::scalar("i")])]),
                ),
            }],
        );
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn break_at_parallel_body_top_is_rejected() {
        let program = Program::loop_nest(
            "bad",
            symbols(),
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Break],
        );
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn assigning_an_induction_variable_is_rejected() {
        let program = Program::loop_nest(
            "bad",
            symbols(),
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::AssignScalar {
                name: "i".into(),
                value: Expr::i64(0),
            }],
        );
        let message = validate_program(&program).unwrap_err().to_string();
        assert!(message.contains("loop variable"));
    }
}
