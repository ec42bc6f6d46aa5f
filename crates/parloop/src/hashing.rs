use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ir::program::{Expr, Function, LoopLevel, Program, ProgramKind, Stmt};
use crate::ir::types::Literal;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: Hash>(&mut self, value: &T) {
        value.hash(&mut self.inner);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.inner.write_u8(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.inner.write_u64(value);
    }

    pub fn finish(self) -> u64 {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

/// Structural fingerprint of a program: symbol declarations, user functions,
/// and the loop or reduction shape, including literal constants. The program
/// name is deliberately left out so identically shaped call-sites share one
/// generated kernel.
pub fn structural_hash(program: &Program) -> u64 {
    let mut hasher = FingerprintHasher::new();
    for decl in program.symbols.iter() {
        hasher.write(&decl.name);
        hasher.write(&decl.kind);
    }
    hasher.write_u8(0xfe);
    for function in &program.functions {
        hash_function(&mut hasher, function);
    }
    hasher.write_u8(0xfd);
    match &program.kind {
        ProgramKind::Loop(nest) => {
            hasher.write_u8(1);
            hash_level(&mut hasher, &nest.level);
            hash_body(&mut hasher, &nest.body);
        }
        ProgramKind::Reduce(spec) => {
            hasher.write_u8(2);
            hasher.write(&spec.array);
            hasher.write(&spec.func);
        }
    }
    hasher.finish()
}

fn hash_function(hasher: &mut FingerprintHasher, function: &Function) {
    hasher.write(&function.name);
    for (name, ty) in &function.params {
        hasher.write(name);
        hasher.write(ty);
    }
    hasher.write(&function.ret);
    hash_body(hasher, &function.body);
}

fn hash_level(hasher: &mut FingerprintHasher, level: &LoopLevel) {
    hasher.write(&level.var);
    hash_expr(hasher, &level.start);
    hash_expr(hasher, &level.stop);
    hash_expr(hasher, &level.step);
}

fn hash_body(hasher: &mut FingerprintHasher, body: &[Stmt]) {
    hasher.write_u64(body.len() as u64);
    for stmt in body {
        hash_stmt(hasher, stmt);
    }
}

fn hash_stmt(hasher: &mut FingerprintHasher, stmt: &Stmt) {
    match stmt {
        Stmt::DeclScalar { name, ty, init } => {
            hasher.write_u8(1);
            hasher.write(name);
            hasher.write(ty);
            if let Some(init) = init {
                hasher.write_u8(1);
                hash_expr(hasher, init);
            } else {
                hasher.write_u8(0);
            }
        }
        Stmt::AssignScalar { name, value } => {
            hasher.write_u8(2);
            hasher.write(name);
            hash_expr(hasher, value);
        }
        Stmt::Store {
            array,
            index,
            value,
        } => {
            hasher.write_u8(3);
            hasher.write(array);
            hash_exprs(hasher, index);
            hash_expr(hasher, value);
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            hasher.write_u8(4);
            hash_expr(hasher, cond);
            hash_body(hasher, then_body);
            hash_body(hasher, else_body);
        }
        Stmt::For {
            var,
            start,
            stop,
            step,
            body,
        } => {
            hasher.write_u8(5);
            hasher.write(var);
            hash_expr(hasher, start);
            hash_expr(hasher, stop);
            hash_expr(hasher, step);
            hash_body(hasher, body);
        }
        Stmt::While { cond, body } => {
            hasher.write_u8(6);
            hash_expr(hasher, cond);
            hash_body(hasher, body);
        }
        Stmt::Break => hasher.write_u8(7),
        Stmt::Return(value) => {
            hasher.write_u8(8);
            hash_expr(hasher, value);
        }
    }
}

fn hash_exprs(hasher: &mut FingerprintHasher, exprs: &[Expr]) {
    hasher.write_u64(exprs.len() as u64);
    for expr in exprs {
        hash_expr(hasher, expr);
    }
}

fn hash_expr(hasher: &mut FingerprintHasher, expr: &Expr) {
    match expr {
        Expr::Const(lit) => {
            hasher.write_u8(1);
            match lit {
                Literal::I32(v) => {
                    hasher.write_u8(1);
                    hasher.write(v);
                }
                Literal::I64(v) => {
                    hasher.write_u8(2);
                    hasher.write(v);
                }
                Literal::F64(v) => {
                    hasher.write_u8(3);
                    hasher.write_u64(v.to_bits());
                }
                Literal::Bool(v) => {
                    hasher.write_u8(4);
                    hasher.write(v);
                }
            }
        }
        Expr::Scalar(name) => {
            hasher.write_u8(2);
            hasher.write(name);
        }
        Expr::Load { array, index } => {
            hasher.write_u8(3);
            hasher.write(array);
            hash_exprs(hasher, index);
        }
        Expr::Unary { op, operand } => {
            hasher.write_u8(4);
            hasher.write(op);
            hash_expr(hasher, operand);
        }
        Expr::Binary { op, lhs, rhs } => {
            hasher.write_u8(5);
            hasher.write(op);
            hash_expr(hasher, lhs);
            hash_expr(hasher, rhs);
        }
        Expr::Math { func, args } => {
            hasher.write_u8(6);
            hasher.write(func);
            hash_exprs(hasher, args);
        }
        Expr::Call { func, args } => {
            hasher.write_u8(7);
            hasher.write(func);
            hash_exprs(hasher, args);
        }
        Expr::Cast { to, operand } => {
            hasher.write_u8(8);
            hasher.write(to);
            hash_expr(hasher, operand);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::program::{BinOp, LoopLevel, Program, Stmt};
    use crate::ir::types::ScalarType;
    use crate::symbols::SymbolTable;

    fn saxpy_like(name: &str, coeff: f64) -> Program {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::mul(Expr::f64(coeff), Expr::load("x", vec![Expr::scalar("i")])),
                Expr::load("y", vec![Expr::scalar("i")]),
            ),
        }];
        Program::loop_nest(
            name,
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            body,
        )
    }

    #[test]
    fn identical_shapes_share_a_fingerprint() {
        let a = saxpy_like("site_a", 2.0);
        let b = saxpy_like("site_b", 2.0);
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn literal_changes_move_the_fingerprint() {
        let a = saxpy_like("site", 2.0);
        let b = saxpy_like("site", 3.0);
        assert_ne!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn operator_changes_move_the_fingerprint() {
        let mut a = saxpy_like("site", 2.0);
        let b = saxpy_like("site", 2.0);
        if let crate::ir::program::ProgramKind::Loop(nest) = &mut a.kind {
            if let Stmt::Store { value, .. } = &mut nest.body[0] {
                if let Expr::Binary { op, .. } = value {
                    *op = BinOp::Sub;
                }
            }
        }
        assert_ne!(structural_hash(&a), structural_hash(&b));
    }
}
