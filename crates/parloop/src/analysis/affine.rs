use std::collections::BTreeMap;

use crate::ir::program::{BinOp, Expr, UnOp};
use crate::ir::types::Literal;

/// An index expression in affine normal form: integer-coefficient terms over
/// loop variables, plus terms over call-constant scalars, plus a constant.
///
/// Loop variables (parallel levels and sequential inner loops) and bound
/// scalars are kept in separate maps because they quantify differently in
/// the dependence test: scalars hold one value for a whole call, loop
/// variables range per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affine {
    pub vars: BTreeMap<String, i64>,
    pub syms: BTreeMap<String, i64>,
    pub constant: i64,
}

impl Affine {
    fn constant(value: i64) -> Affine {
        Affine {
            constant: value,
            ..Affine::default()
        }
    }

    fn var(name: &str) -> Affine {
        let mut vars = BTreeMap::new();
        vars.insert(name.to_string(), 1);
        Affine {
            vars,
            ..Affine::default()
        }
    }

    fn sym(name: &str) -> Affine {
        let mut syms = BTreeMap::new();
        syms.insert(name.to_string(), 1);
        Affine {
            syms,
            ..Affine::default()
        }
    }

    fn checked_add(&self, other: &Affine) -> Option<Affine> {
        let mut out = self.clone();
        for (name, c) in &other.vars {
            let slot = out.vars.entry(name.clone()).or_insert(0);
            *slot = slot.checked_add(*c)?;
        }
        for (name, c) in &other.syms {
            let slot = out.syms.entry(name.clone()).or_insert(0);
            *slot = slot.checked_add(*c)?;
        }
        out.constant = out.constant.checked_add(other.constant)?;
        out.prune();
        Some(out)
    }

    fn checked_scale(&self, factor: i64) -> Option<Affine> {
        let mut out = Affine::constant(self.constant.checked_mul(factor)?);
        for (name, c) in &self.vars {
            out.vars.insert(name.clone(), c.checked_mul(factor)?);
        }
        for (name, c) in &self.syms {
            out.syms.insert(name.clone(), c.checked_mul(factor)?);
        }
        out.prune();
        Some(out)
    }

    fn prune(&mut self) {
        self.vars.retain(|_, c| *c != 0);
        self.syms.retain(|_, c| *c != 0);
    }

    /// True when no loop variable or scalar term remains.
    pub fn is_constant(&self) -> bool {
        self.vars.is_empty() && self.syms.is_empty()
    }

    /// The single loop-variable term, if that is all there is besides
    /// scalar terms and the constant.
    pub fn single_var(&self) -> Option<(&str, i64)> {
        if self.vars.len() == 1 {
            let (name, c) = self.vars.iter().next()?;
            Some((name.as_str(), *c))
        } else {
            None
        }
    }
}

/// Outcome of affine extraction for one index expression.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexForm {
    Affine(Affine),
    /// Structurally valid but not affine (divisions, indirect loads,
    /// variable products, values computed in the body). Reads through these
    /// stay eligible with runtime bound checks; writes through these cannot
    /// be proven disjoint.
    Opaque,
}

/// Classification of the names an index expression may mention.
pub struct IndexEnv<'a> {
    /// Parallel level variables plus sequential inner-loop variables.
    pub loop_vars: &'a [String],
    /// Scalars assigned anywhere in the body; a term over one of these is
    /// not constant across the call and poisons affinity.
    pub assigned_scalars: &'a dyn Fn(&str) -> bool,
    /// Scalars declared in the symbol table (call constants once bound).
    pub bound_scalars: &'a dyn Fn(&str) -> bool,
}

/// Reduce an index expression to affine normal form over the environment.
/// Returns `Opaque` whenever any sub-term falls outside the affine fragment.
pub fn affine_of(expr: &Expr, env: &IndexEnv<'_>) -> IndexForm {
    match try_affine(expr, env) {
        Some(form) => IndexForm::Affine(form),
        None => IndexForm::Opaque,
    }
}

fn try_affine(expr: &Expr, env: &IndexEnv<'_>) -> Option<Affine> {
    match expr {
        Expr::Const(Literal::I32(v)) => Some(Affine::constant(i64::from(*v))),
        Expr::Const(Literal::I64(v)) => Some(Affine::constant(*v)),
        Expr::Const(_) => None,
        Expr::Scalar(name) => {
            if env.loop_vars.iter().any(|v| v == name) {
                Some(Affine::var(name))
            } else if (env.assigned_scalars)(name) {
                // Mutated in the body, value differs per iteration.
                None
            } else if (env.bound_scalars)(name) {
                Some(Affine::sym(name))
            } else {
                None
            }
        }
        Expr::Unary {
            op: UnOp::Neg,
            operand,
        } => try_affine(operand, env)?.checked_scale(-1),
        Expr::Unary { op: UnOp::Not, .. } => None,
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::Add => {
                let l = try_affine(lhs, env)?;
                let r = try_affine(rhs, env)?;
                l.checked_add(&r)
            }
            BinOp::Sub => {
                let l = try_affine(lhs, env)?;
                let r = try_affine(rhs, env)?.checked_scale(-1)?;
                l.checked_add(&r)
            }
            BinOp::Mul => {
                let l = try_affine(lhs, env)?;
                let r = try_affine(rhs, env)?;
                if l.is_constant() {
                    r.checked_scale(l.constant)
                } else if r.is_constant() {
                    l.checked_scale(r.constant)
                } else {
                    None
                }
            }
            _ => None,
        },
        Expr::Cast { to, operand } => {
            // Integer widening keeps affinity; anything else leaves it.
            if to.is_integer() {
                try_affine(operand, env)
            } else {
                None
            }
        }
        Expr::Load { .. } | Expr::Math { .. } | Expr::Call { .. } => None,
    }
}
