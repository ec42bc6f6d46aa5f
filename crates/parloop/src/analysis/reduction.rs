use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};
use crate::ir::program::{BinOp, Expr, Function, Stmt};
use crate::ir::types::MathFn;

/// Recognized combining operations for reductions. `Custom` is only reached
/// through the per-call-site override and keeps the user's function as the
/// combiner on both execution paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionKind {
    Add,
    Mul,
    Min,
    Max,
    Custom,
}

impl ReductionKind {
    pub fn name(self) -> &'static str {
        match self {
            ReductionKind::Add => "add",
            ReductionKind::Mul => "mul",
            ReductionKind::Min => "min",
            ReductionKind::Max => "max",
            ReductionKind::Custom => "custom",
        }
    }
}

/// Decide whether a two-parameter function is an admissible reduction
/// combiner.
///
/// The accepted shape is exactly `return a OP b` with OP one of `+`, `*`,
/// `min`, `max` and `{a, b}` the two formal parameters in either order.
/// Any other body is rejected unless the caller set the override, in which
/// case the function runs as an opaque combiner and the caller vouches for
/// associativity.
pub fn classify(function: &Function, reduction_override: bool) -> Result<ReductionKind> {
    if function.params.len() == 2 {
        if let [Stmt::Return(expr)] = function.body.as_slice() {
            let a = function.params[0].0.as_str();
            let b = function.params[1].0.as_str();
            if let Some(kind) = match_combiner(expr, a, b) {
                return Ok(kind);
            }
        }
    }
    if reduction_override {
        return Ok(ReductionKind::Custom);
    }
    Err(OffloadError::unsupported(
        format!("reduction '{}'", function.name),
        "combining function is not a plain a+b, a*b, min(a,b) or max(a,b) over its two parameters",
    ))
}

fn match_combiner(expr: &Expr, a: &str, b: &str) -> Option<ReductionKind> {
    match expr {
        Expr::Binary { op, lhs, rhs } => {
            let kind = match op {
                BinOp::Add => ReductionKind::Add,
                BinOp::Mul => ReductionKind::Mul,
                _ => return None,
            };
            both_formals(lhs, rhs, a, b).then_some(kind)
        }
        Expr::Math { func, args } => {
            let kind = match func {
                MathFn::Min => ReductionKind::Min,
                MathFn::Max => ReductionKind::Max,
                _ => return None,
            };
            if let [lhs, rhs] = args.as_slice() {
                both_formals(lhs, rhs, a, b).then_some(kind)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn both_formals(lhs: &Expr, rhs: &Expr, a: &str, b: &str) -> bool {
    match (lhs, rhs) {
        (Expr::Scalar(x), Expr::Scalar(y)) => {
            (x == a && y == b) || (x == b && y == a)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::ScalarType;

    fn combiner(body: Expr) -> Function {
        Function {
            name: "combine".into(),
            params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(body)],
        }
    }

    #[test]
    fn sum_and_max_are_whitelisted() {
        let sum = combiner(Expr::add(Expr::scalar("a"), Expr::scalar("b")));
        assert_eq!(classify(&sum, false).unwrap(), ReductionKind::Add);

        let max = combiner(Expr::math(
            MathFn::Max,
            vec![Expr::scalar("b"), Expr::scalar("a")],
        ));
        assert_eq!(classify(&max, false).unwrap(), ReductionKind::Max);
    }

    #[test]
    fn subtraction_is_rejected_without_override() {
        let sub = combiner(Expr::sub(Expr::scalar("a"), Expr::scalar("b")));
        let err = classify(&sub, false).unwrap_err();
        assert!(err.to_string().contains("combining function"));
        assert_eq!(classify(&sub, true).unwrap(), ReductionKind::Custom);
    }

    #[test]
    fn formals_must_appear_exactly() {
        // a + a reuses one formal; not a combiner.
        let doubled = combiner(Expr::add(Expr::scalar("a"), Expr::scalar("a")));
        assert!(classify(&doubled, false).is_err());

        // (a + b) * 1 has the right value but not the whitelisted shape.
        let wrapped = combiner(Expr::mul(
            Expr::add(Expr::scalar("a"), Expr::scalar("b")),
            Expr::f64(1.0),
        ));
        assert!(classify(&wrapped, false).is_err());
    }
}
