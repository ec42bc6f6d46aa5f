use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};

/// Scalar element types the pipeline understands.
///
/// `I32` and `I64` carry guest integer semantics (arithmetic that would leave
/// the representable range is a violation, not a wrap), `F64` is IEEE double,
/// `Bool` is a logical value stored as one byte on devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    I32,
    I64,
    F64,
    Bool,
}

impl ScalarType {
    pub fn is_integer(self) -> bool {
        matches!(self, ScalarType::I32 | ScalarType::I64)
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ScalarType::Bool)
    }

    /// Size of one element in device buffers.
    pub fn byte_width(self) -> usize {
        match self {
            ScalarType::I32 => 4,
            ScalarType::I64 => 8,
            ScalarType::F64 => 8,
            ScalarType::Bool => 1,
        }
    }

    /// Spelling in generated device source.
    pub fn cl_name(self) -> &'static str {
        match self {
            ScalarType::I32 => "int",
            ScalarType::I64 => "long",
            ScalarType::F64 => "double",
            ScalarType::Bool => "uchar",
        }
    }

    /// The joined type of a two-operand numeric expression, following the
    /// usual promotion ladder i32 < i64 < f64.
    pub fn promote(self, other: ScalarType) -> Result<ScalarType> {
        use ScalarType::*;
        match (self, other) {
            (Bool, _) | (_, Bool) => Err(OffloadError::unsupported(
                "type inference",
                "boolean operand in arithmetic position",
            )),
            (F64, _) | (_, F64) => Ok(F64),
            (I64, _) | (_, I64) => Ok(I64),
            (I32, I32) => Ok(I32),
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
        };
        write!(f, "{name}")
    }
}

/// A concrete scalar value, used for constants in the IR and for scalar
/// bindings in the activation record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    I32(i32),
    I64(i64),
    F64(f64),
    Bool(bool),
}

impl Literal {
    pub fn ty(self) -> ScalarType {
        match self {
            Literal::I32(_) => ScalarType::I32,
            Literal::I64(_) => ScalarType::I64,
            Literal::F64(_) => ScalarType::F64,
            Literal::Bool(_) => ScalarType::Bool,
        }
    }

    /// Integer view; `None` for floats and booleans.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Literal::I32(v) => Some(i64::from(v)),
            Literal::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            Literal::I32(v) => Some(f64::from(v)),
            Literal::I64(v) => Some(v as f64),
            Literal::F64(v) => Some(v),
            Literal::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Zero of the given type, the initial value of declared kernel scalars.
    pub fn zero(ty: ScalarType) -> Literal {
        match ty {
            ScalarType::I32 => Literal::I32(0),
            ScalarType::I64 => Literal::I64(0),
            ScalarType::F64 => Literal::F64(0.0),
            ScalarType::Bool => Literal::Bool(false),
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::I32(v) => write!(f, "{v}"),
            Literal::I64(v) => write!(f, "{v}"),
            Literal::F64(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Built-in math functions callable from loop bodies.
///
/// Each entry maps to the matching device builtin and to a host
/// interpretation; the per-call-site blacklist can veto any of them before
/// code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFn {
    Sqrt,
    Fabs,
    Exp,
    Log,
    Pow,
    Sin,
    Cos,
    Floor,
    Ceil,
    Min,
    Max,
    Abs,
}

impl MathFn {
    pub fn name(self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Fabs => "fabs",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Pow => "pow",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Min => "min",
            MathFn::Max => "max",
            MathFn::Abs => "abs",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFn::Pow | MathFn::Min | MathFn::Max => 2,
            _ => 1,
        }
    }

    /// Functions defined only over floating-point operands.
    pub fn float_only(self) -> bool {
        !matches!(self, MathFn::Min | MathFn::Max | MathFn::Abs)
    }

    /// Result type given the promoted operand type.
    pub fn result_type(self, operand: ScalarType) -> Result<ScalarType> {
        if self.float_only() && operand != ScalarType::F64 {
            return Err(OffloadError::unsupported(
                "type inference",
                format!("math function '{}' requires f64 operands", self.name()),
            ));
        }
        if !operand.is_numeric() {
            return Err(OffloadError::unsupported(
                "type inference",
                format!("math function '{}' applied to a boolean", self.name()),
            ));
        }
        Ok(operand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_ladder() {
        assert_eq!(
            ScalarType::I32.promote(ScalarType::I64).unwrap(),
            ScalarType::I64
        );
        assert_eq!(
            ScalarType::I64.promote(ScalarType::F64).unwrap(),
            ScalarType::F64
        );
        assert_eq!(
            ScalarType::I32.promote(ScalarType::I32).unwrap(),
            ScalarType::I32
        );
        assert!(ScalarType::Bool.promote(ScalarType::I32).is_err());
    }

    #[test]
    fn math_typing() {
        assert!(MathFn::Sqrt.result_type(ScalarType::I32).is_err());
        assert_eq!(
            MathFn::Max.result_type(ScalarType::I64).unwrap(),
            ScalarType::I64
        );
        assert_eq!(MathFn::Pow.arity(), 2);
    }
}
