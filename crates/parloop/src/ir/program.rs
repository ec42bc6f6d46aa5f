use serde::{Deserialize, Serialize};

use crate::ir::types::{Literal, MathFn, ScalarType};
use crate::symbols::SymbolTable;

/// Two-operand operators. Comparison operators produce `Bool`, logical
/// operators take `Bool`, the rest follow numeric promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    /// Integer instances of these can leave the representable range and are
    /// emitted through checked helpers on devices.
    pub fn overflow_sensitive(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// Expression nodes. One enum, one evaluator, one generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(Literal),
    /// Read of a scalar binding, induction variable, or kernel-local scalar.
    Scalar(String),
    /// Array element read; one index expression per dimension.
    Load { array: String, index: Vec<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Math { func: MathFn, args: Vec<Expr> },
    /// Call of a user scalar function declared on the program.
    Call { func: String, args: Vec<Expr> },
    Cast { to: ScalarType, operand: Box<Expr> },
}

impl Expr {
    pub fn i32(v: i32) -> Expr {
        Expr::Const(Literal::I32(v))
    }

    pub fn i64(v: i64) -> Expr {
        Expr::Const(Literal::I64(v))
    }

    pub fn f64(v: f64) -> Expr {
        Expr::Const(Literal::F64(v))
    }

    pub fn scalar(name: impl Into<String>) -> Expr {
        Expr::Scalar(name.into())
    }

    pub fn load(array: impl Into<String>, index: Vec<Expr>) -> Expr {
        Expr::Load {
            array: array.into(),
            index,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, lhs, rhs)
    }

    pub fn math(func: MathFn, args: Vec<Expr>) -> Expr {
        Expr::Math { func, args }
    }

    pub fn cast(to: ScalarType, operand: Expr) -> Expr {
        Expr::Cast {
            to,
            operand: Box::new(operand),
        }
    }
}

/// Statement nodes allowed inside loop bodies and user functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Kernel-local scalar, hoisted to the top of the generated body and
    /// zero-initialized when no initializer is given.
    DeclScalar {
        name: String,
        ty: ScalarType,
        init: Option<Expr>,
    },
    AssignScalar {
        name: String,
        value: Expr,
    },
    Store {
        array: String,
        index: Vec<Expr>,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    /// Sequential counted loop. At the top of a parallel level's body a
    /// perfectly nested `For` is a fusion candidate.
    For {
        var: String,
        start: Expr,
        stop: Expr,
        step: Expr,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    Break,
    /// Only valid as the last statement of a user function body.
    Return(Expr),
}

/// A user scalar function callable from loop bodies. Emitted as a device
/// helper with the runtime flag parameters appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<(String, ScalarType)>,
    pub ret: ScalarType,
    pub body: Vec<Stmt>,
}

/// One parallel loop level: induction variable plus half-open range
/// expressions resolved against the activation record at call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopLevel {
    pub var: String,
    pub start: Expr,
    pub stop: Expr,
    pub step: Expr,
}

impl LoopLevel {
    pub fn new(var: impl Into<String>, start: Expr, stop: Expr, step: Expr) -> Self {
        LoopLevel {
            var: var.into(),
            start,
            stop,
            step,
        }
    }

    /// `for v in 0..stop` with unit step.
    pub fn upto(var: impl Into<String>, stop: Expr) -> Self {
        LoopLevel::new(var, Expr::i64(0), stop, Expr::i64(1))
    }
}

/// The outer loop plus its body. Deeper parallelism is written as nested
/// `Stmt::For` statements and promoted to levels by the fusion pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNest {
    pub level: LoopLevel,
    pub body: Vec<Stmt>,
}

/// A fold of one array through a two-parameter combining function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub array: String,
    pub func: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgramKind {
    Loop(LoopNest),
    Reduce(ReduceSpec),
}

/// A complete offload candidate: symbol declarations, user functions, and
/// either a loop nest or a reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub symbols: SymbolTable,
    pub functions: Vec<Function>,
    pub kind: ProgramKind,
}

impl Program {
    pub fn loop_nest(
        name: impl Into<String>,
        symbols: SymbolTable,
        level: LoopLevel,
        body: Vec<Stmt>,
    ) -> Self {
        Program {
            name: name.into(),
            symbols,
            functions: Vec::new(),
            kind: ProgramKind::Loop(LoopNest { level, body }),
        }
    }

    pub fn reduction(
        name: impl Into<String>,
        symbols: SymbolTable,
        array: impl Into<String>,
        func: Function,
    ) -> Self {
        let spec = ReduceSpec {
            array: array.into(),
            func: func.name.clone(),
        };
        Program {
            name: name.into(),
            symbols,
            functions: vec![func],
            kind: ProgramKind::Reduce(spec),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
