pub mod program;
pub mod types;

pub use program::{
    BinOp, Expr, Function, LoopLevel, LoopNest, Program, ProgramKind, ReduceSpec, Stmt, UnOp,
};
pub use types::{Literal, MathFn, ScalarType};
