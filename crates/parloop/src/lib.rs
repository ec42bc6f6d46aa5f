extern crate self as parloop;

pub use linkme;

pub mod analysis;
pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod guard;
pub mod hashing;
pub mod ir;
pub mod options;
pub mod schedule;
pub mod snapshot;
pub mod symbols;
pub mod telemetry;

pub use config::{BoundCheckMode, PlatformKind, TuningConfig};
pub use context::CompilerContext;
pub use error::{OffloadError, Result, SnapshotError};
pub use exec::{BaselineExecutor, DeviceHandle, OffloadBackend, Outcome};
pub use guard::OffloadGuard;
pub use ir::program::{Expr, Function, LoopLevel, Program, Stmt};
pub use ir::types::{Literal, MathFn, ScalarType};
pub use options::{LoopOptions, TargetMode};
pub use snapshot::Snapshot;
pub use symbols::{ArrayData, ArrayFlags, ArrayRef, Bindings, SymbolTable};
