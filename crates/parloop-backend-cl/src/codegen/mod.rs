//! OpenCL C generation from an analyzed plan.
//!
//! Generation runs in two stages. Lowering resolves types, bound-check
//! placement, and the parameter layout into one tree; emission renders
//! that tree as C text. The simulator platform interprets the same
//! lowered tree instead of the text, so both executions share one
//! definition of the kernel.

mod emit;
pub(crate) mod lower;
mod utils;

use std::sync::Arc;

use parloop::analysis::OffloadPlan;
use parloop::error::Result;
use parloop::exec::CheckConfig;
use parloop::ir::program::Program;

pub(crate) use lower::LoweredKernel;

/// A generated translation unit plus the lowered form it was rendered
/// from. The lowered form travels with the source so the simulator can
/// execute exactly what a native device would compile.
#[derive(Debug, Clone)]
pub struct KernelBundle {
    pub entry: String,
    pub source: String,
    pub lowered: Arc<LoweredKernel>,
}

pub fn generate(
    program: &Program,
    plan: &OffloadPlan,
    checks: &CheckConfig,
) -> Result<KernelBundle> {
    let lowered = lower::lower(program, plan, checks)?;
    let source = emit::emit(&lowered);
    Ok(KernelBundle {
        entry: lowered.entry.clone(),
        source,
        lowered: Arc::new(lowered),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parloop::analysis::build_plan;
    use parloop::ir::program::{Expr, Function, LoopLevel, Stmt};
    use parloop::ir::types::{Literal, ScalarType};
    use parloop::options::LoopOptions;
    use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};

    fn saxpy() -> (Program, Bindings) {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("a", ScalarType::F64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "saxpy",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(
                    Expr::mul(Expr::scalar("a"), Expr::load("x", vec![Expr::scalar("i")])),
                    Expr::load("y", vec![Expr::scalar("i")]),
                ),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(8)).unwrap();
        bindings.set_scalar("a", Literal::F64(2.0)).unwrap();
        for name in ["x", "y"] {
            bindings
                .set_array(name, ArrayRef::new(ArrayData::from_f64(vec![1.0; 8])))
                .unwrap();
        }
        (program, bindings)
    }

    fn source_of(program: &Program, bindings: &Bindings, checks: &CheckConfig) -> String {
        let plan = build_plan(program, bindings, &LoopOptions::default()).unwrap();
        generate(program, &plan, checks).unwrap().source
    }

    #[test]
    fn saxpy_kernel_shape() {
        let (program, bindings) = saxpy();
        let plan = build_plan(&program, &bindings, &LoopOptions::default()).unwrap();
        let bundle = generate(&program, &plan, &CheckConfig::None).unwrap();
        assert_eq!(bundle.entry, format!("pl_{:016x}", plan.structural_hash));
        let src = &bundle.source;
        assert!(src.starts_with("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
        assert!(src.contains(&format!("__kernel void {}(", bundle.entry)));
        assert!(src.contains("const double a"));
        assert!(src.contains("__global double *x"));
        assert!(src.contains("const long x_dim0"));
        assert!(src.contains("__global long *gv_overflow_flag"));
        assert!(src.contains("long i = (long)get_global_id(0) * gv_step0 + gv_off0;"));
        assert!(!src.contains("bc("));
    }

    #[test]
    fn instrumented_accesses_clamp_through_bc() {
        let (program, bindings) = saxpy();
        let src = source_of(&program, &bindings, &CheckConfig::All);
        assert!(src.contains("static long bc(__global long *flag"));
        assert!(src.contains("x[bc(gv_bound_flag, i, x_dim0)]"));
        assert!(src.contains("y[bc(gv_bound_flag, i, y_dim0)]"));
    }

    #[test]
    fn integer_arithmetic_uses_checked_helpers() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("v", ScalarType::I64, 1);
        let program = Program::loop_nest(
            "bump",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "v".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::add(Expr::load("v", vec![Expr::scalar("i")]), Expr::i64(1)),
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("v", ArrayRef::new(ArrayData::from_i64(vec![0; 4])))
            .unwrap();
        let src = source_of(&program, &bindings, &CheckConfig::None);
        assert!(src.contains("static long ck_add_i64(__global long *flag"));
        assert!(src.contains("ck_add_i64(gv_overflow_flag, v[(i)], 1L)"));
        // No floating point anywhere, so no fp64 pragma either.
        assert!(!src.contains("cl_khr_fp64"));
    }

    #[test]
    fn runtime_step_guards_against_zero() {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("stride", ScalarType::I64)
            .array("v", ScalarType::I64, 1);
        let program = Program::loop_nest(
            "strided",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::For {
                var: "k".into(),
                start: Expr::i64(0),
                stop: Expr::i64(10),
                step: Expr::scalar("stride"),
                body: vec![Stmt::Store {
                    array: "v".into(),
                    index: vec![Expr::scalar("i")],
                    value: Expr::scalar("k"),
                }],
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_scalar("stride", Literal::I64(3)).unwrap();
        bindings
            .set_array("v", ArrayRef::new(ArrayData::from_i64(vec![0; 4])))
            .unwrap();
        let src = source_of(&program, &bindings, &CheckConfig::None);
        assert!(src.contains("long gv_t0 = (long)(stride);"));
        assert!(src.contains("if (gv_t0 == 0) {"));
        assert!(src.contains("(gv_t0 > 0) ? (k < gv_e0) : (k > gv_e0)"));
    }

    #[test]
    fn functions_become_static_helpers_with_forwarded_scalars() {
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
        let src = source_of(&program, &bindings, &CheckConfig::None);
        assert!(src.contains(
            "static double fn_scale(double v, double alpha, __global long *gv_bound_flag, __global long *gv_overflow_flag) {"
        ));
        assert!(src.contains("fn_scale(y[(i)], alpha, gv_bound_flag, gv_overflow_flag)"));
    }

    #[test]
    fn function_array_reads_forward_the_pointer() {
        let lookup = Function {
            name: "lookup".into(),
            params: vec![("k".into(), ScalarType::I64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::load("table", vec![Expr::scalar("k")]))],
        };
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .array("table", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let program = Program::loop_nest(
            "apply",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            vec![Stmt::Store {
                array: "y".into(),
                index: vec![Expr::scalar("i")],
                value: Expr::Call {
                    func: "lookup".into(),
                    args: vec![Expr::scalar("i")],
                },
            }],
        )
        .with_functions(vec![lookup]);
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings
            .set_array("table", ArrayRef::new(ArrayData::from_f64(vec![0.5; 8])))
            .unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
            .unwrap();
        let src = source_of(&program, &bindings, &CheckConfig::None);
        // Function accesses are always clamped; only body accesses are
        // subject to selective instrumentation.
        assert!(src.contains(
            "static double fn_lookup(long k, __global double *table, const long table_dim0, __global long *gv_bound_flag, __global long *gv_overflow_flag) {"
        ));
        assert!(src.contains("return table[bc(gv_bound_flag, k, table_dim0)];"));
        assert!(src.contains("fn_lookup(i, table, table_dim0, gv_bound_flag, gv_overflow_flag)"));
    }

    #[test]
    fn reduction_kernel_folds_pairs_across_the_split() {
        let combine = Function {
            name: "combine".into(),
            params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
            ret: ScalarType::F64,
            body: vec![Stmt::Return(Expr::add(Expr::scalar("a"), Expr::scalar("b")))],
        };
        let symbols = SymbolTable::new().array("data", ScalarType::F64, 1);
        let program = Program::reduction("total", symbols, "data", combine);
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings
            .set_array("data", ArrayRef::new(ArrayData::from_f64(vec![1.0; 16])))
            .unwrap();
        let src = source_of(&program, &bindings, &CheckConfig::None);
        assert!(src.contains("const long gv_half"));
        assert!(src.contains("if (gv_i < gv_half && gv_i + gv_half < gv_n) {"));
        assert!(src.contains("data[gv_i] = (data[gv_i]) + (data[gv_i + gv_half]);"));
    }

    #[test]
    fn two_level_nest_reads_both_global_ids() {
        let symbols = SymbolTable::new()
            .scalar("rows", ScalarType::I64)
            .scalar("cols", ScalarType::I64)
            .array("m", ScalarType::F64, 2);
        let program = Program::loop_nest(
            "fill",
            symbols,
            LoopLevel::upto("r", Expr::scalar("rows")),
            vec![Stmt::For {
                var: "c".into(),
                start: Expr::i64(0),
                stop: Expr::scalar("cols"),
                step: Expr::i64(1),
                body: vec![Stmt::Store {
                    array: "m".into(),
                    index: vec![Expr::scalar("r"), Expr::scalar("c")],
                    value: Expr::f64(1.0),
                }],
            }],
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("rows", Literal::I64(4)).unwrap();
        bindings.set_scalar("cols", Literal::I64(4)).unwrap();
        bindings
            .set_array(
                "m",
                ArrayRef::new(ArrayData::zeros(ScalarType::F64, [4usize, 4usize].as_slice())),
            )
            .unwrap();
        let src = source_of(&program, &bindings, &CheckConfig::None);
        assert!(src.contains("long r = (long)get_global_id(0) * gv_step0 + gv_off0;"));
        assert!(src.contains("long c = (long)get_global_id(1) * gv_step1 + gv_off1;"));
        assert!(src.contains("m[((r)) * m_dim1 + (c)] = 1.0;"));
    }
}
