//! Device selection over the simulator's deterministic timing model. The
//! fake GPU has a high launch cost and trivial per-item cost, the fake CPU
//! the opposite, so the audition must settle on the CPU for small
//! workloads and on the GPU for large ones.

use parloop::analysis::build_plan;
use parloop::config::TuningConfig;
use parloop::exec::{Outcome, ScheduleSide};
use parloop::ir::program::{Expr, LoopLevel, Program, Stmt};
use parloop::ir::types::{Literal, ScalarType};
use parloop::options::{LoopOptions, TargetMode};
use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};
use parloop_backend_cl::fresh_sim_backend;
use parloop_backend_tests::harness::site_with;

fn scale_program() -> Program {
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    Program::loop_nest(
        "scale",
        symbols,
        LoopLevel::upto("i", Expr::scalar("n")),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::mul(Expr::f64(2.0), Expr::load("x", vec![Expr::scalar("i")])),
        }],
    )
}

fn scale_bindings(program: &Program, n: usize) -> Bindings {
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array(
            "x",
            ArrayRef::new(ArrayData::from_f64((0..n).map(|i| i as f64).collect())),
        )
        .unwrap();
    bindings
        .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
        .unwrap();
    bindings
}

fn assert_scaled(bindings: &Bindings, n: usize) {
    let y = bindings.array("y").unwrap().lock();
    assert_eq!(y.len(), n);
    for flat in 0..n {
        assert_eq!(y.get(flat), Literal::F64(2.0 * flat as f64), "y[{flat}]");
    }
}

#[test]
fn auditions_settle_per_workload_size() {
    let backend = fresh_sim_backend(&TuningConfig::default()).unwrap();
    let program = scale_program();
    let s = site_with(
        program.clone(),
        &backend,
        TuningConfig::default(),
        LoopOptions::default(),
    );
    let small = scale_bindings(&program, 2_000);
    let large = scale_bindings(&program, 60_000);
    let hash = build_plan(&program, &small, &LoopOptions::default())
        .unwrap()
        .structural_hash;

    for _ in 0..3 {
        assert_eq!(s.guard.call(&small).unwrap(), Outcome::Unit);
        assert_eq!(s.guard.call(&large).unwrap(), Outcome::Unit);
    }

    assert_eq!(s.baseline.calls(), 0);
    // 2k items: 70us on the fake CPU against 202us on the fake GPU.
    assert_eq!(
        s.context.schedule().committed(hash, 2_000),
        Some(ScheduleSide::Cpu)
    );
    // 60k items: 1.52ms on the fake CPU against 260us on the fake GPU.
    assert_eq!(
        s.context.schedule().committed(hash, 60_000),
        Some(ScheduleSide::Gpu)
    );
    assert_scaled(&small, 2_000);
    assert_scaled(&large, 60_000);
}

#[test]
fn pinned_targets_commit_their_side_and_agree() {
    let backend = fresh_sim_backend(&TuningConfig::default()).unwrap();
    let program = scale_program();
    let n = 4_096usize;
    let hash = build_plan(&program, &scale_bindings(&program, n), &LoopOptions::default())
        .unwrap()
        .structural_hash;

    let on_gpu = site_with(
        program.clone(),
        &backend,
        TuningConfig::default(),
        LoopOptions {
            target_mode: TargetMode::Gpu,
            ..LoopOptions::default()
        },
    );
    let gpu_bindings = scale_bindings(&program, n);
    assert_eq!(on_gpu.guard.call(&gpu_bindings).unwrap(), Outcome::Unit);
    // A single admissible side commits without an audition.
    assert_eq!(
        on_gpu.context.schedule().committed(hash, n as i64),
        Some(ScheduleSide::Gpu)
    );

    let on_cpu = site_with(
        program.clone(),
        &backend,
        TuningConfig::default(),
        LoopOptions {
            target_mode: TargetMode::Cpu,
            ..LoopOptions::default()
        },
    );
    let cpu_bindings = scale_bindings(&program, n);
    assert_eq!(on_cpu.guard.call(&cpu_bindings).unwrap(), Outcome::Unit);
    assert_eq!(
        on_cpu.context.schedule().committed(hash, n as i64),
        Some(ScheduleSide::Cpu)
    );

    assert_eq!(on_gpu.baseline.calls(), 0);
    assert_eq!(on_cpu.baseline.calls(), 0);
    // Both devices run the same lowered kernel; results are bit-identical.
    let gpu_y = gpu_bindings.array("y").unwrap().lock();
    let cpu_y = cpu_bindings.array("y").unwrap().lock();
    for flat in 0..n {
        assert_eq!(gpu_y.get(flat), cpu_y.get(flat), "y[{flat}]");
    }
}
