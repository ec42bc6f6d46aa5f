//! Deterministic end-to-end scenarios. Each one drives a guard against the
//! backend under test and checks the contract a caller relies on: correct
//! results, correct fallbacks, and no mutation left behind by a rejected
//! launch.

use std::sync::Arc;
use std::time::Duration;

use parloop::config::TuningConfig;
use parloop::exec::{OffloadBackend, Outcome};
use parloop::ir::program::{Expr, Function, LoopLevel, Program, Stmt};
use parloop::ir::types::{Literal, ScalarType};
use parloop::symbols::{ArrayData, ArrayRef, Bindings, SymbolTable};

use crate::harness::{eager_config, site};

pub fn saxpy_offloads_and_matches_the_host(backend: &Arc<dyn OffloadBackend>) {
    let program = saxpy_program();
    let s = site(program.clone(), backend, TuningConfig::default());
    let bindings = saxpy_bindings(&program, 4096);

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);

    assert_eq!(s.guard.state_label(), "ready");
    assert_eq!(s.baseline.calls(), 0, "the call was expected to offload");
    let y = f64_contents(&bindings, "y");
    for (i, v) in y.iter().enumerate() {
        assert_eq!(*v, 2.0 * i as f64 + 1.0, "y[{i}]");
    }
}

pub fn small_trip_counts_stay_sequential(backend: &Arc<dyn OffloadBackend>) {
    let program = saxpy_program();
    let s = site(program.clone(), backend, TuningConfig::default());
    let bindings = saxpy_bindings(&program, 64);

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);

    assert_eq!(s.baseline.calls(), 1);
    assert_eq!(s.context.cache_stats().builds, 0, "no kernel for a tiny loop");
    assert_eq!(s.guard.state_label(), "ready");
    let y = f64_contents(&bindings, "y");
    for (i, v) in y.iter().enumerate() {
        assert_eq!(*v, 2.0 * i as f64 + 1.0, "y[{i}]");
    }
}

pub fn loop_carried_recurrences_never_offload(backend: &Arc<dyn OffloadBackend>) {
    let n = 512usize;
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    let program = Program::loop_nest(
        "prefix_sum",
        symbols,
        LoopLevel::new("i", Expr::i64(1), Expr::scalar("n"), Expr::i64(1)),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::load("y", vec![Expr::sub(Expr::scalar("i"), Expr::i64(1))]),
                Expr::load("x", vec![Expr::scalar("i")]),
            ),
        }],
    );
    let s = site(program.clone(), backend, eager_config());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array("x", ArrayRef::new(ArrayData::from_f64(vec![1.0; n])))
        .unwrap();
    bindings
        .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
        .unwrap();

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);

    assert_eq!(s.baseline.calls(), 1);
    assert_eq!(s.context.cache_stats().builds, 0);
    // The verdict is re-checked per call, so the site stays ready.
    assert_eq!(s.guard.state_label(), "ready");
    let y = f64_contents(&bindings, "y");
    for (i, v) in y.iter().enumerate() {
        assert_eq!(*v, i as f64, "y[{i}]");
    }
}

pub fn nested_fills_fuse_and_offload(backend: &Arc<dyn OffloadBackend>) {
    let (rows, cols) = (64usize, 64usize);
    let symbols = SymbolTable::new().array("cells", ScalarType::I64, 2);
    let program = Program::loop_nest(
        "fill_grid",
        symbols,
        LoopLevel::upto("i", Expr::i64(rows as i64)),
        vec![Stmt::For {
            var: "j".into(),
            start: Expr::i64(0),
            stop: Expr::i64(cols as i64),
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "cells".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: Expr::add(
                    Expr::mul(Expr::scalar("i"), Expr::i64(cols as i64)),
                    Expr::scalar("j"),
                ),
            }],
        }],
    );
    let s = site(program.clone(), backend, TuningConfig::default());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings
        .set_array(
            "cells",
            ArrayRef::new(ArrayData::zeros(ScalarType::I64, vec![rows, cols])),
        )
        .unwrap();

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);

    // 64 x 64 clears the default threshold only because both levels fused.
    assert_eq!(s.baseline.calls(), 0);
    assert_eq!(s.guard.state_label(), "ready");
    let cells = i64_contents(&bindings, "cells");
    for (flat, v) in cells.iter().enumerate() {
        assert_eq!(*v, flat as i64, "cells[{flat}]");
    }
}

pub fn aliased_outputs_fall_back_to_the_host(backend: &Arc<dyn OffloadBackend>) {
    // z[i] = x[i + 1] is parallel while z and x are distinct storage and a
    // forward recurrence once they share it.
    let n = 64usize;
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("z", ScalarType::F64, 1);
    let program = Program::loop_nest(
        "shift",
        symbols,
        LoopLevel::upto("i", Expr::sub(Expr::scalar("n"), Expr::i64(1))),
        vec![Stmt::Store {
            array: "z".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("x", vec![Expr::add(Expr::scalar("i"), Expr::i64(1))]),
        }],
    );
    let s = site(program.clone(), backend, eager_config());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array(
            "x",
            ArrayRef::new(ArrayData::from_f64((0..n).map(|i| i as f64).collect())),
        )
        .unwrap();
    bindings
        .set_array("z", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
        .unwrap();

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);
    assert_eq!(s.baseline.calls(), 0);
    let z = f64_contents(&bindings, "z");
    for (i, v) in z.iter().take(n - 1).enumerate() {
        assert_eq!(*v, (i + 1) as f64, "z[{i}]");
    }
    assert_eq!(z[n - 1], 0.0, "past-the-shift element untouched");

    let shared = bindings.array("x").unwrap().clone();
    bindings.set_array("z", shared).unwrap();
    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);

    // The aliased call ran sequentially: each element takes its right
    // neighbour's original value and the last keeps its own.
    assert_eq!(s.baseline.calls(), 1);
    assert_eq!(s.guard.state_label(), "ready");
    let x = f64_contents(&bindings, "x");
    for (i, v) in x.iter().take(n - 1).enumerate() {
        assert_eq!(*v, (i + 1) as f64, "x[{i}]");
    }
    assert_eq!(x[n - 1], (n - 1) as f64);
}

pub fn out_of_range_gathers_fail_without_mutation(backend: &Arc<dyn OffloadBackend>) {
    let n = 8usize;
    let program = gather_program();
    let s = site(program.clone(), backend, eager_config());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array("idx", ArrayRef::new(ArrayData::from_i64(vec![99; n])))
        .unwrap();
    bindings
        .set_array("x", ArrayRef::new(ArrayData::from_f64(vec![7.0; n])))
        .unwrap();
    bindings
        .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
        .unwrap();

    let err = s.guard.call(&bindings).unwrap_err();

    // The gather tripped under elision, was retried fully instrumented,
    // tripped again, and the baseline then produced the program's own
    // violation, naming the array.
    assert_eq!(err.class(), "bound");
    assert!(err.to_string().contains("'x'"), "unexpected error: {err}");
    assert_eq!(s.context.cache_stats().builds, 2, "elided and full variants");
    assert_eq!(s.baseline.calls(), 1);
    assert_eq!(s.guard.state_label(), "baseline");
    assert!(s
        .guard
        .baseline_reason()
        .is_some_and(|r| r.contains("bound violation")));
    for v in f64_contents(&bindings, "y") {
        assert_eq!(v, 0.0, "a rejected launch must not leak writes");
    }
}

pub fn integer_overflow_is_sticky(backend: &Arc<dyn OffloadBackend>) {
    let n = 8usize;
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
    let s = site(program.clone(), backend, eager_config());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array("v", ArrayRef::new(ArrayData::from_i64(vec![i64::MAX; n])))
        .unwrap();

    let err = s.guard.call(&bindings).unwrap_err();
    assert_eq!(err.class(), "overflow");
    assert_eq!(s.guard.state_label(), "baseline");
    for v in i64_contents(&bindings, "v") {
        assert_eq!(v, i64::MAX);
    }

    // The site no longer touches the backend; the baseline keeps producing
    // the sequential error.
    let err = s.guard.call(&bindings).unwrap_err();
    assert_eq!(err.class(), "overflow");
    assert_eq!(s.baseline.calls(), 2);
    assert_eq!(s.context.cache_stats().builds, 1);
}

pub fn reductions_match_the_sequential_fold(backend: &Arc<dyn OffloadBackend>) {
    let n = 2048usize;
    let combine = Function {
        name: "combine".into(),
        params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
        ret: ScalarType::F64,
        body: vec![Stmt::Return(Expr::add(
            Expr::scalar("a"),
            Expr::scalar("b"),
        ))],
    };
    let symbols = SymbolTable::new().array("samples", ScalarType::F64, 1);
    let program = Program::reduction("sum_samples", symbols, "samples", combine);
    let s = site(program.clone(), backend, TuningConfig::default());
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings
        .set_array(
            "samples",
            ArrayRef::new(ArrayData::from_f64((1..=n).map(|i| i as f64).collect())),
        )
        .unwrap();

    let outcome = s.guard.call(&bindings).unwrap();

    // Integer-valued samples make the sum exact under any fold order.
    let expected = (n * (n + 1) / 2) as f64;
    assert_eq!(outcome, Outcome::Value(Literal::F64(expected)));
    assert_eq!(s.baseline.calls(), 0);
    assert_eq!(s.guard.state_label(), "ready");
    let samples = f64_contents(&bindings, "samples");
    assert_eq!(samples[0], 1.0, "the fold must not mutate its input");
    assert_eq!(samples[n - 1], n as f64);
}

pub fn kernels_are_reused_across_calls(backend: &Arc<dyn OffloadBackend>) {
    let program = saxpy_program();
    let s = site(program.clone(), backend, TuningConfig::default());
    let bindings = saxpy_bindings(&program, 4096);

    for _ in 0..3 {
        assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);
    }

    let stats = s.context.cache_stats();
    assert_eq!(stats.builds, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(s.baseline.calls(), 0);
    // Each pass folds 2x into y again: 1 + 3 * 2i.
    let y = f64_contents(&bindings, "y");
    for (i, v) in y.iter().enumerate() {
        assert_eq!(*v, 6.0 * i as f64 + 1.0, "y[{i}]");
    }
}

pub fn background_preparation_reaches_ready(backend: &Arc<dyn OffloadBackend>) {
    let program = saxpy_program();
    let s = site(program.clone(), backend, TuningConfig::default());
    let bindings = saxpy_bindings(&program, 4096);

    s.guard.prepare_async(&bindings);
    // Plan building is fast; give the helper thread time to land so the
    // call folds its result in instead of racing it.
    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(s.guard.call(&bindings).unwrap(), Outcome::Unit);
    assert_eq!(s.guard.state_label(), "ready");
    assert_eq!(s.baseline.calls(), 0);
    let y = f64_contents(&bindings, "y");
    for (i, v) in y.iter().enumerate() {
        assert_eq!(*v, 2.0 * i as f64 + 1.0, "y[{i}]");
    }
}

fn saxpy_program() -> Program {
    let symbols = SymbolTable::new()
        .scalar("a", ScalarType::F64)
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    Program::loop_nest(
        "saxpy",
        symbols,
        LoopLevel::upto("i", Expr::scalar("n")),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::mul(
                    Expr::scalar("a"),
                    Expr::load("x", vec![Expr::scalar("i")]),
                ),
                Expr::load("y", vec![Expr::scalar("i")]),
            ),
        }],
    )
}

fn saxpy_bindings(program: &Program, n: usize) -> Bindings {
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("a", Literal::F64(2.0)).unwrap();
    bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
    bindings
        .set_array(
            "x",
            ArrayRef::new(ArrayData::from_f64((0..n).map(|i| i as f64).collect())),
        )
        .unwrap();
    bindings
        .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![1.0; n])))
        .unwrap();
    bindings
}

fn gather_program() -> Program {
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("idx", ScalarType::I64, 1)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    Program::loop_nest(
        "gather",
        symbols,
        LoopLevel::upto("i", Expr::scalar("n")),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("x", vec![Expr::load("idx", vec![Expr::scalar("i")])]),
        }],
    )
}

fn f64_contents(bindings: &Bindings, name: &str) -> Vec<f64> {
    let array = bindings.array(name).unwrap().lock();
    (0..array.len())
        .map(|flat| array.get(flat).as_f64().unwrap())
        .collect()
}

fn i64_contents(bindings: &Bindings, name: &str) -> Vec<i64> {
    let array = bindings.array(name).unwrap().lock();
    (0..array.len())
        .map(|flat| array.get(flat).as_i64().unwrap())
        .collect()
}
