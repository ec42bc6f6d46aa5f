//! Randomized equivalence against the sequential interpreter. Each case
//! derives its sizes and data from one seed, builds the same bindings for
//! both paths, and requires identical outcomes and final array contents.

use std::sync::Arc;

use parloop::config::{BoundCheckMode, TuningConfig};
use parloop::exec::OffloadBackend;
use parloop::ir::program::{Expr, Function, LoopLevel, Program, Stmt};
use parloop::ir::types::{Literal, MathFn, ScalarType};
use parloop::options::LoopOptions;
use parloop::symbols::{ArrayData, ArrayRef, Bindings, Buf, SymbolTable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::harness::{assert_matches_host, eager_config};

pub fn randomized_affine_nests_match_the_host(backend: &Arc<dyn OffloadBackend>) {
    let symbols = SymbolTable::new()
        .scalar("a", ScalarType::F64)
        .scalar("b", ScalarType::F64)
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    let program = Program::loop_nest(
        "axpby",
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
                Expr::mul(
                    Expr::scalar("b"),
                    Expr::load("y", vec![Expr::scalar("i")]),
                ),
            ),
        }],
    );

    for case in 0..6u64 {
        let make = || {
            let mut rng = StdRng::seed_from_u64(100 + case);
            let n = rng.gen_range(1..=300usize);
            let mut bindings = Bindings::for_table(&program.symbols);
            bindings
                .set_scalar("a", Literal::F64(rng.gen_range(-2.0..2.0)))
                .unwrap();
            bindings
                .set_scalar("b", Literal::F64(rng.gen_range(-2.0..2.0)))
                .unwrap();
            bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
            bindings
                .set_array("x", f64_array(&mut rng, n, -1000.0, 1000.0))
                .unwrap();
            bindings
                .set_array("y", f64_array(&mut rng, n, -1000.0, 1000.0))
                .unwrap();
            bindings
        };
        assert_matches_host(backend, eager_config(), LoopOptions::default(), &program, make);
    }
}

pub fn randomized_grid_stencils_match_the_host(backend: &Arc<dyn OffloadBackend>) {
    let symbols = SymbolTable::new()
        .scalar("rows", ScalarType::I64)
        .scalar("cols", ScalarType::I64)
        .array("src", ScalarType::F64, 2)
        .array("dst", ScalarType::F64, 2);
    let average = Expr::mul(
        Expr::add(
            Expr::add(
                Expr::load(
                    "src",
                    vec![
                        Expr::sub(Expr::scalar("i"), Expr::i64(1)),
                        Expr::scalar("j"),
                    ],
                ),
                Expr::load(
                    "src",
                    vec![
                        Expr::add(Expr::scalar("i"), Expr::i64(1)),
                        Expr::scalar("j"),
                    ],
                ),
            ),
            Expr::add(
                Expr::load(
                    "src",
                    vec![
                        Expr::scalar("i"),
                        Expr::sub(Expr::scalar("j"), Expr::i64(1)),
                    ],
                ),
                Expr::load(
                    "src",
                    vec![
                        Expr::scalar("i"),
                        Expr::add(Expr::scalar("j"), Expr::i64(1)),
                    ],
                ),
            ),
        ),
        Expr::f64(0.25),
    );
    let program = Program::loop_nest(
        "relax_interior",
        symbols,
        LoopLevel::new(
            "i",
            Expr::i64(1),
            Expr::sub(Expr::scalar("rows"), Expr::i64(1)),
            Expr::i64(1),
        ),
        vec![Stmt::For {
            var: "j".into(),
            start: Expr::i64(1),
            stop: Expr::sub(Expr::scalar("cols"), Expr::i64(1)),
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "dst".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: average,
            }],
        }],
    );

    for case in 0..6u64 {
        let make = || {
            let mut rng = StdRng::seed_from_u64(200 + case);
            let rows = rng.gen_range(3..=24usize);
            let cols = rng.gen_range(3..=24usize);
            let values = (0..rows * cols)
                .map(|_| rng.gen_range(-100.0..100.0))
                .collect();
            let mut bindings = Bindings::for_table(&program.symbols);
            bindings
                .set_scalar("rows", Literal::I64(rows as i64))
                .unwrap();
            bindings
                .set_scalar("cols", Literal::I64(cols as i64))
                .unwrap();
            bindings
                .set_array(
                    "src",
                    ArrayRef::new(ArrayData::new(vec![rows, cols], Buf::F64(values)).unwrap()),
                )
                .unwrap();
            bindings
                .set_array(
                    "dst",
                    ArrayRef::new(ArrayData::zeros(ScalarType::F64, vec![rows, cols])),
                )
                .unwrap();
            bindings
        };
        assert_matches_host(backend, eager_config(), LoopOptions::default(), &program, make);
    }
}

pub fn randomized_gathers_match_the_host(backend: &Arc<dyn OffloadBackend>) {
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("idx", ScalarType::I64, 1)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    let program = Program::loop_nest(
        "gather",
        symbols,
        LoopLevel::upto("i", Expr::scalar("n")),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::load("x", vec![Expr::load("idx", vec![Expr::scalar("i")])]),
        }],
    );

    for case in 0..6u64 {
        // Odd cases force full instrumentation; even ones leave the proof
        // machinery to decide.
        let config = if case % 2 == 0 {
            eager_config()
        } else {
            TuningConfig {
                bound_checks: BoundCheckMode::All,
                ..eager_config()
            }
        };
        let make = || {
            let mut rng = StdRng::seed_from_u64(300 + case);
            let n = rng.gen_range(1..=200usize);
            let m = rng.gen_range(1..=200usize);
            let mut bindings = Bindings::for_table(&program.symbols);
            bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
            let picks = (0..n).map(|_| rng.gen_range(0..m as i64)).collect();
            bindings
                .set_array("idx", ArrayRef::new(ArrayData::from_i64(picks)))
                .unwrap();
            bindings
                .set_array("x", f64_array(&mut rng, m, -1000.0, 1000.0))
                .unwrap();
            bindings
                .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
                .unwrap();
            bindings
        };
        assert_matches_host(backend, config, LoopOptions::default(), &program, make);
    }
}

pub fn randomized_reductions_match_the_host(backend: &Arc<dyn OffloadBackend>) {
    for case in 0..9u64 {
        let (program, integer) = reduce_program(case);
        let make = || {
            let mut rng = StdRng::seed_from_u64(400 + case);
            // The last case folds an empty array; both paths must report
            // the same violation for it.
            let len = if case == 8 {
                0
            } else {
                rng.gen_range(1..=400usize)
            };
            let mut bindings = Bindings::for_table(&program.symbols);
            let data = if integer {
                ArrayRef::new(ArrayData::from_i64(
                    (0..len).map(|_| rng.gen_range(-1000..1000)).collect(),
                ))
            } else if case % 4 == 0 {
                // Positive samples keep a floating sum away from
                // cancellation, where no fold order is close to another.
                f64_array(&mut rng, len, 0.5, 1000.0)
            } else {
                f64_array(&mut rng, len, -1000.0, 1000.0)
            };
            bindings.set_array("samples", data).unwrap();
            bindings
        };
        assert_matches_host(backend, eager_config(), LoopOptions::default(), &program, make);
    }
}

pub fn randomized_math_bodies_match_the_host(backend: &Arc<dyn OffloadBackend>) {
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    let program = Program::loop_nest(
        "waveform",
        symbols,
        LoopLevel::upto("i", Expr::scalar("n")),
        vec![Stmt::Store {
            array: "y".into(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::math(
                    MathFn::Sqrt,
                    vec![Expr::math(
                        MathFn::Fabs,
                        vec![Expr::load("x", vec![Expr::scalar("i")])],
                    )],
                ),
                Expr::math(
                    MathFn::Cos,
                    vec![Expr::mul(
                        Expr::load("x", vec![Expr::scalar("i")]),
                        Expr::f64(0.01),
                    )],
                ),
            ),
        }],
    );

    for case in 0..6u64 {
        let make = || {
            let mut rng = StdRng::seed_from_u64(500 + case);
            let n = rng.gen_range(1..=200usize);
            let mut bindings = Bindings::for_table(&program.symbols);
            bindings.set_scalar("n", Literal::I64(n as i64)).unwrap();
            bindings
                .set_array("x", f64_array(&mut rng, n, -100.0, 100.0))
                .unwrap();
            bindings
                .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))
                .unwrap();
            bindings
        };
        assert_matches_host(backend, eager_config(), LoopOptions::default(), &program, make);
    }
}

/// One reduction program per case: f64 sum, min, max, then an i64 sum.
/// Returns whether the samples are integer.
fn reduce_program(case: u64) -> (Program, bool) {
    let (elem, body, name) = match case % 4 {
        0 => (
            ScalarType::F64,
            Expr::add(Expr::scalar("a"), Expr::scalar("b")),
            "fold_sum",
        ),
        1 => (
            ScalarType::F64,
            Expr::math(MathFn::Min, vec![Expr::scalar("a"), Expr::scalar("b")]),
            "fold_min",
        ),
        2 => (
            ScalarType::F64,
            Expr::math(MathFn::Max, vec![Expr::scalar("a"), Expr::scalar("b")]),
            "fold_max",
        ),
        _ => (
            ScalarType::I64,
            Expr::add(Expr::scalar("a"), Expr::scalar("b")),
            "fold_isum",
        ),
    };
    let combine = Function {
        name: "combine".into(),
        params: vec![("a".into(), elem), ("b".into(), elem)],
        ret: elem,
        body: vec![Stmt::Return(body)],
    };
    let symbols = SymbolTable::new().array("samples", elem, 1);
    (
        Program::reduction(name, symbols, "samples", combine),
        elem == ScalarType::I64,
    )
}

fn f64_array(rng: &mut StdRng, len: usize, lo: f64, hi: f64) -> ArrayRef {
    ArrayRef::new(ArrayData::from_f64(
        (0..len).map(|_| rng.gen_range(lo..hi)).collect(),
    ))
}
