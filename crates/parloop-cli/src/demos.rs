//! Bundled demo programs. Each pairs a small loop nest or reduction with a
//! deterministic activation record, sized so the default tuning offloads
//! it. `parloop demos` lists them; the other subcommands take `--demo`.

use anyhow::{bail, Result};
use parloop::ir::program::{Expr, Function, LoopLevel, Program, Stmt};
use parloop::ir::types::{Literal, MathFn, ScalarType};
use parloop::symbols::{ArrayData, ArrayRef, Bindings, Buf, SymbolTable};

/// Name and one-line summary of every bundled demo.
pub const DEMOS: &[(&str, &str)] = &[
    ("saxpy", "y[i] = a * x[i] + y[i] over one parallel level"),
    ("relax", "five-point interior average over a square grid"),
    ("gather", "y[i] = x[idx[i]] with data-dependent subscripts"),
    ("waveform", "sqrt, fabs, and cos over one parallel level"),
    ("sum", "fold of one array through a user combining function"),
];

/// Build the named demo. `n` scales the workload: element count for the
/// rank-1 demos, grid side for `relax`.
pub fn build(name: &str, n: Option<i64>) -> Result<(Program, Bindings)> {
    if let Some(n) = n {
        if n <= 0 {
            bail!("--n must be positive, got {n}");
        }
    }
    match name {
        "saxpy" => saxpy(n.unwrap_or(65_536) as usize),
        "relax" => relax(n.unwrap_or(256) as usize),
        "gather" => gather(n.unwrap_or(65_536) as usize),
        "waveform" => waveform(n.unwrap_or(65_536) as usize),
        "sum" => sum(n.unwrap_or(65_536) as usize),
        other => bail!("unknown demo '{other}', 'parloop demos' lists them"),
    }
}

fn saxpy(n: usize) -> Result<(Program, Bindings)> {
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
    bindings.set_scalar("n", Literal::I64(n as i64))?;
    bindings.set_scalar("a", Literal::F64(2.0))?;
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    bindings.set_array("x", ArrayRef::new(ArrayData::from_f64(x)))?;
    bindings.set_array("y", ArrayRef::new(ArrayData::from_f64(vec![1.0; n])))?;
    Ok((program, bindings))
}

/// The inner loop is perfectly nested, so fusion promotes it and the whole
/// interior runs as one two-dimensional launch.
fn relax(side: usize) -> Result<(Program, Bindings)> {
    let symbols = SymbolTable::new()
        .scalar("side", ScalarType::I64)
        .array("src", ScalarType::F64, 2)
        .array("dst", ScalarType::F64, 2);
    let stop = Expr::sub(Expr::scalar("side"), Expr::i64(1));
    let neighbors = Expr::add(
        Expr::add(
            Expr::load(
                "src",
                vec![Expr::sub(Expr::scalar("i"), Expr::i64(1)), Expr::scalar("j")],
            ),
            Expr::load(
                "src",
                vec![Expr::add(Expr::scalar("i"), Expr::i64(1)), Expr::scalar("j")],
            ),
        ),
        Expr::add(
            Expr::load(
                "src",
                vec![Expr::scalar("i"), Expr::sub(Expr::scalar("j"), Expr::i64(1))],
            ),
            Expr::load(
                "src",
                vec![Expr::scalar("i"), Expr::add(Expr::scalar("j"), Expr::i64(1))],
            ),
        ),
    );
    let program = Program::loop_nest(
        "relax",
        symbols,
        LoopLevel::new("i", Expr::i64(1), stop.clone(), Expr::i64(1)),
        vec![Stmt::For {
            var: "j".into(),
            start: Expr::i64(1),
            stop,
            step: Expr::i64(1),
            body: vec![Stmt::Store {
                array: "dst".into(),
                index: vec![Expr::scalar("i"), Expr::scalar("j")],
                value: Expr::mul(neighbors, Expr::f64(0.25)),
            }],
        }],
    );
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("side", Literal::I64(side as i64))?;
    let cells: Vec<f64> = (0..side * side)
        .map(|flat| ((flat * 31 + 7) % 101) as f64)
        .collect();
    bindings.set_array(
        "src",
        ArrayRef::new(ArrayData::new(vec![side, side], Buf::F64(cells))?),
    )?;
    bindings.set_array(
        "dst",
        ArrayRef::new(ArrayData::zeros(ScalarType::F64, vec![side, side])),
    )?;
    Ok((program, bindings))
}

fn gather(n: usize) -> Result<(Program, Bindings)> {
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
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64))?;
    let picks: Vec<i64> = (0..n).map(|i| ((i * 7 + 3) % n) as i64).collect();
    bindings.set_array("idx", ArrayRef::new(ArrayData::from_i64(picks)))?;
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    bindings.set_array("x", ArrayRef::new(ArrayData::from_f64(x)))?;
    bindings.set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))?;
    Ok((program, bindings))
}

fn waveform(n: usize) -> Result<(Program, Bindings)> {
    let symbols = SymbolTable::new()
        .scalar("n", ScalarType::I64)
        .array("x", ScalarType::F64, 1)
        .array("y", ScalarType::F64, 1);
    let sample = Expr::load("x", vec![Expr::scalar("i")]);
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
                    vec![Expr::math(MathFn::Fabs, vec![sample.clone()])],
                ),
                Expr::math(MathFn::Cos, vec![Expr::mul(sample, Expr::f64(0.01))]),
            ),
        }],
    );
    let mut bindings = Bindings::for_table(&program.symbols);
    bindings.set_scalar("n", Literal::I64(n as i64))?;
    // Centered so half the samples exercise the negative fabs branch.
    let x: Vec<f64> = (0..n).map(|i| i as f64 - n as f64 / 2.0).collect();
    bindings.set_array("x", ArrayRef::new(ArrayData::from_f64(x)))?;
    bindings.set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; n])))?;
    Ok((program, bindings))
}

fn sum(n: usize) -> Result<(Program, Bindings)> {
    let combine = Function {
        name: "add".into(),
        params: vec![("a".into(), ScalarType::F64), ("b".into(), ScalarType::F64)],
        ret: ScalarType::F64,
        body: vec![Stmt::Return(Expr::add(
            Expr::scalar("a"),
            Expr::scalar("b"),
        ))],
    };
    let symbols = SymbolTable::new().array("samples", ScalarType::F64, 1);
    let program = Program::reduction("sum", symbols, "samples", combine);
    let mut bindings = Bindings::for_table(&program.symbols);
    // Integer-valued samples: the fold is exact in any combining order.
    let samples: Vec<f64> = (0..n).map(|i| ((i % 512) + 1) as f64).collect();
    bindings.set_array("samples", ArrayRef::new(ArrayData::from_f64(samples)))?;
    Ok((program, bindings))
}
