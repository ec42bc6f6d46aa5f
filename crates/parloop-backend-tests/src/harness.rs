//! Plumbing shared by the scenarios: a call-counting baseline, guard
//! construction against a pinned backend, and outcome comparison against
//! the sequential interpreter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parloop::config::TuningConfig;
use parloop::context::CompilerContext;
use parloop::error::Result;
use parloop::exec::{BaselineExecutor, OffloadBackend, Outcome};
use parloop::guard::OffloadGuard;
use parloop::ir::program::Program;
use parloop::ir::types::Literal;
use parloop::options::LoopOptions;
use parloop::symbols::{Bindings, SymbolKind};
use parloop_backend_host::HostExecutor;

/// Baseline executor that counts how often the guard fell back to it, so a
/// scenario can tell an offloaded call from a sequential one.
#[derive(Debug, Default)]
pub struct CountingHost {
    inner: HostExecutor,
    calls: AtomicU64,
}

impl CountingHost {
    pub fn new() -> CountingHost {
        CountingHost::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl BaselineExecutor for CountingHost {
    fn execute(&self, program: &Program, bindings: &Bindings) -> Result<Outcome> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.execute(program, bindings)
    }
}

/// Tuning that offloads any trip count, for scenarios over small arrays.
pub fn eager_config() -> TuningConfig {
    TuningConfig {
        offload_threshold: 1,
        ..TuningConfig::default()
    }
}

/// One call-site wired to the backend under test, with the state the
/// scenario needs to observe afterwards.
pub struct Site {
    pub guard: OffloadGuard,
    pub baseline: Arc<CountingHost>,
    pub context: Arc<CompilerContext>,
}

pub fn site(program: Program, backend: &Arc<dyn OffloadBackend>, config: TuningConfig) -> Site {
    site_with(program, backend, config, LoopOptions::default())
}

pub fn site_with(
    program: Program,
    backend: &Arc<dyn OffloadBackend>,
    config: TuningConfig,
    options: LoopOptions,
) -> Site {
    let baseline = Arc::new(CountingHost::new());
    let context = Arc::new(CompilerContext::new(config));
    let guard = OffloadGuard::new(
        program,
        options,
        Arc::clone(&baseline) as Arc<dyn BaselineExecutor>,
    )
    .with_backend(Arc::clone(backend))
    .with_context(Arc::clone(&context));
    Site {
        guard,
        baseline,
        context,
    }
}

/// Relative f64 agreement. Device folds may reassociate floating sums and
/// native math builtins carry a few ulp, so exact equality is too strict
/// for real hardware.
pub fn literal_close(a: Literal, b: Literal) -> bool {
    match (a, b) {
        (Literal::F64(x), Literal::F64(y)) => {
            if x.is_nan() && y.is_nan() {
                return true;
            }
            let scale = x.abs().max(y.abs()).max(1.0);
            (x - y).abs() <= 1e-9 * scale
        }
        _ => a == b,
    }
}

pub fn assert_arrays_match(name: &str, got: &Bindings, want: &Bindings) {
    let got_ref = got.array(name).unwrap();
    let want_ref = want.array(name).unwrap();
    let got = got_ref.lock();
    let want = want_ref.lock();
    assert_eq!(got.len(), want.len(), "'{name}' lengths diverged");
    for flat in 0..got.len() {
        let (g, w) = (got.get(flat), want.get(flat));
        assert!(
            literal_close(g, w),
            "'{name}'[{flat}] diverged: backend {g:?}, host {w:?}"
        );
    }
}

pub fn assert_outcomes_match(got: &Result<Outcome>, want: &Result<Outcome>) {
    match (got, want) {
        (Ok(Outcome::Unit), Ok(Outcome::Unit)) => {}
        (Ok(Outcome::Value(g)), Ok(Outcome::Value(w))) => {
            assert!(
                literal_close(*g, *w),
                "reduction values diverged: backend {g:?}, host {w:?}"
            );
        }
        (Err(g), Err(w)) => {
            assert_eq!(
                g.class(),
                w.class(),
                "error classes diverged: backend {g}, host {w}"
            );
        }
        (got, want) => panic!("outcomes diverged: backend {got:?}, host {want:?}"),
    }
}

/// Run one program through the guarded path and through the interpreter on
/// identically built bindings, then require the same outcome and the same
/// final array contents. `make` runs once per path so the two never share
/// storage; it must be deterministic.
pub fn assert_matches_host(
    backend: &Arc<dyn OffloadBackend>,
    config: TuningConfig,
    options: LoopOptions,
    program: &Program,
    make: impl Fn() -> Bindings,
) {
    let host_bindings = make();
    let host_result = HostExecutor::new().execute(program, &host_bindings);

    let guarded_bindings = make();
    let s = site_with(program.clone(), backend, config, options);
    let guarded_result = s.guard.call(&guarded_bindings);

    assert_outcomes_match(&guarded_result, &host_result);
    for decl in program.symbols.iter() {
        if let SymbolKind::Array(_) = decl.kind {
            assert_arrays_match(&decl.name, &guarded_bindings, &host_bindings);
        }
    }
}
