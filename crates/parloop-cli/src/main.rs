mod demos;
mod report;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parloop::analysis::bounds::{analyze_bounds, resolve_ranges};
use parloop::analysis::build_plan;
use parloop::config::{BoundCheckMode, TuningConfig};
use parloop::context::CompilerContext;
use parloop::exec::{registry, BaselineExecutor, CheckConfig, OffloadBackend, Outcome};
use parloop::guard::OffloadGuard;
use parloop::ir::program::Program;
use parloop::options::{LoopOptions, TargetMode};
use parloop::snapshot::Snapshot;
use parloop::symbols::{Bindings, SymbolKind};
use parloop::telemetry::{hub, Stopwatch};
// Linked for its registrars; backends resolve by name through the registry.
use parloop_backend_cl as _;
use parloop_backend_host::HostExecutor;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("parloop {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "demos" => {
            for (name, summary) in demos::DEMOS {
                println!("{name:<10} {summary}");
            }
            Ok(())
        }
        "devices" => run_devices(args.collect()),
        "kernel" => run_kernel(args.collect()),
        "snapshot" => run_snapshot(args.collect()),
        "run" => run_program(args.collect()),
        "bench" => run_bench(args.collect()),
        other => bail!("unknown command '{other}', try 'parloop help'"),
    }
}

fn run_devices(raw: Vec<String>) -> Result<()> {
    let mut backend_name: Option<String> = None;

    let mut i = 0usize;
    while i < raw.len() {
        match raw[i].as_str() {
            "--backend" => {
                i += 1;
                backend_name = raw.get(i).cloned();
            }
            flag => bail!("unknown devices flag '{flag}'"),
        }
        i += 1;
    }

    let backend = pick_backend(backend_name.as_deref())?;
    let doc = report::DevicesReport {
        backend: backend.name().to_string(),
        devices: backend
            .devices()
            .iter()
            .map(report::DeviceReport::new)
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn run_kernel(raw: Vec<String>) -> Result<()> {
    let mut demo: Option<String> = None;
    let mut n_raw: Option<String> = None;
    let mut checks_raw: Option<String> = None;
    let mut backend_name: Option<String> = None;
    let mut out: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < raw.len() {
        match raw[i].as_str() {
            "--demo" => {
                i += 1;
                demo = raw.get(i).cloned();
            }
            "--n" => {
                i += 1;
                n_raw = raw.get(i).cloned();
            }
            "--checks" => {
                i += 1;
                checks_raw = raw.get(i).cloned();
            }
            "--backend" => {
                i += 1;
                backend_name = raw.get(i).cloned();
            }
            "--out" => {
                i += 1;
                out = raw.get(i).map(PathBuf::from);
            }
            flag => bail!("unknown kernel flag '{flag}'"),
        }
        i += 1;
    }

    let demo = demo.ok_or_else(|| anyhow!("missing required --demo"))?;
    let mode = match checks_raw.as_deref() {
        None | Some("auto") => BoundCheckMode::Auto,
        Some("all") => BoundCheckMode::All,
        Some("off") => BoundCheckMode::Off,
        Some(other) => bail!("--checks must be auto, all, or off, got '{other}'"),
    };

    let (program, bindings) = demos::build(&demo, parse_n(n_raw.as_deref())?)?;
    let backend = pick_backend(backend_name.as_deref())?;
    let plan = build_plan(&program, &bindings, &LoopOptions::default())
        .with_context(|| format!("'{}' does not analyze as offloadable", program.name))?;
    let checks = if plan.is_reduce() {
        CheckConfig::None
    } else {
        match mode {
            BoundCheckMode::Off => CheckConfig::None,
            BoundCheckMode::All => CheckConfig::All,
            BoundCheckMode::Auto => {
                let ranges = resolve_ranges(&plan.levels, &bindings)?;
                let level_vars = plan.level_vars();
                let bound_report =
                    analyze_bounds(&plan.body, &plan.accesses, &level_vars, &ranges, &bindings)?;
                CheckConfig::from_report(&bound_report, BoundCheckMode::Auto)
            }
        }
    };
    let kernel = backend.prepare(&program, &plan, &checks, &TuningConfig::from_env())?;

    eprintln!(
        "{}: entry {}, levels {}, checks {}",
        program.name,
        kernel.entry(),
        plan.levels.len(),
        report::check_label(&checks)
    );
    match out {
        Some(path) => {
            fs::write(&path, kernel.source())
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{}", kernel.source()),
    }
    Ok(())
}

fn run_snapshot(raw: Vec<String>) -> Result<()> {
    let mut demo: Option<String> = None;
    let mut n_raw: Option<String> = None;
    let mut out: Option<PathBuf> = None;

    let mut i = 0usize;
    while i < raw.len() {
        match raw[i].as_str() {
            "--demo" => {
                i += 1;
                demo = raw.get(i).cloned();
            }
            "--n" => {
                i += 1;
                n_raw = raw.get(i).cloned();
            }
            "--out" => {
                i += 1;
                out = raw.get(i).map(PathBuf::from);
            }
            flag => bail!("unknown snapshot flag '{flag}'"),
        }
        i += 1;
    }

    let demo = demo.ok_or_else(|| anyhow!("missing required --demo"))?;
    let out = out.ok_or_else(|| anyhow!("missing required --out"))?;
    let (program, bindings) = demos::build(&demo, parse_n(n_raw.as_deref())?)?;
    let snapshot = Snapshot::capture(&program, &bindings)?;
    snapshot
        .save(&out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("captured '{}' -> {}", program.name, out.display());
    Ok(())
}

fn run_program(raw: Vec<String>) -> Result<()> {
    let mut demo: Option<String> = None;
    let mut input: Option<PathBuf> = None;
    let mut n_raw: Option<String> = None;
    let mut backend_name: Option<String> = None;
    let mut target_raw: Option<String> = None;
    let mut baseline_only = false;
    let mut trace = false;

    let mut i = 0usize;
    while i < raw.len() {
        match raw[i].as_str() {
            "--demo" => {
                i += 1;
                demo = raw.get(i).cloned();
            }
            "--in" => {
                i += 1;
                input = raw.get(i).map(PathBuf::from);
            }
            "--n" => {
                i += 1;
                n_raw = raw.get(i).cloned();
            }
            "--backend" => {
                i += 1;
                backend_name = raw.get(i).cloned();
            }
            "--target" => {
                i += 1;
                target_raw = raw.get(i).cloned();
            }
            "--baseline" => baseline_only = true,
            "--trace" => trace = true,
            flag => bail!("unknown run flag '{flag}'"),
        }
        i += 1;
    }

    let (program, bindings) =
        load_input(demo.as_deref(), input.as_ref(), parse_n(n_raw.as_deref())?)?;
    println!("program: {}", program.name);

    if trace {
        hub().take_records();
    }
    let (path, result, wall_us) = if baseline_only {
        let host = HostExecutor::new();
        let sw = Stopwatch::start();
        let result = host.execute(&program, &bindings);
        ("host".to_string(), result, sw.elapsed_us())
    } else {
        let options = LoopOptions {
            target_mode: parse_target(target_raw.as_deref())?,
            ..LoopOptions::default()
        };
        let backend = pick_backend(backend_name.as_deref())?;
        let context = Arc::new(CompilerContext::new(TuningConfig::from_env()));
        let guard = OffloadGuard::new(program.clone(), options, parloop_backend_host::executor())
            .with_backend(backend)
            .with_context(context);
        let sw = Stopwatch::start();
        let result = guard.call(&bindings);
        let wall_us = sw.elapsed_us();
        let path = match guard.baseline_reason() {
            Some(reason) => format!("{} ({reason})", guard.state_label()),
            None => guard.state_label().to_string(),
        };
        (path, result, wall_us)
    };

    println!("path: {path}");
    if trace {
        for record in hub().take_records() {
            println!("{}", serde_json::to_string(&record)?);
        }
    }
    let outcome = result?;
    match &outcome {
        Outcome::Unit => println!("outcome: unit"),
        Outcome::Value(value) => println!("outcome: {value}"),
    }
    println!("wall: {wall_us} us");
    for decl in program.symbols.iter() {
        if let SymbolKind::Array(_) = decl.kind {
            let array = bindings.array(&decl.name)?;
            let data = array.lock();
            println!(
                "{} [{}] {}",
                decl.name,
                report::dims_label(&data),
                report::preview(&data, 6)
            );
        }
    }
    Ok(())
}

fn run_bench(raw: Vec<String>) -> Result<()> {
    let mut demo: Option<String> = None;
    let mut input: Option<PathBuf> = None;
    let mut n_raw: Option<String> = None;
    let mut backend_name: Option<String> = None;
    let mut target_raw: Option<String> = None;
    let mut repeat_raw: Option<String> = None;

    let mut i = 0usize;
    while i < raw.len() {
        match raw[i].as_str() {
            "--demo" => {
                i += 1;
                demo = raw.get(i).cloned();
            }
            "--in" => {
                i += 1;
                input = raw.get(i).map(PathBuf::from);
            }
            "--n" => {
                i += 1;
                n_raw = raw.get(i).cloned();
            }
            "--backend" => {
                i += 1;
                backend_name = raw.get(i).cloned();
            }
            "--target" => {
                i += 1;
                target_raw = raw.get(i).cloned();
            }
            "--repeat" => {
                i += 1;
                repeat_raw = raw.get(i).cloned();
            }
            flag => bail!("unknown bench flag '{flag}'"),
        }
        i += 1;
    }

    let repeat = match repeat_raw {
        Some(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("invalid --repeat '{raw}'"))?,
        None => 5,
    };
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    let (program, bindings) =
        load_input(demo.as_deref(), input.as_ref(), parse_n(n_raw.as_deref())?)?;
    let options = LoopOptions {
        target_mode: parse_target(target_raw.as_deref())?,
        ..LoopOptions::default()
    };
    let backend = pick_backend(backend_name.as_deref())?;
    let context = Arc::new(CompilerContext::new(TuningConfig::from_env()));
    let guard = OffloadGuard::new(program.clone(), options, parloop_backend_host::executor())
        .with_backend(Arc::clone(&backend))
        .with_context(context);

    let host = HostExecutor::new();
    let mut baseline_samples = Vec::with_capacity(repeat as usize);
    for _ in 0..repeat {
        let sw = Stopwatch::start();
        host.execute(&program, &bindings)?;
        baseline_samples.push(sw.elapsed());
    }
    let mut offload_samples = Vec::with_capacity(repeat as usize);
    for _ in 0..repeat {
        let sw = Stopwatch::start();
        guard.call(&bindings)?;
        offload_samples.push(sw.elapsed());
    }

    let baseline = report::summarize(&baseline_samples);
    let offload = report::summarize(&offload_samples);
    let doc = report::BenchReport {
        program: program.name.clone(),
        backend: backend.name().to_string(),
        repeat,
        baseline,
        offload,
        speedup: report::speedup(baseline, offload),
        guard_state: guard.state_label().to_string(),
        baseline_reason: guard.baseline_reason(),
    };
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

/// One program either from the demo set or from a captured snapshot.
fn load_input(
    demo: Option<&str>,
    input: Option<&PathBuf>,
    n: Option<i64>,
) -> Result<(Program, Bindings)> {
    match (demo, input) {
        (Some(demo), None) => demos::build(demo, n),
        (None, Some(path)) => {
            if n.is_some() {
                bail!("--n applies to --demo, not --in");
            }
            let snapshot = Snapshot::load(path)
                .with_context(|| format!("failed to read snapshot {}", path.display()))?;
            Ok(snapshot.restore()?)
        }
        (Some(_), Some(_)) => bail!("--demo and --in are mutually exclusive"),
        (None, None) => bail!("one of --demo or --in is required"),
    }
}

/// Resolve `--backend` against the registry, or take the platform default.
fn pick_backend(name: Option<&str>) -> Result<Arc<dyn OffloadBackend>> {
    match name {
        Some(name) => registry::create_backend(name)
            .ok_or_else(|| {
                anyhow!(
                    "no backend named '{name}', registered: {}",
                    registry::list_backends().join(", ")
                )
            })?
            .with_context(|| format!("backend '{name}' failed to construct")),
        None => registry::default_backend()
            .ok_or_else(|| anyhow!("no backend constructs on this machine, try '--backend sim'")),
    }
}

fn parse_n(raw: Option<&str>) -> Result<Option<i64>> {
    match raw {
        Some(raw) => {
            let n = raw
                .parse::<i64>()
                .with_context(|| format!("invalid --n '{raw}'"))?;
            Ok(Some(n))
        }
        None => Ok(None),
    }
}

fn parse_target(raw: Option<&str>) -> Result<TargetMode> {
    match raw {
        Some(raw) => TargetMode::parse(raw)
            .ok_or_else(|| anyhow!("--target must be auto, gpu, cpu, or baseline, got '{raw}'")),
        None => Ok(TargetMode::Auto),
    }
}

fn print_help() {
    println!("parloop {}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  parloop demos");
    println!("  parloop devices [--backend <name>]");
    println!("  parloop kernel --demo <name> [--n <count>] [--checks auto|all|off] [--backend <name>] [--out <file.cl>]");
    println!("  parloop snapshot --demo <name> [--n <count>] --out <file.bin>");
    println!("  parloop run (--demo <name> | --in <file.bin>) [--n <count>] [--backend <name>] [--target auto|gpu|cpu|baseline] [--baseline] [--trace]");
    println!("  parloop bench (--demo <name> | --in <file.bin>) [--n <count>] [--backend <name>] [--target auto|gpu|cpu|baseline] [--repeat <count>]");
    println!("  parloop version");
    println!();
    println!("Tuning comes from PARLOOP_* environment variables: PLATFORM, TARGET,");
    println!("THRESHOLD, BOUND_CHECKS, TRIES, MARGIN, TIMING, MEMORY_PORTION, DEBUG.");
}
