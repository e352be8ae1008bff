use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;

use tessera::engine::CacheCounters;
use tessera::ir::Op;
use tessera::schedule::BufferDesc;
use tessera::shape::eval_shape;
use tessera::{Config, Engine, GraphFile, Kernelized, Schedule, Stats};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "tessera", version, about = "Tensor graph kernelizer and scheduler")]
struct Cli {
    /// Config file (default: tessera.toml next to the input or above it)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Log pipeline decisions (overridden by TESSERA_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Kernelize a .tg graph and print its schedule
    Schedule {
        input: PathBuf,
        /// Print the AST of every kernel
        #[arg(long)]
        ast: bool,
    },
    /// Kernelize, schedule and run a .tg graph on host devices
    Run {
        input: PathBuf,
        /// Wait for every kernel and report timings
        #[arg(long)]
        wait: bool,
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
        /// Values to print per output
        #[arg(long, default_value_t = 16, value_name = "N")]
        show: usize,
    },
    /// Show content hashes of the graph and its kernels (BLAKE3)
    Hash {
        input: PathBuf,
        /// Show full 256-bit hashes instead of short form
        #[arg(long)]
        full: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "tessera=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Schedule { input, ast } => cmd_schedule(&input, cli.config.as_deref(), ast),
        Command::Run {
            input,
            wait,
            json,
            show,
        } => cmd_run(&input, cli.config.as_deref(), wait, json, show),
        Command::Hash { input, full } => cmd_hash(&input, cli.config.as_deref(), full),
    }
}

// ─── Shared steps ──────────────────────────────────────────────────

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("error: {}", message);
    process::exit(1);
}

/// `--config`, else the nearest tessera.toml, else defaults; then the
/// environment on top.
fn load_config(input: &Path, explicit: Option<&Path>) -> Config {
    let path = explicit.map(Path::to_path_buf).or_else(|| {
        let dir = input.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        Config::find(&std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
    });
    let config = match &path {
        Some(p) => Config::load(p).unwrap_or_else(|d| {
            match std::fs::read_to_string(p) {
                Ok(source) if d.span.end > 0 => d.render(&p.display().to_string(), &source),
                _ => eprintln!("error: {}", d.message),
            }
            process::exit(1);
        }),
        None => Config::default(),
    };
    config.with_env().unwrap_or_else(|d| {
        let notes = d.notes.join("; ");
        fail(format!("{} ({})", d.message, notes))
    })
}

fn load_graph(input: &Path) -> GraphFile {
    if !input.extension().is_some_and(|e| e == "tg") {
        fail("input must be a .tg file");
    }
    let source = std::fs::read_to_string(input)
        .unwrap_or_else(|e| fail(format!("cannot read '{}': {}", input.display(), e)));
    let filename = input.display().to_string();
    match tessera::parse_source(&source, &filename) {
        Ok(file) => file,
        Err(errors) => {
            eprintln!("error: aborting due to {} previous error(s)", errors.len());
            process::exit(1);
        }
    }
}

fn compile(file: &mut GraphFile, config: &Config) -> (Kernelized, Schedule) {
    let sink = file.sink();
    let k = tessera::kernelize_map(&mut file.graph, sink, &config.kernelize_options())
        .unwrap_or_else(|e| fail(e));
    let schedule = tessera::create_schedule(&file.graph, k.sink).unwrap_or_else(|e| fail(e));
    (k, schedule)
}

// ─── tessera schedule ──────────────────────────────────────────────

fn cmd_schedule(input: &Path, config: Option<&Path>, ast: bool) {
    let config = load_config(input, config);
    let mut file = load_graph(input);
    let (_, schedule) = compile(&mut file, &config);
    let g = &file.graph;

    println!("{} item(s)", schedule.len());
    for (i, item) in schedule.items.iter().enumerate() {
        let bufs: Vec<String> = item
            .bufs
            .iter()
            .map(|b| format!("{}:{}[{}]", b.device, b.id, b.size))
            .collect();
        println!(
            "{:>4} {:<24} {}  ({})",
            i,
            item.name(g),
            bufs.join(" "),
            item.provenance()
        );
        if ast && g.op(item.ast) == Op::Sink {
            for line in g.render(item.ast).lines() {
                println!("       {}", line);
            }
        }
    }
    if !schedule.var_vals.is_empty() {
        let vals: Vec<String> = schedule
            .var_vals
            .iter()
            .map(|(v, x)| format!("{}={}", v, x))
            .collect();
        println!("vars: {}", vals.join(" "));
    }
}

// ─── tessera run ───────────────────────────────────────────────────

#[derive(Serialize)]
struct OutputReport {
    name: String,
    shape: Vec<i64>,
    values: Vec<f64>,
}

#[derive(Serialize)]
struct RunReport {
    outputs: Vec<OutputReport>,
    stats: Stats,
    cache: CacheCounters,
}

fn cmd_run(input: &Path, config: Option<&Path>, wait: bool, json: bool, show: usize) {
    let config = load_config(input, config);
    let mut file = load_graph(input);
    let (k, mut schedule) = compile(&mut file, &config);

    let mut engine = Engine::host()
        .with_context(config.render)
        .with_wait(wait || config.wait);
    for init in &file.inits {
        let desc = BufferDesc::from_node(&file.graph, init.node).unwrap_or_else(|e| fail(e));
        engine
            .write(&desc, &init.fill.values(desc.size))
            .unwrap_or_else(|e| fail(format!("filling '{}': {}", init.name, e)));
    }

    let mut vals = file.var_vals.clone();
    vals.extend(schedule.var_vals.iter().map(|(v, x)| (v.clone(), *x)));
    let stats = engine
        .run_schedule(&file.graph, &mut schedule.items, &vals)
        .unwrap_or_else(|e| fail(e));

    let results: Vec<_> = file.graph.src(k.sink).to_vec();
    let mut outputs = Vec::with_capacity(results.len());
    for (out, node) in file.outputs.iter().zip(results) {
        let shape = file
            .graph
            .shape(node)
            .map(|s| eval_shape(s, &vals))
            .transpose()
            .unwrap_or_else(|e| fail(e))
            .unwrap_or_default();
        let values = engine
            .readback(&mut file.graph, node, &vals)
            .unwrap_or_else(|e| fail(format!("reading '{}': {}", out.name, e)));
        outputs.push(OutputReport {
            name: out.name.clone(),
            shape,
            values,
        });
    }

    if json {
        let report = RunReport {
            outputs,
            stats,
            cache: engine.cache().counters(),
        };
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => fail(e),
        }
        return;
    }

    for out in &outputs {
        let shown: Vec<String> = out.values.iter().take(show).map(|v| format!("{}", v)).collect();
        let more = if out.values.len() > show { " ..." } else { "" };
        println!("{} {:?}: [{}{}]", out.name, out.shape, shown.join(", "), more);
    }
    eprintln!(
        "{} kernel(s), {} ops, {} bytes{}",
        stats.kernel_count,
        stats.global_ops,
        stats.global_mem,
        if stats.time_sum_s > 0.0 {
            format!(", {:.3} ms, {:.2} GFLOPS", stats.time_sum_s * 1e3, stats.gflops())
        } else {
            String::new()
        }
    );
}

// ─── tessera hash ──────────────────────────────────────────────────

fn cmd_hash(input: &Path, config: Option<&Path>, full: bool) {
    let config = load_config(input, config);
    let mut file = load_graph(input);
    let sink = file.sink();
    let graph_hash = file.graph.content_hash(sink);
    let (_, schedule) = compile(&mut file, &config);
    let g = &file.graph;

    if full {
        eprintln!("Graph: {} {}", graph_hash.to_hex(), input.display());
    } else {
        eprintln!("Graph: {} {}", graph_hash, input.display());
    }
    for item in &schedule.items {
        let hash = g.content_hash(item.ast);
        if full {
            println!("  {} {}", hash.to_hex(), item.name(g));
        } else {
            println!("  {} {}", hash, item.name(g));
        }
    }
}
