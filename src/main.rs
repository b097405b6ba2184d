/// dgxsim: an interactive shell on a simulated DGX SuperPOD.
///
/// Usage:
///   dgxsim                       # interactive shell on dgx-00
///   dgxsim -c "nvidia-smi -L"    # run one command and exit with its status
///   dgxsim --drift -v            # live metrics drift, info-level logs on stderr
///
/// Run `cargo run --bin viz` in another terminal to watch the cluster.
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dgxsim::cluster::{Cluster, HardwareSpec};
use dgxsim::config::SimConfig;
use dgxsim::context::CommandContext;
use dgxsim::control::render_summary;
use dgxsim::drift::DriftTask;
use dgxsim::engine::Engine;
use dgxsim::metrics::{write_metrics, LiveMetrics};
use dgxsim::store::{ClusterStore, SharedStore};

#[derive(Parser)]
#[command(name = "dgxsim")]
#[command(version, about = "Simulated DGX SuperPOD shell for operator training", long_about = None)]
struct Cli {
    /// Number of DGX nodes
    #[arg(long)]
    nodes: Option<usize>,

    /// Cluster name
    #[arg(long)]
    name: Option<String>,

    /// Run metrics drift in the background
    #[arg(long)]
    drift: bool,

    /// Seed for the drift RNG
    #[arg(long)]
    seed: Option<u64>,

    /// Start from an exported cluster document
    #[arg(long, value_name = "FILE")]
    import: Option<PathBuf>,

    /// Run one command and exit with its status
    #[arg(short = 'c', value_name = "COMMAND")]
    command: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Live snapshot path read by `viz`
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut cfg = SimConfig::load();
    if let Some(n) = cli.nodes {
        anyhow::ensure!(n > 0, "--nodes must be at least 1");
        cfg.node_count = n;
    }
    if let Some(name) = cli.name {
        cfg.cluster_name = name;
    }
    if let Some(path) = cli.snapshot {
        cfg.snapshot_path = path;
    }
    cfg.seed = cli.seed.or(cfg.seed);

    let mut store = ClusterStore::new(Cluster::new(&cfg.cluster_name, cfg.node_count, HardwareSpec::dgx_h100()));
    if let Some(path) = &cli.import {
        let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        store
            .import_cluster(&json)
            .with_context(|| format!("importing {}", path.display()))?;
    }
    let start_node = match store.cluster().node(&cfg.start_node) {
        Some(n) => n.id.clone(),
        None => store
            .cluster()
            .nodes
            .first()
            .map(|n| n.id.clone())
            .context("cluster has no nodes")?,
    };
    info!(cluster = %store.cluster().name, nodes = store.cluster().nodes.len(), "cluster ready");

    let shared = store.into_shared();
    let mut drift = cli.drift.then(|| {
        let path = cfg.snapshot_path.clone();
        DriftTask::start(shared.clone(), cfg.drift.clone(), cfg.seed, move |s| {
            publish(&path, &LiveMetrics::from_store(s, true, None));
        })
    });
    let drift_running = drift.is_some();

    let mut engine = Engine::new(shared.clone());
    let mut ctx = CommandContext::new(&start_node);

    let code = match cli.command {
        Some(line) => {
            let out = engine.execute(&line, &mut ctx);
            print!("{}", out.output);
            snapshot(&cfg.snapshot_path, &shared, drift_running, Some(&line));
            out.exit_code
        }
        None => {
            repl(&mut engine, &mut ctx, &cfg, drift_running)?;
            0
        }
    };

    if let Some(task) = drift.as_mut() {
        task.stop();
    }
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

fn repl(engine: &mut Engine, ctx: &mut CommandContext, cfg: &SimConfig, drift_running: bool) -> Result<()> {
    {
        let store = engine.store().read();
        print!("{}", render_summary(&store.cluster().name, &store.summary()));
    }
    println!("Type 'help' for the command list, 'exit' to quit.\n");
    snapshot(&cfg.snapshot_path, engine.store(), drift_running, None);

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("{}", ctx.prompt());
        stdout.flush().context("writing prompt")?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("reading command")? == 0 {
            println!();
            break;
        }
        let out = engine.execute(&line, ctx);
        print!("{}", out.output);
        snapshot(&cfg.snapshot_path, engine.store(), drift_running, Some(line.trim()));
        if ctx.exited {
            break;
        }
    }
    Ok(())
}

fn snapshot(path: &Path, store: &SharedStore, drift_running: bool, last_command: Option<&str>) {
    let metrics = LiveMetrics::from_store(&store.read(), drift_running, last_command);
    publish(path, &metrics);
}

fn publish(path: &Path, metrics: &LiveMetrics) {
    if let Err(e) = write_metrics(path, metrics) {
        warn!(path = %path.display(), error = %e, "snapshot write failed");
    }
}
