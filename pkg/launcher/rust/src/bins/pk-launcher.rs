// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use pk_launcher::config::load_script;
use pk_launcher::host::SystemHost;
use pk_launcher::process::ProcessMonitor;
use pk_launcher::runner::{RunOutcome, Runner};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{Signal, SignalKind, signal};

#[derive(Debug, Parser)]
#[command(
    name = "pk-launcher",
    version,
    about = "Run launcher scripts and supervise what they start"
)]
struct Cli {
    /// Log level: trace, debug, info, warn, error or off.
    #[arg(long, global = true, env = "PK_LAUNCHER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a script, then keep its daemons alive until SIGTERM or SIGINT.
    Run(RunArgs),
    /// Parse a script and compile its readiness patterns without running it.
    Check {
        script: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    script: PathBuf,

    /// Directory relative paths resolve against. Defaults to the script's directory.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Seconds to wait for a readiness match when a step sets no timeout.
    #[arg(long, env = "PK_LAUNCHER_READY_TIMEOUT")]
    ready_timeout: Option<u64>,

    /// Write published variables to this file as JSON.
    #[arg(long, env = "PK_LAUNCHER_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL when stopping daemons.
    #[arg(long, default_value_t = 10)]
    stop_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = pk_agent_log::parse_level(&cli.log_level)
        .ok_or_else(|| anyhow!("unknown log level '{}'", cli.log_level))?;
    pk_agent_log::init("PK-LAUNCHER", level)?;
    info!("pk-launcher starting (version {})", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Check { script } => {
            let parsed = load_script(&script)?;
            println!("{}: ok ({} step(s))", script.display(), parsed.run.len());
            Ok(())
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let script = load_script(&args.script)?;
    let root = match args.cwd {
        Some(dir) => dir,
        None => script_dir(&args.script),
    };
    let stop_timeout = Duration::from_secs(args.stop_timeout);
    // Installed before anything is spawned, so a signal never leaves children
    // behind.
    let mut signals = ShutdownSignals::install()?;

    let mut runner = Runner::new(&root, SystemHost)
        .with_ready_timeout(args.ready_timeout.map(Duration::from_secs));
    let result = tokio::select! {
        result = runner.run(&script) => result,
        name = signals.recv() => Err(anyhow!("interrupted by {name}")),
    };
    let outcome = runner.into_outcome();

    if let Err(e) = result {
        error!("{e:#}");
        outcome.shutdown(stop_timeout).await;
        return Err(e);
    }

    for (name, value) in outcome.variables.snapshot() {
        println!("{name}={value}");
    }
    if let Some(path) = &args.state_file {
        outcome
            .variables
            .write_json(path)
            .context("publishing variables")?;
        info!("variables written to {}", path.display());
    }

    if !script.daemon {
        if !outcome.daemons.is_empty() {
            warn!(
                "script is not a daemon, stopping {} process(es) it left running",
                outcome.daemons.len()
            );
        }
        outcome.shutdown(stop_timeout).await;
        return Ok(());
    }
    supervise(outcome, stop_timeout, signals).await
}

struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        };
        info!("received {name}");
        name
    }
}

/// Wait for a shutdown signal, or for every daemon to exit on its own. The
/// latter means the app died unasked and is reported as a failure.
async fn supervise(
    outcome: RunOutcome,
    stop_timeout: Duration,
    mut signals: ShutdownSignals,
) -> Result<()> {
    if outcome.daemons.is_empty() {
        info!("no daemons left running");
        return Ok(());
    }
    let monitors: Vec<ProcessMonitor> = outcome.daemons.iter().map(|d| d.monitor()).collect();
    info!("supervising {} daemon(s)", monitors.len());

    let crashed = tokio::select! {
        _ = signals.recv() => None,
        () = all_exited(&monitors) => Some(describe_exits(&monitors)),
    };

    outcome.shutdown(stop_timeout).await;
    if let Some(exits) = crashed {
        bail!("all daemons exited on their own: {exits}");
    }
    info!("pk-launcher shutting down");
    Ok(())
}

fn describe_exits(monitors: &[ProcessMonitor]) -> String {
    monitors
        .iter()
        .map(|m| format!("[{}] {}", m.name(), m.state()))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn all_exited(monitors: &[ProcessMonitor]) {
    for monitor in monitors {
        monitor.wait_exit().await;
    }
}

fn script_dir(script: &Path) -> PathBuf {
    match script.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
