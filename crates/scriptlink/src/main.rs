//! ScriptLink CLI
//!
//! Runs one script under a component and prints what it reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use scriptlink::{ScriptLink, ScriptLinkConfig};

/// Supervised script processes over a shared event transport
#[derive(Parser, Debug)]
#[command(name = "scriptlink")]
#[command(about = "Run scripts as supervised child processes", long_about = None)]
struct Args {
    /// Config file (defaults to ./scriptlink.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one script until it ends or Ctrl+C is pressed
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Script to run (defaults to `default_script` from the config)
    script: Option<PathBuf>,

    /// Base directory for relative script paths
    #[arg(long)]
    scripts_root: Option<PathBuf>,

    /// Interpreter executable
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Event names to listen for
    #[arg(long = "bind", value_name = "EVENT")]
    bind: Vec<String>,

    /// Events to send once the script is running
    #[arg(long = "emit", value_name = "EVENT=JSON", value_parser = parse_emit)]
    emit: Vec<(String, Value)>,

    /// Namespace for binds and emits
    #[arg(long, default_value = scriptlink_runtime::DEFAULT_NAMESPACE)]
    namespace: String,

    /// How often expired callbacks are swept, in milliseconds
    #[arg(long, default_value = "100")]
    tick_ms: u64,
}

fn parse_emit(s: &str) -> Result<(String, Value), String> {
    let (name, json) = s
        .split_once('=')
        .ok_or_else(|| format!("expected EVENT=JSON, got '{}'", s))?;
    let payload = serde_json::from_str(json)
        .map_err(|e| format!("invalid JSON for '{}': {}", name, e))?;
    Ok((name.to_string(), payload))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scriptlink=info,script=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line arguments
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ScriptLinkConfig::load(path).await?,
        None => ScriptLinkConfig::discover(".").await?,
    };

    match args.command {
        Command::Run(run) => run_script(config, run).await,
    }
}

async fn run_script(mut config: ScriptLinkConfig, args: RunArgs) -> Result<()> {
    if let Some(root) = args.scripts_root {
        config.scripts_root = Some(root);
    }
    if let Some(interpreter) = args.interpreter {
        config.interpreter = interpreter;
    }
    let script = args
        .script
        .or_else(|| config.default_script.clone())
        .context("no script given and no default_script configured")?;

    info!("Starting ScriptLink v{}", env!("CARGO_PKG_VERSION"));

    let link = ScriptLink::start(config);
    link.connect()?;
    let mut component = link.component();

    let ended = Arc::new(AtomicBool::new(false));
    let ended_flag = Arc::clone(&ended);
    component.on_script_begin(|id| info!("Script started as process {}", id));
    component.on_console_log(|line| println!("{}", line));
    component.on_event(|event| println!("{} {}", event.event_name, event.payload));
    component.on_script_error(|failure| {
        error!("Script {} failed: {}", failure.script_path.display(), failure.message)
    });
    component.on_script_end(move |path| {
        info!("Script {} ended", path.display());
        ended_flag.store(true, Ordering::SeqCst);
    });

    component.run_script(&script)?;
    for name in &args.bind {
        component.bind_event(name, &args.namespace)?;
    }
    for (name, payload) in args.emit {
        if let Err(e) = component.emit(&name, payload, &args.namespace) {
            warn!("Failed to emit '{}': {}", name, e);
        }
    }

    let mut sweep = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    while !ended.load(Ordering::SeqCst) {
        tokio::select! {
            _ = component.pump_next() => {}
            _ = sweep.tick() => {
                component.pump();
            }
            _ = &mut shutdown => {
                info!("Stopping script...");
                component.stop_script();
                break;
            }
        }
    }

    // Give the child its grace period before the runtime goes away
    let grace = Duration::from_millis(link.config().stop_grace_ms);
    link.shutdown();
    tokio::time::sleep(grace).await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
