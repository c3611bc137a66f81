//! Binary entry point for laminark.
//!
//! Subcommands:
//! - `serve`: long-running engine process: owns the database, the
//!   embedding worker, and the periodic tasks, and speaks MCP over stdio.
//! - `hook`: short-lived per-event entry: reads one JSON hook event from
//!   stdin; only the synchronous events (SessionStart, PreToolUse) write to
//!   stdout, and the process always exits 0.
//! - `status`: one-shot health snapshot.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// The hook contract requires raw stdout for injected context.
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use laminark::config::LaminarkConfig;
use laminark::embedding::EmbeddingHandle;
use laminark::engine::Engine;
use laminark::mcp::McpServer;
use laminark::models::{ProjectRef, Verbosity};
use laminark::storage::Storage;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// A per-developer knowledge memory engine for AI coding assistants.
#[derive(Parser)]
#[command(name = "laminark", version, about)]
struct Cli {
    /// Override the data directory (database and config files).
    #[arg(long, env = "LAMINARK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Disable the optional visualization server.
    #[arg(long = "no_gui")]
    no_gui: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and serve MCP over stdio.
    Serve,
    /// Handle one hook event from stdin.
    Hook,
    /// Print a health snapshot.
    Status,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing();

    let mut config = cli
        .data_dir
        .clone()
        .map_or_else(LaminarkConfig::from_env, LaminarkConfig::with_data_dir);
    config.no_gui = cli.no_gui;

    match cli.command {
        Command::Serve => serve(config),
        Command::Hook => {
            // A failed hook silently drops one event rather than breaking
            // the host; exit status stays 0 no matter what.
            if let Err(e) = hook(config) {
                tracing::warn!(error = %e, "hook event dropped");
            }
            Ok(())
        },
        Command::Status => status(&config),
    }
}

/// Logs go to stderr so stdout stays reserved for injected context and the
/// MCP transport. `LAMINARK_DEBUG=1` raises the default level.
fn init_tracing() {
    let default_directive = if LaminarkConfig::debug_enabled() {
        "laminark=debug"
    } else {
        "laminark=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serve(config: LaminarkConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(async {
        let verbosity = tool_verbosity(&config);
        let engine = Arc::new(Engine::new(config).context("engine startup")?);
        let project = current_project();
        tracing::info!(project = project.name, hash = project.hash, "laminark serving");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let tasks = engine.spawn_periodic_tasks(&shutdown_tx);

        let server = McpServer::new(Arc::clone(&engine), project, verbosity);
        tokio::select! {
            result = server.run_stdio(shutdown_rx.clone()) => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "transport closed");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
            },
            () = terminate_signal() => {
                tracing::info!("terminate received");
            },
        }

        // Stop periodic timers, then the embedding worker; in-flight ticks
        // do not re-enter after stop.
        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        engine.shutdown();
        Ok(())
    })
}

fn hook(config: LaminarkConfig) -> anyhow::Result<()> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("hook stdin")?;
    let Some(event) = laminark::hooks::HookEvent::parse(&raw) else {
        return Ok(());
    };

    // Hooks are short-lived: no embedding worker, no LLM adapter. The serve
    // process picks enrichment up from the shared queue.
    let storage = Storage::open(&config.db_path).context("hook storage")?;
    let engine = Engine::assemble(config, storage, Arc::new(EmbeddingHandle::disabled()), None);

    if let Some(stdout) = laminark::hooks::dispatch(&engine, &event) {
        println!("{stdout}");
    }
    Ok(())
}

fn status(config: &LaminarkConfig) -> anyhow::Result<()> {
    let storage = Storage::open(&config.db_path).context("status storage")?;
    let cache = laminark::services::StatusCache::new(storage, Arc::new(EmbeddingHandle::disabled()));
    cache.refresh().context("status refresh")?;
    let snapshot = cache.snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("status render")?
    );
    Ok(())
}

/// Resolves on SIGTERM; pends forever where the signal does not exist.
async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            term.recv().await;
            return;
        }
    }
    std::future::pending::<()>().await
}

fn tool_verbosity(config: &LaminarkConfig) -> Verbosity {
    let loaded: laminark::config::ToolVerbosityConfig =
        laminark::config::load_project_config(&config.data_dir, "tool-verbosity.json");
    loaded.level
}

fn current_project() -> ProjectRef {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    ProjectRef::from_path(&cwd)
}
