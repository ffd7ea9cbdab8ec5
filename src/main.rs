//! autofire-daemon: repeats an output key while a trigger key is held
//!
//! The daemon provides:
//! - Global trigger observation and key suppression via CGEventTap
//! - One timed emission loop per held trigger, any number of slots
//! - Hot reload of the binding file without restarting
//! - A global emergency stop (ctrl+alt+esc)
//! - An optional console editor for the binding file (`--ui`)

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use autofire_daemon::backend;
use autofire_daemon::config::Settings;
use autofire_daemon::editor::{Editor, EditorExit};
use autofire_daemon::engine::Engine;
use autofire_daemon::events::EngineEvent;
use autofire_daemon::lifecycle::ShutdownSignal;
use autofire_daemon::reload::HotReloader;
use autofire_daemon::slots::BindingSet;

#[derive(Debug, Parser)]
#[command(name = "autofire-daemon", version, about)]
struct Cli {
    /// Run the interactive slot editor on stdin
    #[arg(long)]
    ui: bool,

    /// Run without the editor (wins over --ui)
    #[arg(long)]
    headless: bool,

    /// Binding file, overrides AUTOFIRE_CONFIG
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Hot-reload poll interval in milliseconds (minimum 100)
    #[arg(long, value_name = "MS")]
    poll_ms: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

/// Run the editor on its own thread; stdin reads cannot be cancelled
fn spawn_editor(mut editor: Editor) -> Result<oneshot::Receiver<io::Result<EditorExit>>> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("editor".to_string())
        .spawn(move || {
            let exit = editor.run(io::stdin().lock(), io::stdout());
            let _ = tx.send(exit);
        })
        .context("failed to spawn editor thread")?;
    Ok(rx)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "autofire-daemon starting");

    // Load configuration
    let settings = Settings::load()?.with_overrides(cli.config.clone(), cli.poll_ms);
    settings.ensure_dirs()?;
    info!(binding_file = ?settings.binding_file, "configuration loaded");

    let shutdown = ShutdownSignal::new();
    let (event_tx, _event_rx) = broadcast::channel::<EngineEvent>(64);

    // Event tap runs on its own thread; fails without Accessibility permission
    let backend = backend::connect()
        .context("failed to start input backend - check Accessibility permissions")?;
    info!("input backend started");

    let engine = Arc::new(Engine::new(Arc::clone(&backend), event_tx.clone()));

    let initial = match BindingSet::load(&settings.binding_file, backend.as_ref()) {
        Ok(set) => set,
        Err(e) => {
            warn!(%e, "binding file rejected, starting with the default slot");
            BindingSet::default()
        }
    };
    let report = engine
        .apply(&initial)
        .context("no usable bindings, nothing to do")?;
    info!(
        registered = report.registered.len(),
        skipped = report.skipped.len(),
        status = %engine.status_line(),
        "bindings active"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let reloader = Arc::new(HotReloader::new(
        settings.binding_file.clone(),
        Arc::clone(&engine),
        initial.clone(),
        settings.poll_interval,
    ));
    let reload_task = tokio::spawn(Arc::clone(&reloader).run(stop_rx));

    let editor_rx = if cli.ui && !cli.headless {
        let editor = Editor::new(settings.binding_file.clone(), Arc::clone(&backend), initial);
        Some(spawn_editor(editor)?)
    } else {
        None
    };

    let mut events_rx = event_tx.subscribe();

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Wait for shutdown signal
        _ = async {
            if let Err(e) = shutdown.wait().await {
                error!(%e, "failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        } => {
            info!("shutdown signal received");
        }

        // Editor `quit` ends the daemon; closed stdin only ends the editor
        _ = async {
            match editor_rx {
                Some(rx) => match rx.await {
                    Ok(Ok(EditorExit::Quit)) => return,
                    Ok(Ok(EditorExit::EndOfInput)) => info!("editor input closed, continuing headless"),
                    Ok(Err(e)) => error!(%e, "editor failed"),
                    Err(_) => warn!("editor thread exited"),
                },
                None => {}
            }
            std::future::pending::<()>().await;
        } => {
            info!("editor requested quit");
        }

        // Surface engine events in the log
        _ = async {
            loop {
                match events_rx.recv().await {
                    Ok(event) if event.is_warning() => warn!(%event, "engine warning"),
                    Ok(event) => debug!(%event, "engine event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "engine event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("engine event stream closed");
        }
    }

    // Cleanup
    info!("shutting down...");

    let _ = stop_tx.send(true);
    if let Err(e) = reload_task.await {
        warn!(%e, "reload task ended abnormally");
    }
    engine.clear();

    info!("autofire-daemon stopped");

    Ok(())
}
