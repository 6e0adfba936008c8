//! Backtick++ helper
//!
//! Background process that serves the editor extension over a Unix socket.
//!
//! Responsibilities:
//! - Own the most-recently-used order of the target app's windows
//! - Answer window list, status, permission and activation requests
//! - Remove its socket file on every exit path

mod config;
mod dispatch;
mod server;
mod store;

use anyhow::{Context, Result};
use backtick_core_order::WindowOrder;
use clap::Parser;
use config::Config;
use dispatch::Dispatcher;
use server::BindOutcome;
use std::path::PathBuf;
use store::StoreHandle;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "backtick-helper")]
#[command(author, version, about = "Window-order helper for Backtick++", long_about = None)]
struct Args {
    /// Config file to load instead of the standard locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path, overriding the config file
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

/// Map a validated `behavior.log_level` to a tracing level.
fn log_level(name: &str) -> Level {
    match name {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// SIGINT and SIGTERM streams, registered before the socket file exists.
struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl TerminationSignals {
    /// Replace the default dispositions so a signal can no longer kill the
    /// process before the socket guard runs.
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?,
        })
    }

    /// Wait for either signal and return its name.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Wait for SIGINT or SIGTERM, then stop the event loop.
async fn shutdown_on_signal(mut signals: TerminationSignals, store: StoreHandle) {
    let name = signals.recv().await;
    info!("{} received, initiating shutdown...", name);
    store.shutdown("termination signal").await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (needed for log level)
    let (mut config, config_source) = Config::load(args.config.as_deref()).unwrap_or_else(|e| {
        // Can't use tracing yet, fall back to eprintln
        eprintln!("Failed to load configuration: {:#}. Using defaults.", e);
        (Config::default(), None)
    });
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }

    // Validate before reading log_level so the level name is normalized
    let config_warnings = config.validate();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&config.behavior.log_level))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    for w in &config_warnings {
        warn!("Config: {} - {}", w.field, w.message);
    }

    info!("Backtick++ helper starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &config_source {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let (target, target_warning) = config.compile_target();
    if let Some(w) = target_warning {
        warn!("Config: {} - {}", w.field, w.message);
    }
    let source = backtick_platform::default_source(target);

    let signals = TerminationSignals::install()?;

    let socket_path = config.server.socket_path.clone();
    let (listener, socket_guard) = match server::bind_socket(&socket_path, config.server.backlog)
        .await
        .context("Failed to start IPC server")?
    {
        BindOutcome::Bound { listener, guard } => (listener, guard),
        BindOutcome::AlreadyRunning => {
            info!(
                "Another backtick-helper instance is already running ({} is active)",
                socket_path.display()
            );
            return Ok(());
        }
    };
    info!("IPC server listening on {}", socket_guard.path().display());

    let (store, event_rx) = StoreHandle::channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    let server_task = tokio::spawn(server::run_ipc_server(
        listener,
        Dispatcher::new(source, store.clone()),
        store.clone(),
        config.server.io_timeout(),
        stop_rx,
    ));
    tokio::spawn(shutdown_on_signal(signals, store));

    // Main event loop
    let order = store::run_event_loop(event_rx, WindowOrder::new()).await;
    info!("Event loop stopped with {} tracked windows", order.len());

    let _ = stop_tx.send(());
    if let Err(e) = server_task.await {
        warn!("IPC server task failed: {}", e);
    }

    drop(socket_guard);
    info!("Backtick++ helper shutting down.");
    Ok(())
}
