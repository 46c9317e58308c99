//! Roll-call scanner (rollscan) - Main entry point
//!
//! Reads decoded codes from a keyboard-wedge scanner (stdin) or a file,
//! runs them through the scan session and prints what happened. Operator
//! actions (reset, clear-history) and read-only views (history, status)
//! are subcommands.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rollscan_common::config::{
    load_toml_config_or_default, user_config_path, write_toml_config, DataFolderInitializer,
};
use rollscan_common::events::{EventBus, ScanEvent, SessionStatus};
use rollscan_sc::config::{Overrides, ScannerConfig};
use rollscan_sc::decoder::{LineReader, ScannerHandle, DEFAULT_CHANNEL_CAPACITY};
use rollscan_sc::delivery::{build_http_client, DeliveryQueue, HttpSink};
use rollscan_sc::history::{HistoryEntry, HistoryLedger, OutcomeStatus};
use rollscan_sc::scan::{HttpRosterClient, Progress, SequenceTracker};
use rollscan_sc::session::ScanSession;
use rollscan_sc::store::{FileStore, MemoryStore, StateStore};

const EVENT_CAPACITY: usize = 64;

/// Command-line arguments for rollscan
#[derive(Parser, Debug)]
#[command(name = "rollscan")]
#[command(about = "Roll-call code scanner with a spreadsheet backend")]
#[command(version)]
struct Args {
    /// TOML config file (default: ~/.config/rollscan/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Folder holding scan state and history
    #[arg(short, long, global = true, env = "ROLLSCAN_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    /// Spreadsheet endpoint URL (roster lookup and scan delivery)
    #[arg(short, long, global = true, env = "ROLLSCAN_ENDPOINT")]
    endpoint: Option<String>,

    /// Operator name attached to history entries
    #[arg(short, long, global = true, env = "ROLLSCAN_OPERATOR")]
    operator: Option<String>,

    /// History entries kept (10..=20)
    #[arg(long, global = true)]
    history_cap: Option<usize>,

    /// Log level, or a full tracing filter directive
    #[arg(long, global = true, env = "ROLLSCAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Keep state in memory only; nothing is written to the data folder
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            data_folder: self.data_folder.clone(),
            endpoint_url: self.endpoint.clone(),
            operator: self.operator.clone(),
            history_cap: self.history_cap,
            log_level: self.log_level.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan codes (default when no subcommand given)
    Scan(ScanArgs),
    /// Clear the roll call, roster cache and history
    Reset,
    /// Clear the history only
    ClearHistory,
    /// Print the history, newest first
    History,
    /// Print roll-call progress
    Status,
    /// Write the effective settings to --config (default: the per-user config file)
    SaveConfig,
}

#[derive(ClapArgs, Debug, Default)]
struct ScanArgs {
    /// Read codes from this file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config =
        load_toml_config_or_default(args.config.as_deref()).context("Failed to load config file")?;
    let config = ScannerConfig::resolve(args.overrides(), &toml_config);
    let config_path = args.config.clone();

    init_tracing(&config)?;

    info!("Starting rollscan v{}", env!("CARGO_PKG_VERSION"));
    info!("Data folder: {}", config.data_folder.display());

    let command = args.command.unwrap_or(Command::Scan(ScanArgs::default()));
    if let Command::SaveConfig = command {
        return save_config(&config, config_path);
    }

    let store: Arc<dyn StateStore> = if args.ephemeral {
        warn!("Ephemeral mode: scan state will not survive this run");
        Arc::new(MemoryStore::new())
    } else {
        DataFolderInitializer::new(config.data_folder.clone())
            .ensure_directory_exists()
            .context("Failed to create data folder")?;
        Arc::new(FileStore::new(&config.data_folder))
    };

    match command {
        Command::Scan(scan_args) => run_scan(&config, store, scan_args).await,
        Command::Reset => reset(&config, store),
        Command::ClearHistory => clear_history(&config, store),
        Command::History => print_history(&config, store),
        Command::Status => print_status(&config, store),
        Command::SaveConfig => save_config(&config, config_path),
    }
}

fn init_tracing(config: &ScannerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter()))
        .context("Invalid log level")?;

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

async fn run_scan(config: &ScannerConfig, store: Arc<dyn StateStore>, args: ScanArgs) -> Result<()> {
    let endpoint = config.require_endpoint()?.to_string();
    info!("Endpoint: {}", endpoint);

    let http_client = build_http_client().context("Failed to build HTTP client")?;
    let roster = Arc::new(HttpRosterClient::new(http_client.clone(), endpoint.clone()));
    let delivery = DeliveryQueue::new(
        Arc::new(HttpSink::new(http_client, endpoint)),
        config.delivery.clone(),
    );

    let events = EventBus::new(EVENT_CAPACITY);
    let printer = spawn_printer(events.subscribe(), args.json);

    let mut session = ScanSession::open(store, config.history_cap, roster, delivery, events)
        .context("Failed to load scan state")?;
    if let Some(operator) = &config.operator {
        session.login(operator);
    }

    let reader = match &args.input {
        Some(path) => LineReader::file(path),
        None => LineReader::stdin(),
    };

    let mut scanner = match ScannerHandle::start(reader, DEFAULT_CHANNEL_CAPACITY).await {
        Ok(scanner) => scanner,
        Err(e) => {
            session.camera_unavailable(&e);
            drop(session);
            finish_printer(printer).await;
            return Err(e).context("Scanning unavailable");
        }
    };

    print_progress(&session.progress());

    let interrupted = tokio::select! {
        _ = session.run(&mut scanner) => false,
        _ = shutdown_signal() => true,
    };
    scanner.shutdown().await;

    // Input ended: wait for outstanding sends unless the operator stops us
    if !interrupted && session.deliveries_in_flight() > 0 {
        info!(
            in_flight = session.deliveries_in_flight(),
            "Waiting for outstanding sends"
        );
        tokio::select! {
            _ = session.settle_deliveries() => {},
            _ = shutdown_signal() => {},
        }
    }
    let abandoned = session.deliveries_in_flight();
    if abandoned > 0 {
        warn!(
            abandoned,
            "Sends still outstanding at exit; their scans stay admitted but have no history entry"
        );
    }

    print_progress(&session.progress());

    drop(session);
    finish_printer(printer).await;

    info!("Scanner shutdown complete");
    Ok(())
}

fn reset(config: &ScannerConfig, store: Arc<dyn StateStore>) -> Result<()> {
    let mut tracker = SequenceTracker::load(store.clone()).context("Failed to load scan state")?;
    // Same order as ScanSession::reset: history first, roll call last
    HistoryLedger::load(store, config.history_cap)
        .clear()
        .context("Failed to clear history")?;
    tracker.reset().context("Failed to reset roll call")?;
    tracker
        .reset_inline_count()
        .context("Failed to reset inline numbering")?;

    println!("Roll call reset");
    Ok(())
}

fn clear_history(config: &ScannerConfig, store: Arc<dyn StateStore>) -> Result<()> {
    HistoryLedger::load(store.clone(), config.history_cap)
        .clear()
        .context("Failed to clear history")?;
    SequenceTracker::load(store)
        .context("Failed to load scan state")?
        .reset_inline_count()
        .context("Failed to reset inline numbering")?;

    println!("History cleared");
    Ok(())
}

fn save_config(config: &ScannerConfig, explicit: Option<PathBuf>) -> Result<()> {
    let path = explicit
        .or_else(user_config_path)
        .context("No per-user config directory on this platform, pass --config")?;
    write_toml_config(&config.to_toml(), &path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    println!("Configuration written to {}", path.display());
    Ok(())
}

fn print_history(config: &ScannerConfig, store: Arc<dyn StateStore>) -> Result<()> {
    let ledger = HistoryLedger::load(store, config.history_cap);
    if ledger.entries().is_empty() {
        println!("No scans recorded");
        return Ok(());
    }
    for entry in ledger.entries() {
        println!("{}", format_history_entry(entry));
    }
    Ok(())
}

fn print_status(config: &ScannerConfig, store: Arc<dyn StateStore>) -> Result<()> {
    let tracker = SequenceTracker::load(store.clone()).context("Failed to load scan state")?;
    let ledger = HistoryLedger::load(store, config.history_cap);

    print_progress(&tracker.progress());
    println!("Inline scans: {}", tracker.inline_count());
    println!(
        "History: {} of {} entries",
        ledger.total_recorded(),
        ledger.cap()
    );
    if let Some(operator) = &config.operator {
        println!("Operator: {}", operator);
    }
    Ok(())
}

fn print_progress(progress: &Progress) {
    match (&progress.batch_id, progress.roster_len) {
        (None, _) => println!("No batch in progress"),
        (Some(batch), Some(len)) => println!(
            "Batch {}: {}/{} recorded ({}%)",
            batch,
            progress.admitted,
            len,
            progress.percent.unwrap_or(0)
        ),
        (Some(batch), None) => println!("Batch {}: {} recorded", batch, progress.admitted),
    }
}

fn format_history_entry(entry: &HistoryEntry) -> String {
    let number = entry
        .scan_number
        .map(|n| format!("#{n}"))
        .unwrap_or_else(|| "-".to_string());
    let status = match entry.status {
        OutcomeStatus::Success => "OK ",
        OutcomeStatus::Error => "ERR",
    };
    let mut line = format!(
        "{} {} {:>4} {} {} ({})",
        rollscan_common::time::to_iso8601(&entry.timestamp),
        status,
        number,
        entry.subject_id,
        entry.display_name,
        entry.subject_number
    );
    if let Some(message) = &entry.message {
        line.push_str(&format!(" - {}", message));
    }
    if let Some(operator) = &entry.operator {
        line.push_str(&format!(" [{}]", operator));
    }
    line
}

fn format_event(event: &ScanEvent) -> Option<String> {
    match event {
        ScanEvent::ScanAccepted {
            scan_number,
            subject_id,
            display_name,
            ..
        } => Some(format!(
            "#{} {} {}",
            scan_number,
            subject_id,
            display_name.as_deref().unwrap_or(rollscan_sc::history::NOT_AVAILABLE)
        )),
        ScanEvent::ScanRejected {
            reason, terminal, ..
        } => Some(if *terminal {
            format!("REJECTED: {} (run `rollscan reset`)", reason)
        } else {
            format!("REJECTED: {}", reason)
        }),
        ScanEvent::ScanMalformed { raw, .. } => Some(format!("Unrecognized code: {}", raw)),
        ScanEvent::DeliveryFailed {
            scan_number: Some(n),
            error,
            ..
        } => Some(format!("#{} recorded locally, send failed: {}", n, error)),
        ScanEvent::DeliveryFailed { error, .. } => Some(format!("Roster lookup failed: {}", error)),
        ScanEvent::StatusChanged {
            status: SessionStatus::CameraUnavailable(reason),
            ..
        } => Some(format!("Scanner unavailable: {}", reason)),
        ScanEvent::StatusChanged { .. } => None,
        ScanEvent::HistoryCleared { .. } => Some("History cleared".to_string()),
        ScanEvent::SessionReset { .. } => Some("Roll call reset".to_string()),
        ScanEvent::OperatorChanged {
            operator: Some(name),
            ..
        } => Some(format!("Operator: {}", name)),
        ScanEvent::OperatorChanged { operator: None, .. } => Some("Operator logged out".to_string()),
    }
}

/// Print session events until the bus closes
fn spawn_printer(mut rx: broadcast::Receiver<ScanEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Could not serialize event: {}", e),
                        }
                    } else if let Some(line) = format_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn finish_printer(printer: JoinHandle<()>) {
    if let Err(e) = printer.await {
        warn!("Event printer ended abnormally: {}", e);
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
