//! `TermSync` simulator: several peers syncing rooms and direct messages
//! over an in-memory network that drops, duplicates and corrupts
//! deliveries.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/termsync/config.toml`). Events are printed to stdout; logs go
//! to a file.
//!
//! ```bash
//! cargo run --bin termsync -- --peers 4 --room status --room dev --drop-rate 0.3
//!
//! # Keep the first peer's identity across runs
//! TERMSYNC_IDENTITY=~/.local/share/termsync/identity.key cargo run
//! ```

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use termsync::config::{CliArgs, ClientConfig};
use termsync::event::Event;
use termsync::sim::{self, SimReport};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(?config, "termsync starting");

    let (tx, rx) = mpsc::channel::<(String, Event)>(config.engine.event_buffer.max(1));
    let printer = tokio::spawn(print_events(rx, std::io::stdout()));

    let result = sim::run(&config, tx).await;
    if printer.await.is_err() {
        tracing::warn!("event printer panicked");
    }

    match result {
        Ok(report) => {
            print_report(&report);
            tracing::info!(converged = report.converged(), "termsync exiting");
            if report.converged() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Writes one line per observed event until every peer has gone away.
///
/// Returns the number of events written.
async fn print_events(mut rx: mpsc::Receiver<(String, Event)>, mut out: impl Write) -> usize {
    let mut written = 0;
    while let Some((peer, event)) = rx.recv().await {
        let line = sim::format_event(chrono::Local::now(), peer.as_str(), &event);
        if let Err(e) = writeln!(out, "{line}") {
            tracing::warn!(error = %e, "failed to write event");
            continue;
        }
        written += 1;
    }
    written
}

fn print_report(report: &SimReport) {
    println!();
    println!("expected per room: {}", report.expected_per_room);
    for peer in &report.peers {
        println!("{} ({})", peer.name, peer.fingerprint);
        for conversation in &peer.conversations {
            println!("  {:<24} {:>5}", conversation.contact.to_string(), conversation.stored);
        }
    }
    println!(
        "{}",
        if report.converged() {
            "all rooms converged"
        } else {
            "rooms did NOT converge"
        }
    );
}

/// Initialize file-based logging.
///
/// Logs are written to a file so they do not interleave with the event
/// output on stdout. Returns a [`WorkerGuard`] that must be held until
/// shutdown to ensure all buffered logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("termsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
