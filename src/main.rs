//! Command-line entry point: drives a simulated automation run.
//!
//! Loads settings, wires the simulated rig to a `SequenceController`, starts
//! the run, and prints notifications until it finishes. Ctrl-C requests a
//! stop, which takes the safe-shutdown path before exiting.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vacuum_rig::config::Settings;
use vacuum_rig::core::{AutomationGuard, RunEvent};
use vacuum_rig::hardware::mock::SimulatedRig;
use vacuum_rig::hardware::poller::StatusPoller;
use vacuum_rig::sequencer::SequenceController;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Automation sequencer for a vacuum/thermal process rig.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Emit notifications as JSON lines instead of human-readable text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    // The binary only ever drives the simulated rig; real hardware comes in
    // through deployment-specific facades.
    let rig = SimulatedRig::spawn(Duration::from_millis(100));
    let (snapshots, _poller) = StatusPoller::spawn(rig.snapshot_source(), settings.poller.cadence);
    let controller = Arc::new(SequenceController::new(
        settings.run.clone(),
        rig.facade(),
        snapshots,
        AutomationGuard::new(),
    ));

    let mut events = controller.subscribe();
    if !controller.clone().start().await {
        anyhow::bail!("could not start the run");
    }

    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, requesting stop");
            if let Err(e) = stopper.stop().await {
                warn!(error = %e, "Stop request rejected");
            }
        }
    });

    loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event, cli.json)?;
                if let RunEvent::Completed { success, .. } = event {
                    info!(success, "Run finished, exiting");
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Notification stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    if let Some(result) = controller.last_result().await {
        println!("{}", result.summary);
        if !result.success {
            std::process::exit(1);
        }
    }
    Ok(())
}

fn print_event(event: &RunEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        RunEvent::StateChanged {
            previous,
            new,
            message,
        } => println!("[state] {} -> {}: {}", previous, new, message),
        RunEvent::Progress {
            state,
            percent,
            message,
            ..
        } => println!("[progress] {} {:>3}% {}", state, percent, message),
        RunEvent::Error { message, fatal } => {
            println!("[error] {}{}", message, if *fatal { " (fatal)" } else { "" })
        }
        RunEvent::Completed { success, summary } => {
            println!("[done] success={} {}", success, summary)
        }
    }
    Ok(())
}
