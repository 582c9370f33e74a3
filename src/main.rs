//! CLI entry point for mosaic_daq
//!
//! Provides commands for:
//! - Running one acquisition (currently against the simulated microscope)
//! - Checking a configuration file
//! - Estimating frame count and duration for a position list
//!
//! # Usage
//!
//! ```bash
//! mosaic_daq run --config config/acquisition.toml --positions config/positions.json \
//!     --output /data/ribbon_07 --simulate
//! mosaic_daq check-config --config config/acquisition.toml --print
//! mosaic_daq estimate --config config/acquisition.toml --positions config/positions.json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mosaic_daq::acquisition::{AcquisitionOrchestrator, PositionList, RunOutcome};
use mosaic_daq::config::AcquisitionConfig;
use mosaic_daq::hardware::{MockMicroscope, MockSettings};
use mosaic_daq::logging;
use mosaic_daq::remote::{self, RemoteEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mosaic_daq")]
#[command(about = "Mosaic acquisition for serial-section microscopy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire every activated position once
    Run {
        /// Acquisition configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Position list (JSON)
        #[arg(long)]
        positions: PathBuf,

        /// Output directory
        #[arg(long)]
        output: PathBuf,

        /// Drive the simulated microscope
        #[arg(long)]
        simulate: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Acquisition configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Print the effective configuration
        #[arg(long)]
        print: bool,
    },

    /// Print frame count and estimated duration for a position list
    Estimate {
        /// Acquisition configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Position list (JSON)
        #[arg(long)]
        positions: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            positions,
            output,
            simulate,
        } => run_acquisition(config, positions, output, simulate).await,
        Commands::CheckConfig { config, print } => check_config(config, print),
        Commands::Estimate { config, positions } => estimate(config, positions),
    }
}

fn load_config(path: &Path) -> Result<AcquisitionConfig> {
    let config = AcquisitionConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run_acquisition(
    config_path: PathBuf,
    positions_path: PathBuf,
    output: PathBuf,
    simulate: bool,
) -> Result<()> {
    let config = load_config(&config_path)?;
    logging::init_from_config(&config)?;

    if !simulate {
        bail!(
            "No microscope driver is configured; pass --simulate to use the simulated microscope"
        );
    }

    let positions = PositionList::load_json(&positions_path)?;
    positions.validate()?;

    let (control, link) = remote::channel();
    let scope = Arc::new(MockMicroscope::new(MockSettings::default()));
    let orchestrator = AcquisitionOrchestrator::new(scope, config, link);

    let mut events = control.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RemoteEvent::Progress { message, .. }) => info!("{message}"),
                Ok(RemoteEvent::Notification { priority, message }) => {
                    warn!(%priority, "{message}")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let abort = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting at the next frame boundary");
            abort.abort();
        }
    });

    let report = orchestrator.run(&positions, &output).await?;

    println!("Run {}", report.run_id);
    println!("  Tokens written: {}", report.tokens_issued);
    println!("  Faults:         {}", report.faults.len());
    println!("  Autofocus failures: {}", report.autofocus_failures);
    println!("  Elapsed:        {}s", report.elapsed().num_seconds());
    match &report.outcome {
        RunOutcome::Completed => {
            println!("  Outcome:        completed");
            Ok(())
        }
        RunOutcome::Aborted(reason) => {
            println!(
                "  Outcome:        aborted ({reason}) at section {}, frame {}",
                report.last_section, report.last_frame
            );
            match report.fault() {
                Some(fault) => Err(fault.into()),
                None => Ok(()),
            }
        }
    }
}

fn check_config(config_path: PathBuf, print: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    println!("{}: ok", config_path.display());
    println!(
        "  {} used channel(s), {} z-plane(s), focus scored on '{}'",
        config.channels.used_count(),
        config.z_planes(),
        config.channels.focus_score_channel
    );
    if print {
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn estimate(config_path: PathBuf, positions_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let positions = PositionList::load_json(&positions_path)?;
    positions.validate()?;

    let (control, link) = remote::channel();
    let scope = Arc::new(MockMicroscope::new(MockSettings::default()));
    let orchestrator = AcquisitionOrchestrator::new(scope, config, link);
    orchestrator.plan(&positions);

    let captures = positions.activated_captures()
        * orchestrator.config().channels.used_count()
        * orchestrator.config().z_planes();
    println!("Sections: {}", positions.len());
    println!("Frames:   {}", control.remaining_frames());
    println!("Captures: {captures}");
    println!(
        "Estimated time: {:.1}s",
        control.remaining_time().as_secs_f64()
    );
    Ok(())
}
