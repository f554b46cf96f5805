//! `fluidics-run` - headless step-table runner.
//!
//! Loads an instrument config and a CSV step table, builds the instrument
//! and runs the table through the matching protocol.
//!
//! Valves and pumps are simulated. With `--hardware` the temperature
//! controller named in `[temperature_controller]` is opened on its serial line
//! and polled in real time.
//!
//! # Usage
//!
//! ```bash
//! # Run a step table
//! fluidics-run run --config config/merfish.toml --steps sequences.csv
//!
//! # Compress pump and incubation time for a dry run
//! fluidics-run run --config config/merfish.toml --steps sequences.csv --time-scale 0.01
//!
//! # Hold temperatures on the real controller
//! fluidics-run run --config config/open_chamber.toml --steps sequences.csv --hardware
//!
//! # Print the estimate and validate every step without running
//! fluidics-run check --config config/merfish.toml --steps sequences.csv
//! ```
//!
//! Ctrl-C during a run requests an abort; the runner waits for the engine to
//! unwind before shutting the instrument down.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use fluidics_core::Step;
use fluidics_experiment::{
    build_protocol, EngineEvent, ProtocolSettings, RunOutcome, SequenceEngine,
};
use fluidics_hardware::{load_config, load_steps, FluidicsConfig, Instrument};
use tracing::{info, warn};

/// Same upper bound as `simulation.time_scale` in the config.
const MAX_TIME_SCALE: f64 = 100.0;

// =============================================================================
// CLI Argument Structure
// =============================================================================

#[derive(Parser)]
#[command(name = "fluidics-run")]
#[command(about = "Run fluidics step tables on the fluidics instrument", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a step table
    Run {
        #[command(flatten)]
        inputs: Inputs,

        /// Scale applied to simulated hardware and incubation times
        #[arg(long)]
        time_scale: Option<f64>,

        /// Empty the syringe to waste when the run ends
        #[arg(long)]
        drain: bool,

        /// Open the configured temperature controller instead of simulating it
        #[arg(long)]
        hardware: bool,
    },

    /// Estimate and validate a step table without running it
    Check {
        #[command(flatten)]
        inputs: Inputs,
    },
}

#[derive(clap::Args)]
struct Inputs {
    /// Instrument configuration (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Step table (CSV)
    #[arg(long)]
    steps: PathBuf,
}

impl Inputs {
    fn load(&self) -> Result<(FluidicsConfig, Vec<Step>)> {
        let config = load_config(&self.config)?;
        let steps = load_steps(&self.steps)?;
        Ok((config, steps))
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            inputs,
            time_scale,
            drain,
            hardware,
        } => run(&inputs, time_scale, drain, hardware).await,
        Commands::Check { inputs } => check(&inputs).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn build(config: FluidicsConfig, hardware: bool) -> Result<(Instrument, SequenceEngine)> {
    let settings = ProtocolSettings::from_config(&config);
    let incubation_scale = config.simulation.time_scale;
    let instrument = if hardware {
        let thermal = Instrument::open_thermal(&config)
            .await
            .context("Failed to open temperature controller")?;
        if thermal.is_none() {
            warn!("--hardware given but no temperature controller is enabled");
        }
        Instrument::simulated_with_thermal(config, thermal).await
    } else {
        Instrument::simulated(config).await
    }
    .context("Failed to build instrument")?;
    let protocol = build_protocol(&instrument, settings)?;
    let engine = SequenceEngine::new(protocol).with_incubation_scale(incubation_scale);
    Ok((instrument, engine))
}

/// Returns `Ok(false)` when the run did not complete.
async fn run(
    inputs: &Inputs,
    time_scale: Option<f64>,
    drain: bool,
    hardware: bool,
) -> Result<bool> {
    let (mut config, steps) = inputs.load()?;
    if let Some(scale) = time_scale {
        ensure!(
            (0.0..=MAX_TIME_SCALE).contains(&scale),
            "--time-scale must be between 0 and {MAX_TIME_SCALE}, got {scale}"
        );
        config.simulation.time_scale = scale;
    }
    print_header(&inputs.steps, &config, &steps);

    let (instrument, engine) = build(config, hardware).await?;
    let mut handle = engine.start(steps)?;

    let abort = handle.abort_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting run");
            abort.abort().await;
        }
    });

    while let Some(event) = handle.next_event().await {
        print_event(&event);
    }
    let outcome = handle.join().await?;
    ctrl_c.abort();

    instrument
        .shutdown(drain)
        .await
        .context("Failed to shut down instrument")?;
    info!(?outcome, "Run ended");
    Ok(outcome == RunOutcome::Completed)
}

/// Returns `Ok(false)` when any enabled step is rejected.
async fn check(inputs: &Inputs) -> Result<bool> {
    let (config, steps) = inputs.load()?;
    print_header(&inputs.steps, &config, &steps);

    let (instrument, engine) = build(config, false).await?;
    let estimate = engine.estimate(&steps);
    println!(
        "Estimated {:.0} s over {} iterations",
        estimate.total_seconds, estimate.total_iterations
    );

    let mut valid = true;
    for (index, step) in steps.iter().enumerate().filter(|(_, s)| s.enabled) {
        if let Err(e) = engine.protocol().validate_step(step) {
            println!("  step {} ({}): {e}", index + 1, step.name);
            valid = false;
        }
    }
    if valid {
        println!("All enabled steps are valid");
    }
    instrument.shutdown(false).await?;
    Ok(valid)
}

// =============================================================================
// Output
// =============================================================================

fn print_header(path: &Path, config: &FluidicsConfig, steps: &[Step]) {
    println!("Application: {}", config.application);
    println!("Step table:  {}", path.display());
    for (index, step) in steps.iter().enumerate() {
        let marker = if step.enabled { ' ' } else { '-' };
        println!(
            " {marker}{:>3}  {:<40} port {:>2}  {:>7.1} uL @ {:>7.1} uL/min  x{}",
            index + 1,
            step.name,
            step.port,
            step.volume_ul,
            step.flow_rate_ul_per_min,
            step.repeat_count
        );
    }
    println!();
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Error { .. } => eprintln!("{event}"),
        _ => println!("{event}"),
    }
}
