//! Liquid-handling protocols.
//!
//! A protocol maps step names onto algorithms built from the four hardware
//! roles. Two families exist:
//!
//! | application  | step names                                                  |
//! |--------------|-------------------------------------------------------------|
//! | MERFISH      | `Flow …`, `Priming`, `Clean Up`                             |
//! | Open Chamber | `Add Reagent…`, `Clear Tubings and Add Reagent…`,           |
//! |              | `Wash with Constant Flow`, `Priming`, `Clean Up`,           |
//! |              | `Set Temperature <°C>`                                      |
//!
//! # Abort handling
//!
//! Algorithms check the pump's abort flag after every blocking `execute` and
//! return `Ok(())` early. The sequence engine owns the user-visible abort
//! report; a protocol never turns an abort into an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fluidics_core::capabilities::{PortRouter, VolumetricPump};
use fluidics_core::{FluidicsError, FluidicsResult, Step};
use fluidics_hardware::{Application, FluidicsConfig, Instrument};
use tracing::debug;

/// Slack for plunger positions that round-trip through a fraction.
const VOLUME_EPSILON_UL: f64 = 1e-6;

pub mod merfish;
pub mod open_chamber;

pub use merfish::MerfishProtocol;
pub use open_chamber::{ChamberLayout, OpenChamberProtocol};

/// Step execution for one application.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Application name, for logs.
    fn name(&self) -> &'static str;

    /// Router used for dead-volume lookups in run estimates.
    fn port_router(&self) -> Arc<dyn PortRouter>;

    /// Reject a step this protocol cannot run, without touching hardware.
    fn validate_step(&self, step: &Step) -> FluidicsResult<()>;

    /// Run one iteration of `step`.
    async fn process_step(&self, step: &Step) -> FluidicsResult<()>;

    /// Abort every component the protocol drives.
    async fn abort(&self);

    /// Lower every component's abort flag.
    fn reset_abort(&self);
}

// =============================================================================
// Settings
// =============================================================================

/// Timing and safety constants shared by the protocols.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    /// Largest barrel fraction a chain may fill before the pump is emptied.
    pub max_fill_fraction: f64,
    /// Air-pump pulse between open-chamber stages.
    pub aspirate: Duration,
    /// Air-pump pulse after an open-chamber clean-up.
    pub clean_up_aspirate: Duration,
    /// Pause after a constant-flow wash.
    pub settle: Duration,
    /// Air-pump power while draining during a constant-flow wash.
    pub drain_power: f64,
    /// Extraction flow rate while priming lines that may hold air.
    pub priming_flow_rate_ul_per_min: f64,
    /// Allowed deviation of both channels from a temperature target.
    pub temperature_tolerance: f64,
    /// Deadline for `Set Temperature` steps.
    pub stabilize_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_fill_fraction: 0.95,
            aspirate: Duration::from_secs(10),
            clean_up_aspirate: Duration::from_secs(20),
            settle: Duration::from_secs(1),
            drain_power: 0.3,
            priming_flow_rate_ul_per_min: 8000.0,
            temperature_tolerance: 1.0,
            stabilize_timeout: Duration::from_secs(300),
        }
    }
}

impl ProtocolSettings {
    /// Defaults, with the temperature deadline taken from the config.
    pub fn from_config(config: &FluidicsConfig) -> Self {
        let mut settings = Self::default();
        if let Some(tc) = config.enabled_temperature_controller() {
            settings.stabilize_timeout = Duration::from_secs_f64(tc.stabilize_timeout_s);
        }
        settings
    }
}

/// Build the protocol matching the instrument's application.
pub fn build_protocol(
    instrument: &Instrument,
    settings: ProtocolSettings,
) -> FluidicsResult<Arc<dyn Protocol>> {
    let config = instrument.config();
    match config.application {
        Application::Merfish => Ok(Arc::new(MerfishProtocol::new(
            instrument.router(),
            instrument.pump(),
            config.syringe_pump.extract_port,
            settings,
        ))),
        Application::OpenChamber => {
            let air_pump = instrument.air_pump().ok_or_else(|| {
                FluidicsError::Config("the Open Chamber application needs an air pump".into())
            })?;
            Ok(Arc::new(OpenChamberProtocol::new(
                instrument.router(),
                instrument.pump(),
                air_pump,
                instrument.thermal(),
                ChamberLayout::from_config(config),
                settings,
            )))
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Empty the pump to waste if adding `volume_ul` would overfill it.
///
/// The check counts the barrel contents plus the pending chain, so it runs
/// before the extract it protects is queued.
pub(crate) async fn empty_on_full(
    pump: &dyn VolumetricPump,
    volume_ul: f64,
    max_fill_fraction: f64,
) -> Result<()> {
    let projected = pump.current_volume_ul() + pump.chained_volume_ul() + volume_ul;
    let limit = max_fill_fraction * pump.capacity_ul();
    if projected > limit + VOLUME_EPSILON_UL {
        debug!(projected, limit, "Emptying syringe pump before extract");
        async {
            pump.dispense_to_waste(None)?;
            pump.execute(false).await
        }
        .await
        .context("Failed to empty syringe pump")?;
    }
    Ok(())
}

/// Port checks common to both protocols.
pub(crate) fn validate_ports(router: &dyn PortRouter, step: &Step) -> FluidicsResult<()> {
    step.validate_shape()?;
    let total = router.addressable_ports();
    if step.port > total {
        return Err(FluidicsError::Validation(format!(
            "'{}': port {} is outside the {total} ports of the valve chain",
            step.name, step.port
        )));
    }
    if let Some(fill) = step.fill_tubing_with {
        if fill > total || !router.is_terminal_port(fill) {
            return Err(FluidicsError::Validation(format!(
                "'{}': tubing fill port {fill} is not on the common valve",
                step.name
            )));
        }
    }
    if let Some(ports) = &step.use_ports {
        if let Some(port) = ports.iter().find(|p| **p == 0 || **p > total) {
            return Err(FluidicsError::Validation(format!(
                "'{}': use_ports entry {port} is outside the valve chain",
                step.name
            )));
        }
    }
    Ok(())
}

fn unknown_step(step: &Step) -> FluidicsError {
    FluidicsError::Validation(format!("Unknown step name: {}", step.name))
}
