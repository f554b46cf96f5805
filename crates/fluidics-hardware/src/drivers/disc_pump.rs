//! Disc air pump used to aspirate and drain the open chamber.
//!
//! The pump runs open loop: power is set as a fraction of maximum and held
//! until changed. [`DiscPump`] sends power commands through the shared
//! microcontroller session; [`SimulatedAirPump`] only records them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fluidics_core::abort::AbortSignal;
use fluidics_core::capabilities::AirPump;
use fluidics_core::controller::{ControllerCommand, SharedController};
use fluidics_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

fn check_power(power_fraction: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&power_fraction) {
        return Err(DriverError::new(
            "disc_pump",
            DriverErrorKind::InvalidParameter,
            format!("power fraction {power_fraction} outside 0.0..=1.0"),
        )
        .into());
    }
    Ok(())
}

// =============================================================================
// Hardware Pump
// =============================================================================

pub struct DiscPump {
    controller: SharedController,
    running: AtomicBool,
    abort: AbortSignal,
}

impl DiscPump {
    pub async fn initialize(controller: SharedController) -> Result<Self> {
        controller
            .exchange(ControllerCommand::InitializeDiscPump)
            .await?;
        info!("Disc pump initialized");
        Ok(Self {
            controller,
            running: AtomicBool::new(false),
            abort: AbortSignal::new(),
        })
    }

    async fn set_power(&self, fraction: f64) -> Result<()> {
        self.controller
            .exchange(ControllerCommand::SetAirPumpPower { fraction })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AirPump for DiscPump {
    async fn start(&self, power_fraction: f64) -> Result<()> {
        check_power(power_fraction)?;
        if self.abort.is_raised() {
            return Ok(());
        }
        self.set_power(power_fraction).await?;
        self.running.store(true, Ordering::SeqCst);
        debug!(power_fraction, "Disc pump started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_power(0.0).await?;
        self.running.store(false, Ordering::SeqCst);
        debug!("Disc pump stopped");
        Ok(())
    }

    async fn aspirate(&self, duration: Duration) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        self.start(1.0).await?;
        self.abort.wait(duration).await;
        self.stop().await
    }

    async fn abort(&self) {
        if self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Failed to stop disc pump during abort");
            }
        }
        self.abort.raise();
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    fn reset_abort(&self) {
        self.abort.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Simulated Pump
// =============================================================================

/// Air pump without hardware. Aspiration waits are scaled by `time_scale`.
pub struct SimulatedAirPump {
    time_scale: f64,
    running: AtomicBool,
    abort: AbortSignal,
    power_history: Arc<Mutex<Vec<f64>>>,
}

impl SimulatedAirPump {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale,
            running: AtomicBool::new(false),
            abort: AbortSignal::new(),
            power_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every power level commanded so far, including stops as `0.0`.
    pub fn power_history(&self) -> Vec<f64> {
        self.power_history.lock().clone()
    }

    fn set_power(&self, fraction: f64) {
        self.power_history.lock().push(fraction);
        self.running.store(fraction > 0.0, Ordering::SeqCst);
    }
}

#[async_trait]
impl AirPump for SimulatedAirPump {
    async fn start(&self, power_fraction: f64) -> Result<()> {
        check_power(power_fraction)?;
        if self.abort.is_raised() {
            return Ok(());
        }
        self.set_power(power_fraction);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.set_power(0.0);
        Ok(())
    }

    async fn aspirate(&self, duration: Duration) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        self.set_power(1.0);
        self.abort.wait(duration.mul_f64(self.time_scale)).await;
        self.set_power(0.0);
        Ok(())
    }

    async fn abort(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.set_power(0.0);
        }
        self.abort.raise();
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    fn reset_abort(&self) {
        self.abort.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
