//! Hardware capability traits.
//!
//! Protocols never see concrete drivers. They are written against four roles:
//!
//! - [`PortRouter`]: selects a logical reagent port through chained valves
//! - [`VolumetricPump`]: meters volumes with a chained-command syringe pump
//! - [`AirPump`]: open-loop aspiration and drain pulses
//! - [`ThermalController`]: dual-channel temperature targets and readback
//!
//! Each role has a real driver and a simulated one in `fluidics-hardware`.
//!
//! # Abort semantics
//!
//! Every role except the router carries its own abort flag. While a component
//! is aborted its motion commands are accepted and ignored, so an algorithm in
//! flight unwinds without moving hardware. Flags are lowered only through
//! `reset_abort`, which the sequence engine calls once the aborted run has
//! fully unwound.
//!
//! # Thread safety
//!
//! All traits take `&self` and require `Send + Sync`; drivers use interior
//! mutability. One driver instance owns each physical component.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::calibration;
use crate::error::RoutingError;

// =============================================================================
// PortRouter
// =============================================================================

/// Logical-to-physical port routing across chained selector valves.
#[async_trait]
pub trait PortRouter: Send + Sync {
    /// Route the common line to `logical_port`.
    ///
    /// Ports beyond [`addressable_ports`](Self::addressable_ports) are ignored
    /// and report success without moving any valve.
    async fn open(&self, logical_port: u32) -> Result<(), RoutingError>;

    /// Last successfully routed logical port.
    fn current_port(&self) -> u32;

    /// Number of logical ports reachable through the chain.
    fn addressable_ports(&self) -> u32;

    /// True when `logical_port` sits on the last (common) valve.
    fn is_terminal_port(&self, logical_port: u32) -> bool;

    /// Tubing volume from the valve holding `logical_port` to the pump, in µL.
    fn dead_volume_to_valve(&self, logical_port: u32) -> f64;

    /// Tubing volume from the reagent reservoir to `logical_port`, in µL.
    fn dead_volume_to_port(&self, logical_port: u32) -> f64;

    /// Configured reagent name for `logical_port`, if any.
    fn reagent_name(&self, logical_port: u32) -> Option<String>;

    /// `"Port N: name"` labels for every addressable port.
    fn port_names(&self) -> Vec<String> {
        (1..=self.addressable_ports())
            .map(|port| match self.reagent_name(port) {
                Some(name) => format!("Port {port}: {name}"),
                None => format!("Port {port}"),
            })
            .collect()
    }
}

// =============================================================================
// VolumetricPump
// =============================================================================

/// Syringe pump with a pending command chain.
///
/// `extract`, `dispense` and `dispense_to_waste` only append to the pending
/// chain; nothing moves until [`execute`](Self::execute) sends the whole chain
/// as one transaction. Speed codes below the pump's floor are raised to it.
#[async_trait]
pub trait VolumetricPump: Send + Sync {
    fn capacity_ul(&self) -> f64;

    /// Fastest speed code this pump may use.
    fn speed_code_floor(&self) -> u8;

    /// Discard the pending chain.
    fn reset_chain(&self);

    /// Append: draw `volume_ul` in through syringe port `port`.
    fn extract(&self, port: u8, volume_ul: f64, speed_code: u8) -> Result<()>;

    /// Append: push `volume_ul` out through syringe port `port`.
    fn dispense(&self, port: u8, volume_ul: f64, speed_code: u8) -> Result<()>;

    /// Append: empty the barrel through the waste port. `None` uses the floor.
    fn dispense_to_waste(&self, speed_code: Option<u8>) -> Result<()>;

    /// Send the pending chain and wait for it to finish.
    ///
    /// With `blocking = false` the wait is interruptible by [`abort`](Self::abort).
    async fn execute(&self, blocking: bool) -> Result<()>;

    /// Volume in the barrel as of the last completed execute.
    fn current_volume_ul(&self) -> f64;

    /// Net volume the pending chain will add (negative when it empties).
    fn chained_volume_ul(&self) -> f64;

    /// True while a chain is executing.
    fn is_busy(&self) -> bool;

    fn flow_rate_to_speed_code(&self, target_ul_per_min: f64) -> u8 {
        calibration::flow_rate_to_speed_code(
            self.capacity_ul(),
            self.speed_code_floor(),
            target_ul_per_min,
        )
    }

    /// Flow rate of `speed_code` in µL/min.
    fn flow_rate(&self, speed_code: u8) -> f64 {
        calibration::flow_rate(self.capacity_ul(), speed_code)
    }

    /// Stop the plunger, drop the pending chain and raise the abort flag.
    async fn abort(&self);

    fn is_aborted(&self) -> bool;

    fn reset_abort(&self);

    /// Release the pump, optionally emptying it to waste first.
    async fn close(&self, to_waste: bool) -> Result<()>;
}

// =============================================================================
// AirPump
// =============================================================================

/// Chamber drain pump.
#[async_trait]
pub trait AirPump: Send + Sync {
    /// Run at `power_fraction` of maximum (0.0..=1.0) until stopped.
    async fn start(&self, power_fraction: f64) -> Result<()>;

    /// Stop the pump; a no-op when already stopped.
    async fn stop(&self) -> Result<()>;

    /// Run at full power for `duration`, then stop. Cut short by abort.
    async fn aspirate(&self, duration: Duration) -> Result<()>;

    /// Stop if running and raise the abort flag.
    async fn abort(&self);

    fn is_aborted(&self) -> bool;

    fn reset_abort(&self);

    fn is_running(&self) -> bool;
}

// =============================================================================
// ThermalController
// =============================================================================

/// Temperature controller channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThermalChannel {
    Tc1,
    Tc2,
}

impl ThermalChannel {
    /// Both channels, in controller order.
    pub const ALL: [ThermalChannel; 2] = [ThermalChannel::Tc1, ThermalChannel::Tc2];

    /// Channel prefix used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ThermalChannel::Tc1 => "TC1",
            ThermalChannel::Tc2 => "TC2",
        }
    }

    /// Zero-based slot for per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            ThermalChannel::Tc1 => 0,
            ThermalChannel::Tc2 => 1,
        }
    }
}

impl std::fmt::Display for ThermalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actual temperatures of both channels in °C.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TemperatureReading {
    /// Channel 1, °C
    pub tc1: f64,
    /// Channel 2, °C
    pub tc2: f64,
}

impl TemperatureReading {
    /// True when both channels are within `tolerance` of `target`.
    pub fn within(&self, target: f64, tolerance: f64) -> bool {
        (self.tc1 - target).abs() <= tolerance && (self.tc2 - target).abs() <= tolerance
    }
}

/// How a temperature hold ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StabilityOutcome {
    Stable,
    TimedOut(TemperatureReading),
    Aborted,
}

/// Dual-channel temperature controller with cached readings.
#[async_trait]
pub trait ThermalController: Send + Sync {
    /// Write a new target; rejects non-finite values.
    async fn set_target_temperature(&self, channel: ThermalChannel, value: f64) -> Result<()>;

    /// Persist the current target of `channel` in controller memory.
    async fn save_target_temperature(&self, channel: ThermalChannel) -> Result<()>;

    /// Last target written or read back at start.
    fn target_temperature(&self, channel: ThermalChannel) -> f64;

    /// Most recent reading from the background poller.
    fn actual_temperatures(&self) -> TemperatureReading;

    /// Hand out the stream of poller readings. Only the first caller gets it.
    fn take_readings(&self) -> Option<mpsc::Receiver<TemperatureReading>>;

    /// Wait until both channels are within `tolerance` of `target`.
    async fn wait_until_stable(
        &self,
        target: f64,
        tolerance: f64,
        timeout: Duration,
    ) -> StabilityOutcome;

    fn abort(&self);

    fn is_aborted(&self) -> bool;

    fn reset_abort(&self);

    /// Stop and join the background poller.
    async fn shutdown(&self) -> Result<()>;
}
