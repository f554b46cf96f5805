//! Schema for the instrument configuration file.
//!
//! # Schema Structure
//!
//! ```toml
//! application = "Open Chamber"        # or "MERFISH"
//! chamber_volume_ul = 1000
//! tubing_fluid_amount_sv_to_sp_ul = 200
//! tubing_fluid_amount_sp_to_oc_ul = 150
//!
//! [microcontroller]                   # valve + disc pump controller
//! [syringe_pump]                      # barrel size, speed floor, port roles
//! [selector_valves]                   # chain layout and dead volumes
//! [temperature_controller]            # optional, open chamber only
//! [simulation]                        # simulated hardware timing
//! ```
//!
//! Per-valve maps are keyed by valve id (`"1"`), per-port maps by `port_N`.

use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::collections::HashMap;

// =============================================================================
// Top-Level Config
// =============================================================================

/// Which protocol family the instrument runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Application {
    #[serde(rename = "MERFISH")]
    Merfish,
    #[serde(rename = "Open Chamber")]
    OpenChamber,
}

impl std::fmt::Display for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Application::Merfish => f.write_str("MERFISH"),
            Application::OpenChamber => f.write_str("Open Chamber"),
        }
    }
}

/// Complete instrument configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FluidicsConfig {
    pub application: Application,

    #[serde(default)]
    pub microcontroller: MicrocontrollerConfig,

    #[validate]
    pub syringe_pump: SyringePumpConfig,

    #[validate]
    pub selector_valves: SelectorValvesConfig,

    /// Working volume of the open chamber, in µL.
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub chamber_volume_ul: f64,

    /// Tubing volume from the selector valve to the syringe pump, in µL.
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub tubing_fluid_amount_sv_to_sp_ul: f64,

    /// Tubing volume from the syringe pump to the open chamber, in µL.
    #[serde(default)]
    #[validate(minimum = 0.0)]
    pub tubing_fluid_amount_sp_to_oc_ul: f64,

    #[serde(default)]
    #[validate]
    pub temperature_controller: Option<TemperatureControllerConfig>,

    #[serde(default)]
    #[validate]
    pub simulation: SimulationConfig,
}

// =============================================================================
// Microcontroller
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MicrocontrollerConfig {
    /// USB serial number of the controller board.
    #[serde(default)]
    pub serial_number: Option<String>,
}

// =============================================================================
// Syringe Pump
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SyringePumpConfig {
    /// Barrel capacity in µL.
    #[validate(exclusive_minimum = 0.0)]
    pub volume_ul: f64,

    /// Fastest speed code the pump may use (0 fastest, 40 slowest).
    #[validate(maximum = 40)]
    pub speed_code_limit: u8,

    /// Syringe port connected to the selector valves.
    #[validate(minimum = 1)]
    pub extract_port: u8,

    /// Syringe port connected to the flow cell or chamber.
    #[validate(minimum = 1)]
    pub dispense_port: u8,

    /// Syringe port connected to waste.
    #[validate(minimum = 1)]
    pub waste_port: u8,

    /// Syringe ports present on the installed valve head.
    #[serde(default)]
    pub ports_allowed: Vec<u8>,

    #[serde(default)]
    pub serial_number: Option<String>,
}

// =============================================================================
// Selector Valves
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SelectorValvesConfig {
    /// Valve ids in chain order; the last one is the common valve.
    #[validate(min_items = 1)]
    pub valve_ids_allowed: Vec<u8>,

    /// Port count per valve id.
    pub number_of_ports: HashMap<String, u32>,

    /// Tubing volume from each valve to the syringe pump, in µL.
    pub tubing_fluid_amount_to_valve_ul: HashMap<String, f64>,

    /// Tubing volume from each reagent reservoir to its port, in µL.
    #[serde(default)]
    pub tubing_fluid_amount_to_port_ul: HashMap<String, f64>,

    /// Reagent names by logical port.
    #[serde(default)]
    pub reagent_name_mapping: HashMap<String, String>,
}

// =============================================================================
// Temperature Controller
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TemperatureControllerConfig {
    #[serde(default)]
    pub use_temperature_controller: bool,

    /// USB serial number of the controller's serial adapter.
    #[serde(default)]
    pub serial_number: Option<String>,

    #[serde(default = "default_tcm_baud_rate")]
    #[validate(minimum = 300)]
    #[validate(maximum = 921600)]
    pub baud_rate: u32,

    /// Interval between background temperature samples.
    #[serde(default = "default_tcm_poll_interval_ms")]
    #[validate(minimum = 10)]
    #[validate(maximum = 60000)]
    pub poll_interval_ms: u64,

    /// Default deadline for `Set Temperature` steps.
    #[serde(default = "default_stabilize_timeout_s")]
    #[validate(exclusive_minimum = 0.0)]
    #[validate(maximum = 86400.0)]
    pub stabilize_timeout_s: f64,
}

fn default_tcm_baud_rate() -> u32 {
    57600
}

fn default_tcm_poll_interval_ms() -> u64 {
    1000
}

fn default_stabilize_timeout_s() -> f64 {
    300.0
}

impl Default for TemperatureControllerConfig {
    fn default() -> Self {
        Self {
            use_temperature_controller: false,
            serial_number: None,
            baud_rate: default_tcm_baud_rate(),
            poll_interval_ms: default_tcm_poll_interval_ms(),
            stabilize_timeout_s: default_stabilize_timeout_s(),
        }
    }
}

// =============================================================================
// Simulation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Multiplier applied to simulated plunger and aspiration times.
    #[serde(default = "default_time_scale")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 100.0)]
    pub time_scale: f64,
}

fn default_time_scale() -> f64 {
    1.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_scale: default_time_scale(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Key used for a logical port in per-port maps.
pub fn port_key(port: u32) -> String {
    format!("port_{port}")
}

/// Parse a `port_N` key back into `N`.
pub fn parse_port_key(key: &str) -> Option<u32> {
    key.strip_prefix("port_")?.parse().ok()
}

impl FluidicsConfig {
    /// The temperature controller section, if it is present and enabled.
    pub fn enabled_temperature_controller(&self) -> Option<&TemperatureControllerConfig> {
        self.temperature_controller
            .as_ref()
            .filter(|tc| tc.use_temperature_controller)
    }
}
