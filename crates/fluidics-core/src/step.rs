//! A single row of a step table.

use serde::{Deserialize, Serialize};

use crate::error::{FluidicsError, FluidicsResult};

/// One protocol action, repeated `repeat_count` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Operation name; protocols dispatch on its prefix.
    pub name: String,
    /// Logical reagent port (1-based).
    pub port: u32,
    /// Flow rate in µL/min; must be positive.
    pub flow_rate_ul_per_min: f64,
    /// Volume to deliver in µL.
    pub volume_ul: f64,
    /// Wait after the step, in minutes; 0 for none.
    pub incubation_time_min: f64,
    /// How many times the step runs.
    pub repeat_count: u32,
    /// Logical port whose reagent fills the tubing after delivery.
    pub fill_tubing_with: Option<u32>,
    /// Disabled steps keep their row index but never run.
    pub enabled: bool,
    /// Restricts priming/clean-up to these ports; `None` means every port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_ports: Option<Vec<u32>>,
}

impl Step {
    /// Enabled single-shot step with no incubation and no tubing fill.
    pub fn new(name: impl Into<String>, port: u32, flow_rate_ul_per_min: f64, volume_ul: f64) -> Self {
        Self {
            name: name.into(),
            port,
            flow_rate_ul_per_min,
            volume_ul,
            incubation_time_min: 0.0,
            repeat_count: 1,
            fill_tubing_with: None,
            enabled: true,
            use_ports: None,
        }
    }

    /// Set the incubation time in minutes.
    pub fn with_incubation(mut self, minutes: f64) -> Self {
        self.incubation_time_min = minutes;
        self
    }

    /// Set the repeat count.
    pub fn with_repeat(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    /// Fill the tubing from `port` after delivery.
    pub fn with_fill_tubing(mut self, port: u32) -> Self {
        self.fill_tubing_with = Some(port);
        self
    }

    /// Restrict priming or clean-up to `ports`.
    pub fn with_use_ports(mut self, ports: Vec<u32>) -> Self {
        self.use_ports = Some(ports);
        self
    }

    /// Mark the step as skipped.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the numeric invariants that hold regardless of instrument.
    pub fn validate_shape(&self) -> FluidicsResult<()> {
        if self.name.trim().is_empty() {
            return Err(FluidicsError::Validation("step name is empty".into()));
        }
        if self.port == 0 {
            return Err(FluidicsError::Validation(format!(
                "'{}': ports are numbered from 1",
                self.name
            )));
        }
        if !self.volume_ul.is_finite() || self.volume_ul < 0.0 {
            return Err(FluidicsError::Validation(format!(
                "'{}': volume must be >= 0 uL, got {}",
                self.name, self.volume_ul
            )));
        }
        if !self.flow_rate_ul_per_min.is_finite() || self.flow_rate_ul_per_min <= 0.0 {
            return Err(FluidicsError::Validation(format!(
                "'{}': flow rate must be > 0 uL/min, got {}",
                self.name, self.flow_rate_ul_per_min
            )));
        }
        if !self.incubation_time_min.is_finite() || self.incubation_time_min < 0.0 {
            return Err(FluidicsError::Validation(format!(
                "'{}': incubation time must be >= 0 min, got {}",
                self.name, self.incubation_time_min
            )));
        }
        Ok(())
    }
}
