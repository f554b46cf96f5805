//! Open-chamber protocol.
//!
//! The syringe pump pushes reagent into an open sample chamber and an air
//! pump aspirates liquid back out. Three tubing segments are tracked:
//!
//! ```text
//! reagent ──▶ selector valve ──(sv_to_sp)──▶ syringe ──(sp_to_oc)──▶ chamber
//! ```
//!
//! Each algorithm starts from an empty syringe. Extracts from the valve run at
//! the pump's speed floor; dispenses into the chamber run at the step's flow
//! rate.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fluidics_core::capabilities::{
    AirPump, PortRouter, StabilityOutcome, ThermalChannel, ThermalController, VolumetricPump,
};
use fluidics_core::{FluidicsError, FluidicsResult, Step};
use fluidics_hardware::FluidicsConfig;
use tracing::{info, warn};

use super::{empty_on_full, unknown_step, validate_ports, Protocol, ProtocolSettings};

#[derive(Debug, Clone, Copy, PartialEq)]
enum OpenChamberOperation {
    AddReagent,
    ClearAndAddReagent,
    WashWithConstantFlow,
    Priming,
    CleanUp,
    SetTemperature(f64),
}

impl OpenChamberOperation {
    fn parse(name: &str) -> FluidicsResult<Option<Self>> {
        let operation = if name.starts_with("Add Reagent") {
            Self::AddReagent
        } else if name.starts_with("Clear Tubings and Add Reagent") {
            Self::ClearAndAddReagent
        } else if name == "Wash with Constant Flow" {
            Self::WashWithConstantFlow
        } else if name == "Priming" {
            Self::Priming
        } else if name == "Clean Up" {
            Self::CleanUp
        } else if let Some(rest) = name.strip_prefix("Set Temperature") {
            let target = rest
                .split_whitespace()
                .last()
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .ok_or_else(|| {
                    FluidicsError::Validation(format!("'{name}': no target temperature in step name"))
                })?;
            Self::SetTemperature(target)
        } else {
            return Ok(None);
        };
        Ok(Some(operation))
    }
}

/// Syringe port roles and tubing volumes of an open-chamber instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ChamberLayout {
    pub extract_port: u8,
    pub dispense_port: u8,
    pub waste_port: u8,
    pub chamber_volume_ul: f64,
    /// Tubing from the selector valve to the syringe pump.
    pub sv_to_sp_ul: f64,
    /// Tubing from the syringe pump to the chamber.
    pub sp_to_oc_ul: f64,
}

impl ChamberLayout {
    pub fn from_config(config: &FluidicsConfig) -> Self {
        Self {
            extract_port: config.syringe_pump.extract_port,
            dispense_port: config.syringe_pump.dispense_port,
            waste_port: config.syringe_pump.waste_port,
            chamber_volume_ul: config.chamber_volume_ul,
            sv_to_sp_ul: config.tubing_fluid_amount_sv_to_sp_ul,
            sp_to_oc_ul: config.tubing_fluid_amount_sp_to_oc_ul,
        }
    }
}

pub struct OpenChamberProtocol {
    router: Arc<dyn PortRouter>,
    pump: Arc<dyn VolumetricPump>,
    air_pump: Arc<dyn AirPump>,
    thermal: Option<Arc<dyn ThermalController>>,
    layout: ChamberLayout,
    settings: ProtocolSettings,
}

impl OpenChamberProtocol {
    pub fn new(
        router: Arc<dyn PortRouter>,
        pump: Arc<dyn VolumetricPump>,
        air_pump: Arc<dyn AirPump>,
        thermal: Option<Arc<dyn ThermalController>>,
        layout: ChamberLayout,
        settings: ProtocolSettings,
    ) -> Self {
        Self {
            router,
            pump,
            air_pump,
            thermal,
            layout,
            settings,
        }
    }

    pub fn layout(&self) -> &ChamberLayout {
        &self.layout
    }

    async fn guard(&self, volume_ul: f64) -> Result<()> {
        empty_on_full(self.pump.as_ref(), volume_ul, self.settings.max_fill_fraction).await
    }

    fn chamber_fill(&self, volume_ul: f64) -> f64 {
        volume_ul.min(self.layout.chamber_volume_ul)
    }

    fn wash_volume(&self, volume_ul: f64) -> f64 {
        volume_ul.min(self.settings.max_fill_fraction * self.pump.capacity_ul())
    }

    /// Empty the syringe to waste. Returns false if the pump was aborted.
    async fn drain_syringe(&self) -> Result<bool> {
        let pump = self.pump.as_ref();
        pump.reset_chain();
        pump.dispense_to_waste(Some(pump.speed_code_floor()))?;
        pump.execute(false).await?;
        Ok(!pump.is_aborted())
    }

    /// Run the pending chain with the air pump draining the chamber.
    async fn execute_while_draining(&self) -> Result<()> {
        self.air_pump.start(self.settings.drain_power).await?;
        let pushed = self.pump.execute(false).await;
        let stopped = self.air_pump.stop().await;
        pushed?;
        stopped
    }

    /// Flush the old reagent out of both tubing segments, then deliver
    /// `volume_ul` from `port` into the chamber.
    pub async fn clear_and_add_reagent(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        fill_tubing_with: Option<u32>,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let volume = self.chamber_fill(volume_ul);
        let ChamberLayout {
            extract_port,
            dispense_port,
            sv_to_sp_ul,
            sp_to_oc_ul,
            ..
        } = self.layout;
        let pump = self.pump.as_ref();
        let floor = pump.speed_code_floor();

        let result: Result<()> = async {
            if !self.drain_syringe().await? {
                return Ok(());
            }

            // Old reagent between valve and syringe goes to waste.
            self.router.open(port).await?;
            self.guard(sv_to_sp_ul).await?;
            pump.extract(extract_port, sv_to_sp_ul, floor)?;
            pump.dispense_to_waste(Some(floor))?;
            pump.extract(extract_port, volume - sv_to_sp_ul, floor)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }

            if let Some(fill) = fill_tubing_with {
                self.router.open(fill).await?;
            }
            self.guard(sv_to_sp_ul).await?;
            pump.extract(extract_port, sv_to_sp_ul, floor)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }
            self.air_pump.aspirate(self.settings.aspirate).await?;

            // Old reagent between syringe and chamber is pushed out and aspirated.
            pump.dispense(dispense_port, sp_to_oc_ul, speed_code)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }
            self.air_pump.aspirate(self.settings.aspirate).await?;

            pump.dispense(dispense_port, volume - sp_to_oc_ul, speed_code)?;
            pump.extract(extract_port, sp_to_oc_ul, floor)?;
            pump.dispense(dispense_port, sp_to_oc_ul, speed_code)?;
            pump.execute(false).await
        }
        .await;
        result.map_err(|e| {
            FluidicsError::operation(format!("Error in clear_and_add_reagent from port: {port}"), &e)
        })
    }

    /// Deliver `volume_ul` from `port`, assuming the tubing already holds the
    /// same reagent.
    ///
    /// With a fill port, the valve-to-syringe segment is refilled from it and
    /// whatever would push the delivery past `volume_ul` goes to waste.
    pub async fn add_reagent(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        fill_tubing_with: Option<u32>,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let volume = self.chamber_fill(volume_ul);
        let ChamberLayout {
            extract_port,
            dispense_port,
            waste_port,
            sv_to_sp_ul,
            sp_to_oc_ul,
            ..
        } = self.layout;
        let pump = self.pump.as_ref();
        let floor = pump.speed_code_floor();

        let result: Result<()> = async {
            if !self.drain_syringe().await? {
                return Ok(());
            }

            let syringe_volume = match fill_tubing_with {
                Some(fill) => {
                    self.router.open(port).await?;
                    let mut syringe_volume = (volume - sp_to_oc_ul - sv_to_sp_ul).max(0.0);
                    self.guard(syringe_volume).await?;
                    pump.extract(extract_port, syringe_volume, floor)?;
                    pump.execute(false).await?;
                    if pump.is_aborted() {
                        return Ok(());
                    }

                    self.router.open(fill).await?;
                    syringe_volume += sv_to_sp_ul;
                    self.guard(sv_to_sp_ul).await?;
                    pump.extract(extract_port, sv_to_sp_ul, floor)?;
                    let overflow = (sp_to_oc_ul + sv_to_sp_ul - volume).max(0.0);
                    syringe_volume -= overflow;
                    if overflow > 0.0 {
                        pump.dispense(waste_port, overflow, speed_code)?;
                        pump.execute(false).await?;
                        if pump.is_aborted() {
                            return Ok(());
                        }
                    }
                    syringe_volume
                }
                None => {
                    self.router.open(port).await?;
                    let syringe_volume = volume - sp_to_oc_ul;
                    self.guard(syringe_volume).await?;
                    pump.extract(extract_port, syringe_volume, floor)?;
                    pump.execute(false).await?;
                    if pump.is_aborted() {
                        return Ok(());
                    }
                    syringe_volume
                }
            };

            pump.dispense(dispense_port, syringe_volume, speed_code)?;
            pump.extract(extract_port, sp_to_oc_ul, floor)?;
            pump.dispense(dispense_port, sp_to_oc_ul, speed_code)?;
            if pump.is_aborted() {
                return Ok(());
            }
            // Previous liquid leaves the chamber before the new reagent arrives.
            self.air_pump.aspirate(self.settings.aspirate).await?;
            pump.execute(false).await
        }
        .await;
        result.map_err(|e| {
            FluidicsError::operation(format!("Error in add_reagent from port: {port}"), &e)
        })
    }

    /// Push `volume_ul` from `port` through the chamber while the air pump
    /// drains it at the same time, keeping the liquid level constant.
    pub async fn wash_with_constant_flow(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        fill_tubing_with: Option<u32>,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let volume = self.wash_volume(volume_ul);
        let ChamberLayout {
            extract_port,
            dispense_port,
            sv_to_sp_ul,
            sp_to_oc_ul,
            ..
        } = self.layout;
        let pump = self.pump.as_ref();
        let floor = pump.speed_code_floor();

        let result: Result<()> = async {
            if !self.drain_syringe().await? {
                return Ok(());
            }

            // The valve-to-syringe segment already holds this reagent.
            self.router.open(port).await?;
            self.guard(volume - sv_to_sp_ul).await?;
            pump.extract(extract_port, volume - sv_to_sp_ul, floor)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }

            if let Some(fill) = fill_tubing_with {
                self.router.open(fill).await?;
            }
            self.guard(sv_to_sp_ul).await?;
            pump.extract(extract_port, sv_to_sp_ul, floor)?;
            pump.dispense(dispense_port, volume, speed_code)?;
            if pump.is_aborted() {
                return Ok(());
            }
            self.execute_while_draining().await?;

            if fill_tubing_with.is_some() {
                // Wash out the syringe-to-chamber segment with the fill reagent.
                pump.extract(extract_port, sp_to_oc_ul, floor)?;
                pump.dispense(dispense_port, sp_to_oc_ul, speed_code)?;
                if pump.is_aborted() {
                    return Ok(());
                }
                self.execute_while_draining().await?;
            }
            tokio::time::sleep(self.settings.settle).await;
            Ok(())
        }
        .await;
        result.map_err(|e| {
            FluidicsError::operation(format!("Error in wash_with_constant_flow from port: {port}"), &e)
        })
    }

    /// Purge every reagent line to waste, then push `volume_ul` from `port`
    /// through the syringe into the chamber.
    ///
    /// Extraction is capped at the priming flow rate because lines holding
    /// air need a slower, steadier flow. Clean-up ends with a long aspirate.
    pub async fn priming_or_clean_up(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        use_ports: Option<&[u32]>,
        clean_up: bool,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let priming_speed = self
            .pump
            .flow_rate_to_speed_code(self.settings.priming_flow_rate_ul_per_min);
        let ChamberLayout {
            extract_port,
            dispense_port,
            ..
        } = self.layout;
        let pump = self.pump.as_ref();

        let result: Result<()> = async {
            pump.reset_chain();
            pump.dispense_to_waste(None)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }

            for line in 1..=self.router.addressable_ports() {
                if use_ports.is_some_and(|ports| !ports.contains(&line)) {
                    continue;
                }
                let line_volume = self.router.dead_volume_to_port(line);
                if line == port || line_volume == 0.0 {
                    continue;
                }
                self.guard(line_volume).await?;
                self.router.open(line).await?;
                pump.extract(extract_port, line_volume, priming_speed)?;
                pump.dispense_to_waste(None)?;
                pump.execute(false).await?;
                if pump.is_aborted() {
                    return Ok(());
                }
            }

            self.router.open(port).await?;
            self.guard(volume_ul).await?;
            pump.extract(extract_port, volume_ul, priming_speed)?;
            pump.dispense(dispense_port, volume_ul, speed_code)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }
            if clean_up {
                self.air_pump.aspirate(self.settings.clean_up_aspirate).await?;
            }
            Ok(())
        }
        .await;
        result.map_err(|e| FluidicsError::operation("Error in priming_or_clean_up", &e))
    }

    /// Set both channels to `target` and wait until they settle within the
    /// configured tolerance.
    pub async fn set_temperature(&self, target: f64) -> FluidicsResult<()> {
        let thermal = self.thermal.as_ref().ok_or_else(|| {
            FluidicsError::Operation("Set Temperature needs a temperature controller".into())
        })?;
        for channel in ThermalChannel::ALL {
            thermal
                .set_target_temperature(channel, target)
                .await
                .map_err(|e| FluidicsError::operation("Error in set_temperature", &e))?;
        }

        let timeout = self.settings.stabilize_timeout;
        match thermal
            .wait_until_stable(target, self.settings.temperature_tolerance, timeout)
            .await
        {
            StabilityOutcome::Stable => Ok(()),
            StabilityOutcome::Aborted => {
                info!(target, "Temperature hold aborted");
                Ok(())
            }
            StabilityOutcome::TimedOut(reading) => Err(FluidicsError::Timeout {
                timeout_s: timeout.as_secs_f64(),
                target,
                tc1: reading.tc1,
                tc2: reading.tc2,
            }),
        }
    }

    fn check_volumes(&self, step: &Step, operation: OpenChamberOperation) -> FluidicsResult<()> {
        let ChamberLayout {
            sv_to_sp_ul,
            sp_to_oc_ul,
            ..
        } = self.layout;
        let (volume, segments): (f64, &[(&str, f64)]) = match operation {
            OpenChamberOperation::AddReagent => (
                self.chamber_fill(step.volume_ul),
                &[("syringe-to-chamber", sp_to_oc_ul)],
            ),
            OpenChamberOperation::ClearAndAddReagent => (
                self.chamber_fill(step.volume_ul),
                &[("valve-to-syringe", sv_to_sp_ul), ("syringe-to-chamber", sp_to_oc_ul)],
            ),
            OpenChamberOperation::WashWithConstantFlow => (
                self.wash_volume(step.volume_ul),
                &[("valve-to-syringe", sv_to_sp_ul)],
            ),
            _ => return Ok(()),
        };
        for (segment, segment_volume) in segments {
            if volume < *segment_volume {
                return Err(FluidicsError::Validation(format!(
                    "'{}': delivered volume {volume} uL is smaller than the {segment_volume} uL {segment} tubing",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Protocol for OpenChamberProtocol {
    fn name(&self) -> &'static str {
        "Open Chamber"
    }

    fn port_router(&self) -> Arc<dyn PortRouter> {
        self.router.clone()
    }

    fn validate_step(&self, step: &Step) -> FluidicsResult<()> {
        validate_ports(self.router.as_ref(), step)?;
        let operation = OpenChamberOperation::parse(&step.name)?.ok_or_else(|| unknown_step(step))?;
        if matches!(operation, OpenChamberOperation::SetTemperature(_)) && self.thermal.is_none() {
            return Err(FluidicsError::Validation(format!(
                "'{}': no temperature controller is configured",
                step.name
            )));
        }
        self.check_volumes(step, operation)
    }

    async fn process_step(&self, step: &Step) -> FluidicsResult<()> {
        let operation = OpenChamberOperation::parse(&step.name)?.ok_or_else(|| unknown_step(step))?;
        info!(step = %step.name, port = step.port, volume_ul = step.volume_ul, "Open chamber step");
        let (port, flow, volume, fill) = (
            step.port,
            step.flow_rate_ul_per_min,
            step.volume_ul,
            step.fill_tubing_with,
        );
        match operation {
            OpenChamberOperation::AddReagent => self.add_reagent(port, flow, volume, fill).await,
            OpenChamberOperation::ClearAndAddReagent => {
                self.clear_and_add_reagent(port, flow, volume, fill).await
            }
            OpenChamberOperation::WashWithConstantFlow => {
                self.wash_with_constant_flow(port, flow, volume, fill).await
            }
            OpenChamberOperation::Priming => {
                self.priming_or_clean_up(port, flow, volume, step.use_ports.as_deref(), false)
                    .await
            }
            OpenChamberOperation::CleanUp => {
                self.priming_or_clean_up(port, flow, volume, step.use_ports.as_deref(), true)
                    .await
            }
            OpenChamberOperation::SetTemperature(target) => self.set_temperature(target).await,
        }
    }

    async fn abort(&self) {
        self.pump.abort().await;
        self.air_pump.abort().await;
        if let Some(thermal) = &self.thermal {
            thermal.abort();
        }
    }

    fn reset_abort(&self) {
        self.pump.reset_abort();
        self.air_pump.reset_abort();
        if let Some(thermal) = &self.thermal {
            thermal.reset_abort();
        }
        if self.air_pump.is_running() {
            warn!("Air pump still running after abort reset");
        }
    }
}
