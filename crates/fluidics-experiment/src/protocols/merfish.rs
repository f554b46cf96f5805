//! MERFISH flow-cell protocol.
//!
//! Reagents are drawn through the flow cell by the syringe pump; everything
//! the pump extracts has passed over the sample, so the protocol only ever
//! extracts and empties to waste.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fluidics_core::capabilities::{PortRouter, VolumetricPump};
use fluidics_core::{FluidicsError, FluidicsResult, Step};
use tracing::info;

use super::{empty_on_full, unknown_step, validate_ports, Protocol, ProtocolSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MerfishOperation {
    FlowReagent,
    PrimingOrCleanUp,
}

impl MerfishOperation {
    fn parse(name: &str) -> Option<Self> {
        if name.starts_with("Flow ") {
            Some(Self::FlowReagent)
        } else if name == "Priming" || name == "Clean Up" {
            Some(Self::PrimingOrCleanUp)
        } else {
            None
        }
    }
}

pub struct MerfishProtocol {
    router: Arc<dyn PortRouter>,
    pump: Arc<dyn VolumetricPump>,
    extract_port: u8,
    settings: ProtocolSettings,
}

impl MerfishProtocol {
    pub fn new(
        router: Arc<dyn PortRouter>,
        pump: Arc<dyn VolumetricPump>,
        extract_port: u8,
        settings: ProtocolSettings,
    ) -> Self {
        Self {
            router,
            pump,
            extract_port,
            settings,
        }
    }

    async fn guard(&self, volume_ul: f64) -> Result<()> {
        empty_on_full(self.pump.as_ref(), volume_ul, self.settings.max_fill_fraction).await
    }

    /// Draw `volume_ul` from `port` over the sample, then optionally fill the
    /// tubing up to the common valve with the reagent on `fill_tubing_with`.
    pub async fn flow_reagent(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        fill_tubing_with: Option<u32>,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let pump = self.pump.as_ref();
        let result: Result<()> = async {
            pump.reset_chain();
            self.guard(volume_ul).await?;
            self.router.open(port).await?;
            pump.extract(self.extract_port, volume_ul, speed_code)?;
            pump.execute(false).await?;
            if pump.is_aborted() {
                return Ok(());
            }

            if let Some(fill) = fill_tubing_with {
                self.router.open(fill).await?;
                let fill_volume = self.router.dead_volume_to_valve(fill);
                self.guard(fill_volume).await?;
                pump.extract(self.extract_port, fill_volume, speed_code)?;
                pump.execute(false).await?;
            }
            Ok(())
        }
        .await;
        result.map_err(|e| {
            FluidicsError::operation(format!("Error in flow_reagent from port: {port}"), &e)
        })
    }

    /// Purge every reagent line with its own reagent, then fill the shared
    /// tubing with `volume_ul` from `port`.
    ///
    /// Priming uses a wash buffer on `port`; clean-up puts water on every port.
    pub async fn priming_or_clean_up(
        &self,
        port: u32,
        flow_rate_ul_per_min: f64,
        volume_ul: f64,
        use_ports: Option<&[u32]>,
    ) -> FluidicsResult<()> {
        let speed_code = self.pump.flow_rate_to_speed_code(flow_rate_ul_per_min);
        let pump = self.pump.as_ref();
        let result: Result<()> = async {
            pump.reset_chain();
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
                pump.extract(self.extract_port, line_volume, speed_code)?;
                pump.dispense_to_waste(None)?;
                pump.execute(false).await?;
                if pump.is_aborted() {
                    return Ok(());
                }
            }

            self.router.open(port).await?;
            self.guard(volume_ul).await?;
            pump.extract(self.extract_port, volume_ul, speed_code)?;
            pump.execute(false).await
        }
        .await;
        result.map_err(|e| FluidicsError::operation("Error in priming_or_clean_up", &e))
    }
}

#[async_trait]
impl Protocol for MerfishProtocol {
    fn name(&self) -> &'static str {
        "MERFISH"
    }

    fn port_router(&self) -> Arc<dyn PortRouter> {
        self.router.clone()
    }

    fn validate_step(&self, step: &Step) -> FluidicsResult<()> {
        validate_ports(self.router.as_ref(), step)?;
        MerfishOperation::parse(&step.name)
            .map(|_| ())
            .ok_or_else(|| unknown_step(step))
    }

    async fn process_step(&self, step: &Step) -> FluidicsResult<()> {
        let operation = MerfishOperation::parse(&step.name).ok_or_else(|| unknown_step(step))?;
        info!(step = %step.name, port = step.port, volume_ul = step.volume_ul, "MERFISH step");
        match operation {
            MerfishOperation::FlowReagent => {
                self.flow_reagent(
                    step.port,
                    step.flow_rate_ul_per_min,
                    step.volume_ul,
                    step.fill_tubing_with,
                )
                .await
            }
            MerfishOperation::PrimingOrCleanUp => {
                self.priming_or_clean_up(
                    step.port,
                    step.flow_rate_ul_per_min,
                    step.volume_ul,
                    step.use_ports.as_deref(),
                )
                .await
            }
        }
    }

    async fn abort(&self) {
        self.pump.abort().await;
    }

    fn reset_abort(&self) {
        self.pump.reset_abort();
    }
}
