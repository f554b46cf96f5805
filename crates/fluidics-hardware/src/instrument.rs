//! Instrument assembly.
//!
//! An [`Instrument`] bundles the hardware roles one application needs, built
//! from a [`FluidicsConfig`]:
//!
//! | role        | MERFISH | Open Chamber                      |
//! |-------------|---------|-----------------------------------|
//! | router      | yes     | yes                               |
//! | pump        | yes     | yes                               |
//! | air pump    | no      | yes                               |
//! | thermal     | no      | when `use_temperature_controller` |
//!
//! Components are held as capability trait objects so protocols never see
//! whether they run against hardware or simulators.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fluidics_core::capabilities::{AirPump, PortRouter, ThermalController, VolumetricPump};
use fluidics_core::controller::{ControllerCommand, SharedController};
use tracing::{info, warn};

use crate::config::{build_valve_chain, Application, FluidicsConfig, TemperatureControllerConfig};
use crate::drivers::disc_pump::{DiscPump, SimulatedAirPump};
use crate::drivers::selector_valve::{SelectorValveSystem, SimulatedValveSystem};
use crate::drivers::syringe_pump::{
    SimulatedSyringePump, SyringePump, SyringePumpSettings, SyringeTransport,
};
use crate::drivers::temperature::{SimulatedTcm, TemperatureController, ThermalSettings};

pub struct Instrument {
    config: FluidicsConfig,
    router: Arc<dyn PortRouter>,
    pump: Arc<dyn VolumetricPump>,
    air_pump: Option<Arc<dyn AirPump>>,
    thermal: Option<Arc<dyn ThermalController>>,
}

fn pump_settings(config: &FluidicsConfig) -> SyringePumpSettings {
    SyringePumpSettings::new(
        config.syringe_pump.volume_ul,
        config.syringe_pump.speed_code_limit,
        config.syringe_pump.waste_port,
    )
}

/// Thermal timing from the config, with simulated time compressed by `time_scale`.
pub fn thermal_settings(tc: &TemperatureControllerConfig, time_scale: f64) -> ThermalSettings {
    let scale = |d: Duration| d.mul_f64(time_scale).max(Duration::from_millis(1));
    let defaults = ThermalSettings::default();
    ThermalSettings {
        poll_interval: scale(Duration::from_millis(tc.poll_interval_ms)),
        stability_poll: scale(defaults.stability_poll),
        channel_capacity: defaults.channel_capacity,
    }
}

impl Instrument {
    /// Build the instrument entirely from simulators.
    pub async fn simulated(config: FluidicsConfig) -> Result<Self> {
        let thermal: Option<Arc<dyn ThermalController>> =
            match config.enabled_temperature_controller() {
                Some(tc) => Some(Arc::new(
                    TemperatureController::start(
                        SimulatedTcm::default(),
                        thermal_settings(tc, config.simulation.time_scale),
                    )
                    .await?,
                )),
                None => None,
            };
        Self::simulated_with_thermal(config, thermal).await
    }

    /// Simulated valves and pumps around a thermal controller the caller
    /// already started.
    pub async fn simulated_with_thermal(
        config: FluidicsConfig,
        thermal: Option<Arc<dyn ThermalController>>,
    ) -> Result<Self> {
        let time_scale = config.simulation.time_scale;
        let router = SimulatedValveSystem::new(build_valve_chain(&config)?);
        let pump = SimulatedSyringePump::simulated(pump_settings(&config), time_scale).await?;

        let air_pump: Option<Arc<dyn AirPump>> = match config.application {
            Application::OpenChamber => Some(Arc::new(SimulatedAirPump::new(time_scale))),
            Application::Merfish => None,
        };

        info!(application = %config.application, time_scale, "Simulated instrument ready");
        Ok(Self {
            config,
            router: Arc::new(router),
            pump: Arc::new(pump),
            air_pump,
            thermal,
        })
    }

    /// Build the instrument on real transports.
    ///
    /// The thermal controller is opened by the caller, since its transport
    /// lives on a separate serial line.
    pub async fn connect<S>(
        config: FluidicsConfig,
        controller: SharedController,
        syringe: S,
        thermal: Option<Arc<dyn ThermalController>>,
    ) -> Result<Self>
    where
        S: SyringeTransport + 'static,
    {
        controller.begin().await?;
        controller.exchange(ControllerCommand::Clear).await?;

        let router = SelectorValveSystem::initialize(build_valve_chain(&config)?, controller.clone()).await?;
        let pump = SyringePump::initialize(syringe, pump_settings(&config)).await?;
        let air_pump: Option<Arc<dyn AirPump>> = match config.application {
            Application::OpenChamber => Some(Arc::new(DiscPump::initialize(controller).await?)),
            Application::Merfish => None,
        };

        info!(application = %config.application, "Instrument connected");
        Ok(Self {
            config,
            router: Arc::new(router),
            pump: Arc::new(pump),
            air_pump,
            thermal,
        })
    }

    /// Open the temperature controller named in the config on its serial
    /// line and start polling it in real time.
    ///
    /// `None` when the config does not enable a controller.
    #[cfg(feature = "serial")]
    pub async fn open_thermal(
        config: &FluidicsConfig,
    ) -> Result<Option<Arc<dyn ThermalController>>> {
        use anyhow::Context;

        use crate::drivers::temperature::TcmSerial;

        let Some(tc) = config.enabled_temperature_controller() else {
            return Ok(None);
        };
        let serial_number = tc.serial_number.as_deref().context(
            "temperature_controller.serial_number is required to open the controller",
        )?;
        let transport = TcmSerial::open(serial_number, tc.baud_rate).await?;
        let controller = TemperatureController::start(transport, thermal_settings(tc, 1.0)).await?;
        Ok(Some(Arc::new(controller)))
    }

    /// Configuration the instrument was built from.
    pub fn config(&self) -> &FluidicsConfig {
        &self.config
    }

    /// Selector valve chain.
    pub fn router(&self) -> Arc<dyn PortRouter> {
        self.router.clone()
    }

    /// Syringe pump.
    pub fn pump(&self) -> Arc<dyn VolumetricPump> {
        self.pump.clone()
    }

    /// Chamber drain pump; Open Chamber only.
    pub fn air_pump(&self) -> Option<Arc<dyn AirPump>> {
        self.air_pump.clone()
    }

    /// Temperature controller, when enabled in the config.
    pub fn thermal(&self) -> Option<Arc<dyn ThermalController>> {
        self.thermal.clone()
    }

    /// Abort every component that carries an abort flag.
    pub async fn abort_all(&self) {
        self.pump.abort().await;
        if let Some(air_pump) = &self.air_pump {
            air_pump.abort().await;
        }
        if let Some(thermal) = &self.thermal {
            thermal.abort();
        }
    }

    /// Lower every device abort flag.
    pub fn reset_aborts(&self) {
        self.pump.reset_abort();
        if let Some(air_pump) = &self.air_pump {
            air_pump.reset_abort();
        }
        if let Some(thermal) = &self.thermal {
            thermal.reset_abort();
        }
    }

    /// Stop background work and release the hardware.
    pub async fn shutdown(&self, drain_pump: bool) -> Result<()> {
        if let Some(air_pump) = &self.air_pump {
            if air_pump.is_running() {
                if let Err(e) = air_pump.stop().await {
                    warn!(error = %e, "Failed to stop air pump at shutdown");
                }
            }
        }
        if let Some(thermal) = &self.thermal {
            thermal.shutdown().await?;
        }
        self.pump.close(drain_pump).await?;
        info!("Instrument shut down");
        Ok(())
    }
}
