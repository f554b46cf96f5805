//! Instrument configuration.
//!
//! The configuration system consists of three layers:
//!
//! 1. **Schema** - serde types for every recognized key, with field-level
//!    `serde_valid` rules
//! 2. **Validation** - rules spanning sections, and the valve chain derived
//!    from `[selector_valves]`
//! 3. **Loader** - figment loading from TOML plus environment overrides
//!
//! # Example Configuration
//!
//! ```toml
//! application = "MERFISH"
//!
//! [syringe_pump]
//! volume_ul = 5000
//! speed_code_limit = 10
//! extract_port = 1
//! dispense_port = 2
//! waste_port = 3
//!
//! [selector_valves]
//! valve_ids_allowed = [0, 1]
//!
//! [selector_valves.number_of_ports]
//! "0" = 10
//! "1" = 10
//!
//! [selector_valves.tubing_fluid_amount_to_valve_ul]
//! "0" = 500
//! "1" = 350
//! ```

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_config_from_str, ConfigLoadError};
pub use schema::{
    Application, FluidicsConfig, MicrocontrollerConfig, SelectorValvesConfig, SimulationConfig,
    SyringePumpConfig, TemperatureControllerConfig,
};
pub use validation::{build_valve_chain, validate_fluidics_config};
