//! Hardware layer of the fluidics instrument.
//!
//! Drivers implement the capability traits from `fluidics_core::capabilities`.
//! [`Instrument`] assembles them from a [`FluidicsConfig`], either on real
//! transports or entirely from simulators.

pub use fluidics_core::capabilities;
pub mod config;
pub mod drivers;
pub mod instrument;
pub mod steps;

pub use config::{load_config, load_config_from_str, Application, FluidicsConfig};
pub use instrument::Instrument;
pub use steps::{load_steps, read_steps};
