//! Core building blocks for the fluidics engine.
//!
//! This crate holds everything the hardware drivers and the experiment layer
//! agree on without depending on each other:
//!
//! - [`capabilities`]: the four hardware roles (`PortRouter`, `VolumetricPump`,
//!   `AirPump`, `ThermalController`) as async traits
//! - [`controller`]: the microcontroller command transport shared by the valves
//!   and the disc pump
//! - [`serial`]: shared line-oriented serial ports
//! - [`abort`]: the cooperative abort signal observed by every blocking wait
//! - [`calibration`]: the syringe speed-code table and flow-rate mapping
//! - [`step`]: one row of a step table
//! - [`error`]: domain and driver error types

pub mod abort;
pub mod calibration;
pub mod capabilities;
pub mod controller;
pub mod error;
pub mod serial;
pub mod step;

pub use abort::AbortSignal;
pub use error::{FluidicsError, FluidicsResult, RoutingError};
pub use step::Step;
