//! Drivers for the fluidics instrument, each with a simulated counterpart.

pub mod controller;
pub mod disc_pump;
pub mod selector_valve;
pub mod syringe_pump;
pub mod temperature;

pub use controller::{ControllerLog, SimulatedController};
pub use disc_pump::{DiscPump, SimulatedAirPump};
pub use selector_valve::{SelectorValveSystem, SimulatedValveSystem, ValveChain, ValveMove, ValveSpec};
pub use syringe_pump::{
    SimulatedSyringe, SimulatedSyringePump, SyringeOp, SyringePump, SyringePumpSettings,
    SyringeTransport,
};
pub use temperature::{
    SimulatedTcm, TcmSerial, TemperatureController, TemperatureTransport, ThermalSettings,
};
