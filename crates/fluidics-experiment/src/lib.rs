//! Protocols and sequencing for the fluidics instrument.
//!
//! A [`Protocol`] turns one [`Step`](fluidics_core::Step) into valve moves and
//! pump chains. The [`SequenceEngine`] walks a step table through a protocol
//! on its own task, reporting progress over a channel and honoring aborts.

pub mod protocols;
pub mod sequence_engine;

pub use protocols::{
    build_protocol, ChamberLayout, MerfishProtocol, OpenChamberProtocol, Protocol,
    ProtocolSettings,
};
pub use sequence_engine::{
    estimate_steps, AbortHandle, EngineEvent, EngineState, Estimate, RunHandle, RunOutcome,
    SequenceEngine, StepStatus,
};
