//! Error types for the fluidics engine.
//!
//! Two layers are used, mirroring how the rest of the workspace reports failures:
//!
//! - **Driver layer**: hardware drivers and capability traits return
//!   `anyhow::Result`. When a driver needs a typed failure it raises a
//!   [`DriverError`] tagged with a [`DriverErrorKind`].
//! - **Domain layer**: protocols and the sequence engine speak [`FluidicsError`],
//!   whose variants are the categories users actually see: a bad step row, a
//!   failed operation, a user abort, a temperature timeout or a routing fault.
//!
//! The engine turns any `FluidicsError` into the message carried by its error
//! event, so `Display` output here is user-facing text.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Category of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Communication,
    Hardware,
    Timeout,
    InvalidParameter,
    Shutdown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Shutdown => "shutdown",
        };
        write!(f, "{}", label)
    }
}

/// Typed failure raised by a hardware driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Short driver name, e.g. `syringe`
    pub driver_type: String,
    /// Failure category
    pub kind: DriverErrorKind,
    /// Detail for the operator
    pub message: String,
}

impl DriverError {
    /// Build an error for `driver_type`.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Routing Errors
// =============================================================================

/// A selector valve refused or failed a move while routing to a logical port.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// The controller reported a failure for one valve move.
    #[error("Valve {valve_id} failed to move to port {port}: {message}")]
    Valve {
        valve_id: u8,
        port: u32,
        message: String,
    },
}

// =============================================================================
// Domain Errors
// =============================================================================

/// Convenience alias for results using the domain error type.
pub type FluidicsResult<T> = std::result::Result<T, FluidicsError>;

/// Errors surfaced by protocols and the sequence engine.
#[derive(Error, Debug)]
pub enum FluidicsError {
    /// A step row is malformed or names something the instrument cannot do.
    ///
    /// Raised before any hardware is touched.
    #[error("Invalid step: {0}")]
    Validation(String),

    /// A hardware operation inside a protocol step failed.
    ///
    /// The message carries the failing algorithm and the underlying cause.
    #[error("{0}")]
    Operation(String),

    /// The user aborted the run.
    #[error("Operation aborted by user")]
    AbortRequested,

    /// A temperature hold did not converge before its deadline.
    #[error(
        "Temperature failed to stabilize within {timeout_s} seconds \
         (target {target:.1}, TC1 {tc1:.1}, TC2 {tc2:.1})"
    )]
    Timeout {
        timeout_s: f64,
        target: f64,
        tc1: f64,
        tc2: f64,
    },

    /// A selector valve move failed.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O failure (step tables, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FluidicsError {
    /// Wrap a driver-level failure with the name of the operation that hit it.
    ///
    /// The full `anyhow` context chain is flattened into the message so the
    /// user sees both the operation and the root cause.
    pub fn operation(context: impl std::fmt::Display, source: &anyhow::Error) -> Self {
        FluidicsError::Operation(format!("{context}: {source:#}"))
    }

    /// True when this error represents a user abort rather than a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, FluidicsError::AbortRequested)
    }
}
