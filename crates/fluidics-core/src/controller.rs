//! Microcontroller command transport.
//!
//! The selector valves and the disc pump hang off one microcontroller. Its
//! byte-level protocol lives outside this workspace; drivers only see the
//! [`DeviceController`] trait and the typed [`ControllerCommand`]s.
//!
//! A [`SharedController`] owns the single session. Every exchange holds the
//! session lock across the command and its completion wait, so two drivers can
//! never interleave commands on the wire.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Commands understood by the microcontroller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// Reset the controller's command state.
    Clear,
    /// Home a rotary selector valve and tell it how many ports it has.
    InitializeRotary { valve_id: u8, port_count: u32 },
    /// Rotate a selector valve to a physical port (1-based).
    SetRotaryValve { valve_id: u8, port: u32 },
    /// Power up the disc pump driver.
    InitializeDiscPump,
    /// Set disc pump power as a fraction of maximum.
    SetAirPumpPower { fraction: f64 },
}

impl std::fmt::Display for ControllerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerCommand::Clear => write!(f, "CLEAR"),
            ControllerCommand::InitializeRotary {
                valve_id,
                port_count,
            } => write!(f, "INITIALIZE_ROTARY({valve_id}, {port_count})"),
            ControllerCommand::SetRotaryValve { valve_id, port } => {
                write!(f, "SET_ROTARY_VALVE({valve_id}, {port})")
            }
            ControllerCommand::InitializeDiscPump => write!(f, "INITIALIZE_DISC_PUMP"),
            ControllerCommand::SetAirPumpPower { fraction } => {
                write!(f, "SET_AIR_PUMP_POWER({fraction:.2})")
            }
        }
    }
}

/// Session with the microcontroller.
///
/// Implementations are owned by a [`SharedController`] and only ever driven
/// by one task at a time, hence `&mut self`.
#[async_trait]
pub trait DeviceController: Send {
    /// Open the session.
    async fn begin(&mut self) -> anyhow::Result<()>;

    /// Send one command and return the controller's raw reply.
    async fn send_command(&mut self, command: &ControllerCommand) -> anyhow::Result<String>;

    /// Block until the last command has finished executing.
    async fn wait_for_completion(&mut self) -> anyhow::Result<()>;
}

/// Cloneable handle to the single controller session.
#[derive(Clone)]
pub struct SharedController {
    session: Arc<Mutex<Box<dyn DeviceController>>>,
}

impl SharedController {
    /// Wrap `controller` for sharing between drivers.
    pub fn new(controller: impl DeviceController + 'static) -> Self {
        Self {
            session: Arc::new(Mutex::new(Box::new(controller))),
        }
    }

    /// Open the session; call once before any exchange.
    pub async fn begin(&self) -> anyhow::Result<()> {
        self.session.lock().await.begin().await
    }

    /// Send `command` and wait for completion under one lock.
    pub async fn exchange(&self, command: ControllerCommand) -> anyhow::Result<String> {
        let mut session = self.session.lock().await;
        debug!(%command, "controller command");
        let reply = session.send_command(&command).await?;
        session.wait_for_completion().await?;
        Ok(reply)
    }
}

impl std::fmt::Debug for SharedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedController").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records the order of sends and completions across clones.
    struct TracingController {
        trace: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DeviceController for TracingController {
        async fn begin(&mut self) -> anyhow::Result<()> {
            self.trace.lock().push("begin".into());
            Ok(())
        }

        async fn send_command(&mut self, command: &ControllerCommand) -> anyhow::Result<String> {
            self.trace.lock().push(format!("send {command}"));
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok("ok".into())
        }

        async fn wait_for_completion(&mut self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.trace.lock().push("done".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exchange_pairs_command_with_completion() {
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let controller = SharedController::new(TracingController {
            trace: trace.clone(),
        });
        controller.begin().await.unwrap();

        let a = controller.clone();
        let b = controller.clone();
        let (ra, rb) = tokio::join!(
            a.exchange(ControllerCommand::SetRotaryValve {
                valve_id: 1,
                port: 3
            }),
            b.exchange(ControllerCommand::SetAirPumpPower { fraction: 0.5 }),
        );
        assert_eq!(ra.unwrap(), "ok");
        assert_eq!(rb.unwrap(), "ok");

        let trace = trace.lock();
        assert_eq!(trace.len(), 5);
        assert_eq!(trace[0], "begin");
        // Each send is immediately followed by its own completion.
        assert!(trace[1].starts_with("send"));
        assert_eq!(trace[2], "done");
        assert!(trace[3].starts_with("send"));
        assert_eq!(trace[4], "done");
    }

    #[test]
    fn test_command_display() {
        assert_eq!(
            ControllerCommand::InitializeRotary {
                valve_id: 2,
                port_count: 10
            }
            .to_string(),
            "INITIALIZE_ROTARY(2, 10)"
        );
        assert_eq!(
            ControllerCommand::SetAirPumpPower { fraction: 0.3 }.to_string(),
            "SET_AIR_PUMP_POWER(0.30)"
        );
    }
}
