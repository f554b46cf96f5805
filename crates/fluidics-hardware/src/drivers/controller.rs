//! Simulated microcontroller.
//!
//! Stands in for the valve and disc pump controller when no hardware is
//! attached. Every command is recorded in a [`ControllerLog`] that tests and
//! the simulated instrument can inspect.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fluidics_core::controller::{ControllerCommand, DeviceController};
use parking_lot::Mutex;
use tracing::debug;

/// Shared record of what a [`SimulatedController`] was asked to do.
#[derive(Clone, Default)]
pub struct ControllerLog {
    commands: Arc<Mutex<Vec<ControllerCommand>>>,
    completions: Arc<AtomicUsize>,
    started: Arc<AtomicBool>,
    fail_next: Arc<Mutex<Option<String>>>,
}

impl ControllerLog {
    pub fn commands(&self) -> Vec<ControllerCommand> {
        self.commands.lock().clone()
    }

    /// Number of completion waits performed.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
        self.completions.store(0, Ordering::SeqCst);
    }

    /// Make the next command fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }
}

/// Controller that records commands instead of sending them.
#[derive(Default)]
pub struct SimulatedController {
    log: ControllerLog,
    latency: Duration,
}

impl SimulatedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay each completion wait by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn log(&self) -> ControllerLog {
        self.log.clone()
    }
}

#[async_trait]
impl DeviceController for SimulatedController {
    async fn begin(&mut self) -> Result<()> {
        self.log.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_command(&mut self, command: &ControllerCommand) -> Result<String> {
        if let Some(message) = self.log.fail_next.lock().take() {
            return Err(anyhow!(message));
        }
        debug!(%command, "simulated controller");
        self.log.commands.lock().push(command.clone());
        Ok(String::new())
    }

    async fn wait_for_completion(&mut self) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.log.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidics_core::controller::SharedController;

    #[tokio::test]
    async fn test_records_commands_and_failures() {
        let controller = SimulatedController::new();
        let log = controller.log();
        let shared = SharedController::new(controller);

        shared.begin().await.unwrap();
        assert!(log.is_started());

        shared.exchange(ControllerCommand::Clear).await.unwrap();
        log.fail_next("bus error");
        let err = shared
            .exchange(ControllerCommand::InitializeDiscPump)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bus error");
        shared.exchange(ControllerCommand::InitializeDiscPump).await.unwrap();

        assert_eq!(
            log.commands(),
            vec![ControllerCommand::Clear, ControllerCommand::InitializeDiscPump]
        );
        assert_eq!(log.completions(), 2);
    }
}
