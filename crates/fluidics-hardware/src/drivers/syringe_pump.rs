//! Chained-command syringe pump.
//!
//! [`SyringePump`] implements [`VolumetricPump`] on top of a
//! [`SyringeTransport`], the vendor driver that actually moves the plunger.
//! Moves are queued locally and sent as one chain on `execute`, which then
//! waits out the transport's time estimate and polls for completion. Both
//! waits watch the pump's abort signal.
//!
//! [`SimulatedSyringe`] is a transport that models the barrel, so the pump can
//! run without hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fluidics_core::abort::AbortSignal;
use fluidics_core::calibration;
use fluidics_core::capabilities::VolumetricPump;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Transport
// =============================================================================

/// One plunger move in a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum SyringeOp {
    Extract {
        port: u8,
        volume_ul: f64,
        speed_code: u8,
    },
    Dispense {
        port: u8,
        volume_ul: f64,
        speed_code: u8,
    },
    /// Push everything in the barrel out through `port`.
    DispenseToWaste { port: u8, speed_code: u8 },
}

/// Vendor syringe pump driver.
#[async_trait]
pub trait SyringeTransport: Send + Sync {
    /// Home the plunger and valve.
    async fn initialize(&self) -> Result<()>;

    /// Start executing `ops` as one chain and return its estimated duration.
    async fn execute_chain(&self, ops: &[SyringeOp]) -> Result<Duration>;

    async fn is_ready(&self) -> Result<bool>;

    /// Plunger position as a fraction of full stroke.
    async fn plunger_fraction(&self) -> Result<f64>;

    /// Stop the plunger immediately.
    async fn terminate(&self) -> Result<()>;
}

// =============================================================================
// Pump
// =============================================================================

/// Pump-level settings independent of the transport.
#[derive(Debug, Clone)]
pub struct SyringePumpSettings {
    /// Barrel volume in µL
    pub capacity_ul: f64,
    /// Slowest speed code the caller may request
    pub speed_code_floor: u8,
    /// Pump port plumbed to waste
    pub waste_port: u8,
    /// Completion poll cadence after the estimate has elapsed.
    pub poll_interval: Duration,
}

impl SyringePumpSettings {
    pub fn new(capacity_ul: f64, speed_code_floor: u8, waste_port: u8) -> Self {
        Self {
            capacity_ul,
            speed_code_floor,
            waste_port,
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct PendingChain {
    ops: Vec<SyringeOp>,
    net_ul: f64,
}

pub struct SyringePump<T> {
    transport: T,
    settings: SyringePumpSettings,
    chain: Mutex<PendingChain>,
    plunger_fraction: Mutex<f64>,
    busy: AtomicBool,
    abort: AbortSignal,
}

impl<T: SyringeTransport> SyringePump<T> {
    /// Initialize the transport and read the starting plunger position.
    pub async fn initialize(transport: T, settings: SyringePumpSettings) -> Result<Self> {
        transport
            .initialize()
            .await
            .context("Failed to initialize syringe pump")?;
        let fraction = transport.plunger_fraction().await?;
        info!(
            capacity_ul = settings.capacity_ul,
            speed_code_floor = settings.speed_code_floor,
            volume_ul = fraction * settings.capacity_ul,
            "Syringe pump initialized"
        );
        Ok(Self {
            transport,
            settings,
            chain: Mutex::new(PendingChain::default()),
            plunger_fraction: Mutex::new(fraction),
            busy: AtomicBool::new(false),
            abort: AbortSignal::new(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Operations queued since the last execute.
    pub fn pending_ops(&self) -> Vec<SyringeOp> {
        self.chain.lock().ops.clone()
    }

    fn clamp_speed(&self, speed_code: u8) -> u8 {
        speed_code
            .max(self.settings.speed_code_floor)
            .min(calibration::MAX_SPEED_CODE)
    }

    fn push(&self, op: SyringeOp, net_delta: Option<f64>) {
        let mut chain = self.chain.lock();
        match net_delta {
            Some(delta) => chain.net_ul += delta,
            None => chain.net_ul = 0.0,
        }
        debug!(?op, net_ul = chain.net_ul, "queued syringe op");
        chain.ops.push(op);
    }

    /// Wait out `estimate`, then poll until the transport reports ready.
    async fn wait_for_stop(&self, estimate: Duration) -> Result<()> {
        if self.abort.wait(estimate).await {
            return Ok(());
        }
        loop {
            if self.transport.is_ready().await? {
                return Ok(());
            }
            if self.abort.wait(self.settings.poll_interval).await {
                return Ok(());
            }
        }
    }

    async fn refresh_plunger(&self) -> Result<()> {
        let fraction = self.transport.plunger_fraction().await?;
        *self.plunger_fraction.lock() = fraction;
        Ok(())
    }
}

#[async_trait]
impl<T: SyringeTransport> VolumetricPump for SyringePump<T> {
    fn capacity_ul(&self) -> f64 {
        self.settings.capacity_ul
    }

    fn speed_code_floor(&self) -> u8 {
        self.settings.speed_code_floor
    }

    fn reset_chain(&self) {
        let mut chain = self.chain.lock();
        chain.ops.clear();
        chain.net_ul = 0.0;
    }

    fn extract(&self, port: u8, volume_ul: f64, speed_code: u8) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        let speed_code = self.clamp_speed(speed_code);
        self.push(
            SyringeOp::Extract {
                port,
                volume_ul,
                speed_code,
            },
            Some(volume_ul),
        );
        Ok(())
    }

    fn dispense(&self, port: u8, volume_ul: f64, speed_code: u8) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        let speed_code = self.clamp_speed(speed_code);
        self.push(
            SyringeOp::Dispense {
                port,
                volume_ul,
                speed_code,
            },
            Some(-volume_ul),
        );
        Ok(())
    }

    fn dispense_to_waste(&self, speed_code: Option<u8>) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        let speed_code = self.clamp_speed(speed_code.unwrap_or(self.settings.speed_code_floor));
        self.push(
            SyringeOp::DispenseToWaste {
                port: self.settings.waste_port,
                speed_code,
            },
            None,
        );
        Ok(())
    }

    async fn execute(&self, blocking: bool) -> Result<()> {
        if self.abort.is_raised() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.chain.lock().ops);
        if ops.is_empty() {
            self.chain.lock().net_ul = 0.0;
            return Ok(());
        }

        self.busy.store(true, Ordering::SeqCst);
        let result: Result<()> = async {
            let estimate = self.transport.execute_chain(&ops).await?;
            debug!(ops = ops.len(), ?estimate, blocking, "syringe chain started");
            if blocking {
                while !self.transport.is_ready().await? {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                Ok(())
            } else {
                self.wait_for_stop(estimate).await
            }
        }
        .await;
        self.busy.store(false, Ordering::SeqCst);
        self.chain.lock().net_ul = 0.0;
        result.context("Syringe pump chain failed")?;

        self.refresh_plunger().await
    }

    fn current_volume_ul(&self) -> f64 {
        *self.plunger_fraction.lock() * self.settings.capacity_ul
    }

    fn chained_volume_ul(&self) -> f64 {
        self.chain.lock().net_ul
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn abort(&self) {
        self.abort.raise();
        self.reset_chain();
        if let Err(e) = self.transport.terminate().await {
            warn!(error = %e, "Failed to terminate syringe pump");
        }
        info!("Syringe pump aborted");
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    fn reset_abort(&self) {
        self.abort.clear();
    }

    async fn close(&self, to_waste: bool) -> Result<()> {
        if to_waste {
            self.dispense_to_waste(None)?;
            self.execute(true).await?;
        }
        info!(to_waste, "Syringe pump closed");
        Ok(())
    }
}

// =============================================================================
// Simulated Transport
// =============================================================================

const VOLUME_EPSILON_UL: f64 = 1e-6;

/// Syringe transport that models the barrel in memory.
///
/// Stroke time follows the calibration table, scaled by `time_scale`.
/// Chains that would over- or under-run the barrel are rejected before any
/// volume changes.
pub struct SimulatedSyringe {
    capacity_ul: f64,
    time_scale: f64,
    volume_ul: Mutex<f64>,
    busy_until: Mutex<Option<Instant>>,
    history: Mutex<Vec<Vec<SyringeOp>>>,
    fail_next: Mutex<Option<String>>,
}

impl SimulatedSyringe {
    pub fn new(capacity_ul: f64) -> Self {
        Self {
            capacity_ul,
            time_scale: 1.0,
            volume_ul: Mutex::new(0.0),
            busy_until: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    pub fn with_volume(self, volume_ul: f64) -> Self {
        *self.volume_ul.lock() = volume_ul;
        self
    }

    pub fn volume_ul(&self) -> f64 {
        *self.volume_ul.lock()
    }

    /// Every chain executed so far, in order.
    pub fn history(&self) -> Vec<Vec<SyringeOp>> {
        self.history.lock().clone()
    }

    /// Reject the next chain with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    fn stroke_time(&self, volume_ul: f64, speed_code: u8) -> Duration {
        let seconds = volume_ul.abs() / self.capacity_ul
            * calibration::stroke_seconds(speed_code)
            * self.time_scale;
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[async_trait]
impl SyringeTransport for SimulatedSyringe {
    async fn initialize(&self) -> Result<()> {
        *self.busy_until.lock() = None;
        Ok(())
    }

    async fn execute_chain(&self, ops: &[SyringeOp]) -> Result<Duration> {
        if let Some(message) = self.fail_next.lock().take() {
            bail!(message);
        }

        let mut volume = *self.volume_ul.lock();
        let mut duration = Duration::ZERO;
        for op in ops {
            match *op {
                SyringeOp::Extract {
                    volume_ul,
                    speed_code,
                    ..
                } => {
                    volume += volume_ul;
                    if volume > self.capacity_ul + VOLUME_EPSILON_UL {
                        bail!(
                            "Plunger overrun: {volume:.1} uL exceeds the {:.1} uL barrel",
                            self.capacity_ul
                        );
                    }
                    duration += self.stroke_time(volume_ul, speed_code);
                }
                SyringeOp::Dispense {
                    volume_ul,
                    speed_code,
                    ..
                } => {
                    volume -= volume_ul;
                    if volume < -VOLUME_EPSILON_UL {
                        bail!("Plunger underrun: dispensing {volume_ul:.1} uL leaves {volume:.1} uL");
                    }
                    duration += self.stroke_time(volume_ul, speed_code);
                }
                SyringeOp::DispenseToWaste { speed_code, .. } => {
                    duration += self.stroke_time(volume, speed_code);
                    volume = 0.0;
                }
            }
        }

        *self.volume_ul.lock() = volume.clamp(0.0, self.capacity_ul);
        *self.busy_until.lock() = Some(Instant::now() + duration);
        self.history.lock().push(ops.to_vec());
        Ok(duration)
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(self
            .busy_until
            .lock()
            .map_or(true, |until| Instant::now() >= until))
    }

    async fn plunger_fraction(&self) -> Result<f64> {
        Ok(*self.volume_ul.lock() / self.capacity_ul)
    }

    async fn terminate(&self) -> Result<()> {
        *self.busy_until.lock() = None;
        Ok(())
    }
}

/// Syringe pump backed by the in-memory barrel model.
pub type SimulatedSyringePump = SyringePump<SimulatedSyringe>;

impl SimulatedSyringePump {
    /// Build a simulated pump without hardware initialization delays.
    pub async fn simulated(settings: SyringePumpSettings, time_scale: f64) -> Result<Self> {
        let transport = SimulatedSyringe::new(settings.capacity_ul).with_time_scale(time_scale);
        Self::initialize(transport, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn pump(capacity_ul: f64, floor: u8) -> SimulatedSyringePump {
        let mut settings = SyringePumpSettings::new(capacity_ul, floor, 3);
        settings.poll_interval = Duration::from_millis(5);
        SimulatedSyringePump::simulated(settings, 0.0).await.unwrap()
    }

    #[tokio::test]
    async fn test_chain_accounting() {
        let pump = pump(1000.0, 10).await;
        pump.extract(1, 600.0, 20).unwrap();
        pump.dispense(2, 200.0, 20).unwrap();
        assert_eq!(pump.chained_volume_ul(), 400.0);
        assert_eq!(pump.current_volume_ul(), 0.0);

        pump.execute(false).await.unwrap();
        assert_eq!(pump.chained_volume_ul(), 0.0);
        assert!((pump.current_volume_ul() - 400.0).abs() < 1e-9);
        assert!(!pump.is_busy());

        pump.extract(1, 100.0, 20).unwrap();
        pump.dispense_to_waste(None).unwrap();
        assert_eq!(pump.chained_volume_ul(), 0.0);
        pump.execute(true).await.unwrap();
        assert_eq!(pump.current_volume_ul(), 0.0);
    }

    #[tokio::test]
    async fn test_speed_codes_clamped_to_floor() {
        let pump = pump(1000.0, 10).await;
        pump.extract(1, 100.0, 2).unwrap();
        pump.dispense_to_waste(None).unwrap();
        assert_eq!(
            pump.pending_ops(),
            vec![
                SyringeOp::Extract {
                    port: 1,
                    volume_ul: 100.0,
                    speed_code: 10
                },
                SyringeOp::DispenseToWaste {
                    port: 3,
                    speed_code: 10
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_flow_rate_helpers_use_capacity_and_floor() {
        let pump = pump(5000.0, 5).await;
        assert_eq!(pump.flow_rate(27), 5000.0);
        assert_eq!(pump.flow_rate_to_speed_code(5000.0), 27);
        assert_eq!(pump.flow_rate_to_speed_code(1.0e9), 5);
    }

    #[tokio::test]
    async fn test_transport_error_resets_chain() {
        let pump = pump(1000.0, 0).await;
        pump.extract(1, 1200.0, 20).unwrap();
        let err = pump.execute(false).await.unwrap_err();
        assert!(format!("{err:#}").contains("Plunger overrun"));
        assert!(!pump.is_busy());
        assert_eq!(pump.chained_volume_ul(), 0.0);
        assert!(pump.pending_ops().is_empty());
        assert_eq!(pump.current_volume_ul(), 0.0);
    }

    #[tokio::test]
    async fn test_abort_discards_chain_and_ignores_moves() {
        let pump = pump(1000.0, 0).await;
        pump.extract(1, 100.0, 20).unwrap();
        pump.abort().await;
        assert!(pump.is_aborted());
        assert!(pump.pending_ops().is_empty());

        pump.extract(1, 100.0, 20).unwrap();
        pump.dispense_to_waste(None).unwrap();
        assert!(pump.pending_ops().is_empty());
        pump.execute(false).await.unwrap();
        assert!(pump.transport().history().is_empty());

        pump.reset_abort();
        pump.extract(1, 100.0, 20).unwrap();
        pump.execute(false).await.unwrap();
        assert_eq!(pump.transport().history().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_stops_polling_promptly() {
        let mut settings = SyringePumpSettings::new(1000.0, 0, 3);
        settings.poll_interval = Duration::from_millis(5);
        // Full barrel at code 40 takes 600 s.
        let pump = Arc::new(SimulatedSyringePump::simulated(settings, 1.0).await.unwrap());
        pump.extract(1, 1000.0, 40).unwrap();

        let runner = pump.clone();
        let task = tokio::spawn(async move { runner.execute(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pump.is_busy());

        let started = std::time::Instant::now();
        pump.abort().await;
        task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pump.is_busy());
    }

    #[tokio::test]
    async fn test_close_drains_to_waste() {
        let mut settings = SyringePumpSettings::new(1000.0, 0, 3);
        settings.poll_interval = Duration::from_millis(5);
        let transport = SimulatedSyringe::new(1000.0)
            .with_time_scale(0.0)
            .with_volume(250.0);
        let pump = SyringePump::initialize(transport, settings).await.unwrap();
        assert_eq!(pump.current_volume_ul(), 250.0);

        pump.close(true).await.unwrap();
        assert_eq!(pump.current_volume_ul(), 0.0);
        assert_eq!(pump.transport().volume_ul(), 0.0);
    }
}
