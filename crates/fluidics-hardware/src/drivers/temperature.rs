//! Dual-channel temperature controller.
//!
//! [`TemperatureController`] implements [`ThermalController`] over a
//! [`TemperatureTransport`]. It owns one background poller task that samples
//! both channels at a fixed interval, caches the latest reading and publishes
//! it on a bounded channel. A lagging consumer loses readings; the poller
//! never blocks on it.
//!
//! Transports:
//! - [`TcmSerial`]: ASCII line protocol over a [`SharedPort`]
//! - [`SimulatedTcm`]: actual temperatures step toward the targets
//!
//! # Protocol
//!
//! Requests are `"{channel}:{command}\r"`, answered by one line:
//!
//! | command          | meaning                 | reply value offset |
//! |------------------|-------------------------|--------------------|
//! | `TCADJTEMP?`     | read target             | 14                 |
//! | `TCADJTEMP={t}`  | set target              |                    |
//! | `TCADJTEMP!`     | persist target          |                    |
//! | `TCACTUALTEMP?`  | read actual temperature | 17                 |
//!
//! A reply starting with `CMD:` whose last character is neither `1` nor `8`
//! reports a controller error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fluidics_core::abort::AbortSignal;
use fluidics_core::capabilities::{
    StabilityOutcome, TemperatureReading, ThermalChannel, ThermalController,
};
use fluidics_core::error::{DriverError, DriverErrorKind};
use fluidics_core::serial::SharedPort;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Transport
// =============================================================================

#[async_trait]
pub trait TemperatureTransport: Send + Sync + 'static {
    async fn read_target(&self, channel: ThermalChannel) -> Result<f64>;

    async fn write_target(&self, channel: ThermalChannel, value: f64) -> Result<()>;

    /// Persist the target; returns the controller's acknowledgement.
    async fn save_target(&self, channel: ThermalChannel) -> Result<String>;

    /// Actual temperature, or `None` when the reply could not be parsed.
    async fn read_actual(&self, channel: ThermalChannel) -> Result<Option<f64>>;
}

/// Format a temperature the way the controller firmware expects (`37.0`, `36.5`).
fn format_temperature(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

const TARGET_VALUE_OFFSET: usize = 14;
const ACTUAL_VALUE_OFFSET: usize = 17;

/// How long a late reply may keep trickling in before the next request.
const STALE_INPUT_SETTLE: Duration = Duration::from_millis(10);

/// Drop whatever is readable now or within [`STALE_INPUT_SETTLE`].
async fn discard_input<R: AsyncBufRead + Unpin>(port: &mut R) -> usize {
    let mut discarded = 0;
    loop {
        let pending = match tokio::time::timeout(STALE_INPUT_SETTLE, port.fill_buf()).await {
            Ok(Ok(buf)) => buf.len(),
            _ => 0,
        };
        if pending == 0 {
            return discarded;
        }
        port.consume(pending);
        discarded += pending;
    }
}

/// TCM controller on a serial line.
pub struct TcmSerial {
    port: SharedPort,
    read_timeout: Duration,
    /// Set when a reply timed out; its tail may still arrive.
    stale_input: AtomicBool,
}

impl TcmSerial {
    pub fn new(port: SharedPort) -> Self {
        Self {
            port,
            read_timeout: Duration::from_millis(500),
            stale_input: AtomicBool::new(false),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Find the adapter by USB serial number and open it.
    #[cfg(feature = "serial")]
    pub async fn open(serial_number: &str, baud_rate: u32) -> Result<Self> {
        use fluidics_core::serial::{find_port_by_serial_number, open_serial_async, wrap_shared};

        let path = find_port_by_serial_number(serial_number)?;
        let stream = open_serial_async(&path, baud_rate, "TCM temperature controller").await?;
        info!(path = %path, baud_rate, "Temperature controller port opened");
        Ok(Self::new(wrap_shared(Box::new(stream))))
    }

    /// One request/response exchange under the port lock.
    ///
    /// A missing reply reads as an empty line, like a serial read timeout.
    /// Input left over from a timed-out reply is discarded before the next
    /// request goes out.
    pub async fn send_command(&self, channel: ThermalChannel, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;
        if self.stale_input.swap(false, Ordering::SeqCst) {
            let discarded = discard_input(&mut *port).await;
            if discarded > 0 {
                debug!(discarded, "Discarded late TCM reply bytes");
            }
        }
        let request = format!("{channel}:{command}\r");
        trace!(request = %request.trim_end(), "TCM request");
        port.get_mut().write_all(request.as_bytes()).await?;
        port.get_mut().flush().await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.read_timeout, port.read_line(&mut line)).await;
        match read {
            Ok(read) => {
                read?;
            }
            Err(_) => {
                warn!(%channel, command, "TCM reply timed out");
                line.clear();
                self.stale_input.store(true, Ordering::SeqCst);
            }
        }
        let response = line.trim().to_string();
        trace!(response = %response, "TCM response");

        if response.starts_with("CMD:") && !(response.ends_with('1') || response.ends_with('8')) {
            return Err(DriverError::new(
                "tcm",
                DriverErrorKind::Hardware,
                format!("Error from controller: {response}"),
            )
            .into());
        }
        Ok(response)
    }
}

#[async_trait]
impl TemperatureTransport for TcmSerial {
    async fn read_target(&self, channel: ThermalChannel) -> Result<f64> {
        let response = self.send_command(channel, "TCADJTEMP?").await?;
        response
            .get(TARGET_VALUE_OFFSET..)
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| anyhow!("Unexpected target temperature reply from {channel}: '{response}'"))
    }

    async fn write_target(&self, channel: ThermalChannel, value: f64) -> Result<()> {
        self.send_command(channel, &format!("TCADJTEMP={}", format_temperature(value)))
            .await?;
        Ok(())
    }

    async fn save_target(&self, channel: ThermalChannel) -> Result<String> {
        self.send_command(channel, "TCADJTEMP!").await
    }

    async fn read_actual(&self, channel: ThermalChannel) -> Result<Option<f64>> {
        let response = self.send_command(channel, "TCACTUALTEMP?").await?;
        Ok(response
            .get(ACTUAL_VALUE_OFFSET..)
            .and_then(|value| value.trim().parse().ok()))
    }
}

/// Controller model whose actual temperatures approach the targets.
pub struct SimulatedTcm {
    targets: Mutex<[f64; 2]>,
    actuals: Mutex<[f64; 2]>,
    step_per_read: f64,
}

impl SimulatedTcm {
    /// Both channels start at `ambient`, targets included.
    pub fn new(ambient: f64, step_per_read: f64) -> Self {
        Self {
            targets: Mutex::new([ambient; 2]),
            actuals: Mutex::new([ambient; 2]),
            step_per_read,
        }
    }
}

impl Default for SimulatedTcm {
    fn default() -> Self {
        Self::new(25.0, 2.0)
    }
}

#[async_trait]
impl TemperatureTransport for SimulatedTcm {
    async fn read_target(&self, channel: ThermalChannel) -> Result<f64> {
        Ok(self.targets.lock()[channel.index()])
    }

    async fn write_target(&self, channel: ThermalChannel, value: f64) -> Result<()> {
        self.targets.lock()[channel.index()] = value;
        Ok(())
    }

    async fn save_target(&self, _channel: ThermalChannel) -> Result<String> {
        Ok(String::new())
    }

    async fn read_actual(&self, channel: ThermalChannel) -> Result<Option<f64>> {
        let target = self.targets.lock()[channel.index()];
        let mut actuals = self.actuals.lock();
        let actual = &mut actuals[channel.index()];
        let delta = (target - *actual).clamp(-self.step_per_read, self.step_per_read);
        *actual += delta;
        Ok(Some(*actual))
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Clone)]
pub struct ThermalSettings {
    /// Interval between background samples.
    pub poll_interval: Duration,
    /// Interval between checks in `wait_until_stable`.
    pub stability_poll: Duration,
    /// Capacity of the readings channel.
    pub channel_capacity: usize,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stability_poll: Duration::from_secs(2),
            channel_capacity: 64,
        }
    }
}

pub struct TemperatureController<T> {
    transport: Arc<T>,
    targets: Mutex<[f64; 2]>,
    latest: Arc<Mutex<TemperatureReading>>,
    readings: Mutex<Option<mpsc::Receiver<TemperatureReading>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    stop: AbortSignal,
    abort: AbortSignal,
    stability_poll: Duration,
}

impl<T: TemperatureTransport> TemperatureController<T> {
    /// Read back both targets, take a first sample and start the background
    /// poller.
    pub async fn start(transport: T, settings: ThermalSettings) -> Result<Self> {
        let transport = Arc::new(transport);
        let tc1 = transport.read_target(ThermalChannel::Tc1).await?;
        let tc2 = transport.read_target(ThermalChannel::Tc2).await?;

        let mut first = TemperatureReading::default();
        sample(transport.as_ref(), &mut first).await;
        let latest = Arc::new(Mutex::new(first));
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let stop = AbortSignal::new();
        let poller = tokio::spawn(poll_temperatures(
            transport.clone(),
            latest.clone(),
            tx,
            stop.clone(),
            settings.poll_interval,
        ));
        info!(tc1, tc2, "Temperature controller started");

        Ok(Self {
            transport,
            targets: Mutex::new([tc1, tc2]),
            latest,
            readings: Mutex::new(Some(rx)),
            poller: Mutex::new(Some(poller)),
            stop,
            abort: AbortSignal::new(),
            stability_poll: settings.stability_poll,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Read both channels, keeping the previous value of any channel that fails.
async fn sample<T: TemperatureTransport>(transport: &T, reading: &mut TemperatureReading) {
    for channel in ThermalChannel::ALL {
        match transport.read_actual(channel).await {
            Ok(Some(value)) => match channel {
                ThermalChannel::Tc1 => reading.tc1 = value,
                ThermalChannel::Tc2 => reading.tc2 = value,
            },
            Ok(None) => debug!(%channel, "Unreadable temperature, keeping previous value"),
            Err(e) => warn!(%channel, error = %e, "Temperature read failed"),
        }
    }
}

async fn poll_temperatures<T: TemperatureTransport>(
    transport: Arc<T>,
    latest: Arc<Mutex<TemperatureReading>>,
    tx: mpsc::Sender<TemperatureReading>,
    stop: AbortSignal,
    interval: Duration,
) {
    loop {
        if stop.wait(interval).await {
            break;
        }
        let mut reading = *latest.lock();
        sample(transport.as_ref(), &mut reading).await;
        *latest.lock() = reading;
        match tx.try_send(reading) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Temperature consumer lagging, reading dropped"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
    debug!("Temperature poller stopped");
}

#[async_trait]
impl<T: TemperatureTransport> ThermalController for TemperatureController<T> {
    async fn set_target_temperature(&self, channel: ThermalChannel, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(DriverError::new(
                "tcm",
                DriverErrorKind::InvalidParameter,
                format!("target temperature {value} is not a number"),
            )
            .into());
        }
        self.transport.write_target(channel, value).await?;
        self.targets.lock()[channel.index()] = value;
        info!(%channel, target = value, "Target temperature set");
        Ok(())
    }

    async fn save_target_temperature(&self, channel: ThermalChannel) -> Result<()> {
        let response = self.transport.save_target(channel).await?;
        info!(%channel, response = %response, "Target temperature saved");
        Ok(())
    }

    fn target_temperature(&self, channel: ThermalChannel) -> f64 {
        self.targets.lock()[channel.index()]
    }

    fn actual_temperatures(&self) -> TemperatureReading {
        *self.latest.lock()
    }

    fn take_readings(&self) -> Option<mpsc::Receiver<TemperatureReading>> {
        self.readings.lock().take()
    }

    async fn wait_until_stable(
        &self,
        target: f64,
        tolerance: f64,
        timeout: Duration,
    ) -> StabilityOutcome {
        let started = tokio::time::Instant::now();
        loop {
            if self.abort.wait(self.stability_poll).await {
                return StabilityOutcome::Aborted;
            }
            let reading = self.actual_temperatures();
            if reading.within(target, tolerance) {
                info!(target, tc1 = reading.tc1, tc2 = reading.tc2, "Temperature stable");
                return StabilityOutcome::Stable;
            }
            if started.elapsed() > timeout {
                warn!(
                    target,
                    tc1 = reading.tc1,
                    tc2 = reading.tc2,
                    timeout_s = timeout.as_secs_f64(),
                    "Temperature failed to stabilize"
                );
                return StabilityOutcome::TimedOut(reading);
            }
        }
    }

    fn abort(&self) {
        self.abort.raise();
    }

    fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    fn reset_abort(&self) {
        self.abort.clear();
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop.raise();
        let poller = self.poller.lock().take();
        if let Some(handle) = poller {
            handle
                .await
                .map_err(|e| anyhow!("Temperature poller panicked: {e}"))?;
            info!("Temperature controller shut down");
        }
        Ok(())
    }
}

impl<T> Drop for TemperatureController<T> {
    fn drop(&mut self) {
        self.stop.raise();
    }
}
