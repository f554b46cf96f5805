//! Shared serial ports for line-oriented instruments.
//!
//! The temperature controller speaks an ASCII request/response protocol. Its
//! driver holds a [`SharedPort`] and takes the lock for each full exchange.
//! Tests substitute `tokio::io::DuplexStream` for the real port.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Any async byte stream usable as a serial port.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Thread-safe shared serial port with buffered line reading.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Create a [`SharedPort`] from a type-erased serial port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open `port_path` as 8N1 without flow control.
///
/// The blocking open runs on the blocking pool.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

    let builder = tokio_serial::new(port_path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None);
    let stream = tokio::task::spawn_blocking(move || builder.open_native_async())
        .await
        .context("Serial open task panicked")?;
    stream.with_context(|| format!("Cannot open {device_name} on {port_path}"))
}

/// Find the device path of the USB serial adapter with `serial_number`.
#[cfg(feature = "serial")]
pub fn find_port_by_serial_number(serial_number: &str) -> anyhow::Result<String> {
    use anyhow::Context;

    let ports = tokio_serial::available_ports().context("Failed to enumerate serial ports")?;
    ports
        .into_iter()
        .find(|port| match &port.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => {
                usb.serial_number.as_deref() == Some(serial_number)
            }
            _ => false,
        })
        .map(|port| port.port_name)
        .ok_or_else(|| anyhow::anyhow!("No serial port with serial number {serial_number}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_shared_port_reads_lines_from_any_clone() {
        let (mut host, device) = tokio::io::duplex(64);
        let port: SharedPort = wrap_shared(Box::new(device));
        let clone = port.clone();

        host.write_all(b"TC1:TCACTUALTEMP=025.1\r\n").await.unwrap();

        let mut guard = clone.lock().await;
        let mut line = String::new();
        guard.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "TC1:TCACTUALTEMP=025.1");
    }
}
