//! Physical transport providers
//!
//! Two byte-level transports carry the link protocols: an asynchronous
//! serial port (RS-232 style, default 9600 8N1) and the Garmin USB
//! interface (bulk OUT pipe for host traffic, interrupt IN pipe for device
//! traffic, packetization intrinsic to USB).
//!
//! The traits here are the seam the rest of the stack is written against;
//! tests substitute scripted implementations.

use crate::types::{GarminError, Result};
use log::{debug, info};
use std::io::{Read, Write};
use std::time::Duration;

/// Garmin USB vendor ID
pub const USB_VENDOR_ID: u16 = 0x091e;

/// Bulk OUT endpoint (host to device)
pub const USB_ENDPOINT_OUT: u8 = 0x02;
/// Interrupt IN endpoint (device to host)
pub const USB_ENDPOINT_IN: u8 = 0x81;

/// Largest raw USB packet, header included
pub const USB_MAX_BUFFER_SIZE: usize = 4096;

/// Default per-read/per-write timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte-stream contract of the serial transport.
///
/// `read` blocks until at least one byte is available or the timeout
/// expires; a timeout surfaces as `GarminError::Timeout` so the link layer
/// can decide whether to retry.
pub trait SerialIo: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Packet contract of the USB transport. Each call transfers one raw USB
/// packet including the 12-byte Garmin header.
pub trait UsbIo: Send {
    fn read_raw(&mut self) -> Result<Vec<u8>>;
    fn write_raw(&mut self, buf: &[u8]) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration);
}

/// Serial port transport backed by the `serialport` crate.
///
/// The port is opened at 9600 8N1 with no flow control, the mode every
/// Garmin unit starts a session in. `set_baud_rate` supports the baud
/// change handshake driven from the link layer.
pub struct SerialDevice {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialDevice {
    pub fn open(path: &str) -> Result<Self> {
        info!("Opening serial port {path} at 9600 8N1");
        let port = serialport::new(path, 9600)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| GarminError::Transport(format!("{path}: {e}")))?;
        Ok(Self { port })
    }
}

impl SerialIo for SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(0) => Err(GarminError::Timeout),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(GarminError::Timeout),
            Err(e) => Err(GarminError::Transport(e.to_string())),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.port
            .write_all(buf)
            .map_err(|e| GarminError::Transport(e.to_string()))
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| GarminError::Transport(e.to_string()))
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        debug!("Reconfiguring serial port to {baud} baud");
        self.port
            .set_baud_rate(baud)
            .map_err(|e| GarminError::Transport(e.to_string()))
    }

    fn flush(&mut self) -> Result<()> {
        self.port
            .flush()
            .map_err(|e| GarminError::Transport(e.to_string()))
    }
}

/// USB transport backed by `nusb`.
///
/// Talks to the first attached device with the Garmin vendor ID. The
/// transfer futures are bounded by a current-thread runtime so the rest of
/// the stack stays blocking.
pub struct UsbDevice {
    interface: nusb::Interface,
    runtime: tokio::runtime::Runtime,
    timeout: Duration,
}

impl UsbDevice {
    pub fn open() -> Result<Self> {
        info!("Searching for a Garmin USB device (vendor 0x{USB_VENDOR_ID:04x})");
        let device_info = nusb::list_devices()
            .map_err(|e| GarminError::Transport(e.to_string()))?
            .find(|d| d.vendor_id() == USB_VENDOR_ID)
            .ok_or_else(|| GarminError::Transport("Garmin USB device not found".into()))?;
        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info
            .open()
            .map_err(|e| GarminError::Transport(e.to_string()))?;
        let interface = device
            .detach_and_claim_interface(0)
            .map_err(|e| GarminError::Transport(e.to_string()))?;
        debug!("Interface claimed");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| GarminError::Transport(e.to_string()))?;

        Ok(Self {
            interface,
            runtime,
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

impl UsbIo for UsbDevice {
    fn read_raw(&mut self) -> Result<Vec<u8>> {
        let transfer = self
            .interface
            .interrupt_in(USB_ENDPOINT_IN, nusb::transfer::RequestBuffer::new(USB_MAX_BUFFER_SIZE));
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, transfer).await })
            .map_err(|_| GarminError::Timeout)?;
        completion
            .into_result()
            .map_err(|e| GarminError::Transport(e.to_string()))
    }

    fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        let transfer = self.interface.bulk_out(USB_ENDPOINT_OUT, buf.to_vec());
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, transfer).await })
            .map_err(|_| GarminError::Timeout)?;
        completion
            .into_result()
            .map_err(|e| GarminError::Transport(e.to_string()))?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
