//! The duplex byte channel the protocol runs over.
//!
//! `Transport` models exactly what the data logger's link needs: open/close,
//! timeout-bounded reads, writes, and the RTS/CTS pair used for flow control.
//! `SerialTransport` implements it on a physical port; the null modem in
//! `crate::null_modem` implements it in-process for testing.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

pub trait Transport: Send {
    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    /// Drive the request-to-send line.
    fn set_rts(&mut self, level: bool) -> io::Result<()>;

    /// Sample the clear-to-send line (the peer's RTS).
    fn get_cts(&mut self) -> io::Result<bool>;

    /// Read up to `buf.len()` bytes, blocking for at most the configured
    /// timeout. A timeout is not an error: it returns fewer bytes, possibly
    /// zero.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `data`, returning the number of bytes actually written.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// The read timeout, or `None` if reads may block forever.
    fn timeout(&self) -> Option<Duration>;
}

/// Line settings for a physical serial port.
///
/// The defaults match the OC110: 9600 baud, 8-N-1, hardware flow control and
/// a five second read timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    baud_rate: u32,
    timeout: Duration,
    flow_control: FlowControl,
}

impl SerialSettings {
    pub const DEFAULT_BAUD_RATE: u32 = 9600;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        SerialSettings {
            baud_rate: Self::DEFAULT_BAUD_RATE,
            timeout: Self::DEFAULT_TIMEOUT,
            flow_control: FlowControl::Hardware,
        }
    }

    pub fn baud_rate(&mut self, baud_rate: u32) -> &mut Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout. The device speaks in whole seconds but any
    /// positive duration is accepted.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Disable hardware flow control, leaving RTS entirely to the caller.
    pub fn manual_flow_control(&mut self) -> &mut Self {
        self.flow_control = FlowControl::None;
        self
    }

    /// Create a transport for the device at `path`. The port is not touched
    /// until `Transport::open` is called.
    pub fn build(&self, path: &str) -> SerialTransport {
        SerialTransport {
            path: path.to_string(),
            settings: self.clone(),
            port: None,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings::new()
    }
}

/// A `Transport` over a real serial device.
pub struct SerialTransport {
    path: String,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(self.settings.flow_control)
            .timeout(self.settings.timeout)
            .open()?;
        debug!(
            "Serial port '{}' opened at {} baud",
            self.path, self.settings.baud_rate
        );
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut port) = self.port.take() {
            // Dropping the port closes it; lower RTS first so the peer sees us go.
            port.write_request_to_send(false)?;
            debug!("Serial port '{}' closed", self.path);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        Ok(self.port()?.write_request_to_send(level)?)
    }

    fn get_cts(&mut self) -> io::Result<bool> {
        Ok(self.port()?.read_clear_to_send()?)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        let written = port.write(data)?;
        port.flush()?;
        Ok(written)
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.settings.timeout)
    }
}
