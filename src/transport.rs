//! The byte stream underneath the driver. The protocol only ever needs four
//! things from it: write a CR-terminated command, read one CR-terminated
//! line, read exactly `n` binary bytes, and change the local baud rate.

use crate::error::{NdiError, Result};

use log::{debug, info};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

/// Terminator the device expects after every command, and sends after every
/// text reply.
pub const LINE_TERMINATOR: u8 = b'\r';

/// Baud rate every System Control Unit starts at after power up or reset.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// How long a blocking read may wait before the transport gives up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A reliable, ordered byte stream to the device.
///
/// Every command is request/reply, so the trait is deliberately blocking.
/// A read that cannot be satisfied within the transport's own timeout policy
/// must fail with [NdiError::Transport].
pub trait Transport {
    /// Open the underlying port.
    fn open(&mut self) -> Result<()>;

    /// Release the underlying port. Closing a closed transport is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Whether [Transport::open] has succeeded and [Transport::close] has
    /// not been called since.
    fn is_open(&self) -> bool;

    /// Write raw bytes.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read exactly `n` bytes, blocking until they arrive.
    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Change the local line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Write a command followed by the line terminator.
    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(LINE_TERMINATOR);
        self.write(&buf)
    }

    /// Read bytes up to and including the line terminator, returning them
    /// without it.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let byte = self.read_exact(1)?[0];
            if byte == LINE_TERMINATOR {
                return Ok(line);
            }
            line.push(byte);
        }
    }
}

/// A [Transport] over a real serial port, fixed at 8 data bits, no parity,
/// one stop bit and no hardware handshake.
pub struct SerialTransport {
    path: PathBuf,
    baud: u32,
    timeout: Duration,
    port: Option<SerialPort>,
}

impl SerialTransport {
    /// A closed transport for the device at `path`, starting at `baud`.
    pub fn new(path: impl AsRef<Path>, baud: u32) -> Self {
        SerialTransport {
            path: path.as_ref().to_path_buf(),
            baud,
            timeout: DEFAULT_TIMEOUT,
            port: None,
        }
    }

    /// Use a different read/write timeout. Takes effect on the next open.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        SerialTransport { timeout, ..self }
    }

    /// The serial devices the operating system knows about.
    pub fn available_ports() -> Result<Vec<PathBuf>> {
        Ok(SerialPort::available_ports()?)
    }

    /// The baud rate the port is (or will be) configured with.
    pub fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn port(&mut self) -> Result<&mut SerialPort> {
        self.port.as_mut().ok_or(NdiError::PortNotOpen)
    }
}

fn line_settings(mut settings: Settings, baud: u32) -> std::io::Result<Settings> {
    settings.set_raw();
    settings.set_baud_rate(baud)?;
    settings.set_char_size(CharSize::Bits8);
    settings.set_parity(Parity::None);
    settings.set_stop_bits(StopBits::One);
    settings.set_flow_control(FlowControl::None);
    Ok(settings)
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        let baud = self.baud;
        let mut port = SerialPort::open(&self.path, |settings: Settings| line_settings(settings, baud))?;
        port.set_read_timeout(self.timeout)?;
        port.set_write_timeout(self.timeout)?;
        port.discard_buffers()?;
        info!("Opened {} at {} baud", self.path.display(), baud);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!("Closed {}", self.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port()?.write_all(bytes)?;
        Ok(())
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; n];
        self.port()?.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        if let Some(port) = self.port.as_mut() {
            let settings = line_settings(port.get_configuration()?, baud)?;
            port.set_configuration(&settings)?;
        }
        debug!("Local baud rate is now {}", baud);
        self.baud = baud;
        Ok(())
    }
}
