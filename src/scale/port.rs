//! Serial device seam.
//!
//! The reader only talks to the scale through [`PortOpener`] and [`ScalePort`],
//! so tests can drive it with a scripted in-memory device.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::utils::error::ScaleError;

/// An open connection to the scale.
///
/// Closing is dropping.
pub trait ScalePort: Send {
    /// Writes a poll command to the device.
    fn write_command(&mut self, command: &[u8]) -> io::Result<()>;

    /// Reads whatever the device answered, up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means end of stream; a read that outlives the configured
    /// timeout fails with `ErrorKind::TimedOut`.
    fn read_response(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Opens scale connections by port name.
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn ScalePort>, ScaleError>;
}

/// Opens real serial ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn ScalePort>, ScaleError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open().map_err(|e| ScaleError::Open {
            port: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(SerialDevice(port)))
    }
}

struct SerialDevice(Box<dyn serialport::SerialPort>);

impl ScalePort for SerialDevice {
    fn write_command(&mut self, command: &[u8]) -> io::Result<()> {
        self.0.write_all(command)?;
        self.0.flush()
    }

    fn read_response(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.set_timeout(timeout).map_err(io::Error::from)
    }
}
