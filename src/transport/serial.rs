//! Serial line transport for RS-232 instruments.
//!
//! Wraps the `serialport` crate. Commands get the configured terminator
//! appended; responses are read byte by byte until the configured delimiter,
//! bounded by the line timeout.

use super::Transport;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Instant;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Serial port parameters. 8 data bits, no parity, one stop bit.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Communication speed (e.g., 9600)
    pub baud_rate: u32,
    /// Read timeout for one response line
    pub timeout: Duration,
    /// Appended to every command
    pub line_terminator: String,
    /// Byte that ends a response line
    pub response_delimiter: u8,
    /// XON/XOFF flow control
    pub software_flow_control: bool,
}

impl SerialSettings {
    /// Settings with a 2 s timeout, `\r\n` terminator and `\n` delimiter.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: Duration::from_secs(2),
            line_terminator: "\r\n".to_string(),
            response_delimiter: b'\n',
            software_flow_control: false,
        }
    }

    /// Set the read timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator string for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the response delimiter byte
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    /// Enable XON/XOFF flow control
    pub fn with_software_flow_control(mut self, enabled: bool) -> Self {
        self.software_flow_control = enabled;
        self
    }
}

/// An open serial line.
pub struct SerialLine {
    settings: SerialSettings,
    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLine {
    /// Opens the port described by `settings`.
    #[cfg(feature = "instrument_serial")]
    pub fn open(settings: &SerialSettings) -> AppResult<Self> {
        let flow = if settings.software_flow_control {
            serialport::FlowControl::Software
        } else {
            serialport::FlowControl::None
        };
        // Short internal timeout; read_line enforces the overall deadline.
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(flow)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| DaqError::open(&settings.port, e))?;

        debug!(port = %settings.port, baud = settings.baud_rate, "serial port opened");
        Ok(Self {
            settings: settings.clone(),
            port: Some(port),
        })
    }

    /// Opens the port described by `settings`.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(settings: &SerialSettings) -> AppResult<Self> {
        let _ = settings;
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
impl Transport for SerialLine {
    fn resource(&self) -> &str {
        &self.settings.port
    }

    fn write_line(&mut self, message: &str) -> AppResult<()> {
        let port = self.port.as_mut().ok_or(DaqError::NotConnected)?;
        let framed = format!("{}{}", message, self.settings.line_terminator);
        port.write_all(framed.as_bytes())?;
        port.flush()?;
        debug!(port = %self.settings.port, command = message.trim(), "serial write");
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        let port = self.port.as_mut().ok_or(DaqError::NotConnected)?;
        let delimiter = self.settings.response_delimiter;
        let deadline = Instant::now() + self.settings.timeout;
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() > deadline {
                return Err(DaqError::Read(format!(
                    "serial read timeout after {:?} on {}",
                    self.settings.timeout, self.settings.port
                )));
            }
            match port.read(&mut byte) {
                Ok(1) => {
                    raw.push(byte[0]);
                    if byte[0] == delimiter {
                        break;
                    }
                }
                Ok(_) => {
                    return Err(DaqError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial port returned EOF",
                    )))
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(DaqError::Io(e)),
            }
        }

        let text = String::from_utf8(raw)
            .map_err(|e| DaqError::read(format!("Error while decoding message: {e}")))?;
        let line = text.trim_end_matches(['\r', '\n']).to_string();
        debug!(port = %self.settings.port, response = %line, "serial read");
        Ok(line)
    }

    fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.settings.port, "serial port closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Transport for SerialLine {
    fn resource(&self) -> &str {
        &self.settings.port
    }

    fn write_line(&mut self, _message: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    fn read_line(&mut self) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}
