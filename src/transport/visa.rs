//! Instrument-bus transport for GPIB/USB/Ethernet instruments.
//!
//! Wraps the `visa-rs` crate. Supports resource strings like:
//! - "GPIB0::22::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::Transport;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Bus session parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct VisaSettings {
    /// VISA resource string (e.g., "GPIB0::22::INSTR")
    pub resource: String,
    /// Read timeout for one response
    pub timeout: Duration,
    /// Appended to every command (typically "\n" for SCPI)
    pub line_terminator: String,
}

impl VisaSettings {
    /// Settings with a 5 s timeout and `\n` terminator.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }
}

/// I/O timeout in whole milliseconds, saturating at the attribute's range.
pub fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

/// An open bus session.
pub struct VisaSession {
    settings: VisaSettings,
    #[cfg(feature = "instrument_visa")]
    session: Option<(DefaultRM, Instrument)>,
}

impl VisaSession {
    /// Opens a session to `settings.resource`.
    #[cfg(feature = "instrument_visa")]
    pub fn open(settings: &VisaSettings) -> AppResult<Self> {
        let resource = &settings.resource;
        let rm = DefaultRM::new().map_err(|e| DaqError::open(resource, e))?;
        let expr = CString::new(resource.as_str())
            .map_err(|e| DaqError::open(resource, e))?
            .into();
        let id = rm.find_res(&expr).map_err(|e| DaqError::open(resource, e))?;
        let mut instrument = rm
            .open(&id, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|e| DaqError::open(resource, e))?;
        let timeout_ms = timeout_millis(settings.timeout);
        instrument
            .set_timeout(timeout_ms)
            .map_err(|e| {
                DaqError::open(resource, format!("cannot set timeout to {timeout_ms} ms: {e}"))
            })?;

        debug!(resource = %resource, timeout_ms, "VISA session opened");
        Ok(Self {
            settings: settings.clone(),
            session: Some((rm, instrument)),
        })
    }

    /// Opens a session to `settings.resource`.
    #[cfg(not(feature = "instrument_visa"))]
    pub fn open(settings: &VisaSettings) -> AppResult<Self> {
        let _ = settings;
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

#[cfg(feature = "instrument_visa")]
impl Transport for VisaSession {
    fn resource(&self) -> &str {
        &self.settings.resource
    }

    fn write_line(&mut self, message: &str) -> AppResult<()> {
        let (_, instrument) = self.session.as_mut().ok_or(DaqError::NotConnected)?;
        let framed = format!("{}{}", message, self.settings.line_terminator);
        instrument.write_all(framed.as_bytes())?;
        debug!(resource = %self.settings.resource, command = message, "VISA write");
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        let (_, instrument) = self.session.as_mut().ok_or(DaqError::NotConnected)?;
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match instrument.read(&mut byte)? {
                0 => break,
                _ => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    raw.push(byte[0]);
                }
            }
        }
        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        debug!(resource = %self.settings.resource, response = %line, "VISA read");
        Ok(line)
    }

    fn close(&mut self) -> AppResult<()> {
        if self.session.take().is_some() {
            debug!(resource = %self.settings.resource, "VISA session closed");
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl Transport for VisaSession {
    fn resource(&self) -> &str {
        &self.settings.resource
    }

    fn write_line(&mut self, _message: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    fn read_line(&mut self) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_settings_defaults() {
        let settings = VisaSettings::new("GPIB0::22::INSTR");
        assert_eq!(settings.resource, "GPIB0::22::INSTR");
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.line_terminator, "\n");
    }

    #[test]
    fn test_visa_settings_builder() {
        let settings = VisaSettings::new("TCPIP0::192.168.1.100::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r\n");
        assert_eq!(settings.timeout, Duration::from_millis(2000));
        assert_eq!(settings.line_terminator, "\r\n");
    }

    #[test]
    fn test_timeout_in_milliseconds() {
        assert_eq!(timeout_millis(Duration::from_secs(2)), 2000);
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 1);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_open_without_feature() {
        let result = VisaSession::open(&VisaSettings::new("GPIB0::22::INSTR"));
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(_))));
    }
}
