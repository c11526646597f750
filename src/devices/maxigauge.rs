//! Pfeiffer MaxiGauge (TPG 366) pressure controller.
//!
//! Every request is a mnemonic answered by an acknowledgment; the data is
//! then requested with an enquiry character:
//!
//! ```text
//! -> PR1<CR>        <- <ACK><CR><LF>
//! -> <ENQ><CR>      <- 0,1.5000E-07<CR><LF>
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [[devices]]
//! name = "maxigauge"
//! kind = "maxigauge"
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! interval = "1s"
//!
//! [[devices.channels]]
//! name = "Load lock"
//! gauge = 1
//! ```

use super::{parse_number, Protocol};
use crate::channel::{ChannelKind, ChannelPlan, ChannelSpec};
use crate::error::{AppResult, DaqError};
use crate::simulation::TestSignalSource;
use crate::transport::Transport;
use tracing::debug;

const ACK: char = '\u{6}';
const NAK: char = '\u{15}';
const ENQUIRY: &str = "\u{5}";

/// MaxiGauge protocol. Stateless; readings are in mbar as set on the unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaxiGauge;

impl MaxiGauge {
    /// Sends `mnemonic`, checks the acknowledgment and fetches the answer.
    fn write_read(transport: &mut dyn Transport, mnemonic: &str) -> AppResult<String> {
        let ack = transport.query(mnemonic)?;
        if ack.starts_with(NAK) {
            return Err(DaqError::read(format!("'{mnemonic}' not acknowledged")));
        }
        if !ack.starts_with(ACK) {
            debug!(mnemonic, response = %ack.escape_debug(), "unexpected acknowledgment");
        }
        transport.query(ENQUIRY)
    }
}

/// Meaning of the status field of a pressure reading.
pub fn status_text(status: u8) -> &'static str {
    match status {
        0 => "Measurement data okay",
        1 => "Underrange",
        2 => "Overrange",
        3 => "Sensor error",
        4 => "Sensor off",
        5 => "No sensor",
        6 => "Identification error",
        _ => "Unknown status",
    }
}

/// Parses `status,value`. A non-zero status is a read failure.
pub fn parse_pressure(response: &str) -> AppResult<f64> {
    let (status, value) = response
        .split_once(',')
        .ok_or_else(|| DaqError::read(format!("Failed to parse pressure from '{response}'")))?;
    let status: u8 = status
        .trim()
        .parse()
        .map_err(|e| DaqError::read(format!("Failed to parse status from '{response}': {e}")))?;
    if status != 0 {
        return Err(DaqError::read(status_text(status)));
    }
    parse_number(value, response)
}

impl Protocol for MaxiGauge {
    fn label(&self) -> &'static str {
        "MaxiGauge"
    }

    fn handshake(&mut self, transport: &mut dyn Transport, _plan: &ChannelPlan) -> AppResult<()> {
        let status = Self::write_read(transport, "TID")?;
        if status.is_empty() {
            return Err(DaqError::read("TPG did not return status."));
        }
        debug!(status = %status, "MaxiGauge identification");
        Ok(())
    }

    fn read_channel(
        &mut self,
        transport: &mut dyn Transport,
        channel: &ChannelSpec,
    ) -> AppResult<f64> {
        let ChannelKind::Pressure { gauge } = channel.kind else {
            return Err(DaqError::read(format!("'{}' is not a pressure channel", channel.name)));
        };
        let response = Self::write_read(transport, &format!("PR{gauge}"))?;
        parse_pressure(&response)
    }

    fn simulate(
        &mut self,
        source: &mut TestSignalSource,
        _channel: &ChannelSpec,
        previous: f64,
    ) -> f64 {
        source.pressure(previous)
    }
}
