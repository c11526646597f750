//! KEITHLEY 6487 picoammeter / voltage source.
//!
//! One controller per channel, each with its own bus session. A read
//! triggers a measurement and fetches it; the instrument blocks for the
//! integration time, which paces the acquisition loop.
//!
//! ```text
//! -> INIT
//! -> FETCh?         <- +1.234567E-12A,+4.000000E+01,+0.000000E+00
//! -> SOUR:VOLT 10
//! -> SOUR:VOLT:STAT ON
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [[devices]]
//! name = "keithley"
//! kind = "keithley6487"
//! interval = "500ms"
//!
//! [[devices.channels]]
//! name = "Faraday cup"
//! address = "GPIB0::22::INSTR"
//! voltage = 0.0
//! ```

use super::{parse_number, Protocol, WriteCommand};
use crate::channel::{ChannelPlan, ChannelSpec};
use crate::error::{AppResult, DaqError};
use crate::simulation::TestSignalSource;
use crate::transport::Transport;
use tracing::debug;

/// Amperes to picoamperes.
const PICO: f64 = 1e12;

/// Commands sent after reset to set up current measurement.
const SETUP: [&str; 3] = ["SYST:ZCH OFF", "CURR:NPLC 6", "SOUR:VOLT:RANG 50"];

/// KEITHLEY 6487 protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct Keithley6487;

/// Parses a `FETCh?` answer into pA: first field, unit suffix dropped.
pub fn parse_current(response: &str) -> AppResult<f64> {
    let reading = response.split(',').next().unwrap_or_default().trim();
    let mut chars = reading.chars();
    if chars.next_back().is_none() {
        return Err(DaqError::read(format!("Empty current reading in '{response}'")));
    }
    Ok(parse_number(chars.as_str(), response)? * PICO)
}

impl Protocol for Keithley6487 {
    fn label(&self) -> &'static str {
        "KEITHLEY 6487"
    }

    fn handshake(&mut self, transport: &mut dyn Transport, _plan: &ChannelPlan) -> AppResult<()> {
        transport.write_line("*RST")?;
        let identity = transport.query("*IDN?")?;
        if identity.is_empty() {
            return Err(DaqError::read("Instrument did not identify itself."));
        }
        debug!(identity = %identity, "KEITHLEY identified");
        for command in SETUP {
            transport.write_line(command)?;
        }
        Ok(())
    }

    fn read_channel(
        &mut self,
        transport: &mut dyn Transport,
        _channel: &ChannelSpec,
    ) -> AppResult<f64> {
        transport.write_line("INIT")?;
        let response = transport.query("FETCh?")?;
        parse_current(&response)
    }

    fn write(&mut self, transport: &mut dyn Transport, command: &WriteCommand) -> AppResult<()> {
        let line = match command {
            WriteCommand::Voltage(volts) => format!("SOUR:VOLT {volts}"),
            WriteCommand::Output(on) => {
                format!("SOUR:VOLT:STAT {}", if *on { "ON" } else { "OFF" })
            }
        };
        transport.write_line(&line)
    }

    fn close_commands(&self) -> Vec<WriteCommand> {
        vec![WriteCommand::Output(false)]
    }

    fn simulate(
        &mut self,
        source: &mut TestSignalSource,
        _channel: &ChannelSpec,
        _previous: f64,
    ) -> f64 {
        source.current()
    }

    fn paces_itself(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, ChargeAccumulator};
    use crate::transport::MockTransport;

    #[test]
    fn test_parse_current() {
        let pa = parse_current("+1.234567E-12A,+4.000000E+01,+0.000000E+00").expect("parse");
        assert!((pa - 1.234567).abs() < 1e-9);
        assert!(parse_current("").is_err());
        assert!(parse_current("garbage,1").is_err());
    }

    #[test]
    fn test_handshake_sequence() {
        let mock = MockTransport::new("GPIB0::22::INSTR");
        mock.respond("*IDN?", &["KEITHLEY INSTRUMENTS INC.,MODEL 6487,1234,A01"]);
        let mut link = mock.open().expect("open");
        Keithley6487.handshake(&mut link, &Vec::new()).expect("handshake");
        assert_eq!(
            mock.written(),
            vec!["*RST", "*IDN?", "SYST:ZCH OFF", "CURR:NPLC 6", "SOUR:VOLT:RANG 50"]
        );
    }

    #[test]
    fn test_read_and_write() {
        let mock = MockTransport::new("GPIB0::22::INSTR");
        mock.respond("FETCh?", &["-2.5E-12A,+0.0,+0.0"]);
        let mut link = mock.open().expect("open");
        let spec = ChannelSpec {
            index: 0,
            name: "I1".into(),
            participates: true,
            kind: ChannelKind::Current {
                address: "GPIB0::22::INSTR".into(),
                voltage: 0.0,
                charge: ChargeAccumulator::default(),
            },
        };
        let pa = Keithley6487.read_channel(&mut link, &spec).expect("read");
        assert!((pa + 2.5).abs() < 1e-9);

        Keithley6487
            .write(&mut link, &WriteCommand::Voltage(10.0))
            .expect("voltage");
        Keithley6487
            .write(&mut link, &WriteCommand::Output(true))
            .expect("output");
        assert_eq!(
            mock.written(),
            vec!["INIT", "FETCh?", "SOUR:VOLT 10", "SOUR:VOLT:STAT ON"]
        );
        assert_eq!(Keithley6487.close_commands(), vec![WriteCommand::Output(false)]);
        assert!(Keithley6487.paces_itself());
    }
}
