//! Pico Technology PT-104 platinum resistance data logger.
//!
//! The logger is driven through the vendor driver, which this crate reaches
//! through a small line bridge exposing the driver calls as text commands:
//!
//! ```text
//! -> INFO?                  <- USB PT-104,<serial>
//! -> CHANNEL 1 PT100 4      (configure sensor 1, four wires)
//! -> VALUE? 1               <- 21500
//! ```
//!
//! Values are raw milli-degrees Celsius. The driver answers `0` while a
//! sensor is still converting after power-up; that is reported as `NaN`.

use super::{parse_number, Protocol};
use crate::channel::{ChannelKind, ChannelPlan, ChannelSpec};
use crate::error::{AppResult, DaqError};
use crate::simulation::TestSignalSource;
use crate::transport::Transport;
use tracing::debug;

/// Offset from degrees Celsius to Kelvin.
pub const CELSIUS_OFFSET: f64 = 273.15;

/// PT-104 protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pt104;

/// Converts a raw reading in milli-degrees Celsius to Kelvin.
pub fn raw_to_kelvin(raw: i64) -> f64 {
    if raw == 0 {
        f64::NAN
    } else {
        raw as f64 / 1000.0 + CELSIUS_OFFSET
    }
}

fn sensor_of(channel: &ChannelSpec) -> AppResult<(u8, u8)> {
    match channel.kind {
        ChannelKind::Temperature { sensor, wires } => Ok((sensor, wires)),
        _ => Err(DaqError::read(format!("'{}' is not a temperature channel", channel.name))),
    }
}

impl Protocol for Pt104 {
    fn label(&self) -> &'static str {
        "PT-104"
    }

    fn handshake(&mut self, transport: &mut dyn Transport, plan: &ChannelPlan) -> AppResult<()> {
        let info = transport.query("INFO?")?;
        if info.is_empty() {
            return Err(DaqError::read("PT-104 did not identify itself."));
        }
        debug!(info = %info, "PT-104 opened");
        for channel in plan {
            let (sensor, wires) = sensor_of(channel)?;
            if !(2..=4).contains(&wires) {
                return Err(DaqError::Configuration(format!(
                    "sensor {sensor} of '{}': {wires} wires not supported",
                    channel.name
                )));
            }
            transport.write_line(&format!("CHANNEL {sensor} PT100 {wires}"))?;
        }
        Ok(())
    }

    fn read_channel(
        &mut self,
        transport: &mut dyn Transport,
        channel: &ChannelSpec,
    ) -> AppResult<f64> {
        let (sensor, _) = sensor_of(channel)?;
        let response = transport.query(&format!("VALUE? {sensor}"))?;
        let raw = parse_number(&response, &response)?;
        Ok(raw_to_kelvin(raw as i64))
    }

    fn simulate(
        &mut self,
        source: &mut TestSignalSource,
        _channel: &ChannelSpec,
        previous: f64,
    ) -> f64 {
        source.temperature(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn spec(sensor: u8, wires: u8) -> ChannelSpec {
        ChannelSpec {
            index: 0,
            name: format!("T{sensor}"),
            participates: true,
            kind: ChannelKind::Temperature { sensor, wires },
        }
    }

    #[test]
    fn test_raw_conversion() {
        assert!(raw_to_kelvin(0).is_nan(), "warm-up reads as undefined");
        assert!((raw_to_kelvin(21_500) - 294.65).abs() < 1e-9);
        assert!((raw_to_kelvin(-196_000) - 77.15).abs() < 1e-9);
    }

    #[test]
    fn test_handshake_configures_sensors() {
        let mock = MockTransport::new("pt104");
        mock.respond("INFO?", &["USB PT-104,AB123/456"]);
        let mut link = mock.open().expect("open");
        Pt104
            .handshake(&mut link, &vec![spec(1, 4), spec(2, 3)])
            .expect("handshake");
        assert_eq!(
            mock.written(),
            vec!["INFO?", "CHANNEL 1 PT100 4", "CHANNEL 2 PT100 3"]
        );
    }

    #[test]
    fn test_handshake_rejects_wiring() {
        let mock = MockTransport::new("pt104");
        mock.respond("INFO?", &["USB PT-104"]);
        let mut link = mock.open().expect("open");
        assert!(Pt104.handshake(&mut link, &vec![spec(1, 5)]).is_err());
    }

    #[test]
    fn test_read_zero_is_nan_not_error() {
        let mock = MockTransport::new("pt104");
        mock.respond_once("VALUE? 1", &["0"]);
        mock.respond("VALUE? 1", &["25000"]);
        let mut link = mock.open().expect("open");
        assert!(Pt104.read_channel(&mut link, &spec(1, 4)).expect("read").is_nan());
        let kelvin = Pt104.read_channel(&mut link, &spec(1, 4)).expect("read");
        assert!((kelvin - 298.15).abs() < 1e-9);
    }
}
