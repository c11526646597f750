//! Edwards TIC vacuum controller.
//!
//! Gauges are queried by object id; the answer carries the pressure in Pa
//! as its second field. Unlike most instruments the TIC terminates its
//! messages with `\r` only.
//!
//! ```text
//! -> ?V913<CR>      <- =V913 1.23e+02;59;11;0;0<CR>
//! ```

use super::{parse_number, Protocol};
use crate::channel::{ChannelKind, ChannelPlan, ChannelSpec};
use crate::error::{AppResult, DaqError};
use crate::simulation::TestSignalSource;
use crate::transport::Transport;
use tracing::debug;

/// Object ids of gauge inputs 0..=5.
pub const GAUGE_IDS: [u16; 6] = [913, 914, 915, 934, 935, 936];

/// Object id of the controller status.
const STATUS_ID: u16 = 902;

/// TIC protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tic;

/// Parses a gauge answer into mbar (1 mbar = 100 Pa).
pub fn parse_pressure(response: &str) -> AppResult<f64> {
    let field = response
        .split([' ', ';'])
        .nth(1)
        .ok_or_else(|| DaqError::read(format!("Failed to parse pressure from '{response}'")))?;
    Ok(parse_number(field, response)? / 100.0)
}

impl Protocol for Tic {
    fn label(&self) -> &'static str {
        "TIC"
    }

    fn handshake(&mut self, transport: &mut dyn Transport, _plan: &ChannelPlan) -> AppResult<()> {
        let status = transport.query(&format!("?V{STATUS_ID}"))?;
        if status.is_empty() {
            return Err(DaqError::read("TIC did not return status."));
        }
        debug!(status = %status, "TIC status");
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
        let id = GAUGE_IDS
            .get(usize::from(gauge))
            .ok_or_else(|| DaqError::read(format!("TIC has no gauge {gauge}")))?;
        let response = transport.query(&format!("?V{id}"))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_parse_pressure() {
        let mbar = parse_pressure("=V913 1.23e+02;59;11;0;0").expect("parse");
        assert!((mbar - 1.23).abs() < 1e-12);
        assert!(parse_pressure("=V913").is_err());
        assert!(parse_pressure("=V913 n/a;59").is_err());
    }

    #[test]
    fn test_read_uses_gauge_object_id() {
        let mock = MockTransport::new("COM2");
        mock.respond("?V934", &["=V934 5.0e-04;59;11;0;0"]);
        let mut link = mock.open().expect("open");
        let spec = ChannelSpec {
            index: 0,
            name: "Chamber".into(),
            participates: true,
            kind: ChannelKind::Pressure { gauge: 3 },
        };
        let value = Tic.read_channel(&mut link, &spec).expect("read");
        assert!((value - 5.0e-6).abs() < 1e-18);

        let out_of_range = ChannelSpec {
            kind: ChannelKind::Pressure { gauge: 9 },
            ..spec
        };
        assert!(Tic.read_channel(&mut link, &out_of_range).is_err());
    }

    #[test]
    fn test_handshake_queries_status() {
        let mock = MockTransport::new("COM2");
        mock.respond("?V902", &["=V902 0;0;0"]);
        let mut link = mock.open().expect("open");
        Tic.handshake(&mut link, &Vec::new()).expect("handshake");
        assert_eq!(mock.written(), vec!["?V902"]);
    }
}
