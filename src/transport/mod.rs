//! Physical communication channels.
//!
//! A [`Transport`] is the blocking, line-oriented link to one instrument: a
//! serial port, an instrument-bus session, or a vendor handle bridged to the
//! same interface. It is exclusively owned by one controller and only ever
//! touched while that controller's lock is held, so implementations need to
//! be `Send` but not `Sync`.
//!
//! Which implementation a device uses is decided at configuration time by a
//! [`TransportSpec`].

pub mod mock;
pub mod serial;
pub mod visa;

pub use mock::MockTransport;
pub use serial::{SerialLine, SerialSettings};
pub use visa::{VisaSession, VisaSettings};

use crate::error::AppResult;

/// Blocking command/response link to one instrument.
///
/// `write_line` appends the transport's line terminator; `read_line` returns
/// one response with trailing line-ending characters stripped.
pub trait Transport: Send {
    /// Resource name for diagnostics (port name, bus address).
    fn resource(&self) -> &str;

    /// Sends one command.
    fn write_line(&mut self, message: &str) -> AppResult<()>;

    /// Reads one response line, bounded by the transport's own timeout.
    fn read_line(&mut self) -> AppResult<String>;

    /// Sends a command and reads its response.
    fn query(&mut self, message: &str) -> AppResult<String> {
        self.write_line(message)?;
        self.read_line()
    }

    /// Releases the underlying resource. Further calls fail with `NotConnected`.
    fn close(&mut self) -> AppResult<()>;
}

/// How a device reaches its hardware.
#[derive(Clone, Debug)]
pub enum TransportSpec {
    /// RS-232 / USB-serial line.
    Serial(SerialSettings),
    /// Instrument bus (GPIB, USB-TMC, LXI) via VISA.
    Visa(VisaSettings),
    /// Scripted in-process stand-in.
    Mock(MockTransport),
}

impl TransportSpec {
    /// Opens the link described by this spec.
    pub fn open(&self) -> AppResult<Box<dyn Transport>> {
        match self {
            TransportSpec::Serial(settings) => Ok(Box::new(SerialLine::open(settings)?)),
            TransportSpec::Visa(settings) => Ok(Box::new(VisaSession::open(settings)?)),
            TransportSpec::Mock(mock) => Ok(Box::new(mock.open()?)),
        }
    }

    /// Resource name, for diagnostics before the link is open.
    pub fn resource(&self) -> &str {
        match self {
            TransportSpec::Serial(settings) => &settings.port,
            TransportSpec::Visa(settings) => &settings.resource,
            TransportSpec::Mock(mock) => mock.resource(),
        }
    }
}
