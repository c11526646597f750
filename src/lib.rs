//! Device-controller framework for laboratory instruments.
//!
//! Every instrument sits behind a [`controller::DeviceController`]: it opens
//! the transport on a background thread, polls channels on a worker, applies
//! writes without blocking the caller and closes within a bounded time. All
//! results travel back as [`controller::Envelope`]s to the thread driving the
//! [`manager::DeviceManager`], the only place channel values change.
//!
//! Supported instruments live in [`devices`]: Pfeiffer MaxiGauge, Edwards TIC,
//! Pico PT-104 and KEITHLEY 6487. Without hardware, test mode synthesizes
//! plausible readings from [`simulation::TestSignalSource`].

pub mod channel;
pub mod config;
pub mod controller;
pub mod devices;
pub mod diagnostics;
pub mod error;
pub mod lock;
pub mod manager;
pub mod simulation;
pub mod transport;

pub use channel::{Channel, ChannelKind};
pub use config::Settings;
pub use controller::{ControllerOptions, ControllerState, DeviceController};
pub use devices::{Device, DeviceKind, DeviceSpec};
pub use error::{AppResult, DaqError};
pub use manager::DeviceManager;
