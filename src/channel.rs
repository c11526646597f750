//! Measurement and control points.
//!
//! A [`Channel`] lives inside its [`Device`](crate::devices::Device) on the
//! owning thread. Workers never see it: they read from an immutable
//! [`ChannelPlan`] snapshot and publish values through the update queue, and
//! only [`Channel::apply_value`] (called while dispatching on the owner)
//! changes `value`.

use std::time::{Duration, Instant};

/// Seconds per hour, for charge in pAh.
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Integrates a current into a charge, skipping undefined samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChargeAccumulator {
    charge: f64,
}

impl ChargeAccumulator {
    /// Adds `(value - background) * dt` in pAh.
    ///
    /// `NaN` and infinite readings contribute nothing.
    pub fn accumulate(&mut self, value: f64, background: f64, dt: Duration) {
        if !value.is_finite() {
            return;
        }
        self.charge += (value - background) * dt.as_secs_f64() / SECONDS_PER_HOUR;
    }

    /// Accumulated charge in pAh.
    pub fn charge(&self) -> f64 {
        self.charge
    }

    /// Sets the accumulated charge back to zero.
    pub fn reset(&mut self) {
        self.charge = 0.0;
    }
}

/// Device-specific fields of a channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelKind {
    /// Pressure gauge attached to a controller port.
    Pressure {
        /// Gauge index on the controller.
        gauge: u8,
    },
    /// Resistance thermometer on a data logger.
    Temperature {
        /// Sensor slot, 1-based.
        sensor: u8,
        /// 2, 3 or 4 wire connection.
        wires: u8,
    },
    /// Picoammeter with a voltage source, one instrument per channel.
    Current {
        /// Bus address (e.g. "GPIB0::22::INSTR").
        address: String,
        /// Source voltage to apply.
        voltage: f64,
        /// Integrated charge.
        charge: ChargeAccumulator,
    },
}

/// One measurement or control point.
#[derive(Clone, Debug)]
pub struct Channel {
    /// Display name.
    pub name: String,
    /// Latest reading; `NaN` is undefined or error.
    pub value: f64,
    /// Shown and recorded.
    pub enabled: bool,
    /// Participates in acquisition.
    pub active: bool,
    /// Backed by hardware rather than derived.
    pub real: bool,
    /// Baseline subtracted for corrected readings.
    pub background: f64,
    /// Device-specific fields.
    pub kind: ChannelKind,
    last_update: Option<Instant>,
}

impl Channel {
    /// New enabled, active, real channel with an undefined value.
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            value: f64::NAN,
            enabled: true,
            active: true,
            real: true,
            background: 0.0,
            kind,
            last_update: None,
        }
    }

    /// Applies a published reading. Owner thread only.
    ///
    /// For current channels the reading is integrated over the time since
    /// the previous update.
    pub fn apply_value(&mut self, value: f64, at: Instant) {
        let dt = self
            .last_update
            .map(|previous| at.saturating_duration_since(previous))
            .unwrap_or_default();
        self.value = value;
        self.last_update = Some(at);
        let background = self.background;
        if let ChannelKind::Current { charge, .. } = &mut self.kind {
            charge.accumulate(value, background, dt);
        }
    }

    /// Forgets the previous sample time so the next reading adds no charge.
    ///
    /// Called whenever acquisition stops or starts, so an idle gap is never
    /// integrated.
    pub fn restart_integration(&mut self) {
        self.last_update = None;
    }

    /// Marks the value undefined, e.g. after the controller closed.
    pub fn invalidate(&mut self) {
        self.value = f64::NAN;
        self.last_update = None;
    }

    /// `value - background`.
    pub fn background_corrected(&self) -> f64 {
        self.value - self.background
    }

    /// Accumulated charge for current channels.
    pub fn charge(&self) -> Option<f64> {
        match &self.kind {
            ChannelKind::Current { charge, .. } => Some(charge.charge()),
            _ => None,
        }
    }

    /// Resets accumulated charge; no-op for other kinds.
    pub fn reset_charge(&mut self) {
        if let ChannelKind::Current { charge, .. } = &mut self.kind {
            charge.reset();
        }
    }

    /// True if the worker should read this channel.
    pub fn participates(&self) -> bool {
        self.enabled && self.active
    }
}

/// Immutable per-channel input to a read cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSpec {
    /// Position in the device's channel list.
    pub index: usize,
    /// Name, for diagnostics.
    pub name: String,
    /// Whether the channel is read at all.
    pub participates: bool,
    /// Device-specific fields at the time of the snapshot.
    pub kind: ChannelKind,
}

/// Snapshot of the channels one controller serves.
pub type ChannelPlan = Vec<ChannelSpec>;

/// Builds the plan for the channels at `indices`.
pub fn plan_for(channels: &[Channel], indices: &[usize]) -> ChannelPlan {
    indices
        .iter()
        .filter_map(|&index| {
            channels.get(index).map(|channel| ChannelSpec {
                index,
                name: channel.name.clone(),
                participates: channel.participates(),
                kind: channel.kind.clone(),
            })
        })
        .collect()
}
