//! Instrument plugins.
//!
//! A [`Device`] composes its [`Channel`]s with one or more
//! [`DeviceController`]s and the [`Protocol`] that turns channel reads and
//! writes into transport traffic. The set of protocols is closed and chosen
//! at configuration time through [`DeviceKind`]:
//!
//! | Kind | Instrument | Transport | Controllers |
//! |---|---|---|---|
//! | `maxigauge` | Pfeiffer MaxiGauge TPG | serial | one per device |
//! | `tic` | Edwards TIC | serial, XON/XOFF | one per device |
//! | `pt104` | Pico PT-104 | vendor bridge | one per device |
//! | `keithley6487` | KEITHLEY 6487 picoammeter | VISA | one per channel |

pub mod keithley;
pub mod maxigauge;
pub mod pico;
pub mod tic;

pub use keithley::Keithley6487;
pub use maxigauge::MaxiGauge;
pub use pico::Pt104;
pub use tic::Tic;

use crate::channel::{plan_for, Channel, ChannelKind, ChannelPlan, ChannelSpec};
use crate::controller::{ControllerContext, ControllerId, DeviceController, Envelope, Handled};
use crate::error::{AppResult, DaqError};
use crate::simulation::TestSignalSource;
use crate::transport::{SerialSettings, Transport, TransportSpec, VisaSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// A value written to a device.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteCommand {
    /// Source voltage in V.
    Voltage(f64),
    /// Output stage on or off.
    Output(bool),
}

impl fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCommand::Voltage(volts) => write!(f, "voltage {volts} V"),
            WriteCommand::Output(true) => f.write_str("output on"),
            WriteCommand::Output(false) => f.write_str("output off"),
        }
    }
}

/// Device-specific link behavior. Every call runs with the controller's lock held.
pub trait Protocol: Send {
    /// Short name for diagnostics.
    fn label(&self) -> &'static str;

    /// Opens the transport for this device.
    fn open(&self, transport: &TransportSpec) -> AppResult<Box<dyn Transport>> {
        transport.open()
    }

    /// Verifies the instrument answers and configures it for `plan`.
    fn handshake(&mut self, transport: &mut dyn Transport, plan: &ChannelPlan) -> AppResult<()>;

    /// Reads one channel. Errors become `NaN` for that channel.
    fn read_channel(
        &mut self,
        transport: &mut dyn Transport,
        channel: &ChannelSpec,
    ) -> AppResult<f64>;

    /// Applies `command`. Read-only instruments reject every command.
    fn write(&mut self, transport: &mut dyn Transport, command: &WriteCommand) -> AppResult<()> {
        let _ = transport;
        Err(DaqError::write(format!("{} does not accept {command}", self.label())))
    }

    /// Writes applied, under the close lock, before [`Protocol::close`].
    fn close_commands(&self) -> Vec<WriteCommand> {
        Vec::new()
    }

    /// Device-specific teardown before the transport is dropped.
    fn close(&mut self, transport: &mut dyn Transport) -> AppResult<()> {
        let _ = transport;
        Ok(())
    }

    /// Simulated reading for `channel`, given its previous value.
    fn simulate(
        &mut self,
        source: &mut TestSignalSource,
        channel: &ChannelSpec,
        previous: f64,
    ) -> f64;

    /// True if a read blocks long enough to pace the loop by itself.
    fn paces_itself(&self) -> bool {
        false
    }
}

/// The supported instruments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Pfeiffer MaxiGauge pressure controller.
    MaxiGauge,
    /// Edwards TIC vacuum controller.
    Tic,
    /// Pico PT-104 platinum resistance data logger.
    Pt104,
    /// KEITHLEY 6487 picoammeter with voltage source.
    Keithley6487,
}

impl DeviceKind {
    /// Fresh protocol instance for one controller.
    pub fn protocol(self) -> Box<dyn Protocol> {
        match self {
            DeviceKind::MaxiGauge => Box::new(MaxiGauge),
            DeviceKind::Tic => Box::new(Tic),
            DeviceKind::Pt104 => Box::new(Pt104),
            DeviceKind::Keithley6487 => Box::new(Keithley6487),
        }
    }

    /// True if every channel gets its own controller and transport.
    pub fn controller_per_channel(self) -> bool {
        matches!(self, DeviceKind::Keithley6487)
    }

    /// True if the device has a switchable output.
    pub fn has_output(self) -> bool {
        matches!(self, DeviceKind::Keithley6487)
    }

    /// True if `kind` is a channel this device can serve.
    pub fn accepts(self, kind: &ChannelKind) -> bool {
        matches!(
            (self, kind),
            (DeviceKind::MaxiGauge | DeviceKind::Tic, ChannelKind::Pressure { .. })
                | (DeviceKind::Pt104, ChannelKind::Temperature { .. })
                | (DeviceKind::Keithley6487, ChannelKind::Current { .. })
        )
    }

    /// Line settings the instrument expects on `port`.
    pub fn serial_settings(self, port: &str, baud_rate: u32) -> SerialSettings {
        match self {
            DeviceKind::MaxiGauge => {
                SerialSettings::new(port, baud_rate).with_line_terminator("\r")
            }
            DeviceKind::Tic => SerialSettings::new(port, baud_rate)
                .with_line_terminator("\r")
                .with_response_delimiter(b'\r')
                .with_software_flow_control(true),
            DeviceKind::Pt104 | DeviceKind::Keithley6487 => {
                SerialSettings::new(port, baud_rate).with_line_terminator("\n")
            }
        }
    }

    /// Transport for one controller: VISA at `address` for the picoammeter,
    /// a serial line on `port` otherwise.
    pub fn transport(
        self,
        port: &str,
        baud_rate: u32,
        address: Option<&str>,
        timeout: Duration,
    ) -> TransportSpec {
        match (self, address) {
            (DeviceKind::Keithley6487, Some(address)) => {
                TransportSpec::Visa(VisaSettings::new(address).with_timeout(timeout))
            }
            _ => TransportSpec::Serial(self.serial_settings(port, baud_rate).with_timeout(timeout)),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::MaxiGauge => "maxigauge",
            DeviceKind::Tic => "tic",
            DeviceKind::Pt104 => "pt104",
            DeviceKind::Keithley6487 => "keithley6487",
        };
        f.write_str(name)
    }
}

/// Everything needed to build a [`Device`].
#[derive(Clone, Debug)]
pub struct DeviceSpec {
    /// Unique device name.
    pub name: String,
    /// Which instrument.
    pub kind: DeviceKind,
    /// Disabled devices never initialize.
    pub enabled: bool,
    /// Polling interval.
    pub interval: Duration,
    /// Channels in display order.
    pub channels: Vec<Channel>,
    /// One transport per controller.
    pub transports: Vec<TransportSpec>,
}

impl DeviceSpec {
    /// Enabled device with no channels yet.
    pub fn new(name: impl Into<String>, kind: DeviceKind, interval: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            interval,
            channels: Vec::new(),
            transports: Vec::new(),
        }
    }

    /// Appends a channel.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channels.push(channel);
        self
    }

    /// Appends a controller transport.
    pub fn with_transport(mut self, transport: TransportSpec) -> Self {
        self.transports.push(transport);
        self
    }

    /// Sets the enabled flag.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

struct Slot {
    controller: DeviceController,
    channels: Vec<usize>,
}

/// One instrument: its channels and the controllers serving them.
pub struct Device {
    name: String,
    kind: DeviceKind,
    enabled: bool,
    on: bool,
    test_mode: bool,
    channels: Vec<Channel>,
    slots: Vec<Slot>,
}

impl Device {
    /// Builds the device and its controllers.
    ///
    /// Fails if there are no channels, a channel does not fit the device
    /// kind, or the number of transports does not match the controllers.
    pub fn new(spec: DeviceSpec, context: &ControllerContext) -> AppResult<Self> {
        let DeviceSpec {
            name,
            kind,
            enabled,
            interval,
            channels,
            transports,
        } = spec;
        if channels.is_empty() {
            return Err(DaqError::Configuration(format!("device '{name}' has no channels")));
        }
        if let Some(channel) = channels.iter().find(|channel| !kind.accepts(&channel.kind)) {
            return Err(DaqError::Configuration(format!(
                "channel '{}' does not fit {kind} device '{name}'",
                channel.name
            )));
        }

        let groups: Vec<Vec<usize>> = if kind.controller_per_channel() {
            (0..channels.len()).map(|index| vec![index]).collect()
        } else {
            vec![(0..channels.len()).collect()]
        };
        if groups.len() != transports.len() {
            return Err(DaqError::Configuration(format!(
                "device '{name}' needs {} transport(s), got {}",
                groups.len(),
                transports.len()
            )));
        }

        let slots = groups
            .into_iter()
            .zip(transports)
            .enumerate()
            .map(|(index, (group, transport))| {
                let id = ControllerId::new(name.as_str(), index);
                let mut controller =
                    DeviceController::new(id, kind.protocol(), transport, interval, context);
                controller.set_plan(plan_for(&channels, &group));
                Slot {
                    controller,
                    channels: group,
                }
            })
            .collect();

        Ok(Self {
            name,
            kind,
            enabled,
            on: false,
            test_mode: context.options.test_mode,
            channels,
            slots,
        })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument kind.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Whether the device takes part in initialization.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Requested output state.
    pub fn is_on(&self) -> bool {
        self.on
    }

    /// All channels.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Channel by name.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.name == name)
    }

    /// Mutable channel by name, for flags and background.
    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|channel| channel.name == name)
    }

    /// Controllers in slot order.
    pub fn controllers(&self) -> impl Iterator<Item = &DeviceController> {
        self.slots.iter().map(|slot| &slot.controller)
    }

    /// Controller serving the channel at `index`.
    pub fn controller_for(&self, index: usize) -> Option<&DeviceController> {
        self.slots
            .iter()
            .find(|slot| slot.channels.contains(&index))
            .map(|slot| &slot.controller)
    }

    /// Starts initialization on every controller that is allowed to run.
    pub fn initialize_communication(&mut self) {
        for index in 0..self.slots.len() {
            let gate = self.init_gate(index);
            let plan = plan_for(&self.channels, &self.slots[index].channels);
            self.restart_integration(index);
            let controller = &mut self.slots[index].controller;
            controller.set_plan(plan);
            controller.initialize_communication(gate);
        }
    }

    /// Starts acquisition on every initialized controller.
    pub fn start_acquisition(&mut self) {
        for index in 0..self.slots.len() {
            let active = self.acquisition_gate(index);
            let plan = plan_for(&self.channels, &self.slots[index].channels);
            self.restart_integration(index);
            let controller = &mut self.slots[index].controller;
            controller.set_plan(plan);
            controller.start_acquisition(active);
        }
    }

    /// Stops acquisition on every controller without waiting.
    ///
    /// Charge integration restarts with the first reading after the next start.
    pub fn stop_acquisition(&mut self) {
        for index in 0..self.slots.len() {
            self.restart_integration(index);
            self.slots[index].controller.stop_acquisition();
        }
    }

    /// Turns the output off (if any), closes every controller and marks
    /// the channel values undefined. Accumulated charge is kept.
    pub fn close_communication(&mut self) {
        if self.kind.has_output() {
            self.on = false;
        }
        for slot in &mut self.slots {
            slot.controller.close_communication();
        }
        for channel in &mut self.channels {
            channel.invalidate();
        }
    }

    /// Sets the source voltage of the channel `name` and writes it if connected.
    pub fn apply_value(&mut self, name: &str, volts: f64) -> AppResult<()> {
        let index = self
            .channels
            .iter()
            .position(|channel| channel.name == name)
            .ok_or_else(|| {
                DaqError::Configuration(format!("no channel '{name}' on '{}'", self.name))
            })?;
        match &mut self.channels[index].kind {
            ChannelKind::Current { voltage, .. } => *voltage = volts,
            _ => {
                return Err(DaqError::write(format!(
                    "channel '{name}' of {} device '{}' has no settable value",
                    self.kind, self.name
                )))
            }
        }
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.channels.contains(&index)) {
            slot.controller.apply_value(WriteCommand::Voltage(volts));
        }
        Ok(())
    }

    /// Switches the output of every controller.
    ///
    /// Switching on applies each channel's source voltage first.
    pub fn set_on(&mut self, on: bool) {
        if !self.kind.has_output() {
            return;
        }
        self.on = on;
        info!(device = %self.name, on, "output switched");
        for index in 0..self.slots.len() {
            let commands = self.output_commands(index, on, on);
            self.slots[index].controller.apply_values(commands);
        }
    }

    /// Dispatches one update to the controller it came from.
    pub fn handle(&mut self, envelope: Envelope) -> Handled {
        let index = envelope.controller.slot;
        if index >= self.slots.len() {
            return Handled::Stale;
        }
        let handled = self.slots[index].controller.handle(envelope, &mut self.channels);
        match handled {
            Handled::InitComplete => {
                let active = self.acquisition_gate(index);
                let commands = if self.kind.has_output() {
                    self.output_commands(index, true, self.on)
                } else {
                    Vec::new()
                };
                let controller = &mut self.slots[index].controller;
                controller.init_complete(active);
                controller.apply_values(commands);
            }
            Handled::CommunicationLost => self.restart_integration(index),
            _ => {}
        }
        handled
    }

    /// True if any controller finished initialization.
    pub fn initialized(&self) -> bool {
        self.controllers().any(|controller| controller.state().is_initialized())
    }

    /// Channels that deliver values: enabled and connected (or simulated),
    /// plus inactive channels.
    pub fn initialized_channels(&self) -> Vec<&Channel> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(index, channel)| {
                let backed = self.controller_for(*index).is_some_and(|controller| {
                    controller.has_transport()
                        || (self.test_mode && controller.state().is_initialized())
                });
                (channel.enabled && backed) || !channel.active
            })
            .map(|(_, channel)| channel)
            .collect()
    }

    /// Zeroes the accumulated charge of every channel.
    pub fn reset_charge(&mut self) {
        for channel in &mut self.channels {
            channel.reset_charge();
        }
    }

    /// Waits up to `timeout` for writer threads of every controller.
    pub fn wait_for_writes(&mut self, timeout: Duration) -> bool {
        self.slots
            .iter_mut()
            .fold(true, |done, slot| slot.controller.wait_for_writes(timeout) && done)
    }

    /// Source voltages of the slot's channels (if `with_voltage`), then the output switch.
    fn output_commands(&self, index: usize, with_voltage: bool, on: bool) -> Vec<WriteCommand> {
        let mut commands: Vec<WriteCommand> = if with_voltage {
            self.slots[index]
                .channels
                .iter()
                .filter_map(|&channel| match self.channels.get(channel).map(|c| &c.kind) {
                    Some(ChannelKind::Current { voltage, .. }) => {
                        Some(WriteCommand::Voltage(*voltage))
                    }
                    _ => None,
                })
                .collect()
        } else {
            Vec::new()
        };
        commands.push(WriteCommand::Output(on));
        commands
    }

    fn restart_integration(&mut self, index: usize) {
        for &channel in &self.slots[index].channels {
            if let Some(channel) = self.channels.get_mut(channel) {
                channel.restart_integration();
            }
        }
    }

    fn init_gate(&self, index: usize) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.kind.controller_per_channel() {
            return true;
        }
        self.slots[index]
            .channels
            .iter()
            .filter_map(|&channel| self.channels.get(channel))
            .all(|channel| channel.enabled && channel.active && channel.real)
    }

    fn acquisition_gate(&self, index: usize) -> bool {
        if !self.kind.controller_per_channel() {
            return true;
        }
        self.slots[index]
            .channels
            .iter()
            .filter_map(|&channel| self.channels.get(channel))
            .all(Channel::participates)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("channels", &self.channels.len())
            .field("controllers", &self.slots.len())
            .finish()
    }
}

/// Parses a floating point field, naming the whole response on failure.
pub(crate) fn parse_number(field: &str, response: &str) -> AppResult<f64> {
    field
        .trim()
        .parse::<f64>()
        .map_err(|e| DaqError::read(format!("Failed to parse value from '{response}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChargeAccumulator;
    use crate::controller::{update_channel, ControllerOptions};
    use crate::diagnostics::MemorySink;
    use crate::transport::MockTransport;
    use std::sync::Arc;

    fn context() -> ControllerContext {
        let (updates, _rx) = update_channel();
        ControllerContext {
            options: ControllerOptions::simulation(),
            updates,
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn current(name: &str) -> Channel {
        Channel::new(
            name,
            ChannelKind::Current {
                address: format!("GPIB0::{name}::INSTR"),
                voltage: 0.0,
                charge: ChargeAccumulator::default(),
            },
        )
    }

    #[test]
    fn test_kind_parsing_and_display() {
        let kind: DeviceKind = serde::Deserialize::deserialize(serde::de::value::StrDeserializer::<
            serde::de::value::Error,
        >::new("keithley6487"))
        .expect("kind");
        assert_eq!(kind, DeviceKind::Keithley6487);
        assert_eq!(DeviceKind::MaxiGauge.to_string(), "maxigauge");
    }

    #[test]
    fn test_per_channel_controllers() {
        let spec = DeviceSpec::new("ammeter", DeviceKind::Keithley6487, Duration::from_millis(100))
            .with_channel(current("I1"))
            .with_channel(current("I2"))
            .with_transport(TransportSpec::Mock(MockTransport::new("a")))
            .with_transport(TransportSpec::Mock(MockTransport::new("b")));
        let device = Device::new(spec, &context()).expect("device");
        assert_eq!(device.controllers().count(), 2);
        assert_eq!(device.controller_for(1).map(|c| c.id().slot), Some(1));
    }

    #[test]
    fn test_transport_count_mismatch() {
        let spec = DeviceSpec::new("gauge", DeviceKind::MaxiGauge, Duration::from_millis(100))
            .with_channel(Channel::new("P1", ChannelKind::Pressure { gauge: 1 }));
        let err = Device::new(spec, &context()).expect_err("no transport");
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_channel_kind_mismatch() {
        let spec = DeviceSpec::new("gauge", DeviceKind::Tic, Duration::from_millis(100))
            .with_channel(current("I1"))
            .with_transport(TransportSpec::Mock(MockTransport::new("a")));
        assert!(Device::new(spec, &context()).is_err());
    }

    #[test]
    fn test_apply_value_sets_voltage_and_rejects_pressure() {
        let spec = DeviceSpec::new("ammeter", DeviceKind::Keithley6487, Duration::from_millis(100))
            .with_channel(current("I1"))
            .with_transport(TransportSpec::Mock(MockTransport::new("a")));
        let mut device = Device::new(spec, &context()).expect("device");
        device.apply_value("I1", 12.5).expect("apply");
        let voltage = match &device.channel("I1").expect("channel").kind {
            ChannelKind::Current { voltage, .. } => *voltage,
            _ => f64::NAN,
        };
        assert_eq!(voltage, 12.5);
        assert!(device.apply_value("missing", 1.0).is_err());

        let spec = DeviceSpec::new("gauge", DeviceKind::MaxiGauge, Duration::from_millis(100))
            .with_channel(Channel::new("P1", ChannelKind::Pressure { gauge: 1 }))
            .with_transport(TransportSpec::Mock(MockTransport::new("b")));
        let mut gauge = Device::new(spec, &context()).expect("device");
        assert!(matches!(gauge.apply_value("P1", 1.0), Err(DaqError::Write(_))));
    }

    #[test]
    fn test_stop_and_start_skip_idle_charge() {
        let spec = DeviceSpec::new("ammeter", DeviceKind::Keithley6487, Duration::from_millis(100))
            .with_channel(current("I1"))
            .with_transport(TransportSpec::Mock(MockTransport::new("a")));
        let mut device = Device::new(spec, &context()).expect("device");
        let t0 = std::time::Instant::now();
        let sample = |device: &mut Device, value: f64, seconds: u64| {
            device
                .channel_mut("I1")
                .expect("channel")
                .apply_value(value, t0 + Duration::from_secs(seconds));
        };

        sample(&mut device, 2.0, 0);
        sample(&mut device, 2.0, 1);
        let one_interval = device.channel("I1").and_then(Channel::charge).expect("charge");

        device.stop_acquisition();
        device.start_acquisition();
        sample(&mut device, 2.0, 3600);
        assert_eq!(device.channel("I1").and_then(Channel::charge), Some(one_interval));
        sample(&mut device, 2.0, 3601);
        let charge = device.channel("I1").and_then(Channel::charge).expect("charge");
        assert!((charge - 2.0 * one_interval).abs() < 1e-12, "charge was {charge}");
    }

    #[test]
    fn test_output_commands_carry_channel_voltage() {
        let mut channel = current("I1");
        if let ChannelKind::Current { voltage, .. } = &mut channel.kind {
            *voltage = -30.0;
        }
        let spec = DeviceSpec::new("ammeter", DeviceKind::Keithley6487, Duration::from_millis(100))
            .with_channel(channel)
            .with_transport(TransportSpec::Mock(MockTransport::new("a")));
        let device = Device::new(spec, &context()).expect("device");
        assert_eq!(
            device.output_commands(0, true, true),
            vec![WriteCommand::Voltage(-30.0), WriteCommand::Output(true)]
        );
        assert_eq!(device.output_commands(0, false, false), vec![WriteCommand::Output(false)]);
    }

    #[test]
    fn test_serial_settings_per_kind() {
        let tic = DeviceKind::Tic.serial_settings("COM2", 9600);
        assert_eq!(tic.line_terminator, "\r");
        assert_eq!(tic.response_delimiter, b'\r');
        assert!(tic.software_flow_control);
        let tpg = DeviceKind::MaxiGauge.serial_settings("COM1", 9600);
        assert_eq!(tpg.response_delimiter, b'\n');
        assert!(!tpg.software_flow_control);
    }

    #[test]
    fn test_keithley_transport_uses_bus_address() {
        let spec = DeviceKind::Keithley6487.transport(
            "COM1",
            9600,
            Some("GPIB0::22::INSTR"),
            Duration::from_secs(1),
        );
        assert_eq!(spec.resource(), "GPIB0::22::INSTR");
        let spec = DeviceKind::Tic.transport("COM2", 9600, None, Duration::from_secs(1));
        assert_eq!(spec.resource(), "COM2");
    }
}
