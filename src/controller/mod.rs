//! The device-controller lifecycle.
//!
//! A [`DeviceController`] owns the link to one instrument and drives it
//! through the [`ControllerState`] machine. It lives on the owning thread;
//! the threads it starts (one init thread per initialize, one acquisition
//! worker, short-lived writers) share only the locked link and report back
//! through the update queue.
//!
//! ```text
//! owner thread                         worker threads
//! ------------                         --------------
//! initialize_communication() --spawn--> run_initialization()
//!                                          lock, open, handshake
//! handle(InitComplete) <------publish----- InitComplete
//! init_complete() -> start_acquisition() --spawn--> run_acquisition()
//!                                          loop { lock, read, unlock,
//! handle(Batch) -> update_value() <------    publish, sleep }
//! close_communication(): stop flag, lock (bounded), protocol close, drop
//! ```

mod state;
pub mod update;
pub(crate) mod worker;

pub use state::ControllerState;
pub use update::{update_channel, ControllerId, Envelope, Publisher, Update, UpdateSender};

use crate::channel::{Channel, ChannelPlan};
use crate::devices::{Protocol, WriteCommand};
use crate::diagnostics::{DiagnosticSink, Reporter};
use crate::error::{AppResult, DaqError};
use crate::lock::LockScope;
use crate::simulation::TestSignalSource;
use crate::transport::TransportSpec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use worker::{Link, Shared, WorkerContext};

/// Timing and mode settings shared by every controller of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerOptions {
    /// Synthesize values instead of touching hardware.
    pub test_mode: bool,
    /// Wait for the lock in read and write cycles.
    pub lock_timeout: Duration,
    /// Wait for the lock when closing.
    pub close_timeout: Duration,
    /// Wait for a previous worker to exit before starting a new one.
    pub join_timeout: Duration,
    /// Duration of a simulated initialization.
    pub simulated_init_delay: Duration,
    /// Base seed for simulated values; `None` varies per run.
    pub seed: Option<u64>,
    /// Consecutive fully failed cycles before the worker gives up; 0 never.
    pub max_consecutive_failures: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            lock_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
            simulated_init_delay: Duration::from_secs(2),
            seed: None,
            max_consecutive_failures: 0,
        }
    }
}

impl ControllerOptions {
    /// Defaults with simulation mode on.
    pub fn simulation() -> Self {
        Self {
            test_mode: true,
            ..Self::default()
        }
    }
}

/// What the owning thread needs to build controllers.
#[derive(Clone)]
pub struct ControllerContext {
    /// Options applied to every controller.
    pub options: ControllerOptions,
    /// Sending half of the owner's update queue.
    pub updates: UpdateSender,
    /// Where diagnostics go.
    pub sink: Arc<dyn DiagnosticSink>,
}

/// Result of handing an [`Envelope`] to its controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// From an earlier initialize/close cycle, or no longer applicable.
    Stale,
    /// Initialization finished; the device should call
    /// [`DeviceController::init_complete`].
    InitComplete,
    /// Initialization failed and was reported.
    InitFailed,
    /// Readings were applied to channels.
    Values,
    /// The worker gave up; acquisition is stopped.
    CommunicationLost,
}

/// State machine and thread orchestration for one instrument link.
pub struct DeviceController {
    id: ControllerId,
    transport: TransportSpec,
    interval: Duration,
    options: ControllerOptions,
    paces_itself: bool,
    shared: Arc<Shared>,
    updates: UpdateSender,
    reporter: Reporter,
    state: ControllerState,
    generation: u64,
    plan: ChannelPlan,
    values: Vec<f64>,
    acquiring: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
    init_thread: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
}

impl DeviceController {
    /// Creates an uninitialized controller speaking `protocol` over `transport`.
    pub fn new(
        id: ControllerId,
        protocol: Box<dyn Protocol>,
        transport: TransportSpec,
        interval: Duration,
        context: &ControllerContext,
    ) -> Self {
        let reporter = Reporter::new(id.to_string(), Arc::clone(&context.sink));
        let signal = TestSignalSource::new(context.options.seed, controller_key(&id));
        let paces_itself = protocol.paces_itself();
        let link = Link {
            transport: None,
            protocol,
            signal,
        };
        Self {
            id,
            transport,
            interval,
            options: context.options.clone(),
            paces_itself,
            shared: Arc::new(Shared::new(link)),
            updates: context.updates.clone(),
            reporter,
            state: ControllerState::Uninitialized,
            generation: 0,
            plan: ChannelPlan::new(),
            values: Vec::new(),
            acquiring: None,
            worker: None,
            init_thread: None,
            writers: Vec::new(),
        }
    }

    /// Identifier used on update envelopes.
    pub fn id(&self) -> &ControllerId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Initialize/close cycle counter stamped on worker messages.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while a live transport is held.
    pub fn has_transport(&self) -> bool {
        self.shared.has_transport()
    }

    /// True while an acquisition worker thread is alive.
    pub fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// True while some thread holds this controller's lock.
    pub fn is_locked(&self) -> bool {
        self.shared.link.is_locked()
    }

    /// Latest readings, in plan order. `NaN` until the first cycle.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Channels this controller serves.
    pub fn plan(&self) -> &ChannelPlan {
        &self.plan
    }

    /// Replaces the channel snapshot used by the next init thread or worker.
    pub fn set_plan(&mut self, plan: ChannelPlan) {
        self.plan = plan;
    }

    /// Starts asynchronous initialization and returns immediately.
    ///
    /// With `gate` false (device disabled, or channel not enabled, active
    /// and real) acquisition is stopped and nothing else happens. An already
    /// initialized controller is closed first.
    pub fn initialize_communication(&mut self, gate: bool) {
        if !gate {
            self.stop_acquisition();
            debug!(controller = %self.id, "initialization skipped, controller gated off");
            return;
        }
        if self.state != ControllerState::Uninitialized {
            self.close_communication();
        }
        self.state = ControllerState::Uninitialized;
        self.reap_threads();

        self.generation = self.shared.advance_generation();
        let ctx = self.worker_context();
        let transport = self.transport.clone();
        let spawned = thread::Builder::new()
            .name(format!("{} init", self.id))
            .spawn(move || worker::run_initialization(&ctx, &transport));
        match spawned {
            Ok(handle) => {
                self.init_thread = Some(handle);
                self.state = ControllerState::Initializing;
                debug!(controller = %self.id, generation = self.generation, "initializing");
            }
            Err(e) => self
                .reporter
                .error(format!("Could not start initialization thread: {e}")),
        }
    }

    /// Applies one message from this controller's threads.
    ///
    /// Messages from an earlier generation are dropped.
    pub fn handle(&mut self, envelope: Envelope, channels: &mut [Channel]) -> Handled {
        if envelope.generation != self.generation {
            trace!(controller = %self.id, generation = envelope.generation, "stale update dropped");
            return Handled::Stale;
        }
        match envelope.update {
            Update::InitComplete if self.state == ControllerState::Initializing => {
                Handled::InitComplete
            }
            Update::InitComplete => Handled::Stale,
            Update::InitFailed(message) => {
                if self.state == ControllerState::Initializing {
                    self.state = ControllerState::Uninitialized;
                }
                self.reporter.error(message);
                self.reap_threads();
                Handled::InitFailed
            }
            Update::Value(value) => {
                self.update_value(channels, &[value]);
                Handled::Values
            }
            Update::Batch(values) => {
                self.update_value(channels, &values);
                Handled::Values
            }
            Update::CommunicationLost(reason) => {
                self.reporter
                    .error(format!("Communication lost: {reason}. Acquisition stopped."));
                self.stop_acquisition();
                Handled::CommunicationLost
            }
        }
    }

    /// Owner-thread completion of initialization.
    ///
    /// Allocates one undefined reading per channel and starts acquisition if
    /// `active`.
    pub fn init_complete(&mut self, active: bool) {
        if self.state != ControllerState::Initializing {
            return;
        }
        self.values = vec![f64::NAN; self.plan.len()];
        self.state = ControllerState::Initialized;
        self.reap_threads();
        info!(controller = %self.id, channels = self.plan.len(), "initialization complete");
        self.start_acquisition(active);
    }

    /// Starts the acquisition worker.
    ///
    /// A previous worker is asked to stop and joined with a bound first; if
    /// it does not exit an ERROR is reported and no second worker is started.
    pub fn start_acquisition(&mut self, active: bool) {
        if !self.state.is_initialized() {
            debug!(controller = %self.id, state = %self.state, "acquisition not started");
            return;
        }
        if !active {
            return;
        }
        if let Some(previous) = self.worker.take() {
            if let Some(flag) = self.acquiring.take() {
                flag.store(false, Ordering::SeqCst);
            }
            if let Err(still_running) = worker::join_within(previous, self.options.join_timeout) {
                self.worker = Some(still_running);
                self.reporter
                    .error("Previous acquisition thread did not stop; not starting another.");
                return;
            }
        }

        let flag = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&flag);
        let ctx = self.worker_context();
        let spawned = thread::Builder::new()
            .name(format!("{} acquisition", self.id))
            .spawn(move || worker::run_acquisition(&ctx, || running.load(Ordering::SeqCst)));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.acquiring = Some(flag);
                self.state = ControllerState::Acquiring;
            }
            Err(e) => self
                .reporter
                .error(format!("Could not start acquisition thread: {e}")),
        }
    }

    /// Asks the worker to stop. Does not wait for it.
    pub fn stop_acquisition(&mut self) {
        if let Some(flag) = self.acquiring.take() {
            flag.store(false, Ordering::SeqCst);
        }
        if self.state == ControllerState::Acquiring {
            self.state = ControllerState::Initialized;
        }
    }

    /// Stops the worker and waits up to `timeout` for it to exit.
    pub fn stop_acquisition_and_join(&mut self, timeout: Duration) -> bool {
        self.stop_acquisition();
        match self.worker.take() {
            Some(handle) => match worker::join_within(handle, timeout) {
                Ok(()) => true,
                Err(handle) => {
                    self.worker = Some(handle);
                    false
                }
            },
            None => true,
        }
    }

    /// Stops acquisition and releases the transport under the lock.
    ///
    /// If the lock is not obtained within the close timeout a WARNING is
    /// reported, the state still becomes `Closed` and the transport is
    /// released by whichever thread takes the lock next. A second call is a
    /// no-op.
    pub fn close_communication(&mut self) {
        if self.state == ControllerState::Closed {
            return;
        }
        self.state = ControllerState::Closing;
        self.stop_acquisition();
        self.generation = self.shared.advance_generation();

        match self
            .shared
            .lock(self.options.close_timeout, "Could not acquire lock before closing port.")
        {
            Ok(link) => close_link(link, &self.shared, &self.reporter),
            Err(timeout) => {
                self.shared.mark_for_discard();
                self.reporter.warning(format!(
                    "{} The transport will be released by the next lock holder.",
                    timeout.message
                ));
            }
        }

        if let Some(handle) = self.worker.take() {
            if let Err(handle) = worker::join_within(handle, self.options.join_timeout) {
                debug!(controller = %self.id, "worker still finishing its last cycle");
                self.worker = Some(handle);
            }
        }
        self.reap_threads();
        self.values.fill(f64::NAN);
        self.state = ControllerState::Closed;
    }

    /// Applies published readings to `channels`. Owner thread only.
    pub fn update_value(&mut self, channels: &mut [Channel], values: &[f64]) {
        let now = Instant::now();
        for (spec, value) in self.plan.iter().zip(values) {
            if let Some(channel) = channels.get_mut(spec.index) {
                channel.apply_value(*value, now);
            }
        }
        self.values = values.to_vec();
    }

    /// Writes `command` to the device from a short-lived thread.
    ///
    /// Returns false if nothing was started (simulation mode, or no live
    /// transport).
    pub fn apply_value(&mut self, command: WriteCommand) -> bool {
        self.apply_values(vec![command])
    }

    /// Writes `commands` in order from one short-lived thread, under one lock.
    pub fn apply_values(&mut self, commands: Vec<WriteCommand>) -> bool {
        if commands.is_empty() {
            return false;
        }
        if self.options.test_mode {
            debug!(controller = %self.id, ?commands, "simulated write");
            return false;
        }
        if !self.state.is_initialized() || !self.has_transport() {
            debug!(controller = %self.id, ?commands, "write skipped, not connected");
            return false;
        }
        self.writers.retain(|writer| !writer.is_finished());

        let shared = Arc::clone(&self.shared);
        let reporter = self.reporter.clone();
        let timeout = self.options.lock_timeout;
        let spawned = thread::Builder::new()
            .name(format!("{} write", self.id))
            .spawn(move || worker::run_write(&shared, &reporter, timeout, &commands));
        match spawned {
            Ok(handle) => {
                self.writers.push(handle);
                true
            }
            Err(e) => {
                self.reporter.error(format!("Could not start write thread: {e}"));
                false
            }
        }
    }

    /// Writes `command` on the calling thread, waiting for the lock.
    ///
    /// Fails with `InvalidState` before initialization completes.
    pub fn apply_value_blocking(&self, command: &WriteCommand) -> AppResult<()> {
        if self.options.test_mode {
            return Ok(());
        }
        if !self.state.is_initialized() {
            return Err(DaqError::InvalidState {
                operation: format!("apply {command}"),
                state: self.state.to_string(),
            });
        }
        let link = self
            .shared
            .lock(self.options.lock_timeout, format!("Cannot acquire lock to apply {command}."))?;
        worker::write_locked(link, command)
    }

    /// Waits up to `timeout` for pending writes. Returns true if none remain.
    pub fn wait_for_writes(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut still_running = Vec::new();
        for writer in self.writers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(writer) = worker::join_within(writer, remaining) {
                still_running.push(writer);
            }
        }
        self.writers = still_running;
        self.writers.is_empty()
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            shared: Arc::clone(&self.shared),
            publisher: self.updates.publisher(self.id.clone(), self.generation),
            reporter: self.reporter.clone(),
            plan: self.plan.clone(),
            options: self.options.clone(),
            interval: self.interval,
            paces_itself: self.paces_itself,
        }
    }

    fn reap_threads(&mut self) {
        if self.init_thread.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(handle) = self.init_thread.take() {
                handle.join().ok();
            }
        }
        self.writers.retain(|writer| !writer.is_finished());
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        if let Some(flag) = self.acquiring.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("resource", &self.transport.resource())
            .finish()
    }
}

/// Runs the protocol's shutdown writes and close routine, then drops the transport.
fn close_link(mut link: LockScope<'_, Link>, shared: &Shared, reporter: &Reporter) {
    if link.transport.is_some() {
        for command in link.protocol.close_commands() {
            if let Err(e) = worker::write_locked(link.reborrow(), &command) {
                reporter.warning(format!("Failed to apply {command} before closing: {e}"));
            }
        }
    }
    let Link {
        transport,
        protocol,
        ..
    } = &mut *link;
    if let Some(mut transport) = transport.take() {
        if let Err(e) = protocol.close(transport.as_mut()) {
            reporter.warning(format!("{} close routine failed: {e}", protocol.label()));
        }
        if let Err(e) = transport.close() {
            reporter.warning(format!("Error while closing {}: {e}", transport.resource()));
        }
        info!(
            controller = reporter.source(),
            resource = transport.resource(),
            "communication closed"
        );
    }
    shared.set_connected(false);
}

/// Seed salt for one controller; the same id gives the same key on every build.
fn controller_key(id: &ControllerId) -> u64 {
    let slot = u64::try_from(id.slot).unwrap_or(u64::MAX);
    fnv1a(id.device.bytes().chain(slot.to_le_bytes()))
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .into_iter()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{plan_for, ChannelKind};
    use crate::devices::DeviceKind;
    use crate::diagnostics::{MemorySink, Severity};
    use crate::transport::MockTransport;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn fixture(
        options: ControllerOptions,
    ) -> (DeviceController, UnboundedReceiver<Envelope>, MemorySink, MockTransport) {
        let (updates, rx) = update_channel();
        let sink = MemorySink::new();
        let context = ControllerContext {
            options,
            updates,
            sink: Arc::new(sink.clone()),
        };
        let mock = MockTransport::new("COM7");
        mock.respond("TID", &["\u{6}"]);
        mock.respond("PR1", &["\u{6}"]);
        mock.respond("\u{5}", &["0,1.5E-07"]);
        let mut controller = DeviceController::new(
            ControllerId::new("gauge", 0),
            DeviceKind::MaxiGauge.protocol(),
            TransportSpec::Mock(mock.clone()),
            Duration::from_millis(10),
            &context,
        );
        let channels = vec![Channel::new("P1", ChannelKind::Pressure { gauge: 1 })];
        controller.set_plan(plan_for(&channels, &[0]));
        (controller, rx, sink, mock)
    }

    fn next(rx: &mut UnboundedReceiver<Envelope>) -> Envelope {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(envelope) = rx.try_recv() {
                return envelope;
            }
            assert!(Instant::now() < deadline, "no update within 5 s");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_controller_key_is_fixed() {
        assert_eq!(fnv1a(Vec::new()), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(*b"a"), 0xaf63_dc4c_8601_ec8c);
        let first = controller_key(&ControllerId::new("keithley", 0));
        assert_eq!(first, controller_key(&ControllerId::new("keithley", 0)));
        assert_ne!(first, controller_key(&ControllerId::new("keithley", 1)));
        assert_ne!(first, controller_key(&ControllerId::new("tic", 0)));
    }

    #[test]
    fn test_gated_initialize_is_noop() {
        let (mut controller, mut rx, _sink, mock) = fixture(ControllerOptions::default());
        controller.initialize_communication(false);
        assert_eq!(controller.state(), ControllerState::Uninitialized);
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.open_count(), 0);
    }

    #[test]
    fn test_blocking_write_requires_initialization() {
        let (controller, _rx, _sink, mock) = fixture(ControllerOptions::default());
        let err = controller
            .apply_value_blocking(&WriteCommand::Output(true))
            .expect_err("not initialized");
        assert!(matches!(err, DaqError::InvalidState { .. }));
        assert!(mock.written().is_empty());
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let (mut controller, mut rx, _sink, _mock) = fixture(ControllerOptions::default());
        let mut channels = vec![Channel::new("P1", ChannelKind::Pressure { gauge: 1 })];
        controller.initialize_communication(true);
        let envelope = next(&mut rx);
        assert_eq!(envelope.update, Update::InitComplete);

        controller.close_communication();
        assert_eq!(controller.handle(envelope, &mut channels), Handled::Stale);
        assert_eq!(controller.state(), ControllerState::Closed);
        assert!(!controller.has_transport());
    }

    #[test]
    fn test_initialize_and_read_real_transport() {
        let (mut controller, mut rx, sink, mock) = fixture(ControllerOptions::default());
        let mut channels = vec![Channel::new("P1", ChannelKind::Pressure { gauge: 1 })];
        controller.initialize_communication(true);
        assert_eq!(controller.state(), ControllerState::Initializing);

        let envelope = next(&mut rx);
        assert_eq!(controller.handle(envelope, &mut channels), Handled::InitComplete);
        controller.init_complete(true);
        assert_eq!(controller.state(), ControllerState::Acquiring);
        assert!(controller.has_transport());

        let envelope = next(&mut rx);
        assert_eq!(controller.handle(envelope, &mut channels), Handled::Values);
        assert!((channels[0].value - 1.5e-7).abs() < 1e-15);

        controller.close_communication();
        assert_eq!(controller.state(), ControllerState::Closed);
        assert!(!controller.has_transport());
        assert!(!mock.is_open());
        assert_eq!(sink.count(Severity::Error), 0);
    }

    #[test]
    fn test_close_timeout_marks_transport_for_discard() {
        let options = ControllerOptions {
            close_timeout: Duration::from_millis(20),
            ..ControllerOptions::default()
        };
        let (mut controller, mut rx, sink, mock) = fixture(options);
        let mut channels = vec![Channel::new("P1", ChannelKind::Pressure { gauge: 1 })];
        controller.initialize_communication(true);
        let envelope = next(&mut rx);
        controller.handle(envelope, &mut channels);
        controller.init_complete(false);
        assert!(controller.has_transport());

        let shared = Arc::clone(&controller.shared);
        let held = shared.link.acquire(Duration::from_secs(1), "test").expect("lock");
        controller.close_communication();
        assert_eq!(controller.state(), ControllerState::Closed);
        assert!(!controller.has_transport());
        assert_eq!(sink.count(Severity::Warning), 1);
        assert!(mock.is_open(), "still held by the blocking thread");
        drop(held);

        drop(shared.lock(Duration::from_secs(1), "next holder").expect("lock"));
        assert!(!mock.is_open());
        assert_eq!(mock.close_count(), 1);
    }
}
