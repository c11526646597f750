//! Code that runs off the owning thread: initialization, the acquisition
//! loop and value writes.
//!
//! Everything here reaches hardware only through a [`LockScope`] over the
//! controller's [`Link`], holds it for exactly one cycle, and reports back
//! through a [`Publisher`] or the diagnostic [`Reporter`]. No error leaves
//! these functions.

use super::update::{Publisher, Update};
use super::ControllerOptions;
use crate::channel::ChannelPlan;
use crate::devices::{Protocol, WriteCommand};
use crate::diagnostics::Reporter;
use crate::error::{AppResult, DaqError};
use crate::lock::{BoundedLock, LockScope, LockTimeout};
use crate::simulation::TestSignalSource;
use crate::transport::{Transport, TransportSpec};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest uninterrupted sleep; the stop flag is checked between slices.
pub(crate) const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Everything a controller touches under its lock.
pub(crate) struct Link {
    pub(crate) transport: Option<Box<dyn Transport>>,
    pub(crate) protocol: Box<dyn Protocol>,
    pub(crate) signal: TestSignalSource,
}

/// State shared between a controller and its threads.
pub(crate) struct Shared {
    pub(crate) link: BoundedLock<Link>,
    generation: AtomicU64,
    connected: AtomicBool,
    discard: AtomicBool,
}

impl Shared {
    pub(crate) fn new(link: Link) -> Self {
        Self {
            link: BoundedLock::new(link),
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            discard: AtomicBool::new(false),
        }
    }

    /// Acquires the link, dropping a transport left behind by a timed-out close.
    pub(crate) fn lock(
        &self,
        timeout: Duration,
        on_timeout: impl Into<String>,
    ) -> Result<LockScope<'_, Link>, LockTimeout> {
        let mut link = self.link.acquire(timeout, on_timeout)?;
        self.discard_if_marked(&mut link);
        Ok(link)
    }

    /// Closes and drops the transport if a close could not get the lock.
    pub(crate) fn discard_if_marked(&self, link: &mut Link) {
        if !self.discard.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut transport) = link.transport.take() {
            if let Err(e) = transport.close() {
                debug!(
                    resource = transport.resource(),
                    error = %e,
                    "discarded transport did not close cleanly"
                );
            }
            info!(resource = transport.resource(), "discarded transport released");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Marks the live transport for release by the next lock holder.
    pub(crate) fn mark_for_discard(&self) {
        self.discard.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// True while a transport is stored and not marked for discard.
    pub(crate) fn has_transport(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.discard.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Inputs of one init thread or acquisition worker.
pub(crate) struct WorkerContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) publisher: Publisher,
    pub(crate) reporter: Reporter,
    pub(crate) plan: ChannelPlan,
    pub(crate) options: ControllerOptions,
    pub(crate) interval: Duration,
    pub(crate) paces_itself: bool,
}

/// Body of the init thread.
///
/// Opens the transport and runs the handshake under the lock, then reports
/// `InitComplete` or `InitFailed`. In simulation mode the hardware is
/// skipped after a delay.
pub(crate) fn run_initialization(ctx: &WorkerContext, transport: &TransportSpec) {
    if ctx.options.test_mode {
        thread::sleep(ctx.options.simulated_init_delay);
        ctx.reporter.warning("Faking values for testing!");
        ctx.publisher.publish(Update::InitComplete);
        return;
    }

    let update = match open_link(ctx, transport) {
        Ok(true) => Update::InitComplete,
        Ok(false) => {
            debug!(source = ctx.reporter.source(), "initialization superseded");
            return;
        }
        Err(e) => Update::InitFailed(format!(
            "Error while initializing {}: {e}",
            transport.resource()
        )),
    };
    ctx.publisher.publish(update);
}

/// Returns `Ok(false)` if a close or re-initialize happened meanwhile.
fn open_link(ctx: &WorkerContext, spec: &TransportSpec) -> AppResult<bool> {
    let generation = ctx.publisher.generation();
    let mut link = ctx.shared.lock(
        ctx.options.lock_timeout,
        format!("Could not acquire lock to initialize {}.", spec.resource()),
    )?;
    if !ctx.shared.is_current(generation) {
        return Ok(false);
    }
    if let Some(mut stale) = link.transport.take() {
        if let Err(e) = stale.close() {
            debug!(
                resource = stale.resource(),
                error = %e,
                "stale transport did not close cleanly"
            );
        }
        ctx.shared.set_connected(false);
    }

    let mut transport = link.protocol.open(spec)?;
    if let Err(e) = link.protocol.handshake(transport.as_mut(), &ctx.plan) {
        transport.close().ok();
        return Err(e);
    }
    if !ctx.shared.is_current(generation) {
        transport.close().ok();
        return Ok(false);
    }

    info!(
        source = ctx.reporter.source(),
        resource = transport.resource(),
        protocol = link.protocol.label(),
        "communication established"
    );
    link.transport = Some(transport);
    ctx.shared.set_connected(true);
    Ok(true)
}

/// Outcome of one read cycle.
#[derive(Debug)]
struct Cycle {
    values: Vec<f64>,
    failures: Vec<(String, DaqError)>,
    attempted: usize,
}

impl Cycle {
    fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failures.len() == self.attempted
    }
}

/// Body of the acquisition worker.
///
/// Loops until `is_still_acquiring` turns false: one locked read cycle,
/// release, publish, then pace outside the lock.
pub(crate) fn run_acquisition(ctx: &WorkerContext, is_still_acquiring: impl Fn() -> bool) {
    let mut previous = vec![f64::NAN; ctx.plan.len()];
    let mut failed_cycles = 0u32;
    debug!(source = ctx.reporter.source(), "acquisition started");

    while is_still_acquiring() {
        let cycle = match ctx.shared.lock(
            ctx.options.lock_timeout,
            format!("Cannot acquire lock for acquisition of {}.", ctx.reporter.source()),
        ) {
            Ok(_) | Err(_) if !is_still_acquiring() => break,
            Ok(mut link) => {
                let cycle = read_cycle(&mut link, &ctx.plan, &previous, ctx.options.test_mode);
                ctx.shared.discard_if_marked(&mut link);
                Some(cycle)
            }
            Err(timeout) => {
                ctx.reporter.warning(timeout.to_string());
                None
            }
        };

        if let Some(cycle) = cycle {
            for (channel, error) in &cycle.failures {
                if error.is_disconnect() {
                    ctx.reporter
                        .warning(format!("Lost connection while reading {channel}: {error}"));
                } else {
                    ctx.reporter.warning(format!("Failed to read {channel}: {error}"));
                }
            }
            failed_cycles = if cycle.all_failed() { failed_cycles + 1 } else { 0 };
            previous.clone_from(&cycle.values);
            let update = if cycle.values.len() == 1 {
                Update::Value(cycle.values[0])
            } else {
                Update::Batch(cycle.values)
            };
            if !ctx.publisher.publish(update) {
                break;
            }

            let limit = ctx.options.max_consecutive_failures;
            if limit > 0 && failed_cycles >= limit {
                ctx.publisher.publish(Update::CommunicationLost(format!(
                    "{failed_cycles} consecutive read cycles failed"
                )));
                break;
            }
        }

        if ctx.options.test_mode || !ctx.paces_itself {
            sleep_while(&is_still_acquiring, ctx.interval);
        }
    }
    debug!(source = ctx.reporter.source(), "acquisition stopped");
}

fn read_cycle(link: &mut Link, plan: &ChannelPlan, previous: &[f64], test_mode: bool) -> Cycle {
    let Link {
        transport,
        protocol,
        signal,
    } = link;
    let mut cycle = Cycle {
        values: Vec::with_capacity(plan.len()),
        failures: Vec::new(),
        attempted: 0,
    };

    for (channel, last) in plan.iter().zip(previous) {
        if !channel.participates {
            cycle.values.push(f64::NAN);
            continue;
        }
        cycle.attempted += 1;
        let value = if test_mode {
            Ok(protocol.simulate(signal, channel, *last))
        } else {
            match transport.as_deref_mut() {
                Some(transport) => protocol.read_channel(transport, channel),
                None => Err(DaqError::NotConnected),
            }
        };
        match value {
            Ok(value) => cycle.values.push(value),
            Err(error) => {
                cycle.values.push(f64::NAN);
                cycle.failures.push((channel.name.clone(), error));
            }
        }
    }
    cycle
}

/// Applies `command` through a scope the caller already holds.
pub(crate) fn write_locked(mut link: LockScope<'_, Link>, command: &WriteCommand) -> AppResult<()> {
    let Link {
        transport,
        protocol,
        ..
    } = &mut *link;
    let transport = transport.as_deref_mut().ok_or(DaqError::NotConnected)?;
    protocol.write(transport, command)
}

/// Acquires the lock once and applies `commands` in order; failures become diagnostics.
pub(crate) fn run_write(
    shared: &Shared,
    reporter: &Reporter,
    lock_timeout: Duration,
    commands: &[WriteCommand],
) {
    let what = match commands {
        [command] => command.to_string(),
        _ => format!("{} commands", commands.len()),
    };
    match shared.lock(lock_timeout, format!("Cannot acquire lock to apply {what}.")) {
        Ok(mut link) => {
            for command in commands {
                if let Err(e) = write_locked(link.reborrow(), command) {
                    reporter.error(format!("Failed to apply {command}: {e}"));
                }
            }
        }
        Err(timeout) => reporter.warning(timeout.to_string()),
    }
}

/// Sleeps up to `duration` in slices, returning early once the flag drops.
pub(crate) fn sleep_while(is_still_acquiring: &impl Fn() -> bool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while is_still_acquiring() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Joins `handle` if it finishes within `timeout`; otherwise hands it back.
pub(crate) fn join_within(handle: JoinHandle<()>, timeout: Duration) -> Result<(), JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        tracing::error!("controller thread panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_while_returns_on_flag() {
        let flag = Arc::new(AtomicBool::new(true));
        let stopper = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                flag.store(false, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        sleep_while(&|| flag.load(Ordering::SeqCst), Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
        stopper.join().expect("stopper");
    }

    #[test]
    fn test_join_within_hands_back_running_thread() {
        let release = Arc::new(AtomicBool::new(false));
        let handle = {
            let release = Arc::clone(&release);
            thread::spawn(move || {
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        let handle = join_within(handle, Duration::from_millis(20)).expect_err("still running");
        release.store(true, Ordering::SeqCst);
        assert!(join_within(handle, Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_cycle_failure_classification() {
        let cycle = Cycle {
            values: vec![f64::NAN, f64::NAN],
            failures: vec![("P1".into(), DaqError::NotConnected)],
            attempted: 1,
        };
        assert!(cycle.all_failed());
        let idle = Cycle {
            values: vec![f64::NAN],
            failures: Vec::new(),
            attempted: 0,
        };
        assert!(!idle.all_failed(), "no participating channel is not a failure");
    }
}
