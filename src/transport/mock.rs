//! Scripted in-process transport for testing
//!
//! [`MockTransport`] stands in for hardware in tests and demos. It provides:
//! - Scripted replies per command (persistent or one-shot)
//! - Failure injection for open, reads and writes
//! - Simulated latency
//! - A call log and overlap detection for verifying lock discipline
//!
//! All clones share state, so a test keeps one handle while the controller
//! owns the opened link.

use super::Transport;
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    persistent: HashMap<String, Vec<String>>,
    once: HashMap<String, VecDeque<Vec<String>>>,
    pending: VecDeque<String>,
    written: Vec<String>,
    fail_open: Option<String>,
    failing_reads: usize,
    failing_writes: usize,
    latency: Duration,
    open: bool,
    opened: usize,
    closed: usize,
}

/// Shared-state scripted transport.
#[derive(Clone, Debug)]
pub struct MockTransport {
    resource: Arc<str>,
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Creates a mock reachable under `resource`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: Arc::from(resource.into()),
            state: Arc::new(Mutex::new(MockState::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            overlaps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every time `command` is written, queue `lines` as responses.
    pub fn respond(&self, command: &str, lines: &[&str]) {
        self.state.lock().persistent.insert(
            command.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// The next time `command` is written, queue `lines` instead of the persistent reply.
    pub fn respond_once(&self, command: &str, lines: &[&str]) {
        self.state
            .lock()
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(lines.iter().map(|l| l.to_string()).collect());
    }

    /// Makes the next open fail with `reason` (e.g. "port busy").
    pub fn fail_open(&self, reason: impl Into<String>) {
        self.state.lock().fail_open = Some(reason.into());
    }

    /// Makes the next `count` reads fail. A failed read loses the line it would have returned.
    pub fn fail_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    /// Makes the next `count` writes fail.
    pub fn fail_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Adds a delay to every read, as a slow instrument would.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Commands written so far, without terminators.
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Clears the call log.
    pub fn clear_log(&self) {
        self.state.lock().written.clear();
    }

    /// True between a successful open and the matching close.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Number of closes of an open link.
    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    /// Number of times two calls were inside the transport at once.
    pub fn overlap_count(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub(crate) fn open(&self) -> AppResult<MockTransport> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_open.take() {
            return Err(DaqError::open(self.resource.as_ref(), reason));
        }
        state.open = true;
        state.opened += 1;
        state.pending.clear();
        Ok(self.clone())
    }

    fn enter(&self) -> CallGuard<'_> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard(&self.in_flight)
    }
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn write_line(&mut self, message: &str) -> AppResult<()> {
        let _call = self.enter();
        let mut state = self.state.lock();
        if !state.open {
            return Err(DaqError::NotConnected);
        }
        state.written.push(message.to_string());
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(DaqError::write(format!("injected write failure for '{message}'")));
        }
        let once = state.once.get_mut(message).and_then(VecDeque::pop_front);
        let reply = once.or_else(|| state.persistent.get(message).cloned());
        if let Some(lines) = reply {
            state.pending.extend(lines);
        }
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        let _call = self.enter();
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let mut state = self.state.lock();
        if !state.open {
            return Err(DaqError::NotConnected);
        }
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            state.pending.pop_front();
            return Err(DaqError::read("injected read failure"));
        }
        state
            .pending
            .pop_front()
            .ok_or_else(|| DaqError::read(format!("read timeout on {}", self.resource)))
    }

    fn close(&mut self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.closed += 1;
            state.pending.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_replies() {
        let mock = MockTransport::new("COM1");
        mock.respond("TID", &["\u{6}"]);
        mock.respond_once("\u{5}", &["TPR,TPR,noSen,noSen,noSen,noSen"]);
        let mut link = mock.open().expect("open");

        link.write_line("TID").expect("write");
        assert_eq!(link.read_line().expect("ack"), "\u{6}");
        assert_eq!(
            link.query("\u{5}").expect("enquiry"),
            "TPR,TPR,noSen,noSen,noSen,noSen"
        );
        link.write_line("\u{5}").expect("write");
        assert!(link.read_line().is_err(), "one-shot reply is consumed");
    }

    #[test]
    fn test_open_failure_injection() {
        let mock = MockTransport::new("COM1");
        mock.fail_open("port busy");
        let err = mock.open().expect_err("injected failure");
        assert!(err.to_string().contains("port busy"));
        assert!(!mock.is_open());
        assert!(mock.open().is_ok(), "failure is one-shot");
        assert_eq!(mock.open_count(), 1);
    }

    #[test]
    fn test_read_failure_injection() {
        let mock = MockTransport::new("GPIB0::22::INSTR");
        mock.respond("FETCh?", &["+1.0E-12A,+0.0,+0.0"]);
        mock.fail_reads(1);
        let mut link = mock.open().expect("open");
        assert!(link.query("FETCh?").is_err());
        assert!(link.query("FETCh?").is_ok());
    }

    #[test]
    fn test_closed_link_rejects_calls() {
        let mock = MockTransport::new("COM1");
        let mut link = mock.open().expect("open");
        link.close().expect("close");
        link.close().expect("second close");
        assert_eq!(mock.close_count(), 1);
        assert!(matches!(link.write_line("TID"), Err(DaqError::NotConnected)));
    }

    #[test]
    fn test_call_log() {
        let mock = MockTransport::new("COM1");
        let mut link = mock.open().expect("open");
        link.write_line("PR1").expect("write");
        link.write_line("PR2").expect("write");
        assert_eq!(mock.written(), vec!["PR1", "PR2"]);
        mock.clear_log();
        assert!(mock.written().is_empty());
        assert_eq!(mock.overlap_count(), 0);
    }
}
