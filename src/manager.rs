//! The owning thread's event loop.
//!
//! [`DeviceManager`] owns every [`Device`] (and through them every channel)
//! plus the receiving half of the update queue. Whatever thread drives it is
//! the owning thread: all channel mutation happens in [`DeviceManager::dispatch`],
//! one envelope at a time, so handlers for one controller never overlap.
//!
//! The async helpers only await the queue; they are meant for a
//! current-thread tokio runtime, which keeps the whole loop on one thread.

use crate::controller::{update_channel, ControllerContext, ControllerOptions, Envelope, Handled};
use crate::devices::{Device, DeviceSpec};
use crate::diagnostics::DiagnosticSink;
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

/// Devices plus the update queue that feeds them.
pub struct DeviceManager {
    devices: Vec<Device>,
    receiver: UnboundedReceiver<Envelope>,
    context: ControllerContext,
    dispatched: u64,
}

impl DeviceManager {
    /// Creates an empty manager.
    pub fn new(options: ControllerOptions, sink: Arc<dyn DiagnosticSink>) -> Self {
        let (updates, receiver) = update_channel();
        Self {
            devices: Vec::new(),
            receiver,
            context: ControllerContext {
                options,
                updates,
                sink,
            },
            dispatched: 0,
        }
    }

    /// Builds a device and takes ownership of it.
    pub fn add_device(&mut self, spec: DeviceSpec) -> AppResult<()> {
        if self.device(&spec.name).is_some() {
            return Err(DaqError::Configuration(format!(
                "duplicate device name '{}'",
                spec.name
            )));
        }
        let device = Device::new(spec, &self.context)?;
        debug!(device = device.name(), kind = %device.kind(), "device added");
        self.devices.push(device);
        Ok(())
    }

    /// All devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Device by name.
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.name() == name)
    }

    /// Mutable device by name.
    pub fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.name() == name)
    }

    /// Number of envelopes dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Starts initialization of every device.
    pub fn initialize_all(&mut self) {
        info!(devices = self.devices.len(), "initializing devices");
        for device in &mut self.devices {
            device.initialize_communication();
        }
    }

    /// Closes every device. Blocks for at most the close timeout per controller.
    pub fn close_all(&mut self) {
        for device in &mut self.devices {
            device.close_communication();
        }
        let drained = self.dispatch_pending();
        info!(devices = self.devices.len(), drained, "devices closed");
    }

    /// Routes one envelope to its device.
    pub fn dispatch(&mut self, envelope: Envelope) -> Handled {
        self.dispatched += 1;
        let name = Arc::clone(&envelope.controller.device);
        match self.device_mut(&name) {
            Some(device) => device.handle(envelope),
            None => {
                trace!(device = %name, "update for unknown device dropped");
                Handled::Stale
            }
        }
    }

    /// Dispatches everything already queued without waiting.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(envelope) = self.receiver.try_recv() {
            self.dispatch(envelope);
            count += 1;
        }
        count
    }

    /// Waits for the next envelope (up to `timeout`) and dispatches it.
    pub async fn dispatch_next(&mut self, timeout: Duration) -> Option<Handled> {
        let envelope = timeout_at(Instant::now() + timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()?;
        Some(self.dispatch(envelope))
    }

    /// Dispatches updates until `condition` holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut condition: impl FnMut(&DeviceManager) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(envelope)) => {
                    self.dispatch(envelope);
                }
                Ok(None) | Err(_) => return condition(self),
            }
        }
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices)
            .field("dispatched", &self.dispatched)
            .finish()
    }
}
