//! Messages from worker threads to the owning thread.
//!
//! Workers never touch channel state. Every result of an initialization or a
//! read cycle is wrapped in an [`Envelope`] and sent over an unbounded
//! `tokio::sync::mpsc` channel whose single receiver lives in the
//! [`DeviceManager`](crate::manager::DeviceManager). Sending never blocks, and
//! messages from one worker arrive in the order they were sent.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one controller: the device it belongs to and its slot there.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControllerId {
    /// Name of the owning device.
    pub device: Arc<str>,
    /// Index of the controller within the device.
    pub slot: usize,
}

impl ControllerId {
    /// Builds an id.
    pub fn new(device: impl Into<Arc<str>>, slot: usize) -> Self {
        Self {
            device: device.into(),
            slot,
        }
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.device, self.slot)
    }
}

/// Payload of one message. Values travel with the message.
#[derive(Clone, Debug, PartialEq)]
pub enum Update {
    /// Transport opened and handshake succeeded (or simulated).
    InitComplete,
    /// Initialization failed; the text is reported at ERROR on the owner.
    InitFailed(String),
    /// Reading for a single-channel controller.
    Value(f64),
    /// One reading per channel the controller serves, in plan order.
    Batch(Vec<f64>),
    /// The worker gave up after repeated failures and exited.
    CommunicationLost(String),
}

/// An [`Update`] tagged with its origin.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Controller that produced the update.
    pub controller: ControllerId,
    /// Initialize/close cycle the producer was started in.
    pub generation: u64,
    /// The payload.
    pub update: Update,
}

/// Creates the update queue.
pub fn update_channel() -> (UpdateSender, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UpdateSender { tx }, rx)
}

/// Cloneable sending half of the update queue.
#[derive(Clone, Debug)]
pub struct UpdateSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl UpdateSender {
    /// Binds this sender to one controller and generation.
    pub fn publisher(&self, controller: ControllerId, generation: u64) -> Publisher {
        Publisher {
            sender: self.clone(),
            controller,
            generation,
        }
    }

    /// Enqueues `envelope`. Returns false once the owner has gone away.
    pub fn send(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::SendError(dropped)) => {
                trace!(controller = %dropped.controller, "update dropped, owner gone");
                false
            }
        }
    }
}

/// Sender bound to the controller and generation of one worker.
#[derive(Clone, Debug)]
pub struct Publisher {
    sender: UpdateSender,
    controller: ControllerId,
    generation: u64,
}

impl Publisher {
    /// Enqueues `update` for the owner.
    pub fn publish(&self, update: Update) -> bool {
        self.sender.send(Envelope {
            controller: self.controller.clone(),
            generation: self.generation,
            update,
        })
    }

    /// Generation this publisher stamps on its messages.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_preserves_order() {
        let (sender, mut rx) = update_channel();
        let publisher = sender.publisher(ControllerId::new("gauge", 0), 3);
        publisher.publish(Update::InitComplete);
        publisher.publish(Update::Batch(vec![1.0, 2.0]));
        publisher.publish(Update::Value(3.0));

        let first = rx.try_recv().expect("first");
        assert_eq!(first.update, Update::InitComplete);
        assert_eq!(first.generation, 3);
        assert_eq!(first.controller.to_string(), "gauge[0]");
        assert_eq!(rx.try_recv().expect("second").update, Update::Batch(vec![1.0, 2.0]));
        assert_eq!(rx.try_recv().expect("third").update, Update::Value(3.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_owner_dropped() {
        let (sender, rx) = update_channel();
        drop(rx);
        let publisher = sender.publisher(ControllerId::new("gauge", 0), 0);
        assert!(!publisher.publish(Update::Value(1.0)));
    }
}
