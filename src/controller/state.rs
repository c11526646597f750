use std::fmt;

/// Lifecycle state of a [`DeviceController`](super::DeviceController).
///
/// ```text
/// Uninitialized --initialize--> Initializing --InitComplete--> Initialized
///       ^                            |                          |      ^
///       |                         failure                     start   stop
///       +----------------------------+                          v      |
///       +--------- re-initialize ---- Closed <--close-- ... Acquiring -+
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ControllerState {
    /// No transport, no worker.
    #[default]
    Uninitialized,
    /// Init thread is opening the transport.
    Initializing,
    /// Transport open (or simulated), no worker running.
    Initialized,
    /// Acquisition worker running.
    Acquiring,
    /// Close sequence in progress.
    Closing,
    /// Transport released. May be initialized again.
    Closed,
}

impl ControllerState {
    /// True once initialization has completed and until close.
    pub fn is_initialized(self) -> bool {
        matches!(self, ControllerState::Initialized | ControllerState::Acquiring)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Uninitialized => "Uninitialized",
            ControllerState::Initializing => "Initializing",
            ControllerState::Initialized => "Initialized",
            ControllerState::Acquiring => "Acquiring",
            ControllerState::Closing => "Closing",
            ControllerState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialized_states() {
        assert!(ControllerState::Initialized.is_initialized());
        assert!(ControllerState::Acquiring.is_initialized());
        assert!(!ControllerState::Initializing.is_initialized());
        assert!(!ControllerState::Closed.is_initialized());
        assert_eq!(ControllerState::default(), ControllerState::Uninitialized);
    }
}
