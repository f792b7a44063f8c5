//! Connectivity gates that decide whether the transport may use the network.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the network is currently usable.
///
/// While the gate is closed, envelopes are stored in the durability cache instead of being sent.
pub trait TransportGate: Send + Sync {
    /// Returns `true` if envelopes may be sent.
    fn is_connected(&self) -> bool;
}

/// A gate that is always open.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnGate;

impl TransportGate for AlwaysOnGate {
    fn is_connected(&self) -> bool {
        true
    }
}

/// A gate that is opened and closed by the host application.
#[derive(Debug)]
pub struct ToggleGate {
    connected: AtomicBool,
}

impl ToggleGate {
    /// Creates a gate in the given state.
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    /// Opens or closes the gate.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl Default for ToggleGate {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TransportGate for ToggleGate {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_gate() {
        let gate = ToggleGate::default();
        assert!(gate.is_connected());

        gate.set_connected(false);
        assert!(!gate.is_connected());
        assert!(AlwaysOnGate.is_connected());
    }
}
