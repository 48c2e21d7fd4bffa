//! System state machine and network event queue
//!
//! The state machine is shared between the UDP transport (event
//! producer), the session supervisor (producer and state driver) and the
//! monitor task (single event consumer). State reads and writes are
//! lock-free; only the event queue takes a mutex.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tracing::warn;

/// Lifecycle states of the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemState {
    /// Not connected to any peer
    Idle = 0,
    /// Establishing a connection (signaling exchange or hole punching)
    Connecting = 1,
    /// Direct path to the peer is up
    Connected = 2,
    /// Terminal teardown state
    ShuttingDown = 3,
}

impl SystemState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SystemState::Idle,
            1 => SystemState::Connecting,
            2 => SystemState::Connected,
            _ => SystemState::ShuttingDown,
        }
    }
}

/// Returns whether `from -> to` is a legal transition.
///
/// ShuttingDown is terminal; everything else may always shut down.
pub fn transition_allowed(from: SystemState, to: SystemState) -> bool {
    use SystemState::*;
    match from {
        Idle => matches!(to, Idle | Connecting | ShuttingDown),
        Connecting => matches!(to, Connected | Idle | ShuttingDown),
        Connected => matches!(to, Connected | Idle | ShuttingDown),
        ShuttingDown => matches!(to, ShuttingDown),
    }
}

/// Event posted by the transport (or the supervisor) and consumed by the
/// monitor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// First valid frame arrived from the peer at this endpoint
    PeerConnected(SocketAddr),
    /// The peer disconnected, timed out, or the socket failed
    AllPeersDisconnected,
    /// Full teardown was requested
    ShutdownRequested,
}

/// Shared session state with a FIFO event queue.
pub struct StateMachine {
    current: AtomicU8,
    events: Mutex<VecDeque<NetworkEvent>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(SystemState::Idle as u8),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Request a transition to `target`.
    ///
    /// Illegal transitions are logged and leave the state untouched.
    /// Returns whether the transition was applied.
    pub fn set_state(&self, target: SystemState) -> bool {
        let current = self.state();
        if !transition_allowed(current, target) {
            warn!(
                "Rejected state transition {:?} -> {:?}",
                current, target
            );
            return false;
        }
        self.current.store(target as u8, Ordering::Release);
        true
    }

    pub fn state(&self) -> SystemState {
        SystemState::from_u8(self.current.load(Ordering::Acquire))
    }

    pub fn is_in(&self, state: SystemState) -> bool {
        self.state() == state
    }

    /// Append an event to the queue.
    pub fn queue_event(&self, event: NetworkEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    /// Pop the oldest queued event, if any.
    pub fn next_event(&self) -> Option<NetworkEvent> {
        self.events.lock().unwrap().pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.lock().unwrap().is_empty()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), SystemState::Idle);
        assert!(sm.is_in(SystemState::Idle));
    }

    #[test]
    fn allows_connect_cycle() {
        let sm = StateMachine::new();
        assert!(sm.set_state(SystemState::Connecting));
        assert!(sm.set_state(SystemState::Connected));
        // Self-transition while connected is legal
        assert!(sm.set_state(SystemState::Connected));
        assert!(sm.set_state(SystemState::Idle));
        assert!(sm.set_state(SystemState::Connecting));
    }

    #[test]
    fn rejects_idle_to_connected() {
        let sm = StateMachine::new();
        assert!(!sm.set_state(SystemState::Connected));
        assert_eq!(sm.state(), SystemState::Idle);
    }

    #[test]
    fn shutting_down_is_terminal() {
        let sm = StateMachine::new();
        assert!(sm.set_state(SystemState::ShuttingDown));
        assert!(!sm.set_state(SystemState::Idle));
        assert!(!sm.set_state(SystemState::Connecting));
        // Self-transition stays allowed
        assert!(sm.set_state(SystemState::ShuttingDown));
        assert_eq!(sm.state(), SystemState::ShuttingDown);
    }

    #[test]
    fn events_drain_in_fifo_order() {
        let sm = StateMachine::new();
        let addr: SocketAddr = "203.0.113.7:4000".parse().unwrap();

        assert!(!sm.has_events());
        sm.queue_event(NetworkEvent::PeerConnected(addr));
        sm.queue_event(NetworkEvent::AllPeersDisconnected);
        assert!(sm.has_events());

        assert_eq!(sm.next_event(), Some(NetworkEvent::PeerConnected(addr)));
        assert_eq!(sm.next_event(), Some(NetworkEvent::AllPeersDisconnected));
        assert_eq!(sm.next_event(), None);
        assert!(!sm.has_events());
    }
}
