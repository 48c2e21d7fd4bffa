//! Peer link activity tracking
//!
//! A single shared record of the peer connection: last time any valid
//! frame arrived, and whether the link is considered up. Written from the
//! transport's receive path and keep-alive timer, read from everywhere.
//! All accesses are atomic; readers never block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Liveness state of the (single) peer connection.
pub struct PeerLink {
    /// Monotonic base for the activity counter
    base: Instant,
    /// Milliseconds since `base` of the last valid inbound frame
    last_activity_ms: AtomicU64,
    connected: AtomicBool,
}

impl PeerLink {
    pub fn new() -> Self {
        let link = Self {
            base: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        };
        link.update_activity();
        link
    }

    /// Record that a valid frame just arrived.
    pub fn update_activity(&self) {
        let now_ms = self.base.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    /// Mark the link up or down. Marking it up also counts as activity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.update_activity();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Time since the last valid inbound frame.
    pub fn idle_time(&self) -> Duration {
        let last_ms = self.last_activity_ms.load(Ordering::Acquire);
        self.base.elapsed().saturating_sub(Duration::from_millis(last_ms))
    }

    /// True iff the link is up and has been idle longer than `threshold`.
    pub fn has_timed_out(&self, threshold: Duration) -> bool {
        self.is_connected() && self.idle_time() > threshold
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_link_is_disconnected() {
        let link = PeerLink::new();
        assert!(!link.is_connected());
        assert!(!link.has_timed_out(Duration::from_millis(0)));
    }

    #[test]
    fn set_connected_refreshes_activity() {
        let link = PeerLink::new();
        std::thread::sleep(Duration::from_millis(20));
        link.set_connected(true);
        assert!(link.is_connected());
        assert!(link.idle_time() < Duration::from_millis(15));
    }

    #[test]
    fn times_out_only_while_connected() {
        let link = PeerLink::new();
        link.set_connected(true);
        std::thread::sleep(Duration::from_millis(30));
        assert!(link.has_timed_out(Duration::from_millis(10)));
        assert!(!link.has_timed_out(Duration::from_secs(5)));

        link.set_connected(false);
        assert!(!link.has_timed_out(Duration::from_millis(10)));
    }

    #[test]
    fn activity_resets_idle_clock() {
        let link = PeerLink::new();
        link.set_connected(true);
        std::thread::sleep(Duration::from_millis(25));
        link.update_activity();
        assert!(!link.has_timed_out(Duration::from_millis(20)));
    }
}
