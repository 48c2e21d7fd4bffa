//! PeerBridge Core
//!
//! Session-level building blocks shared by the transport and the
//! supervisor:
//! - System state machine with a queued network-event stream
//! - Peer link activity/liveness tracking

pub mod peer;
pub mod state;

pub use peer::PeerLink;
pub use state::{NetworkEvent, StateMachine, SystemState};

use std::net::Ipv4Addr;

/// Virtual IP assigned to the hosting side of a session.
pub const HOST_VIRTUAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Virtual IP assigned to the connecting side of a session.
pub const CLIENT_VIRTUAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// The virtual subnet both peers share.
pub const VIRTUAL_SUBNET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);

/// Prefix length of the virtual subnet.
pub const VIRTUAL_PREFIX_LEN: u8 = 24;

/// Directed broadcast address of the virtual subnet.
pub const VIRTUAL_BROADCAST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 255);
