//! PeerBridge Network Layer
//!
//! Network primitives for the single-pair VPN session:
//! - Framed UDP transport with hole punching and keep-alive
//! - STUN public-address discovery
//! - WebSocket signaling client
//! - IPv4 packet bridge filters
//! - TUN adapters and route/firewall configuration

pub mod bridge;
pub mod error;
pub mod frame;
pub mod netconfig;
pub mod signaling;
pub mod stun;
pub mod transport;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use frame::{Frame, FrameType};
pub use netconfig::{ConnectionConfig, NetConfigManager};
pub use signaling::{SignalingClient, SignalingSink};
pub use stun::{PublicAddress, StunClient};
pub use transport::{MessageSink, TransportConfig, UdpTransport};
pub use tun::{create_tun, PacketSink, TunConfig, TunDevice, TunRunner};
