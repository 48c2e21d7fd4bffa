//! Session supervisor
//!
//! Owns the external collaborators (STUN, signaling, TUN, transport,
//! config applier) and drives the process-level lifecycle: a monitor
//! task drains the state machine's event queue and performs the
//! transitions, while signaling callbacks and the packet bridge feed
//! work in from their own tasks.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use peerbridge_core::{
    NetworkEvent, StateMachine, SystemState, CLIENT_VIRTUAL_IP, HOST_VIRTUAL_IP,
};
use peerbridge_network::netconfig::ConnectionConfig;
use peerbridge_network::tun::{PacketSink, TunRunner};
use peerbridge_network::{
    bridge, create_tun, MessageSink, NetConfigManager, PublicAddress, SignalingClient,
    SignalingSink, StunClient, TunConfig, UdpTransport,
};

use crate::config::ClientConfig;
use crate::logging;

/// Interval of the monitor task's event-drain loop
const MONITOR_INTERVAL: Duration = Duration::from_millis(250);

/// Virtual addresses for the two roles: the host takes .1, the client
/// takes .2.
fn virtual_ips(is_host: bool) -> (Ipv4Addr, Ipv4Addr) {
    if is_host {
        (HOST_VIRTUAL_IP, CLIENT_VIRTUAL_IP)
    } else {
        (CLIENT_VIRTUAL_IP, HOST_VIRTUAL_IP)
    }
}

/// Who we are talking to (or about to)
#[derive(Default)]
struct PeerIdentity {
    peer_username: String,
    peer_ip: Option<IpAddr>,
    peer_port: u16,
    pending_request_from: String,
    local_virtual_ip: Option<Ipv4Addr>,
    peer_virtual_ip: Option<Ipv4Addr>,
    is_host: bool,
}

/// Connection status snapshot for the CLI
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub connected: bool,
    pub is_host: bool,
    pub peer_username: String,
    pub local_virtual_ip: Option<Ipv4Addr>,
    pub peer_virtual_ip: Option<Ipv4Addr>,
    pub public_address: Option<PublicAddress>,
}

struct SessionInner {
    username: String,
    state: Arc<StateMachine>,
    netcfg: NetConfigManager,

    transport: OnceLock<Arc<UdpTransport>>,
    signaling: OnceLock<Arc<SignalingClient>>,
    tun: OnceLock<Arc<TunRunner>>,
    public_addr: OnceLock<PublicAddress>,

    identity: Mutex<PeerIdentity>,
    running: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,

    /// Back-reference so sink callbacks can spawn work on the session
    self_ref: OnceLock<std::sync::Weak<SessionInner>>,
}

/// The P2P session: one instance per process.
pub struct P2pSession {
    inner: Arc<SessionInner>,
}

impl P2pSession {
    /// Bring the whole system up: STUN, signaling, TUN, transport,
    /// monitor. Any failure here aborts initialization.
    pub async fn initialize(username: &str, config: &ClientConfig) -> Result<Self> {
        let state = Arc::new(StateMachine::new());

        // STUN first: the discovered socket keeps its NAT binding and
        // is handed to the transport below.
        let stun = StunClient::bind(&config.network.stun_server, config.network.local_port)
            .await
            .context("Failed to bind UDP socket for STUN")?;
        let public_addr = stun
            .discover_public_address()
            .await
            .context("Failed to discover public address via STUN")?;
        info!("Public address: {}", public_addr);

        let inner = Arc::new(SessionInner {
            username: username.to_string(),
            state: Arc::clone(&state),
            netcfg: NetConfigManager::new(),
            transport: OnceLock::new(),
            signaling: OnceLock::new(),
            tun: OnceLock::new(),
            public_addr: OnceLock::new(),
            identity: Mutex::new(PeerIdentity::default()),
            running: AtomicBool::new(true),
            monitor: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));
        let _ = inner.public_addr.set(public_addr);

        // Signaling: connect, greet, publish our reflexive endpoint
        let sink: Arc<dyn SignalingSink> = Arc::clone(&inner) as Arc<dyn SignalingSink>;
        let signaling = SignalingClient::connect(&config.server.url, sink)
            .await
            .context("Failed to connect to signaling server")?;
        if let Err(e) = signaling.send_greeting().await {
            warn!("Greeting failed: {}", e);
        }
        signaling
            .register(username, IpAddr::V4(public_addr.ip), public_addr.port)
            .await
            .context("Failed to register with signaling server")?;
        let _ = inner.signaling.set(Arc::new(signaling));

        // TUN adapter, up but unaddressed until a connection forms
        let device = create_tun(TunConfig {
            name: config.network.tun_name.clone(),
            mtu: config.network.mtu,
        })
        .await
        .context("Failed to initialize TUN interface")?;
        let tun = Arc::new(TunRunner::new(device));
        inner.netcfg.set_interface(&tun.name());
        let _ = inner.tun.set(tun);

        // Transport takes over the STUN socket
        let socket = stun
            .into_socket()
            .context("STUN socket already consumed")?;
        let transport = Arc::new(
            UdpTransport::new(socket, Arc::clone(&state))
                .context("Failed to create UDP transport")?,
        );
        transport.set_message_sink(Arc::clone(&inner) as Arc<dyn MessageSink>);
        transport
            .start_listening()
            .context("Failed to start UDP network")?;
        let _ = inner.transport.set(transport);

        // Monitor drains the event queue and drives transitions
        let monitor_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            monitor_inner.monitor_loop().await;
        });
        *inner.monitor.lock().unwrap() = Some(handle);

        info!("P2P system initialized successfully");
        Ok(Self { inner })
    }

    /// Ask the signaling server to broker a connection to `username`.
    pub async fn connect_to_peer(&self, username: &str) -> Result<()> {
        self.inner.connect_to_peer(username).await
    }

    /// Accept the pending incoming request, becoming the host.
    pub async fn accept_incoming_request(&self) -> Result<()> {
        self.inner.accept_incoming_request().await
    }

    /// Decline the pending incoming request.
    pub async fn reject_incoming_request(&self) -> Result<()> {
        self.inner.reject_incoming_request().await
    }

    /// Tear down the current connection, keeping the system ready for a
    /// new one.
    pub async fn stop_connection(&self) {
        self.inner.stop_connection().await;
    }

    /// Full system shutdown.
    pub async fn shutdown(&self) {
        self.inner.shutdown(true).await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .transport
            .get()
            .map(|t| t.is_connected())
            .unwrap_or(false)
    }

    pub fn status(&self) -> SessionStatus {
        let identity = self.inner.identity.lock().unwrap();
        SessionStatus {
            connected: self.is_connected(),
            is_host: identity.is_host,
            peer_username: identity.peer_username.clone(),
            local_virtual_ip: identity.local_virtual_ip,
            peer_virtual_ip: identity.peer_virtual_ip,
            public_address: self.inner.public_addr.get().copied(),
        }
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }
}

impl SessionInner {
    async fn monitor_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Acquire)
            && !self.state.is_in(SystemState::ShuttingDown)
        {
            while let Some(event) = self.state.next_event() {
                self.handle_network_event(event).await;
            }
            sleep(MONITOR_INTERVAL).await;
        }
        debug!("Monitor task finished");
    }

    async fn handle_network_event(self: &Arc<Self>, event: NetworkEvent) {
        let current = self.state.state();

        match event {
            NetworkEvent::PeerConnected(endpoint) => {
                if current == SystemState::Connecting {
                    if !self.start_network_interface() {
                        error!("Failed to start network interface");
                        self.stop_connection().await;
                        return;
                    }
                    self.state.set_state(SystemState::Connected);
                    info!("Peer connected successfully via {}", endpoint);
                }
            }
            NetworkEvent::AllPeersDisconnected => {
                if current == SystemState::Connected {
                    warn!("All peers disconnected");
                    self.stop_connection().await;
                }
            }
            NetworkEvent::ShutdownRequested => {
                info!("Shutdown requested via event");
                // Running inside the monitor task: don't join ourselves
                self.shutdown(false).await;
            }
        }
    }

    /// Start moving packets once the hole punch succeeded.
    fn start_network_interface(self: &Arc<Self>) -> bool {
        let Some(transport) = self.transport.get() else {
            return false;
        };
        if !transport.is_connected() || !self.state.is_in(SystemState::Connecting) {
            warn!("Cannot configure interface, not connected to a peer");
            return false;
        }

        let Some(tun) = self.tun.get() else {
            return false;
        };
        let sink: Arc<dyn PacketSink> = Arc::clone(self) as Arc<dyn PacketSink>;
        if let Err(e) = tun.start_packet_processing(sink) {
            error!("Failed to start packet processing: {}", e);
            return false;
        }

        {
            let identity = self.identity.lock().unwrap();
            info!(
                "Network interface started with IP {}",
                identity
                    .local_virtual_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_default()
            );
            info!(
                "Peer has IP {}",
                identity
                    .peer_virtual_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_default()
            );
        }

        // Per-packet logging is too noisy once real traffic flows
        logging::set_traffic_logging(false);
        true
    }

    async fn connect_to_peer(self: &Arc<Self>, username: &str) -> Result<()> {
        let Some(transport) = self.transport.get() else {
            anyhow::bail!("System not initialized");
        };
        if transport.is_connected() {
            warn!("Attempted to connect while already connected to a peer");
            anyhow::bail!("Already connected to a peer");
        }

        {
            let mut identity = self.identity.lock().unwrap();
            identity.peer_username = username.to_string();
            identity.is_host = false;
        }
        self.state.set_state(SystemState::Connecting);

        let signaling = self
            .signaling
            .get()
            .context("Signaling not initialized")?;
        signaling.request_peer_info(username).await?;
        signaling.send_chat_request(username).await?;

        info!("Sent connection request to {}", username);
        Ok(())
    }

    async fn accept_incoming_request(self: &Arc<Self>) -> Result<()> {
        let from = {
            let mut identity = self.identity.lock().unwrap();
            if identity.pending_request_from.is_empty() {
                info!("No pending connection request");
                return Ok(());
            }
            identity.is_host = true;
            let from = std::mem::take(&mut identity.pending_request_from);
            identity.peer_username = from.clone();
            from
        };

        let signaling = self
            .signaling
            .get()
            .context("Signaling not initialized")?;
        signaling.accept_chat_request().await?;
        info!("Accepted connection request from {}", from);
        Ok(())
    }

    async fn reject_incoming_request(self: &Arc<Self>) -> Result<()> {
        let from = {
            let mut identity = self.identity.lock().unwrap();
            if identity.pending_request_from.is_empty() {
                info!("No pending connection request");
                return Ok(());
            }
            std::mem::take(&mut identity.pending_request_from)
        };

        let signaling = self
            .signaling
            .get()
            .context("Signaling not initialized")?;
        signaling.decline_chat_request().await?;
        info!("Rejected connection request from {}", from);
        Ok(())
    }

    /// Both sides agreed; configure the interface and start punching.
    async fn handle_connection_init(self: Arc<Self>, username: String, ip: IpAddr, port: u16) {
        info!("Connection initialized with {}, connecting...", username);

        self.state.set_state(SystemState::Connecting);

        let (local_vip, peer_vip) = {
            let mut identity = self.identity.lock().unwrap();
            identity.peer_username = username;
            identity.peer_ip = Some(ip);
            identity.peer_port = port;

            let (local_vip, peer_vip) = virtual_ips(identity.is_host);
            identity.local_virtual_ip = Some(local_vip);
            identity.peer_virtual_ip = Some(peer_vip);
            (local_vip, peer_vip)
        };

        let connection = ConnectionConfig {
            self_virtual_ip: local_vip,
            peer_virtual_ip: peer_vip,
        };
        if !self.netcfg.configure_interface(&connection).await {
            error!("Failed to set up virtual interface");
            return;
        }

        let Some(transport) = self.transport.get() else {
            error!("Transport not initialized");
            return;
        };
        if let Err(e) = transport.connect_to_peer(ip, port) {
            error!("Failed to initiate UDP hole punching: {}", e);
            self.state.set_state(SystemState::Idle);
        }
    }

    async fn stop_connection(self: &Arc<Self>) {
        if let Some(transport) = self.transport.get() {
            transport.stop_connection().await;
        }

        let peer_vip = self.identity.lock().unwrap().peer_virtual_ip;
        if let Some(tun) = self.tun.get() {
            if tun.is_running() {
                tun.stop_packet_processing().await;
                if let Some(peer_vip) = peer_vip {
                    self.netcfg.reset_interface_configuration(peer_vip).await;
                }
            }
        }

        {
            let mut identity = self.identity.lock().unwrap();
            identity.peer_username.clear();
            identity.peer_ip = None;
            identity.peer_port = 0;
            identity.local_virtual_ip = None;
            identity.peer_virtual_ip = None;
        }

        self.state.set_state(SystemState::Idle);
        info!("Connection stopped, system ready for new connections");
    }

    async fn shutdown(self: &Arc<Self>, join_monitor: bool) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let connected = self
            .transport
            .get()
            .map(|t| t.is_connected())
            .unwrap_or(false);
        if connected {
            self.stop_connection().await;
        }

        self.state.set_state(SystemState::ShuttingDown);

        if let Some(tun) = self.tun.get() {
            tun.stop_packet_processing().await;
        }
        if let Some(transport) = self.transport.get() {
            transport.shutdown().await;
        }
        if let Some(signaling) = self.signaling.get() {
            signaling.disconnect().await;
        }

        if join_monitor {
            let handle = self.monitor.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        info!("System shut down successfully");
    }
}

impl SignalingSink for SessionInner {
    fn on_chat_request(&self, from: &str) {
        self.identity.lock().unwrap().pending_request_from = from.to_string();
        info!(
            "Incoming connection request from {} (use /accept or /reject)",
            from
        );
    }

    fn on_peer_info(&self, username: &str, ip: IpAddr, port: u16) {
        let mut identity = self.identity.lock().unwrap();
        if identity.peer_username != username {
            return;
        }
        identity.peer_ip = Some(ip);
        identity.peer_port = port;
        info!("Got peer info: {} at {}:{}", username, ip, port);
    }

    fn on_chat_init(&self, username: &str, ip: IpAddr, port: u16) {
        // Invoked from the signaling reader task; the interface setup
        // runs shell commands, so hand the work off.
        let Some(inner) = self.self_ref.get().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let username = username.to_string();
        tokio::spawn(async move {
            inner.handle_connection_init(username, ip, port).await;
        });
    }

    fn on_disconnected(&self) {
        warn!("Signaling connection lost");
    }
}

impl MessageSink for SessionInner {
    /// Inbound bridge: transport -> TUN
    fn on_message(&self, payload: Bytes) {
        let Some(local_vip) = self.identity.lock().unwrap().local_virtual_ip else {
            return;
        };
        if !bridge::should_deliver_inbound(&payload, local_vip) {
            return;
        }

        trace!(target: "net", "RX {} bytes to TUN", payload.len());
        if let Some(tun) = self.tun.get() {
            if tun.is_running() {
                tun.send_packet(payload);
            }
        }
    }
}

impl PacketSink for SessionInner {
    /// Outbound bridge: TUN -> transport
    fn on_packet(&self, packet: Bytes) {
        let Some(peer_vip) = self.identity.lock().unwrap().peer_virtual_ip else {
            return;
        };
        if !bridge::should_forward_outbound(&packet, peer_vip) {
            return;
        }

        trace!(target: "net", "TX {} bytes to peer", packet.len());
        if let Some(transport) = self.transport.get() {
            if let Err(e) = transport.send_message(packet) {
                debug!("Failed to forward packet to peer: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_inner() -> Arc<SessionInner> {
        let inner = Arc::new(SessionInner {
            username: "alice".into(),
            state: Arc::new(StateMachine::new()),
            netcfg: NetConfigManager::new(),
            transport: OnceLock::new(),
            signaling: OnceLock::new(),
            tun: OnceLock::new(),
            public_addr: OnceLock::new(),
            identity: Mutex::new(PeerIdentity::default()),
            running: AtomicBool::new(true),
            monitor: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = inner.self_ref.set(Arc::downgrade(&inner));
        inner
    }

    #[test]
    fn host_takes_dot_one() {
        assert_eq!(
            virtual_ips(true),
            (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(
            virtual_ips(false),
            (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn chat_request_is_recorded() {
        let inner = detached_inner();
        inner.on_chat_request("bob");
        assert_eq!(inner.identity.lock().unwrap().pending_request_from, "bob");
    }

    #[test]
    fn peer_info_for_other_users_is_ignored() {
        let inner = detached_inner();
        inner.identity.lock().unwrap().peer_username = "bob".into();

        inner.on_peer_info("mallory", "203.0.113.1".parse().unwrap(), 1000);
        assert!(inner.identity.lock().unwrap().peer_ip.is_none());

        inner.on_peer_info("bob", "203.0.113.9".parse().unwrap(), 50000);
        let identity = inner.identity.lock().unwrap();
        assert_eq!(identity.peer_ip, Some("203.0.113.9".parse().unwrap()));
        assert_eq!(identity.peer_port, 50000);
    }

    #[tokio::test]
    async fn accept_without_pending_request_is_a_noop() {
        let inner = detached_inner();
        inner.accept_incoming_request().await.unwrap();
        assert!(!inner.identity.lock().unwrap().is_host);

        inner.reject_incoming_request().await.unwrap();
    }

    #[test]
    fn bridge_sinks_tolerate_missing_connection() {
        let inner = detached_inner();
        // No virtual IPs assigned yet: both directions drop silently
        inner.on_message(Bytes::from_static(&[0x45; 20]));
        inner.on_packet(Bytes::from_static(&[0x45; 20]));
    }
}
