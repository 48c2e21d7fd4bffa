//! Framed UDP transport
//!
//! Owns the session's UDP socket (taken over from STUN so the NAT
//! binding survives) and everything that happens on it:
//! - the continuously re-armed receive task
//! - UDP hole punching toward the configured peer endpoint
//! - the keep-alive timer doubling as idle-timeout watchdog
//! - acknowledgement bookkeeping for outbound messages
//! - graceful disconnect notification and final shutdown
//!
//! The transport never touches the TUN device; bridged packets are
//! handed to the installed [`MessageSink`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, trace, warn};

use peerbridge_core::{NetworkEvent, PeerLink, StateMachine, SystemState};

use crate::error::{NetworkError, NetworkResult};
use crate::frame::{Frame, FrameType, HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_PAYLOAD_SIZE};

/// Kernel socket buffer size requested for both directions
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Consumer of bridged payloads arriving from the peer.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, payload: Bytes);
}

/// Transport timing knobs. The defaults are the production protocol;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keep-alive timer period
    pub keepalive_interval: Duration,
    /// Peer idle threshold before the link is declared dead
    pub idle_timeout: Duration,
    /// Number of frames in the initial hole-punch train
    pub hole_punch_count: u32,
    /// Spacing between hole-punch frames
    pub hole_punch_spacing: Duration,
    /// Number of disconnect notifications sent on teardown
    pub disconnect_repeat: u32,
    /// Spacing between disconnect notifications
    pub disconnect_spacing: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(20),
            hole_punch_count: 5,
            hole_punch_spacing: Duration::from_millis(100),
            disconnect_repeat: 3,
            disconnect_spacing: Duration::from_millis(50),
        }
    }
}

/// Framed UDP transport for a single peer connection
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: TransportConfig,

    state: Arc<StateMachine>,
    peer: PeerLink,
    peer_endpoint: Mutex<Option<SocketAddr>>,

    running: AtomicBool,
    next_sequence: AtomicU32,
    pending_acks: Mutex<HashMap<u32, Instant>>,

    message_sink: Mutex<Option<Arc<dyn MessageSink>>>,

    /// Bumped to retire the active keep-alive task
    keepalive_generation: AtomicU64,
    shutdown_notify: Notify,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Wrap the already-bound socket handed over from STUN.
    pub fn new(socket: UdpSocket, state: Arc<StateMachine>) -> NetworkResult<Self> {
        Self::with_config(socket, state, TransportConfig::default())
    }

    pub fn with_config(
        socket: UdpSocket,
        state: Arc<StateMachine>,
        config: TransportConfig,
    ) -> NetworkResult<Self> {
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            state,
            peer: PeerLink::new(),
            peer_endpoint: Mutex::new(None),
            running: AtomicBool::new(false),
            next_sequence: AtomicU32::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            message_sink: Mutex::new(None),
            keepalive_generation: AtomicU64::new(0),
            shutdown_notify: Notify::new(),
            recv_task: Mutex::new(None),
        })
    }

    /// Install the sink that receives bridged payloads. Must be called
    /// before `start_listening`.
    pub fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.message_sink.lock().unwrap() = Some(sink);
    }

    /// Begin asynchronous receiving on the socket.
    pub fn start_listening(self: &Arc<Self>) -> NetworkResult<()> {
        self.raise_socket_buffers();
        self.running.store(true, Ordering::Release);

        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            transport.receive_loop().await;
        });
        *self.recv_task.lock().unwrap() = Some(handle);

        info!("Transport listening on UDP {}", self.local_addr);
        Ok(())
    }

    /// Record the peer endpoint and start hole punching toward it.
    pub fn connect_to_peer(self: &Arc<Self>, ip: IpAddr, port: u16) -> NetworkResult<()> {
        if self.peer.is_connected() {
            warn!("Already connected to a peer, refusing new connection");
            return Err(NetworkError::AlreadyConnected);
        }

        let endpoint = SocketAddr::new(ip, port);
        *self.peer_endpoint.lock().unwrap() = Some(endpoint);
        self.running.store(true, Ordering::Release);

        info!("Starting UDP hole punching to {}", endpoint);
        self.state.set_state(SystemState::Connecting);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.hole_punch_train().await;
        });

        Ok(())
    }

    /// Frame `payload` as a message and dispatch it to the peer.
    ///
    /// The send itself is fire-and-forget; backpressure drops are
    /// resolved by removing the pending acknowledgement.
    pub fn send_message(self: &Arc<Self>, payload: Bytes) -> NetworkResult<()> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        if HEADER_LEN + payload.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::MessageTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let Some(endpoint) = self.current_peer_endpoint() else {
            return Err(NetworkError::NotRunning);
        };

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.pending_acks
            .lock()
            .unwrap()
            .insert(sequence, Instant::now());

        let frame = Frame::message(sequence, payload);
        self.dispatch_frame(frame, endpoint, Some(sequence));
        Ok(())
    }

    /// Notify the peer and drop the connection, keeping the transport
    /// alive for a new one. Idempotent.
    pub async fn stop_connection(self: &Arc<Self>) {
        self.send_disconnect_notification().await;

        self.peer.set_connected(false);
        self.running.store(false, Ordering::Release);
        self.keepalive_generation.fetch_add(1, Ordering::AcqRel);
        self.pending_acks.lock().unwrap().clear();

        self.state.set_state(SystemState::Idle);
        info!("Stopped connection to peer");
    }

    /// Final teardown: stop any connection, cancel the receive task and
    /// release the socket. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.peer.is_connected() {
            self.stop_connection().await;
        }

        self.running.store(false, Ordering::Release);
        self.peer.set_connected(false);
        self.keepalive_generation.fetch_add(1, Ordering::AcqRel);
        self.state.set_state(SystemState::ShuttingDown);

        self.shutdown_notify.notify_waiters();
        let handle = self.recv_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("Network transport shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn current_peer_endpoint(&self) -> Option<SocketAddr> {
        *self.peer_endpoint.lock().unwrap()
    }

    /// Number of sent messages still waiting for an acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap().len()
    }

    fn raise_socket_buffers(&self) {
        let sock = socket2::SockRef::from(self.socket.as_ref());
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("Failed to raise receive buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            warn!("Failed to raise send buffer: {}", e);
        }
    }

    /// Send the initial hole-punch train, then hand over to the
    /// keep-alive timer.
    async fn hole_punch_train(self: Arc<Self>) {
        for _ in 0..self.config.hole_punch_count {
            self.send_hole_punch();
            sleep(self.config.hole_punch_spacing).await;
        }

        let generation = self.keepalive_generation.load(Ordering::Acquire);
        let transport = Arc::clone(&self);
        tokio::spawn(async move {
            transport.keepalive_loop(generation).await;
        });
    }

    /// Periodic keep-alive: refresh the NAT pinhole and watch for the
    /// idle timeout while a peer is connected.
    async fn keepalive_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = interval(self.config.keepalive_interval);
        ticker.tick().await; // first tick fires immediately

        loop {
            ticker.tick().await;

            if !self.is_running()
                || self.keepalive_generation.load(Ordering::Acquire) != generation
            {
                debug!("Keep-alive timer stopped");
                return;
            }

            self.send_hole_punch();

            if self.peer.is_connected() && self.peer.has_timed_out(self.config.idle_timeout) {
                error!(
                    "Connection timeout: no packets received for {:?} (threshold {:?})",
                    self.peer.idle_time(),
                    self.config.idle_timeout
                );
                self.peer.set_connected(false);
                self.state.queue_event(NetworkEvent::AllPeersDisconnected);
            }
        }
    }

    fn send_hole_punch(self: &Arc<Self>) {
        let Some(endpoint) = self.current_peer_endpoint() else {
            return;
        };
        trace!(target: "net", "Sending hole-punch / keep-alive to {}", endpoint);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.dispatch_frame(Frame::control(FrameType::HolePunch, sequence), endpoint, None);
    }

    /// Best-effort disconnect train, sent while the transport is still
    /// running so the frames actually leave the socket.
    async fn send_disconnect_notification(self: &Arc<Self>) {
        if !self.peer.is_connected() {
            return;
        }
        let Some(endpoint) = self.current_peer_endpoint() else {
            return;
        };

        info!("Sending disconnect notification to {}", endpoint);
        for _ in 0..self.config.disconnect_repeat {
            let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            self.dispatch_frame(Frame::control(FrameType::Disconnect, sequence), endpoint, None);
            sleep(self.config.disconnect_spacing).await;
        }
    }

    /// Fire-and-forget send. The frame buffer moves into the task and is
    /// dropped on completion. `pending` names the acknowledgement entry
    /// to discard when the send is dropped for backpressure.
    fn dispatch_frame(self: &Arc<Self>, frame: Frame, target: SocketAddr, pending: Option<u32>) {
        let transport = Arc::clone(self);
        let bytes = frame.encode();

        tokio::spawn(async move {
            match transport.socket.send_to(&bytes, target).await {
                Ok(_) => {}
                Err(e) if is_would_block(&e) => {
                    if let Some(sequence) = pending {
                        debug!(
                            "Send buffer full, dropping packet seq={} (no retransmit)",
                            sequence
                        );
                        transport.pending_acks.lock().unwrap().remove(&sequence);
                    }
                }
                Err(e) if !transport.is_running() => {
                    trace!("Send after shutdown ignored: {}", e);
                }
                Err(e) => {
                    error!("Send error: {}", e);
                    transport.handle_disconnect();
                }
            }
        });
    }

    /// Continuously re-armed receive. Each iteration reads into a fresh
    /// buffer so concurrent handling never aliases it.
    async fn receive_loop(self: Arc<Self>) {
        // Pinned once so a notification arriving while a datagram is
        // being processed still terminates the loop
        let shutdown = self.shutdown_notify.notified();
        tokio::pin!(shutdown);

        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            let received = tokio::select! {
                _ = &mut shutdown => break,
                res = self.socket.recv_from(&mut buf) => res,
            };

            match received {
                Ok((len, from)) => {
                    buf.truncate(len);
                    self.process_datagram(Bytes::from(buf), from);
                }
                Err(e) if is_would_block(&e) => {
                    trace!("Recoverable receive error: {}", e);
                }
                Err(e) => {
                    if !self.is_running() {
                        break;
                    }
                    error!("Fatal receive error: {}, disconnecting", e);
                    self.handle_disconnect();
                    break;
                }
            }
        }
        debug!("Receive task finished");
    }

    fn process_datagram(self: &Arc<Self>, data: Bytes, sender: SocketAddr) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "net", "Dropping datagram from {}: {}", sender, e);
                return;
            }
        };

        self.peer.update_activity();

        // Disconnect is exempt from the running guard so a remote
        // teardown can land while local shutdown is in progress.
        if frame.frame_type != FrameType::Disconnect {
            if !self.is_running() {
                debug!("Received {:?} frame while not running, dropping", frame.frame_type);
                return;
            }

            if !self.peer.is_connected() {
                info!("First valid frame received, peer is {}", sender);
                *self.peer_endpoint.lock().unwrap() = Some(sender);
                self.peer.set_connected(true);
                self.state.queue_event(NetworkEvent::PeerConnected(sender));
            }
        }

        match frame.frame_type {
            FrameType::HolePunch => {
                trace!(target: "net", "Hole-punch frame from {}", sender);
            }
            FrameType::Heartbeat => {
                trace!(target: "net", "Heartbeat frame from {}", sender);
            }
            FrameType::Disconnect => {
                info!("Peer sent disconnect notification");
                self.handle_disconnect();
            }
            FrameType::Message => {
                self.dispatch_frame(
                    Frame::control(FrameType::Ack, frame.sequence),
                    sender,
                    None,
                );

                let sink = self.message_sink.lock().unwrap().clone();
                if let Some(sink) = sink {
                    sink.on_message(frame.payload);
                }
            }
            FrameType::Ack => {
                self.pending_acks.lock().unwrap().remove(&frame.sequence);
            }
        }
    }

    /// Shared path for remote disconnects, timeouts and fatal errors.
    fn handle_disconnect(&self) {
        if !self.peer.is_connected() {
            return;
        }
        self.peer.set_connected(false);
        self.state.queue_event(NetworkEvent::AllPeersDisconnected);
    }
}

fn is_would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
