//! TUN device abstraction
//!
//! Platform-agnostic interface to the userland tunnel adapter, plus the
//! packet-processing runner that moves packets between the device and a
//! [`PacketSink`]. The device is created up but unaddressed; the config
//! applier assigns the virtual IP once the session knows its role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{NetworkError, NetworkResult};

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod unix;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use unix::NativeTun;

/// TUN device configuration
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name (e.g., "PeerBridge")
    pub name: String,

    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "PeerBridge".to_string(),
            mtu: 1420,
        }
    }
}

/// Platform-agnostic TUN device
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one IP packet from the device
    async fn read_packet(&self) -> NetworkResult<Bytes>;

    /// Write one IP packet to the device
    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Device name
    fn name(&self) -> &str;

    /// Device MTU
    fn mtu(&self) -> u16;
}

/// Create a TUN device for the current platform
pub async fn create_tun(config: TunConfig) -> NetworkResult<Box<dyn TunDevice>> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let tun = NativeTun::create(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = config;
        Err(crate::error::NetworkError::TunError(
            "Platform not supported".into(),
        ))
    }
}

/// Consumer of packets read from the device (the outbound bridge).
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, packet: Bytes);
}

/// Drives packet processing on a TUN device: a read task feeding the
/// installed [`PacketSink`] and a write task draining the outbound
/// queue. Started and stopped per connection by the supervisor.
pub struct TunRunner {
    device: Arc<dyn TunDevice>,
    running: AtomicBool,
    stop: Notify,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunRunner {
    pub fn new(device: Box<dyn TunDevice>) -> Self {
        Self {
            device: Arc::from(device),
            running: AtomicBool::new(false),
            stop: Notify::new(),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> String {
        self.device.name().to_string()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the read and write tasks.
    pub fn start_packet_processing(
        self: &Arc<Self>,
        sink: Arc<dyn PacketSink>,
    ) -> NetworkResult<()> {
        if self.is_running() {
            return Err(NetworkError::TunError(
                "Packet processing already running".into(),
            ));
        }
        self.running.store(true, Ordering::Release);

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *self.outbound.lock().unwrap() = Some(tx);

        let reader = Arc::clone(self);
        let read_task = tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = reader.stop.notified() => break,
                    res = reader.device.read_packet() => res,
                };

                match packet {
                    Ok(packet) => sink.on_packet(packet),
                    Err(e) => {
                        if reader.is_running() {
                            error!("TUN read failed: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("TUN read task finished");
        });

        let writer = Arc::clone(self);
        let write_task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = writer.device.write_packet(&packet).await {
                    // Drop the packet; the tunnel itself is unreliable
                    warn!("TUN write failed: {}", e);
                }
            }
            debug!("TUN write task finished");
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(read_task);
        tasks.push(write_task);

        info!("Packet processing started on {}", self.name());
        Ok(())
    }

    /// Queue a packet for delivery into the device.
    pub fn send_packet(&self, packet: Bytes) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(packet).is_ok(),
            None => false,
        }
    }

    /// Stop both tasks and drop any queued packets.
    pub async fn stop_packet_processing(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.stop.notify_waiters();
        // Closing the channel ends the write task
        self.outbound.lock().unwrap().take();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!("Packet processing stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// In-memory device: reads pop from a queue, writes land in a log.
    struct FakeTun {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
        written: Arc<StdMutex<Vec<Bytes>>>,
    }

    fn fake_tun() -> (
        mpsc::UnboundedSender<Bytes>,
        Arc<StdMutex<Vec<Bytes>>>,
        Box<FakeTun>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(StdMutex::new(Vec::new()));
        let device = FakeTun {
            inbound: tokio::sync::Mutex::new(rx),
            written: Arc::clone(&written),
        };
        (tx, written, Box::new(device))
    }

    #[async_trait]
    impl TunDevice for FakeTun {
        async fn read_packet(&self) -> NetworkResult<Bytes> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| NetworkError::TunError("closed".into()))
        }

        async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
            self.written
                .lock()
                .unwrap()
                .push(Bytes::copy_from_slice(packet));
            Ok(())
        }

        fn name(&self) -> &str {
            "fake0"
        }

        fn mtu(&self) -> u16 {
            1420
        }
    }

    struct CollectSink(mpsc::UnboundedSender<Bytes>);

    impl PacketSink for CollectSink {
        fn on_packet(&self, packet: Bytes) {
            let _ = self.0.send(packet);
        }
    }

    #[tokio::test]
    async fn read_path_reaches_the_sink() {
        let (device_tx, _written, device) = fake_tun();
        let runner = Arc::new(TunRunner::new(device));

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        runner
            .start_packet_processing(Arc::new(CollectSink(sink_tx)))
            .unwrap();

        device_tx.send(Bytes::from_static(&[0x45, 1, 2, 3])).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &[0x45, 1, 2, 3]);

        runner.stop_packet_processing().await;
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn write_path_reaches_the_device() {
        let (_device_tx, written, device) = fake_tun();

        let runner = Arc::new(TunRunner::new(device));
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        runner
            .start_packet_processing(Arc::new(CollectSink(sink_tx)))
            .unwrap();

        assert!(runner.send_packet(Bytes::from_static(&[0x45, 9, 9])));

        for _ in 0..100 {
            if !written.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(&written.lock().unwrap()[0][..], &[0x45, 9, 9]);

        runner.stop_packet_processing().await;
        // Queueing after stop is refused
        assert!(!runner.send_packet(Bytes::from_static(&[1])));
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let (_tx, _written, device) = fake_tun();
        let runner = Arc::new(TunRunner::new(device));

        let (sink_tx, _rx) = mpsc::unbounded_channel();
        runner
            .start_packet_processing(Arc::new(CollectSink(sink_tx.clone())))
            .unwrap();
        assert!(runner
            .start_packet_processing(Arc::new(CollectSink(sink_tx)))
            .is_err());

        runner.stop_packet_processing().await;
    }
}

