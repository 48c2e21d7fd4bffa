//! TUN device implementation for Linux and macOS

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// Native TUN device backed by the `tun` crate
pub struct NativeTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl NativeTun {
    /// Open or create the adapter by name, up but unaddressed.
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .mtu(config.mtu as i32)
            .up();

        #[cfg(target_os = "linux")]
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            NetworkError::TunError(format!("Failed to create TUN device: {}", e))
        })?;

        info!("TUN adapter '{}' initialized (mtu {})", config.name, config.mtu);

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name: config.name,
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl TunDevice for NativeTun {
    async fn read_packet(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let mut device = self.device.lock().await;

        let n = device.read(&mut buf).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to read from TUN: {}", e))
        })?;

        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
        let mut device = self.device.lock().await;

        device.write_all(packet).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to write to TUN: {}", e))
        })?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}

impl Drop for NativeTun {
    fn drop(&mut self) {
        debug!("Closing TUN device: {}", self.name);
    }
}
