//! Virtual network device management
//!
//! The tunnel only needs a byte stream over raw IP packets and the name the
//! OS gave the device. [`TunProvider`] creates real TUN devices through the
//! `tun` crate; the device is released when the handle is dropped.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tun::Device as _;

use crate::error::{Error, Result};

/// Byte stream of a virtual device
pub trait DeviceStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DeviceStream for T {}

/// A created virtual interface
pub struct VirtualInterface<D> {
    device: D,
    name: String,
}

impl<D: DeviceStream> VirtualInterface<D> {
    pub fn new(device: D, name: impl Into<String>) -> Self {
        Self {
            device,
            name: name.into(),
        }
    }

    /// Interface name as seen by the OS
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_parts(self) -> (D, String) {
        (self.device, self.name)
    }
}

/// Creates virtual interfaces
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    type Device: DeviceStream;

    async fn create(&self) -> Result<VirtualInterface<Self::Device>>;
}

/// Creates layer-3 TUN devices
#[derive(Debug, Default, Clone)]
pub struct TunProvider {
    /// Requested device name; the OS picks one when unset
    pub name: Option<String>,
    /// Device MTU; the OS default when unset
    pub mtu: Option<u16>,
}

#[async_trait]
impl DeviceProvider for TunProvider {
    type Device = tun::AsyncDevice;

    async fn create(&self) -> Result<VirtualInterface<Self::Device>> {
        let mut config = tun::Configuration::default();
        config.layer(tun::Layer::L3);
        if let Some(name) = &self.name {
            config.name(name);
        }
        if let Some(mtu) = self.mtu {
            config.mtu(i32::from(mtu));
        }

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| Error::Device(format!("Failed to create TUN device: {}", e)))?;
        let name = device
            .get_ref()
            .name()
            .map_err(|e| Error::Device(format!("Failed to read TUN device name: {}", e)))?;

        tracing::info!("Interface Name: {}", name);
        Ok(VirtualInterface::new(device, name))
    }
}
