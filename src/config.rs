//! Tuncat Configuration
//!
//! Optional TOML configuration for the tunnel endpoints. Every value here can
//! be overridden from the command line.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::device::TunProvider;
use crate::error::{Error, Result};
use crate::session::SessionOptions;

/// Smallest MTU every IPv4 host must accept
const MIN_MTU: u16 = 68;

/// Main tuncat configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuncatConfig {
    /// Tunnel endpoint configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tunnel endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Address assigned to the local virtual interface
    #[serde(default = "default_if_address")]
    pub if_address: String,

    /// Upper bound for the parameter handshake, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Egress device used for masquerading (detected when unset)
    #[serde(default)]
    pub external_interface: Option<String>,

    /// Requested TUN device name (chosen by the OS when unset)
    #[serde(default)]
    pub device_name: Option<String>,

    /// TUN device MTU (OS default when unset)
    #[serde(default)]
    pub mtu: Option<u16>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_if_address() -> String {
    "192.168.166.1".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            if_address: default_if_address(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            external_interface: None,
            device_name: None,
            mtu: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TuncatConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: TuncatConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        parse_if_address(&self.tunnel.if_address)
            .map_err(|e| Error::Config(format!("tunnel.if_address: {}", e)))?;

        if self.tunnel.handshake_timeout_secs == 0 {
            return Err(Error::Config(
                "tunnel.handshake_timeout_secs must be greater than zero".into(),
            ));
        }

        if let Some(dev) = &self.tunnel.external_interface {
            if dev.trim().is_empty() {
                return Err(Error::Config("tunnel.external_interface cannot be empty".into()));
            }
        }

        if let Some(name) = &self.tunnel.device_name {
            if name.trim().is_empty() {
                return Err(Error::Config("tunnel.device_name cannot be empty".into()));
            }
        }

        if let Some(mtu) = self.tunnel.mtu {
            if mtu < MIN_MTU {
                return Err(Error::Config(format!(
                    "tunnel.mtu must be at least {}",
                    MIN_MTU
                )));
            }
        }

        Ok(())
    }

    /// Get handshake timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel.handshake_timeout_secs)
    }

    /// TUN provider for the configured device name and MTU
    pub fn tun_provider(&self) -> TunProvider {
        TunProvider {
            name: self.tunnel.device_name.clone(),
            mtu: self.tunnel.mtu,
        }
    }

    /// Build the per-session options, letting `if_address` override the file value
    pub fn session_options(&self, if_address: Option<&str>) -> Result<SessionOptions> {
        let address = parse_if_address(if_address.unwrap_or(&self.tunnel.if_address))?;
        Ok(SessionOptions {
            if_address: address,
            handshake_timeout: self.handshake_timeout(),
            external_interface: self.tunnel.external_interface.clone(),
        })
    }
}

/// Parse the address of the local virtual interface
pub fn parse_if_address(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid interface IP address {:?}", value)))
}

/// Validate a remote network and reduce it to its network address.
///
/// An empty value means "no remote network" and is passed through unchanged.
pub fn normalize_network(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(String::new());
    }
    let net: IpNet = value
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid remote network {:?}", value)))?;
    Ok(net.trunc().to_string())
}

/// Validate a remote gateway; empty is allowed
pub fn validate_gateway(value: &str) -> Result<String> {
    let value = value.trim();
    if !value.is_empty() && value.parse::<IpAddr>().is_err() {
        return Err(Error::Validation(format!(
            "Invalid remote gateway IP address {:?}",
            value
        )));
    }
    Ok(value.to_string())
}
