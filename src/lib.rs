//! Tuncat - Point-to-point IP tunnel over TCP
//!
//! Connects two hosts with a layer-3 tunnel: each side creates a TUN
//! interface, the peers agree on the remote network in a short line-based
//! handshake, and raw IP packets are then relayed over the TCP connection.
//!
//! # Architecture
//!
//! One side listens (the responder), the other dials in (the initiator).
//! Every connection is a [`session::Session`] that negotiates, configures
//! the host network, forwards packets, and finally tears everything down in
//! reverse order.
//!
//! # Features
//!
//! - TUN device management through the `tun` crate
//! - Route installation on Linux, macOS and Windows
//! - NAT masquerading with policy routing on the Linux responder
//! - Bounded handshake and graceful shutdown on Ctrl-C

pub mod config;
pub mod device;
pub mod error;
pub mod forward;
pub mod handshake;
pub mod netconfig;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::TuncatConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TuncatConfig;
    pub use crate::device::{DeviceProvider, TunProvider, VirtualInterface};
    pub use crate::error::{Error, Result};
    pub use crate::handshake::TunnelParams;
    pub use crate::netconfig::{for_current_platform, NetworkConfigurator, SystemRunner};
    pub use crate::session::{Initiator, Responder, Role, Session, SessionOptions};
}
