//! Initiator Driver
//!
//! Dials the responder once and runs a single session over the connection.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;

use super::{Role, Session, SessionOptions, SessionReport};
use crate::device::DeviceProvider;
use crate::error::{Error, Result};
use crate::handshake::TunnelParams;
use crate::netconfig::NetworkConfigurator;

/// Client end of the tunnel
pub struct Initiator<P> {
    /// Responder host name or address
    remote_host: String,
    /// Responder port
    remote_port: u16,
    /// Parameters announced to the responder
    params: TunnelParams,
    options: SessionOptions,
    provider: P,
    configurator: Arc<dyn NetworkConfigurator>,
}

impl<P: DeviceProvider> Initiator<P> {
    pub fn new(
        remote_host: impl Into<String>,
        remote_port: u16,
        params: TunnelParams,
        options: SessionOptions,
        provider: P,
        configurator: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        Self {
            remote_host: remote_host.into(),
            remote_port,
            params,
            options,
            provider,
            configurator,
        }
    }

    /// Connect and run the session until it ends
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<SessionReport> {
        tracing::info!("Connecting to {}:{}", self.remote_host, self.remote_port);
        let stream = TcpStream::connect((self.remote_host.as_str(), self.remote_port))
            .await
            .map_err(|e| {
                Error::Transport(format!(
                    "Can't connect to server {}:{}: {}",
                    self.remote_host, self.remote_port, e
                ))
            })?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to {}", stream.peer_addr()?);

        let session = Session::new(Role::Initiator, stream, self.configurator.clone(), self.options.clone());
        let report = session.run(&self.params, &self.provider, &mut shutdown).await?;
        tracing::info!("Tunnel closed: {:?}", report.termination);
        Ok(report)
    }
}
