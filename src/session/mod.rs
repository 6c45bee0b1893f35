//! Session Orchestrator
//!
//! A session owns one transport connection and, once negotiated, one virtual
//! interface. It moves through `Connected -> Negotiated -> Configured ->
//! Forwarding -> TornDown`; teardown reverses only the configuration steps
//! that were applied and runs at most once.

mod initiator;
mod responder;

pub use initiator::Initiator;
pub use responder::Responder;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::device::{DeviceProvider, DeviceStream, VirtualInterface};
use crate::error::{Error, Result};
use crate::forward::{self, shutdown_requested, Termination};
use crate::handshake::{self, TunnelParams, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::netconfig::{NetworkConfig, NetworkConfigurator, Route, DEFAULT_EXTERNAL_INTERFACE};

/// Which end of the tunnel this host is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the peer and declares the tunnel parameters
    Initiator,
    /// Accepts connections and learns the parameters from the peer
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Negotiated,
    Configured,
    Forwarding,
    TornDown,
}

/// How far network configuration got; steps are applied in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigState {
    Unconfigured,
    AddressAssigned,
    RoutesApplied,
    MasqueradeApplied,
}

/// Settings shared by every session of a process
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Address assigned to the local virtual interface
    pub if_address: IpAddr,
    /// Bound for the whole handshake
    pub handshake_timeout: Duration,
    /// Egress device for masquerading; detected when unset
    pub external_interface: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            if_address: IpAddr::V4(Ipv4Addr::new(192, 168, 166, 1)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            external_interface: None,
        }
    }
}

/// Summary of a finished session
#[derive(Debug)]
pub struct SessionReport {
    /// Parameters agreed during the handshake
    pub remote: TunnelParams,
    /// Why forwarding stopped
    pub termination: Termination,
}

/// One tunnel over one transport connection
pub struct Session<T, D> {
    role: Role,
    state: SessionState,
    config_state: ConfigState,
    options: SessionOptions,
    configurator: Arc<dyn NetworkConfigurator>,
    transport: Option<BufReader<T>>,
    interface: Option<VirtualInterface<D>>,
    network: Option<NetworkConfig>,
    ext_device: Option<String>,
    remote: TunnelParams,
}

impl<T, D> Session<T, D>
where
    T: DeviceStream,
    D: DeviceStream,
{
    pub fn new(role: Role, transport: T, configurator: Arc<dyn NetworkConfigurator>, options: SessionOptions) -> Self {
        Self {
            role,
            state: SessionState::Connected,
            config_state: ConfigState::Unconfigured,
            options,
            configurator,
            transport: Some(BufReader::new(transport)),
            interface: None,
            network: None,
            ext_device: None,
            remote: TunnelParams::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config_state(&self) -> ConfigState {
        self.config_state
    }

    /// Parameters agreed during the handshake
    pub fn remote(&self) -> &TunnelParams {
        &self.remote
    }

    /// Network configuration, once the interface exists
    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::Transport(format!(
                "Session is {:?}, expected {:?}",
                self.state, expected
            )));
        }
        Ok(())
    }

    /// Exchange tunnel parameters with the peer
    pub async fn negotiate(&mut self, local: &TunnelParams) -> Result<()> {
        self.expect_state(SessionState::Connected)?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Transport("Session transport already closed".into()))?;

        let remote = handshake::negotiate(transport, self.role, local, self.options.handshake_timeout).await?;
        info!(
            "Negotiated tunnel as {}: remote network {:?}, remote gateway {:?}",
            self.role, remote.remote_network, remote.remote_gateway
        );
        self.remote = remote;
        self.state = SessionState::Negotiated;
        Ok(())
    }

    /// Create the interface and apply the network configuration.
    ///
    /// Stops at the first failing step; [`Session::teardown`] undoes whatever
    /// was applied before it.
    pub async fn configure<P>(&mut self, provider: &P) -> Result<()>
    where
        P: DeviceProvider<Device = D>,
    {
        self.expect_state(SessionState::Negotiated)?;

        // The initiator routes into its own end of the tunnel
        let gateway = match self.role {
            Role::Initiator => self.options.if_address.to_string(),
            Role::Responder => self.remote.remote_gateway.clone(),
        };
        let route = Route::resolve(&self.remote.remote_network, &gateway)?;
        let masquerade = self.role == Role::Responder && self.configurator.supports_masquerade();

        info!("Create Host Interface ...");
        let interface = provider.create().await?;
        let network = NetworkConfig::new(self.options.if_address, interface.name(), route, masquerade);
        self.interface = Some(interface);
        self.network = Some(network.clone());

        info!("Setup Interface Network on {} ({})", network.device(), self.configurator.platform());
        self.configurator.setup_network(&network).await?;
        self.config_state = ConfigState::AddressAssigned;
        info!("Interface Up: {}", network.device());

        if let Some(route) = network.route() {
            info!("Add route {}", route);
        }
        self.configurator.create_routes(&network).await?;
        self.config_state = ConfigState::RoutesApplied;

        if network.masquerade() && network.route().is_some() {
            let ext_device = self.external_device().await;
            info!("Add Masquerade on interface {}", ext_device);
            self.configurator.create_masquerade(&network, &ext_device).await?;
            self.ext_device = Some(ext_device);
            self.config_state = ConfigState::MasqueradeApplied;
        }

        self.state = SessionState::Configured;
        Ok(())
    }

    async fn external_device(&self) -> String {
        if let Some(dev) = &self.options.external_interface {
            return dev.clone();
        }
        match self.configurator.external_interface().await {
            Some(dev) => dev,
            None => {
                warn!(
                    "Could not detect external interface, using {}",
                    DEFAULT_EXTERNAL_INTERFACE
                );
                DEFAULT_EXTERNAL_INTERFACE.to_string()
            }
        }
    }

    /// Forward packets until either direction stops or shutdown is requested
    pub async fn forward(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Termination> {
        self.expect_state(SessionState::Configured)?;
        let (Some(transport), Some(interface)) = (self.transport.take(), self.interface.take()) else {
            return Err(Error::Transport("Session resources already released".into()));
        };
        let (device, name) = interface.into_parts();

        self.state = SessionState::Forwarding;
        info!("Running the tunnel over {}", name);
        let forwarded = forward::forward(transport, device, shutdown).await?;

        self.transport = Some(forwarded.transport);
        self.interface = Some(VirtualInterface::new(forwarded.device, name));
        Ok(forwarded.termination)
    }

    /// Undo configuration in reverse order, then release the interface and
    /// close the transport. Failures are logged and never stop later steps;
    /// calling this again has no effect.
    pub async fn teardown(&mut self) {
        if self.state == SessionState::TornDown {
            return;
        }
        info!("Shutting down the {} session...", self.role);

        if let Some(network) = &self.network {
            if self.config_state >= ConfigState::MasqueradeApplied {
                if let Some(ext_device) = &self.ext_device {
                    if let Err(e) = self.configurator.delete_masquerade(network, ext_device).await {
                        warn!("Error deleting masquerade rules: {}", e);
                    }
                }
            }
            if self.config_state >= ConfigState::RoutesApplied {
                if let Err(e) = self.configurator.delete_routes(network).await {
                    warn!("Error deleting routes: {}", e);
                }
            }
        }
        self.config_state = ConfigState::Unconfigured;

        if let Some(interface) = self.interface.take() {
            info!("Releasing interface {}", interface.name());
            drop(interface);
        }
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown().await {
                tracing::debug!("Transport shutdown: {}", e);
            }
        }

        self.state = SessionState::TornDown;
    }

    /// Drive the whole lifecycle and always tear down afterwards
    pub async fn run<P>(
        mut self,
        local: &TunnelParams,
        provider: &P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionReport>
    where
        P: DeviceProvider<Device = D>,
    {
        let result = self.drive(local, provider, shutdown).await;
        if let Err(e) = &result {
            tracing::error!("Session aborted in state {:?}: {}", self.state, e);
        }
        self.teardown().await;

        Ok(SessionReport {
            remote: self.remote.clone(),
            termination: result?,
        })
    }

    async fn drive<P>(
        &mut self,
        local: &TunnelParams,
        provider: &P,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Termination>
    where
        P: DeviceProvider<Device = D>,
    {
        tokio::select! {
            result = self.negotiate(local) => result?,
            _ = shutdown_requested(shutdown) => return Ok(Termination::Shutdown),
        }
        self.configure(provider).await?;
        self.forward(shutdown).await
    }
}
