//! Network Configuration Module
//!
//! Platform strategies that assign the interface address, install the route
//! to the remote network and, where supported, enable NAT masquerading.
//! Every strategy drives the OS through a [`CommandRunner`] so the exact
//! command lines can be recorded instead of executed.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxConfigurator;
pub use macos::MacosConfigurator;
pub use windows::WindowsConfigurator;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::{Error, Result};

/// Egress device used for masquerading when none is configured or detected
pub const DEFAULT_EXTERNAL_INTERFACE: &str = "eth0";

/// A route to the remote network through the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub network: IpNet,
    pub gateway: IpAddr,
}

impl Route {
    /// Build a route from negotiated values.
    ///
    /// An empty network means there is nothing to route and yields `None`.
    pub fn resolve(network: &str, gateway: &str) -> Result<Option<Route>> {
        let network = network.trim();
        if network.is_empty() {
            return Ok(None);
        }
        let network: IpNet = network
            .parse()
            .map_err(|_| Error::Validation(format!("Invalid remote network {:?}", network)))?;
        let gateway: IpAddr = gateway.trim().parse().map_err(|_| {
            Error::Validation(format!("Invalid gateway {:?} for route to {}", gateway, network))
        })?;
        Ok(Some(Route {
            network: network.trunc(),
            gateway,
        }))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.network, self.gateway)
    }
}

/// Network configuration of one tunnel interface
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    local_address: IpAddr,
    device: String,
    route: Option<Route>,
    masquerade: bool,
}

impl NetworkConfig {
    pub fn new(local_address: IpAddr, device: impl Into<String>, route: Option<Route>, masquerade: bool) -> Self {
        Self {
            local_address,
            device: device.into(),
            route,
            masquerade,
        }
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// Whether return traffic should be masqueraded for this interface
    pub fn masquerade(&self) -> bool {
        self.masquerade
    }
}

/// A single external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetCommand {
    program: &'static str,
    args: Vec<String>,
}

impl NetCommand {
    pub fn new<I>(program: &'static str, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToString,
    {
        Self {
            program,
            args: args.into_iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn program(&self) -> &str {
        self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for NetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes network commands, returning their standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &NetCommand) -> Result<String>;
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &NetCommand) -> Result<String> {
        tracing::debug!("Running `{}`", command);

        let output = tokio::process::Command::new(command.program())
            .args(command.args())
            .output()
            .await
            .map_err(|e| Error::Configuration {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Configuration {
                command: command.to_string(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Platform network configuration strategy.
///
/// The delete operations are safe to call when the matching create never ran,
/// and route and masquerade operations succeed without side effects when the
/// configuration carries no route.
#[async_trait]
pub trait NetworkConfigurator: Send + Sync {
    /// Short platform name used in logs
    fn platform(&self) -> &'static str;

    /// Whether this platform can masquerade tunnel traffic
    fn supports_masquerade(&self) -> bool {
        false
    }

    /// Assign the local address to the device and bring it up
    async fn setup_network(&self, config: &NetworkConfig) -> Result<()>;

    /// Install the route to the remote network
    async fn create_routes(&self, config: &NetworkConfig) -> Result<()>;

    /// Remove the route to the remote network
    async fn delete_routes(&self, config: &NetworkConfig) -> Result<()>;

    /// Masquerade tunnel egress through `ext_device`
    async fn create_masquerade(&self, _config: &NetworkConfig, _ext_device: &str) -> Result<()> {
        Ok(())
    }

    /// Undo [`NetworkConfigurator::create_masquerade`]
    async fn delete_masquerade(&self, _config: &NetworkConfig, _ext_device: &str) -> Result<()> {
        Ok(())
    }

    /// Egress device of the default route, if the platform can tell
    async fn external_interface(&self) -> Option<String> {
        None
    }
}

/// Select the strategy for the platform this binary was built for
pub fn for_current_platform(runner: Arc<dyn CommandRunner>) -> Arc<dyn NetworkConfigurator> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxConfigurator::new(runner))
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(MacosConfigurator::new(runner))
    }
    #[cfg(target_os = "windows")]
    {
        Arc::new(WindowsConfigurator::new(runner))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        compile_error!("tuncat supports Linux, macOS and Windows only");
    }
}

/// Run commands in order, stopping at the first failure
pub(crate) async fn run_all(runner: &dyn CommandRunner, commands: &[NetCommand]) -> Result<()> {
    for command in commands {
        runner.run(command).await?;
    }
    Ok(())
}

/// Run every command even if some fail, returning the first failure
pub(crate) async fn run_best_effort(runner: &dyn CommandRunner, commands: &[NetCommand]) -> Result<()> {
    let mut first_error = None;
    for command in commands {
        if let Err(e) = runner.run(command).await {
            tracing::warn!("Cleanup step failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
