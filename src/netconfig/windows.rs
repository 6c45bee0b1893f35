//! Windows network configuration using netsh

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandRunner, NetCommand, NetworkConfig, NetworkConfigurator};
use crate::error::Result;

/// Windows strategy; only the interface address is managed
pub struct WindowsConfigurator {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsConfigurator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NetworkConfigurator for WindowsConfigurator {
    fn platform(&self) -> &'static str {
        "windows"
    }

    async fn setup_network(&self, config: &NetworkConfig) -> Result<()> {
        // A host mask is enough, traffic reaches the interface through the route
        let command = NetCommand::new("netsh", ["interface", "ip", "set", "address"])
            .arg(format!("name={}", config.device()))
            .arg("source=static")
            .arg(format!("addr={}", config.local_address()))
            .arg("mask=255.255.255.255")
            .arg("gateway=none");
        self.runner.run(&command).await.map(drop)
    }

    // TODO: install routes with `route add`/`netsh interface ip add route` once interface indexes are tracked
    async fn create_routes(&self, _config: &NetworkConfig) -> Result<()> {
        Ok(())
    }

    async fn delete_routes(&self, _config: &NetworkConfig) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconfig::Route;
    use crate::testing::RecordingRunner;

    #[tokio::test]
    async fn test_windows_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let windows = WindowsConfigurator::new(runner.clone());
        let cfg = NetworkConfig::new(
            "10.0.0.1".parse().unwrap(),
            "tuncat0",
            Route::resolve("10.1.0.0/24", "10.0.0.2").unwrap(),
            true,
        );

        windows.setup_network(&cfg).await.unwrap();
        windows.create_routes(&cfg).await.unwrap();
        windows.create_masquerade(&cfg, "Ethernet").await.unwrap();
        windows.delete_masquerade(&cfg, "Ethernet").await.unwrap();
        windows.delete_routes(&cfg).await.unwrap();
        assert_eq!(
            runner.commands(),
            vec!["netsh interface ip set address name=tuncat0 source=static addr=10.0.0.1 mask=255.255.255.255 gateway=none"]
        );
    }
}
