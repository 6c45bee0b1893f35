//! macOS network configuration using ifconfig and route

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandRunner, NetCommand, NetworkConfig, NetworkConfigurator};
use crate::error::Result;

/// macOS strategy; masquerading is not available
pub struct MacosConfigurator {
    runner: Arc<dyn CommandRunner>,
}

impl MacosConfigurator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn route(&self, action: &str, config: &NetworkConfig) -> Result<()> {
        let Some(route) = config.route() else {
            return Ok(());
        };
        let command = NetCommand::new("route", ["-n", action])
            .arg(route.network)
            .arg(route.gateway);
        self.runner.run(&command).await.map(drop)
    }
}

#[async_trait]
impl NetworkConfigurator for MacosConfigurator {
    fn platform(&self) -> &'static str {
        "macos"
    }

    async fn setup_network(&self, config: &NetworkConfig) -> Result<()> {
        // utun is point-to-point: local and destination are the same address
        let address = config.local_address();
        let command = NetCommand::new("ifconfig", [config.device(), "inet"])
            .arg(address)
            .arg(address)
            .arg("up");
        self.runner.run(&command).await.map(drop)
    }

    async fn create_routes(&self, config: &NetworkConfig) -> Result<()> {
        self.route("add", config).await
    }

    async fn delete_routes(&self, config: &NetworkConfig) -> Result<()> {
        self.route("delete", config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netconfig::Route;
    use crate::testing::RecordingRunner;

    #[tokio::test]
    async fn test_macos_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let macos = MacosConfigurator::new(runner.clone());
        let cfg = NetworkConfig::new(
            "10.0.0.1".parse().unwrap(),
            "utun4",
            Route::resolve("10.1.0.0/24", "10.0.0.1").unwrap(),
            false,
        );

        macos.setup_network(&cfg).await.unwrap();
        macos.create_routes(&cfg).await.unwrap();
        macos.delete_routes(&cfg).await.unwrap();
        assert_eq!(
            runner.commands(),
            vec![
                "ifconfig utun4 inet 10.0.0.1 10.0.0.1 up",
                "route -n add 10.1.0.0/24 10.0.0.1",
                "route -n delete 10.1.0.0/24 10.0.0.1",
            ]
        );
    }

    #[tokio::test]
    async fn test_masquerade_unsupported() {
        let runner = Arc::new(RecordingRunner::new());
        let macos = MacosConfigurator::new(runner.clone());
        let cfg = NetworkConfig::new(
            "10.0.0.1".parse().unwrap(),
            "utun4",
            Route::resolve("10.1.0.0/24", "10.0.0.2").unwrap(),
            true,
        );

        assert!(!macos.supports_masquerade());
        macos.create_masquerade(&cfg, "en0").await.unwrap();
        macos.delete_masquerade(&cfg, "en0").await.unwrap();
        assert!(macos.external_interface().await.is_none());
        assert!(runner.commands().is_empty());
    }
}
