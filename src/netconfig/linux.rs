//! Linux network configuration using iproute2 and iptables

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{run_all, run_best_effort, CommandRunner, NetCommand, NetworkConfig, NetworkConfigurator, Route};
use crate::error::Result;

/// Policy routing table that sends return traffic back into the tunnel
const RETURN_TABLE: &str = "10";
/// Priority of the policy rule selecting [`RETURN_TABLE`]
const RETURN_RULE_PRIORITY: &str = "10";

/// Linux strategy; the only one with masquerade support
pub struct LinuxConfigurator {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxConfigurator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn masquerade_rule(action: &str, ext_device: &str) -> NetCommand {
        NetCommand::new(
            "iptables",
            ["-t", "nat", action, "POSTROUTING", "-o", ext_device, "-j", "MASQUERADE"],
        )
    }

    fn return_rule(action: &str, route: &Route) -> NetCommand {
        NetCommand::new("ip", ["rule", action, "from"])
            .arg(route.network)
            .arg("table")
            .arg(RETURN_TABLE)
            .arg("priority")
            .arg(RETURN_RULE_PRIORITY)
    }

    /// Masquerade steps in setup order, each paired with its exact reversal
    fn masquerade_steps(config: &NetworkConfig, route: &Route, ext_device: &str) -> [(NetCommand, NetCommand); 3] {
        let return_route = |action: &str| {
            NetCommand::new("ip", ["route", action, "table", RETURN_TABLE, "to", "default", "via"])
                .arg(config.local_address())
        };
        [
            (Self::masquerade_rule("-A", ext_device), Self::masquerade_rule("-D", ext_device)),
            (return_route("add"), return_route("del")),
            (Self::return_rule("add", route), Self::return_rule("del", route)),
        ]
    }

    /// Reversals of the first `applied` steps, last applied first
    fn undo_applied(steps: &[(NetCommand, NetCommand)], applied: usize) -> Vec<NetCommand> {
        steps[..applied].iter().rev().map(|(_, undo)| undo.clone()).collect()
    }
}

#[async_trait]
impl NetworkConfigurator for LinuxConfigurator {
    fn platform(&self) -> &'static str {
        "linux"
    }

    fn supports_masquerade(&self) -> bool {
        true
    }

    async fn setup_network(&self, config: &NetworkConfig) -> Result<()> {
        let dev = config.device();
        run_all(
            self.runner.as_ref(),
            &[
                NetCommand::new("ip", ["link", "set", dev, "up"]),
                NetCommand::new("ip", ["addr", "add"])
                    .arg(config.local_address())
                    .arg("dev")
                    .arg(dev),
            ],
        )
        .await
    }

    async fn create_routes(&self, config: &NetworkConfig) -> Result<()> {
        let Some(route) = config.route() else {
            return Ok(());
        };
        let command = NetCommand::new("ip", ["route", "add"])
            .arg(route.network)
            .arg("via")
            .arg(route.gateway);
        self.runner.run(&command).await.map(drop)
    }

    async fn delete_routes(&self, config: &NetworkConfig) -> Result<()> {
        let Some(route) = config.route() else {
            return Ok(());
        };
        let command = NetCommand::new("ip", ["route", "del"])
            .arg(route.network)
            .arg("via")
            .arg(route.gateway);
        self.runner.run(&command).await.map(drop)
    }

    async fn create_masquerade(&self, config: &NetworkConfig, ext_device: &str) -> Result<()> {
        let Some(route) = config.route().filter(|_| config.masquerade()) else {
            return Ok(());
        };
        info!("Masquerading {} through {}", route.network, ext_device);

        let steps = Self::masquerade_steps(config, route, ext_device);
        for (applied, (step, _)) in steps.iter().enumerate() {
            if let Err(e) = self.runner.run(step).await {
                // Leave nothing half-applied behind
                warn!("Masquerade setup failed, rolling back: {}", e);
                let _ = run_best_effort(self.runner.as_ref(), &Self::undo_applied(&steps, applied)).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn delete_masquerade(&self, config: &NetworkConfig, ext_device: &str) -> Result<()> {
        let Some(route) = config.route().filter(|_| config.masquerade()) else {
            return Ok(());
        };
        let steps = Self::masquerade_steps(config, route, ext_device);
        run_best_effort(self.runner.as_ref(), &Self::undo_applied(&steps, steps.len())).await
    }

    async fn external_interface(&self) -> Option<String> {
        let command = NetCommand::new("ip", ["route", "show", "default"]);
        let stdout = self.runner.run(&command).await.ok()?;
        parse_default_route_device(&stdout)
    }
}

/// Parse `default via X.X.X.X dev ethN ...` and return `ethN`
fn parse_default_route_device(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|pair| pair[0] == "dev")
        .map(|pair| pair[1].to_string())
}
