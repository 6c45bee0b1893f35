//! Responder Driver
//!
//! Accepts initiators one at a time; each connection gets its own session,
//! which is torn down before the next connection is accepted.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use super::{Role, Session, SessionOptions};
use crate::device::DeviceProvider;
use crate::error::{Error, Result};
use crate::forward::{shutdown_requested, Termination};
use crate::handshake::TunnelParams;
use crate::netconfig::NetworkConfigurator;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server end of the tunnel
pub struct Responder<P> {
    options: SessionOptions,
    provider: P,
    configurator: Arc<dyn NetworkConfigurator>,
}

impl<P: DeviceProvider> Responder<P> {
    pub fn new(options: SessionOptions, provider: P, configurator: Arc<dyn NetworkConfigurator>) -> Self {
        Self {
            options,
            provider,
            configurator,
        }
    }

    /// Bind `host:port` and serve until shutdown
    pub async fn run(&self, host: &str, port: u16, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::Transport(format!("Can't listen on address {}:{}: {}", host, port, e)))?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener.
    ///
    /// Failed accepts and failed sessions are logged and the loop moves on
    /// to the next connection; only shutdown ends it.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };
            tracing::info!("Accepted connection from {}", peer);
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let session = Session::new(Role::Responder, socket, self.configurator.clone(), self.options.clone());
            match session.run(&TunnelParams::default(), &self.provider, &mut shutdown).await {
                Ok(report) => {
                    if matches!(report.termination, Termination::Shutdown) {
                        break;
                    }
                    tracing::info!("Tunnel with {} closed: {:?}", peer, report.termination);
                }
                Err(e) if e.is_session_fatal() => {
                    tracing::warn!("Can't establish tunnel with {}: {}", peer, e);
                }
                Err(e) => {
                    tracing::info!("Connection from {} dropped: {}", peer, e);
                }
            }
        }

        tracing::info!("Responder stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::forward::Direction;
    use crate::netconfig::LinuxConfigurator;
    use crate::session::Initiator;
    use crate::testing::{ipv4_packet, DuplexProvider, EventLog, RecordingRunner};

    fn linux(log: &EventLog) -> Arc<dyn NetworkConfigurator> {
        Arc::new(LinuxConfigurator::new(Arc::new(RecordingRunner::new().with_log(log.clone()))))
    }

    fn options(if_address: &str) -> SessionOptions {
        SessionOptions {
            if_address: if_address.parse().unwrap(),
            handshake_timeout: Duration::from_secs(5),
            external_interface: Some("eth0".to_string()),
        }
    }

    async fn wait_for(log: &EventLog, prefix: &str) -> usize {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(pos) = log.position(prefix) {
                    return pos;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_tunnel_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let responder_log = EventLog::default();
        let (responder_provider, mut responder_devices) = DuplexProvider::new("tun1", responder_log.clone());
        let responder = Responder::new(options("10.0.0.2"), responder_provider, linux(&responder_log));
        let serve = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { responder.serve(listener, shutdown).await }
        });

        let initiator_log = EventLog::default();
        let (initiator_provider, mut initiator_devices) = DuplexProvider::new("tun0", initiator_log.clone());
        let initiator = Initiator::new(
            "127.0.0.1",
            port,
            TunnelParams::new("10.1.0.0/24", "10.0.0.2"),
            options("10.0.0.1"),
            initiator_provider,
            linux(&initiator_log),
        );
        let connect = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { initiator.run(shutdown).await }
        });

        let mut near = initiator_devices.recv().await.unwrap();
        let mut far = responder_devices.recv().await.unwrap();

        let outbound = ipv4_packet([10, 1, 0, 5], b"ping from the initiator side");
        near.write_all(&outbound).await.unwrap();
        let mut buf = vec![0u8; outbound.len()];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, outbound);

        let inbound = ipv4_packet([10, 0, 0, 1], b"pong");
        far.write_all(&inbound).await.unwrap();
        let mut buf = vec![0u8; inbound.len()];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, inbound);

        // Closing the initiator's interface ends both sessions
        drop(near);
        let report = connect.await.unwrap().unwrap();
        assert_eq!(report.remote, TunnelParams::new("10.1.0.0/24", "10.0.0.2"));
        match report.termination {
            Termination::Finished(outcome) => assert_eq!(outcome.direction, Direction::Outbound),
            Termination::Shutdown => panic!("unexpected shutdown"),
        }
        assert!(initiator_log
            .entries()
            .contains(&"ip route add 10.1.0.0/24 via 10.0.0.1".to_string()));

        let released = wait_for(&responder_log, "release tun1").await;
        let entries = responder_log.entries();
        let route_added = entries
            .iter()
            .position(|e| e == "ip route add 10.1.0.0/24 via 10.0.0.2")
            .unwrap();
        let masquerade_added = entries
            .iter()
            .position(|e| e == "iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE")
            .unwrap();
        assert!(route_added < masquerade_added);
        assert!(entries.contains(&"ip route add table 10 to default via 10.0.0.2".to_string()));
        let rule_removed = responder_log.position("ip rule del").unwrap();
        let route_removed = responder_log.position("ip route del 10.1.0.0/24").unwrap();
        assert!(rule_removed < route_removed);
        assert!(route_removed < released);

        shutdown_tx.send(true).unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_keeps_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let log = EventLog::default();
        let (provider, _devices) = DuplexProvider::new("tun1", log.clone());
        let responder = Responder::new(options("10.0.0.2"), provider, linux(&log));
        let serve = tokio::spawn(async move { responder.serve(listener, shutdown_rx).await });

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"bogusKey:1\n").await.unwrap();

            // The responder closes without echoing
            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).await.unwrap();
            assert!(echoed.is_empty());
        }

        shutdown_tx.send(true).unwrap();
        serve.await.unwrap().unwrap();
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let log = EventLog::default();
        let (provider, _devices) = DuplexProvider::new("tun1", log.clone());
        let responder = Responder::new(SessionOptions::default(), provider, linux(&log));
        let serve = tokio::spawn(async move { responder.serve(listener, shutdown_rx).await });

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serve).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
