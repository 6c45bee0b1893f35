//! Forwarding Engine
//!
//! Copies traffic between the transport connection and the virtual device.
//! Each direction runs once in its own task; the first direction to finish
//! ends forwarding and the other one is cancelled. Both resources are handed
//! back to the caller so teardown can release them in order.

use std::fmt;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::DeviceStream;
use crate::error::{Error, Result};

/// Read buffer size for transport -> device reassembly
const READ_BUFFER_SIZE: usize = 64 * 1024;
/// Smallest valid IPv4 header
const IPV4_MIN_HEADER: usize = 20;
/// Fixed IPv6 header
const IPV6_HEADER: usize = 40;

/// Direction of a forwarding task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Virtual device -> transport
    Outbound,
    /// Transport -> virtual device
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("interface -> transport"),
            Direction::Inbound => f.write_str("transport -> interface"),
        }
    }
}

/// Result of one direction's single copy attempt
#[derive(Debug)]
pub struct ForwardOutcome {
    pub direction: Direction,
    pub result: io::Result<u64>,
}

impl ForwardOutcome {
    /// Whether the source reached end-of-stream without error
    pub fn is_clean(&self) -> bool {
        self.result.is_ok()
    }
}

/// Why forwarding stopped
#[derive(Debug)]
pub enum Termination {
    /// One direction finished first
    Finished(ForwardOutcome),
    /// Shutdown was requested while forwarding
    Shutdown,
}

/// Transport and device, returned once forwarding has stopped
pub struct Forwarded<T, D> {
    pub transport: T,
    pub device: D,
    pub termination: Termination,
}

/// Wait until `shutdown` carries `true`; never resolves if the sender is gone
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Forward until either direction finishes or shutdown is requested
pub async fn forward<T, D>(
    transport: T,
    device: D,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Forwarded<T, D>>
where
    T: DeviceStream,
    D: DeviceStream,
{
    let token = CancellationToken::new();
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<ForwardOutcome>(2);

    let (transport_rd, transport_wr) = tokio::io::split(transport);
    let (device_rd, device_wr) = tokio::io::split(device);

    let outbound = tokio::spawn({
        let token = token.clone();
        let outcome_tx = outcome_tx.clone();
        async move {
            let (mut rd, mut wr) = (device_rd, transport_wr);
            tokio::select! {
                result = tokio::io::copy(&mut rd, &mut wr) => {
                    let _ = outcome_tx.send(ForwardOutcome { direction: Direction::Outbound, result }).await;
                }
                _ = token.cancelled() => {}
            }
            (rd, wr)
        }
    });

    let inbound = tokio::spawn({
        let token = token.clone();
        async move {
            let (mut rd, mut wr) = (transport_rd, device_wr);
            tokio::select! {
                result = copy_packets(&mut rd, &mut wr) => {
                    let _ = outcome_tx.send(ForwardOutcome { direction: Direction::Inbound, result }).await;
                }
                _ = token.cancelled() => {}
            }
            (rd, wr)
        }
    });

    let termination = tokio::select! {
        outcome = outcome_rx.recv() => match outcome {
            Some(outcome) => {
                match &outcome.result {
                    Ok(bytes) => info!("Forwarding {} finished after {} bytes", outcome.direction, bytes),
                    Err(e) => info!("Forwarding {} failed: {}", outcome.direction, e),
                }
                Termination::Finished(outcome)
            }
            None => Termination::Finished(ForwardOutcome {
                direction: Direction::Outbound,
                result: Err(io::Error::new(io::ErrorKind::Other, "forwarding tasks stopped")),
            }),
        },
        _ = shutdown_requested(shutdown) => {
            info!("Shutdown requested, stopping forwarding");
            Termination::Shutdown
        }
    };

    // Stop the direction still running; a late outcome is never read
    token.cancel();
    drop(outcome_rx);

    let (device_rd, transport_wr) = outbound
        .await
        .map_err(|e| Error::Transport(format!("Forwarding task failed: {}", e)))?;
    let (transport_rd, device_wr) = inbound
        .await
        .map_err(|e| Error::Transport(format!("Forwarding task failed: {}", e)))?;
    debug!("Both forwarding directions stopped");

    Ok(Forwarded {
        transport: transport_rd.unsplit(transport_wr),
        device: device_rd.unsplit(device_wr),
        termination,
    })
}

/// Copy whole IP packets from a byte stream to a packet device.
///
/// The stream carries packets back to back with no extra framing, so packet
/// boundaries are recovered from the IPv4 total length or IPv6 payload length.
pub async fn copy_packets<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut copied = 0u64;

    loop {
        while let Some(len) = packet_len(&buf)? {
            if buf.len() < len {
                break;
            }
            let packet = buf.split_to(len);
            writer.write_all(&packet).await?;
            copied += len as u64;
        }

        buf.reserve(READ_BUFFER_SIZE);
        if reader.read_buf(&mut buf).await? == 0 {
            if !buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a packet ({} bytes pending)", buf.len()),
                ));
            }
            writer.flush().await?;
            return Ok(copied);
        }
    }
}

/// Length of the packet at the start of `buf`, once its header is readable
fn packet_len(buf: &[u8]) -> io::Result<Option<usize>> {
    let Some(first) = buf.first() else {
        return Ok(None);
    };
    match first >> 4 {
        4 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if total < IPV4_MIN_HEADER {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("IPv4 total length {} is shorter than its header", total),
                ));
            }
            Ok(Some(total))
        }
        6 => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let payload = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            Ok(Some(IPV6_HEADER + payload))
        }
        version => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported IP version {}", version),
        )),
    }
}
