//! Fakes shared by unit tests

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::device::{DeviceProvider, VirtualInterface};
use crate::error::{Error, Result};
use crate::netconfig::{CommandRunner, NetCommand};

/// Ordered record of commands and device lifecycle events
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Position of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }
}

/// Records command lines instead of running them
#[derive(Debug, Default)]
pub struct RecordingRunner {
    log: EventLog,
    fail_on: Option<String>,
    output: String,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    /// Fail every command whose rendered line starts with `prefix`
    pub fn fail_on(mut self, prefix: &str) -> Self {
        self.fail_on = Some(prefix.to_string());
        self
    }

    /// Standard output returned by every successful command
    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.entries()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &NetCommand) -> Result<String> {
        let line = command.to_string();
        self.log.push(line.clone());
        match &self.fail_on {
            Some(prefix) if line.starts_with(prefix.as_str()) => Err(Error::Configuration {
                command: line,
                reason: "exit status: 2".into(),
            }),
            _ => Ok(self.output.clone()),
        }
    }
}

/// In-memory device that logs its release
pub struct RecordedDevice {
    inner: DuplexStream,
    name: String,
    log: EventLog,
}

impl Drop for RecordedDevice {
    fn drop(&mut self) {
        self.log.push(format!("release {}", self.name));
    }
}

impl AsyncRead for RecordedDevice {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordedDevice {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Hands out in-memory devices; the far end of each goes to the test
pub struct DuplexProvider {
    name: String,
    log: EventLog,
    peers: mpsc::UnboundedSender<DuplexStream>,
    created: AtomicUsize,
}

impl DuplexProvider {
    pub fn new(name: &str, log: EventLog) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Self {
            name: name.to_string(),
            log,
            peers: tx,
            created: AtomicUsize::new(0),
        };
        (provider, rx)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceProvider for DuplexProvider {
    type Device = RecordedDevice;

    async fn create(&self) -> Result<VirtualInterface<RecordedDevice>> {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        self.created.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("create {}", self.name));
        let _ = self.peers.send(peer);

        let device = RecordedDevice {
            inner: local,
            name: self.name.clone(),
            log: self.log.clone(),
        };
        Ok(VirtualInterface::new(device, self.name.clone()))
    }
}

/// Minimal IPv4 packet with the given destination and payload
pub fn ipv4_packet(dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&[10, 0, 0, 1]);
    packet[16..20].copy_from_slice(&dst);
    packet.extend_from_slice(payload);
    packet
}
