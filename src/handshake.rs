//! Handshake Negotiator
//!
//! Line-oriented exchange of tunnel parameters before any packet is
//! forwarded. The initiator sends `remoteNetwork:<value>\n` and then
//! `remoteGateway:<value>\n`; the responder checks each key and echoes the
//! line back unchanged, and the initiator requires a byte-identical echo.
//!
//! The whole exchange runs under one deadline. When it expires the pending
//! read is dropped, so no handshake bytes are acted upon afterwards.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::Role;

/// Key of the first handshake line
pub const REMOTE_NETWORK_KEY: &str = "remoteNetwork";
/// Key of the second handshake line
pub const REMOTE_GATEWAY_KEY: &str = "remoteGateway";
/// Longest handshake line accepted, newline included
pub const MAX_LINE_LEN: usize = 1024;
/// Default bound for the whole exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters carried by the handshake; empty strings mean "not set"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelParams {
    pub remote_network: String,
    pub remote_gateway: String,
}

impl TunnelParams {
    pub fn new(remote_network: impl Into<String>, remote_gateway: impl Into<String>) -> Self {
        Self {
            remote_network: remote_network.into(),
            remote_gateway: remote_gateway.into(),
        }
    }
}

/// One `key:value` handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub key: String,
    pub value: String,
}

impl HandshakeLine {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Wire form, including the terminating newline
    pub fn encode(&self) -> String {
        format!("{}:{}\n", self.key, self.value)
    }

    /// Split a received line on its first `:`; the value is trimmed
    pub fn parse(raw: &str) -> Option<Self> {
        let (key, value) = raw.split_once(':')?;
        Some(Self {
            key: key.to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Run the handshake for `role` under `timeout`.
///
/// The initiator announces `local` and gets the same values back once both
/// echoes are confirmed; the responder ignores `local` and returns what the
/// peer declared.
pub async fn negotiate<S>(stream: &mut S, role: Role, local: &TunnelParams, timeout: Duration) -> Result<TunnelParams>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let exchange = async move {
        match role {
            Role::Initiator => {
                initiate(stream, local).await?;
                Ok(local.clone())
            }
            Role::Responder => respond(stream).await,
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Initiator side: send both lines and verify the echoes
pub async fn initiate<S>(stream: &mut S, params: &TunnelParams) -> Result<()>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    for line in [
        HandshakeLine::new(REMOTE_NETWORK_KEY, &params.remote_network),
        HandshakeLine::new(REMOTE_GATEWAY_KEY, &params.remote_gateway),
    ] {
        let sent = line.encode();
        stream.write_all(sent.as_bytes()).await?;
        stream.flush().await?;

        let echoed = read_line(stream).await?;
        debug!("Message Received: {}", echoed.trim_end());
        if echoed != sent {
            return Err(Error::Protocol(format!(
                "Sent {:?} but peer echoed {:?}",
                sent.trim_end(),
                echoed
            )));
        }
    }
    Ok(())
}

/// Responder side: check both keys, echo each line, return the values
pub async fn respond<S>(stream: &mut S) -> Result<TunnelParams>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let remote_network = receive_and_echo(stream, REMOTE_NETWORK_KEY).await?;
    let remote_gateway = receive_and_echo(stream, REMOTE_GATEWAY_KEY).await?;
    Ok(TunnelParams {
        remote_network,
        remote_gateway,
    })
}

async fn receive_and_echo<S>(stream: &mut S, expected_key: &str) -> Result<String>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let raw = read_line(stream).await?;
    debug!("Message Received: {}", raw.trim_end());

    let line = HandshakeLine::parse(&raw).ok_or_else(|| {
        Error::Protocol(format!("Malformed handshake line {:?}, expected {}", raw, expected_key))
    })?;
    if line.key != expected_key {
        return Err(Error::Protocol(format!(
            "Received key {:?}, expected {}",
            line.key, expected_key
        )));
    }

    stream.write_all(raw.as_bytes()).await?;
    stream.flush().await?;
    Ok(line.value)
}

/// Read one `\n`-terminated line of at most [`MAX_LINE_LEN`] bytes; end of
/// stream is a transport failure
async fn read_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let read = (&mut *stream)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    if read == 0 {
        return Err(Error::Transport("Connection closed during handshake".into()));
    }
    if raw.last() != Some(&b'\n') {
        if raw.len() >= MAX_LINE_LEN {
            return Err(Error::Protocol(format!(
                "Handshake line exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }
        return Err(Error::Transport("Connection closed during handshake".into()));
    }
    String::from_utf8(raw).map_err(|_| Error::Protocol("Handshake line is not valid UTF-8".into()))
}
