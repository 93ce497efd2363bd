//! Live streaming source over TCP with optional reconnection

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::stream::StreamingSource;
use crate::source::PacketSource;
use crate::types::{RawPacket, RunMetadata};
use crate::{ConversionError, Result};

/// Reconnection policy for live sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Connection attempts after the peer goes away; 0 disables reconnection
    pub attempts: u32,
    /// Fixed delay between attempts
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { attempts: 0, delay_ms: 2000 }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Streaming source connected to a live DAQ server
pub struct TcpSource {
    addr: String,
    policy: ReconnectPolicy,
    inner: StreamingSource<TcpStream>,
    reconnects: u32,
}

impl TcpSource {
    /// Connect and read the handshake
    pub async fn connect(addr: impl Into<String>, policy: ReconnectPolicy) -> Result<Self> {
        let addr = addr.into();
        info!("Connecting to TCP: {}", addr);

        let stream = connect_with_retry(&addr, &policy).await?;
        let inner = StreamingSource::open(stream, format!("tcp://{}", addr)).await?;
        info!("TCP connected successfully");

        Ok(Self { addr, policy, inner, reconnects: 0 })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of successful reconnections so far
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Try to restore the connection after a disconnect
    async fn reconnect(&mut self) -> Result<()> {
        let stream = connect_with_retry(&self.addr, &self.policy).await?;
        self.inner.replace_transport(stream).await?;
        self.reconnects += 1;
        info!("TCP reconnected to {} ({} reconnects)", self.addr, self.reconnects);
        Ok(())
    }
}

async fn connect_with_retry(addr: &str, policy: &ReconnectPolicy) -> Result<TcpStream> {
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                // Frames are small and latency matters more than batching
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle on {}: {}", addr, e);
                }
                return Ok(stream);
            }
            Err(e) if attempt < policy.attempts => {
                attempt += 1;
                warn!(
                    "TCP connection to {} failed ({}/{}): {}, retrying in {} ms",
                    addr, attempt, policy.attempts, e, policy.delay_ms
                );
                tokio::time::sleep(policy.delay()).await;
            }
            Err(e) => {
                return Err(ConversionError::transport(format!("connecting to {}", addr), e));
            }
        }
    }
}

/// Whether `err` means the peer went away rather than sent bad data.
///
/// Only a stream cut off inside a frame counts among the corrupt-stream
/// errors; oversized or malformed frames are real corruption.
fn is_disconnect(err: &ConversionError, ended: bool) -> bool {
    match err {
        ConversionError::Transport { .. } => true,
        ConversionError::CorruptStream { .. } => ended,
        _ => false,
    }
}

#[async_trait::async_trait]
impl PacketSource for TcpSource {
    async fn next_packet(&mut self) -> Result<Option<RawPacket>> {
        loop {
            let result = self.inner.next_packet().await;
            if self.policy.attempts == 0 {
                return result;
            }

            match result {
                Ok(Some(packet)) => return Ok(Some(packet)),
                Ok(None) => {
                    info!("TCP connection closed by server, reconnecting in {} ms", self.policy.delay_ms);
                }
                Err(e) if is_disconnect(&e, self.inner.ended()) => {
                    warn!("TCP stream {} interrupted: {}", self.addr, e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.policy.delay()).await;
            match self.reconnect().await {
                Ok(()) => {}
                Err(e @ ConversionError::Transport { .. }) => {
                    // The server is gone for good; what arrived so far stands
                    warn!("Giving up on {}: {}", self.addr, e);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn metadata(&self) -> &RunMetadata {
        self.inner.metadata()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }

    fn packets_read(&self) -> u64 {
        self.inner.packets_read()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn is_resumable(&self) -> bool {
        false
    }
}
