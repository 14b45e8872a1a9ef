//! Network module - Handles TCP communication with the memory stub
//!
//! Provides:
//! - Client owning the single persistent connection
//! - Connection framing, timeouts and statistics
//! - The `ReadMemory` seam used by the team assembler

mod client;
mod connection;

pub use client::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::FramingMode;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-response timeout in milliseconds (0 waits forever)
    pub read_timeout_ms: u64,
    /// Response framing strategy
    pub framing: FramingMode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            read_timeout_ms: 0,
            framing: FramingMode::default(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
