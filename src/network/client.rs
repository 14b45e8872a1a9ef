//! Memory stub client
//!
//! Owns the single persistent connection to the stub and issues reads on it.

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use super::connection::{Connection, ConnectionError};
use super::NetworkConfig;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Anything that can serve memory reads
#[async_trait]
pub trait ReadMemory: Send {
    /// Read `length` bytes starting at `address`
    async fn read_memory(&mut self, address: u64, length: usize) -> ClientResult<Vec<u8>>;
}

/// Client for a GDB-style memory stub
pub struct MemoryClient {
    host: String,
    port: u16,
    config: NetworkConfig,
    connection: Option<Connection<TcpStream>>,
}

impl MemoryClient {
    /// Create a new, unconnected client
    pub fn new(host: impl Into<String>, port: u16, config: NetworkConfig) -> Self {
        Self {
            host: host.into(),
            port,
            config,
            connection: None,
        }
    }

    /// Open the connection. There is no retry; failure is reported to the caller
    pub async fn connect(&mut self) -> ClientResult<()> {
        if self.connection.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let target = format!("{}:{}", self.host, self.port);
        tracing::info!("Connecting to {}", target);

        let addr = super::resolve_host(&self.host, self.port)
            .await
            .map_err(|e| ClientError::Connect {
                addr: target.clone(),
                source: e,
            })?;

        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ClientError::Connect {
                    addr: target,
                    source: e,
                })
            }
            Err(_) => return Err(ClientError::Timeout),
        };

        stream.set_nodelay(true)?;
        let remote_addr = stream.peer_addr()?;

        self.connection = Some(
            Connection::new(stream, self.config.framing)
                .with_read_timeout(self.config.read_timeout()),
        );

        tracing::info!("Connected to {} ({:?} framing)", remote_addr, self.config.framing);
        Ok(())
    }

    /// Release the connection if one is open
    pub async fn close(&mut self) -> ClientResult<()> {
        if let Some(mut conn) = self.connection.take() {
            let stats = conn.stats();
            tracing::info!(
                "Closing connection ({} requests, {} responses, {} bytes sent, {} bytes received)",
                stats.requests_sent,
                stats.responses_received,
                stats.bytes_sent,
                stats.bytes_received
            );
            conn.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReadMemory for MemoryClient {
    async fn read_memory(&mut self, address: u64, length: usize) -> ClientResult<Vec<u8>> {
        let conn = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
        Ok(conn.read_memory(address, length).await?)
    }
}
