//! Connection handling for the memory stub
//!
//! Manages one request/response stream, including:
//! - Command encoding
//! - Response framing and decoding
//! - Read timeouts and statistics

use bytes::BytesMut;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    CodecError, Decoder, FramingMode, ReadCommand, SINGLE_READ_BUFFER_SIZE,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Read timeout after {0:?}")]
    Timeout(Duration),

    #[error("Peer sent {0} bytes past the requested response")]
    Desync(usize),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready to issue requests
    Open,
    /// The stream was shut down locally or by the peer
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Read commands sent
    pub requests_sent: u64,
    /// Responses decoded successfully
    pub responses_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A request/response stream to a memory stub
pub struct Connection<S> {
    /// The underlying stream
    stream: S,
    /// Response decoder
    decoder: Decoder,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Per-response timeout (None waits forever)
    read_timeout: Option<Duration>,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection from an established stream
    pub fn new(stream: S, framing: FramingMode) -> Self {
        Self {
            stream,
            decoder: Decoder::new(framing),
            read_buf: BytesMut::with_capacity(SINGLE_READ_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(64),
            read_timeout: None,
            state: ConnectionState::Open,
            stats: ConnectionStats::default(),
        }
    }

    /// Bound how long a single response may take
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Read `length` bytes of remote memory at `address`.
    ///
    /// An error that leaves the stream position unknown closes the
    /// connection, so a late or oversized reply is never handed to the
    /// next request.
    pub async fn read_memory(&mut self, address: u64, length: usize) -> ConnectionResult<Vec<u8>> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        let command = ReadCommand::new(address, length);
        let result = self.exchange(&command).await;

        if let Err(e) = &result {
            if self.loses_position(e) || self.decoder.stray_len(&mut self.read_buf) > 0 {
                tracing::warn!("Dropping connection: {}", e);
                self.state = ConnectionState::Closed;
                self.read_buf.clear();
            }
        }
        result
    }

    async fn exchange(&mut self, command: &ReadCommand) -> ConnectionResult<Vec<u8>> {
        self.send(command).await?;

        let bytes = match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.recv(command))
                .await
                .map_err(|_| ConnectionError::Timeout(timeout))??,
            None => self.recv(command).await?,
        };

        let stray = self.decoder.stray_len(&mut self.read_buf);
        if stray > 0 {
            return Err(ConnectionError::Desync(stray));
        }

        self.stats.responses_received += 1;
        Ok(bytes)
    }

    /// Whether the stream may still hold bytes of the failed exchange
    fn loses_position(&self, err: &ConnectionError) -> bool {
        match err {
            // A newline-framed reply was consumed whole
            ConnectionError::Protocol(CodecError::ResponseTooLarge(..)) => true,
            ConnectionError::Protocol(CodecError::LengthMismatch { .. })
            | ConnectionError::Protocol(CodecError::OddLength(_)) => {
                self.decoder.framing() == FramingMode::SingleRead
            }
            ConnectionError::Protocol(_) => false,
            ConnectionError::Io(_)
            | ConnectionError::Closed
            | ConnectionError::Timeout(_)
            | ConnectionError::Desync(_) => true,
        }
    }

    /// Send a command
    async fn send(&mut self, command: &ReadCommand) -> ConnectionResult<()> {
        self.write_buf.clear();
        command.encode(&mut self.write_buf);

        tracing::debug!("-> {}", command.to_string().trim_end());

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.requests_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive the response to `command`
    async fn recv(&mut self, command: &ReadCommand) -> ConnectionResult<Vec<u8>> {
        if self.decoder.framing() == FramingMode::SingleRead {
            // Anything left over belongs to an earlier exchange
            self.read_buf.clear();
        }

        loop {
            if let Some(bytes) = self.decoder.decode(&mut self.read_buf, command.length)? {
                return Ok(bytes);
            }

            let mut buf = [0u8; SINGLE_READ_BUFFER_SIZE];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                self.state = ConnectionState::Closed;
                return match self.decoder.decode_eof(&mut self.read_buf, command.length)? {
                    Some(bytes) => Ok(bytes),
                    None => Err(ConnectionError::Closed),
                };
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Shut the stream down
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Check if the connection is still usable
    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_memory() {
        let stream = Builder::new()
            .write(b"m1000,4\n")
            .read(b"deadbeef\n")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let bytes = conn.read_memory(0x1000, 4).await.unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(conn.stats().requests_sent, 1);
        assert_eq!(conn.stats().responses_received, 1);
        assert_eq!(conn.stats().bytes_sent, 8);
    }

    #[tokio::test]
    async fn test_line_framing_reassembles_fragments() {
        let stream = Builder::new()
            .write(b"m20,4\n")
            .read(b"0102")
            .read(b"03")
            .read(b"04\n")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        assert_eq!(conn.read_memory(0x20, 4).await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_single_read_does_not_reassemble() {
        let stream = Builder::new()
            .write(b"m20,4\n")
            .read(b"0102")
            .build();
        let mut conn = Connection::new(stream, FramingMode::SingleRead);

        let err = conn.read_memory(0x20, 4).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(CodecError::LengthMismatch { expected: 4, actual: 2 })
        ));
    }

    #[tokio::test]
    async fn test_sequential_requests() {
        let stream = Builder::new()
            .write(b"m0,1\n")
            .read(b"aa\n")
            .write(b"m1,1\n")
            .read(b"bb\n")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        assert_eq!(conn.read_memory(0, 1).await.unwrap(), vec![0xaa]);
        assert_eq!(conn.read_memory(1, 1).await.unwrap(), vec![0xbb]);
        assert_eq!(conn.stats().requests_sent, 2);
    }

    #[tokio::test]
    async fn test_peer_closed() {
        let stream = Builder::new().write(b"m0,1\n").build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let err = conn.read_memory(0, 1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
        assert!(!conn.is_active());

        let err = conn.read_memory(0, 1).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_remote_error_reply() {
        let stream = Builder::new()
            .write(b"m0,2\n")
            .read(b"E14\n")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let err = conn.read_memory(0, 2).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(CodecError::Remote(0x14))));
        assert!(conn.is_active());
    }

    #[tokio::test]
    async fn test_extra_hex_closes_connection() {
        let stream = Builder::new()
            .write(b"m0,2\n")
            .read(b"aaaabb")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let err = conn.read_memory(0, 2).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Desync(2)));
        assert!(!conn.is_active());

        let err = conn.read_memory(2, 2).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn test_trailing_bytes_after_error_reply_close_connection() {
        let stream = Builder::new()
            .write(b"m0,2\n")
            .read(b"E14\nbeef\n")
            .build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let err = conn.read_memory(0, 2).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(CodecError::Remote(0x14))));
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn test_single_read_truncation_closes_connection() {
        let stream = Builder::new()
            .write(b"m20,4\n")
            .read(b"0102")
            .build();
        let mut conn = Connection::new(stream, FramingMode::SingleRead);

        assert!(conn.read_memory(0x20, 4).await.is_err());
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn test_oversized_reply_closes_connection() {
        let garbage = vec![b' '; crate::protocol::MAX_RESPONSE_SIZE + 2];
        let stream = Builder::new().write(b"m0,1\n").read(&garbage).build();
        let mut conn = Connection::new(stream, FramingMode::Line);

        let err = conn.read_memory(0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(CodecError::ResponseTooLarge(..))
        ));
        assert!(!conn.is_active());
    }

    mod tcp {
        use super::*;
        use tokio::io::{AsyncBufReadExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};

        /// Accept one client and answer each request line with the
        /// scripted chunks, pausing `gap` between chunks
        async fn stub(script: Vec<Vec<&'static str>>, gap: Duration) -> TcpStream {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();

                for chunks in script {
                    if lines.next_line().await.unwrap().is_none() {
                        return;
                    }
                    for chunk in chunks {
                        write_half.write_all(chunk.as_bytes()).await.unwrap();
                        write_half.flush().await.unwrap();
                        tokio::time::sleep(gap).await;
                    }
                }
                // Hold the socket until the client hangs up
                let _ = lines.next_line().await;
            });

            TcpStream::connect(addr).await.unwrap()
        }

        #[tokio::test]
        async fn test_newline_in_separate_write() {
            let stream = stub(
                vec![vec!["0102", "\n"], vec!["0304\n"]],
                Duration::from_millis(50),
            )
            .await;
            let mut conn = Connection::new(stream, FramingMode::Line);

            assert_eq!(conn.read_memory(0, 2).await.unwrap(), vec![1, 2]);
            assert_eq!(conn.read_memory(2, 2).await.unwrap(), vec![3, 4]);
            assert!(conn.is_active());
        }

        #[tokio::test]
        async fn test_timeout_closes_connection() {
            let stream = stub(
                vec![vec!["", "0102\n"], vec!["0304\n"]],
                Duration::from_millis(200),
            )
            .await;
            let mut conn = Connection::new(stream, FramingMode::Line)
                .with_read_timeout(Some(Duration::from_millis(50)));

            let err = conn.read_memory(0, 2).await.unwrap_err();
            assert!(matches!(err, ConnectionError::Timeout(_)));
            assert!(!conn.is_active());

            let err = conn.read_memory(2, 2).await.unwrap_err();
            assert!(matches!(err, ConnectionError::Closed));
        }

        #[tokio::test]
        async fn test_large_read() {
            const LEN: usize = 600 * 1024;
            let reply: &'static str = Box::leak(format!("{}\n", "ab".repeat(LEN)).into_boxed_str());
            let stream = stub(vec![vec![reply]], Duration::ZERO).await;
            let mut conn = Connection::new(stream, FramingMode::Line);

            let bytes = conn.read_memory(0, LEN).await.unwrap();
            assert_eq!(bytes.len(), LEN);
            assert!(bytes.iter().all(|&b| b == 0xab));
        }
    }
}
