use bytes::BytesMut;
use std::{collections::VecDeque, io, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::ConnectError,
    protocol::{extract_frames, Frame},
};

/// Active TCP connection to a bike
///
/// Owns the socket exclusively: the wire protocol is strictly
/// request–response, so exactly one caller at a time may drive
/// send/receive. Frames may arrive split or coalesced across TCP segments;
/// the connection buffers partial frames and queues extras for the next
/// receive.
#[derive(Debug)]
pub struct BikeConnection {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<Frame>,
}

impl BikeConnection {
    /// Open a TCP connection to the bike
    ///
    /// No retry is performed here; retry policy belongs to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::TimedOut`] when the dial exceeds
    /// `timeout_ms`, [`ConnectError::Refused`] when the bike actively
    /// refuses, and [`ConnectError::Unreachable`] for routing or name
    /// resolution failures.
    pub async fn connect(host: &str, port: u16, timeout_ms: u64) -> Result<Self, ConnectError> {
        info!("Connecting to bike at {}:{}", host, port);

        let dial = TcpStream::connect((host, port));
        let stream = match timeout(Duration::from_millis(timeout_ms), dial).await {
            Err(_) => {
                return Err(ConnectError::TimedOut {
                    host: host.to_string(),
                    timeout_ms,
                })
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused {
                    host: host.to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(ConnectError::Unreachable {
                    host: host.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };

        // The protocol is tiny request/response messages; never batch them.
        let _ = stream.set_nodelay(true);

        info!("Connected to {}:{}", host, port);
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(1024),
            pending: VecDeque::new(),
        })
    }

    /// Send one command frame
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on a broken socket; the session
    /// layer translates it into its typed taxonomy.
    pub async fn send_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let wire = frame.encode();
        debug!("Sending: {}", wire);
        self.stream.write_all(wire.as_bytes()).await
    }

    /// Receive the next complete frame, bounded by an overall deadline
    ///
    /// Returns `Ok(None)` when the deadline passes without a complete
    /// frame; the partial data stays buffered. A peer close surfaces as
    /// `ConnectionReset`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on a broken or closed socket.
    pub async fn recv_frame(&mut self, timeout_ms: u64) -> io::Result<Option<Frame>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(frame) = self.pending.pop_front() {
                debug!("Received: {}", frame.encode());
                return Ok(Some(frame));
            }

            match timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    warn!("Bike closed the connection");
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "bike closed the connection",
                    ));
                }
                Ok(Ok(_)) => self.pending.extend(extract_frames(&mut self.buf)),
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Drop any frames already received but not yet consumed
    ///
    /// Used before a fresh request/response exchange so a stale telemetry
    /// frame is never mistaken for the new response.
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} stale frame(s)", self.pending.len());
            self.pending.clear();
        }
    }

    /// Best-effort terminate and close
    ///
    /// The terminate command is a courtesy to the bike's session tracking;
    /// failures here are ignored because the socket is going away anyway.
    pub async fn shutdown(mut self) {
        let _ = self.send_frame(&Frame::terminate()).await;
        let _ = self.stream.shutdown().await;
        info!("Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn local_pair() -> (BikeConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = BikeConnection::connect("127.0.0.1", addr.port(), 1_000);
        let (client, (server, _)) = tokio::join!(client, async {
            listener.accept().await.unwrap()
        });
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind-then-drop guarantees nothing listens on the port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = BikeConnection::connect("127.0.0.1", addr.port(), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Refused { .. }));
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let (mut client, mut server) = local_pair().await;

        client.send_frame(&Frame::start_init()).await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<EQ_>");

        server.write_all(b"<EQ_OK>").await.unwrap();
        let frame = client.recv_frame(1_000).await.unwrap().unwrap();
        assert_eq!(frame.tag, "EQ");
        assert!(frame.is_ok());
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_none() {
        let (mut client, _server) = local_pair().await;
        let got = client.recv_frame(50).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_split_frame_across_reads() {
        let (mut client, mut server) = local_pair().await;

        server.write_all(b"<ER_1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"-20>").await.unwrap();

        let frame = client.recv_frame(1_000).await.unwrap().unwrap();
        assert_eq!(frame.tag, "ER");
        assert_eq!(frame.payload_str(), "1-20");
    }

    #[tokio::test]
    async fn test_peer_close_is_io_error() {
        let (mut client, server) = local_pair().await;
        drop(server);
        let err = client.recv_frame(1_000).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
