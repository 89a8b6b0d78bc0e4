//! Framed connections over TCP.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameHeader, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Buffer size of each connection half; one stream chunk plus its header fits.
const IO_BUFFER_SIZE: usize = 160 * 1024;

/// Socket settings applied to every connection.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// How long dialing may take.
    pub connect_timeout: Duration,
    /// Set TCP_NODELAY. Frames are flushed whole, so batching only adds latency.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

/// Dials and accepts framed TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Transport using `config` for every socket.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Dial `addr`, giving up after the configured timeout.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(TransportError::ConnectionTimeout {
                    addr: addr.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };
        let conn = self.wrap(stream)?;
        debug!(peer = conn.peer_addr(), local = conn.local_addr(), "connected");
        Ok(conn)
    }

    /// Bind a listening socket.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        Ok(TcpListener::bind(addr).await?)
    }

    /// Wait for the next peer on `listener`.
    pub async fn accept(&self, listener: &TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await?;
        let conn = self.wrap(stream)?;
        debug!(peer = conn.peer_addr(), local = conn.local_addr(), "accepted");
        Ok(conn)
    }

    fn wrap(&self, stream: TcpStream) -> Result<TcpConnection> {
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(TcpConnection::from_stream(stream))
    }
}

/// One TCP connection carrying frames.
///
/// The halves are locked separately so a stream pump can write while the
/// other side reads.
pub struct TcpConnection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: TcpStream) -> Self {
        let addr = |a: io::Result<std::net::SocketAddr>| a.map(|a| a.to_string()).unwrap_or_default();
        let peer_addr = addr(stream.peer_addr());
        let local_addr = addr(stream.local_addr());
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::with_capacity(IO_BUFFER_SIZE, read)),
            writer: Mutex::new(BufWriter::with_capacity(IO_BUFFER_SIZE, write)),
            peer_addr,
            local_addr,
        }
    }

    /// Write `frame` and flush it.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let size = frame.payload.len();
        if size > MAX_PAYLOAD_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: size.min(u32::MAX as usize) as u32,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.header.encode()).await?;
        writer.write_all(&frame.payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next frame.
    ///
    /// EOF on a frame boundary means the peer hung up and is reported as
    /// [`TransportError::ConnectionReset`]; EOF inside a frame is an I/O error.
    pub async fn recv_frame(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionReset)
            }
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::decode(&header)?;
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let mut payload = vec![0u8; header.payload_length as usize];
        reader.read_exact(&mut payload).await?;
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Address of the other end.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Address of this end.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameFlags, FrameKind};

    async fn pair() -> (TcpConnection, TcpConnection) {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { transport.accept(&listener).await.unwrap() });
        let client = TcpTransport::default().connect(&addr).await.unwrap();
        (client, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_request_and_response_frames() {
        let (client, server) = pair().await;
        assert_eq!(client.peer_addr(), server.local_addr());

        let request = Frame::request(1, "ListFilesystems", b"{}", false).unwrap();
        client.send_frame(&request).await.unwrap();
        let (name, structured) = server.recv_frame().await.unwrap().into_request_parts().unwrap();
        assert_eq!(name, "ListFilesystems");
        assert_eq!(structured, b"{}");

        let response = Frame::new(FrameKind::Response, 1, b"ok".to_vec(), FrameFlags::empty());
        server.send_frame(&response).await.unwrap();
        let got = client.recv_frame().await.unwrap();
        assert_eq!(got.kind(), FrameKind::Response);
        assert_eq!(got.payload, b"ok");
    }

    #[tokio::test]
    async fn test_back_to_back_stream_chunks() {
        let (client, server) = pair().await;
        for i in 0..4u8 {
            let chunk = Frame::new(FrameKind::StreamData, 9, vec![i; 128 * 1024], FrameFlags::empty());
            client.send_frame(&chunk).await.unwrap();
        }
        for i in 0..4u8 {
            let got = server.recv_frame().await.unwrap();
            assert_eq!(got.request_id(), 9);
            assert_eq!(got.payload, vec![i; 128 * 1024]);
        }
    }

    #[tokio::test]
    async fn test_hangup_is_connection_reset() {
        let (client, server) = pair().await;
        drop(server);
        assert!(matches!(
            client.recv_frame().await,
            Err(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(transport.connect(&addr).await.is_err());
    }
}
