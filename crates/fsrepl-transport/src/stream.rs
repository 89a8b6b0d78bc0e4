//! Raw data streams carried alongside a call.
//!
//! A stream travels as StreamData frames terminated by StreamEnd. If the
//! producing side fails to read its source, it sends StreamAbort with the
//! reason instead, which keeps the connection in sync. The receiving side
//! pumps frames into a bounded channel exposed as an [`AsyncRead`]; when the
//! consumer drops the reader early, the pump keeps draining until the end
//! marker so the next call on the connection starts at a frame boundary.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameFlags, FrameKind};
use crate::tcp::TcpConnection;

/// Owned byte stream. Closing it means dropping it.
pub type DataStream = Box<dyn AsyncRead + Send + Unpin>;

/// Size of the chunks a stream is cut into.
pub const STREAM_CHUNK_SIZE: usize = 128 * 1024;

/// Number of chunks buffered between the pump and the consumer.
const STREAM_CHANNEL_DEPTH: usize = 8;

/// How a stream ended, when the connection itself stayed healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// End marker seen after `bytes` bytes.
    Completed {
        /// Total payload bytes carried.
        bytes: u64,
    },
    /// The producer gave up.
    Aborted {
        /// Reason reported by the producer.
        reason: String,
    },
}

/// Sending half of a pumped stream.
pub type StreamSender = mpsc::Sender<std::io::Result<Bytes>>;

/// Create a connected (sender, reader) pair.
pub fn channel() -> (StreamSender, DataStream) {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
    (tx, Box::new(StreamReader::new(ReceiverStream::new(rx))))
}

/// Wrap an in-memory buffer as a [`DataStream`].
pub fn from_bytes(data: impl Into<Bytes>) -> DataStream {
    Box::new(std::io::Cursor::new(data.into()))
}

/// Read a stream to its end.
pub async fn read_to_end(mut stream: DataStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

/// Copy `source` onto the connection as frames belonging to `request_id`.
///
/// A read error on `source` is reported to the peer as StreamAbort and
/// returned as [`StreamOutcome::Aborted`]; `Err` means the connection
/// itself failed.
pub async fn write_stream(
    conn: &TcpConnection,
    request_id: u64,
    mut source: DataStream,
) -> Result<StreamOutcome> {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                let end = Frame::new(FrameKind::StreamEnd, request_id, vec![], FrameFlags::empty());
                conn.send_frame(&end).await?;
                debug!(request_id, bytes = total, "stream sent");
                return Ok(StreamOutcome::Completed { bytes: total });
            }
            Ok(n) => {
                let data = Frame::new(
                    FrameKind::StreamData,
                    request_id,
                    buf[..n].to_vec(),
                    FrameFlags::empty(),
                );
                conn.send_frame(&data).await?;
                total += n as u64;
            }
            Err(e) => {
                let reason = e.to_string();
                let abort = Frame::new(
                    FrameKind::StreamAbort,
                    request_id,
                    reason.clone().into_bytes(),
                    FrameFlags::empty(),
                );
                conn.send_frame(&abort).await?;
                debug!(request_id, error = %reason, "stream aborted");
                return Ok(StreamOutcome::Aborted { reason });
            }
        }
    }
}

/// Read stream frames for `request_id` off the connection into `tx` until
/// the end or abort marker.
pub async fn pump_stream(
    conn: Arc<TcpConnection>,
    request_id: u64,
    tx: StreamSender,
) -> Result<StreamOutcome> {
    let mut total = 0u64;
    let mut consumer_gone = false;
    loop {
        let frame = match conn.recv_frame().await {
            Ok(f) => f,
            Err(e) => {
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        e.to_string(),
                    )))
                    .await;
                return Err(e);
            }
        };
        if frame.request_id() != request_id {
            let err = TransportError::InvalidFrame {
                reason: format!(
                    "stream frame for call {} inside call {}",
                    frame.request_id(),
                    request_id
                ),
            };
            let _ = tx
                .send(Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    err.to_string(),
                )))
                .await;
            return Err(err);
        }
        match frame.kind() {
            FrameKind::StreamData => {
                total += frame.payload.len() as u64;
                if !consumer_gone && tx.send(Ok(Bytes::from(frame.payload))).await.is_err() {
                    debug!(request_id, "stream consumer went away, draining");
                    consumer_gone = true;
                }
            }
            FrameKind::StreamEnd => return Ok(StreamOutcome::Completed { bytes: total }),
            FrameKind::StreamAbort => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        TransportError::StreamAborted(reason.clone()).to_string(),
                    )))
                    .await;
                return Ok(StreamOutcome::Aborted { reason });
            }
            other => {
                let err = TransportError::UnexpectedFrame {
                    expected: "stream frame",
                    got: other.name(),
                };
                let _ = tx
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err.to_string(),
                    )))
                    .await;
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{TcpTransport, TcpTransportConfig};

    async fn connected_pair() -> (Arc<TcpConnection>, Arc<TcpConnection>) {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { transport.accept(&listener).await.unwrap() });
        let client = TcpTransport::new(TcpTransportConfig::default())
            .connect(&addr)
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (Arc::new(client), Arc::new(server))
    }

    struct FailingReader {
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.served {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk on fire",
                )));
            }
            self.served = true;
            buf.put_slice(b"partial");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_stream_crosses_connection() {
        let (a, b) = connected_pair().await;
        let payload: Vec<u8> = (0..(STREAM_CHUNK_SIZE * 3 + 17)).map(|i| i as u8).collect();

        let (tx, reader) = channel();
        let pump = tokio::spawn(pump_stream(b.clone(), 5, tx));
        let outcome = write_stream(&a, 5, from_bytes(payload.clone())).await.unwrap();
        assert_eq!(
            outcome,
            StreamOutcome::Completed {
                bytes: payload.len() as u64
            }
        );

        let received = read_to_end(reader).await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(
            pump.await.unwrap().unwrap(),
            StreamOutcome::Completed {
                bytes: payload.len() as u64
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_reader_drains_stream() {
        let (a, b) = connected_pair().await;
        let (tx, reader) = channel();
        drop(reader);
        let pump = tokio::spawn(pump_stream(b.clone(), 1, tx));
        write_stream(&a, 1, from_bytes(vec![7u8; STREAM_CHUNK_SIZE * 20]))
            .await
            .unwrap();
        let outcome = pump.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            StreamOutcome::Completed {
                bytes: (STREAM_CHUNK_SIZE * 20) as u64
            }
        );

        // Connection is still aligned on a frame boundary.
        let next = Frame::new(FrameKind::Response, 2, b"next".to_vec(), FrameFlags::empty());
        a.send_frame(&next).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap().payload, b"next");
    }

    #[tokio::test]
    async fn test_source_error_becomes_abort() {
        let (a, b) = connected_pair().await;
        let (tx, reader) = channel();
        let pump = tokio::spawn(pump_stream(b.clone(), 3, tx));
        let outcome = write_stream(&a, 3, Box::new(FailingReader { served: false }))
            .await
            .unwrap();
        assert!(matches!(outcome, StreamOutcome::Aborted { .. }));

        let err = read_to_end(reader).await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(matches!(
            pump.await.unwrap().unwrap(),
            StreamOutcome::Aborted { .. }
        ));
    }
}
