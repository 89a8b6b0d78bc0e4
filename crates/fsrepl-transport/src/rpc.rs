//! RPC layer providing request/reply semantics over TCP connections.
//!
//! Each call sends one structured payload and at most one data stream, and
//! receives one structured payload (or an error) and at most one data
//! stream. A connection carries one call at a time; a response stream keeps
//! the connection busy until it has been read or drained.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, Result, TransportError};
use crate::gate::Gate;
use crate::protocol::{Frame, FrameFlags, FrameKind};
use crate::stream::{self, DataStream, StreamOutcome};
use crate::tcp::{TcpConnection, TcpTransport};

/// Client-side call settings.
#[derive(Debug, Clone, Default)]
pub struct RpcClientConfig {
    /// Time to wait for the reply header after the request went out.
    /// `None` waits indefinitely; receives of large streams can take hours.
    pub response_timeout_ms: Option<u64>,
}

/// Successful reply of a handler.
pub struct Reply {
    /// Structured response payload.
    pub structured: Vec<u8>,
    /// Response stream, if the call produces one.
    pub stream: Option<DataStream>,
}

impl Reply {
    /// Reply without a stream.
    pub fn structured(structured: Vec<u8>) -> Self {
        Self {
            structured,
            stream: None,
        }
    }

    /// Reply with a trailing stream.
    pub fn with_stream(structured: Vec<u8>, stream: DataStream) -> Self {
        Self {
            structured,
            stream: Some(stream),
        }
    }
}

/// Server-side handler invoked once per call.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one call. `stream` is the request stream, if the caller sent
    /// one; dropping it early is allowed.
    async fn handle(
        &self,
        endpoint: &str,
        structured: Vec<u8>,
        stream: Option<DataStream>,
    ) -> std::result::Result<Reply, RemoteError>;
}

/// Marks the connection poisoned unless the call reached a clean state.
struct InFlight {
    poisoned: Arc<AtomicBool>,
    armed: bool,
}

impl InFlight {
    fn new(poisoned: Arc<AtomicBool>) -> Self {
        Self {
            poisoned,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.poisoned.store(true, Ordering::SeqCst);
        }
    }
}

/// RPC client for one connection.
pub struct RpcClient {
    conn: Arc<TcpConnection>,
    config: RpcClientConfig,
    next_id: AtomicU64,
    call_lock: Arc<Mutex<()>>,
    poisoned: Arc<AtomicBool>,
}

impl RpcClient {
    /// Wrap an established connection.
    pub fn new(conn: TcpConnection, config: RpcClientConfig) -> Self {
        Self {
            conn: Arc::new(conn),
            config,
            next_id: AtomicU64::new(1),
            call_lock: Arc::new(Mutex::new(())),
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dial `addr` and wrap the connection.
    pub async fn connect(
        transport: &TcpTransport,
        addr: &str,
        config: RpcClientConfig,
    ) -> Result<Self> {
        let conn = transport.connect(addr).await?;
        Ok(Self::new(conn, config))
    }

    /// Whether an earlier call left the connection unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }

    /// Issue one call and wait for its reply.
    ///
    /// If the reply announces a stream, it is returned as a [`DataStream`]
    /// and the connection stays reserved until that stream has been fully
    /// read or dropped. Dropping the returned future mid-call poisons the
    /// connection.
    pub async fn request_reply(
        &self,
        endpoint: &str,
        structured: Vec<u8>,
        request_stream: Option<DataStream>,
    ) -> Result<(Vec<u8>, Option<DataStream>)> {
        let guard = self.call_lock.clone().lock_owned().await;
        if self.is_poisoned() {
            return Err(TransportError::ConnectionPoisoned);
        }
        let inflight = InFlight::new(self.poisoned.clone());
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let request = Frame::request(request_id, endpoint, &structured, request_stream.is_some())?;
        self.conn.send_frame(&request).await?;
        if let Some(source) = request_stream {
            if let StreamOutcome::Aborted { reason } =
                stream::write_stream(&self.conn, request_id, source).await?
            {
                debug!(endpoint, reason = %reason, "request stream aborted");
            }
        }

        let reply = match self.config.response_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), self.conn.recv_frame())
                .await
                .map_err(|_| TransportError::RequestTimeout {
                    request_id,
                    timeout_ms: ms,
                })??,
            None => self.conn.recv_frame().await?,
        };
        if reply.request_id() != request_id {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "reply for call {} while waiting for {}",
                    reply.request_id(),
                    request_id
                ),
            });
        }

        match reply.kind() {
            FrameKind::Response => {
                let response_stream = if reply.has_stream() {
                    let (tx, reader) = stream::channel();
                    let conn = self.conn.clone();
                    let poisoned = self.poisoned.clone();
                    tokio::spawn(async move {
                        if let Err(e) = stream::pump_stream(conn, request_id, tx).await {
                            warn!(error = %e, "response stream failed");
                            poisoned.store(true, Ordering::SeqCst);
                        }
                        drop(guard);
                    });
                    Some(reader)
                } else {
                    None
                };
                inflight.disarm();
                Ok((reply.payload, response_stream))
            }
            FrameKind::ErrorResponse => {
                if reply.has_stream() {
                    return Err(TransportError::InvalidFrame {
                        reason: "error response announces a stream".to_string(),
                    });
                }
                inflight.disarm();
                Err(TransportError::Remote(RemoteError::decode(&reply.payload)?))
            }
            other => Err(TransportError::UnexpectedFrame {
                expected: "reply",
                got: other.name(),
            }),
        }
    }
}

/// Accept loop serving calls on every connection with one handler.
pub struct RpcServer {
    handler: Arc<dyn RpcHandler>,
    gate: Option<Gate>,
}

impl RpcServer {
    /// Create a server for `handler`.
    pub fn new(handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            handler,
            gate: None,
        }
    }

    /// Bound the number of calls served concurrently across connections.
    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run the accept loop until `shutdown` fires. Spawns a task per connection.
    pub async fn serve(
        &self,
        transport: &TcpTransport,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    return Ok(());
                }
                accepted = transport.accept(&listener) => match accepted {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            info!(peer = %conn.peer_addr(), "accepted connection");
            let handler = self.handler.clone();
            let gate = self.gate.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let conn = Arc::new(conn);
                let peer = conn.peer_addr().to_string();
                match serve_connection(handler, gate, conn, shutdown).await {
                    Ok(()) => debug!(peer = %peer, "connection closed"),
                    Err(e) => warn!(peer = %peer, error = %e, "connection failed"),
                }
            });
        }
    }
}

/// Serve calls on one connection until the peer hangs up or `shutdown` fires.
pub async fn serve_connection(
    handler: Arc<dyn RpcHandler>,
    gate: Option<Gate>,
    conn: Arc<TcpConnection>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = conn.recv_frame() => match frame {
                Ok(f) => f,
                Err(TransportError::ConnectionReset) => return Ok(()),
                Err(e) => return Err(e),
            },
        };
        let request_id = frame.request_id();
        let has_stream = frame.has_stream();
        let (endpoint, structured) = frame.into_request_parts()?;

        let _ticket = match &gate {
            Some(gate) => match gate.acquire(&shutdown).await {
                Ok(ticket) => Some(ticket),
                Err(_) => return Ok(()),
            },
            None => None,
        };

        let (request_stream, pump) = if has_stream {
            let (tx, reader) = stream::channel();
            let pump = tokio::spawn(stream::pump_stream(conn.clone(), request_id, tx));
            (Some(reader), Some(pump))
        } else {
            (None, None)
        };

        debug!(endpoint = %endpoint, request_id, "dispatching call");
        let result = handler.handle(&endpoint, structured, request_stream).await;

        // The request stream has to be off the wire before the reply goes out.
        if let Some(pump) = pump {
            match pump.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(join) => {
                    return Err(TransportError::IoError(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        join.to_string(),
                    )))
                }
            }
        }

        match result {
            Ok(reply) => {
                let flags = if reply.stream.is_some() {
                    FrameFlags::with_stream()
                } else {
                    FrameFlags::empty()
                };
                let response = Frame::new(FrameKind::Response, request_id, reply.structured, flags);
                conn.send_frame(&response).await?;
                if let Some(source) = reply.stream {
                    if let StreamOutcome::Aborted { reason } =
                        stream::write_stream(&conn, request_id, source).await?
                    {
                        warn!(endpoint = %endpoint, reason = %reason, "response stream aborted");
                    }
                }
            }
            Err(remote) => {
                debug!(endpoint = %endpoint, error = %remote, "call failed");
                let response = Frame::new(
                    FrameKind::ErrorResponse,
                    request_id,
                    remote.encode(),
                    FrameFlags::empty(),
                );
                conn.send_frame(&response).await?;
            }
        }
    }
}
