#![warn(missing_docs)]

//! fsrepl transport subsystem: framed request/reply RPC over TCP, with one
//! optional raw byte stream riding alongside each request or response.

pub mod error;
pub mod gate;
pub mod protocol;
pub mod rpc;
pub mod stream;
pub mod tcp;

pub use error::{RemoteError, Result, TransportError};
pub use gate::{Gate, GateError, Ticket};
pub use rpc::{Reply, RpcClient, RpcClientConfig, RpcHandler, RpcServer};
pub use stream::DataStream;
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
