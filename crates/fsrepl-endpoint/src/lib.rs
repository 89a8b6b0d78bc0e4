#![warn(missing_docs)]

//! fsrepl endpoint subsystem: the sender and receiver replication
//! endpoints, their path policy, the wire stub that forwards endpoint calls
//! to a peer and the dispatcher that serves them.

pub mod backend;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod destroy;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod handler;
pub mod mapfilter;
pub mod pdu;
pub mod placeholder;
pub mod receiver;
pub mod remote;
pub mod sender;

pub use backend::{Backend, BackendError, MemBackend, ZfsCli};
pub use config::EndpointConfig;
pub use dataset::{DatasetPath, FilesystemVersion, VersionKind};
pub use endpoint::{Endpoint, LocalEndpoint, Receiver, Sender};
pub use error::{EndpointError, ErrorKind, Result};
pub use filter::{PathFilter, PathMap, VersionFilter};
pub use handler::Dispatcher;
pub use mapfilter::DatasetMapFilter;
pub use receiver::LocalReceiver;
pub use remote::RemoteEndpoint;
pub use sender::LocalSender;
