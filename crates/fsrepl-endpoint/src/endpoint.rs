//! The endpoint contract.
//!
//! [`Endpoint`] holds the calls both roles serve; [`Sender`] and
//! [`Receiver`] add the role-specific ones. A process binds exactly one role,
//! expressed by [`LocalEndpoint`], so the dispatcher knows statically which
//! calls it can serve.

use std::sync::Arc;

use async_trait::async_trait;
use fsrepl_transport::DataStream;

use crate::dataset::FilesystemVersion;
use crate::error::Result;
use crate::pdu::{
    Capability, DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, ReceiveReq, SendReq, SendRes,
    SnapshotReplicationStatusReq, SnapshotReplicationStatusRes,
};

/// Calls served by every endpoint.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Filesystems visible to the peer, named in the peer's namespace.
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>>;

    /// Snapshots and bookmarks of `fs`, oldest first.
    async fn list_filesystem_versions(&self, fs: &str) -> Result<Vec<FilesystemVersion>>;

    /// Destroy a batch of snapshots, reporting each outcome separately.
    async fn destroy_snapshots(&self, req: DestroySnapshotsReq) -> Result<DestroySnapshotsRes>;
}

/// Calls served only by the sending role.
#[async_trait]
pub trait Sender: Endpoint {
    /// Size estimate plus the open send stream. The caller owns the stream.
    async fn send(&self, req: SendReq) -> Result<(SendRes, DataStream)>;

    /// Read or set a snapshot's replicated marker.
    async fn snapshot_replication_status(
        &self,
        req: SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes>;
}

/// Calls served only by the receiving role.
#[async_trait]
pub trait Receiver: Endpoint {
    /// Receive `stream` into the filesystem named by `req`. The stream is
    /// consumed or dropped before this returns.
    async fn receive(&self, req: ReceiveReq, stream: DataStream) -> Result<()>;
}

/// The endpoint a process serves.
#[derive(Clone)]
pub enum LocalEndpoint {
    /// Sending role.
    Sender(Arc<dyn Sender>),
    /// Receiving role.
    Receiver(Arc<dyn Receiver>),
}

impl LocalEndpoint {
    /// The sender, if this is the sending role.
    pub fn sender(&self) -> Option<&Arc<dyn Sender>> {
        match self {
            LocalEndpoint::Sender(s) => Some(s),
            LocalEndpoint::Receiver(_) => None,
        }
    }

    /// The receiver, if this is the receiving role.
    pub fn receiver(&self) -> Option<&Arc<dyn Receiver>> {
        match self {
            LocalEndpoint::Receiver(r) => Some(r),
            LocalEndpoint::Sender(_) => None,
        }
    }

    /// Whether this role serves calls needing `capability`.
    pub fn serves(&self, capability: Capability) -> bool {
        matches!(
            (self, capability),
            (_, Capability::Any)
                | (LocalEndpoint::Sender(_), Capability::Sender)
                | (LocalEndpoint::Receiver(_), Capability::Receiver)
        )
    }

    /// Role name for logs.
    pub fn role(&self) -> &'static str {
        match self {
            LocalEndpoint::Sender(_) => "sender",
            LocalEndpoint::Receiver(_) => "receiver",
        }
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        match self {
            LocalEndpoint::Sender(s) => s.list_filesystems().await,
            LocalEndpoint::Receiver(r) => r.list_filesystems().await,
        }
    }

    async fn list_filesystem_versions(&self, fs: &str) -> Result<Vec<FilesystemVersion>> {
        match self {
            LocalEndpoint::Sender(s) => s.list_filesystem_versions(fs).await,
            LocalEndpoint::Receiver(r) => r.list_filesystem_versions(fs).await,
        }
    }

    async fn destroy_snapshots(&self, req: DestroySnapshotsReq) -> Result<DestroySnapshotsRes> {
        match self {
            LocalEndpoint::Sender(s) => s.destroy_snapshots(req).await,
            LocalEndpoint::Receiver(r) => r.destroy_snapshots(req).await,
        }
    }
}
