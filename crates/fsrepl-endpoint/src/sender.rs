//! Sending endpoint: exports local filesystems that pass a path filter.

use std::sync::Arc;

use async_trait::async_trait;
use fsrepl_transport::DataStream;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::dataset::{validate_version_name, DatasetPath, FilesystemVersion, VersionKind};
use crate::destroy;
use crate::endpoint::{Endpoint, Sender};
use crate::error::{EndpointError, Result};
use crate::filter::{PathFilter, VersionFilter};
use crate::pdu::{
    DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, ReplicationStatusOp, SendReq, SendRes,
    SnapshotReplicationStatusReq, SnapshotReplicationStatusRes,
};

/// Sender-side endpoint. Paths are used as given; the filter decides which
/// of them the peer may see.
pub struct LocalSender {
    backend: Arc<dyn Backend>,
    filter: Arc<dyn PathFilter>,
    versions: Arc<dyn VersionFilter>,
}

impl LocalSender {
    /// Create a sender exposing filesystems that pass `filter` and versions
    /// that pass `versions`.
    pub fn new(
        backend: Arc<dyn Backend>,
        filter: Arc<dyn PathFilter>,
        versions: Arc<dyn VersionFilter>,
    ) -> Self {
        Self {
            backend,
            filter,
            versions,
        }
    }

    /// Parse `fs` and check it against the filter.
    fn authorize(&self, fs: &str) -> Result<DatasetPath> {
        let path = DatasetPath::parse(fs)?;
        if !self.filter.filter(&path)? {
            debug!(filesystem = fs, "filtered");
            return Err(EndpointError::Filtered { fs: fs.to_string() });
        }
        Ok(path)
    }
}

#[async_trait]
impl Endpoint for LocalSender {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let paths = self.backend.list_filesystems(self.filter.as_ref()).await?;
        Ok(paths
            .into_iter()
            .map(|p| Filesystem::new(p.to_string()))
            .collect())
    }

    async fn list_filesystem_versions(&self, fs: &str) -> Result<Vec<FilesystemVersion>> {
        let path = self.authorize(fs)?;
        Ok(self
            .backend
            .list_versions(&path, self.versions.as_ref())
            .await?)
    }

    async fn destroy_snapshots(&self, req: DestroySnapshotsReq) -> Result<DestroySnapshotsRes> {
        let path = self.authorize(&req.filesystem)?;
        destroy::destroy_snapshots(self.backend.as_ref(), &path, req.snapshots).await
    }
}

#[async_trait]
impl Sender for LocalSender {
    async fn send(&self, req: SendReq) -> Result<(SendRes, DataStream)> {
        let path = self.authorize(&req.filesystem)?;
        let from = req
            .from
            .as_deref()
            .map(FilesystemVersion::parse_rel_name)
            .transpose()?;
        let to = FilesystemVersion::parse_rel_name(&req.to)?;
        if to.kind != VersionKind::Snapshot {
            return Err(EndpointError::InvalidVersion {
                name: req.to,
                reason: "send target must be a snapshot".to_string(),
            });
        }

        let expected_size = self.backend.send_dry_run(&path, from.as_ref(), &to).await?;
        let stream = self.backend.send(&path, from.as_ref(), &to).await?;
        info!(
            filesystem = %path,
            from = req.from.as_deref().unwrap_or("(full)"),
            to = %req.to,
            expected_size,
            "send started"
        );
        Ok((SendRes { expected_size }, stream))
    }

    async fn snapshot_replication_status(
        &self,
        req: SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes> {
        let path = self.authorize(&req.filesystem)?;
        validate_version_name(&req.snapshot)?;
        let replicated = match ReplicationStatusOp::try_from(req.op)? {
            ReplicationStatusOp::Get => self.backend.get_replicated(&path, &req.snapshot).await?,
            ReplicationStatusOp::SetReplicated => {
                self.backend
                    .set_replicated(&path, &req.snapshot, true)
                    .await?;
                true
            }
        };
        Ok(SnapshotReplicationStatusRes { replicated })
    }
}
