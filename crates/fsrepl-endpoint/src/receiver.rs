//! Receiving endpoint: imports filesystems into a mapped local namespace.

use std::sync::Arc;

use async_trait::async_trait;
use fsrepl_transport::DataStream;
use tracing::{debug, info};

use crate::backend::{Backend, ReceiveOptions};
use crate::dataset::{DatasetPath, FilesystemVersion};
use crate::destroy;
use crate::endpoint::{Endpoint, Receiver};
use crate::error::{EndpointError, Result};
use crate::filter::{FilterError, PathFilter, PathMap, VersionFilter};
use crate::pdu::{DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, ReceiveReq};
use crate::placeholder;

/// Receiver-side endpoint.
///
/// Requests name filesystems in the sender's namespace; `map` translates
/// them to local paths. Listings go the other way through the inverse,
/// which is computed once here.
pub struct LocalReceiver {
    backend: Arc<dyn Backend>,
    map: Arc<dyn PathMap>,
    inverse: Arc<dyn PathMap>,
    inverse_filter: Arc<dyn PathFilter>,
    versions: Arc<dyn VersionFilter>,
}

impl LocalReceiver {
    /// Create a receiver. Fails if `map` cannot be inverted.
    pub fn new(
        backend: Arc<dyn Backend>,
        map: Arc<dyn PathMap>,
        versions: Arc<dyn VersionFilter>,
    ) -> Result<Self> {
        let inverse = map.invert()?;
        let inverse_filter = inverse.clone().as_filter();
        Ok(Self {
            backend,
            map,
            inverse,
            inverse_filter,
            versions,
        })
    }

    /// Local path for the sender-side name `fs`.
    fn map_path(&self, fs: &str) -> Result<DatasetPath> {
        let remote = DatasetPath::parse(fs)?;
        match self.map.map(&remote)? {
            Some(local) => Ok(local),
            None => {
                debug!(filesystem = fs, "no mapping, access denied");
                Err(EndpointError::AccessDenied { fs: fs.to_string() })
            }
        }
    }
}

#[async_trait]
impl Endpoint for LocalReceiver {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        let local = self
            .backend
            .list_filesystems(self.inverse_filter.as_ref())
            .await?;
        let mut out = Vec::with_capacity(local.len());
        for path in local {
            let remote = self
                .inverse
                .map(&path)?
                .ok_or_else(|| FilterError::Unmapped {
                    path: path.to_string(),
                })?;
            out.push(Filesystem::new(remote.to_string()));
        }
        Ok(out)
    }

    async fn list_filesystem_versions(&self, fs: &str) -> Result<Vec<FilesystemVersion>> {
        let local = self.map_path(fs)?;
        Ok(self
            .backend
            .list_versions(&local, self.versions.as_ref())
            .await?)
    }

    async fn destroy_snapshots(&self, req: DestroySnapshotsReq) -> Result<DestroySnapshotsRes> {
        let local = self.map_path(&req.filesystem)?;
        destroy::destroy_snapshots(self.backend.as_ref(), &local, req.snapshots).await
    }
}

#[async_trait]
impl Receiver for LocalReceiver {
    async fn receive(&self, req: ReceiveReq, stream: DataStream) -> Result<()> {
        // Every early return below drops `stream`, closing it.
        let local = self.map_path(&req.filesystem)?;

        placeholder::ensure_placeholder_ancestors(self.backend.as_ref(), &local).await?;
        let force = placeholder::needs_force_receive(self.backend.as_ref(), &local).await?;

        info!(filesystem = %req.filesystem, local = %local, force, "receive started");
        self.backend
            .receive(&local, stream, ReceiveOptions { force })
            .await?;
        info!(filesystem = %req.filesystem, local = %local, "receive finished");
        Ok(())
    }
}
