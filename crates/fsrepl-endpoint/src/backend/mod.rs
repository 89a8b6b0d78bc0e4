//! Filesystem engine seam.
//!
//! Endpoints never touch the filesystem directly; every listing, stream and
//! property access goes through a [`Backend`].

use async_trait::async_trait;
use fsrepl_transport::DataStream;
use sha2::{Digest, Sha512_256};
use thiserror::Error;

use crate::dataset::{DatasetPath, FilesystemVersion};
use crate::filter::{FilterError, PathFilter, VersionFilter};

pub mod memory;
pub mod zfs;

pub use memory::MemBackend;
pub use zfs::ZfsCli;

/// User property marking a placeholder filesystem.
pub const PLACEHOLDER_PROPERTY: &str = "zrepl:placeholder";

/// User property recording that a snapshot has been replicated.
pub const REPLICATED_PROPERTY: &str = "zrepl:replicated";

/// Value of [`PLACEHOLDER_PROPERTY`] that marks `path` as a placeholder:
/// the lowercase hex SHA-512/256 of the path string. Tying the value to the
/// path keeps a renamed or copied dataset from counting as a placeholder.
pub fn placeholder_property_value(path: &DatasetPath) -> String {
    let digest = Sha512_256::digest(path.to_string().as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Whether `value` read from [`PLACEHOLDER_PROPERTY`] marks `path`.
pub fn is_placeholder_value(path: &DatasetPath, value: &str) -> bool {
    value == placeholder_property_value(path)
}

/// Errors reported by the filesystem engine.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The dataset (or snapshot) is not there.
    #[error("dataset does not exist: {path}")]
    DatasetNotFound {
        /// Dataset or snapshot name.
        path: String,
    },

    /// An engine command exited unsuccessfully.
    #[error("{cmd} failed ({status}): {stderr}")]
    Command {
        /// Command line, for diagnostics.
        cmd: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Engine output did not have the expected shape.
    #[error("cannot parse zfs output: {0}")]
    Parse(String),

    /// The filter used for a listing failed.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// I/O error talking to the engine.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other engine failure.
    #[error("{0}")]
    Other(String),
}

/// Result of checking a dataset for the placeholder marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderState {
    /// No dataset at that path.
    Missing,
    /// Dataset exists and carries the placeholder marker for its own path.
    Placeholder,
    /// Dataset exists and holds real data.
    Regular,
}

/// Options for a streaming receive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Replace whatever the target currently holds (`zfs recv -F`).
    pub force: bool,
}

/// Operations the endpoints need from the filesystem engine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Filesystems passing `filter`.
    async fn list_filesystems(&self, filter: &dyn PathFilter)
        -> Result<Vec<DatasetPath>, BackendError>;

    /// Snapshots and bookmarks of `fs` passing `filter`, oldest first.
    async fn list_versions(
        &self,
        fs: &DatasetPath,
        filter: &dyn VersionFilter,
    ) -> Result<Vec<FilesystemVersion>, BackendError>;

    /// Estimated size of the send stream from `from` (exclusive, snapshot
    /// or bookmark) to the snapshot `to` (inclusive); `from == None` means a
    /// full send.
    async fn send_dry_run(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<u64, BackendError>;

    /// Open the send stream for the same range as [`Backend::send_dry_run`].
    async fn send(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<DataStream, BackendError>;

    /// Receive `stream` into `fs`.
    async fn receive(
        &self,
        fs: &DatasetPath,
        stream: DataStream,
        opts: ReceiveOptions,
    ) -> Result<(), BackendError>;

    /// Destroy snapshot `snapshot` of `fs`.
    async fn destroy_snapshot(&self, fs: &DatasetPath, snapshot: &str) -> Result<(), BackendError>;

    /// Read the replicated marker of a snapshot.
    async fn get_replicated(&self, fs: &DatasetPath, snapshot: &str) -> Result<bool, BackendError>;

    /// Write the replicated marker of a snapshot.
    async fn set_replicated(
        &self,
        fs: &DatasetPath,
        snapshot: &str,
        replicated: bool,
    ) -> Result<(), BackendError>;

    /// Report whether `fs` exists and whether it is a placeholder.
    async fn placeholder_state(&self, fs: &DatasetPath) -> Result<PlaceholderState, BackendError>;

    /// Create an inert placeholder filesystem at `fs`.
    async fn create_placeholder(&self, fs: &DatasetPath) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_value_is_path_bound() {
        let a = DatasetPath::parse("pool/a").unwrap();
        let b = DatasetPath::parse("pool/b").unwrap();
        let va = placeholder_property_value(&a);
        assert_eq!(va.len(), 64);
        assert!(va.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(is_placeholder_value(&a, &va));
        assert!(!is_placeholder_value(&b, &va));
        assert!(!is_placeholder_value(&a, "on"));
    }
}
