//! In-memory filesystem engine.
//!
//! Holds a tree of datasets with their snapshots, bookmarks and user
//! properties behind a mutex. Used by tests and by `fsrepl serve` in demo
//! setups; individual operations can be made to fail to exercise error
//! paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use fsrepl_transport::stream::{from_bytes, read_to_end};
use fsrepl_transport::DataStream;

use super::{
    is_placeholder_value, placeholder_property_value, Backend, BackendError, PlaceholderState,
    ReceiveOptions,
};
use crate::dataset::{DatasetPath, FilesystemVersion, VersionKind};
use crate::filter::{PathFilter, VersionFilter};

/// Mutation recorded by [`MemBackend`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemOp {
    /// A placeholder filesystem was created.
    CreatePlaceholder(DatasetPath),
    /// A stream was received.
    Receive {
        /// Target filesystem.
        fs: DatasetPath,
        /// Whether the force directive was passed.
        force: bool,
        /// Stream length.
        bytes: usize,
    },
    /// A snapshot was destroyed.
    DestroySnapshot {
        /// Filesystem.
        fs: DatasetPath,
        /// Snapshot name.
        snapshot: String,
    },
    /// A replicated marker was written.
    SetReplicated {
        /// Filesystem.
        fs: DatasetPath,
        /// Snapshot name.
        snapshot: String,
        /// New value.
        replicated: bool,
    },
}

#[derive(Debug, Clone)]
struct MemSnapshot {
    name: String,
    guid: u64,
    txg: u64,
    data: Vec<u8>,
    replicated: bool,
}

#[derive(Debug, Clone)]
struct MemBookmark {
    name: String,
    guid: u64,
    txg: u64,
}

#[derive(Debug, Default)]
struct MemDataset {
    placeholder: Option<String>,
    snapshots: Vec<MemSnapshot>,
    bookmarks: Vec<MemBookmark>,
    received: Vec<Vec<u8>>,
}

impl MemDataset {
    fn snapshot(&self, name: &str) -> Option<&MemSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    fn snapshot_mut(&mut self, name: &str) -> Option<&mut MemSnapshot> {
        self.snapshots.iter_mut().find(|s| s.name == name)
    }

    fn has_version(&self, v: &FilesystemVersion) -> bool {
        match v.kind {
            VersionKind::Snapshot => self.snapshot(&v.name).is_some(),
            VersionKind::Bookmark => self.bookmarks.iter().any(|b| b.name == v.name),
        }
    }
}

#[derive(Debug, Default)]
struct MemState {
    datasets: BTreeMap<DatasetPath, MemDataset>,
    next_txg: u64,
    ops: Vec<MemOp>,
    fail_destroy: HashSet<(DatasetPath, String)>,
    fail_state_query: HashSet<DatasetPath>,
    fail_create: HashSet<DatasetPath>,
}

impl MemState {
    fn txg(&mut self) -> u64 {
        self.next_txg += 1;
        self.next_txg
    }

    fn dataset(&self, fs: &DatasetPath) -> Result<&MemDataset, BackendError> {
        self.datasets
            .get(fs)
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: fs.to_string(),
            })
    }

    fn dataset_mut(&mut self, fs: &DatasetPath) -> Result<&mut MemDataset, BackendError> {
        self.datasets
            .get_mut(fs)
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: fs.to_string(),
            })
    }

    fn send_payload(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<Vec<u8>, BackendError> {
        let ds = self.dataset(fs)?;
        if to.kind != VersionKind::Snapshot {
            return Err(BackendError::Other(format!(
                "send target {} must be a snapshot",
                to.full_name(fs)
            )));
        }
        if let Some(from) = from {
            if !ds.has_version(from) {
                return Err(BackendError::DatasetNotFound {
                    path: from.full_name(fs),
                });
            }
        }
        ds.snapshot(&to.name)
            .map(|s| s.data.clone())
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: to.full_name(fs),
            })
    }
}

/// In-memory [`Backend`].
#[derive(Debug, Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

impl MemBackend {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemState>, BackendError> {
        self.state
            .lock()
            .map_err(|_| BackendError::Other("memory backend state poisoned".to_string()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Add a regular filesystem. Existing filesystems are left as they are.
    pub fn add_filesystem(&self, fs: &DatasetPath) {
        self.with_state(|s| {
            s.datasets.entry(fs.clone()).or_default();
        });
    }

    /// Add a filesystem carrying the placeholder marker for its own path.
    pub fn add_placeholder(&self, fs: &DatasetPath) {
        self.with_state(|s| {
            s.datasets.entry(fs.clone()).or_default().placeholder =
                Some(placeholder_property_value(fs));
        });
    }

    /// Set the placeholder property of `fs` to an arbitrary value.
    pub fn set_placeholder_property(&self, fs: &DatasetPath, value: &str) {
        self.with_state(|s| {
            s.datasets.entry(fs.clone()).or_default().placeholder = Some(value.to_string());
        });
    }

    /// Add snapshot `name` holding `data` to an existing filesystem.
    pub fn add_snapshot(
        &self,
        fs: &DatasetPath,
        name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), BackendError> {
        let data = data.into();
        self.with_state(|s| {
            let txg = s.txg();
            let ds = s.dataset_mut(fs)?;
            ds.snapshots.push(MemSnapshot {
                name: name.to_string(),
                guid: 0x1000 + txg,
                txg,
                data,
                replicated: false,
            });
            Ok(())
        })
    }

    /// Add bookmark `name` to an existing filesystem.
    pub fn add_bookmark(&self, fs: &DatasetPath, name: &str) -> Result<(), BackendError> {
        self.with_state(|s| {
            let txg = s.txg();
            let ds = s.dataset_mut(fs)?;
            ds.bookmarks.push(MemBookmark {
                name: name.to_string(),
                guid: 0x1000 + txg,
                txg,
            });
            Ok(())
        })
    }

    /// Make destroying `fs@snapshot` fail.
    pub fn fail_destroy_of(&self, fs: &DatasetPath, snapshot: &str) {
        self.with_state(|s| {
            s.fail_destroy.insert((fs.clone(), snapshot.to_string()));
        });
    }

    /// Make reading the placeholder state of `fs` fail.
    pub fn fail_state_query_of(&self, fs: &DatasetPath) {
        self.with_state(|s| {
            s.fail_state_query.insert(fs.clone());
        });
    }

    /// Make creating a placeholder at `fs` fail.
    pub fn fail_create_of(&self, fs: &DatasetPath) {
        self.with_state(|s| {
            s.fail_create.insert(fs.clone());
        });
    }

    /// Mutations so far.
    pub fn ops(&self) -> Vec<MemOp> {
        self.with_state(|s| s.ops.clone())
    }

    /// Whether `fs` exists.
    pub fn exists(&self, fs: &DatasetPath) -> bool {
        self.with_state(|s| s.datasets.contains_key(fs))
    }

    /// Whether `fs` currently carries a valid placeholder marker.
    pub fn is_placeholder(&self, fs: &DatasetPath) -> bool {
        self.with_state(|s| {
            s.datasets
                .get(fs)
                .and_then(|d| d.placeholder.as_deref())
                .is_some_and(|v| is_placeholder_value(fs, v))
        })
    }

    /// Snapshot names of `fs`, oldest first.
    pub fn snapshot_names(&self, fs: &DatasetPath) -> Vec<String> {
        self.with_state(|s| {
            s.datasets
                .get(fs)
                .map(|d| d.snapshots.iter().map(|s| s.name.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Streams received into `fs`, in order.
    pub fn received_data(&self, fs: &DatasetPath) -> Vec<Vec<u8>> {
        self.with_state(|s| {
            s.datasets
                .get(fs)
                .map(|d| d.received.clone())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn list_filesystems(
        &self,
        filter: &dyn PathFilter,
    ) -> Result<Vec<DatasetPath>, BackendError> {
        let all: Vec<DatasetPath> = self.lock()?.datasets.keys().cloned().collect();
        let mut out = Vec::new();
        for fs in all {
            if filter.filter(&fs)? {
                out.push(fs);
            }
        }
        Ok(out)
    }

    async fn list_versions(
        &self,
        fs: &DatasetPath,
        filter: &dyn VersionFilter,
    ) -> Result<Vec<FilesystemVersion>, BackendError> {
        let mut all: Vec<FilesystemVersion> = {
            let state = self.lock()?;
            let ds = state.dataset(fs)?;
            ds.snapshots
                .iter()
                .map(|s| FilesystemVersion {
                    kind: VersionKind::Snapshot,
                    name: s.name.clone(),
                    guid: s.guid,
                    create_txg: s.txg,
                })
                .chain(ds.bookmarks.iter().map(|b| FilesystemVersion {
                    kind: VersionKind::Bookmark,
                    name: b.name.clone(),
                    guid: b.guid,
                    create_txg: b.txg,
                }))
                .collect()
        };
        all.sort_by_key(|v| v.create_txg);
        let mut out = Vec::with_capacity(all.len());
        for v in all {
            if filter.filter(v.kind, &v.name)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    async fn send_dry_run(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<u64, BackendError> {
        let payload = self.lock()?.send_payload(fs, from, to)?;
        Ok(payload.len() as u64)
    }

    async fn send(
        &self,
        fs: &DatasetPath,
        from: Option<&FilesystemVersion>,
        to: &FilesystemVersion,
    ) -> Result<DataStream, BackendError> {
        let payload = self.lock()?.send_payload(fs, from, to)?;
        Ok(from_bytes(payload))
    }

    async fn receive(
        &self,
        fs: &DatasetPath,
        stream: DataStream,
        opts: ReceiveOptions,
    ) -> Result<(), BackendError> {
        let data = read_to_end(stream).await?;
        let mut state = self.lock()?;
        if let Some(parent) = fs.parent() {
            if !state.datasets.contains_key(&parent) {
                return Err(BackendError::Other(format!(
                    "cannot receive new filesystem stream: parent {} does not exist",
                    parent
                )));
            }
        }
        if let Some(ds) = state.datasets.get(fs) {
            let placeholder = ds
                .placeholder
                .as_deref()
                .is_some_and(|v| is_placeholder_value(fs, v));
            if placeholder && !opts.force {
                return Err(BackendError::Other(format!(
                    "cannot receive into {}: destination exists, must force",
                    fs
                )));
            }
        }
        let bytes = data.len();
        let ds = state.datasets.entry(fs.clone()).or_default();
        ds.placeholder = None;
        ds.received.push(data);
        state.ops.push(MemOp::Receive {
            fs: fs.clone(),
            force: opts.force,
            bytes,
        });
        Ok(())
    }

    async fn destroy_snapshot(&self, fs: &DatasetPath, snapshot: &str) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if state
            .fail_destroy
            .contains(&(fs.clone(), snapshot.to_string()))
        {
            return Err(BackendError::Other(format!(
                "cannot destroy snapshot {}@{}: dataset is busy",
                fs, snapshot
            )));
        }
        let ds = state.dataset_mut(fs)?;
        let idx = ds
            .snapshots
            .iter()
            .position(|s| s.name == snapshot)
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: format!("{}@{}", fs, snapshot),
            })?;
        ds.snapshots.remove(idx);
        state.ops.push(MemOp::DestroySnapshot {
            fs: fs.clone(),
            snapshot: snapshot.to_string(),
        });
        Ok(())
    }

    async fn get_replicated(&self, fs: &DatasetPath, snapshot: &str) -> Result<bool, BackendError> {
        let state = self.lock()?;
        state
            .dataset(fs)?
            .snapshot(snapshot)
            .map(|s| s.replicated)
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: format!("{}@{}", fs, snapshot),
            })
    }

    async fn set_replicated(
        &self,
        fs: &DatasetPath,
        snapshot: &str,
        replicated: bool,
    ) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        let snap = state
            .dataset_mut(fs)?
            .snapshot_mut(snapshot)
            .ok_or_else(|| BackendError::DatasetNotFound {
                path: format!("{}@{}", fs, snapshot),
            })?;
        snap.replicated = replicated;
        state.ops.push(MemOp::SetReplicated {
            fs: fs.clone(),
            snapshot: snapshot.to_string(),
            replicated,
        });
        Ok(())
    }

    async fn placeholder_state(&self, fs: &DatasetPath) -> Result<PlaceholderState, BackendError> {
        let state = self.lock()?;
        if state.fail_state_query.contains(fs) {
            return Err(BackendError::Other(format!(
                "cannot get property of {}: permission denied",
                fs
            )));
        }
        Ok(match state.datasets.get(fs) {
            None => PlaceholderState::Missing,
            Some(ds) => match ds.placeholder.as_deref() {
                Some(v) if is_placeholder_value(fs, v) => PlaceholderState::Placeholder,
                _ => PlaceholderState::Regular,
            },
        })
    }

    async fn create_placeholder(&self, fs: &DatasetPath) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if state.fail_create.contains(fs) {
            return Err(BackendError::Other(format!(
                "cannot create {}: out of space",
                fs
            )));
        }
        if state.datasets.contains_key(fs) {
            return Err(BackendError::Other(format!(
                "cannot create {}: dataset already exists",
                fs
            )));
        }
        if let Some(parent) = fs.parent() {
            if !state.datasets.contains_key(&parent) {
                return Err(BackendError::Other(format!(
                    "cannot create {}: parent does not exist",
                    fs
                )));
            }
        }
        state.datasets.insert(
            fs.clone(),
            MemDataset {
                placeholder: Some(placeholder_property_value(fs)),
                ..MemDataset::default()
            },
        );
        state.ops.push(MemOp::CreatePlaceholder(fs.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::AnyVersion;
    use crate::mapfilter::DatasetMapFilter;

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_list_filesystems_filtered() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_filesystem(&p("pool/a"));
        be.add_filesystem(&p("tank"));
        let f = DatasetMapFilter::new_filter([("pool<", "ok")]).unwrap();
        assert_eq!(
            be.list_filesystems(&f).await.unwrap(),
            vec![p("pool"), p("pool/a")]
        );
    }

    #[tokio::test]
    async fn test_versions_oldest_first() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_snapshot(&p("pool"), "s1", b"one".to_vec()).unwrap();
        be.add_bookmark(&p("pool"), "b1").unwrap();
        be.add_snapshot(&p("pool"), "s2", b"two".to_vec()).unwrap();
        let versions = be.list_versions(&p("pool"), &AnyVersion).await.unwrap();
        let names: Vec<_> = versions.iter().map(|v| v.rel_name()).collect();
        assert_eq!(names, vec!["@s1", "#b1", "@s2"]);
        assert!(matches!(
            be.list_versions(&p("missing"), &AnyVersion).await,
            Err(BackendError::DatasetNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_matches_dry_run() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_snapshot(&p("pool"), "s1", b"payload".to_vec()).unwrap();
        let to = FilesystemVersion::snapshot("s1");
        let size = be.send_dry_run(&p("pool"), None, &to).await.unwrap();
        let data = read_to_end(be.send(&p("pool"), None, &to).await.unwrap())
            .await
            .unwrap();
        assert_eq!(size, data.len() as u64);
        let missing_from = FilesystemVersion::bookmark("nope");
        assert!(be
            .send_dry_run(&p("pool"), Some(&missing_from), &to)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_receive_needs_parent_and_force_on_placeholder() {
        let be = MemBackend::new();
        let no_force = ReceiveOptions::default();
        assert!(be
            .receive(&p("pool/a"), from_bytes(b"x".to_vec()), no_force)
            .await
            .is_err());
        be.add_filesystem(&p("pool"));
        be.add_placeholder(&p("pool/a"));
        assert!(be
            .receive(&p("pool/a"), from_bytes(b"x".to_vec()), no_force)
            .await
            .is_err());
        be.receive(
            &p("pool/a"),
            from_bytes(b"x".to_vec()),
            ReceiveOptions { force: true },
        )
        .await
        .unwrap();
        assert!(!be.is_placeholder(&p("pool/a")));
        assert_eq!(be.received_data(&p("pool/a")), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn test_placeholder_state() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_placeholder(&p("pool/ph"));
        be.set_placeholder_property(&p("pool/copied"), &placeholder_property_value(&p("pool/ph")));
        assert_eq!(
            be.placeholder_state(&p("pool/ph")).await.unwrap(),
            PlaceholderState::Placeholder
        );
        assert_eq!(
            be.placeholder_state(&p("pool/copied")).await.unwrap(),
            PlaceholderState::Regular
        );
        assert_eq!(
            be.placeholder_state(&p("pool/none")).await.unwrap(),
            PlaceholderState::Missing
        );
        be.fail_state_query_of(&p("pool"));
        assert!(be.placeholder_state(&p("pool")).await.is_err());
    }

    #[tokio::test]
    async fn test_replicated_marker() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_snapshot(&p("pool"), "s1", Vec::new()).unwrap();
        assert!(!be.get_replicated(&p("pool"), "s1").await.unwrap());
        be.set_replicated(&p("pool"), "s1", true).await.unwrap();
        assert!(be.get_replicated(&p("pool"), "s1").await.unwrap());
        assert!(matches!(
            be.get_replicated(&p("pool"), "gone").await,
            Err(BackendError::DatasetNotFound { .. })
        ));
    }
}
