//! Batch snapshot destruction.

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::dataset::{validate_version_name, DatasetPath, FilesystemVersion, VersionKind};
use crate::error::{EndpointError, Result};
use crate::pdu::{DestroySnapshotRes, DestroySnapshotsRes};

/// Destroy `snapshots` of `fs` one by one.
///
/// A non-snapshot anywhere in the batch fails the whole call before the
/// backend is touched. Otherwise every item gets a result, carrying the
/// backend's error text when that item failed.
pub async fn destroy_snapshots(
    backend: &dyn Backend,
    fs: &DatasetPath,
    snapshots: Vec<FilesystemVersion>,
) -> Result<DestroySnapshotsRes> {
    if let Some(bad) = snapshots.iter().find(|v| v.kind != VersionKind::Snapshot) {
        return Err(EndpointError::NotASnapshot {
            name: bad.name.clone(),
        });
    }
    for v in &snapshots {
        validate_version_name(&v.name)?;
    }

    let mut results = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let error = match backend.destroy_snapshot(fs, &snapshot.name).await {
            Ok(()) => {
                debug!(filesystem = %fs, snapshot = %snapshot.name, "destroyed snapshot");
                String::new()
            }
            Err(e) => {
                warn!(filesystem = %fs, snapshot = %snapshot.name, error = %e, "cannot destroy snapshot");
                e.to_string()
            }
        };
        results.push(DestroySnapshotRes { snapshot, error });
    }
    Ok(DestroySnapshotsRes { results })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemOp;
    use crate::backend::MemBackend;

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    fn backend_with(names: &[&str]) -> MemBackend {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool/a"));
        for n in names {
            be.add_snapshot(&p("pool/a"), n, Vec::new()).unwrap();
        }
        be
    }

    #[tokio::test]
    async fn test_partial_failure_reported_per_item() {
        let be = backend_with(&["s1", "s2", "s3", "s4"]);
        be.fail_destroy_of(&p("pool/a"), "s2");
        be.fail_destroy_of(&p("pool/a"), "s4");
        let req: Vec<_> = ["s1", "s2", "s3", "s4"]
            .iter()
            .map(|n| FilesystemVersion::snapshot(*n))
            .collect();

        let res = destroy_snapshots(&be, &p("pool/a"), req).await.unwrap();

        assert_eq!(res.results.len(), 4);
        let failed: Vec<_> = res
            .results
            .iter()
            .filter(|r| !r.error.is_empty())
            .map(|r| r.snapshot.name.as_str())
            .collect();
        assert_eq!(failed, vec!["s2", "s4"]);
        assert_eq!(be.snapshot_names(&p("pool/a")), vec!["s2", "s4"]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_an_item_error() {
        let be = backend_with(&["s1"]);
        let res = destroy_snapshots(
            &be,
            &p("pool/a"),
            vec![FilesystemVersion::snapshot("gone"), FilesystemVersion::snapshot("s1")],
        )
        .await
        .unwrap();
        assert!(res.results[0].error.contains("does not exist"));
        assert!(res.results[1].error.is_empty());
    }

    #[tokio::test]
    async fn test_bookmark_rejects_whole_batch() {
        let be = backend_with(&["s1"]);
        let err = destroy_snapshots(
            &be,
            &p("pool/a"),
            vec![FilesystemVersion::snapshot("s1"), FilesystemVersion::bookmark("b1")],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EndpointError::NotASnapshot { ref name } if name == "b1"));
        assert!(!be
            .ops()
            .iter()
            .any(|op| matches!(op, MemOp::DestroySnapshot { .. })));
        assert_eq!(be.snapshot_names(&p("pool/a")), vec!["s1"]);
    }
}
