//! Placeholder repair of a receive target's ancestor chain.
//!
//! A receive target is addressed by its full path, but its ancestors need
//! not exist yet. Missing ancestors are created as placeholders: inert
//! filesystems marked so a later receive may overwrite them. Existing
//! ancestors are never modified.

use tracing::{debug, error};

use crate::backend::{Backend, PlaceholderState};
use crate::dataset::{DatasetPath, DatasetPathForest};
use crate::error::Result;

/// Create every missing ancestor of `target` as a placeholder, root first.
///
/// The target itself is not touched. The first failing state query or creation
/// stops the walk and is returned. On success, returns the paths that were
/// created.
pub async fn ensure_placeholder_ancestors(
    backend: &dyn Backend,
    target: &DatasetPath,
) -> Result<Vec<DatasetPath>> {
    let mut forest = DatasetPathForest::new();
    forest.add(target);

    let mut created = Vec::new();
    let mut walk = forest.walk_top_down();
    debug!(target = %target, "begin placeholder walk");
    while let Some(visit) = walk.next() {
        // The target is the only node added explicitly.
        if !visit.filled_in {
            walk.skip_children();
            continue;
        }
        match backend.placeholder_state(&visit.path).await? {
            PlaceholderState::Missing => {
                if let Err(e) = backend.create_placeholder(&visit.path).await {
                    error!(placeholder_fs = %visit.path, error = %e, "cannot create placeholder filesystem");
                    return Err(e.into());
                }
                debug!(filesystem = %visit.path, "created placeholder");
                created.push(visit.path);
            }
            state => {
                debug!(filesystem = %visit.path, ?state, "exists");
            }
        }
    }
    debug!(target = %target, created = created.len(), "complete placeholder walk");
    Ok(created)
}

/// Whether receiving into `target` must replace its current contents, which
/// is the case exactly when `target` is a placeholder.
pub async fn needs_force_receive(backend: &dyn Backend, target: &DatasetPath) -> Result<bool> {
    Ok(backend.placeholder_state(target).await? == PlaceholderState::Placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemOp;
    use crate::backend::MemBackend;
    use crate::error::ErrorKind;

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_creates_missing_ancestors_only() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_filesystem(&p("pool/sibling"));
        be.add_filesystem(&p("pool/sibling/child"));

        let created = ensure_placeholder_ancestors(&be, &p("pool/a/b/target"))
            .await
            .unwrap();

        assert_eq!(created, vec![p("pool/a"), p("pool/a/b")]);
        assert!(be.is_placeholder(&p("pool/a")));
        assert!(be.is_placeholder(&p("pool/a/b")));
        assert!(!be.exists(&p("pool/a/b/target")));
        assert!(!be.is_placeholder(&p("pool")));
        assert_eq!(
            be.ops(),
            vec![
                MemOp::CreatePlaceholder(p("pool/a")),
                MemOp::CreatePlaceholder(p("pool/a/b")),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_pool_root_is_created_too() {
        let be = MemBackend::new();
        let created = ensure_placeholder_ancestors(&be, &p("pool/a"))
            .await
            .unwrap();
        assert_eq!(created, vec![p("pool")]);
    }

    #[tokio::test]
    async fn test_nothing_to_do_for_root_target() {
        let be = MemBackend::new();
        assert!(ensure_placeholder_ancestors(&be, &p("pool"))
            .await
            .unwrap()
            .is_empty());
        assert!(be.ops().is_empty());
    }

    #[tokio::test]
    async fn test_state_query_error_halts_walk() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.fail_state_query_of(&p("pool"));
        let err = ensure_placeholder_ancestors(&be, &p("pool/a/b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(be.ops().is_empty());
    }

    #[tokio::test]
    async fn test_create_error_halts_walk() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.fail_create_of(&p("pool/a"));
        assert!(ensure_placeholder_ancestors(&be, &p("pool/a/b/c"))
            .await
            .is_err());
        assert!(!be.exists(&p("pool/a/b")));
    }

    #[tokio::test]
    async fn test_force_only_for_placeholders() {
        let be = MemBackend::new();
        be.add_filesystem(&p("pool"));
        be.add_placeholder(&p("pool/ph"));
        be.add_filesystem(&p("pool/real"));
        assert!(needs_force_receive(&be, &p("pool/ph")).await.unwrap());
        assert!(!needs_force_receive(&be, &p("pool/real")).await.unwrap());
        assert!(!needs_force_receive(&be, &p("pool/new")).await.unwrap());
        be.fail_state_query_of(&p("pool/real"));
        assert!(needs_force_receive(&be, &p("pool/real")).await.is_err());
    }
}
