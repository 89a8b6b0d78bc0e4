//! Path and version policy.
//!
//! A [`PathFilter`] decides whether a filesystem is visible at all. A
//! [`PathMap`] additionally translates a path into another namespace and
//! must be invertible so listings can be translated back. Both are pure and
//! are shared read-only between concurrent calls.

use std::sync::Arc;

use thiserror::Error;

use crate::dataset::{DatasetPath, VersionKind};

/// Errors raised by filters and maps, distinct from a plain "deny".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A table pattern does not parse.
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// Pattern as configured.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The same pattern appears twice.
    #[error("duplicate pattern {0:?}")]
    DuplicatePattern(String),

    /// A mapping target does not parse.
    #[error("invalid mapping target {target:?} for pattern {pattern:?}: {reason}")]
    InvalidTarget {
        /// Pattern the target belongs to.
        pattern: String,
        /// Target as configured.
        target: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A table mixes `ok` entries with mapping targets.
    #[error("table mixes filter entries (ok) with mapping targets")]
    MixedModes,

    /// A filter table was asked to map.
    #[error("a filter table cannot be used as a mapping")]
    NotAMapping,

    /// Inversion is impossible for this mapping.
    #[error("mapping is not invertible: {0}")]
    NotInvertible(String),

    /// A path passed a mapping's filter view but has no image.
    #[error("{path} passed the mapping filter but has no mapping")]
    Unmapped {
        /// Path in question.
        path: String,
    },
}

/// Visibility predicate over dataset paths.
pub trait PathFilter: Send + Sync {
    /// `Ok(true)` if the path is visible.
    fn filter(&self, path: &DatasetPath) -> Result<bool, FilterError>;
}

/// Invertible translation between two dataset namespaces.
pub trait PathMap: PathFilter {
    /// Image of `path`, or `None` if the path has no mapping.
    fn map(&self, path: &DatasetPath) -> Result<Option<DatasetPath>, FilterError>;

    /// Reverse mapping. For every `p` with `map(p) == Some(q)`,
    /// `invert()?.map(q) == Some(p)`.
    fn invert(&self) -> Result<Arc<dyn PathMap>, FilterError>;

    /// Filter view: a path passes iff it has a mapping.
    fn as_filter(self: Arc<Self>) -> Arc<dyn PathFilter>;
}

/// [`PathFilter`] view over a [`PathMap`].
pub struct MapAsFilter<M: ?Sized>(pub Arc<M>);

impl<M: PathMap + ?Sized> PathFilter for MapAsFilter<M> {
    fn filter(&self, path: &DatasetPath) -> Result<bool, FilterError> {
        Ok(self.0.map(path)?.is_some())
    }
}

/// Predicate over snapshot and bookmark names.
pub trait VersionFilter: Send + Sync {
    /// `Ok(true)` if the version is exposed.
    fn filter(&self, kind: VersionKind, name: &str) -> Result<bool, FilterError>;
}

/// Exposes every version.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyVersion;

impl VersionFilter for AnyVersion {
    fn filter(&self, _kind: VersionKind, _name: &str) -> Result<bool, FilterError> {
        Ok(true)
    }
}

/// Exposes versions whose name starts with a prefix.
#[derive(Debug, Clone)]
pub struct PrefixVersionFilter {
    prefix: String,
}

impl PrefixVersionFilter {
    /// Filter on `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl VersionFilter for PrefixVersionFilter {
    fn filter(&self, _kind: VersionKind, name: &str) -> Result<bool, FilterError> {
        Ok(name.starts_with(&self.prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_version_filter() {
        let f = PrefixVersionFilter::new("zrepl_");
        assert!(f.filter(VersionKind::Snapshot, "zrepl_2024").unwrap());
        assert!(f.filter(VersionKind::Bookmark, "zrepl_2024").unwrap());
        assert!(!f.filter(VersionKind::Snapshot, "manual").unwrap());
    }

    #[test]
    fn test_any_version() {
        assert!(AnyVersion.filter(VersionKind::Bookmark, "x").unwrap());
    }
}
