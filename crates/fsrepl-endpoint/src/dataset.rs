//! Dataset paths, path forests and filesystem versions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// Hierarchical name of a filesystem, e.g. `pool/a/b`.
///
/// Always has at least one component; components are non-empty and free of
/// the separators `/`, `@`, `#` and of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetPath {
    comps: Vec<String>,
}

fn check_component(c: &str) -> Result<(), String> {
    if c.is_empty() {
        return Err("empty path component".to_string());
    }
    if c.starts_with('-') {
        return Err(format!("component {:?} starts with '-'", c));
    }
    if let Some(bad) = c
        .chars()
        .find(|ch| matches!(ch, '/' | '@' | '#' | '<') || ch.is_whitespace() || ch.is_control())
    {
        return Err(format!("invalid character {:?} in component {:?}", bad, c));
    }
    Ok(())
}

impl DatasetPath {
    /// Parse a `/`-separated dataset name.
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        let invalid = |reason: String| EndpointError::InvalidPath {
            path: s.to_string(),
            reason,
        };
        if s.is_empty() {
            return Err(invalid("empty dataset path".to_string()));
        }
        let comps: Vec<String> = s.split('/').map(str::to_string).collect();
        for c in &comps {
            check_component(c).map_err(invalid)?;
        }
        Ok(Self { comps })
    }

    /// Build from components.
    pub fn from_components<I, S>(comps: I) -> Result<Self, EndpointError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let comps: Vec<String> = comps.into_iter().map(Into::into).collect();
        let joined = comps.join("/");
        if comps.is_empty() {
            return Err(EndpointError::InvalidPath {
                path: joined,
                reason: "empty dataset path".to_string(),
            });
        }
        for c in &comps {
            check_component(c).map_err(|reason| EndpointError::InvalidPath {
                path: joined.clone(),
                reason,
            })?;
        }
        Ok(Self { comps })
    }

    /// Path components, root first.
    pub fn components(&self) -> &[String] {
        &self.comps
    }

    /// Whether the leading components equal `prefix`.
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.comps.len() >= prefix.len() && self.comps[..prefix.len()] == *prefix
    }

    /// Parent path, `None` for a pool root.
    pub fn parent(&self) -> Option<DatasetPath> {
        if self.comps.len() <= 1 {
            return None;
        }
        Some(DatasetPath {
            comps: self.comps[..self.comps.len() - 1].to_vec(),
        })
    }
}

impl fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.comps.join("/"))
    }
}

impl FromStr for DatasetPath {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetPath::parse(s)
    }
}

struct ForestNode {
    comp: String,
    /// Explicitly added, as opposed to filled in to connect a descendant.
    added: bool,
    children: Vec<ForestNode>,
}

impl ForestNode {
    fn insert(nodes: &mut Vec<ForestNode>, comps: &[String]) {
        let Some((head, rest)) = comps.split_first() else {
            return;
        };
        let idx = match nodes.iter().position(|n| &n.comp == head) {
            Some(i) => i,
            None => {
                nodes.push(ForestNode {
                    comp: head.clone(),
                    added: false,
                    children: Vec::new(),
                });
                nodes.len() - 1
            }
        };
        if rest.is_empty() {
            nodes[idx].added = true;
        } else {
            ForestNode::insert(&mut nodes[idx].children, rest);
        }
    }
}

/// Set of dataset paths arranged as a tree of their components.
#[derive(Default)]
pub struct DatasetPathForest {
    roots: Vec<ForestNode>,
}

/// One node reached by [`TopDownWalk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPathVisit {
    /// Full path of the node.
    pub path: DatasetPath,
    /// True when the node only exists to connect an added descendant.
    pub filled_in: bool,
}

impl DatasetPathForest {
    /// Empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path; missing intermediate nodes are filled in.
    pub fn add(&mut self, path: &DatasetPath) {
        ForestNode::insert(&mut self.roots, &path.comps);
    }

    /// Walk parents before children. Call [`TopDownWalk::skip_children`]
    /// after a visit to prune the subtree below it.
    pub fn walk_top_down(&self) -> TopDownWalk<'_> {
        TopDownWalk {
            stack: self
                .roots
                .iter()
                .rev()
                .map(|n| (Vec::new(), n))
                .collect(),
            last: None,
            skip: false,
        }
    }
}

/// Pre-order walk over a [`DatasetPathForest`].
pub struct TopDownWalk<'a> {
    stack: Vec<(Vec<String>, &'a ForestNode)>,
    last: Option<(Vec<String>, &'a ForestNode)>,
    skip: bool,
}

impl<'a> TopDownWalk<'a> {
    /// Do not descend below the node returned by the last `next()`.
    pub fn skip_children(&mut self) {
        self.skip = true;
    }
}

impl<'a> Iterator for TopDownWalk<'a> {
    type Item = DatasetPathVisit;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((comps, node)) = self.last.take() {
            if !self.skip {
                for child in node.children.iter().rev() {
                    self.stack.push((comps.clone(), child));
                }
            }
        }
        self.skip = false;
        let (mut comps, node) = self.stack.pop()?;
        comps.push(node.comp.clone());
        let visit = DatasetPathVisit {
            path: DatasetPath {
                comps: comps.clone(),
            },
            filled_in: !node.added,
        };
        self.last = Some((comps, node));
        Some(visit)
    }
}

/// Kind of a filesystem version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionKind {
    /// Snapshot: carries data.
    Snapshot,
    /// Bookmark: carries only a position.
    Bookmark,
}

impl VersionKind {
    /// Separator between filesystem and version name (`@` or `#`).
    pub fn delimiter(self) -> char {
        match self {
            VersionKind::Snapshot => '@',
            VersionKind::Bookmark => '#',
        }
    }
}

/// A named point-in-time state of a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemVersion {
    /// Snapshot or bookmark.
    pub kind: VersionKind,
    /// Name without the filesystem part.
    pub name: String,
    /// Backend GUID, stable across replication.
    pub guid: u64,
    /// Transaction group the version was created in.
    pub create_txg: u64,
}

impl FilesystemVersion {
    /// Snapshot with unknown guid/txg, as named by a request.
    pub fn snapshot(name: impl Into<String>) -> Self {
        Self {
            kind: VersionKind::Snapshot,
            name: name.into(),
            guid: 0,
            create_txg: 0,
        }
    }

    /// Bookmark with unknown guid/txg.
    pub fn bookmark(name: impl Into<String>) -> Self {
        Self {
            kind: VersionKind::Bookmark,
            name: name.into(),
            guid: 0,
            create_txg: 0,
        }
    }

    /// `fs@name` or `fs#name`.
    pub fn full_name(&self, fs: &DatasetPath) -> String {
        format!("{}{}", fs, self.rel_name())
    }

    /// `@name` or `#name`.
    pub fn rel_name(&self) -> String {
        format!("{}{}", self.kind.delimiter(), self.name)
    }

    /// Parse a relative name (`@snap` or `#bookmark`).
    pub fn parse_rel_name(s: &str) -> Result<Self, EndpointError> {
        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('@') => VersionKind::Snapshot,
            Some('#') => VersionKind::Bookmark,
            _ => {
                return Err(EndpointError::InvalidVersion {
                    name: s.to_string(),
                    reason: "relative version name must start with '@' or '#'".to_string(),
                })
            }
        };
        let name = chars.as_str();
        validate_version_name(name)?;
        Ok(Self {
            kind,
            name: name.to_string(),
            guid: 0,
            create_txg: 0,
        })
    }
}

/// Check a bare snapshot or bookmark name.
pub fn validate_version_name(name: &str) -> Result<(), EndpointError> {
    let invalid = |reason: &str| EndpointError::InvalidVersion {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("empty version name"));
    }
    if name
        .chars()
        .any(|ch| matches!(ch, '/' | '@' | '#') || ch.is_whitespace() || ch.is_control())
    {
        return Err(invalid("version name contains a separator or whitespace"));
    }
    if name.starts_with('-') {
        return Err(invalid("version name starts with '-'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let path = p("pool/a/b");
        assert_eq!(path.components(), &["pool", "a", "b"]);
        assert_eq!(path.to_string(), "pool/a/b");
        assert_eq!(p("pool/a-b/c-").components(), &["pool", "a-b", "c-"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "/pool", "pool/", "pool//a", "pool/a@snap", "pool/a#bm", "po ol", "pool/<", "-r", "pool/-a"] {
            assert!(
                matches!(DatasetPath::parse(bad), Err(EndpointError::InvalidPath { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(DatasetPath::from_components(["pool", "-r"]).is_err());
    }

    #[test]
    fn test_prefix_ops() {
        let path = p("pool/a/b");
        assert!(path.starts_with(p("pool/a").components()));
        assert!(path.starts_with(path.components()));
        assert!(path.starts_with(&[]));
        assert!(!path.starts_with(p("pool/ab").components()));
        assert!(!p("pool").starts_with(path.components()));
        assert_eq!(path.parent(), Some(p("pool/a")));
        assert_eq!(p("pool").parent(), None);
    }

    #[test]
    fn test_forest_single_path_walk() {
        let mut forest = DatasetPathForest::new();
        forest.add(&p("pool/a/b"));
        let visits: Vec<_> = forest.walk_top_down().collect();
        assert_eq!(
            visits,
            vec![
                DatasetPathVisit { path: p("pool"), filled_in: true },
                DatasetPathVisit { path: p("pool/a"), filled_in: true },
                DatasetPathVisit { path: p("pool/a/b"), filled_in: false },
            ]
        );
    }

    #[test]
    fn test_forest_skip_children() {
        let mut forest = DatasetPathForest::new();
        forest.add(&p("pool/a/x"));
        forest.add(&p("pool/b/y"));
        forest.add(&p("other"));
        let mut walk = forest.walk_top_down();
        let mut seen = Vec::new();
        while let Some(v) = walk.next() {
            if v.path == p("pool/a") {
                walk.skip_children();
            }
            seen.push(v.path.to_string());
        }
        assert_eq!(seen, vec!["pool", "pool/a", "pool/b", "pool/b/y", "other"]);
    }

    #[test]
    fn test_forest_shared_prefix_added_once() {
        let mut forest = DatasetPathForest::new();
        forest.add(&p("pool/a"));
        forest.add(&p("pool/a/b"));
        let visits: Vec<_> = forest.walk_top_down().collect();
        assert_eq!(visits.len(), 3);
        assert!(!visits[1].filled_in);
    }

    #[test]
    fn test_version_full_name() {
        let fs = p("pool/a");
        assert_eq!(FilesystemVersion::snapshot("s1").full_name(&fs), "pool/a@s1");
        assert_eq!(FilesystemVersion::bookmark("b1").full_name(&fs), "pool/a#b1");
    }

    #[test]
    fn test_rel_name() {
        let snap = FilesystemVersion::parse_rel_name("@s1").unwrap();
        assert_eq!(snap.kind, VersionKind::Snapshot);
        assert_eq!(snap.name, "s1");
        assert_eq!(snap.rel_name(), "@s1");
        let bm = FilesystemVersion::parse_rel_name("#b1").unwrap();
        assert_eq!(bm.kind, VersionKind::Bookmark);
        for bad in ["s1", "@", "#a@b", ""] {
            assert!(FilesystemVersion::parse_rel_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_validate_version_name() {
        assert!(validate_version_name("zrepl_20240101").is_ok());
        for bad in ["", "a@b", "a/b", "a#b", "a b", "-rf"] {
            assert!(validate_version_name(bad).is_err(), "{bad:?}");
        }
    }
}
