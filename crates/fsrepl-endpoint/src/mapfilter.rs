//! Table-driven dataset filter and mapping.
//!
//! A table maps patterns to values. A pattern is a dataset path, optionally
//! suffixed with `<` to cover the path and everything below it; `<` alone
//! covers every dataset. The most specific matching pattern wins, and an
//! exact pattern beats a subtree pattern of the same path.
//!
//! In filter mode the values are `ok` or `!`. In map mode the values are
//! target paths or `!`; a subtree entry appends the part below the pattern
//! to its target.

use std::sync::Arc;

use crate::dataset::DatasetPath;
use crate::filter::{FilterError, MapAsFilter, PathFilter, PathMap};

/// Value that passes a path in filter mode.
pub const PASS: &str = "ok";
/// Value that rejects a path in either mode.
pub const DENY: &str = "!";

#[derive(Debug, Clone, PartialEq, Eq)]
enum MapValue {
    Pass,
    Deny,
    Target(Vec<String>),
}

#[derive(Debug, Clone)]
struct MapEntry {
    /// Empty for the root wildcard `<`.
    prefix: Vec<String>,
    subtree: bool,
    value: MapValue,
}

impl MapEntry {
    fn matches(&self, path: &DatasetPath) -> bool {
        if self.subtree {
            path.starts_with(&self.prefix)
        } else {
            path.components() == &self.prefix[..]
        }
    }

    fn pattern(&self) -> String {
        let mut s = self.prefix.join("/");
        if self.subtree {
            s.push('<');
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Filter,
    Map,
}

/// Filter or mapping described by a pattern table.
#[derive(Debug, Clone)]
pub struct DatasetMapFilter {
    entries: Vec<MapEntry>,
    mode: Mode,
}

fn parse_pattern(pattern: &str) -> Result<(Vec<String>, bool), FilterError> {
    let invalid = |reason: String| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    let (body, subtree) = match pattern.strip_suffix('<') {
        Some(body) => (body, true),
        None => (pattern, false),
    };
    if body.is_empty() {
        if subtree {
            return Ok((Vec::new(), true));
        }
        return Err(invalid("empty pattern".to_string()));
    }
    let path = DatasetPath::parse(body).map_err(|e| invalid(e.to_string()))?;
    Ok((path.components().to_vec(), subtree))
}

impl DatasetMapFilter {
    /// Build a filter table: every value must be `ok` or `!`.
    pub fn new_filter<I, K, V>(table: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::build(table, Mode::Filter)
    }

    /// Build a mapping table: every value must be a target path or `!`.
    pub fn new_mapping<I, K, V>(table: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::build(table, Mode::Map)
    }

    fn build<I, K, V>(table: I, mode: Mode) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entries: Vec<MapEntry> = Vec::new();
        for (k, v) in table {
            let (pattern, value) = (k.as_ref(), v.as_ref());
            let (prefix, subtree) = parse_pattern(pattern)?;
            let value = match (value, mode) {
                (DENY, _) => MapValue::Deny,
                (PASS, Mode::Filter) => MapValue::Pass,
                (PASS, Mode::Map) | (_, Mode::Filter) => return Err(FilterError::MixedModes),
                (target, Mode::Map) => {
                    let t = DatasetPath::parse(target).map_err(|e| FilterError::InvalidTarget {
                        pattern: pattern.to_string(),
                        target: target.to_string(),
                        reason: e.to_string(),
                    })?;
                    MapValue::Target(t.components().to_vec())
                }
            };
            let entry = MapEntry {
                prefix,
                subtree,
                value,
            };
            if entries
                .iter()
                .any(|e| e.prefix == entry.prefix && e.subtree == entry.subtree)
            {
                return Err(FilterError::DuplicatePattern(entry.pattern()));
            }
            entries.push(entry);
        }
        Ok(Self { entries, mode })
    }

    fn best_match(&self, path: &DatasetPath) -> Option<&MapEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(path))
            .max_by_key(|e| (e.prefix.len(), !e.subtree))
    }
}

impl PathFilter for DatasetMapFilter {
    fn filter(&self, path: &DatasetPath) -> Result<bool, FilterError> {
        match self.mode {
            Mode::Filter => Ok(matches!(
                self.best_match(path).map(|e| &e.value),
                Some(MapValue::Pass)
            )),
            Mode::Map => Ok(self.map(path)?.is_some()),
        }
    }
}

impl PathMap for DatasetMapFilter {
    fn map(&self, path: &DatasetPath) -> Result<Option<DatasetPath>, FilterError> {
        if self.mode == Mode::Filter {
            return Err(FilterError::NotAMapping);
        }
        let Some(entry) = self.best_match(path) else {
            return Ok(None);
        };
        let MapValue::Target(target) = &entry.value else {
            return Ok(None);
        };
        let mut comps = target.clone();
        if entry.subtree {
            comps.extend(path.components()[entry.prefix.len()..].iter().cloned());
        }
        if comps.is_empty() {
            return Ok(None);
        }
        DatasetPath::from_components(comps)
            .map(Some)
            .map_err(|e| FilterError::Unmapped {
                path: format!("{}: {}", path, e),
            })
    }

    fn invert(&self) -> Result<Arc<dyn PathMap>, FilterError> {
        if self.mode == Mode::Filter {
            return Err(FilterError::NotAMapping);
        }
        let [entry] = self.entries.as_slice() else {
            return Err(FilterError::NotInvertible(format!(
                "only a single subtree entry can be inverted, table has {} entries",
                self.entries.len()
            )));
        };
        if !entry.subtree {
            return Err(FilterError::NotInvertible(format!(
                "entry {:?} is not a subtree pattern",
                entry.pattern()
            )));
        }
        let MapValue::Target(target) = &entry.value else {
            return Err(FilterError::NotInvertible(format!(
                "entry {:?} has no target",
                entry.pattern()
            )));
        };
        Ok(Arc::new(DatasetMapFilter {
            entries: vec![MapEntry {
                prefix: target.clone(),
                subtree: true,
                value: MapValue::Target(entry.prefix.clone()),
            }],
            mode: Mode::Map,
        }))
    }

    fn as_filter(self: Arc<Self>) -> Arc<dyn PathFilter> {
        Arc::new(MapAsFilter(self))
    }
}
