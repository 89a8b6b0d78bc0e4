//! Daemon configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, MemBackend, ZfsCli};
use crate::endpoint::LocalEndpoint;
use crate::error::Result;
use crate::filter::{AnyVersion, PrefixVersionFilter, VersionFilter};
use crate::mapfilter::DatasetMapFilter;
use crate::receiver::LocalReceiver;
use crate::sender::LocalSender;

/// Role the daemon serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Export filesystems that pass the `filesystems` filter.
    Sender,
    /// Accept filesystems into the namespace given by the `filesystems` mapping.
    Receiver,
}

/// Filesystem engine to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The `zfs` command-line tool.
    Zfs,
    /// Volatile in-memory engine, for trying things out.
    Memory,
}

/// Configuration of `fsrepl serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Address to listen on.
    pub listen: String,
    /// Which endpoint to serve.
    pub role: Role,
    /// Pattern table: a filter (`ok`/`!`) for senders, a mapping
    /// (target path/`!`) for receivers.
    pub filesystems: BTreeMap<String, String>,
    /// Only expose versions whose name starts with this prefix.
    pub version_prefix: Option<String>,
    /// Upper bound on calls served at the same time.
    pub max_concurrent_calls: usize,
    /// Filesystem engine.
    pub backend: BackendKind,
    /// Path of the `zfs` binary.
    pub zfs_binary: PathBuf,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0:8888"),
            role: Role::Sender,
            filesystems: BTreeMap::new(),
            version_prefix: None,
            max_concurrent_calls: 4,
            backend: BackendKind::Zfs,
            zfs_binary: PathBuf::from("zfs"),
        }
    }
}

impl EndpointConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: EndpointConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_calls == 0 {
            anyhow::bail!("max_concurrent_calls must be at least 1");
        }
        if self.filesystems.is_empty() {
            anyhow::bail!("filesystems table is empty; nothing would be visible");
        }
        Ok(())
    }

    /// Engine selected by `backend`.
    pub fn backend(&self) -> Arc<dyn Backend> {
        match self.backend {
            BackendKind::Zfs => Arc::new(ZfsCli::new(&self.zfs_binary)),
            BackendKind::Memory => Arc::new(MemBackend::new()),
        }
    }

    /// Version filter selected by `version_prefix`.
    pub fn version_filter(&self) -> Arc<dyn VersionFilter> {
        match &self.version_prefix {
            Some(prefix) => Arc::new(PrefixVersionFilter::new(prefix.clone())),
            None => Arc::new(AnyVersion),
        }
    }

    /// Build the configured endpoint on top of `backend`.
    pub fn local_endpoint(&self, backend: Arc<dyn Backend>) -> Result<LocalEndpoint> {
        let versions = self.version_filter();
        Ok(match self.role {
            Role::Sender => {
                let filter = DatasetMapFilter::new_filter(&self.filesystems)?;
                LocalEndpoint::Sender(Arc::new(LocalSender::new(
                    backend,
                    Arc::new(filter),
                    versions,
                )))
            }
            Role::Receiver => {
                let map = DatasetMapFilter::new_mapping(&self.filesystems)?;
                LocalEndpoint::Receiver(Arc::new(LocalReceiver::new(
                    backend,
                    Arc::new(map),
                    versions,
                )?))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = EndpointConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8888");
        assert_eq!(config.role, Role::Sender);
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.backend, BackendKind::Zfs);
        assert_eq!(config.zfs_binary, PathBuf::from("zfs"));
        assert!(config.version_prefix.is_none());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
listen = "127.0.0.1:9000"
role = "receiver"
version_prefix = "zrepl_"
max_concurrent_calls = 2
backend = "memory"

[filesystems]
"<" = "backup/host1"
"#
        )
        .unwrap();

        let config = EndpointConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.role, Role::Receiver);
        assert_eq!(config.version_prefix.as_deref(), Some("zrepl_"));
        assert_eq!(config.filesystems.get("<").map(String::as_str), Some("backup/host1"));
        assert_eq!(config.zfs_binary, PathBuf::from("zfs"));

        let endpoint = config.local_endpoint(config.backend()).unwrap();
        assert!(endpoint.receiver().is_some());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"role": "sender", "filesystems": {{"pool<": "ok", "pool/tmp<": "!"}}}}"#
        )
        .unwrap();

        let config = EndpointConfig::from_file(file.path()).unwrap();
        assert_eq!(config.role, Role::Sender);
        let endpoint = config.local_endpoint(Arc::new(MemBackend::new())).unwrap();
        assert!(endpoint.sender().is_some());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(EndpointConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = EndpointConfig::default();
        assert!(config.validate().is_err());
        config.filesystems.insert("<".into(), "ok".into());
        assert!(config.validate().is_ok());
        config.max_concurrent_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_receiver_rejects_non_invertible_mapping() {
        let config = EndpointConfig {
            role: Role::Receiver,
            filesystems: [("a<", "x"), ("b<", "y")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..EndpointConfig::default()
        };
        assert!(config.local_endpoint(Arc::new(MemBackend::new())).is_err());
    }

    #[test]
    fn test_sender_rejects_mapping_table() {
        let config = EndpointConfig {
            role: Role::Sender,
            filesystems: [("pool<".to_string(), "backup".to_string())].into(),
            ..EndpointConfig::default()
        };
        assert!(config.local_endpoint(Arc::new(MemBackend::new())).is_err());
    }
}
