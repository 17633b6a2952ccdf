//! Configuration file loading.
//!
//! ```yaml
//! v: 3
//! raft:
//!   dataDir: /var/lib/fabric
//!   bindAddress: 0.0.0.0:6262
//!   advertiseAddress: 10.0.0.1:6262
//!   minClusterSize: 3
//!   bootstrapMembers: [10.0.0.2:6262, 10.0.0.3:6262]
//! log:
//!   format: json
//!   level: info
//! ```

use anyhow::{bail, Context, Result};
use fabric_cluster::ClusterConfig;
use serde::Deserialize;
use std::path::Path;

/// The only configuration version this build understands.
pub const CONFIG_VERSION: u32 = 3;

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Configuration version.
    pub v: u32,
    /// Controller settings.
    #[serde(default)]
    pub raft: ClusterConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `compact`, `pretty` or `json`.
    pub format: Option<String>,
    /// Filter directive, e.g. `info,fabric_cluster=debug`.
    pub level: Option<String>,
}

impl FileConfig {
    /// Parse a YAML document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: FileConfig =
            serde_yaml::from_str(text).context("Failed to parse configuration")?;
        if config.v != CONFIG_VERSION {
            bail!(
                "unsupported configuration version {} (expected {})",
                config.v,
                CONFIG_VERSION
            );
        }
        Ok(config)
    }

    /// Load and validate `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))?;
        config
            .raft
            .validate()
            .map_err(anyhow::Error::msg)
            .context("Invalid raft configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = FileConfig::parse(
            r#"
v: 3
raft:
  nodeId: ctrl-1
  dataDir: /tmp/fabric
  bindAddress: 127.0.0.1:7000
  minClusterSize: 3
  bootstrapMembers: [127.0.0.1:7001, 127.0.0.1:7002]
  commandHandler:
    maxQueueSize: 50
log:
  format: json
"#,
        )
        .expect("parse");

        assert_eq!(config.raft.node_id.as_deref(), Some("ctrl-1"));
        assert_eq!(config.raft.min_cluster_size, 3);
        assert_eq!(config.raft.bootstrap_members.len(), 2);
        assert_eq!(config.raft.command_handler.max_queue_size, 50);
        assert_eq!(config.raft.command_handler.max_workers, 10);
        assert_eq!(config.log.format.as_deref(), Some("json"));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FileConfig::parse("v: 3\n").expect("parse");
        assert_eq!(config.raft.bind_address, "127.0.0.1:6262");
        assert_eq!(config.raft.min_cluster_size, 1);
    }

    #[test]
    fn test_wrong_version_is_an_error() {
        let err = FileConfig::parse("v: 2\n").expect_err("version");
        assert!(err.to_string().contains("unsupported configuration version 2"));
    }

    #[test]
    fn test_unknown_section_is_an_error() {
        assert!(FileConfig::parse("v: 3\nbogus: 1\n").is_err());
    }

    #[test]
    fn test_missing_version_is_an_error() {
        assert!(FileConfig::parse("raft: {}\n").is_err());
    }

    #[test]
    fn test_load_rejects_invalid_raft_section() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("fabric.yml");
        std::fs::write(&path, "v: 3\nraft:\n  bindAddress: \"\"\n").expect("write");
        let err = FileConfig::load(&path).expect_err("invalid");
        assert!(format!("{:#}", err).contains("Invalid raft configuration"));
    }
}
