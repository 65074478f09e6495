//! Manager configuration file
//!
//! YAML document listing the pools to register at startup plus executor
//! limits and the bootstrap script location.
//!
//! ```yaml
//! pools:
//!   - uuid: pool-a
//!     name: web
//!     provider:
//!       kind: ec2
//!       connect: { identity: AKIA..., credential: ... }
//!       machine: { machinesCount: 2, tags: [web] }
//! executor:
//!   create_timeout_secs: 1200
//! bootstrap_script_path: /etc/node-pool/bootstrap.sh
//! ssh_port: 22
//! ```

use crate::controlplane::ExecutorConfig;
use crate::domain::PoolSettings;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Per task kind time limits, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,
}

fn default_create_timeout() -> u64 {
    1200
}

fn default_delete_timeout() -> u64 {
    300
}

fn default_bootstrap_timeout() -> u64 {
    900
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            create_timeout_secs: default_create_timeout(),
            delete_timeout_secs: default_delete_timeout(),
            bootstrap_timeout_secs: default_bootstrap_timeout(),
        }
    }
}

/// Top level configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub pools: Vec<PoolSettings>,
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Script run on nodes by bootstrap tasks
    #[serde(default)]
    pub bootstrap_script_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            executor: ExecutorSection::default(),
            bootstrap_script_path: None,
            ssh_port: default_ssh_port(),
        }
    }
}

impl ManagerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ManagerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&yaml)?;
        info!(path = %path.display(), pools = config.pools.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for pool in &self.pools {
            if pool.uuid.trim().is_empty() {
                return Err(Error::Configuration("pool with empty uuid".into()));
            }
            if !seen.insert(pool.uuid.as_str()) {
                return Err(Error::Configuration(format!("duplicate pool uuid {}", pool.uuid)));
            }
            if pool.provider.machine.machines_count == 0 {
                return Err(Error::Configuration(format!(
                    "pool {}: machinesCount must be at least 1",
                    pool.uuid
                )));
            }
        }

        let limits = [
            ("create_timeout_secs", self.executor.create_timeout_secs),
            ("delete_timeout_secs", self.executor.delete_timeout_secs),
            ("bootstrap_timeout_secs", self.executor.bootstrap_timeout_secs),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::Configuration(format!("{} must be positive", name)));
        }

        Ok(())
    }

    /// Executor settings, reading the bootstrap script if one is configured
    pub async fn executor_config(&self) -> Result<ExecutorConfig> {
        let bootstrap_script: Option<Arc<str>> = match &self.bootstrap_script_path {
            Some(path) => {
                let script = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::Configuration(format!(
                        "cannot read bootstrap script {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Some(Arc::from(script))
            }
            None => None,
        };

        Ok(ExecutorConfig {
            create_timeout: Duration::from_secs(self.executor.create_timeout_secs),
            delete_timeout: Duration::from_secs(self.executor.delete_timeout_secs),
            bootstrap_timeout: Duration::from_secs(self.executor.bootstrap_timeout_secs),
            ssh_port: self.ssh_port,
            bootstrap_script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderKind;
    use assert_matches::assert_matches;
    use std::io::Write;

    const SAMPLE: &str = r#"
pools:
  - uuid: pool-a
    name: web
    provider:
      kind: ec2
      connect:
        identity: AKIA
        credential: secret
      machine:
        machinesCount: 2
        tags: [web]
  - uuid: pool-b
    provider:
      kind: softlayer
executor:
  bootstrap_timeout_secs: 60
ssh_port: 2222
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = ManagerConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].provider.kind, ProviderKind::Ec2);
        assert_eq!(config.pools[0].provider.machine.machines_count, 2);
        assert_eq!(config.pools[1].provider.machine.machines_count, 1);
        assert_eq!(config.pools[1].group_name(), "pool-b");
        assert_eq!(config.executor.create_timeout_secs, 1200);
        assert_eq!(config.executor.bootstrap_timeout_secs, 60);
        assert_eq!(config.ssh_port, 2222);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ManagerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn test_validation_failures() {
        let duplicate = r#"
pools:
  - { uuid: a, provider: { kind: ec2 } }
  - { uuid: a, provider: { kind: hpcloud } }
"#;
        assert_matches!(ManagerConfig::from_yaml(duplicate), Err(Error::Configuration(_)));

        let zero = r#"
pools:
  - { uuid: a, provider: { kind: ec2, machine: { machinesCount: 0 } } }
"#;
        assert_matches!(ManagerConfig::from_yaml(zero), Err(Error::Configuration(_)));

        let no_limit = "executor: { delete_timeout_secs: 0 }";
        assert_matches!(ManagerConfig::from_yaml(no_limit), Err(Error::Configuration(_)));

        assert_matches!(ManagerConfig::from_yaml("pools: 3"), Err(Error::YamlParse(_)));
    }

    #[tokio::test]
    async fn test_load_and_read_bootstrap_script() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("bootstrap.sh");
        std::fs::write(&script_path, "#!/bin/sh\napt-get update\n").unwrap();

        let config_path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", SAMPLE).unwrap();
        writeln!(file, "bootstrap_script_path: {}", script_path.display()).unwrap();

        let config = ManagerConfig::load(&config_path).await.unwrap();
        let executor = config.executor_config().await.unwrap();
        assert_eq!(executor.bootstrap_timeout, Duration::from_secs(60));
        assert_eq!(executor.ssh_port, 2222);
        assert!(executor.bootstrap_script.unwrap().contains("apt-get update"));
    }

    #[tokio::test]
    async fn test_missing_script_is_configuration_error() {
        let config = ManagerConfig {
            bootstrap_script_path: Some(PathBuf::from("/nonexistent/bootstrap.sh")),
            ..Default::default()
        };
        assert_matches!(config.executor_config().await, Err(Error::Configuration(_)));
        assert_matches!(
            ManagerConfig::load("/nonexistent/config.yaml").await,
            Err(Error::Configuration(_))
        );
    }
}
