// ABOUTME: TOML configuration: node inventory, mirror location, cache TTLs, timeouts
// ABOUTME: Validated on load; nodes are always selected explicitly by name

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::models::Node;

pub const DEFAULT_CONFIG_PATH: &str = "scrapyd-manager.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default, rename = "node")]
    pub nodes: Vec<Node>,
}

fn default_database() -> PathBuf {
    PathBuf::from("scrapyd-mirror.db")
}

/// How long each remote listing may be served from memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub projects_ttl_secs: u64,
    pub versions_ttl_secs: u64,
    pub jobs_ttl_secs: u64,
    /// Reuse window for a whole node cycle. 0 only serializes concurrent syncs.
    pub sync_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            projects_ttl_secs: 60,
            versions_ttl_secs: 60,
            jobs_ttl_secs: 10,
            sync_ttl_secs: 0,
        }
    }
}

impl CacheSettings {
    pub fn projects(&self) -> Duration {
        Duration::from_secs(self.projects_ttl_secs)
    }

    pub fn versions(&self) -> Duration {
        Duration::from_secs(self.versions_ttl_secs)
    }

    pub fn jobs(&self) -> Duration {
        Duration::from_secs(self.jobs_ttl_secs)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub control_secs: u64,
    pub upload_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            control_secs: 15,
            upload_secs: 60,
        }
    }
}

impl TimeoutSettings {
    pub fn control(&self) -> Duration {
        Duration::from_secs(self.control_secs)
    }

    pub fn upload(&self) -> Duration {
        Duration::from_secs(self.upload_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ManagerError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ManagerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ManagerError::Config(format!("failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ManagerError::Config("no nodes configured".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(ManagerError::Config("node with empty name".into()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(ManagerError::Config(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            if node.host.trim().is_empty() {
                return Err(ManagerError::Config(format!(
                    "node '{}': host must not be empty",
                    node.name
                )));
            }
            if node.username.is_some() != node.password.is_some() {
                return Err(ManagerError::Config(format!(
                    "node '{}': username and password must be set together",
                    node.name
                )));
            }
            if node.utc_offset_minutes.abs() >= 24 * 60 {
                return Err(ManagerError::Config(format!(
                    "node '{}': utc_offset_minutes out of range",
                    node.name
                )));
            }
        }

        if self.timeouts.control_secs == 0 || self.timeouts.upload_secs == 0 {
            return Err(ManagerError::Config("timeouts must be greater than zero".into()));
        }

        Ok(())
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ManagerError::NotFound(format!("node '{}'", name)))
    }
}
