// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! CLI configuration file.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for store access and polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// PostgreSQL connection string. When absent, commands fall back to an
    /// in-process memory store (single-process runs only).
    #[serde(default)]
    pub database_url: Option<String>,

    /// Task list this process targets.
    #[serde(default = "default_task_list")]
    pub task_list: String,

    /// Lease duration for claimed tasks, in seconds.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Number of pollers a worker process runs.
    #[serde(default = "default_pollers")]
    pub pollers: usize,
}

fn default_task_list() -> String {
    "default".to_string()
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_pollers() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            task_list: default_task_list(),
            lease_seconds: default_lease_seconds(),
            pollers: default_pollers(),
        }
    }
}

impl Config {
    /// Load a YAML config file; missing path yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.task_list, "default");
        assert_eq!(config.lease_seconds, 300);
        assert_eq!(config.pollers, 1);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_parse_yaml() {
        let config: Config = serde_yaml::from_str(
            "database_url: postgresql://localhost/afl\ntask_list: gpu\nlease_seconds: 120\n",
        )
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgresql://localhost/afl"));
        assert_eq!(config.task_list, "gpu");
        assert_eq!(config.lease_seconds, 120);
    }
}
