//! Runtime configuration for indexing and storage.
//!
//! Values come from defaults, optionally a TOML file, and finally
//! `PARSELTONGUE_*` environment variables, in that order of precedence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PtResult, StoreError};

pub const DEFAULT_MAX_PARSE_DEPTH: usize = 64;
pub const DEFAULT_RESOLVER_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexer: IndexerConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> PtResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> PtResult<Self> {
        toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok());
        config
    }

    /// Apply `PARSELTONGUE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PARSELTONGUE_WORKERS").and_then(|v| v.trim().parse().ok()) {
            self.indexer.workers = v;
        }
        if let Some(v) = lookup("PARSELTONGUE_MAX_PARSE_DEPTH").and_then(|v| v.trim().parse().ok())
        {
            self.indexer.max_parse_depth = v;
        }
        if let Some(v) =
            lookup("PARSELTONGUE_RESOLVER_TIMEOUT_MS").and_then(|v| v.trim().parse().ok())
        {
            self.indexer.resolver_timeout_ms = v;
        }
        if let Some(v) = lookup("PARSELTONGUE_MAX_FILE_BYTES").and_then(|v| v.trim().parse().ok()) {
            self.indexer.max_file_bytes = v;
        }
        if let Some(v) = lookup("PARSELTONGUE_EXCLUDE_SENSITIVE") {
            self.indexer.exclude_sensitive = parse_flag(&v);
        }
        if let Some(v) = lookup("PARSELTONGUE_VERIFY_ON_OPEN") {
            self.store.verify_on_open = parse_flag(&v);
        }
    }
}

/// Anything other than `0|false|no|off` counts as enabled.
fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Parallel parse/extract workers.
    pub workers: usize,
    pub max_parse_depth: usize,
    /// Per-call deadline for the external symbol resolver.
    pub resolver_timeout_ms: u64,
    pub max_file_bytes: u64,
    pub exclude_sensitive: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_parse_depth: DEFAULT_MAX_PARSE_DEPTH,
            resolver_timeout_ms: DEFAULT_RESOLVER_TIMEOUT_MS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            exclude_sensitive: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Verify row checksums when the store is opened.
    pub verify_on_open: bool,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            verify_on_open: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.indexer.max_parse_depth, 64);
        assert_eq!(config.indexer.resolver_timeout_ms, 2000);
        assert!(config.indexer.workers >= 1);
        assert!(config.store.verify_on_open);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [indexer]
            workers = 3
            exclude_patterns = ["target/"]
            "#,
        )
        .unwrap();
        assert_eq!(config.indexer.workers, 3);
        assert_eq!(config.indexer.exclude_patterns, vec!["target/".to_string()]);
        assert_eq!(config.indexer.max_parse_depth, DEFAULT_MAX_PARSE_DEPTH);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_toml("indexer = 3").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PARSELTONGUE_WORKERS", "2"),
            ("PARSELTONGUE_RESOLVER_TIMEOUT_MS", " 150 "),
            ("PARSELTONGUE_EXCLUDE_SENSITIVE", "off"),
            ("PARSELTONGUE_MAX_PARSE_DEPTH", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.indexer.workers, 2);
        assert_eq!(config.indexer.resolver_timeout_ms, 150);
        assert!(!config.indexer.exclude_sensitive);
        assert_eq!(config.indexer.max_parse_depth, DEFAULT_MAX_PARSE_DEPTH);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("FALSE"));
        assert!(!parse_flag(" no "));
    }
}
