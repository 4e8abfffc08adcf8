//! Configuration loading.
//!
//! Settings come from an optional TOML file, then environment overrides for
//! endpoints and credentials. Every field has a default matching the
//! production build cache, so the indexer runs with no file at all as long as
//! `OPENSEARCH_ENDPOINT` is set.
//!
//! ```toml
//! [object_store]
//! bucket = "spack-binaries"
//! prefix = "develop/build_cache"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//!
//! [search]
//! endpoint = "https://opensearch.example.org"
//! index_prefix = "pipeline-logs"
//! mapping_path = "./config/pipeline_logs_mapping.json"
//!
//! [backfill]
//! concurrency = 16
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// S3-compatible endpoint (MinIO, LocalStack). Switches to path-style URLs.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_descriptor_suffix")]
    pub descriptor_suffix: String,
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            prefix: default_prefix(),
            region: default_region(),
            endpoint_url: None,
            descriptor_suffix: default_descriptor_suffix(),
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

fn default_bucket() -> String {
    "spack-binaries".to_string()
}
fn default_prefix() -> String {
    "develop/build_cache".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_descriptor_suffix() -> String {
    ".spec.json.sig".to_string()
}
fn default_store_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    /// JSON file sent as the body of the index-creation request.
    #[serde(default)]
    pub mapping_path: Option<PathBuf>,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            username: None,
            password: None,
            index_prefix: default_index_prefix(),
            mapping_path: None,
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_index_prefix() -> String {
    "pipeline-logs".to_string()
}
fn default_search_timeout_secs() -> u64 {
    30
}

impl SearchConfig {
    /// Read the index mapping file, if configured.
    pub fn load_mapping(&self) -> Result<Option<Value>> {
        let Some(path) = &self.mapping_path else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index mapping: {}", path.display()))?;
        let mapping = serde_json::from_str(&content)
            .with_context(|| format!("Index mapping is not valid JSON: {}", path.display()))?;
        Ok(Some(mapping))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackfillConfig {
    /// Worker pool size. Defaults to the number of available CPUs.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Where per-item scratch directories are created. Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl BackfillConfig {
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("OPENSEARCH_ENDPOINT") {
            self.search.endpoint = v;
        }
        if let Some(v) = lookup("OPENSEARCH_USERNAME") {
            self.search.username = Some(v);
        }
        if let Some(v) = lookup("OPENSEARCH_PASSWORD") {
            self.search.password = Some(v);
        }
        if let Some(v) = lookup("BUILDCACHE_BUCKET") {
            self.object_store.bucket = v;
        }
        if let Some(v) = lookup("BUILDCACHE_PREFIX") {
            self.object_store.prefix = v;
        }
        if let Some(v) = lookup("AWS_REGION") {
            self.object_store.region = v;
        }
        if let Some(v) = lookup("S3_ENDPOINT_URL") {
            self.object_store.endpoint_url = Some(v);
        }
    }

    /// Structural checks that hold for every command.
    pub fn validate(&self) -> Result<()> {
        if self.object_store.bucket.trim().is_empty() {
            bail!("object_store.bucket must not be empty");
        }
        if self.object_store.descriptor_suffix.is_empty() {
            bail!("object_store.descriptor_suffix must not be empty");
        }
        if self.search.index_prefix.trim().is_empty() {
            bail!("search.index_prefix must not be empty");
        }
        if self.backfill.concurrency == Some(0) {
            bail!("backfill.concurrency must be >= 1");
        }
        if let Some(dir) = &self.backfill.scratch_dir {
            if !dir.is_dir() {
                bail!(
                    "backfill.scratch_dir is not an existing directory: {}",
                    dir.display()
                );
            }
        }
        Ok(())
    }

    /// Checks needed before talking to the search backend.
    pub fn require_search_endpoint(&self) -> Result<()> {
        let endpoint = &self.search.endpoint;
        if endpoint.is_empty() {
            bail!("search.endpoint is not set (config file or OPENSEARCH_ENDPOINT)");
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!(
                "search.endpoint must be an http(s) URL, got '{}'",
                endpoint
            );
        }
        Ok(())
    }
}

/// Load configuration from `path` (or defaults when `None`), apply
/// environment overrides, and validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
