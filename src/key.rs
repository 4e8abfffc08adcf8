//! Descriptor key parsing.
//!
//! Build-cache descriptor keys encode the artifact identity in their name:
//!
//! ```text
//! <prefix>/<platform>-<compiler>-<version>-<package>-<hash>.spec.json.sig
//! ```
//!
//! Every segment is hyphen-delimited and platform, compiler and package names
//! may themselves contain hyphens, so the split is best-effort. The pattern
//! anchors on the compiler version (a run of digits, dots and `+`) and lets
//! greedy matching settle the rest. A key that does not match is a per-item
//! failure; no speculative correction is attempted.

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::ItemError;
use crate::models::ArtifactKey;

/// Parses descriptor keys under one fixed prefix.
#[derive(Debug, Clone)]
pub struct KeyParser {
    prefix: String,
    pattern: Regex,
}

impl KeyParser {
    /// Build a parser for keys under `prefix` ending in `suffix`
    /// (normally `.spec.json.sig`).
    pub fn new(prefix: &str, suffix: &str) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/').to_string();
        let source = format!(
            r"^{}/(.+)-(.+-[\d+\.]+)-(.+)-(.+){}$",
            regex::escape(&prefix),
            regex::escape(suffix)
        );
        let pattern = Regex::new(&source)
            .with_context(|| format!("Failed to build descriptor key pattern for '{}'", prefix))?;
        Ok(Self { prefix, pattern })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Split a descriptor key into its [`ArtifactKey`].
    pub fn parse(&self, key: &str) -> Result<ArtifactKey, ItemError> {
        let caps = self
            .pattern
            .captures(key)
            .ok_or_else(|| ItemError::Parse(key.to_string()))?;

        Ok(ArtifactKey {
            platform: caps[1].to_string(),
            compiler: caps[2].to_string(),
            package: caps[3].to_string(),
            hash: caps[4].to_string(),
        })
    }

    /// Bundle path for a parsed key, under this parser's prefix.
    pub fn bundle_path(&self, artifact: &ArtifactKey) -> String {
        artifact.bundle_path(&self.prefix)
    }
}
