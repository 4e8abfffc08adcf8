//! Core data models used throughout the indexer.
//!
//! An [`ArtifactKey`] is parsed from each descriptor key listed in the build
//! cache; a [`BuildDocument`] is what finally lands in the search index.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};

/// Identity of one build-cache artifact, parsed from its descriptor key.
///
/// `hash` is the join key against the search index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    /// Target platform, e.g. `linux-x86_64`.
    pub platform: String,
    /// Compiler name and version, e.g. `gcc-9.3.0`.
    pub compiler: String,
    /// Package name, e.g. `zlib`.
    pub package: String,
    /// Content-derived build hash.
    pub hash: String,
}

impl ArtifactKey {
    /// Storage path of the bundle this descriptor advertises.
    ///
    /// ```text
    /// <prefix>/<platform>/<compiler>/<package>/<platform>-<compiler>-<package>-<hash>.spack
    /// ```
    pub fn bundle_path(&self, prefix: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}-{}-{}-{}.spack",
            prefix.trim_end_matches('/'),
            self.platform,
            self.compiler,
            self.package,
            self.platform,
            self.compiler,
            self.package,
            self.hash
        )
    }

    /// Top-level directory inside the bundle: `<package>-<hash>`.
    pub fn bundle_root(&self) -> String {
        format!("{}-{}", self.package, self.hash)
    }
}

/// The unit written to the search index, one per build hash.
///
/// `spec` and `install_times` have already had their booleans rewritten to
/// `"true"`/`"false"` strings by the assembler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildDocument {
    pub hash: String,
    pub spec: Value,
    pub install_times: Map<String, Value>,
    /// Raw build output keyed by `"<phase-number>-<phase-name>"`.
    pub build_phase_logs: BTreeMap<String, String>,
    pub ingestion_date: NaiveDate,
}
