//! Selective extraction of build metadata from a `.spack` bundle.
//!
//! A bundle is a gzip-compressed tar whose build metadata lives under
//! `<package>-<hash>/.spack/`. Only three kinds of entry are ever written to
//! disk:
//!
//! | Entry | Used for |
//! |-------|----------|
//! | `spec.json` | package/build spec (`spec` field) |
//! | `install_times.json` | phase → duration mapping |
//! | `spack-build-<N>-<phase>-out.txt` | raw per-phase build output |
//!
//! The archive is streamed once; each entry's path is checked against the
//! wanted set and only matches are unpacked. Everything else (the installed
//! prefix itself, which can be gigabytes) is skipped without touching disk.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use regex::Regex;
use serde_json::Value;

pub const SPEC_FILE: &str = "spec.json";
pub const INSTALL_TIMES_FILE: &str = "install_times.json";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("bundle has no entry {0}")]
    MissingEntry(String),

    #[error("{entry} is not valid JSON: {source}")]
    Json {
        entry: String,
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata pulled out of one bundle.
#[derive(Debug, Clone)]
pub struct ExtractedBundle {
    /// Parsed `spec.json` (whole file, the `spec` field is picked later).
    pub spec_json: Value,
    /// Parsed `install_times.json`.
    pub install_times: Value,
    /// Phase log text keyed by `"<phase-number>-<phase-name>"`.
    pub phase_logs: BTreeMap<String, String>,
}

/// What a wanted entry is.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Wanted {
    Spec,
    InstallTimes,
    PhaseLog(String),
}

fn phase_log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^spack-build-(\d+)-(.+)-out\.txt$").expect("phase log pattern is valid")
    })
}

/// Decide whether an archive path is one of the entries we keep.
///
/// `meta_dir` is `<package>-<hash>/.spack/`. Phase logs must sit directly in
/// it; nested files with a matching name are ignored.
fn classify(path: &str, meta_dir: &str) -> Option<Wanted> {
    let path = path.strip_prefix("./").unwrap_or(path);
    let name = path.strip_prefix(meta_dir)?;
    if name.contains('/') {
        return None;
    }
    match name {
        SPEC_FILE => Some(Wanted::Spec),
        INSTALL_TIMES_FILE => Some(Wanted::InstallTimes),
        _ => {
            let caps = phase_log_pattern().captures(name)?;
            Some(Wanted::PhaseLog(format!("{}-{}", &caps[1], &caps[2])))
        }
    }
}

/// Extract the build metadata for `root` (`<package>-<hash>`) from the bundle
/// at `bundle` into `workdir`, then load it.
///
/// Blocking; call from `spawn_blocking` when on the async runtime.
///
/// # Errors
///
/// Fails when the archive cannot be read, when `spec.json` or
/// `install_times.json` is missing, or when either is not valid JSON.
/// Phase logs are optional.
pub fn extract_bundle(
    bundle: &Path,
    root: &str,
    workdir: &Path,
) -> Result<ExtractedBundle, ExtractError> {
    let meta_dir = format!("{}/.spack/", root);
    std::fs::create_dir_all(workdir)?;

    let file = File::open(bundle)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut spec_path: Option<PathBuf> = None;
    let mut install_times_path: Option<PathBuf> = None;
    let mut log_paths: BTreeMap<String, PathBuf> = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let Some(wanted) = classify(&path, &meta_dir) else {
            continue;
        };

        // unpack_in refuses entries that would land outside workdir
        if !entry.unpack_in(workdir)? {
            tracing::warn!(entry = %path, "skipping bundle entry outside extraction directory");
            continue;
        }
        let dest = workdir.join(path.strip_prefix("./").unwrap_or(&path));

        match wanted {
            Wanted::Spec => spec_path = Some(dest),
            Wanted::InstallTimes => install_times_path = Some(dest),
            Wanted::PhaseLog(phase) => {
                log_paths.insert(phase, dest);
            }
        }
    }

    let spec_path =
        spec_path.ok_or_else(|| ExtractError::MissingEntry(format!("{}{}", meta_dir, SPEC_FILE)))?;
    let install_times_path = install_times_path
        .ok_or_else(|| ExtractError::MissingEntry(format!("{}{}", meta_dir, INSTALL_TIMES_FILE)))?;

    let spec_json = read_json(&spec_path, SPEC_FILE)?;
    let install_times = read_json(&install_times_path, INSTALL_TIMES_FILE)?;

    let mut phase_logs = BTreeMap::new();
    for (phase, path) in log_paths {
        let bytes = std::fs::read(&path)?;
        phase_logs.insert(phase, String::from_utf8_lossy(&bytes).into_owned());
    }

    Ok(ExtractedBundle {
        spec_json,
        install_times,
        phase_logs,
    })
}

fn read_json(path: &Path, entry: &str) -> Result<Value, ExtractError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| ExtractError::Json {
        entry: entry.to_string(),
        source,
    })
}
