//! Backfill orchestration.
//!
//! Lists every descriptor key in the build cache, then indexes each one on a
//! bounded worker pool:
//!
//! ```text
//! Listed → Parsed → DedupChecked ─┬─▶ Skipped
//!                                 └─▶ Fetched → Extracted → Assembled → Written
//! ```
//!
//! Any step can instead end the item in `Failed`. Failures are logged with the
//! descriptor key and the resolved bundle path and counted; they never stop
//! sibling items or the run. Only a listing failure aborts a backfill.
//!
//! Each task owns its scratch space (downloaded bundle plus extraction
//! directory) and reports an [`ItemReport`]; the [`RunSummary`] is folded from
//! those reports once every task has finished.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::assemble::assemble;
use crate::config::Config;
use crate::error::ItemError;
use crate::extract::extract_bundle;
use crate::key::KeyParser;
use crate::models::ArtifactKey;
use crate::object_store::ObjectStore;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::search::{index_name, IndexStatus, SearchBackend};

/// Settings for one backfill run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Key prefix in the bucket, e.g. `develop/build_cache`.
    pub prefix: String,
    /// Descriptor suffix, e.g. `.spec.json.sig`.
    pub suffix: String,
    pub index_prefix: String,
    /// Maximum number of keys processed at once.
    pub concurrency: usize,
    /// Process only the first `limit` listed keys.
    pub limit: Option<usize>,
    /// List and parse only; no index creation, downloads, or writes.
    pub dry_run: bool,
    /// Date that names the index partition written to.
    pub today: NaiveDate,
    pub scratch_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn from_config(config: &Config, today: NaiveDate) -> Self {
        Self {
            prefix: config.object_store.prefix.clone(),
            suffix: config.object_store.descriptor_suffix.clone(),
            index_prefix: config.search.index_prefix.clone(),
            concurrency: config.backfill.effective_concurrency(),
            limit: None,
            dry_run: false,
            today,
            scratch_dir: config.backfill.scratch_dir.clone(),
        }
    }
}

/// Terminal state of one descriptor key.
#[derive(Debug)]
pub enum ItemOutcome {
    Written { doc_id: String },
    /// A document for this build hash already exists.
    Skipped,
    Failed(ItemError),
}

/// What happened to one descriptor key.
#[derive(Debug)]
pub struct ItemReport {
    pub key: String,
    /// Resolved bundle path; `None` when the key did not parse.
    pub bundle_path: Option<String>,
    pub outcome: ItemOutcome,
}

impl ItemReport {
    fn log(&self) {
        let bundle = self.bundle_path.as_deref().unwrap_or("-");
        match &self.outcome {
            ItemOutcome::Written { doc_id } => {
                tracing::info!(key = %self.key, bundle, doc_id = %doc_id, "indexed build")
            }
            ItemOutcome::Skipped => {
                tracing::info!(key = %self.key, "build hash already indexed, skipping")
            }
            ItemOutcome::Failed(e) => tracing::error!(
                key = %self.key,
                bundle,
                stage = e.stage(),
                error = %e,
                "failed to index build"
            ),
        }
    }
}

/// Aggregate counts for a run. `written + skipped + failed == listed`
/// for a real run; a dry run fills `planned` instead of `written`/`skipped`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub listed: usize,
    pub planned: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_reports(reports: &[ItemReport]) -> Self {
        let mut summary = RunSummary {
            listed: reports.len(),
            ..RunSummary::default()
        };
        for report in reports {
            match report.outcome {
                ItemOutcome::Written { .. } => summary.written += 1,
                ItemOutcome::Skipped => summary.skipped += 1,
                ItemOutcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Items that reached a non-failed terminal state.
    pub fn succeeded(&self) -> usize {
        self.written + self.skipped
    }
}

/// Task-local scratch space: the downloaded bundle and its extraction
/// directory. Removed when dropped, on every exit path.
struct ScratchArchive {
    dir: TempDir,
}

impl ScratchArchive {
    fn create(base: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("build-log-indexer-");
        let dir = match base {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    fn bundle_path(&self) -> PathBuf {
        self.dir.path().join("bundle.spack")
    }

    fn extract_dir(&self) -> PathBuf {
        self.dir.path().join("extract")
    }
}

/// State shared by every task in a run. Read-only.
struct Worker {
    store: Arc<dyn ObjectStore>,
    search: Arc<dyn SearchBackend>,
    parser: KeyParser,
    index: String,
    today: NaiveDate,
    scratch_dir: Option<PathBuf>,
}

impl Worker {
    async fn process(&self, key: String) -> ItemReport {
        let report = match self.parser.parse(&key) {
            Ok(artifact) => {
                let bundle_path = self.parser.bundle_path(&artifact);
                let outcome = self
                    .index_artifact(&artifact, &bundle_path)
                    .await
                    .unwrap_or_else(ItemOutcome::Failed);
                ItemReport {
                    key,
                    bundle_path: Some(bundle_path),
                    outcome,
                }
            }
            Err(e) => ItemReport {
                key,
                bundle_path: None,
                outcome: ItemOutcome::Failed(e),
            },
        };
        report.log();
        report
    }

    /// Report for an item whose task panicked or was cancelled.
    fn aborted(&self, key: String, err: JoinError) -> ItemReport {
        let bundle_path = self
            .parser
            .parse(&key)
            .ok()
            .map(|artifact| self.parser.bundle_path(&artifact));
        let report = ItemReport {
            key,
            bundle_path,
            outcome: ItemOutcome::Failed(ItemError::Aborted(err.to_string())),
        };
        report.log();
        report
    }

    async fn index_artifact(
        &self,
        artifact: &ArtifactKey,
        bundle_path: &str,
    ) -> Result<ItemOutcome, ItemError> {
        if self
            .search
            .hash_exists(&artifact.hash)
            .await
            .map_err(ItemError::Dedup)?
        {
            return Ok(ItemOutcome::Skipped);
        }

        let scratch = ScratchArchive::create(self.scratch_dir.as_deref())
            .map_err(|e| ItemError::Fetch(format!("cannot create scratch directory: {}", e)))?;
        let bundle = scratch.bundle_path();

        let bytes = self
            .store
            .download_to(bundle_path, &bundle)
            .await
            .map_err(|e| ItemError::Fetch(format!("{:#}", e)))?;
        tracing::debug!(bundle = bundle_path, bytes, "downloaded bundle");

        let root = artifact.bundle_root();
        let workdir = scratch.extract_dir();
        let extracted =
            tokio::task::spawn_blocking(move || extract_bundle(&bundle, &root, &workdir))
                .await
                .map_err(|e| ItemError::Aborted(e.to_string()))??;

        let doc = assemble(&artifact.hash, extracted, self.today)?;
        let doc_id = self
            .search
            .write_document(&self.index, &doc)
            .await
            .map_err(ItemError::Write)?;

        Ok(ItemOutcome::Written { doc_id })
    }
}

/// One backfill over a bucket prefix. Clients are injected so tests can
/// substitute fakes.
pub struct Backfill {
    worker: Arc<Worker>,
    options: RunOptions,
    progress: Box<dyn ProgressReporter>,
}

impl Backfill {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        search: Arc<dyn SearchBackend>,
        options: RunOptions,
    ) -> Result<Self> {
        let parser = KeyParser::new(&options.prefix, &options.suffix)?;
        let worker = Worker {
            store,
            search,
            parser,
            index: index_name(&options.index_prefix, options.today),
            today: options.today,
            scratch_dir: options.scratch_dir.clone(),
        };
        Ok(Self {
            worker: Arc::new(worker),
            options,
            progress: Box::new(NoProgress),
        })
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Index partition this run writes to.
    pub fn index(&self) -> &str {
        &self.worker.index
    }

    /// Run to completion and return aggregate counts.
    ///
    /// # Errors
    ///
    /// Only when listing the object store fails. Per-item failures are
    /// counted in the summary.
    pub async fn run(&self) -> Result<RunSummary> {
        if self.options.dry_run {
            let keys = self.list().await?;
            return Ok(self.plan(&keys));
        }
        let reports = self.run_reports().await?;
        Ok(RunSummary::from_reports(&reports))
    }

    /// Run to completion and return every item's report.
    pub async fn run_reports(&self) -> Result<Vec<ItemReport>> {
        self.ensure_index().await;
        let keys = self.list().await?;
        Ok(self.dispatch(keys).await)
    }

    /// Index creation failure is logged, not fatal; writes will fail later
    /// and be counted per item.
    async fn ensure_index(&self) {
        let index = self.index();
        match self.worker.search.ensure_index(index).await {
            Ok(IndexStatus::Created) => tracing::info!(index, "created index partition"),
            Ok(IndexStatus::AlreadyExists) => {
                tracing::debug!(index, "index partition already exists")
            }
            Err(e) => tracing::error!(
                index,
                error = %e,
                "failed to create index partition, continuing"
            ),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.progress.report(ProgressEvent::Listing {
            prefix: self.options.prefix.clone(),
        });
        let mut keys = self
            .worker
            .store
            .list_keys(&self.options.prefix, &self.options.suffix)
            .await
            .with_context(|| {
                format!(
                    "Failed to list descriptor keys under '{}'",
                    self.options.prefix
                )
            })?;
        if let Some(limit) = self.options.limit {
            keys.truncate(limit);
        }
        tracing::info!(
            keys = keys.len(),
            concurrency = self.options.concurrency,
            index = self.index(),
            "listed descriptor keys"
        );
        Ok(keys)
    }

    fn plan(&self, keys: &[String]) -> RunSummary {
        let mut summary = RunSummary {
            listed: keys.len(),
            ..RunSummary::default()
        };
        for key in keys {
            match self.worker.parser.parse(key) {
                Ok(_) => summary.planned += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "descriptor key would fail to parse");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn dispatch(&self, keys: Vec<String>) -> Vec<ItemReport> {
        let total = keys.len();
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks: JoinSet<ItemReport> = JoinSet::new();

        for key in keys {
            let worker = Arc::clone(&self.worker);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return ItemReport {
                        key,
                        bundle_path: None,
                        outcome: ItemOutcome::Failed(ItemError::Aborted(
                            "worker pool closed".to_string(),
                        )),
                    };
                };
                let inner = Arc::clone(&worker);
                let item_key = key.clone();
                match tokio::spawn(async move { inner.process(item_key).await }).await {
                    Ok(report) => report,
                    Err(e) => worker.aborted(key, e),
                }
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(error = %e, "worker pool task failed");
                    ItemReport {
                        key: String::new(),
                        bundle_path: None,
                        outcome: ItemOutcome::Failed(ItemError::Aborted(e.to_string())),
                    }
                }
            };
            reports.push(report);
            self.progress.report(ProgressEvent::Processing {
                n: reports.len() as u64,
                total: total as u64,
            });
        }
        reports
    }
}
