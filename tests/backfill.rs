//! End-to-end backfill tests against in-memory object store and search
//! backend fakes.
//!
//! These drive the real orchestration, extraction and assembly code; only the
//! two network clients are substituted.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use build_log_indexer::backfill::{Backfill, ItemOutcome, RunOptions, RunSummary};
use build_log_indexer::error::ItemError;
use build_log_indexer::models::BuildDocument;
use build_log_indexer::object_store::ObjectStore;
use build_log_indexer::search::{IndexStatus, SearchBackend, SearchError};
use chrono::NaiveDate;
use flate2::{write::GzEncoder, Compression};
use serde_json::{json, Value};
use tempfile::TempDir;

const PREFIX: &str = "develop/build_cache";
const SUFFIX: &str = ".spec.json.sig";

// ─── Fake object store ──────────────────────────────────────────────

#[derive(Default)]
struct MemoryStore {
    /// Every object in the bucket; listing filters by prefix and suffix.
    objects: HashMap<String, Vec<u8>>,
    downloads: Mutex<Vec<String>>,
    fail_listing: bool,
}

impl MemoryStore {
    fn insert(&mut self, key: &str, body: Vec<u8>) {
        self.objects.insert(key.to_string(), body);
    }

    /// Add a descriptor plus its bundle for `<platform>-<compiler>-<package>-<hash>`.
    fn add_build(&mut self, platform: &str, compiler: &str, package: &str, hash: &str, bundle: Vec<u8>) {
        let stem = format!("{}-{}-{}-{}", platform, compiler, package, hash);
        self.insert(&format!("{}/{}{}", PREFIX, stem, SUFFIX), b"signed".to_vec());
        self.insert(
            &format!("{}/{}/{}/{}/{}.spack", PREFIX, platform, compiler, package, stem),
            bundle,
        );
    }

    fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_keys(&self, prefix: &str, suffix: &str) -> Result<Vec<String>> {
        if self.fail_listing {
            return Err(anyhow!("S3 ListObjectsV2 failed (HTTP 503)"));
        }
        let mut keys: Vec<String> = self
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix) && k.ends_with(suffix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn download_to(&self, key: &str, dest: &Path) -> Result<u64> {
        self.downloads.lock().unwrap().push(key.to_string());
        let body = self
            .objects
            .get(key)
            .ok_or_else(|| anyhow!("S3 GetObject failed (HTTP 404) for key '{}'", key))?;
        std::fs::write(dest, body)?;
        Ok(body.len() as u64)
    }
}

// ─── Fake search backend ────────────────────────────────────────────

#[derive(Default)]
struct MemorySearch {
    /// index name → documents
    indices: Mutex<HashMap<String, Vec<Value>>>,
    ensure_calls: AtomicUsize,
    fail_index_creation: bool,
    /// Hashes whose writes are rejected.
    reject_hashes: Vec<String>,
}

impl MemorySearch {
    fn seed(&self, index: &str, hash: &str) {
        self.indices
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .push(json!({"hash": hash}));
    }

    fn doc_count(&self) -> usize {
        self.indices.lock().unwrap().values().map(Vec::len).sum()
    }

    fn docs_in(&self, index: &str) -> Vec<Value> {
        self.indices
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for MemorySearch {
    async fn ensure_index(&self, index: &str) -> Result<IndexStatus, SearchError> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_index_creation {
            return Err(SearchError::Rejected {
                status: 403,
                body: "forbidden".to_string(),
            });
        }
        let mut indices = self.indices.lock().unwrap();
        if indices.contains_key(index) {
            return Ok(IndexStatus::AlreadyExists);
        }
        indices.insert(index.to_string(), Vec::new());
        Ok(IndexStatus::Created)
    }

    async fn hash_exists(&self, hash: &str) -> Result<bool, SearchError> {
        let indices = self.indices.lock().unwrap();
        Ok(indices
            .iter()
            .filter(|(name, _)| name.starts_with("pipeline-logs"))
            .flat_map(|(_, docs)| docs.iter())
            .any(|doc| doc["hash"] == hash))
    }

    async fn write_document(
        &self,
        index: &str,
        doc: &BuildDocument,
    ) -> Result<String, SearchError> {
        if self.reject_hashes.contains(&doc.hash) {
            return Err(SearchError::Rejected {
                status: 400,
                body: "mapper_parsing_exception".to_string(),
            });
        }
        let value = serde_json::to_value(doc)
            .map_err(|e| SearchError::Unexpected(e.to_string()))?;
        let mut indices = self.indices.lock().unwrap();
        let docs = indices.entry(index.to_string()).or_default();
        docs.push(value);
        Ok(format!("doc-{}", docs.len()))
    }
}

/// Wraps [`MemorySearch`], recording how many dedup lookups overlap and
/// panicking on one chosen hash.
struct GatedSearch {
    inner: MemorySearch,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    panic_on: String,
}

impl GatedSearch {
    fn new(panic_on: &str) -> Self {
        Self {
            inner: MemorySearch::default(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            panic_on: panic_on.to_string(),
        }
    }
}

#[async_trait]
impl SearchBackend for GatedSearch {
    async fn ensure_index(&self, index: &str) -> Result<IndexStatus, SearchError> {
        self.inner.ensure_index(index).await
    }

    async fn hash_exists(&self, hash: &str) -> Result<bool, SearchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if hash == self.panic_on {
            panic!("search client bug on {}", hash);
        }
        self.inner.hash_exists(hash).await
    }

    async fn write_document(
        &self,
        index: &str,
        doc: &BuildDocument,
    ) -> Result<String, SearchError> {
        self.inner.write_document(index, doc).await
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn bundle(root: &str, extra: &[(&str, &str)]) -> Vec<u8> {
    let spec = json!({"spec": {"_meta": {"version": 4}, "nodes": [{"name": root, "external": false}]}});
    let times = json!({"phases": [{"name": "install", "seconds": 2.5}], "total": {"seconds": 2.5}});
    let mut files = vec![
        (format!("{}/.spack/spec.json", root), spec.to_string()),
        (format!("{}/.spack/install_times.json", root), times.to_string()),
        (
            format!("{}/.spack/spack-build-01-install-out.txt", root),
            "==> Installing".to_string(),
        ),
        (format!("{}/lib/libfoo.so", root), "ELF".to_string()),
    ];
    for (path, body) in extra {
        files.push((format!("{}/{}", root, path), body.to_string()));
    }

    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, Path::new(path), body.as_bytes())
            .unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
}

fn options(scratch: &TempDir) -> RunOptions {
    RunOptions {
        prefix: PREFIX.to_string(),
        suffix: SUFFIX.to_string(),
        index_prefix: "pipeline-logs".to_string(),
        concurrency: 4,
        limit: None,
        dry_run: false,
        today: today(),
        scratch_dir: Some(scratch.path().to_path_buf()),
    }
}

fn standard_store() -> MemoryStore {
    let mut store = MemoryStore::default();
    store.add_build("linux-x86_64", "gcc-9.3.0", "zlib", "abc1234", bundle("zlib-abc1234", &[]));
    store.add_build("linux-x86_64", "gcc-9.3.0", "bzip2", "def5678", bundle("bzip2-def5678", &[]));
    store.add_build(
        "linux-x86_64",
        "gcc-11.4.0",
        "py-numpy",
        "0a1b2c3",
        bundle(
            "py-numpy-0a1b2c3",
            &[(".spack/spack-build-02-build-out.txt", "building numpy")],
        ),
    );
    store
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn writes_one_document_per_build() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(standard_store());
    let search = Arc::new(MemorySearch::default());

    let backfill = Backfill::new(store.clone(), search.clone(), options(&scratch)).unwrap();
    assert_eq!(backfill.index(), "pipeline-logs-2024.03.05");
    let summary = backfill.run().await.unwrap();

    assert_eq!(
        summary,
        RunSummary {
            listed: 3,
            planned: 0,
            written: 3,
            skipped: 0,
            failed: 0,
        }
    );
    assert_eq!(search.ensure_calls.load(Ordering::SeqCst), 1);

    let docs = search.docs_in("pipeline-logs-2024.03.05");
    assert_eq!(docs.len(), 3);
    let numpy = docs.iter().find(|d| d["hash"] == "0a1b2c3").unwrap();
    assert_eq!(numpy["spec"]["nodes"][0]["external"], "false");
    assert_eq!(numpy["install_times"]["total"]["seconds"], 2.5);
    assert_eq!(numpy["build_phase_logs"]["01-install"], "==> Installing");
    assert_eq!(numpy["build_phase_logs"]["02-build"], "building numpy");
    assert_eq!(numpy["ingestion_date"], "2024-03-05");

    // every task cleaned up its scratch space
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn already_indexed_hash_is_never_downloaded() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(standard_store());
    let search = Arc::new(MemorySearch::default());
    search.seed("pipeline-logs-2023.11.30", "abc1234");

    let summary = Backfill::new(store.clone(), search.clone(), options(&scratch))
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.written, 2);
    assert_eq!(summary.skipped, 1);
    let downloads = store.downloads.lock().unwrap().clone();
    assert_eq!(downloads.len(), 2);
    assert!(downloads.iter().all(|k| !k.contains("abc1234")));
}

#[tokio::test]
async fn second_run_writes_nothing() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(standard_store());
    let search = Arc::new(MemorySearch::default());

    let first = Backfill::new(store.clone(), search.clone(), options(&scratch))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(first.written, 3);
    let after_first = search.doc_count();
    let downloads_after_first = store.download_count();

    let second = Backfill::new(store.clone(), search.clone(), options(&scratch))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(search.doc_count(), after_first);
    assert_eq!(store.download_count(), downloads_after_first);
}

#[tokio::test]
async fn malformed_key_does_not_block_siblings() {
    let scratch = TempDir::new().unwrap();
    let mut store = standard_store();
    // no compiler version: does not parse
    store.insert(
        &format!("{}/linux-x86_64-gcc-zlib-fff0000{}", PREFIX, SUFFIX),
        b"signed".to_vec(),
    );
    let store = Arc::new(store);
    let search = Arc::new(MemorySearch::default());

    let backfill = Backfill::new(store.clone(), search.clone(), options(&scratch)).unwrap();
    let reports = backfill.run_reports().await.unwrap();
    let summary = RunSummary::from_reports(&reports);

    assert_eq!(summary.listed, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.written, 3);
    assert_eq!(summary.succeeded(), summary.listed - summary.failed);

    let failed = reports
        .iter()
        .find(|r| matches!(r.outcome, ItemOutcome::Failed(_)))
        .unwrap();
    assert!(failed.key.contains("fff0000"));
    assert!(failed.bundle_path.is_none());
    assert!(matches!(
        failed.outcome,
        ItemOutcome::Failed(ItemError::Parse(_))
    ));
}

#[tokio::test]
async fn per_item_failures_are_isolated() {
    let scratch = TempDir::new().unwrap();
    let mut store = standard_store();
    // descriptor without a bundle
    store.insert(
        &format!("{}/linux-x86_64-gcc-9.3.0-xz-1111111{}", PREFIX, SUFFIX),
        b"signed".to_vec(),
    );
    // bundle that is not gzip
    store.add_build("linux-x86_64", "gcc-9.3.0", "curl", "2222222", b"garbage".to_vec());
    // bundle without install_times.json
    let mut incomplete = tar::Builder::new(Vec::new());
    let body = br#"{"spec": {}}"#;
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    incomplete
        .append_data(&mut header, "openssl-3333333/.spack/spec.json", &body[..])
        .unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&incomplete.into_inner().unwrap()).unwrap();
    store.add_build("linux-x86_64", "gcc-9.3.0", "openssl", "3333333", gz.finish().unwrap());

    let store = Arc::new(store);
    let search = Arc::new(MemorySearch {
        reject_hashes: vec!["def5678".to_string()],
        ..MemorySearch::default()
    });

    let reports = Backfill::new(store, search.clone(), options(&scratch))
        .unwrap()
        .run_reports()
        .await
        .unwrap();
    let summary = RunSummary::from_reports(&reports);

    assert_eq!(summary.listed, 6);
    assert_eq!(summary.written, 2);
    assert_eq!(summary.failed, 4);

    let stage_of = |needle: &str| {
        reports
            .iter()
            .find(|r| r.key.contains(needle))
            .map(|r| match &r.outcome {
                ItemOutcome::Failed(e) => e.stage(),
                _ => "ok",
            })
            .unwrap()
    };
    assert_eq!(stage_of("1111111"), "fetch");
    assert_eq!(stage_of("2222222"), "extract");
    assert_eq!(stage_of("3333333"), "extract");
    assert_eq!(stage_of("def5678"), "write");
    assert_eq!(stage_of("abc1234"), "ok");

    // failed fetches carry the resolved bundle path
    let missing = reports.iter().find(|r| r.key.contains("1111111")).unwrap();
    assert_eq!(
        missing.bundle_path.as_deref(),
        Some("develop/build_cache/linux-x86_64/gcc-9.3.0/xz/linux-x86_64-gcc-9.3.0-xz-1111111.spack")
    );

    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn index_creation_failure_is_not_fatal() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(standard_store());
    let search = Arc::new(MemorySearch {
        fail_index_creation: true,
        ..MemorySearch::default()
    });

    let summary = Backfill::new(store, search.clone(), options(&scratch))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(summary.listed, 3);
    assert_eq!(search.ensure_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn listing_failure_aborts_the_run() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore {
        fail_listing: true,
        ..MemoryStore::default()
    });
    let search = Arc::new(MemorySearch::default());

    let err = Backfill::new(store, search.clone(), options(&scratch))
        .unwrap()
        .run()
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to list descriptor keys"));
    assert_eq!(search.doc_count(), 0);
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let scratch = TempDir::new().unwrap();
    let mut store = standard_store();
    store.insert(
        &format!("{}/not-a-descriptor{}", PREFIX, SUFFIX),
        b"signed".to_vec(),
    );
    let store = Arc::new(store);
    let search = Arc::new(MemorySearch::default());

    let mut opts = options(&scratch);
    opts.dry_run = true;
    let summary = Backfill::new(store.clone(), search.clone(), opts)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.listed, 4);
    assert_eq!(summary.planned, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(store.download_count(), 0);
    assert_eq!(search.ensure_calls.load(Ordering::SeqCst), 0);
    assert_eq!(search.doc_count(), 0);
}

#[tokio::test]
async fn limit_truncates_listing() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(standard_store());
    let search = Arc::new(MemorySearch::default());

    let mut opts = options(&scratch);
    opts.limit = Some(2);
    opts.concurrency = 1;
    let summary = Backfill::new(store.clone(), search, opts)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(summary.listed, 2);
    assert_eq!(summary.written, 2);
    assert_eq!(store.download_count(), 2);
}

#[tokio::test]
async fn pool_is_bounded_and_panics_keep_their_key() {
    let scratch = TempDir::new().unwrap();
    let mut store = MemoryStore::default();
    for i in 0..10 {
        let package = format!("pkg{}", i);
        let hash = format!("a00000{}", i);
        let root = format!("{}-{}", package, hash);
        store.add_build("linux-x86_64", "gcc-9.3.0", &package, &hash, bundle(&root, &[]));
    }
    let store = Arc::new(store);
    let search = Arc::new(GatedSearch::new("a000003"));

    let mut opts = options(&scratch);
    opts.concurrency = 2;
    let reports = Backfill::new(store, search.clone(), opts)
        .unwrap()
        .run_reports()
        .await
        .unwrap();
    let summary = RunSummary::from_reports(&reports);

    let peak = search.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{} dedup lookups overlapped with concurrency 2", peak);
    assert!(peak >= 2, "pool never ran two items at once");

    assert_eq!(summary.listed, 10);
    assert_eq!(summary.written, 9);
    assert_eq!(summary.failed, 1);

    let failed = reports
        .iter()
        .find(|r| matches!(r.outcome, ItemOutcome::Failed(_)))
        .unwrap();
    assert_eq!(
        failed.key,
        "develop/build_cache/linux-x86_64-gcc-9.3.0-pkg3-a000003.spec.json.sig"
    );
    assert_eq!(
        failed.bundle_path.as_deref(),
        Some("develop/build_cache/linux-x86_64/gcc-9.3.0/pkg3/linux-x86_64-gcc-9.3.0-pkg3-a000003.spack")
    );
    match &failed.outcome {
        ItemOutcome::Failed(e) => assert_eq!(e.stage(), "aborted"),
        other => panic!("unexpected outcome {:?}", other),
    }

    assert!(is_empty_dir(scratch.path()));
}
