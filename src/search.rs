//! Search backend: index partitions, dedup queries, and document writes.
//!
//! Documents go into one index per calendar day, named
//! `<prefix>-YYYY.MM.DD` (`pipeline-logs-2024.03.05`). Dedup lookups scan all
//! partitions through the `<prefix>*` wildcard.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | [`SearchBackend::ensure_index`] | `HEAD /<index>`, then `PUT /<index>` |
//! | [`SearchBackend::hash_exists`] | `GET /<prefix>*/_search` (match on `hash`) |
//! | [`SearchBackend::write_document`] | `POST /<index>/_doc` |

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use crate::config::SearchConfig;
use crate::models::BuildDocument;

/// Name of the index partition for `date`.
pub fn index_name(prefix: &str, date: NaiveDate) -> String {
    format!("{}-{}", prefix, date.format("%Y.%m.%d"))
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Non-2xx response. `body` is pretty-printed JSON when the server sent
    /// JSON, raw text otherwise.
    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// Outcome of [`SearchBackend::ensure_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Created,
    AlreadyExists,
}

/// Operations the backfill needs from the search backend.
///
/// Implemented by [`OpenSearchClient`]; tests substitute in-memory fakes.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Create `index` unless it already exists. Losing a creation race to
    /// another process is not an error.
    async fn ensure_index(&self, index: &str) -> Result<IndexStatus, SearchError>;

    /// Whether any partition already holds a document for `hash`.
    async fn hash_exists(&self, hash: &str) -> Result<bool, SearchError>;

    /// Write `doc` to `index`, returning the generated document id.
    async fn write_document(&self, index: &str, doc: &BuildDocument)
        -> Result<String, SearchError>;
}

/// [`SearchBackend`] over the OpenSearch REST API.
pub struct OpenSearchClient {
    http: reqwest::Client,
    endpoint: String,
    index_prefix: String,
    username: Option<String>,
    password: Option<String>,
    mapping: Option<Value>,
}

impl OpenSearchClient {
    pub fn new(endpoint: &str, index_prefix: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build search HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index_prefix: index_prefix.to_string(),
            username: None,
            password: None,
            mapping: None,
        })
    }

    /// Build a client from `[search]` config, loading the index mapping file
    /// if one is configured.
    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        let mut client = Self::new(
            &config.endpoint,
            &config.index_prefix,
            Duration::from_secs(config.timeout_secs),
        )?;
        if let Some(username) = &config.username {
            client = client.with_basic_auth(username, config.password.as_deref());
        }
        if let Some(mapping) = config.load_mapping()? {
            client = client.with_mapping(mapping);
        }
        Ok(client)
    }

    pub fn with_basic_auth(mut self, username: &str, password: Option<&str>) -> Self {
        self.username = Some(username.to_string());
        self.password = password.map(str::to_string);
        self
    }

    /// Body sent when creating a new index (mappings and settings).
    pub fn with_mapping(mut self, mapping: Value) -> Self {
        self.mapping = Some(mapping);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        let builder = self.http.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_deref()),
            None => builder,
        }
    }
}

#[async_trait]
impl SearchBackend for OpenSearchClient {
    async fn ensure_index(&self, index: &str) -> Result<IndexStatus, SearchError> {
        let head = self.request(Method::HEAD, index).send().await?;
        match head.status() {
            s if s.is_success() => return Ok(IndexStatus::AlreadyExists),
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(SearchError::Rejected {
                    status: status.as_u16(),
                    body: String::new(),
                })
            }
        }

        let mut put = self.request(Method::PUT, index);
        if let Some(mapping) = &self.mapping {
            put = put.json(mapping);
        }
        let resp = put.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(IndexStatus::Created);
        }

        let body = resp.text().await.unwrap_or_default();
        if body.contains("resource_already_exists_exception") {
            return Ok(IndexStatus::AlreadyExists);
        }
        Err(SearchError::Rejected {
            status: status.as_u16(),
            body: describe_body(&body),
        })
    }

    async fn hash_exists(&self, hash: &str) -> Result<bool, SearchError> {
        let path = format!("{}*/_search", self.index_prefix);
        let resp = self
            .request(Method::GET, &path)
            .json(&json!({"query": {"match": {"hash": hash}}}))
            .send()
            .await?;
        let body = check_status(resp).await?;

        let hits = total_hits(&body).ok_or_else(|| {
            SearchError::Unexpected(format!("search response has no hits.total: {}", body))
        })?;
        Ok(hits > 0)
    }

    async fn write_document(
        &self,
        index: &str,
        doc: &BuildDocument,
    ) -> Result<String, SearchError> {
        let resp = self
            .request(Method::POST, &format!("{}/_doc", index))
            .json(doc)
            .send()
            .await?;
        let body = check_status(resp).await?;

        body.get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SearchError::Unexpected(format!("write response has no _id: {}", body)))
    }
}

/// Turn a non-2xx response into [`SearchError::Rejected`]; parse 2xx bodies as JSON.
async fn check_status(resp: reqwest::Response) -> Result<Value, SearchError> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(SearchError::Rejected {
            status: status.as_u16(),
            body: describe_body(&text),
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| SearchError::Unexpected(format!("response is not JSON ({}): {}", e, text)))
}

/// Pretty JSON when the body decodes as JSON, raw text otherwise.
fn describe_body(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}

/// `hits.total.value`, or a bare integer `hits.total` from older servers.
fn total_hits(body: &Value) -> Option<u64> {
    let total = body.get("hits")?.get("total")?;
    total
        .get("value")
        .and_then(Value::as_u64)
        .or_else(|| total.as_u64())
}
