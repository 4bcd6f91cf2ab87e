//! Typed Elasticsearch client.
//!
//! One client per document type `D`; the index name and mapping come from
//! the [`Document`] trait. Bulk indexing batches NDJSON bodies by size and
//! ships them with a small fixed worker count, surfacing per-item outcomes
//! through the response items.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::EsConfig;
use crate::models::Document;

/// Hard ceiling on a bulk call, semaphore wait included.
const BULK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("bulk call timed out after {}s", BULK_TIMEOUT.as_secs())]
    Timeout,
    #[error("search backend connection error: {0}")]
    Connection(String),
    #[error("search backend returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("search backend response parse error: {0}")]
    Parse(String),
}

/// Tuning for the bulk indexer.
#[derive(Debug, Clone)]
pub struct BulkIndexerConfig {
    /// Concurrent flush requests.
    pub num_workers: usize,
    /// NDJSON body size that triggers a flush.
    pub flush_bytes: usize,
}

impl Default for BulkIndexerConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            flush_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Outcome counters for one bulk call.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulkStats {
    pub indexed: usize,
    pub failed: usize,
}

/// Destination for embedded documents. The pipeline depends on this seam;
/// [`TypedEsClient`] is the production implementation.
#[async_trait]
pub trait DocumentSink<D: Document>: Send + Sync {
    async fn bulk_index(&self, docs: Vec<D>) -> Result<BulkStats, SearchError>;
}

pub struct TypedEsClient<D: Document> {
    client: Client,
    address: String,
    username: String,
    password: String,
    bulk: BulkIndexerConfig,
    permits: Arc<Semaphore>,
    _doc: PhantomData<fn() -> D>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "D: DeserializeOwned"))]
struct GetResponse<D> {
    found: bool,
    #[serde(rename = "_source")]
    source: Option<D>,
}

#[derive(Deserialize)]
struct CountResponse {
    count: i64,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "D: DeserializeOwned"))]
struct SearchResponse<D> {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: SearchHits<D>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "D: DeserializeOwned"))]
struct SearchHits<D> {
    #[serde(default)]
    total: Option<HitsTotal>,
    hits: Vec<SearchHit<D>>,
}

#[derive(Deserialize)]
struct HitsTotal {
    value: i64,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "D: DeserializeOwned"))]
struct SearchHit<D> {
    #[serde(rename = "_source")]
    source: D,
}

impl<D: Document> TypedEsClient<D> {
    /// `concurrency` caps simultaneous bulk calls against the backend.
    pub fn new(config: &EsConfig, concurrency: usize) -> Result<Self, SearchError> {
        // Development clusters run self-signed TLS; deployments that need
        // verification front the backend with a trusted proxy.
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            bulk: BulkIndexerConfig::default(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            _doc: PhantomData,
        })
    }

    pub fn with_bulk_config(mut self, bulk: BulkIndexerConfig) -> Self {
        self.bulk = bulk;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.address, path));
        if self.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response, SearchError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SearchError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Check whether the backend answers at all.
    pub async fn ping(&self) -> bool {
        match self.request(Method::GET, "/").send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn exists_index(&self) -> Result<bool, SearchError> {
        let resp = self
            .request(Method::HEAD, &format!("/{}", D::index_name()))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Ok(resp.status() != StatusCode::NOT_FOUND)
    }

    /// Create the index with the document type's mapping. An existing
    /// index is left untouched.
    pub async fn create_index_with_mapping(&self) -> Result<(), SearchError> {
        let index = D::index_name();
        if self.exists_index().await? {
            info!(index, "index already exists, skipping create");
            return Ok(());
        }
        let body = match D::type_mapping() {
            Some(mapping) => serde_json::json!({ "mappings": mapping }),
            None => serde_json::json!({}),
        };
        let resp = self
            .request(Method::PUT, &format!("/{index}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp).await?;
        info!(index, "created index with mapping");
        Ok(())
    }

    pub async fn delete_index(&self) -> Result<(), SearchError> {
        let resp = self
            .request(Method::DELETE, &format!("/{}", D::index_name()))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    pub async fn index_doc(&self, doc: &D) -> Result<(), SearchError> {
        let resp = self
            .request(
                Method::PUT,
                &format!("/{}/_doc/{}", D::index_name(), doc.id()),
            )
            .json(doc)
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    pub async fn get_doc(&self, id: &str) -> Result<Option<D>, SearchError> {
        let resp = self
            .request(Method::GET, &format!("/{}/_doc/{id}", D::index_name()))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let parsed: GetResponse<D> = Self::expect_ok(resp)
            .await?
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        if !parsed.found {
            return Ok(None);
        }
        Ok(parsed.source)
    }

    pub async fn count_docs(&self) -> Result<i64, SearchError> {
        let resp = self
            .request(Method::GET, &format!("/{}/_count", D::index_name()))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        let parsed: CountResponse = Self::expect_ok(resp)
            .await?
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;
        Ok(parsed.count)
    }

    /// Query-DSL search returning hits and the total count.
    pub async fn search_docs(
        &self,
        query: serde_json::Value,
        from: usize,
        size: usize,
    ) -> Result<(Vec<D>, i64), SearchError> {
        let body = serde_json::json!({ "query": query, "from": from, "size": size });
        let parsed = self.run_search(&body, None).await?;
        let total = parsed.hits.total.map(|t| t.value).unwrap_or(0);
        Ok((parsed.hits.hits.into_iter().map(|h| h.source).collect(), total))
    }

    /// Approximate KNN search over the `embedding` dense-vector field (or
    /// any other dense-vector `field`).
    pub async fn knn_search(
        &self,
        field: &str,
        query_vector: &[f32],
        k: usize,
        num_candidates: usize,
    ) -> Result<Vec<D>, SearchError> {
        let body = serde_json::json!({
            "knn": {
                "field": field,
                "query_vector": query_vector,
                "k": k,
                "num_candidates": num_candidates
            }
        });
        let parsed = self.run_search(&body, None).await?;
        Ok(parsed.hits.hits.into_iter().map(|h| h.source).collect())
    }

    async fn run_search(
        &self,
        body: &serde_json::Value,
        scroll: Option<&str>,
    ) -> Result<SearchResponse<D>, SearchError> {
        let path = match scroll {
            Some(keep_alive) => format!("/{}/_search?scroll={keep_alive}", D::index_name()),
            None => format!("/{}/_search", D::index_name()),
        };
        let resp = self
            .request(Method::POST, &path)
            .json(body)
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp)
            .await?
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))
    }

    /// Partial update of an existing document.
    pub async fn update_doc(&self, doc: &D) -> Result<(), SearchError> {
        let resp = self
            .request(
                Method::POST,
                &format!("/{}/_update/{}", D::index_name(), doc.id()),
            )
            .json(&serde_json::json!({ "doc": doc }))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    pub async fn delete_doc(&self, id: &str) -> Result<(), SearchError> {
        let resp = self
            .request(Method::DELETE, &format!("/{}/_doc/{id}", D::index_name()))
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;
        Self::expect_ok(resp).await?;
        Ok(())
    }

    pub async fn bulk_delete_docs(&self, ids: &[String]) -> Result<BulkStats, SearchError> {
        let mut actions = Vec::with_capacity(ids.len());
        for id in ids {
            actions.push(format!(
                "{}\n",
                serde_json::json!({ "delete": { "_id": id } })
            ));
        }
        self.flush_chunks(self.chunk_actions(actions)).await
    }

    /// Walk the whole index via the scroll API, invoking `visit` per
    /// document. Returns the number of documents visited.
    pub async fn scroll_docs<F>(&self, page_size: usize, mut visit: F) -> Result<u64, SearchError>
    where
        F: FnMut(D) + Send,
    {
        let body = serde_json::json!({
            "query": { "match_all": {} },
            "size": page_size
        });
        let mut parsed = self.run_search(&body, Some("1m")).await?;
        let mut total = 0u64;
        loop {
            if parsed.hits.hits.is_empty() {
                break;
            }
            for hit in parsed.hits.hits {
                visit(hit.source);
                total += 1;
            }
            let Some(scroll_id) = parsed.scroll_id.take() else {
                break;
            };
            let resp = self
                .request(Method::POST, "/_search/scroll")
                .json(&serde_json::json!({ "scroll": "1m", "scroll_id": scroll_id }))
                .send()
                .await
                .map_err(|e| SearchError::Connection(e.to_string()))?;
            parsed = Self::expect_ok(resp)
                .await?
                .json()
                .await
                .map_err(|e| SearchError::Parse(e.to_string()))?;
        }
        if let Some(scroll_id) = parsed.scroll_id {
            let _ = self
                .request(Method::DELETE, "/_search/scroll")
                .json(&serde_json::json!({ "scroll_id": scroll_id }))
                .send()
                .await;
        }
        Ok(total)
    }

    /// Split NDJSON action lines into bodies of at most `flush_bytes`.
    fn chunk_actions(&self, lines: Vec<String>) -> Vec<String> {
        let mut bodies = Vec::new();
        let mut current = String::new();
        for line in lines {
            if !current.is_empty() && current.len() + line.len() > self.bulk.flush_bytes {
                bodies.push(std::mem::take(&mut current));
            }
            current.push_str(&line);
        }
        if !current.is_empty() {
            bodies.push(current);
        }
        bodies
    }

    /// Ship chunked NDJSON bodies with `num_workers` concurrent requests,
    /// logging each failed item from the response.
    async fn flush_chunks(&self, bodies: Vec<String>) -> Result<BulkStats, SearchError> {
        let index = D::index_name();
        let results = stream::iter(bodies)
            .map(|body| async move {
                let resp = self
                    .request(Method::POST, &format!("/{index}/_bulk"))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| SearchError::Connection(e.to_string()))?;
                let value: serde_json::Value = Self::expect_ok(resp)
                    .await?
                    .json()
                    .await
                    .map_err(|e| SearchError::Parse(e.to_string()))?;
                Ok::<_, SearchError>(value)
            })
            .buffer_unordered(self.bulk.num_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut stats = BulkStats::default();
        for result in results {
            let value = result?;
            let Some(items) = value.get("items").and_then(|i| i.as_array()) else {
                continue;
            };
            for item in items {
                // Each item is keyed by its action ("index" or "delete").
                let Some(outcome) = item.as_object().and_then(|o| o.values().next()) else {
                    continue;
                };
                let status = outcome.get("status").and_then(|s| s.as_i64()).unwrap_or(0);
                let id = outcome.get("_id").and_then(|s| s.as_str()).unwrap_or("?");
                if (200..300).contains(&status) {
                    stats.indexed += 1;
                } else {
                    stats.failed += 1;
                    let reason = outcome
                        .get("error")
                        .and_then(|e| e.get("reason"))
                        .and_then(|r| r.as_str())
                        .unwrap_or("unknown");
                    warn!(index, id, status, reason, "bulk item failed");
                }
            }
        }
        debug!(
            index,
            indexed = stats.indexed,
            failed = stats.failed,
            "bulk flush complete"
        );
        Ok(stats)
    }

    async fn bulk_index_inner(&self, docs: &[D]) -> Result<BulkStats, SearchError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;

        // An action/source pair must stay in one body, so chunking works
        // on pre-joined pairs.
        let mut actions = Vec::with_capacity(docs.len());
        for doc in docs {
            let header = serde_json::json!({ "index": { "_id": doc.id() } });
            let source =
                serde_json::to_string(doc).map_err(|e| SearchError::Parse(e.to_string()))?;
            actions.push(format!("{header}\n{source}\n"));
        }
        self.flush_chunks(self.chunk_actions(actions)).await
    }
}

#[async_trait]
impl<D: Document> DocumentSink<D> for TypedEsClient<D> {
    /// Bulk-index `docs` by id under the index semaphore. Per-item failures
    /// are logged, never retried; the backend's own retry policy is the
    /// place to harden delivery.
    async fn bulk_index(&self, docs: Vec<D>) -> Result<BulkStats, SearchError> {
        if docs.is_empty() {
            return Ok(BulkStats::default());
        }
        tokio::time::timeout(BULK_TIMEOUT, self.bulk_index_inner(&docs))
            .await
            .map_err(|_| SearchError::Timeout)?
    }
}
