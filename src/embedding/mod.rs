//! Text embedding provider.
//!
//! The engine treats the embedder as a black box with a declared batch
//! size. The shipped implementation talks to an Ollama server; a weight-1
//! semaphore caps concurrent calls because local embedding models have
//! limited parallelism.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::EmbedderConfig;

/// Hard ceiling on a single embed call, semaphore wait included.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embed call timed out after {}s", EMBED_TIMEOUT.as_secs())]
    Timeout,
    #[error("embedder connection error: {0}")]
    Connection(String),
    #[error("embedder API error: {0}")]
    Api(String),
    #[error("embedder response parse error: {0}")]
    Parse(String),
}

/// Text-to-vector provider with a declared batch size.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Maximum number of strings per [`Embedder::embed`] call.
    fn batch_size(&self) -> usize;

    /// Embed `inputs`, returning one vector per input in the same order.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Ollama `/api/embed` client.
pub struct OllamaEmbedder {
    endpoint: String,
    model: String,
    batch_size: usize,
    client: Client,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    /// `concurrency` is the number of simultaneous provider calls allowed;
    /// deployments with a single local model keep it at 1.
    pub fn new(config: &EmbedderConfig, concurrency: usize) -> Result<Self, EmbedError> {
        let client = Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| EmbedError::Connection(e.to_string()))?;
        Ok(Self {
            endpoint: config.endpoint(),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            client,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Check whether the provider answers at all.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn call(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| EmbedError::Connection(e.to_string()))?;

        let url = format!("{}/api/embed", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: inputs,
            })
            .send()
            .await
            .map_err(|e| EmbedError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EmbedError::Api(format!("HTTP {}", resp.status())));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Parse(e.to_string()))?;

        if parsed.embeddings.len() != inputs.len() {
            return Err(EmbedError::Parse(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                parsed.embeddings.len()
            )));
        }
        debug!(count = inputs.len(), model = %self.model, "embedded batch");
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::timeout(EMBED_TIMEOUT, self.call(inputs))
            .await
            .map_err(|_| EmbedError::Timeout)?
    }
}
