//! Embed-index stage.
//!
//! Takes a slice of documents, embeds them in provider-sized chunks and
//! bulk-indexes whatever embedded successfully. A failed chunk only costs
//! its own documents; everything else still reaches the backend. Vectors
//! are assigned to documents strictly by position within each chunk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::embedding::Embedder;
use crate::models::Document;
use crate::search::DocumentSink;

/// Monotonic counters over the pipeline's lifetime.
#[derive(Debug, Default)]
struct PipelineCounters {
    embedded: AtomicUsize,
    embed_failed: AtomicUsize,
    indexed: AtomicUsize,
    index_failed: AtomicUsize,
}

/// Point-in-time view of [`EmbedIndexPipeline`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub embedded: usize,
    pub embed_failed: usize,
    pub indexed: usize,
    pub index_failed: usize,
}

pub struct EmbedIndexPipeline<D: Document> {
    embedder: Arc<dyn Embedder>,
    sink: Arc<dyn DocumentSink<D>>,
    counters: PipelineCounters,
}

impl<D: Document> EmbedIndexPipeline<D> {
    pub fn new(embedder: Arc<dyn Embedder>, sink: Arc<dyn DocumentSink<D>>) -> Self {
        Self {
            embedder,
            sink,
            counters: PipelineCounters::default(),
        }
    }

    pub fn stats(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            embedded: self.counters.embedded.load(Ordering::Acquire),
            embed_failed: self.counters.embed_failed.load(Ordering::Acquire),
            indexed: self.counters.indexed.load(Ordering::Acquire),
            index_failed: self.counters.index_failed.load(Ordering::Acquire),
        }
    }

    /// Embed and index one batch of documents. All failures are recovered
    /// here; callers just keep feeding batches.
    pub async fn process(&self, mut docs: Vec<D>) {
        if docs.is_empty() {
            return;
        }
        let strings: Vec<String> = docs.iter().map(|d| d.embedding_string()).collect();
        let chunk_size = self.embedder.batch_size().max(1);
        let mut embedded_ok = vec![false; docs.len()];

        let mut start = 0;
        while start < docs.len() {
            let end = (start + chunk_size).min(docs.len());
            match self.embedder.embed(&strings[start..end]).await {
                Ok(vectors) if vectors.len() == end - start => {
                    for (offset, vector) in vectors.into_iter().enumerate() {
                        docs[start + offset].set_embedding(vector);
                        embedded_ok[start + offset] = true;
                    }
                    self.counters
                        .embedded
                        .fetch_add(end - start, Ordering::AcqRel);
                }
                Ok(vectors) => {
                    warn!(
                        expected = end - start,
                        got = vectors.len(),
                        "embedder returned wrong vector count, skipping chunk"
                    );
                    self.counters
                        .embed_failed
                        .fetch_add(end - start, Ordering::AcqRel);
                }
                Err(e) => {
                    warn!(
                        chunk_start = start,
                        chunk_len = end - start,
                        "embed chunk failed: {e}"
                    );
                    self.counters
                        .embed_failed
                        .fetch_add(end - start, Ordering::AcqRel);
                }
            }
            start = end;
        }

        let to_index: Vec<D> = docs
            .into_iter()
            .zip(embedded_ok)
            .filter_map(|(doc, ok)| ok.then_some(doc))
            .collect();
        if to_index.is_empty() {
            return;
        }
        let submitted = to_index.len();
        match self.sink.bulk_index(to_index).await {
            Ok(stats) => {
                debug!(indexed = stats.indexed, failed = stats.failed, "batch indexed");
                self.counters.indexed.fetch_add(stats.indexed, Ordering::AcqRel);
                self.counters
                    .index_failed
                    .fetch_add(stats.failed, Ordering::AcqRel);
            }
            Err(e) => {
                error!("bulk index failed for {submitted} documents: {e}");
                self.counters
                    .index_failed
                    .fetch_add(submitted, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fakes shared by pipeline and consumer tests.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::embedding::{EmbedError, Embedder};
    use crate::models::{Document, JobListingDoc};
    use crate::search::{BulkStats, DocumentSink, SearchError};

    /// Deterministic embedder: vector `[len, first_byte]` per string.
    /// `fail_on_chunk` makes the n-th embed call (1-based) fail.
    pub struct FakeEmbedder {
        pub batch: usize,
        pub fail_on_call: Option<usize>,
        pub calls: Mutex<usize>,
    }

    impl FakeEmbedder {
        pub fn new(batch: usize) -> Self {
            Self {
                batch,
                fail_on_call: None,
                calls: Mutex::new(0),
            }
        }

        pub fn failing_on(batch: usize, call: usize) -> Self {
            Self {
                batch,
                fail_on_call: Some(call),
                calls: Mutex::new(0),
            }
        }

        pub fn vector_for(input: &str) -> Vec<f32> {
            vec![
                input.len() as f32,
                input.bytes().next().unwrap_or(0) as f32,
            ]
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        fn batch_size(&self) -> usize {
            self.batch
        }

        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.fail_on_call == Some(call) {
                return Err(EmbedError::Api("synthetic chunk failure".to_string()));
            }
            Ok(inputs.iter().map(|s| Self::vector_for(s)).collect())
        }
    }

    /// Sink that records everything it is asked to index.
    #[derive(Default)]
    pub struct RecordingSink {
        pub docs: Mutex<Vec<JobListingDoc>>,
    }

    #[async_trait]
    impl DocumentSink<JobListingDoc> for RecordingSink {
        async fn bulk_index(&self, docs: Vec<JobListingDoc>) -> Result<BulkStats, SearchError> {
            let indexed = docs.len();
            self.docs.lock().unwrap().extend(docs);
            Ok(BulkStats { indexed, failed: 0 })
        }
    }

    pub fn doc(id: &str, title: &str) -> JobListingDoc {
        JobListingDoc {
            id: id.to_string(),
            title: title.to_string(),
            salary: String::new(),
            company: String::new(),
            company_scale: String::new(),
            city: String::new(),
            district: String::new(),
            business_area: String::new(),
            labels: Vec::new(),
            skills: Vec::new(),
            experience: String::new(),
            degree: String::new(),
            perks: Vec::new(),
            embedding: None,
        }
    }

    /// The fake embedder's expected vector for a document.
    pub fn expected_vector(doc: &JobListingDoc) -> Vec<f32> {
        FakeEmbedder::vector_for(&doc.embedding_string())
    }
}
