//! End-to-end flow over the listener channel: a synthetic browser feeds
//! matched responses through a bounded channel into the indexed consumer,
//! which decodes, embeds (fake provider) and indexes (recording sink).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use netharvest::embedding::{EmbedError, Embedder};
use netharvest::models::{decode_listing_payload, Document, JobListing, JobListingDoc};
use netharvest::search::{BulkStats, DocumentSink, SearchError};
use netharvest::{spawn_indexed_consumer, spawn_observer_consumer, EmbedIndexPipeline};
use netharvest::NetworkResponse;

struct TestEmbedder {
    batch: usize,
}

#[async_trait]
impl Embedder for TestEmbedder {
    fn batch_size(&self) -> usize {
        self.batch
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(inputs.iter().map(|s| vec![s.len() as f32]).collect())
    }
}

#[derive(Default)]
struct TestSink {
    docs: Mutex<Vec<JobListingDoc>>,
}

#[async_trait]
impl DocumentSink<JobListingDoc> for TestSink {
    async fn bulk_index(&self, docs: Vec<JobListingDoc>) -> Result<BulkStats, SearchError> {
        let indexed = docs.len();
        self.docs.lock().unwrap().extend(docs);
        Ok(BulkStats { indexed, failed: 0 })
    }
}

fn listing_response(url: &str, job_id: &str) -> NetworkResponse {
    let body = serde_json::json!({
        "code": 0,
        "message": "ok",
        "data": {
            "hasMore": true,
            "list": [{ "jobId": job_id, "jobName": "Platform Engineer", "cityName": "Shanghai" }]
        }
    })
    .to_string()
    .into_bytes();
    NetworkResponse {
        url: url.to_string(),
        url_pattern: "https://h/api/list*".to_string(),
        body,
    }
}

fn listing_decoder() -> netharvest::pipeline::Decoder<JobListing> {
    Arc::new(|body| decode_listing_payload(body))
}

fn build_pipeline(batch: usize) -> (Arc<TestSink>, Arc<EmbedIndexPipeline<JobListingDoc>>) {
    let sink = Arc::new(TestSink::default());
    let pipeline = Arc::new(EmbedIndexPipeline::new(
        Arc::new(TestEmbedder { batch }),
        Arc::clone(&sink) as Arc<dyn DocumentSink<JobListingDoc>>,
    ));
    (sink, pipeline)
}

/// Scroll scenario: three matched responses carrying the same document id.
/// The consumer delivers all three; dedup by id is the backend's concern,
/// so the sink sees three index requests for "k".
#[tokio::test]
async fn repeated_scroll_responses_all_reach_the_sink() {
    let (sink, pipeline) = build_pipeline(8);
    let (tx, rx) = mpsc::channel(16);
    let consumer = spawn_indexed_consumer(
        rx,
        listing_decoder(),
        Arc::clone(&pipeline),
        CancellationToken::new(),
    );

    for _ in 0..3 {
        tx.send(listing_response("https://h/api/list?page=1", "k"))
            .await
            .unwrap();
    }
    drop(tx);
    consumer.await.unwrap();

    let docs = sink.docs.lock().unwrap();
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| d.id() == "k"));
    assert!(docs.iter().all(|d| d.embedding().is_some()));
    let stats = pipeline.stats();
    assert_eq!(stats.embedded, 3);
    assert_eq!(stats.indexed, 3);
}

/// Click scenario: five distinct pages, five indexed records, vectors in
/// positional correspondence with the embedding strings.
#[tokio::test]
async fn five_click_responses_index_five_records() {
    let (sink, pipeline) = build_pipeline(2);
    let (tx, rx) = mpsc::channel(16);
    let consumer =
        spawn_indexed_consumer(rx, listing_decoder(), pipeline, CancellationToken::new());

    for page in 0..5 {
        tx.send(listing_response(
            &format!("https://h/api/list?page={page}"),
            &format!("job-{page}"),
        ))
        .await
        .unwrap();
    }
    drop(tx);
    consumer.await.unwrap();

    let docs = sink.docs.lock().unwrap();
    assert_eq!(docs.len(), 5);
    for doc in docs.iter() {
        let expected = vec![doc.embedding_string().len() as f32];
        assert_eq!(doc.embedding().unwrap(), &expected[..]);
    }
}

/// Backpressure: a capacity-4 channel and a deliberately slow consumer.
/// The producer can only finish once the consumer has drained most of the
/// stream; nothing is dropped and order is preserved.
#[tokio::test]
async fn bounded_channel_applies_backpressure_without_loss() {
    const TOTAL: usize = 40;
    const PER_MESSAGE_DELAY: Duration = Duration::from_millis(5);

    let (tx, mut rx) = mpsc::channel::<NetworkResponse>(4);
    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(resp) = rx.recv().await {
            tokio::time::sleep(PER_MESSAGE_DELAY).await;
            seen.push(resp.url);
        }
        seen
    });

    let started = Instant::now();
    for i in 0..TOTAL {
        tx.send(listing_response(&format!("u{i}"), "k")).await.unwrap();
    }
    let produce_elapsed = started.elapsed();
    drop(tx);

    let seen = reader.await.unwrap();
    assert_eq!(seen.len(), TOTAL);
    let expected: Vec<String> = (0..TOTAL).map(|i| format!("u{i}")).collect();
    assert_eq!(seen, expected);
    // With only 4 slots of buffer the producer had to wait for the reader.
    assert!(
        produce_elapsed >= PER_MESSAGE_DELAY * ((TOTAL - 8) as u32),
        "producer finished too quickly ({produce_elapsed:?}) for a bounded channel"
    );
}

/// A listener with zero matches: closing the channel lets the observer
/// exit cleanly with a count of zero.
#[tokio::test]
async fn observer_exits_cleanly_with_zero_matches() {
    let (tx, rx) = mpsc::channel::<NetworkResponse>(4);
    let observer = spawn_observer_consumer(rx, CancellationToken::new());
    drop(tx);
    assert_eq!(observer.await.unwrap(), 0);
}
