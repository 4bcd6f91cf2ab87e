//! Listener-channel consumers.
//!
//! One consumer per [`ListenerConfig`]: it drains the channel until the
//! dispatcher closes it (drain, then exit) or the context is cancelled
//! (exit immediately; undelivered items are lost - close the channel
//! before cancelling when durability matters).

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::embed_index::EmbedIndexPipeline;
use crate::crawler::NetworkResponse;
use crate::models::Crawlable;

/// Turns a hijacked response body into domain records. Per-message errors
/// are logged and the message dropped; the consumer keeps running.
pub type Decoder<C> = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<C>> + Send + Sync>;

/// Decode -> project -> embed -> index flavour.
pub fn spawn_indexed_consumer<C>(
    mut rx: mpsc::Receiver<NetworkResponse>,
    decoder: Decoder<C>,
    pipeline: Arc<EmbedIndexPipeline<C::Doc>>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    C: Crawlable + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("consumer cancelled, undelivered responses are dropped");
                    return;
                }
                maybe = rx.recv() => {
                    let Some(response) = maybe else {
                        info!("listener channel closed, consumer exiting");
                        return;
                    };
                    let records = match (decoder)(&response.body) {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(url = %response.url, "decode failed: {e}");
                            continue;
                        }
                    };
                    if records.is_empty() {
                        continue;
                    }
                    let docs: Vec<C::Doc> =
                        records.iter().map(|record| record.to_document()).collect();
                    debug!(
                        url = %response.url,
                        pattern = %response.url_pattern,
                        count = docs.len(),
                        "decoded records"
                    );
                    pipeline.process(docs).await;
                }
            }
        }
    })
}

/// Observe-only flavour: log arrivals, count them. Used for probing a new
/// target before wiring a decoder.
pub fn spawn_observer_consumer(
    mut rx: mpsc::Receiver<NetworkResponse>,
    token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut observed = 0u64;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(observed, "observer cancelled");
                    return observed;
                }
                maybe = rx.recv() => {
                    let Some(response) = maybe else {
                        info!(observed, "listener channel closed, observer exiting");
                        return observed;
                    };
                    observed += 1;
                    info!(
                        url = %response.url,
                        pattern = %response.url_pattern,
                        bytes = response.body.len(),
                        "observed response"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{decode_listing_payload, JobListing};
    use crate::pipeline::embed_index::test_support::{FakeEmbedder, RecordingSink};
    use std::time::Duration;

    fn listing_body(id: &str) -> Vec<u8> {
        serde_json::json!({
            "code": 0,
            "message": "ok",
            "data": { "hasMore": false, "list": [{ "jobId": id, "jobName": "Engineer" }] }
        })
        .to_string()
        .into_bytes()
    }

    fn response(url: &str, body: Vec<u8>) -> NetworkResponse {
        NetworkResponse {
            url: url.to_string(),
            url_pattern: "/api/*".to_string(),
            body,
        }
    }

    fn decoder() -> Decoder<JobListing> {
        Arc::new(|body| decode_listing_payload(body))
    }

    fn pipeline() -> (Arc<RecordingSink>, Arc<EmbedIndexPipeline<crate::models::JobListingDoc>>) {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Arc::new(EmbedIndexPipeline::new(
            Arc::new(FakeEmbedder::new(4)),
            Arc::clone(&sink) as Arc<dyn crate::search::DocumentSink<crate::models::JobListingDoc>>,
        ));
        (sink, pipeline)
    }

    #[tokio::test]
    async fn drains_then_exits_on_channel_close() {
        let (sink, pipeline) = pipeline();
        let (tx, rx) = mpsc::channel(8);
        let consumer = spawn_indexed_consumer(rx, decoder(), pipeline, CancellationToken::new());

        for i in 0..3 {
            tx.send(response(&format!("u{i}"), listing_body(&format!("j{i}"))))
                .await
                .unwrap();
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();

        let ids: Vec<String> = sink.docs.lock().unwrap().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["j0", "j1", "j2"]);
    }

    #[tokio::test]
    async fn decode_errors_skip_the_message_only() {
        let (sink, pipeline) = pipeline();
        let (tx, rx) = mpsc::channel(8);
        let consumer = spawn_indexed_consumer(rx, decoder(), pipeline, CancellationToken::new());

        tx.send(response("u0", listing_body("ok-1"))).await.unwrap();
        tx.send(response("u1", b"not json at all".to_vec())).await.unwrap();
        tx.send(response("u2", listing_body("ok-2"))).await.unwrap();
        drop(tx);
        consumer.await.unwrap();

        let ids: Vec<String> = sink.docs.lock().unwrap().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["ok-1", "ok-2"]);
    }

    #[tokio::test]
    async fn cancellation_returns_immediately() {
        let (sink, pipeline) = pipeline();
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let consumer = spawn_indexed_consumer(rx, decoder(), pipeline, token.clone());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        // The sender is still alive; nothing was consumed after cancel.
        tx.send(response("late", listing_body("late"))).await.unwrap();
        assert!(sink.docs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn observer_counts_and_exits_cleanly_on_zero_matches() {
        let (tx, rx) = mpsc::channel(4);
        let observer = spawn_observer_consumer(rx, CancellationToken::new());
        drop(tx);
        assert_eq!(observer.await.unwrap(), 0);

        let (tx, rx) = mpsc::channel(4);
        let observer = spawn_observer_consumer(rx, CancellationToken::new());
        for i in 0..5 {
            tx.send(response(&format!("u{i}"), b"{}".to_vec())).await.unwrap();
        }
        drop(tx);
        assert_eq!(observer.await.unwrap(), 5);
    }
}
