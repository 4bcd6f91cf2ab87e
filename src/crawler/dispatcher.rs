//! Worker dispatcher.
//!
//! `perform_all_url_operations` fans validated operations out to
//! `min(pool capacity, operation count)` workers. Each worker checks a
//! page out of the provider, scopes a hijack router to the operation,
//! runs the executor, and tears down in a fixed order: router stop, page
//! release, handle back to the pool. Per-operation errors are aggregated;
//! a worker panic becomes an error instead of taking the dispatcher down.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::CrawlerError;
use super::executor;
use super::hijack::HijackRouter;
use super::params::{NetworkResponse, UrlOperation};
use crate::browser::PageProvider;

/// Pause before teardown so in-flight hijack handlers can finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Dispatcher-owned listener senders. Dropping them on shutdown is the
/// single close of each listener channel; workers and routers only ever
/// hold clones that die with the operation.
struct ListenerRegistry {
    senders: StdMutex<Vec<mpsc::Sender<NetworkResponse>>>,
}

impl ListenerRegistry {
    fn new() -> Self {
        Self {
            senders: StdMutex::new(Vec::new()),
        }
    }

    fn register(&self, operations: &[UrlOperation]) {
        let mut senders = self.senders.lock().expect("listener registry lock");
        for op in operations {
            senders.push(op.listener.tx.clone());
        }
    }

    fn release(&self) -> usize {
        let drained: Vec<_> = {
            let mut senders = self.senders.lock().expect("listener registry lock");
            senders.drain(..).collect()
        };
        let count = drained.len();
        drop(drained);
        count
    }
}

/// Drop invalid operations with a warning; a malformed recipe never
/// crashes the dispatcher.
fn filter_valid(operations: Vec<UrlOperation>) -> Vec<UrlOperation> {
    operations
        .into_iter()
        .filter(|op| match op.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(url = %op.url, %reason, "skipping invalid operation");
                false
            }
        })
        .collect()
}

pub struct ParallelCrawler<P: PageProvider> {
    provider: Arc<P>,
    listeners: ListenerRegistry,
    base_seed: Option<u64>,
}

impl<P: PageProvider + 'static> ParallelCrawler<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            listeners: ListenerRegistry::new(),
            base_seed: None,
        }
    }

    /// Seed worker RNGs deterministically (worker `i` gets `seed + i`).
    /// Unseeded crawlers draw from entropy.
    pub fn with_base_seed(mut self, seed: u64) -> Self {
        self.base_seed = Some(seed);
        self
    }

    /// Execute every valid operation, returning the aggregated error if
    /// any of them failed. Cancelling `token` stops workers after their
    /// current action; cancelled operations count as failures.
    pub async fn perform_all_url_operations(
        &self,
        token: &CancellationToken,
        operations: Vec<UrlOperation>,
    ) -> Result<(), CrawlerError> {
        let run_token = token.child_token();
        let valid = filter_valid(operations);
        if valid.is_empty() {
            debug!("no valid operations to dispatch");
            return Ok(());
        }
        self.listeners.register(&valid);

        let count = valid.len();
        let (op_tx, op_rx) = mpsc::channel(count);
        for op in valid {
            op_tx.try_send(op).expect("operation channel sized to fit");
        }
        drop(op_tx);
        let op_rx = Arc::new(Mutex::new(op_rx));

        let worker_count = self.provider.capacity().min(count);
        let (err_tx, mut err_rx) = mpsc::channel(count.max(self.provider.capacity()));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let provider = Arc::clone(&self.provider);
            let op_rx = Arc::clone(&op_rx);
            let err_tx = err_tx.clone();
            let worker_token = run_token.clone();
            let seed = self
                .base_seed
                .map(|s| s.wrapping_add(worker_id as u64))
                .unwrap_or_else(rand::random);
            workers.spawn(async move {
                worker_loop(worker_id, provider, op_rx, err_tx, worker_token, seed).await;
            });
        }
        drop(err_tx);

        let mut errors = Vec::new();
        while let Some(joined) = workers.join_next().await {
            if let Err(join_err) = joined {
                if join_err.is_panic() {
                    errors.push(CrawlerError::WorkerPanic(join_err.to_string()));
                }
            }
        }
        while let Some(err) = err_rx.recv().await {
            errors.push(err);
        }

        match CrawlerError::aggregate(errors) {
            Some(aggregate) => Err(aggregate),
            None => Ok(()),
        }
    }

    /// Graceful shutdown: wait out the grace period, close every listener
    /// channel (exactly once, here and nowhere else), then close all pool
    /// handles. No operations may be dispatched afterwards.
    pub async fn close(&self) {
        info!("crawler shutting down, waiting for in-flight handlers");
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let released = self.listeners.release();
        info!(listeners = released, "listener channels closed");
        self.provider.shutdown().await;
        info!("browser pool closed");
    }
}

async fn worker_loop<P: PageProvider>(
    worker_id: usize,
    provider: Arc<P>,
    ops: Arc<Mutex<mpsc::Receiver<UrlOperation>>>,
    errors: mpsc::Sender<CrawlerError>,
    token: CancellationToken,
    seed: u64,
) {
    let mut rng = SmallRng::seed_from_u64(seed);
    loop {
        let op = {
            let mut rx = ops.lock().await;
            tokio::select! {
                _ = token.cancelled() => {
                    info!(worker_id, "cancelled, exiting");
                    return;
                }
                maybe = rx.recv() => match maybe {
                    Some(op) => op,
                    None => {
                        debug!(worker_id, "operation channel drained, exiting");
                        return;
                    }
                },
            }
        };
        if let Err(err) = process_operation(worker_id, provider.as_ref(), &op, &mut rng, &token).await
        {
            warn!(worker_id, url = %op.url, error = %err, "operation failed");
            let _ = errors.send(err).await;
        }
    }
}

async fn process_operation<P: PageProvider>(
    worker_id: usize,
    provider: &P,
    op: &UrlOperation,
    rng: &mut SmallRng,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    let lease = provider
        .checkout(token)
        .await
        .map_err(|e| CrawlerError::Pool(e.to_string()))?;

    let mut router = HijackRouter::new(lease.page.clone(), token);
    for pattern in &op.listener.url_patterns {
        router.add_pattern(pattern.clone(), op.listener.tx.clone());
    }
    let running = match router.run().await {
        Ok(running) => running,
        Err(err) => {
            provider.release(lease).await;
            return Err(err);
        }
    };

    let result = executor::execute(&lease.page, op, rng, worker_id, token).await;

    // Router down before the page goes back; its senders die with it.
    running.stop().await;
    debug!(worker_id, "router stopped, releasing page");
    provider.release(lease).await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::params::{ListenerConfig, OperationType};

    fn op(url: &str) -> UrlOperation {
        let (tx, _rx) = mpsc::channel(4);
        UrlOperation {
            url: url.to_string(),
            operation: OperationType::Scroll,
            num_actions: 2,
            standard_sleep_secs: 0.0,
            random_delay_secs: 0.0,
            click_selector: None,
            listener: ListenerConfig::new(vec!["/api/*".to_string()], tx),
        }
    }

    #[test]
    fn filter_keeps_valid_drops_invalid_in_order() {
        let mut bad_click = op("https://b");
        bad_click.operation = OperationType::Click;
        let mut no_actions = op("https://c");
        no_actions.num_actions = 0;

        let valid = filter_valid(vec![op("https://a"), bad_click, no_actions, op("https://d")]);
        let urls: Vec<_> = valid.iter().map(|o| o.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://d"]);
    }

    #[tokio::test]
    async fn registry_release_closes_channels_exactly_once() {
        let (tx, mut rx) = mpsc::channel::<NetworkResponse>(2);
        let operation = {
            let mut operation = op("https://a");
            operation.listener = ListenerConfig::new(vec!["*".to_string()], tx.clone());
            operation
        };

        let registry = ListenerRegistry::new();
        registry.register(std::slice::from_ref(&operation));

        // A buffered message plus the worker-side clones going away: the
        // reader sees the message, then closure, only after release.
        tx.send(NetworkResponse {
            url: "u".into(),
            url_pattern: "*".into(),
            body: b"{}".to_vec(),
        })
        .await
        .unwrap();
        drop(tx);
        drop(operation);

        assert_eq!(rx.recv().await.unwrap().url, "u");
        assert!(rx.try_recv().is_err());

        assert_eq!(registry.release(), 1);
        assert!(rx.recv().await.is_none());
        // Second release is a no-op.
        assert_eq!(registry.release(), 0);
    }
}
