//! Fixed-capacity async pool of browser or page handles.
//!
//! The pool is a bounded channel pre-filled with `capacity` empty slots.
//! Checkout pops a slot and fills it through the caller's factory on first
//! use; release pushes the handle back. At every instant
//! `checked_out + queued == capacity`, so a checked-out handle can never
//! be held twice.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Pool<H> {
    slot_tx: mpsc::Sender<Option<H>>,
    slot_rx: Mutex<mpsc::Receiver<Option<H>>>,
    capacity: usize,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl<H: Send + 'static> Pool<H> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (slot_tx, slot_rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            slot_tx
                .try_send(None)
                .expect("fresh pool channel holds capacity slots");
        }
        Self {
            slot_tx,
            slot_rx: Mutex::new(slot_rx),
            capacity,
            created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles ever created through factories.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Check out a handle, blocking while all slots are busy. An empty slot
    /// is filled via `factory`; a factory failure returns the slot so
    /// capacity is preserved. Returns an error promptly on cancellation.
    pub async fn get<F, Fut>(&self, token: &CancellationToken, factory: F) -> Result<H>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<H>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("pool is closed"));
        }
        let slot = {
            let mut rx = self.slot_rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Err(anyhow!("pool checkout cancelled")),
                slot = rx.recv() => slot,
            }
        };
        match slot {
            Some(Some(handle)) => Ok(handle),
            Some(None) => match factory().await {
                Ok(handle) => {
                    self.created.fetch_add(1, Ordering::AcqRel);
                    Ok(handle)
                }
                Err(e) => {
                    // Hand the empty slot back so the next get can retry.
                    let _ = self.slot_tx.send(None).await;
                    Err(e)
                }
            },
            None => Err(anyhow!("pool is closed")),
        }
    }

    /// Return a handle. The handle becomes immediately eligible for the
    /// next `get`. During cleanup the return is still accepted (cleanup
    /// waits for it); after cleanup the handle is dropped.
    pub async fn put(&self, handle: H) {
        if self.slot_tx.send(Some(handle)).await.is_err() {
            debug!("pool already cleaned up, dropping returned handle");
        }
    }

    /// Close every handle ever created, waiting for outstanding checkouts
    /// to be returned first. After cleanup, `get` and `put` are refused.
    pub async fn cleanup<F, Fut>(&self, mut closer: F)
    where
        F: FnMut(H) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        self.closed.store(true, Ordering::Release);
        let mut rx = self.slot_rx.lock().await;
        for _ in 0..self.capacity {
            match rx.recv().await {
                Some(Some(handle)) => closer(handle).await,
                Some(None) => {}
                None => break,
            }
        }
        rx.close();
        debug!(capacity = self.capacity, "pool cleanup complete");
    }
}
