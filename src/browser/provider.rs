//! Page providers: the dispatcher's seam over the two pool variants.
//!
//! A browser pool launches one Chrome process per slot (true isolation,
//! own data dir and debug port, higher memory); a page pool shares one
//! process across tabs (cheaper, more contention). Both hand the worker a
//! [`LeasedPage`] and take it back on release, so dispatch is agnostic.

use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::launcher::{self, BrowserHandle, LauncherOptions};
use super::pool::Pool;
use crate::config::BrowserOptions;

/// A page checked out for one operation, together with the pool slot it
/// must be returned to.
pub struct LeasedPage {
    pub page: Page,
    slot: LeaseSlot,
}

enum LeaseSlot {
    /// Browser-pool lease: the page was opened for this operation and the
    /// browser goes back to the pool.
    Browser(BrowserHandle),
    /// Page-pool lease: the page itself is the slot.
    Page,
}

#[async_trait]
pub trait PageProvider: Send + Sync {
    fn capacity(&self) -> usize;

    /// Check out a page, blocking while the pool is exhausted; cancellable.
    async fn checkout(&self, token: &CancellationToken) -> Result<LeasedPage>;

    /// Return a lease. Pages of failed operations are passed back here too;
    /// the provider decides whether the page dies with the lease.
    async fn release(&self, lease: LeasedPage);

    /// Close every handle ever created. No checkouts afterwards.
    async fn shutdown(&self);
}

/// Apply per-page setup: user-agent override and the optional injection
/// hook, both before first navigation.
async fn prepare_page(page: &Page, options: &BrowserOptions) -> Result<()> {
    if !options.user_agent.is_empty() {
        page.execute(SetUserAgentOverrideParams::new(options.user_agent.clone()))
            .await
            .context("failed to override user agent")?;
    }
    if let Some(ref script) = options.page_init_script {
        if let Err(e) = page.evaluate(script.as_str()).await {
            debug!("page init script skipped: {e}");
        }
    }
    Ok(())
}

/// One launched browser process per slot.
pub struct BrowserPoolProvider {
    pool: Pool<BrowserHandle>,
    /// Browsers launched at startup, handed out by the pool factory.
    pending: Mutex<Vec<BrowserHandle>>,
    options: BrowserOptions,
}

impl BrowserPoolProvider {
    /// Launch `capacity` browser instances, each with a distinct user-data
    /// dir and remote-debugging port. Any launch failure aborts startup.
    pub async fn init(options: BrowserOptions, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut pending = Vec::with_capacity(capacity);
        for instance_id in 0..capacity {
            let launcher_opts = LauncherOptions::for_instance(&options, instance_id);
            let handle = launcher::launch(&launcher_opts).await?;
            pending.push(handle);
        }
        Ok(Self {
            pool: Pool::new(capacity),
            pending: Mutex::new(pending),
            options,
        })
    }
}

#[async_trait]
impl PageProvider for BrowserPoolProvider {
    fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    async fn checkout(&self, token: &CancellationToken) -> Result<LeasedPage> {
        let browser = self
            .pool
            .get(token, || async {
                self.pending
                    .lock()
                    .expect("pending browsers lock")
                    .pop()
                    .context("no launched browser left for pool slot")
            })
            .await?;
        let page = match browser.new_page().await {
            Ok(page) => page,
            Err(e) => {
                self.pool.put(browser).await;
                return Err(e);
            }
        };
        if let Err(e) = prepare_page(&page, &self.options).await {
            let _ = page.close().await;
            self.pool.put(browser).await;
            return Err(e);
        }
        Ok(LeasedPage {
            page,
            slot: LeaseSlot::Browser(browser),
        })
    }

    async fn release(&self, lease: LeasedPage) {
        // Close the per-operation page first so tabs never accumulate.
        if let Err(e) = lease.page.close().await {
            debug!("page close on release failed: {e}");
        }
        match lease.slot {
            LeaseSlot::Browser(browser) => self.pool.put(browser).await,
            LeaseSlot::Page => warn!("page lease released to a browser pool"),
        }
    }

    async fn shutdown(&self) {
        self.pool.cleanup(|handle| handle.close()).await;
        // Browsers never checked out still sit in the pending list.
        let leftover: Vec<BrowserHandle> = {
            let mut pending = self.pending.lock().expect("pending browsers lock");
            pending.drain(..).collect()
        };
        for handle in leftover {
            handle.close().await;
        }
    }
}

/// One shared browser, tabs as slots.
pub struct PagePoolProvider {
    shared: tokio::sync::Mutex<Option<BrowserHandle>>,
    pool: Pool<Page>,
    options: BrowserOptions,
}

impl PagePoolProvider {
    /// Launch a single browser (instance 0) and pool up to `capacity`
    /// lazily created tabs inside it.
    pub async fn init(options: BrowserOptions, capacity: usize) -> Result<Self> {
        let launcher_opts = LauncherOptions::for_instance(&options, 0);
        let shared = launcher::launch(&launcher_opts).await?;
        Ok(Self {
            shared: tokio::sync::Mutex::new(Some(shared)),
            pool: Pool::new(capacity.max(1)),
            options,
        })
    }
}

#[async_trait]
impl PageProvider for PagePoolProvider {
    fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    async fn checkout(&self, token: &CancellationToken) -> Result<LeasedPage> {
        let page = self
            .pool
            .get(token, || async {
                let guard = self.shared.lock().await;
                let browser = guard.as_ref().context("shared browser already closed")?;
                let page = browser.new_page().await?;
                prepare_page(&page, &self.options).await?;
                Ok(page)
            })
            .await?;
        Ok(LeasedPage {
            page,
            slot: LeaseSlot::Page,
        })
    }

    async fn release(&self, lease: LeasedPage) {
        // The tab survives between operations; the next executor navigates
        // it to a fresh URL.
        self.pool.put(lease.page).await;
    }

    async fn shutdown(&self) {
        self.pool
            .cleanup(|page| async move {
                if let Err(e) = page.close().await {
                    debug!("page close during cleanup failed: {e}");
                }
            })
            .await;
        if let Some(browser) = self.shared.lock().await.take() {
            browser.close().await;
        }
    }
}
