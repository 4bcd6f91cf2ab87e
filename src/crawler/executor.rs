//! URL-operation executor.
//!
//! Drives one page through an operation: navigate, wait for the document
//! to come up, then perform the configured actions with randomised pacing
//! and a request-idle wait against the listener's patterns after each one.

use std::collections::HashSet;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use rand::rngs::SmallRng;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::CrawlerError;
use super::hijack::pattern_matches;
use super::params::{OperationType, UrlOperation};

/// Fixed settle after the document reports ready.
const NAVIGATION_SETTLE: Duration = Duration::from_secs(2);
/// Upper bound on the ready-state wait; slow pages proceed regardless.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Window of network silence that counts as idle.
const IDLE_WINDOW: Duration = Duration::from_secs(1);
/// A chatty page cannot hold a worker longer than this multiple of the
/// idle window.
const IDLE_HARD_CAP: u32 = 10;

/// Resolves once `document.readyState` reaches interactive/complete, with
/// an in-page fallback timer so the promise always settles.
const READY_STATE_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// Per-action pause: `standard + U(0, random)` seconds.
fn action_pause(op: &UrlOperation, rng: &mut SmallRng) -> Duration {
    Duration::from_secs_f64(op.standard_sleep_secs + rng.gen::<f64>() * op.random_delay_secs)
}

/// Scroll target: somewhere in the lower band of the page so feeds keep
/// loading without jumping past unrendered content.
fn scroll_target(page_height: f64, rng: &mut SmallRng) -> f64 {
    page_height * (0.7 + rng.gen::<f64>() * 0.25)
}

/// Run one operation against a checked-out page.
pub(crate) async fn execute(
    page: &Page,
    op: &UrlOperation,
    rng: &mut SmallRng,
    worker_id: usize,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    navigate(page, worker_id, &op.url).await?;
    match op.operation {
        OperationType::Scroll => perform_scroll(page, op, rng, token).await,
        OperationType::Click => perform_click(page, op, rng, token).await,
        OperationType::XClick => perform_xclick(page, op, rng, token).await,
    }
}

async fn navigate(page: &Page, worker_id: usize, url: &str) -> Result<(), CrawlerError> {
    info!(worker_id, url, "navigating");
    let params = NavigateParams::builder()
        .url(url)
        .build()
        .map_err(|e| CrawlerError::Navigation {
            url: url.to_string(),
            reason: format!("invalid url: {e}"),
        })?;
    page.execute(params)
        .await
        .map_err(|e| CrawlerError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    match tokio::time::timeout(READY_TIMEOUT, page.evaluate(READY_STATE_SCRIPT)).await {
        Ok(Ok(result)) => {
            let state: String = result
                .into_value()
                .unwrap_or_else(|_| "unknown".to_string());
            debug!(worker_id, %state, "page ready");
        }
        Ok(Err(e)) => {
            debug!(worker_id, "could not check ready state: {e}");
        }
        Err(_) => {
            warn!(worker_id, url, "timed out waiting for page ready state");
        }
    }
    tokio::time::sleep(NAVIGATION_SETTLE).await;
    Ok(())
}

async fn perform_scroll(
    page: &Page,
    op: &UrlOperation,
    rng: &mut SmallRng,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    for action in 1..=op.num_actions {
        let height: f64 = page
            .evaluate("document.body.scrollHeight")
            .await
            .map_err(|e| CrawlerError::Evaluation {
                reason: format!("failed to read page height: {e}"),
            })?
            .into_value()
            .map_err(|e| CrawlerError::Evaluation {
                reason: format!("page height is not a number: {e}"),
            })?;
        let target = scroll_target(height, rng);

        let script = format!("window.scrollTo({{ top: {target}, behavior: 'smooth' }})");
        if let Err(e) = page.evaluate(script).await {
            debug!("smooth scroll failed, falling back to mouse wheel: {e}");
            if let Err(e) = dispatch_wheel(page, target).await {
                debug!("mouse wheel failed, falling back to PageDown: {e}");
                for _ in 0..3 {
                    press_page_down(page).await?;
                }
            }
        }
        debug!(action, target, "scroll complete");

        wait_request_idle(page, &op.listener.url_patterns, IDLE_WINDOW, token).await?;
        pace(op, rng, token).await?;
    }
    Ok(())
}

async fn perform_click(
    page: &Page,
    op: &UrlOperation,
    rng: &mut SmallRng,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    let selector = op.click_selector.as_deref().unwrap_or_default();
    // CSS targets are assumed stable; resolve once, click many times.
    let element = page
        .find_element(selector)
        .await
        .map_err(|e| CrawlerError::ElementNotFound {
            selector: selector.to_string(),
            reason: e.to_string(),
        })?;
    for action in 1..=op.num_actions {
        element.click().await.map_err(|e| CrawlerError::Action {
            reason: format!("click on {selector} failed: {e}"),
        })?;
        debug!(action, selector, "click complete");

        wait_request_idle(page, &op.listener.url_patterns, IDLE_WINDOW, token).await?;
        pace(op, rng, token).await?;
    }
    Ok(())
}

async fn perform_xclick(
    page: &Page,
    op: &UrlOperation,
    rng: &mut SmallRng,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    let selector = op.click_selector.as_deref().unwrap_or_default();
    for action in 1..=op.num_actions {
        // XPath targets move as the DOM mutates; re-resolve every time.
        let element =
            page.find_xpath(selector)
                .await
                .map_err(|e| CrawlerError::ElementNotFound {
                    selector: selector.to_string(),
                    reason: e.to_string(),
                })?;
        element.click().await.map_err(|e| CrawlerError::Action {
            reason: format!("xpath click on {selector} failed: {e}"),
        })?;
        debug!(action, selector, "xpath click complete");

        wait_request_idle(page, &op.listener.url_patterns, IDLE_WINDOW, token).await?;
        pace(op, rng, token).await?;
    }
    Ok(())
}

async fn dispatch_wheel(page: &Page, delta_y: f64) -> Result<(), String> {
    let params = DispatchMouseEventParams::builder()
        .r#type(DispatchMouseEventType::MouseWheel)
        .x(100.0)
        .y(100.0)
        .delta_x(0.0)
        .delta_y(delta_y)
        .build()
        .map_err(|e| e.to_string())?;
    page.execute(params).await.map_err(|e| e.to_string())?;
    Ok(())
}

async fn press_page_down(page: &Page) -> Result<(), CrawlerError> {
    for event_type in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
        let params = DispatchKeyEventParams::builder()
            .r#type(event_type)
            .key("PageDown")
            .code("PageDown")
            .windows_virtual_key_code(34)
            .native_virtual_key_code(34)
            .build()
            .map_err(|e| CrawlerError::Action {
                reason: format!("invalid PageDown event: {e}"),
            })?;
        page.execute(params).await.map_err(|e| CrawlerError::Action {
            reason: format!("PageDown dispatch failed: {e}"),
        })?;
    }
    Ok(())
}

/// Sleep the pacing interval, exiting early (as a counted failure) when
/// cancellation arrives - the action itself already completed.
async fn pace(
    op: &UrlOperation,
    rng: &mut SmallRng,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    let pause = action_pause(op, rng);
    tokio::select! {
        _ = token.cancelled() => Err(CrawlerError::Cancelled),
        _ = tokio::time::sleep(pause) => Ok(()),
    }
}

/// Wait until no request matching `patterns` has been active for `window`,
/// bounded by a hard cap. Document-type requests (full navigations) are
/// ignored so a page load does not keep resetting the clock. Returns
/// promptly on cancellation.
pub(crate) async fn wait_request_idle(
    page: &Page,
    patterns: &[String],
    window: Duration,
    token: &CancellationToken,
) -> Result<(), CrawlerError> {
    let mut requests = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(|e| CrawlerError::Action {
            reason: format!("failed to subscribe to request events: {e}"),
        })?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(|e| CrawlerError::Action {
            reason: format!("failed to subscribe to loading events: {e}"),
        })?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(|e| CrawlerError::Action {
            reason: format!("failed to subscribe to failure events: {e}"),
        })?;

    let mut pending: HashSet<String> = HashSet::new();
    let wait = async {
        let idle = tokio::time::sleep(window);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = &mut idle => {
                    if pending.is_empty() {
                        return;
                    }
                    idle.as_mut().reset(tokio::time::Instant::now() + window);
                }
                maybe = requests.next() => {
                    let Some(event) = maybe else { return };
                    let is_document = matches!(event.r#type, Some(ResourceType::Document));
                    if !is_document
                        && patterns.iter().any(|p| pattern_matches(p, &event.request.url))
                    {
                        pending.insert(event.request_id.inner().to_string());
                        idle.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                }
                maybe = finished.next() => {
                    let Some(event) = maybe else { return };
                    if pending.remove(event.request_id.inner().as_str()) {
                        idle.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                }
                maybe = failed.next() => {
                    let Some(event) = maybe else { return };
                    if pending.remove(event.request_id.inner().as_str()) {
                        idle.as_mut().reset(tokio::time::Instant::now() + window);
                    }
                }
            }
        }
    };
    let _ = tokio::time::timeout(window * IDLE_HARD_CAP, wait).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::params::ListenerConfig;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    fn op(std_sleep: f64, random: f64) -> UrlOperation {
        let (tx, _rx) = mpsc::channel(1);
        UrlOperation {
            url: "https://example.com".to_string(),
            operation: OperationType::Scroll,
            num_actions: 1,
            standard_sleep_secs: std_sleep,
            random_delay_secs: random,
            click_selector: None,
            listener: ListenerConfig::new(vec!["*".to_string()], tx),
        }
    }

    #[test]
    fn zero_random_delay_is_deterministic() {
        let mut rng = SmallRng::seed_from_u64(7);
        let pause = action_pause(&op(1.5, 0.0), &mut rng);
        assert_eq!(pause, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn pause_stays_within_band() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..1000 {
            let pause = action_pause(&op(1.0, 2.0), &mut rng).as_secs_f64();
            assert!((1.0..3.0).contains(&pause), "pause {pause} out of band");
        }
    }

    #[test]
    fn same_seed_same_pacing() {
        let mut a = SmallRng::seed_from_u64(99);
        let mut b = SmallRng::seed_from_u64(99);
        for _ in 0..16 {
            assert_eq!(action_pause(&op(0.5, 3.0), &mut a), action_pause(&op(0.5, 3.0), &mut b));
        }
    }

    #[test]
    fn scroll_target_stays_in_lower_band() {
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..1000 {
            let target = scroll_target(10_000.0, &mut rng);
            assert!((7_000.0..9_500.0).contains(&target), "target {target}");
        }
    }
}
