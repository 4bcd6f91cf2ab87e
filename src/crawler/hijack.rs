//! Per-page network hijack router.
//!
//! CDP delivers response metadata (`Network.responseReceived`) before the
//! body is readable (`Network.loadingFinished`), so the router pairs the
//! two through a lock-striped cache keyed by request id. Entries are
//! removed on loading-finished, loading-failed, or router stop, which
//! bounds their lifetime to in-flight requests.
//!
//! Delivery blocks on a full listener channel; that backpressure is
//! intentional and reaches back into page activity instead of buffering
//! without bound. After cancellation, matched responses are discarded
//! silently.

use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams,
};
use chromiumoxide::Page;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::CrawlerError;
use super::params::NetworkResponse;

/// One registered route: a URL pattern and the listener channel it feeds.
struct Route {
    pattern: String,
    tx: mpsc::Sender<NetworkResponse>,
}

/// Response metadata parked until its body becomes readable.
struct PendingBody {
    url: String,
    route: usize,
}

/// Match `pattern` against a full URL. Patterns with `*`/`?` are globs
/// over the whole URL; bare patterns match as substrings.
pub fn pattern_matches(pattern: &str, url: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        wildcard_match(pattern, url)
    } else {
        url.contains(pattern)
    }
}

/// Glob match with `*` (any run) and `?` (single char), anchored at both
/// ends. Iterative with star backtracking.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// First matching route wins, in registration order - deterministic even
/// when several patterns match one URL.
fn match_first(routes: &[Route], url: &str) -> Option<usize> {
    routes
        .iter()
        .position(|route| pattern_matches(&route.pattern, url))
}

/// Ship one matched response to its route, blocking on a full channel.
/// Cancellation drops the response instead.
async fn forward(route: &Route, token: &CancellationToken, response: NetworkResponse) {
    if token.is_cancelled() {
        debug!(url = %response.url, "cancelled, dropping hijacked response");
        return;
    }
    let url = response.url.clone();
    tokio::select! {
        _ = token.cancelled() => {
            debug!(url = %url, "cancelled while blocked, dropping hijacked response");
        }
        sent = route.tx.send(response) => {
            if sent.is_err() {
                warn!(pattern = %route.pattern, "listener channel closed, response lost");
            }
        }
    }
}

/// Router bound to one page. Build, register patterns, then [`run`] it;
/// the returned [`RunningRouter`] is stopped by the worker before the
/// page's handle returns to the pool.
///
/// [`run`]: HijackRouter::run
pub struct HijackRouter {
    page: Page,
    routes: Vec<Route>,
    token: CancellationToken,
}

impl HijackRouter {
    pub fn new(page: Page, parent: &CancellationToken) -> Self {
        Self {
            page,
            routes: Vec::new(),
            token: parent.child_token(),
        }
    }

    pub fn add_pattern(&mut self, pattern: impl Into<String>, tx: mpsc::Sender<NetworkResponse>) {
        self.routes.push(Route {
            pattern: pattern.into(),
            tx,
        });
    }

    /// Enable network events and start dispatching in the background.
    pub async fn run(self) -> Result<RunningRouter, CrawlerError> {
        let HijackRouter {
            page,
            routes,
            token,
        } = self;

        page.execute(EnableParams::default())
            .await
            .map_err(|e| CrawlerError::Action {
                reason: format!("failed to enable network domain: {e}"),
            })?;

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| CrawlerError::Action {
                reason: format!("failed to subscribe to response events: {e}"),
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

        let cache: DashMap<String, PendingBody> = DashMap::new();
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    maybe = responses.next() => {
                        let Some(event) = maybe else { break };
                        if let Some(route) = match_first(&routes, &event.response.url) {
                            cache.insert(
                                event.request_id.inner().to_string(),
                                PendingBody {
                                    url: event.response.url.clone(),
                                    route,
                                },
                            );
                        }
                    }
                    maybe = finished.next() => {
                        let Some(event) = maybe else { break };
                        let key = event.request_id.inner().to_string();
                        if let Some((_, pending)) = cache.remove(key.as_str()) {
                            let body = match load_body(&page, &event.request_id).await {
                                Ok(body) => body,
                                Err(reason) => {
                                    warn!(url = %pending.url, %reason, "failed to load response body, dropping");
                                    continue;
                                }
                            };
                            let route = &routes[pending.route];
                            forward(
                                route,
                                &loop_token,
                                NetworkResponse {
                                    url: pending.url,
                                    url_pattern: route.pattern.clone(),
                                    body,
                                },
                            )
                            .await;
                        }
                    }
                    maybe = failed.next() => {
                        let Some(event) = maybe else { break };
                        cache.remove(event.request_id.inner().as_str());
                    }
                }
            }
            cache.clear();
            // Route senders drop here; listener channels observe closure
            // once the dispatcher releases its own senders.
        });

        Ok(RunningRouter { token, task })
    }
}

async fn load_body(
    page: &Page,
    request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
) -> Result<Vec<u8>, String> {
    let resp = page
        .execute(GetResponseBodyParams::new(request_id.clone()))
        .await
        .map_err(|e| e.to_string())?;
    if resp.result.base64_encoded {
        base64::engine::general_purpose::STANDARD
            .decode(resp.result.body.as_bytes())
            .map_err(|e| format!("invalid base64 body: {e}"))
    } else {
        Ok(resp.result.body.clone().into_bytes())
    }
}

/// Handle to a running router. Cancels the event loop and waits for it,
/// guaranteeing the route senders are dropped before the worker releases
/// its page.
pub struct RunningRouter {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningRouter {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}
