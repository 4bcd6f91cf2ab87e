//! Operation parameters and the wire types flowing out of the hijack layer.

use tokio::sync::mpsc;

/// One unit of page interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Smooth-scroll towards the bottom of the page.
    Scroll,
    /// Click an element resolved once by CSS selector.
    Click,
    /// Click an element re-resolved by XPath before every click.
    XClick,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Scroll => f.write_str("scroll"),
            OperationType::Click => f.write_str("click"),
            OperationType::XClick => f.write_str("xclick"),
        }
    }
}

/// A matched response emitted by the hijack router. Each message has a
/// single owner; it moves through the listener channel exactly once.
#[derive(Debug, Clone)]
pub struct NetworkResponse {
    pub url: String,
    /// The pattern that matched `url`.
    pub url_pattern: String,
    pub body: Vec<u8>,
}

/// Listener wiring for one operation: the URL patterns to hijack and the
/// bounded channel matched responses are delivered on.
///
/// The caller keeps the matching receiver and hands it to a consumer. The
/// sender half registered here is owned by the dispatcher and dropped on
/// shutdown, which is what closes the channel; workers only ever hold
/// short-lived clones.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub url_patterns: Vec<String>,
    pub tx: mpsc::Sender<NetworkResponse>,
}

impl ListenerConfig {
    pub fn new(url_patterns: Vec<String>, tx: mpsc::Sender<NetworkResponse>) -> Self {
        Self { url_patterns, tx }
    }
}

/// A full recipe against a single URL: navigate, perform `num_actions`
/// interactions with randomised pacing, deliver matched responses to the
/// listener. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct UrlOperation {
    pub url: String,
    pub operation: OperationType,
    pub num_actions: u32,
    pub standard_sleep_secs: f64,
    pub random_delay_secs: f64,
    /// Required for `Click` (CSS) and `XClick` (XPath).
    pub click_selector: Option<String>,
    pub listener: ListenerConfig,
}

impl UrlOperation {
    /// Check the constraints an operation must satisfy before dispatch.
    /// Invalid operations are skipped with a warning, never dispatched.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("url is empty".to_string());
        }
        if self.num_actions == 0 {
            return Err("num_actions must be positive".to_string());
        }
        if !(self.standard_sleep_secs >= 0.0) {
            return Err("standard_sleep_secs must be non-negative".to_string());
        }
        if !(self.random_delay_secs >= 0.0) {
            return Err("random_delay_secs must be non-negative".to_string());
        }
        if matches!(self.operation, OperationType::Click | OperationType::XClick)
            && self
                .click_selector
                .as_deref()
                .map_or(true, |s| s.is_empty())
        {
            return Err(format!("{} requires a click_selector", self.operation));
        }
        if self.listener.url_patterns.is_empty() {
            return Err("listener has no url patterns".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> ListenerConfig {
        let (tx, _rx) = mpsc::channel(4);
        ListenerConfig::new(vec!["https://example.com/api/*".to_string()], tx)
    }

    fn scroll_op() -> UrlOperation {
        UrlOperation {
            url: "https://example.com".to_string(),
            operation: OperationType::Scroll,
            num_actions: 3,
            standard_sleep_secs: 1.0,
            random_delay_secs: 0.5,
            click_selector: None,
            listener: listener(),
        }
    }

    #[test]
    fn valid_scroll_passes() {
        assert!(scroll_op().validate().is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let mut op = scroll_op();
        op.url.clear();
        assert!(op.validate().is_err());
    }

    #[test]
    fn zero_actions_rejected() {
        let mut op = scroll_op();
        op.num_actions = 0;
        assert!(op.validate().is_err());
    }

    #[test]
    fn negative_pacing_rejected() {
        let mut op = scroll_op();
        op.random_delay_secs = -1.0;
        assert!(op.validate().is_err());
        let mut op = scroll_op();
        op.standard_sleep_secs = f64::NAN;
        assert!(op.validate().is_err());
    }

    #[test]
    fn click_requires_selector() {
        let mut op = scroll_op();
        op.operation = OperationType::Click;
        assert!(op.validate().is_err());
        op.click_selector = Some(String::new());
        assert!(op.validate().is_err());
        op.click_selector = Some(".next".to_string());
        assert!(op.validate().is_ok());

        let mut op = scroll_op();
        op.operation = OperationType::XClick;
        op.click_selector = Some("//a[text()='>']".to_string());
        assert!(op.validate().is_ok());
    }

    #[test]
    fn listener_without_patterns_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let mut op = scroll_op();
        op.listener = ListenerConfig::new(Vec::new(), tx);
        assert!(op.validate().is_err());
    }
}
