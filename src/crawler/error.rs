//! Crawler error taxonomy.
//!
//! Per-operation failures are recovered inside the dispatcher; only
//! startup errors and the aggregate of a `perform_all_url_operations`
//! call reach the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("browser pool: {0}")]
    Pool(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("element not found for {selector}: {reason}")]
    ElementNotFound { selector: String, reason: String },
    #[error("script evaluation failed: {reason}")]
    Evaluation { reason: String },
    #[error("page interaction failed: {reason}")]
    Action { reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("worker panicked: {0}")]
    WorkerPanic(String),
    #[error("{count} operation error(s) occurred: [{details}]")]
    Aggregate { count: usize, details: String },
}

impl CrawlerError {
    /// Fold per-operation errors into the single aggregate returned by
    /// `perform_all_url_operations`. `None` when nothing failed.
    pub fn aggregate(errors: Vec<CrawlerError>) -> Option<CrawlerError> {
        if errors.is_empty() {
            return None;
        }
        let details = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Some(CrawlerError::Aggregate {
            count: errors.len(),
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_none() {
        assert!(CrawlerError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn aggregate_counts_and_joins() {
        let err = CrawlerError::aggregate(vec![
            CrawlerError::Cancelled,
            CrawlerError::Evaluation {
                reason: "boom".to_string(),
            },
        ])
        .unwrap();
        let text = err.to_string();
        assert!(text.starts_with("2 operation error(s)"));
        assert!(text.contains("cancelled"));
        assert!(text.contains("boom"));
    }
}
