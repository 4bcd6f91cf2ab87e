//! Concurrent crawl orchestration: operation parameters, the hijack
//! router, the per-operation executor and the worker dispatcher.

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod hijack;
pub mod params;

pub use dispatcher::ParallelCrawler;
pub use error::CrawlerError;
pub use hijack::{pattern_matches, HijackRouter, RunningRouter};
pub use params::{ListenerConfig, NetworkResponse, OperationType, UrlOperation};
