//! netharvest - parallel headless-browser crawling engine.
//!
//! Drives a pool of long-lived Chrome instances through per-URL interaction
//! recipes (scroll, click, xclick) while hijacking their network traffic.
//! Responses matched against URL patterns flow through listener channels
//! into a decode -> embed -> bulk-index pipeline backed by Elasticsearch.
//!
//! The crate is a library; entry binaries are expected to be thin wiring:
//! parse a [`config::Config`], build a [`browser::BrowserPoolProvider`] (or
//! [`browser::PagePoolProvider`]), attach consumers for each listener
//! channel, then run [`crawler::ParallelCrawler::perform_all_url_operations`].

pub mod browser;
pub mod config;
pub mod crawler;
pub mod embedding;
pub mod models;
pub mod pipeline;
pub mod search;

pub use browser::{BrowserPoolProvider, PagePoolProvider};
pub use crawler::{
    CrawlerError, ListenerConfig, NetworkResponse, OperationType, ParallelCrawler, UrlOperation,
};
pub use pipeline::{spawn_indexed_consumer, spawn_observer_consumer, EmbedIndexPipeline};
