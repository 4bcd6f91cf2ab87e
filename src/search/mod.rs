//! Search backend access.
//!
//! A typed Elasticsearch client speaking the plain HTTP API. The engine
//! only needs the wire contract (index lifecycle, bulk NDJSON, KNN
//! search, scroll); a dedicated client crate would bring none of that for
//! free, so the contract is implemented directly over reqwest.

mod typed;

pub use typed::{BulkIndexerConfig, BulkStats, DocumentSink, SearchError, TypedEsClient};
