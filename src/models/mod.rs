//! Domain records and their search-document projections.
//!
//! A decoder turns a hijacked response body into [`Crawlable`] records;
//! each record projects to a [`Document`] that the embed-index pipeline
//! vectorises and ships to the search backend.

mod job;

pub use job::{decode_listing_payload, JobListing, JobListingDoc};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A document indexable by the search backend.
///
/// The index name and mapping are per-type (one index per document type);
/// identity and the embedding slot are per-instance.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    /// Stable document identifier; the backend dedupes by it.
    fn id(&self) -> &str;

    /// Target index name.
    fn index_name() -> &'static str;

    /// Index mapping, including the `dense_vector` embedding field.
    /// `None` lets the backend infer a dynamic mapping.
    fn type_mapping() -> Option<serde_json::Value>;

    /// Text fed to the embedding model for this document.
    fn embedding_string(&self) -> String;

    fn set_embedding(&mut self, embedding: Vec<f32>);

    fn embedding(&self) -> Option<&[f32]>;
}

/// A source-specific record parsed out of a hijacked payload.
pub trait Crawlable: Send + Sync {
    type Doc: Document;

    fn to_document(&self) -> Self::Doc;
}
