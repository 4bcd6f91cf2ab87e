//! Downstream of the hijack layer: consumers draining listener channels
//! into the embed-index stage.

pub mod consumer;
pub mod embed_index;

pub use consumer::{spawn_indexed_consumer, spawn_observer_consumer, Decoder};
pub use embed_index::{EmbedIndexPipeline, PipelineSnapshot};
