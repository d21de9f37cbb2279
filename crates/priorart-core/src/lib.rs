//! PriorArt Core - retrieval and scoring pipeline for patent claim similarity
//!
//! This crate provides:
//! - Record types and the 1-based id / 0-based index position mapping
//! - Text embedding with a bounded per-session cache (Candle BERT encoder)
//! - Exact flat vector index with a binary on-disk format
//! - SQLite metadata store with parameter-bound date and CPC filters
//! - Result assembly (post-ranking filters, truncation)
//! - Rejection probability calibration against historical scores
//! - The search pipeline that drives one query through all of the above

pub mod assemble;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod record;
pub mod scoring;
pub mod store;

// Re-export commonly used types
pub use assemble::{assemble, RankedRecord};
pub use config::{Calibration, DevicePreference, PipelineConfig};
pub use embeddings::{Embedder, TextEncoder};
pub use error::{PriorArtError, Result};
pub use index::{FlatIndex, Metric, SearchHit};
pub use pipeline::{
    NoProgress, PipelineStage, ProgressSink, QueryRequest, QueryResultRow, SearchOutcome,
    SearchPipeline,
};
pub use record::{CpcFilter, CpcOperator, DateRange, Record, RecordId, CLAIM_SEPARATOR};
pub use scoring::{EcdfPoint, ReferenceDistribution, ReferenceSummary, RejectionScorer};
pub use store::MetadataStore;
