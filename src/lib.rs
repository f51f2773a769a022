//! Natural-language questions over registered tables, answered
//! deterministically: a versioned data dictionary maps business phrases to
//! canonical metrics, a table-scoped fuzzy resolver builds a fully specified
//! query plan, and a polars executor runs it with cache, truncation and
//! provenance guarantees. The language model is boxed in at two points only,
//! intent classification and response phrasing.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dictionary;
pub mod error;
pub mod executor;
pub mod fuzzy;
pub mod llm;
pub mod pipeline;
pub mod plan;
pub mod resolver;
pub mod result_cache;
pub mod table_source;

pub use error::{Result, TabulaError};
pub use pipeline::{Pipeline, PipelineOutcome, QueryResponse};
