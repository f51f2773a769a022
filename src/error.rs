use crate::plan::MetricCandidate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TabulaError {
    #[error("No registered table matched: requested {requested:?}, known {known:?}")]
    NoTableMatch {
        requested: Vec<String>,
        known: Vec<String>,
    },

    #[error("No metric matched above the fuzzy floor for '{question}'")]
    UnresolvedMetric {
        question: String,
        suggestions: Vec<MetricCandidate>,
    },

    #[error("Ambiguous metric for '{question}': {} candidates", candidates.len())]
    AmbiguousMetric {
        question: String,
        candidates: Vec<MetricCandidate>,
    },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Type mismatch in column '{column}': {reason}")]
    TypeMismatch { column: String, reason: String },

    #[error("Query produced zero rows for table '{table}'")]
    EmptyResult { table: String },

    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("Dictionary error: {0}")]
    Dictionary(String),

    #[error("Stage '{stage}' failed: {reason}")]
    ToolExecutionFailed { stage: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for TabulaError {
    fn from(err: polars::error::PolarsError) -> Self {
        TabulaError::Polars(err.to_string())
    }
}

impl TabulaError {
    /// Stable machine-readable code for checkpoints and API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            TabulaError::NoTableMatch { .. } => "NO_TABLE_MATCH",
            TabulaError::UnresolvedMetric { .. } => "UNRESOLVED_METRIC",
            TabulaError::AmbiguousMetric { .. } => "AMBIGUOUS_METRIC",
            TabulaError::InvalidFilter(_) => "INVALID_FILTER",
            TabulaError::TypeMismatch { .. } => "TYPE_MISMATCH",
            TabulaError::EmptyResult { .. } => "EMPTY_RESULT",
            TabulaError::StageTimeout { .. } => "STAGE_TIMEOUT",
            TabulaError::Dictionary(_) => "DICTIONARY_ERROR",
            TabulaError::ToolExecutionFailed { .. } => "TOOL_EXECUTION_FAILED",
            TabulaError::Io(_) => "IO_ERROR",
            TabulaError::Json(_) => "JSON_ERROR",
            TabulaError::Polars(_) => "POLARS_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TabulaError>;
