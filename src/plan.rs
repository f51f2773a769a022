//! The fully resolved query plan and its execution result.
//!
//! A `QueryPlan` is built once by the resolver, is immutable afterward, and is
//! the *only* input the executor accepts. Every field that shapes the output
//! participates in the cache key; nothing query-shaping travels outside the
//! plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Whitelisted filter operators. Anything else fails deserialization, so an
/// unsupported operator can never reach the executor as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "LIKE")]
    Like,
}

/// Structured filter condition. Filters are never parsed from or concatenated
/// into strings anywhere in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
}

impl TimeGrain {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
        }
    }
}

/// Relative period reference for period-over-period comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodRef {
    CurrentDay,
    PreviousDay,
    CurrentWeek,
    PreviousWeek,
    CurrentMonth,
    PreviousMonth,
    SameMonthLastYear,
}

/// How a metric's value should be presented downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Number,
    Currency,
    Percent,
    Date,
}

/// A metric selected into a plan, with its resolution audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedMetric {
    pub name: String,
    pub expression: String,
    pub alias_matched: String,
    pub match_score: f64,
    pub base_match_score: f64,
    pub context_boost: f64,
    pub context_boost_reasons: Vec<String>,
    pub requires: Vec<String>,
    pub format: OutputFormat,
}

/// One candidate offered for disambiguation or suggested on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCandidate {
    pub metric: String,
    pub table: String,
    pub alias_matched: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub table: String,
    pub metrics: Vec<PlannedMetric>,
    pub filters: Vec<FilterCondition>,
    /// Physical columns the executor will load for this plan.
    pub columns: Vec<String>,
    pub group_by: Vec<String>,
    pub order_by: Option<OrderBy>,
    /// Always present; never implicitly unlimited.
    pub limit: usize,
    /// True when a requested "top N" exceeded the ranking cap.
    pub limit_capped: bool,
    pub time_column: Option<String>,
    pub time_grain: Option<TimeGrain>,
    pub baseline_period: Option<PeriodRef>,
    pub compare_period: Option<PeriodRef>,
}

impl QueryPlan {
    /// Stable cache key: SHA-256 of the canonical (sorted-keys) JSON of every
    /// plan field. `order_by`, `limit` and `columns` are included so two plans
    /// differing only in shape never collide.
    pub fn cache_key(&self) -> String {
        let value = serde_json::to_value(self).expect("plan serialization is infallible");
        let canonical = canonical_json(&value);
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Render a JSON value with object keys in sorted order, recursively.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string key"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Which physical backend actually served a result. Never omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    LocalCsv,
    RemoteStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub table_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count_returned: usize,
    pub row_count_before_limit: usize,
    pub rows_truncated: bool,
    pub data_source: DataSourceKind,
    pub execution_time_ms: f64,
    pub cache_hit: bool,
}
