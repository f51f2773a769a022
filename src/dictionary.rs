//! Versioned data dictionary: the canonical catalog of tables, columns and
//! metrics. Loaded once, validated fail-fast, read-only afterward. The
//! resolver never invents a metric: it only maps phrases onto what is
//! declared here.

use crate::error::{Result, TabulaError};
use crate::fuzzy;
use crate::plan::{FilterCondition, OutputFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub data_type: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Enumerated values a user may name directly in a question
    /// (e.g. order statuses). Used for deterministic filter extraction.
    #[serde(default)]
    pub values: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub description: String,
    pub grain: String,
    pub primary_key: String,
    #[serde(default)]
    pub time_column: Option<String>,
    pub columns: HashMap<String, ColumnSpec>,
    #[serde(default)]
    pub business_notes: Vec<String>,
    #[serde(default)]
    pub changelog: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub description: String,
    pub table: String,
    /// Aggregation expression, e.g. `SUM(order_total)`. The executor supports
    /// a closed grammar; columns are never inferred from this string.
    pub expression: String,
    /// Explicit list of physical columns this metric needs.
    pub requires: Vec<String>,
    /// Built-in filters applied whenever the metric is selected. Structured,
    /// never raw strings.
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    /// Free-text phrases users say for this metric.
    pub aliases: Vec<String>,
    pub format: OutputFormat,
    #[serde(default)]
    pub business_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DictionaryDocument {
    version: String,
    #[serde(default)]
    updated_at: Option<String>,
    tables: HashMap<String, TableDefinition>,
    metrics: HashMap<String, MetricDefinition>,
}

/// One alias entry in a table-scoped index.
#[derive(Debug, Clone)]
pub struct AliasEntry {
    pub alias: String,
    pub metric: String,
}

#[derive(Debug, Clone)]
pub struct DataDictionary {
    pub version: String,
    pub updated_at: Option<String>,
    tables: HashMap<String, TableDefinition>,
    metrics: HashMap<String, MetricDefinition>,
    /// One alias index per table, built at load time. Fuzzy matching always
    /// selects an index by table first; there is no global index to leak
    /// matches across domains.
    alias_indexes: HashMap<String, Vec<AliasEntry>>,
}

impl DataDictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let doc: DictionaryDocument = serde_json::from_str(&raw)
            .map_err(|e| TabulaError::Dictionary(format!("malformed dictionary document: {e}")))?;
        Self::from_document(doc)
    }

    /// Build from an in-memory JSON value. Used by tests and embedded setups.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let doc: DictionaryDocument = serde_json::from_value(value)
            .map_err(|e| TabulaError::Dictionary(format!("malformed dictionary document: {e}")))?;
        Self::from_document(doc)
    }

    fn from_document(doc: DictionaryDocument) -> Result<Self> {
        if doc.version.trim().is_empty() {
            return Err(TabulaError::Dictionary("dictionary version is empty".to_string()));
        }

        for (metric_name, metric) in &doc.metrics {
            let table = doc.tables.get(&metric.table).ok_or_else(|| {
                TabulaError::Dictionary(format!(
                    "metric '{metric_name}' references unknown table '{}'",
                    metric.table
                ))
            })?;
            for required in &metric.requires {
                if !table.columns.contains_key(required) {
                    return Err(TabulaError::Dictionary(format!(
                        "metric '{metric_name}' requires column '{required}' missing from table '{}'",
                        metric.table
                    )));
                }
            }
            for filter in &metric.filters {
                if !table.columns.contains_key(&filter.column) {
                    return Err(TabulaError::Dictionary(format!(
                        "metric '{metric_name}' filter references column '{}' missing from table '{}'",
                        filter.column, metric.table
                    )));
                }
            }
            if metric.aliases.iter().any(|a| a.trim().is_empty()) {
                return Err(TabulaError::Dictionary(format!(
                    "metric '{metric_name}' declares an empty alias"
                )));
            }
        }

        let alias_indexes = build_alias_indexes(&doc)?;

        Ok(DataDictionary {
            version: doc.version,
            updated_at: doc.updated_at,
            tables: doc.tables,
            metrics: doc.metrics,
            alias_indexes,
        })
    }

    pub fn get_table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(name)
    }

    pub fn get_metric(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.get(name)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// The table-scoped alias index. Empty slice for unknown tables.
    pub fn alias_index(&self, table: &str) -> &[AliasEntry] {
        self.alias_indexes.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn build_alias_indexes(doc: &DictionaryDocument) -> Result<HashMap<String, Vec<AliasEntry>>> {
    let mut indexes: HashMap<String, Vec<AliasEntry>> = HashMap::new();

    for (metric_name, metric) in &doc.metrics {
        let index = indexes.entry(metric.table.clone()).or_default();

        let mut variants: Vec<String> = vec![fuzzy::normalize(metric_name)];
        for alias in &metric.aliases {
            variants.push(fuzzy::normalize(alias));
        }
        variants.sort();
        variants.dedup();

        for variant in variants {
            if let Some(existing) = index.iter().find(|e| e.alias == variant) {
                if existing.metric != *metric_name {
                    return Err(TabulaError::Dictionary(format!(
                        "alias '{variant}' in table '{}' maps to both '{}' and '{metric_name}'",
                        metric.table, existing.metric
                    )));
                }
                continue;
            }
            index.push(AliasEntry {
                alias: variant,
                metric: metric_name.clone(),
            });
        }
    }

    for index in indexes.values_mut() {
        index.sort_by(|a, b| a.alias.cmp(&b.alias));
    }

    Ok(indexes)
}
