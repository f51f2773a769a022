//! Physical data source resolution: a local canonical CSV matched by exact
//! table name, with a remote paginated store as fallback. The choice is
//! logged at the point of decision and carried on every result — a source
//! switch is never silent.

use crate::config::{EXTERNAL_CALL_TIMEOUT, REMOTE_PAGE_SIZE};
use crate::error::{Result, TabulaError};
use crate::plan::DataSourceKind;
use polars::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Remote paginated row store, spoken over HTTP as
/// `GET {base}/tables/{name}/rows?offset=&limit=` returning a JSON array of
/// row objects. Pages are fetched sequentially; each await between batches is
/// a cancellation point for a caller that times the request out.
pub struct RemoteTableStore {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
}

impl RemoteTableStore {
    pub fn new(base_url: String) -> Self {
        Self::with_options(base_url, REMOTE_PAGE_SIZE, EXTERNAL_CALL_TIMEOUT)
    }

    pub fn with_options(base_url: String, page_size: usize, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client construction");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size,
        }
    }

    pub async fn fetch_all(&self, table: &str) -> Result<DataFrame> {
        let mut rows: Vec<Value> = Vec::new();
        let mut offset = 0usize;

        loop {
            let url = format!(
                "{}/tables/{}/rows?offset={}&limit={}",
                self.base_url, table, offset, self.page_size
            );
            let batch: Vec<Value> = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| remote_err(table, e.to_string()))?
                .error_for_status()
                .map_err(|e| remote_err(table, e.to_string()))?
                .json()
                .await
                .map_err(|e| remote_err(table, e.to_string()))?;

            let batch_len = batch.len();
            rows.extend(batch);
            if batch_len < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        if rows.is_empty() {
            return Err(remote_err(table, "table is empty or unknown in remote store".to_string()));
        }
        rows_to_dataframe(&rows)
    }
}

fn remote_err(table: &str, reason: String) -> TabulaError {
    TabulaError::ToolExecutionFailed {
        stage: "query_execution".to_string(),
        reason: format!("remote store fetch for '{table}' failed: {reason}"),
    }
}

/// Build a DataFrame from JSON row objects, inferring one dtype per column:
/// all-integer -> i64, numeric -> f64, boolean -> bool, otherwise string.
fn rows_to_dataframe(rows: &[Value]) -> Result<DataFrame> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    let mut series_list: Vec<Series> = Vec::with_capacity(columns.len());
    for column in &columns {
        let values: Vec<&Value> = rows
            .iter()
            .map(|row| row.get(column).unwrap_or(&Value::Null))
            .collect();

        let non_null: Vec<&&Value> = values.iter().filter(|v| !v.is_null()).collect();
        let all_int = !non_null.is_empty() && non_null.iter().all(|v| v.is_i64() || v.is_u64());
        let all_num = !non_null.is_empty() && non_null.iter().all(|v| v.is_number());
        let all_bool = !non_null.is_empty() && non_null.iter().all(|v| v.is_boolean());

        let series = if all_int {
            Series::new(column, values.iter().map(|v| v.as_i64()).collect::<Vec<_>>())
        } else if all_num {
            Series::new(column, values.iter().map(|v| v.as_f64()).collect::<Vec<_>>())
        } else if all_bool {
            Series::new(column, values.iter().map(|v| v.as_bool()).collect::<Vec<_>>())
        } else {
            Series::new(
                column,
                values
                    .iter()
                    .map(|v| match v {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<_>>(),
            )
        };
        series_list.push(series);
    }

    Ok(DataFrame::new(series_list)?)
}

/// Resolves a table name to its physical backend and loads it.
pub struct TableSourceResolver {
    data_dir: PathBuf,
    remote: Option<RemoteTableStore>,
}

impl TableSourceResolver {
    pub fn new(data_dir: PathBuf, remote: Option<RemoteTableStore>) -> Self {
        Self { data_dir, remote }
    }

    /// Load a table, preferring the local canonical file. The local path is
    /// `<data_dir>/<table>.csv` by exact name — never a glob, so
    /// `orders_backup.csv` can never shadow `orders.csv`.
    pub async fn load(&self, table: &str) -> Result<(DataFrame, DataSourceKind)> {
        let path = self.data_dir.join(format!("{table}.csv"));
        if path.exists() {
            info!(table, path = %path.display(), "loading table from local canonical CSV");
            let df = LazyCsvReader::new(&path)
                .with_try_parse_dates(true)
                .with_infer_schema_length(Some(1000))
                .finish()?
                .collect()?;
            info!(table, rows = df.height(), "loaded table from local CSV");
            return Ok((df, DataSourceKind::LocalCsv));
        }

        if let Some(remote) = &self.remote {
            info!(table, "local canonical CSV absent, falling back to remote paginated store");
            let df = remote.fetch_all(table).await?;
            info!(table, rows = df.height(), "loaded table from remote store");
            return Ok((df, DataSourceKind::RemoteStore));
        }

        Err(TabulaError::ToolExecutionFailed {
            stage: "query_execution".to_string(),
            reason: format!(
                "table '{table}' not found in {} and no remote store is configured",
                self.data_dir.display()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_to_dataframe_infers_types() {
        let rows = vec![
            json!({"customer_id": "C1", "order_total": 10.5, "items": 2}),
            json!({"customer_id": "C2", "order_total": 3.0, "items": 1}),
        ];
        let df = rows_to_dataframe(&rows).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("customer_id").unwrap().dtype(), &DataType::String);
        assert_eq!(df.column("order_total").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("items").unwrap().dtype(), &DataType::Int64);
    }

    #[test]
    fn test_rows_to_dataframe_handles_missing_fields() {
        let rows = vec![json!({"a": 1, "b": "x"}), json!({"a": 2})];
        let df = rows_to_dataframe(&rows).unwrap();
        assert_eq!(df.column("b").unwrap().null_count(), 1);
    }

    #[tokio::test]
    async fn test_exact_name_resolution_ignores_lookalikes() {
        let dir = std::env::temp_dir().join(format!("tabula-src-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("orders_backup.csv"), "order_id\n1\n").unwrap();

        let resolver = TableSourceResolver::new(dir.clone(), None);
        let err = resolver.load("orders").await.unwrap_err();
        assert_eq!(err.code(), "TOOL_EXECUTION_FAILED");

        std::fs::write(dir.join("orders.csv"), "order_id,order_total\n1,10.5\n").unwrap();
        let (df, source) = resolver.load("orders").await.unwrap();
        assert_eq!(source, DataSourceKind::LocalCsv);
        assert_eq!(df.height(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
