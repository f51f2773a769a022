//! End-to-end pipeline tests over real CSV files: resolution, execution,
//! disambiguation round-trips and the checkpoint trail.

use tabula::checkpoint::{CheckpointLedger, CheckpointStatus, InMemoryCheckpointStorage};
use tabula::context::InMemoryContextStore;
use tabula::dictionary::DataDictionary;
use tabula::executor::QueryExecutor;
use tabula::llm::{ClassifiedIntent, Intent, IntentClassifier, ResponseComposer, TemplateComposer};
use tabula::pipeline::{Pipeline, PipelineOutcome};
use tabula::resolver::SemanticResolver;
use tabula::table_source::TableSourceResolver;
use tabula::Result;

use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tabula::checkpoint::Checkpoint;
use uuid::Uuid;

fn dictionary_doc() -> serde_json::Value {
    json!({
        "version": "2.1",
        "tables": {
            "orders": {
                "description": "One row per order",
                "grain": "order",
                "primary_key": "order_id",
                "time_column": "order_date",
                "columns": {
                    "order_id": {"data_type": "string"},
                    "customer_id": {"data_type": "string"},
                    "order_total": {"data_type": "float"},
                    "order_status": {"data_type": "string", "values": ["delivered", "cancelled", "pending"]},
                    "order_date": {"data_type": "date"}
                }
            }
        },
        "metrics": {
            "total_revenue": {
                "description": "Sum of delivered order totals",
                "table": "orders",
                "expression": "SUM(order_total)",
                "requires": ["order_total"],
                "filters": [{"column": "order_status", "operator": "=", "value": "delivered"}],
                "aliases": ["ventas totales", "revenue", "ingresos"],
                "format": "currency"
            },
            "repeat_customers": {
                "description": "Customers with more than one delivered order",
                "table": "orders",
                "expression": "COUNT(DISTINCT customer_id) FILTER (WHERE order_count > 1)",
                "requires": ["customer_id"],
                "filters": [{"column": "order_status", "operator": "=", "value": "delivered"}],
                "aliases": ["clientes recurrentes", "returning customers"],
                "format": "number"
            },
            "ventas_netas": {
                "description": "Net sales",
                "table": "orders",
                "expression": "SUM(order_total)",
                "requires": ["order_total"],
                "aliases": ["ventas netas"],
                "format": "currency"
            },
            "ventas_brutas": {
                "description": "Gross sales",
                "table": "orders",
                "expression": "SUM(order_total)",
                "requires": ["order_total"],
                "aliases": ["ventas brutas"],
                "format": "currency"
            }
        }
    })
}

/// Write an orders.csv with `n` delivered rows, a few per customer.
fn create_orders_csv(data_dir: &PathBuf, n: usize) {
    std::fs::create_dir_all(data_dir).unwrap();
    let mut csv = String::from("order_id,customer_id,order_total,order_status,order_date\n");
    for i in 0..n {
        let day = (i % 28) + 1;
        writeln!(
            csv,
            "o{i},c{},{}.0,delivered,2026-07-{day:02}",
            i % 40,
            10 + (i % 90)
        )
        .unwrap();
    }
    std::fs::write(data_dir.join("orders.csv"), csv).unwrap();
}

struct FixedClassifier(Intent);

#[async_trait]
impl IntentClassifier for FixedClassifier {
    async fn classify(&self, _question: &str) -> Result<ClassifiedIntent> {
        Ok(ClassifiedIntent {
            intent: self.0,
            confidence: 0.92,
        })
    }
}

struct TrailComposer;

#[async_trait]
impl ResponseComposer for TrailComposer {
    async fn compose(&self, checkpoints: &[Checkpoint], _question: &str) -> Result<String> {
        let execution = checkpoints
            .iter()
            .find(|c| c.stage.starts_with("query_execution"));
        match execution {
            Some(c) => Ok(format!(
                "rows={} truncated={}",
                c.output["row_count_returned"], c.output["rows_truncated"]
            )),
            None => Ok("no data".to_string()),
        }
    }
}

fn build_pipeline(intent: Intent, data_dir: PathBuf) -> Pipeline {
    let dictionary = Arc::new(DataDictionary::from_value(dictionary_doc()).unwrap());
    Pipeline::new(
        SemanticResolver::new(dictionary, Arc::new(InMemoryContextStore::new())),
        QueryExecutor::new(TableSourceResolver::new(data_dir, None)),
        Arc::new(FixedClassifier(intent)),
        Arc::new(TrailComposer),
        CheckpointLedger::new(Arc::new(InMemoryCheckpointStorage::new())),
    )
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("tabula-e2e-{}", Uuid::new_v4()))
}

fn orders() -> Vec<String> {
    vec!["orders".to_string()]
}

#[tokio::test]
async fn full_pipeline_answers_revenue_question() {
    let dir = temp_dir();
    create_orders_csv(&dir, 50);
    let pipeline = build_pipeline(Intent::AggregateMetrics, dir.clone());

    let response = pipeline
        .execute_query("¿cuáles son las ventas totales?", &orders(), Some("conv-1"))
        .await
        .unwrap();

    match &response.outcome {
        PipelineOutcome::Answer(text) => assert!(text.starts_with("rows=")),
        other => panic!("expected Answer, got {other:?}"),
    }
    assert_eq!(response.intent, Intent::AggregateMetrics);
    assert_eq!(response.checkpoints.len(), 4);

    // The resolve checkpoint carries the audited plan.
    let resolve = &response.checkpoints[1];
    assert_eq!(resolve.output["plan"]["table"], json!("orders"));
    assert_eq!(
        resolve.output["plan"]["metrics"][0]["name"],
        json!("total_revenue")
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn truncation_is_visible_end_to_end() {
    let dir = temp_dir();
    create_orders_csv(&dir, 6435);
    let pipeline = build_pipeline(Intent::QueryData, dir.clone());

    // "top 10" limits the plan; listing a raw column query would too, but the
    // ranking path exercises the cap machinery as well.
    let response = pipeline
        .execute_query("top 10 ventas totales", &orders(), Some("conv-t"))
        .await
        .unwrap();

    let execute = response
        .checkpoints
        .iter()
        .find(|c| c.stage.starts_with("query_execution"))
        .unwrap();
    assert_eq!(execute.status, CheckpointStatus::Ok);
    // A global aggregate yields one row; the limit applies to result rows,
    // not input rows, so nothing is truncated here.
    assert_eq!(execute.output["rows_truncated"], json!(false));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn row_limit_truncates_wide_results() {
    use tabula::plan::QueryPlan;
    let dir = temp_dir();
    create_orders_csv(&dir, 6435);

    let executor = QueryExecutor::new(TableSourceResolver::new(dir.clone(), None));
    let plan = QueryPlan {
        table: "orders".to_string(),
        metrics: vec![],
        filters: vec![],
        columns: vec!["order_id".to_string(), "order_total".to_string()],
        group_by: vec![],
        order_by: None,
        limit: 10,
        limit_capped: false,
        time_column: None,
        time_grain: None,
        baseline_period: None,
        compare_period: None,
    };
    let result = executor.execute(&plan).await.unwrap();
    assert_eq!(result.row_count_returned, 10);
    assert_eq!(result.row_count_before_limit, 6435);
    assert!(result.rows_truncated);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn disambiguation_round_trip_through_pipeline() {
    let dir = temp_dir();
    create_orders_csv(&dir, 20);
    let pipeline = build_pipeline(Intent::QueryData, dir.clone());

    let first = pipeline
        .execute_query("ventas", &orders(), Some("conv-d"))
        .await
        .unwrap();
    let candidates = match &first.outcome {
        PipelineOutcome::Disambiguation { prompt, candidates } => {
            assert!(prompt.contains("1."));
            candidates.clone()
        }
        other => panic!("expected Disambiguation, got {other:?}"),
    };
    assert!(candidates.len() >= 2);

    // Same conversation, numbered answer: resolves to the first candidate and
    // runs the rest of the pipeline.
    let second = pipeline
        .execute_query("1", &orders(), Some("conv-d"))
        .await
        .unwrap();
    assert!(matches!(second.outcome, PipelineOutcome::Answer(_)));
    let resolve = second
        .checkpoints
        .iter()
        .filter(|c| c.stage.starts_with("semantic_resolution"))
        .last()
        .unwrap();
    assert_eq!(
        resolve.output["plan"]["metrics"][0]["name"],
        json!(candidates[0].metric.as_str())
    );

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn disambiguation_in_another_conversation_is_isolated() {
    let dir = temp_dir();
    create_orders_csv(&dir, 20);
    let pipeline = build_pipeline(Intent::QueryData, dir.clone());

    let _ = pipeline
        .execute_query("ventas", &orders(), Some("conv-a"))
        .await
        .unwrap();

    // A numbered answer in a different conversation has no pending candidates
    // to consume; it must not resolve.
    let err = pipeline
        .execute_query("1", &orders(), Some("conv-b"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "UNRESOLVED_METRIC");

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn checkpoint_trail_is_chronological_per_conversation() {
    let dir = temp_dir();
    create_orders_csv(&dir, 20);
    let pipeline = build_pipeline(Intent::AggregateMetrics, dir.clone());

    let _ = pipeline
        .execute_query("ventas totales", &orders(), Some("conv-x"))
        .await
        .unwrap();
    let _ = pipeline
        .execute_query("clientes recurrentes", &orders(), Some("conv-x"))
        .await
        .unwrap();

    let trail = pipeline.checkpoints("conv-x").unwrap();
    assert_eq!(trail.len(), 8);
    assert!(trail.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn repeat_customers_counts_only_multi_order_customers() {
    let dir = temp_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("orders.csv"),
        "order_id,customer_id,order_total,order_status,order_date\n\
         o1,c1,10.0,delivered,2026-07-01\n\
         o2,c1,20.0,delivered,2026-07-02\n\
         o3,c2,30.0,delivered,2026-07-03\n\
         o4,c3,40.0,cancelled,2026-07-04\n\
         o5,c3,50.0,cancelled,2026-07-05\n",
    )
    .unwrap();
    let pipeline = build_pipeline(Intent::AggregateMetrics, dir.clone());

    let response = pipeline
        .execute_query("¿cuántos clientes recurrentes tenemos?", &orders(), Some("conv-r"))
        .await
        .unwrap();

    let execute = response
        .checkpoints
        .iter()
        .find(|c| c.stage.starts_with("query_execution"))
        .unwrap();
    // c1 repeats among delivered orders; c3's repeats are cancelled and the
    // metric's built-in filter excludes them.
    assert_eq!(execute.output["rows"][0][0], json!(1));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn executor_cache_serves_repeat_question() {
    let dir = temp_dir();
    create_orders_csv(&dir, 100);
    let pipeline = build_pipeline(Intent::AggregateMetrics, dir.clone());

    let _ = pipeline
        .execute_query("ventas totales", &orders(), Some("conv-c"))
        .await
        .unwrap();
    let second = pipeline
        .execute_query("ventas totales", &orders(), Some("conv-c2"))
        .await
        .unwrap();

    let execute = second
        .checkpoints
        .iter()
        .find(|c| c.stage.starts_with("query_execution"))
        .unwrap();
    assert_eq!(execute.output["cache_hit"], json!(true));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn template_composer_round_trip() {
    let dir = temp_dir();
    create_orders_csv(&dir, 10);
    let dictionary = Arc::new(DataDictionary::from_value(dictionary_doc()).unwrap());
    let pipeline = Pipeline::new(
        SemanticResolver::new(dictionary, Arc::new(InMemoryContextStore::new())),
        QueryExecutor::new(TableSourceResolver::new(dir.clone(), None)),
        Arc::new(FixedClassifier(Intent::AggregateMetrics)),
        Arc::new(TemplateComposer::new()),
        CheckpointLedger::new(Arc::new(InMemoryCheckpointStorage::new())),
    );

    let response = pipeline
        .execute_query("ventas totales", &orders(), None)
        .await
        .unwrap();
    match response.outcome {
        PipelineOutcome::Answer(text) => assert!(text.contains("total_revenue")),
        other => panic!("expected Answer, got {other:?}"),
    }

    let _ = std::fs::remove_dir_all(&dir);
}
