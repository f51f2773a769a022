//! Deterministic query execution. The executor accepts a `QueryPlan` and
//! nothing else: filters, grouping, ordering and limits all come from the
//! plan, and the plan's canonical hash keys the result cache.

use crate::error::{Result, TabulaError};
use crate::plan::{
    DataSourceKind, FilterCondition, FilterOp, PeriodRef, QueryPlan, QueryResult, SortDirection,
    TimeGrain,
};
use crate::result_cache::ResultCache;
use crate::table_source::TableSourceResolver;
use chrono::{Datelike, NaiveDate, Weekday};
use polars::prelude::*;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Parsed form of a metric expression. The grammar is closed: COUNT/SUM/AVG,
/// optional DISTINCT, plus the repeat-entity form
/// `COUNT(DISTINCT col) FILTER (...)` meaning "entities appearing more than
/// once".
enum MetricExpr {
    Count { column: String },
    CountDistinct { column: String },
    Sum { column: String },
    Avg { column: String },
    RepeatEntities { column: String },
}

fn parse_metric_expression(expression: &str) -> Result<MetricExpr> {
    let re = Regex::new(r"(?i)^(COUNT|SUM|AVG)\s*\(\s*(DISTINCT\s+)?([A-Za-z0-9_]+)\s*\)")
        .expect("static regex");
    let caps = re.captures(expression.trim()).ok_or_else(|| {
        TabulaError::InvalidFilter(format!("unsupported metric expression: {expression}"))
    })?;

    let func = caps[1].to_uppercase();
    let distinct = caps.get(2).is_some();
    let column = caps[3].to_lowercase();
    let has_filter_clause = expression.to_uppercase().contains("FILTER");

    match (func.as_str(), distinct) {
        ("COUNT", true) if has_filter_clause => Ok(MetricExpr::RepeatEntities { column }),
        ("COUNT", true) => Ok(MetricExpr::CountDistinct { column }),
        ("COUNT", false) => Ok(MetricExpr::Count { column }),
        ("SUM", false) => Ok(MetricExpr::Sum { column }),
        ("AVG", false) => Ok(MetricExpr::Avg { column }),
        _ => Err(TabulaError::InvalidFilter(format!(
            "unsupported metric expression: {expression}"
        ))),
    }
}

impl MetricExpr {
    fn column(&self) -> &str {
        match self {
            MetricExpr::Count { column }
            | MetricExpr::CountDistinct { column }
            | MetricExpr::Sum { column }
            | MetricExpr::Avg { column }
            | MetricExpr::RepeatEntities { column } => column,
        }
    }

    fn needs_numeric_input(&self) -> bool {
        matches!(self, MetricExpr::Sum { .. } | MetricExpr::Avg { .. })
    }
}

pub struct QueryExecutor {
    source: TableSourceResolver,
    cache: ResultCache,
}

impl QueryExecutor {
    pub fn new(source: TableSourceResolver) -> Self {
        Self {
            source,
            cache: ResultCache::new(),
        }
    }

    pub fn with_cache(source: TableSourceResolver, cache: ResultCache) -> Self {
        Self { source, cache }
    }

    pub async fn execute(&self, plan: &QueryPlan) -> Result<QueryResult> {
        let started = Instant::now();
        let cache_key = plan.cache_key();

        if let Some(mut cached) = self.cache.get(&cache_key) {
            debug!(table = %plan.table, key = %cache_key, "result cache hit");
            cached.cache_hit = true;
            cached.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
            return Ok(cached);
        }

        let (mut df, data_source) = self.source.load(&plan.table).await?;

        let metric_exprs: Vec<(String, MetricExpr)> = plan
            .metrics
            .iter()
            .map(|m| Ok((m.name.clone(), parse_metric_expression(&m.expression)?)))
            .collect::<Result<_>>()?;

        validate_plan_columns(&df, plan, &metric_exprs)?;

        // Structured filters, applied as lazy expressions.
        if !plan.filters.is_empty() {
            let mut lazy = df.lazy();
            for condition in &plan.filters {
                lazy = lazy.filter(filter_expr(condition)?);
            }
            df = lazy.collect()?;
        }
        if df.height() == 0 {
            return Err(TabulaError::EmptyResult {
                table: plan.table.clone(),
            });
        }

        // Hygiene runs on the filtered rows: dirty values the plan's own
        // filters exclude cannot fail the query.
        validate_no_nulls_or_nans(&df, plan, &metric_exprs)?;

        df = derive_time_buckets(df, plan)?;
        df = restrict_to_compare_periods(df, plan)?;
        if df.height() == 0 {
            return Err(TabulaError::EmptyResult {
                table: plan.table.clone(),
            });
        }

        let mut result_df = if metric_exprs.is_empty() {
            let selected: Vec<Expr> = plan.columns.iter().map(|c| col(c)).collect();
            if selected.is_empty() {
                df
            } else {
                df.lazy().select(selected).collect()?
            }
        } else if plan.group_by.is_empty() {
            aggregate_global(&df, &metric_exprs)?
        } else {
            aggregate_grouped(&df, &plan.group_by, &metric_exprs)?
        };

        result_df = apply_ordering(result_df, plan)?;

        let row_count_before_limit = result_df.height();
        result_df = result_df.head(Some(plan.limit));
        let row_count_returned = result_df.height();
        let rows_truncated = row_count_before_limit > row_count_returned;
        if rows_truncated {
            warn!(
                table = %plan.table,
                before = row_count_before_limit,
                returned = row_count_returned,
                limit = plan.limit,
                "result truncated by plan limit"
            );
        }

        if row_count_returned == 0 {
            return Err(TabulaError::EmptyResult {
                table: plan.table.clone(),
            });
        }

        let (columns, rows) = dataframe_to_rows(&result_df)?;
        let result = QueryResult {
            table_id: format!("t_{}", &Uuid::new_v4().simple().to_string()[..8]),
            columns,
            rows,
            row_count_returned,
            row_count_before_limit,
            rows_truncated,
            data_source,
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: false,
        };

        self.cache.put(cache_key, result.clone());
        Ok(result)
    }
}

/// The union of physical columns a plan touches.
fn referenced_columns(plan: &QueryPlan, metrics: &[(String, MetricExpr)]) -> BTreeSet<String> {
    let mut referenced: BTreeSet<String> = plan.columns.iter().cloned().collect();
    for condition in &plan.filters {
        referenced.insert(condition.column.clone());
    }
    for key in &plan.group_by {
        referenced.insert(bucket_base_column(key).unwrap_or(key.as_str()).to_string());
    }
    if let Some(time_column) = &plan.time_column {
        referenced.insert(time_column.clone());
    }
    for (_, expr) in metrics {
        referenced.insert(expr.column().to_string());
    }
    referenced
}

fn validate_plan_columns(
    df: &DataFrame,
    plan: &QueryPlan,
    metrics: &[(String, MetricExpr)],
) -> Result<()> {
    let present: BTreeSet<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let missing: Vec<String> = referenced_columns(plan, metrics)
        .into_iter()
        .filter(|c| !present.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(TabulaError::InvalidFilter(format!(
            "columns missing from table '{}': {missing:?}",
            plan.table
        )));
    }

    for (name, expr) in metrics {
        if expr.needs_numeric_input() {
            let dtype = df.column(expr.column())?.dtype();
            if !is_numeric_dtype(dtype) {
                return Err(TabulaError::TypeMismatch {
                    column: expr.column().to_string(),
                    reason: format!("metric '{name}' needs a numeric column, found {dtype}"),
                });
            }
        }
    }
    Ok(())
}

/// Strict data hygiene: nulls in any referenced column are a typed failure,
/// and columns feeding metric arithmetic must be NaN-free. Never coerced or
/// propagated into output.
fn validate_no_nulls_or_nans(
    df: &DataFrame,
    plan: &QueryPlan,
    metrics: &[(String, MetricExpr)],
) -> Result<()> {
    for column in referenced_columns(plan, metrics) {
        let series = df.column(&column)?;
        let nulls = series.null_count();
        if nulls > 0 {
            return Err(TabulaError::TypeMismatch {
                column,
                reason: format!("{nulls} null values"),
            });
        }
    }
    for (_, expr) in metrics {
        if !expr.needs_numeric_input() {
            continue;
        }
        let series = df.column(expr.column())?;
        let has_nan = match series.dtype() {
            DataType::Float64 => series.f64()?.into_iter().flatten().any(f64::is_nan),
            DataType::Float32 => series.f32()?.into_iter().flatten().any(f32::is_nan),
            _ => false,
        };
        if has_nan {
            return Err(TabulaError::TypeMismatch {
                column: expr.column().to_string(),
                reason: "NaN values present".to_string(),
            });
        }
    }
    Ok(())
}

fn is_numeric_dtype(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

fn filter_expr(condition: &FilterCondition) -> Result<Expr> {
    let column = condition.column.as_str();
    match condition.operator {
        FilterOp::Gt | FilterOp::Lt | FilterOp::Ge | FilterOp::Le => {
            let number = condition.value.as_f64().ok_or_else(|| {
                TabulaError::TypeMismatch {
                    column: column.to_string(),
                    reason: format!(
                        "comparison filter requires a numeric value, got {}",
                        condition.value
                    ),
                }
            })?;
            Ok(match condition.operator {
                FilterOp::Gt => col(column).gt(lit(number)),
                FilterOp::Lt => col(column).lt(lit(number)),
                FilterOp::Ge => col(column).gt_eq(lit(number)),
                _ => col(column).lt_eq(lit(number)),
            })
        }
        FilterOp::Eq | FilterOp::Ne => {
            let literal = scalar_lit(column, &condition.value)?;
            Ok(if condition.operator == FilterOp::Eq {
                col(column).eq(literal)
            } else {
                col(column).neq(literal)
            })
        }
        FilterOp::In => {
            let items = condition.value.as_array().ok_or_else(|| {
                TabulaError::InvalidFilter("IN operator requires a list value".to_string())
            })?;
            if items.is_empty() {
                return Err(TabulaError::InvalidFilter(
                    "IN operator requires a non-empty list".to_string(),
                ));
            }
            let mut expr: Option<Expr> = None;
            for item in items {
                let branch = col(column).eq(scalar_lit(column, item)?);
                expr = Some(match expr {
                    Some(acc) => acc.or(branch),
                    None => branch,
                });
            }
            Ok(expr.expect("non-empty IN list"))
        }
        FilterOp::Like => {
            let pattern = condition.value.as_str().ok_or_else(|| {
                TabulaError::InvalidFilter("LIKE operator requires a string value".to_string())
            })?;
            // SQL LIKE -> anchored case-insensitive regex: % => .*, _ => .
            let escaped = regex::escape(pattern).replace('%', ".*").replace('_', ".");
            let regex_pattern = format!("(?i)^{escaped}$");
            Ok(col(column)
                .cast(DataType::String)
                .str()
                .contains(lit(regex_pattern), false))
        }
    }
}

fn scalar_lit(column: &str, value: &Value) -> Result<Expr> {
    match value {
        Value::String(s) => Ok(lit(s.clone())),
        Value::Bool(b) => Ok(lit(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(lit(i))
            } else {
                Ok(lit(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        other => Err(TabulaError::InvalidFilter(format!(
            "unsupported filter value for column '{column}': {other}"
        ))),
    }
}

/// `order_date__month` -> `order_date` when the suffix is a known grain.
fn bucket_base_column(name: &str) -> Option<&str> {
    for grain in ["__day", "__week", "__month"] {
        if let Some(base) = name.strip_suffix(grain) {
            if !base.is_empty() {
                return Some(base);
            }
        }
    }
    None
}

fn bucket_grain(name: &str) -> Option<TimeGrain> {
    if name.ends_with("__day") {
        Some(TimeGrain::Day)
    } else if name.ends_with("__week") {
        Some(TimeGrain::Week)
    } else if name.ends_with("__month") {
        Some(TimeGrain::Month)
    } else {
        None
    }
}

fn grain_format(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Day => "%Y-%m-%d",
        TimeGrain::Week => "%G-W%V",
        TimeGrain::Month => "%Y-%m",
    }
}

fn time_bucket_expr(df: &DataFrame, column: &str, grain: TimeGrain, alias: &str) -> Result<Expr> {
    let dtype = df.column(column)?.dtype().clone();
    let as_date = match dtype {
        DataType::Date | DataType::Datetime(_, _) => col(column),
        DataType::String => col(column).str().to_date(StrptimeOptions {
            strict: false,
            ..Default::default()
        }),
        other => {
            return Err(TabulaError::TypeMismatch {
                column: column.to_string(),
                reason: format!("cannot bucket by time grain on dtype {other}"),
            })
        }
    };
    Ok(as_date.dt().to_string(grain_format(grain)).alias(alias))
}

/// Materialize `<col>__<grain>` bucket columns needed by group_by or by the
/// period comparison.
fn derive_time_buckets(df: DataFrame, plan: &QueryPlan) -> Result<DataFrame> {
    let mut wanted: Vec<(String, String, TimeGrain)> = Vec::new();

    for key in &plan.group_by {
        if let (Some(base), Some(grain)) = (bucket_base_column(key), bucket_grain(key)) {
            wanted.push((key.clone(), base.to_string(), grain));
        }
    }
    if let (Some(time_column), Some(grain)) = (&plan.time_column, plan.time_grain) {
        let alias = format!("{time_column}__{}", grain.as_str());
        if !wanted.iter().any(|(name, _, _)| name == &alias) {
            wanted.push((alias, time_column.clone(), grain));
        }
    }
    if wanted.is_empty() {
        return Ok(df);
    }

    let mut exprs = Vec::with_capacity(wanted.len());
    for (alias, base, grain) in &wanted {
        exprs.push(time_bucket_expr(&df, base, *grain, alias)?);
    }
    Ok(df.lazy().with_columns(exprs).collect()?)
}

/// Keep only rows whose time bucket falls in the baseline or compare period.
/// The "current" period is anchored at the maximum bucket observed in data.
fn restrict_to_compare_periods(df: DataFrame, plan: &QueryPlan) -> Result<DataFrame> {
    let (Some(time_column), Some(grain)) = (&plan.time_column, plan.time_grain) else {
        return Ok(df);
    };
    let (Some(baseline), Some(compare)) = (plan.baseline_period, plan.compare_period) else {
        return Ok(df);
    };

    let bucket = format!("{time_column}__{}", grain.as_str());
    let labels = df.column(&bucket)?.str()?;
    let current = labels
        .into_iter()
        .flatten()
        .max()
        .ok_or_else(|| TabulaError::TypeMismatch {
            column: bucket.clone(),
            reason: "no time bucket values present".to_string(),
        })?
        .to_string();

    let baseline_label = period_label(&current, grain, baseline)?;
    let compare_label = period_label(&current, grain, compare)?;

    let keep = col(&bucket)
        .eq(lit(baseline_label))
        .or(col(&bucket).eq(lit(compare_label)));
    Ok(df.lazy().filter(keep).collect()?)
}

/// Resolve a relative period reference to a concrete bucket label, given the
/// label of the current (max observed) period.
fn period_label(current: &str, grain: TimeGrain, period: PeriodRef) -> Result<String> {
    let mismatch = || {
        TabulaError::InvalidFilter(format!(
            "period reference {period:?} is not valid for grain {}",
            grain.as_str()
        ))
    };
    match grain {
        TimeGrain::Month => {
            let (year, month) = current
                .split_once('-')
                .and_then(|(y, m)| Some((y.parse::<i32>().ok()?, m.parse::<u32>().ok()?)))
                .ok_or_else(|| TabulaError::TypeMismatch {
                    column: "time bucket".to_string(),
                    reason: format!("unparseable month label '{current}'"),
                })?;
            let months_back = match period {
                PeriodRef::CurrentMonth => 0,
                PeriodRef::PreviousMonth => 1,
                PeriodRef::SameMonthLastYear => 12,
                _ => return Err(mismatch()),
            };
            let total = (year * 12 + month as i32 - 1) - months_back;
            Ok(format!("{:04}-{:02}", total.div_euclid(12), total.rem_euclid(12) + 1))
        }
        TimeGrain::Day => {
            let date = NaiveDate::parse_from_str(current, "%Y-%m-%d").map_err(|_| {
                TabulaError::TypeMismatch {
                    column: "time bucket".to_string(),
                    reason: format!("unparseable day label '{current}'"),
                }
            })?;
            let days_back = match period {
                PeriodRef::CurrentDay => 0,
                PeriodRef::PreviousDay => 1,
                _ => return Err(mismatch()),
            };
            Ok((date - chrono::Duration::days(days_back)).format("%Y-%m-%d").to_string())
        }
        TimeGrain::Week => {
            let (year, week) = current
                .split_once("-W")
                .and_then(|(y, w)| Some((y.parse::<i32>().ok()?, w.parse::<u32>().ok()?)))
                .ok_or_else(|| TabulaError::TypeMismatch {
                    column: "time bucket".to_string(),
                    reason: format!("unparseable week label '{current}'"),
                })?;
            let weeks_back = match period {
                PeriodRef::CurrentWeek => 0,
                PeriodRef::PreviousWeek => 1,
                _ => return Err(mismatch()),
            };
            let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(|| {
                TabulaError::TypeMismatch {
                    column: "time bucket".to_string(),
                    reason: format!("invalid ISO week '{current}'"),
                }
            })?;
            let target = monday - chrono::Duration::weeks(weeks_back);
            let iso = target.iso_week();
            Ok(format!("{:04}-W{:02}", iso.year(), iso.week()))
        }
    }
}

fn aggregate_global(df: &DataFrame, metrics: &[(String, MetricExpr)]) -> Result<DataFrame> {
    let mut series_list: Vec<Series> = Vec::with_capacity(metrics.len());
    for (name, expr) in metrics {
        let series = match expr {
            MetricExpr::Count { column } => {
                let s = df.column(column)?;
                Series::new(name, vec![(s.len() - s.null_count()) as i64])
            }
            MetricExpr::CountDistinct { column } => {
                Series::new(name, vec![df.column(column)?.n_unique()? as i64])
            }
            MetricExpr::Sum { column } => {
                let total = df
                    .column(column)?
                    .cast(&DataType::Float64)?
                    .f64()?
                    .sum()
                    .unwrap_or(0.0);
                Series::new(name, vec![total])
            }
            MetricExpr::Avg { column } => {
                let mean = df.column(column)?.mean().unwrap_or(0.0);
                Series::new(name, vec![mean])
            }
            MetricExpr::RepeatEntities { column } => {
                let repeats = df
                    .clone()
                    .lazy()
                    .group_by(vec![col(column)])
                    .agg(vec![len().alias("__count")])
                    .filter(col("__count").gt(lit(1)))
                    .collect()?
                    .height();
                Series::new(name, vec![repeats as i64])
            }
        };
        series_list.push(series);
    }
    Ok(DataFrame::new(series_list)?)
}

fn aggregate_grouped(
    df: &DataFrame,
    group_by: &[String],
    metrics: &[(String, MetricExpr)],
) -> Result<DataFrame> {
    let keys: Vec<Expr> = group_by.iter().map(|k| col(k)).collect();

    // Each metric is computed as its own per-key frame, then inner-joined on
    // the group keys. This lets the repeat-entity form coexist with plain
    // aggregates in one plan.
    let mut acc: Option<LazyFrame> = None;
    for (name, expr) in metrics {
        let frame = match expr {
            MetricExpr::Count { column } => df
                .clone()
                .lazy()
                .group_by(keys.clone())
                .agg(vec![col(column).count().alias(name)]),
            MetricExpr::CountDistinct { column } => df
                .clone()
                .lazy()
                .group_by(keys.clone())
                .agg(vec![col(column).n_unique().alias(name)]),
            MetricExpr::Sum { column } => df
                .clone()
                .lazy()
                .group_by(keys.clone())
                .agg(vec![col(column).sum().alias(name)]),
            MetricExpr::Avg { column } => df
                .clone()
                .lazy()
                .group_by(keys.clone())
                .agg(vec![col(column).mean().alias(name)]),
            MetricExpr::RepeatEntities { column } => {
                let mut inner_keys = keys.clone();
                inner_keys.push(col(column));
                df.clone()
                    .lazy()
                    .group_by(inner_keys)
                    .agg(vec![len().alias("__count")])
                    .filter(col("__count").gt(lit(1)))
                    .group_by(keys.clone())
                    .agg(vec![len().alias(name)])
            }
        };
        acc = Some(match acc {
            None => frame,
            Some(joined) => joined.join(
                frame,
                keys.clone(),
                keys.clone(),
                JoinArgs::new(JoinType::Inner),
            ),
        });
    }

    let mut select_exprs = keys;
    for (name, _) in metrics {
        select_exprs.push(col(name));
    }
    Ok(acc
        .expect("at least one metric in grouped aggregation")
        .select(select_exprs)
        .collect()?)
}

fn apply_ordering(df: DataFrame, plan: &QueryPlan) -> Result<DataFrame> {
    if let Some(order_by) = &plan.order_by {
        if !df.get_column_names().iter().any(|c| *c == order_by.column) {
            return Err(TabulaError::InvalidFilter(format!(
                "order_by column '{}' not present in result",
                order_by.column
            )));
        }
        let descending = order_by.direction == SortDirection::Desc;
        return Ok(df
            .lazy()
            .sort_by_exprs(
                vec![col(&order_by.column)],
                SortMultipleOptions::default().with_order_descending(descending),
            )
            .collect()?);
    }
    // Deterministic fallback: order grouped output by the first group key.
    if let Some(first_key) = plan.group_by.first() {
        return Ok(df
            .lazy()
            .sort_by_exprs(vec![col(first_key)], SortMultipleOptions::default())
            .collect()?);
    }
    Ok(df)
}

fn dataframe_to_rows(df: &DataFrame) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let mut row = Vec::with_capacity(columns.len());
        for name in &columns {
            row.push(any_value_to_json(df.column(name)?.get(i)?));
        }
        rows.push(row);
    }
    Ok((columns, rows))
}

fn any_value_to_json(value: AnyValue) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => json!(b),
        AnyValue::String(s) => json!(s),
        AnyValue::StringOwned(s) => json!(s.to_string()),
        AnyValue::Int8(v) => json!(v),
        AnyValue::Int16(v) => json!(v),
        AnyValue::Int32(v) => json!(v),
        AnyValue::Int64(v) => json!(v),
        AnyValue::UInt8(v) => json!(v),
        AnyValue::UInt16(v) => json!(v),
        AnyValue::UInt32(v) => json!(v),
        AnyValue::UInt64(v) => json!(v),
        AnyValue::Float32(v) => json!(v),
        AnyValue::Float64(v) => json!(v),
        AnyValue::Date(days) => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date");
            json!((epoch + chrono::Duration::days(days as i64)).to_string())
        }
        other => json!(other.to_string()),
    }
}
