//! Semantic resolution: free-text question -> fully specified `QueryPlan`.
//!
//! Matching is strictly table-scoped. Each candidate table is scored against
//! its own alias index and nothing else, so a question about one domain can
//! never land on another domain's metric no matter how well it scores there.
//! Below the fuzzy floor nothing resolves; within the ambiguity margin the
//! user decides, not the code.

use crate::config::{
    AMBIGUITY_MARGIN, CONTEXT_BOOST_LAST_METRIC, CONTEXT_BOOST_LAST_TABLE, DEFAULT_ROW_LIMIT,
    FUZZY_MATCH_FLOOR, MAX_RANKING_LIMIT, MAX_SUGGESTIONS, PENALTY_PARTIAL_PHRASE,
    PENALTY_SHORT_ALIAS, PENALTY_SHORT_PHRASE_PERFECT, TOP_K_PER_TABLE,
};
use crate::context::ContextStore;
use crate::dictionary::DataDictionary;
use crate::error::{Result, TabulaError};
use crate::fuzzy;
use crate::llm::Intent;
use crate::plan::{
    FilterCondition, FilterOp, MetricCandidate, OrderBy, PeriodRef, PlannedMetric, QueryPlan,
    SortDirection, TimeGrain,
};
use itertools::Itertools;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const STOPWORDS: &[&str] = &[
    "el", "la", "los", "las", "un", "una", "unos", "unas", "de", "del", "en", "por", "para",
    "con", "que", "cual", "cuales", "cuanto", "cuanta", "cuantos", "cuantas", "como", "donde",
    "cuando", "tenemos", "tengo", "hay", "es", "son", "fue", "mi", "mis", "tu", "tus", "se",
    "al", "lo", "y", "o", "the", "a", "an", "of", "in", "on", "for", "with", "what", "which",
    "how", "many", "much", "do", "we", "have", "has", "is", "are", "was", "me", "dame",
    "muestra", "muestrame", "show", "give",
];

/// A successful resolution: the plan plus a calibrated confidence in it.
/// Confidence lives outside the plan so it never fragments the result cache.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub plan: QueryPlan,
    pub confidence: f64,
}

/// Best alias hit for one metric, with the phrase that earned it.
#[derive(Debug, Clone)]
struct ScoredCandidate {
    metric: String,
    table: String,
    alias: String,
    phrase: String,
    base_score: f64,
    boost: f64,
    boost_reasons: Vec<String>,
}

impl ScoredCandidate {
    fn score(&self) -> f64 {
        (self.base_score + self.boost).min(100.0)
    }
}

pub struct SemanticResolver {
    dictionary: Arc<DataDictionary>,
    context: Arc<dyn ContextStore>,
}

impl SemanticResolver {
    pub fn new(dictionary: Arc<DataDictionary>, context: Arc<dyn ContextStore>) -> Self {
        Self {
            dictionary,
            context,
        }
    }

    /// Resolve a question against the caller's registered tables.
    ///
    /// `conversation_id` enables disambiguation follow-ups and context boosts;
    /// without it every call is a fresh, context-free resolution.
    pub fn resolve(
        &self,
        question: &str,
        available_tables: &[String],
        conversation_id: Option<&str>,
        intent: Intent,
    ) -> Result<Resolution> {
        let candidate_tables = self.candidate_tables(available_tables)?;
        let normalized = fuzzy::normalize(question);

        // A numbered or named answer to a pending disambiguation bypasses
        // fuzzy matching entirely.
        if let Some(conversation_id) = conversation_id {
            if let Some(chosen) = self.take_pending_answer(conversation_id, &normalized)? {
                info!(metric = %chosen.metric, "disambiguation answer selected a pending candidate");
                let candidate = ScoredCandidate {
                    metric: chosen.metric.clone(),
                    table: chosen.table.clone(),
                    alias: chosen.alias_matched.clone(),
                    phrase: normalized.clone(),
                    base_score: chosen.score,
                    boost: 0.0,
                    boost_reasons: vec![],
                };
                return self.build_resolution(
                    &candidate,
                    &normalized,
                    Some(conversation_id.to_string()),
                    intent,
                );
            }
        }

        let phrases = extract_phrases(&normalized);
        let mut candidates = self.score_tables(&candidate_tables, &phrases);

        if let Some(conversation_id) = conversation_id {
            if is_followup(&normalized) {
                self.apply_context_boost(conversation_id, &mut candidates);
            }
        }

        candidates.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.metric.cmp(&b.metric))
        });

        let Some(best) = candidates.first() else {
            return Err(TabulaError::UnresolvedMetric {
                question: question.to_string(),
                suggestions: vec![],
            });
        };

        if best.base_score < FUZZY_MATCH_FLOOR {
            debug!(best = %best.metric, score = best.base_score, "best candidate below fuzzy floor");
            return Err(TabulaError::UnresolvedMetric {
                question: question.to_string(),
                suggestions: to_metric_candidates(&candidates, MAX_SUGGESTIONS),
            });
        }

        if let Some(second) = candidates.get(1) {
            if second.metric != best.metric && best.score() - second.score() < AMBIGUITY_MARGIN {
                let offered = to_metric_candidates(&candidates, MAX_SUGGESTIONS);
                if let Some(conversation_id) = conversation_id {
                    let pending = offered.clone();
                    self.context.update(conversation_id, &mut |ctx| {
                        ctx.pending_candidates = pending.clone();
                    });
                }
                return Err(TabulaError::AmbiguousMetric {
                    question: question.to_string(),
                    candidates: offered,
                });
            }
        }

        let best = best.clone();
        self.build_resolution(&best, &normalized, conversation_id.map(String::from), intent)
    }

    fn candidate_tables(&self, available: &[String]) -> Result<Vec<String>> {
        let known = self.dictionary.list_tables();
        let candidates: Vec<String> = available
            .iter()
            .filter(|t| known.contains(t))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(TabulaError::NoTableMatch {
                requested: available.to_vec(),
                known,
            });
        }
        Ok(candidates)
    }

    /// Consume a pending disambiguation if the question answers it: a bare
    /// numeral "1".."N" or an exact canonical metric name.
    fn take_pending_answer(
        &self,
        conversation_id: &str,
        normalized: &str,
    ) -> Result<Option<MetricCandidate>> {
        let pending = self.context.get(conversation_id).pending_candidates;
        if pending.is_empty() {
            return Ok(None);
        }

        let chosen = if let Ok(index) = normalized.parse::<usize>() {
            if index >= 1 && index <= pending.len() {
                Some(pending[index - 1].clone())
            } else {
                return Err(TabulaError::InvalidFilter(format!(
                    "disambiguation answer {index} is out of range 1..{}",
                    pending.len()
                )));
            }
        } else {
            pending
                .iter()
                .find(|c| fuzzy::normalize(&c.metric) == normalized)
                .cloned()
        };

        if chosen.is_some() {
            self.context.update(conversation_id, &mut |ctx| {
                ctx.pending_candidates.clear();
            });
        }
        Ok(chosen)
    }

    /// Score every candidate table independently against its own alias index
    /// and keep the top-K candidates per table.
    fn score_tables(&self, tables: &[String], phrases: &[String]) -> Vec<ScoredCandidate> {
        let mut all = Vec::new();
        for table in tables {
            let mut best_per_metric: HashMap<String, ScoredCandidate> = HashMap::new();
            for entry in self.dictionary.alias_index(table) {
                for phrase in phrases {
                    let score = fuzzy::similarity(phrase, &entry.alias);
                    let current = best_per_metric.get(&entry.metric);
                    if current.map_or(true, |c| score > c.base_score) {
                        best_per_metric.insert(
                            entry.metric.clone(),
                            ScoredCandidate {
                                metric: entry.metric.clone(),
                                table: table.clone(),
                                alias: entry.alias.clone(),
                                phrase: phrase.clone(),
                                base_score: score,
                                boost: 0.0,
                                boost_reasons: vec![],
                            },
                        );
                    }
                }
            }
            let mut table_candidates: Vec<ScoredCandidate> = best_per_metric.into_values().collect();
            table_candidates.sort_by(|a, b| {
                b.base_score
                    .partial_cmp(&a.base_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.metric.cmp(&b.metric))
            });
            table_candidates.truncate(TOP_K_PER_TABLE);
            all.extend(table_candidates);
        }
        all
    }

    /// Bounded context boost for follow-up questions. Applied only on top of
    /// a base score that already clears the floor: context never rescues a
    /// match the text itself does not support.
    fn apply_context_boost(&self, conversation_id: &str, candidates: &mut [ScoredCandidate]) {
        let ctx = self.context.get(conversation_id);
        for candidate in candidates.iter_mut() {
            if candidate.base_score < FUZZY_MATCH_FLOOR {
                continue;
            }
            if ctx.last_metric.as_deref() == Some(candidate.metric.as_str()) {
                candidate.boost += CONTEXT_BOOST_LAST_METRIC;
                candidate.boost_reasons.push("last_metric".to_string());
            }
            if ctx.last_table.as_deref() == Some(candidate.table.as_str()) {
                candidate.boost += CONTEXT_BOOST_LAST_TABLE;
                candidate.boost_reasons.push("last_table".to_string());
            }
        }
    }

    fn build_resolution(
        &self,
        candidate: &ScoredCandidate,
        normalized_question: &str,
        conversation_id: Option<String>,
        intent: Intent,
    ) -> Result<Resolution> {
        let metric = self
            .dictionary
            .get_metric(&candidate.metric)
            .ok_or_else(|| TabulaError::Dictionary(format!("metric '{}' vanished", candidate.metric)))?;
        let table = self
            .dictionary
            .get_table(&candidate.table)
            .ok_or_else(|| TabulaError::Dictionary(format!("table '{}' vanished", candidate.table)))?;

        let mut filters = metric.filters.clone();
        filters.extend(extract_value_filters(normalized_question, table, &filters));

        let mut columns = metric.requires.clone();
        for filter in &filters {
            if !columns.contains(&filter.column) {
                columns.push(filter.column.clone());
            }
        }

        let planned = PlannedMetric {
            name: candidate.metric.clone(),
            expression: metric.expression.clone(),
            alias_matched: candidate.alias.clone(),
            match_score: candidate.score(),
            base_match_score: candidate.base_score,
            context_boost: candidate.boost,
            context_boost_reasons: candidate.boost_reasons.clone(),
            requires: metric.requires.clone(),
            format: metric.format,
        };

        let mut plan = QueryPlan {
            table: candidate.table.clone(),
            metrics: vec![planned],
            filters,
            columns,
            group_by: vec![],
            order_by: None,
            limit: DEFAULT_ROW_LIMIT,
            limit_capped: false,
            time_column: None,
            time_grain: None,
            baseline_period: None,
            compare_period: None,
        };

        if let Some((requested, capped)) = extract_top_n(normalized_question) {
            plan.order_by = Some(OrderBy {
                column: candidate.metric.clone(),
                direction: SortDirection::Desc,
            });
            plan.limit = requested;
            plan.limit_capped = capped;
        }

        if intent == Intent::ComparePeriods {
            let time_column = table.time_column.clone().ok_or_else(|| {
                TabulaError::InvalidFilter(format!(
                    "table '{}' has no time column for a period comparison",
                    candidate.table
                ))
            })?;
            let grain = detect_time_grain(normalized_question);
            let (baseline, compare) = detect_periods(normalized_question, grain);
            let bucket = format!("{time_column}__{}", grain.as_str());
            if !plan.columns.contains(&time_column) {
                plan.columns.push(time_column.clone());
            }
            plan.group_by = vec![bucket.clone()];
            plan.order_by = Some(OrderBy {
                column: bucket,
                direction: SortDirection::Asc,
            });
            plan.time_column = Some(time_column);
            plan.time_grain = Some(grain);
            plan.baseline_period = Some(baseline);
            plan.compare_period = Some(compare);
        }

        if let Some(conversation_id) = conversation_id {
            let metric_name = candidate.metric.clone();
            let table_name = candidate.table.clone();
            let alias = candidate.alias.clone();
            self.context.update(&conversation_id, &mut |ctx| {
                ctx.last_metric = Some(metric_name.clone());
                ctx.last_table = Some(table_name.clone());
                ctx.last_alias = Some(alias.clone());
                ctx.pending_candidates.clear();
            });
        }

        let confidence = confidence_for(candidate, normalized_question);
        debug!(
            metric = %candidate.metric,
            table = %candidate.table,
            score = candidate.score(),
            confidence,
            plan = %json!({"table": plan.table, "group_by": plan.group_by, "limit": plan.limit}),
            "built query plan"
        );
        Ok(Resolution { plan, confidence })
    }
}

/// Calibrated confidence in [0, 1]. The fuzzy score is the base; penalties
/// account for the ways a high score can overstate certainty.
fn confidence_for(candidate: &ScoredCandidate, normalized_question: &str) -> f64 {
    let mut confidence = candidate.score() / 100.0;
    if candidate.alias.len() <= 5 {
        confidence -= PENALTY_SHORT_ALIAS;
    }
    if candidate.base_score >= 99.5 && candidate.phrase.len() <= 10 {
        confidence -= PENALTY_SHORT_PHRASE_PERFECT;
    }
    if candidate.phrase != normalized_question {
        confidence -= PENALTY_PARTIAL_PHRASE;
    }
    if candidate.boost > 0.0 {
        confidence -= (0.06 + candidate.boost / 100.0).min(0.18);
    }
    confidence.clamp(0.0, 1.0)
}

/// Candidate phrases from a normalized question: content unigrams, bigrams
/// and trigrams over content words, plus the whole question.
fn extract_phrases(normalized: &str) -> Vec<String> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let content: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .collect();

    let mut phrases: Vec<String> = Vec::new();
    for token in &content {
        phrases.push((*token).to_string());
    }
    for window in content.windows(2) {
        phrases.push(window.join(" "));
    }
    for window in content.windows(3) {
        phrases.push(window.join(" "));
    }
    if !normalized.is_empty() {
        phrases.push(normalized.to_string());
    }
    phrases.into_iter().unique().collect()
}

/// Short-text heuristic for follow-up turns.
fn is_followup(normalized: &str) -> bool {
    normalized.len() <= 14
        || normalized.starts_with("y ")
        || normalized.contains("lo mismo")
        || normalized.contains("tambien")
        || normalized.contains("ahora")
}

/// Deterministic filter extraction: a question naming an enumerated column
/// value verbatim gets that filter. No guessing beyond declared values.
fn extract_value_filters(
    normalized_question: &str,
    table: &crate::dictionary::TableDefinition,
    existing: &[FilterCondition],
) -> Vec<FilterCondition> {
    let mut extracted = Vec::new();
    let question_tokens: Vec<&str> = normalized_question.split_whitespace().collect();

    let mut column_names: Vec<&String> = table.columns.keys().collect();
    column_names.sort();

    for column in column_names {
        if existing.iter().any(|f| &f.column == column) {
            continue;
        }
        let Some(values) = table.columns[column].values.as_ref() else {
            continue;
        };
        for value in values {
            let normalized_value = fuzzy::normalize(value);
            if question_tokens.contains(&normalized_value.as_str()) {
                extracted.push(FilterCondition {
                    column: column.clone(),
                    operator: FilterOp::Eq,
                    value: json!(value),
                });
                break;
            }
        }
    }
    extracted
}

/// "top N" / "primeros N" / "mejores N" with the ranking cap applied.
fn extract_top_n(normalized: &str) -> Option<(usize, bool)> {
    let re = Regex::new(r"(?:top|primeros|mejores)\s+(\d+)").expect("static regex");
    let n: usize = re.captures(normalized)?.get(1)?.as_str().parse().ok()?;
    if n == 0 {
        return None;
    }
    if n > MAX_RANKING_LIMIT {
        Some((MAX_RANKING_LIMIT, true))
    } else {
        Some((n, false))
    }
}

fn detect_time_grain(normalized: &str) -> TimeGrain {
    if normalized.contains("semana") || normalized.contains("week") {
        TimeGrain::Week
    } else if normalized.contains("dia") || normalized.contains("day") || normalized.contains("ayer")
    {
        TimeGrain::Day
    } else {
        TimeGrain::Month
    }
}

fn detect_periods(normalized: &str, grain: TimeGrain) -> (PeriodRef, PeriodRef) {
    if grain == TimeGrain::Month
        && (normalized.contains("ano pasado")
            || normalized.contains("last year")
            || normalized.contains("yoy"))
    {
        return (PeriodRef::SameMonthLastYear, PeriodRef::CurrentMonth);
    }
    match grain {
        TimeGrain::Day => (PeriodRef::PreviousDay, PeriodRef::CurrentDay),
        TimeGrain::Week => (PeriodRef::PreviousWeek, PeriodRef::CurrentWeek),
        TimeGrain::Month => (PeriodRef::PreviousMonth, PeriodRef::CurrentMonth),
    }
}

fn to_metric_candidates(candidates: &[ScoredCandidate], limit: usize) -> Vec<MetricCandidate> {
    candidates
        .iter()
        .take(limit)
        .map(|c| MetricCandidate {
            metric: c.metric.clone(),
            table: c.table.clone(),
            alias_matched: c.alias.clone(),
            score: c.score(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryContextStore;
    use crate::dictionary::fixtures;

    fn resolver() -> SemanticResolver {
        let dictionary =
            Arc::new(DataDictionary::from_value(fixtures::dictionary_json()).unwrap());
        SemanticResolver::new(dictionary, Arc::new(InMemoryContextStore::new()))
    }

    fn orders() -> Vec<String> {
        vec!["orders".to_string()]
    }

    /// Dictionary with two metrics whose aliases collide on "ventas".
    fn ambiguous_resolver() -> SemanticResolver {
        let mut doc = fixtures::dictionary_json();
        doc["metrics"]["ventas_netas"] = serde_json::json!({
            "description": "Net sales",
            "table": "orders",
            "expression": "SUM(order_total)",
            "requires": ["order_total"],
            "aliases": ["ventas netas"],
            "format": "currency"
        });
        doc["metrics"]["ventas_brutas"] = serde_json::json!({
            "description": "Gross sales",
            "table": "orders",
            "expression": "SUM(order_total)",
            "requires": ["order_total"],
            "aliases": ["ventas brutas"],
            "format": "currency"
        });
        let dictionary = Arc::new(DataDictionary::from_value(doc).unwrap());
        SemanticResolver::new(dictionary, Arc::new(InMemoryContextStore::new()))
    }

    #[test]
    fn test_repeat_customers_scenario() {
        let resolution = resolver()
            .resolve("¿cuántos clientes recurrentes tenemos?", &orders(), None, Intent::AggregateMetrics)
            .unwrap();
        let plan = resolution.plan;
        assert_eq!(plan.table, "orders");
        assert_eq!(plan.metrics[0].name, "repeat_customers");
        assert!(plan.filters.iter().any(|f| {
            f.column == "order_status"
                && f.operator == FilterOp::Eq
                && f.value == json!("delivered")
        }));
        assert_eq!(plan.limit, DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn test_unknown_table_is_no_table_match() {
        let err = resolver()
            .resolve("ventas totales", &["ghost_table".to_string()], None, Intent::QueryData)
            .unwrap_err();
        assert_eq!(err.code(), "NO_TABLE_MATCH");
    }

    #[test]
    fn test_floor_enforced_with_suggestions() {
        let err = resolver()
            .resolve("flurbo quantum zorp", &orders(), None, Intent::QueryData)
            .unwrap_err();
        match err {
            TabulaError::UnresolvedMetric { suggestions, .. } => {
                assert!(suggestions.len() <= MAX_SUGGESTIONS);
            }
            other => panic!("expected UnresolvedMetric, got {other:?}"),
        }
    }

    #[test]
    fn test_no_cross_domain_leakage() {
        // "reproducciones" is a listening_history alias; scoped to orders it
        // must fail rather than match the other table.
        let err = resolver()
            .resolve("reproducciones", &orders(), None, Intent::QueryData)
            .unwrap_err();
        match err {
            TabulaError::UnresolvedMetric { suggestions, .. } => {
                assert!(suggestions.iter().all(|s| s.table == "orders"));
            }
            other => panic!("expected UnresolvedMetric, got {other:?}"),
        }
    }

    #[test]
    fn test_ambiguity_within_margin() {
        let err = ambiguous_resolver()
            .resolve("ventas", &orders(), None, Intent::QueryData)
            .unwrap_err();
        match err {
            TabulaError::AmbiguousMetric { candidates, .. } => {
                assert!(candidates.len() >= 2);
                let names: Vec<&str> = candidates.iter().map(|c| c.metric.as_str()).collect();
                assert!(names.contains(&"ventas_netas"));
                assert!(names.contains(&"ventas_brutas"));
                // Ordered by descending score.
                assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));
            }
            other => panic!("expected AmbiguousMetric, got {other:?}"),
        }
    }

    #[test]
    fn test_ambiguity_is_idempotent() {
        let resolver = ambiguous_resolver();
        let first = match resolver.resolve("ventas", &orders(), None, Intent::QueryData) {
            Err(TabulaError::AmbiguousMetric { candidates, .. }) => candidates,
            other => panic!("expected AmbiguousMetric, got {other:?}"),
        };
        let second = match resolver.resolve("ventas", &orders(), None, Intent::QueryData) {
            Err(TabulaError::AmbiguousMetric { candidates, .. }) => candidates,
            other => panic!("expected AmbiguousMetric, got {other:?}"),
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_disambiguation_round_trip_by_number() {
        let resolver = ambiguous_resolver();
        let candidates = match resolver.resolve("ventas", &orders(), Some("c1"), Intent::QueryData)
        {
            Err(TabulaError::AmbiguousMetric { candidates, .. }) => candidates,
            other => panic!("expected AmbiguousMetric, got {other:?}"),
        };

        let resolution = resolver
            .resolve("1", &orders(), Some("c1"), Intent::QueryData)
            .unwrap();
        assert_eq!(resolution.plan.metrics[0].name, candidates[0].metric);
    }

    #[test]
    fn test_disambiguation_round_trip_by_name() {
        let resolver = ambiguous_resolver();
        let _ = resolver.resolve("ventas", &orders(), Some("c1"), Intent::QueryData);

        let resolution = resolver
            .resolve("ventas_brutas", &orders(), Some("c1"), Intent::QueryData)
            .unwrap();
        assert_eq!(resolution.plan.metrics[0].name, "ventas_brutas");

        // Candidates are consumed: a second numbered answer has nothing to
        // select, so it falls through to normal resolution and fails.
        assert!(resolver
            .resolve("1", &orders(), Some("c1"), Intent::QueryData)
            .is_err());
    }

    #[test]
    fn test_out_of_range_disambiguation_answer() {
        let resolver = ambiguous_resolver();
        let _ = resolver.resolve("ventas", &orders(), Some("c1"), Intent::QueryData);
        let err = resolver
            .resolve("9", &orders(), Some("c1"), Intent::QueryData)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_FILTER");
    }

    #[test]
    fn test_top_n_is_capped_and_flagged() {
        let resolution = resolver()
            .resolve("top 100 ventas totales", &orders(), None, Intent::QueryData)
            .unwrap();
        assert_eq!(resolution.plan.limit, MAX_RANKING_LIMIT);
        assert!(resolution.plan.limit_capped);
        assert_eq!(
            resolution.plan.order_by.as_ref().unwrap().direction,
            SortDirection::Desc
        );

        let resolution = resolver()
            .resolve("top 5 ventas totales", &orders(), None, Intent::QueryData)
            .unwrap();
        assert_eq!(resolution.plan.limit, 5);
        assert!(!resolution.plan.limit_capped);
    }

    #[test]
    fn test_compare_periods_plan_shape() {
        let resolution = resolver()
            .resolve(
                "compara las ventas totales con el mes pasado",
                &orders(),
                None,
                Intent::ComparePeriods,
            )
            .unwrap();
        let plan = resolution.plan;
        assert_eq!(plan.time_column.as_deref(), Some("order_date"));
        assert_eq!(plan.time_grain, Some(TimeGrain::Month));
        assert_eq!(plan.baseline_period, Some(PeriodRef::PreviousMonth));
        assert_eq!(plan.compare_period, Some(PeriodRef::CurrentMonth));
        assert_eq!(plan.group_by, vec!["order_date__month".to_string()]);
    }

    #[test]
    fn test_compare_against_last_year() {
        let resolution = resolver()
            .resolve(
                "compara los ingresos con el año pasado",
                &orders(),
                None,
                Intent::ComparePeriods,
            )
            .unwrap();
        assert_eq!(resolution.plan.baseline_period, Some(PeriodRef::SameMonthLastYear));
    }

    #[test]
    fn test_value_word_filter_extraction() {
        let resolution = resolver()
            .resolve("cantidad de pedidos pending", &orders(), None, Intent::AggregateMetrics)
            .unwrap();
        assert!(resolution.plan.filters.iter().any(|f| {
            f.column == "order_status" && f.value == json!("pending")
        }));
    }

    #[test]
    fn test_context_boost_is_audited_not_silent() {
        let resolver = resolver();
        let _ = resolver
            .resolve("ventas totales", &orders(), Some("c1"), Intent::QueryData)
            .unwrap();

        // Short follow-up naming the same metric again gets a boost, and the
        // audit fields separate base score from boost.
        let resolution = resolver
            .resolve("y los ingresos", &orders(), Some("c1"), Intent::QueryData)
            .unwrap();
        let metric = &resolution.plan.metrics[0];
        assert_eq!(metric.name, "total_revenue");
        assert!(metric.context_boost > 0.0);
        assert!(metric.match_score >= metric.base_match_score);
        assert!(!metric.context_boost_reasons.is_empty());
    }

    #[test]
    fn test_boost_never_rescues_below_floor() {
        let resolver = resolver();
        let _ = resolver
            .resolve("ventas totales", &orders(), Some("c1"), Intent::QueryData)
            .unwrap();
        // Gibberish follow-up: context exists but the base score is below the
        // floor, so the boost must not apply and resolution must fail.
        let err = resolver
            .resolve("y el zorp", &orders(), Some("c1"), Intent::QueryData)
            .unwrap_err();
        assert_eq!(err.code(), "UNRESOLVED_METRIC");
    }

    #[test]
    fn test_confidence_in_unit_range() {
        let resolution = resolver()
            .resolve("ventas totales", &orders(), None, Intent::QueryData)
            .unwrap();
        assert!(resolution.confidence > 0.0 && resolution.confidence <= 1.0);
    }
}
