//! Fixed-order pipeline: classify -> resolve -> execute -> compose. Each
//! stage writes exactly one checkpoint before the next stage may start, and a
//! failed stage stops the run with a typed error. Ambiguity is not a failure:
//! it suspends the turn and hands the numbered candidates back to the caller.

use crate::checkpoint::{Checkpoint, CheckpointLedger, CheckpointStatus};
use crate::config::EXTERNAL_CALL_TIMEOUT;
use crate::error::{Result, TabulaError};
use crate::executor::QueryExecutor;
use crate::llm::{Intent, IntentClassifier, ResponseComposer};
use crate::plan::MetricCandidate;
use crate::resolver::SemanticResolver;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const STAGE_CLASSIFY: &str = "intent_classification@1.0";
pub const STAGE_RESOLVE: &str = "semantic_resolution@1.0";
pub const STAGE_EXECUTE: &str = "query_execution@1.0";
pub const STAGE_COMPOSE: &str = "response_composition@1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Classifying,
    Resolving,
    Executing,
    Composing,
    AwaitingDisambiguation,
    Done,
    Failed,
}

/// What one turn hands back to the caller.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Answer(String),
    /// Resolution was ambiguous; the caller should present the numbered
    /// prompt and send the user's pick back on the next turn.
    Disambiguation {
        prompt: String,
        candidates: Vec<MetricCandidate>,
    },
    /// Intent was UNKNOWN; no data stage ran.
    NeedsClarification(String),
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub outcome: PipelineOutcome,
    pub intent: Intent,
    pub confidence: f64,
    pub conversation_id: String,
    pub checkpoints: Vec<Checkpoint>,
}

pub struct Pipeline {
    resolver: SemanticResolver,
    executor: QueryExecutor,
    classifier: Arc<dyn IntentClassifier>,
    composer: Arc<dyn ResponseComposer>,
    ledger: CheckpointLedger,
}

impl Pipeline {
    pub fn new(
        resolver: SemanticResolver,
        executor: QueryExecutor,
        classifier: Arc<dyn IntentClassifier>,
        composer: Arc<dyn ResponseComposer>,
        ledger: CheckpointLedger,
    ) -> Self {
        Self {
            resolver,
            executor,
            classifier,
            composer,
            ledger,
        }
    }

    /// The single programmatic entrypoint: one question in, one structured
    /// response (answer, disambiguation or clarification) out, with the full
    /// checkpoint trail attached.
    pub async fn execute_query(
        &self,
        question: &str,
        available_tables: &[String],
        conversation_id: Option<&str>,
    ) -> Result<QueryResponse> {
        let conversation_id = conversation_id
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        transition(&conversation_id, PipelineState::Classifying);
        info!(%conversation_id, question, "pipeline start");

        // CLASSIFYING
        let stage_start = Instant::now();
        let classified = match with_timeout(STAGE_CLASSIFY, self.classifier.classify(question)).await
        {
            Ok(classified) => {
                self.ledger.log(
                    &conversation_id,
                    STAGE_CLASSIFY,
                    json!({"question": question}),
                    json!({"intent": classified.intent.as_str(), "confidence": classified.confidence}),
                    CheckpointStatus::Ok,
                    elapsed_ms(stage_start),
                )?;
                classified
            }
            Err(err) => {
                return self.fail(&conversation_id, STAGE_CLASSIFY, json!({"question": question}), stage_start, err);
            }
        };

        if classified.intent == Intent::Unknown {
            // Terminal for this turn. UNKNOWN never defaults to a data query.
            transition(&conversation_id, PipelineState::Done);
            return Ok(QueryResponse {
                outcome: PipelineOutcome::NeedsClarification(
                    "No entendí la pregunta. ¿Puedes reformularla indicando qué dato necesitas?"
                        .to_string(),
                ),
                intent: classified.intent,
                confidence: classified.confidence,
                checkpoints: self.ledger.by_conversation(&conversation_id)?,
                conversation_id,
            });
        }

        let mut answer_confidence = classified.confidence;

        if classified.intent.is_data_bearing() {
            // RESOLVING
            transition(&conversation_id, PipelineState::Resolving);
            let stage_start = Instant::now();
            let input = json!({"question": question, "available_tables": available_tables});
            let resolution = match self.resolver.resolve(
                question,
                available_tables,
                Some(&conversation_id),
                classified.intent,
            ) {
                Ok(resolution) => {
                    self.ledger.log(
                        &conversation_id,
                        STAGE_RESOLVE,
                        input,
                        json!({"plan": &resolution.plan, "confidence": resolution.confidence}),
                        CheckpointStatus::Ok,
                        elapsed_ms(stage_start),
                    )?;
                    resolution
                }
                Err(TabulaError::AmbiguousMetric { candidates, question: q }) => {
                    transition(&conversation_id, PipelineState::AwaitingDisambiguation);
                    self.ledger.log(
                        &conversation_id,
                        STAGE_RESOLVE,
                        input,
                        json!({"code": "AMBIGUOUS_METRIC", "candidates": &candidates}),
                        CheckpointStatus::Error,
                        elapsed_ms(stage_start),
                    )?;
                    info!(%conversation_id, n = candidates.len(), "awaiting disambiguation");
                    return Ok(QueryResponse {
                        outcome: PipelineOutcome::Disambiguation {
                            prompt: disambiguation_prompt(&q, &candidates),
                            candidates,
                        },
                        intent: classified.intent,
                        confidence: classified.confidence,
                        checkpoints: self.ledger.by_conversation(&conversation_id)?,
                        conversation_id,
                    });
                }
                Err(err) => {
                    return self.fail(&conversation_id, STAGE_RESOLVE, input, stage_start, err);
                }
            };
            answer_confidence = resolution.confidence;

            // EXECUTING
            transition(&conversation_id, PipelineState::Executing);
            let stage_start = Instant::now();
            let input = json!({"plan": &resolution.plan});
            match with_timeout(STAGE_EXECUTE, self.executor.execute(&resolution.plan)).await {
                Ok(result) => {
                    self.ledger.log(
                        &conversation_id,
                        STAGE_EXECUTE,
                        input,
                        serde_json::to_value(&result)?,
                        CheckpointStatus::Ok,
                        elapsed_ms(stage_start),
                    )?;
                }
                Err(err) => {
                    return self.fail(&conversation_id, STAGE_EXECUTE, input, stage_start, err);
                }
            }
        }

        // COMPOSING
        transition(&conversation_id, PipelineState::Composing);
        let stage_start = Instant::now();
        let trail = self.ledger.by_conversation(&conversation_id)?;
        let input = json!({"question": question, "checkpoint_count": trail.len()});
        let text = match with_timeout(STAGE_COMPOSE, self.composer.compose(&trail, question)).await
        {
            Ok(text) => {
                self.ledger.log(
                    &conversation_id,
                    STAGE_COMPOSE,
                    input,
                    json!({"response": text}),
                    CheckpointStatus::Ok,
                    elapsed_ms(stage_start),
                )?;
                text
            }
            Err(err) => {
                return self.fail(&conversation_id, STAGE_COMPOSE, input, stage_start, err);
            }
        };

        transition(&conversation_id, PipelineState::Done);
        info!(%conversation_id, "pipeline done");
        Ok(QueryResponse {
            outcome: PipelineOutcome::Answer(text),
            intent: classified.intent,
            confidence: answer_confidence,
            checkpoints: self.ledger.by_conversation(&conversation_id)?,
            conversation_id,
        })
    }

    /// Checkpoint trail for a conversation, oldest first.
    pub fn checkpoints(&self, conversation_id: &str) -> Result<Vec<Checkpoint>> {
        self.ledger.by_conversation(conversation_id)
    }

    /// Record a stage failure and propagate the typed error unchanged.
    fn fail(
        &self,
        conversation_id: &str,
        stage: &str,
        input: serde_json::Value,
        stage_start: Instant,
        err: TabulaError,
    ) -> Result<QueryResponse> {
        transition(conversation_id, PipelineState::Failed);
        let status = match &err {
            TabulaError::StageTimeout { .. } => CheckpointStatus::Timeout,
            _ => CheckpointStatus::Error,
        };
        warn!(%conversation_id, stage, code = err.code(), "stage failed");
        // The stage error outranks a ledger write failure.
        if let Err(log_err) = self.ledger.log(
            conversation_id,
            stage,
            input,
            json!({"code": err.code(), "error": err.to_string()}),
            status,
            elapsed_ms(stage_start),
        ) {
            warn!(%conversation_id, stage, error = %log_err, "failure checkpoint was not recorded");
        }
        Err(err)
    }
}

fn transition(conversation_id: &str, state: PipelineState) {
    tracing::debug!(%conversation_id, state = ?state, "pipeline state");
}

async fn with_timeout<T>(stage: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(EXTERNAL_CALL_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(TabulaError::StageTimeout {
            stage: stage.to_string(),
            timeout_ms: EXTERNAL_CALL_TIMEOUT.as_millis() as u64,
        }),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn disambiguation_prompt(question: &str, candidates: &[MetricCandidate]) -> String {
    let mut lines = vec![format!(
        "Tu pregunta \"{question}\" coincide con varias métricas. ¿Cuál quieres?"
    )];
    for (i, candidate) in candidates.iter().enumerate() {
        lines.push(format!(
            "{}. {} (coincide con \"{}\")",
            i + 1,
            candidate.metric,
            candidate.alias_matched
        ));
    }
    lines.push("Responde con el número o el nombre de la métrica.".to_string());
    lines.join("\n")
}
