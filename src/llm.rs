//! External language-model boundary. The model is allowed to do exactly two
//! things: classify the intent of a question and phrase the final response
//! from checkpoint data. It never chooses tables, metrics, columns or
//! filters; those interfaces do not exist here.

use crate::checkpoint::Checkpoint;
use crate::config::EXTERNAL_CALL_TIMEOUT;
use crate::error::{Result, TabulaError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    QueryData,
    AggregateMetrics,
    ComparePeriods,
    Forecast,
    ExplainData,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::QueryData => "QUERY_DATA",
            Intent::AggregateMetrics => "AGGREGATE_METRICS",
            Intent::ComparePeriods => "COMPARE_PERIODS",
            Intent::Forecast => "FORECAST",
            Intent::ExplainData => "EXPLAIN_DATA",
            Intent::Unknown => "UNKNOWN",
        }
    }

    /// Whether this intent routes through resolution and execution.
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            Intent::QueryData | Intent::AggregateMetrics | Intent::ComparePeriods | Intent::Forecast
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedIntent {
    pub intent: Intent,
    pub confidence: f64,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, question: &str) -> Result<ClassifiedIntent>;
}

/// Phrases the final answer. The composer sees only the checkpoint trail and
/// the question; it has no table access by construction.
#[async_trait]
pub trait ResponseComposer: Send + Sync {
    async fn compose(&self, checkpoints: &[Checkpoint], question: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(EXTERNAL_CALL_TIMEOUT)
            .build()
            .expect("reqwest client construction");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("TABULA_API_KEY").ok()?;
        let model = std::env::var("TABULA_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let base_url = std::env::var("TABULA_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Some(Self::new(api_key, model, base_url))
    }

    async fn call_llm(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
            "max_tokens": 500,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| llm_err(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(llm_err(format!("API error ({status}): {text}")));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| llm_err(format!("unparseable response body: {e}")))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| llm_err("no content in response".to_string()))?;
        if content.is_empty() {
            return Err(llm_err("empty content in response".to_string()));
        }
        Ok(content.to_string())
    }
}

fn llm_err(reason: String) -> TabulaError {
    TabulaError::ToolExecutionFailed {
        stage: "llm".to_string(),
        reason,
    }
}

/// Strip markdown fences some models insist on wrapping JSON in.
fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[async_trait]
impl IntentClassifier for LlmClient {
    async fn classify(&self, question: &str) -> Result<ClassifiedIntent> {
        let prompt = format!(
            r#"Classify the intent of this question about business data. Return JSON only.
Question: "{question}"
Intents: QUERY_DATA, AGGREGATE_METRICS, COMPARE_PERIODS, FORECAST, EXPLAIN_DATA, UNKNOWN
Format: {{"intent":"QUERY_DATA","confidence":0.0-1.0}}"#
        );
        let response = self.call_llm("Return JSON only, no text.", &prompt).await?;
        let classified: ClassifiedIntent = serde_json::from_str(strip_code_fences(&response))
            .map_err(|e| llm_err(format!("unparseable classification: {e}. Response: {response}")))?;
        debug!(intent = classified.intent.as_str(), confidence = classified.confidence, "classified intent");
        Ok(classified)
    }
}

#[async_trait]
impl ResponseComposer for LlmClient {
    async fn compose(&self, checkpoints: &[Checkpoint], question: &str) -> Result<String> {
        let trail = serde_json::to_string(checkpoints)?;
        let prompt = format!(
            r#"You are answering a business data question. Use ONLY the data in the checkpoint trail below; do not invent numbers. Answer in the language of the question, one short paragraph.
Question: "{question}"
Checkpoints: {trail}"#
        );
        self.call_llm(
            "Answer strictly from the provided data. Mention if results were truncated.",
            &prompt,
        )
        .await
    }
}

/// Deterministic keyword classifier, used when no API key is configured and
/// as the fallback when the remote classifier errors out.
#[derive(Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify(&self, question: &str) -> Result<ClassifiedIntent> {
        let q = crate::fuzzy::normalize(question);
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));

        let intent = if has(&["compara", "compare", "vs ", "versus", "mes pasado", "ano pasado", "last month", "last year"]) {
            Intent::ComparePeriods
        } else if has(&["pronostic", "forecast", "predic", "proyecc"]) {
            Intent::Forecast
        } else if has(&["por que", "why", "explica", "explain", "que significa", "what does"]) {
            Intent::ExplainData
        } else if has(&["total", "cuantos", "cuantas", "how many", "promedio", "average", "suma", "sum", "count"]) {
            Intent::AggregateMetrics
        } else if has(&["cuanto", "cual", "which", "what", "top", "mejores", "primeros", "muestra", "show", "lista", "dame", "ventas", "revenue", "clientes", "reproducciones"]) {
            Intent::QueryData
        } else {
            Intent::Unknown
        };

        let confidence = if intent == Intent::Unknown { 0.3 } else { 0.6 };
        Ok(ClassifiedIntent { intent, confidence })
    }
}

/// Deterministic composer for offline operation. Renders the execution
/// checkpoint's result as plain text, including the truncation notice.
#[derive(Default)]
pub struct TemplateComposer;

impl TemplateComposer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ResponseComposer for TemplateComposer {
    async fn compose(&self, checkpoints: &[Checkpoint], question: &str) -> Result<String> {
        let execution = checkpoints
            .iter()
            .rev()
            .find(|c| c.stage.starts_with("query_execution"));

        let Some(execution) = execution else {
            warn!(question, "no execution checkpoint to compose from");
            return Ok("No pude obtener datos para esa pregunta.".to_string());
        };

        let output = &execution.output;
        let columns: Vec<String> = output["columns"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let rows = output["rows"].as_array().cloned().unwrap_or_default();

        let mut lines = Vec::new();
        lines.push(columns.join(" | "));
        for row in &rows {
            if let Some(cells) = row.as_array() {
                let rendered: Vec<String> = cells
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                lines.push(rendered.join(" | "));
            }
        }

        let mut text = format!("Resultados:\n{}", lines.join("\n"));
        if output["rows_truncated"].as_bool().unwrap_or(false) {
            let before = output["row_count_before_limit"].as_u64().unwrap_or(0);
            let returned = output["row_count_returned"].as_u64().unwrap_or(0);
            text.push_str(&format!(
                "\n(Mostrando {returned} de {before} filas; el resultado fue truncado.)"
            ));
        }
        Ok(text)
    }
}
