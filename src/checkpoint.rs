//! Append-only checkpoint ledger. Every pipeline stage writes exactly one
//! checkpoint (input, output, status, timing) before the next stage runs.
//! Storage is pluggable; neither implementation exposes any update or delete
//! path, so a written checkpoint cannot be mutated.

use crate::error::{Result, TabulaError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Ok,
    Error,
    Timeout,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Ok => "ok",
            CheckpointStatus::Error => "error",
            CheckpointStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub conversation_id: String,
    /// Stage name with version, e.g. `semantic_resolution@1.0`.
    pub stage: String,
    pub input: Value,
    pub output: Value,
    pub status: CheckpointStatus,
    pub timestamp: DateTime<Utc>,
    pub execution_time_ms: f64,
}

/// Append-only storage. No update or delete operations exist.
pub trait CheckpointStorage: Send + Sync {
    fn append(&self, checkpoint: Checkpoint) -> Result<()>;

    /// All checkpoints for a conversation in chronological order.
    fn by_conversation(&self, conversation_id: &str) -> Result<Vec<Checkpoint>>;
}

pub struct CheckpointLedger {
    storage: Arc<dyn CheckpointStorage>,
}

impl CheckpointLedger {
    pub fn new(storage: Arc<dyn CheckpointStorage>) -> Self {
        Self { storage }
    }

    pub fn log(
        &self,
        conversation_id: &str,
        stage: &str,
        input: Value,
        output: Value,
        status: CheckpointStatus,
        execution_time_ms: f64,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            stage: stage.to_string(),
            input,
            output,
            status,
            timestamp: Utc::now(),
            execution_time_ms,
        };
        self.storage.append(checkpoint.clone())?;
        Ok(checkpoint)
    }

    pub fn by_conversation(&self, conversation_id: &str) -> Result<Vec<Checkpoint>> {
        self.storage.by_conversation(conversation_id)
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStorage {
    items: DashMap<String, Vec<Checkpoint>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    fn append(&self, checkpoint: Checkpoint) -> Result<()> {
        self.items
            .entry(checkpoint.conversation_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    fn by_conversation(&self, conversation_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = self
            .items
            .get(conversation_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        checkpoints.sort_by_key(|c| c.timestamp);
        Ok(checkpoints)
    }
}

/// Durable storage on SQLite. The schema is insert-only; the struct issues no
/// UPDATE or DELETE statements.
pub struct SqliteCheckpointStorage {
    db: Mutex<Connection>,
}

impl SqliteCheckpointStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)
            .map_err(|e| TabulaError::ToolExecutionFailed {
                stage: "checkpoint_storage".to_string(),
                reason: format!("failed to open {}: {e}", path.display()),
            })?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                execution_time_ms REAL NOT NULL
            )",
            [],
        )
        .map_err(Self::storage_err)?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_conversation
             ON checkpoints (conversation_id, timestamp)",
            [],
        )
        .map_err(Self::storage_err)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn storage_err(e: rusqlite::Error) -> TabulaError {
        TabulaError::ToolExecutionFailed {
            stage: "checkpoint_storage".to_string(),
            reason: e.to_string(),
        }
    }
}

impl CheckpointStorage for SqliteCheckpointStorage {
    fn append(&self, checkpoint: Checkpoint) -> Result<()> {
        let db = self.db.lock().expect("checkpoint db lock");
        db.execute(
            "INSERT INTO checkpoints
             (checkpoint_id, conversation_id, stage, input, output, status, timestamp, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.checkpoint_id.to_string(),
                checkpoint.conversation_id,
                checkpoint.stage,
                checkpoint.input.to_string(),
                checkpoint.output.to_string(),
                checkpoint.status.as_str(),
                checkpoint.timestamp.to_rfc3339(),
                checkpoint.execution_time_ms,
            ],
        )
        .map_err(Self::storage_err)?;
        Ok(())
    }

    fn by_conversation(&self, conversation_id: &str) -> Result<Vec<Checkpoint>> {
        let db = self.db.lock().expect("checkpoint db lock");
        let mut stmt = db
            .prepare(
                "SELECT checkpoint_id, conversation_id, stage, input, output, status, timestamp, execution_time_ms
                 FROM checkpoints WHERE conversation_id = ?1 ORDER BY timestamp ASC",
            )
            .map_err(Self::storage_err)?;

        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                ))
            })
            .map_err(Self::storage_err)?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (id, conversation_id, stage, input, output, status, timestamp, execution_time_ms) =
                row.map_err(Self::storage_err)?;
            let status = match status.as_str() {
                "ok" => CheckpointStatus::Ok,
                "timeout" => CheckpointStatus::Timeout,
                _ => CheckpointStatus::Error,
            };
            checkpoints.push(Checkpoint {
                checkpoint_id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                conversation_id,
                stage,
                input: serde_json::from_str(&input)?,
                output: serde_json::from_str(&output)?,
                status,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                execution_time_ms,
            });
        }
        Ok(checkpoints)
    }
}
