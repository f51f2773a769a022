//! Per-conversation ambiguity context: the candidates offered for
//! disambiguation and the last successful resolution, kept under a TTL.
//!
//! The store is an injected interface rather than a module-level singleton so
//! an in-memory map can later be swapped for a distributed store without
//! touching resolver logic.

use crate::config::CONTEXT_TTL;
use crate::plan::MetricCandidate;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct AmbiguityContext {
    pub last_metric: Option<String>,
    pub last_table: Option<String>,
    pub last_alias: Option<String>,
    /// Candidates offered on the previous turn, awaiting a numbered or named
    /// answer. Cleared once consumed.
    pub pending_candidates: Vec<MetricCandidate>,
}

pub trait ContextStore: Send + Sync {
    /// Current context for a conversation, or a fresh one if absent/expired.
    fn get(&self, conversation_id: &str) -> AmbiguityContext;

    /// Atomic read-modify-write for one conversation. A disambiguation answer
    /// must observe the candidates written by the immediately preceding turn,
    /// so mutation is serialized per conversation id.
    fn update(&self, conversation_id: &str, f: &mut dyn FnMut(&mut AmbiguityContext));

    fn clear(&self, conversation_id: &str);
}

struct Entry {
    context: AmbiguityContext,
    updated_at: Instant,
}

pub struct InMemoryContextStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::with_ttl(CONTEXT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStore for InMemoryContextStore {
    fn get(&self, conversation_id: &str) -> AmbiguityContext {
        match self.entries.get(conversation_id) {
            Some(entry) if entry.updated_at.elapsed() <= self.ttl => entry.context.clone(),
            _ => AmbiguityContext::default(),
        }
    }

    fn update(&self, conversation_id: &str, f: &mut dyn FnMut(&mut AmbiguityContext)) {
        let mut entry = self
            .entries
            .entry(conversation_id.to_string())
            .or_insert_with(|| Entry {
                context: AmbiguityContext::default(),
                updated_at: Instant::now(),
            });
        if entry.updated_at.elapsed() > self.ttl {
            entry.context = AmbiguityContext::default();
        }
        f(&mut entry.context);
        entry.updated_at = Instant::now();
    }

    fn clear(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(metric: &str) -> MetricCandidate {
        MetricCandidate {
            metric: metric.to_string(),
            table: "orders".to_string(),
            alias_matched: metric.to_string(),
            score: 90.0,
        }
    }

    #[test]
    fn test_update_then_get() {
        let store = InMemoryContextStore::new();
        store.update("c1", &mut |ctx| {
            ctx.last_metric = Some("total_revenue".to_string());
            ctx.pending_candidates = vec![candidate("a"), candidate("b")];
        });
        let ctx = store.get("c1");
        assert_eq!(ctx.last_metric.as_deref(), Some("total_revenue"));
        assert_eq!(ctx.pending_candidates.len(), 2);
        assert!(store.get("c2").pending_candidates.is_empty());
    }

    #[test]
    fn test_expired_context_resets() {
        let store = InMemoryContextStore::with_ttl(Duration::from_millis(0));
        store.update("c1", &mut |ctx| {
            ctx.last_metric = Some("total_revenue".to_string());
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("c1").last_metric.is_none());
    }

    #[test]
    fn test_clear_removes_context() {
        let store = InMemoryContextStore::new();
        store.update("c1", &mut |ctx| {
            ctx.last_table = Some("orders".to_string());
        });
        store.clear("c1");
        assert!(store.get("c1").last_table.is_none());
    }
}
