//! Tunables for the resolution + execution pipeline.
//!
//! Every threshold lives here and only here. The resolver's default limit and
//! the executor's default limit are the same constant on purpose: the two are
//! not allowed to drift.

use std::time::Duration;

/// Minimum fuzzy score (0-100) before a metric match is trusted at all.
pub const FUZZY_MATCH_FLOOR: f64 = 85.0;

/// Score gap below which the top candidates are considered tied.
pub const AMBIGUITY_MARGIN: f64 = 3.0;

/// Candidates collected per table during fuzzy ranking.
pub const TOP_K_PER_TABLE: usize = 8;

/// Suggestions attached to unresolved/ambiguous failures.
pub const MAX_SUGGESTIONS: usize = 5;

/// Row limit applied to every plan that does not request one explicitly.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Hard cap on "top N" ranking requests. Larger N is capped, never honored
/// silently: the plan carries `limit_capped = true`.
pub const MAX_RANKING_LIMIT: usize = 50;

/// TTL for cached query results.
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(120);

/// TTL for per-conversation ambiguity context.
pub const CONTEXT_TTL: Duration = Duration::from_secs(30 * 60);

/// Page size for the remote paginated table store.
pub const REMOTE_PAGE_SIZE: usize = 1000;

/// Budget for each external call (LLM classification/composition, remote
/// page fetch). Exceeding it is a typed `StageTimeout`, not an empty result.
pub const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Boost added when a follow-up matches the conversation's last metric.
pub const CONTEXT_BOOST_LAST_METRIC: f64 = 3.0;

/// Boost added when the candidate's table matches the conversation's last table.
pub const CONTEXT_BOOST_LAST_TABLE: f64 = 1.5;

/// Confidence penalty when the matched alias is very short (5 chars or less).
pub const PENALTY_SHORT_ALIAS: f64 = 0.05;

/// Confidence penalty for a near-perfect score earned by a very short phrase.
pub const PENALTY_SHORT_PHRASE_PERFECT: f64 = 0.05;

/// Confidence penalty when the match came from a fragment of the question
/// rather than the whole question.
pub const PENALTY_PARTIAL_PHRASE: f64 = 0.03;
