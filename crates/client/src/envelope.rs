use std::time::Duration;

use serde::Serialize;
use simmer_backend::Relation;

/// Final relation plus execution metadata for one top-level blend.
///
/// Built once at the end of the outermost execution; a failed run returns an
/// error, never a truncated envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub result: Relation,
    /// Total distinct values routed to ingredient invocations.
    pub values_passed: u64,
    /// Number of ingredient invocations.
    pub generation_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub process_time: Duration,
    /// Echo of the resolved query text.
    pub query: String,
    pub contains_ingredient: bool,
}
