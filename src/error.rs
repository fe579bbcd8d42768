//! Pipeline error taxonomy.
//!
//! Each variant carries a distinct handling policy:
//! - `Validation` — bad input, surfaced as 400, never retried.
//! - `TransientFetch` — navigation/HTTP trouble, retried with backoff at
//!   the fetcher; an exhausted rarity/query is skipped, not fatal.
//! - `Parse` — a single malformed listing, discarded (debug-logged).
//! - `NotFound` — the run produced no data, surfaced as 404.
//! - `Persistence` — one record failed to upsert; counted, run continues.
//! - `RunFatal` — anything outside the per-item loops; aborts the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    #[error("listing parse failure: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("run aborted: {0}")]
    RunFatal(String),
}

impl PipelineError {
    /// Whether the fetcher retry loop should attempt this again.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientFetch(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
