//! The model boundary.
//!
//! The host owns the actual transport (HTTP client, provider routing,
//! credentials); the core sees only [`TextModel`]: a system prompt, a user
//! prompt, a token cap, and a text-plus-usage response.  Everything the
//! pipelines need to reason about — rate limits, timeouts, retry pacing,
//! token estimation — lives here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod testkit;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// The provider throttled the request.  Retryable with backoff.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// The request exceeded its deadline.  Not retried by the core.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (connection refused, 5xx, bad payload).
    #[error("transport error: {0}")]
    Transport(String),

    /// The model returned no usable content.
    #[error("empty response from model")]
    Empty,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {d:?})"),
        None => String::new(),
    }
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

// ── Usage & response ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Usage,
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// `(system, user, max_tokens) → (content, usage)`.
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<LlmResponse, LlmError>;
}

/// Shared trait object, the shape every pipeline accepts.
pub type SharedModel = Arc<dyn TextModel>;

// ── Token estimation ──────────────────────────────────────────────────────────

/// Cheap token estimate: 4 characters ≈ 1 token.  Used for clustering
/// budgets and acceptance checks, never for billing.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Tabulated rate-limit backoff.  The table is data, not code, so tests can
/// substitute [`Backoff::none`] and run without sleeping.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    /// Production pacing: 1s, 2s, 5s, 15s, 30s, 60s, then 60s forever.
    pub fn standard() -> Self {
        Self {
            delays: [1, 2, 5, 15, 30, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }

    /// Zero-delay table for tests.
    pub fn none() -> Self {
        Self { delays: vec![] }
    }

    /// Delay before retry number `attempt` (0-based).  Past the end of the
    /// table the last entry repeats; an empty table never sleeps.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match self.delays.last() {
            None => Duration::ZERO,
            Some(last) => *self.delays.get(attempt).unwrap_or(last),
        }
    }

    pub async fn sleep(&self, attempt: usize) {
        let delay = self.delay_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }

    #[test]
    fn backoff_table_saturates_at_last_entry() {
        let backoff = Backoff::standard();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(50), Duration::from_secs(60));
    }

    #[test]
    fn empty_backoff_never_sleeps() {
        let backoff = Backoff::none();
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(99), Duration::ZERO);
    }

    #[test]
    fn rate_limit_classification() {
        assert!(LlmError::RateLimited { retry_after: None }.is_rate_limit());
        assert!(!LlmError::Empty.is_rate_limit());
        assert!(!LlmError::Transport("boom".to_string()).is_rate_limit());
    }
}
