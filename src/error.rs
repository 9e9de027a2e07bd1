use crate::book::SectionKey;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BookError {
    /// The outline came back empty or malformed, even after a restated prompt.
    #[error("Outline planning failed: {0}")]
    Planning(String),

    /// A sub-chapter exhausted its retry budget while running with the abort policy.
    #[error("Generation of sub-chapter {key} failed after {attempts} attempt(s): {message}")]
    Generation {
        key: SectionKey,
        attempts: u32,
        message: String,
    },

    #[error("Sub-chapter {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: SectionKey,
        from: &'static str,
        to: &'static str,
    },

    #[error("Sub-chapter {key} cannot start before {blocked_by} is finished")]
    OutOfOrder {
        key: SectionKey,
        blocked_by: SectionKey,
    },

    #[error("Manuscript is incomplete: {pending} sub-chapter(s) still pending")]
    Incomplete { pending: usize },

    #[error("Invalid book description: {0}")]
    InvalidSpec(String),
}

/// Non-fatal: a sub-chapter stayed short of its target after the single re-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthShortfallWarning {
    pub key: SectionKey,
    pub words: usize,
    pub target: usize,
}

impl fmt::Display for LengthShortfallWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sub-chapter {} is short of its target: {} of {} words",
            self.key, self.words, self.target
        )
    }
}

/// Failure classes of a single text-generation call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limit or quota exceeded: {0}")]
    RateLimited(String),

    #[error("Transient API failure: {0}")]
    Transient(String),

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Generation stopped ({reason}) without usable text")]
    Blocked { reason: String },

    #[error("Unexpected response: {0}")]
    Malformed(String),

    /// Quota still exhausted after waiting or no replacement key was given.
    #[error("API quota exhausted: {0}")]
    QuotaExhausted(String),
}

impl LlmError {
    pub fn from_status(status: u16, body: String) -> Self {
        let lower = body.to_lowercase();
        if status == 429 || lower.contains("quota") || lower.contains("rate limit") {
            LlmError::RateLimited(body)
        } else if status >= 500 || status == 408 {
            LlmError::Transient(format!("HTTP {}: {}", status, body))
        } else {
            LlmError::Rejected { status, message: body }
        }
    }

    /// A bad key or bad request will not get better by asking again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LlmError::Rejected { .. } | LlmError::QuotaExhausted(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs may carry credentials.
        let e = e.without_url();
        if let Some(status) = e.status() {
            LlmError::from_status(status.as_u16(), e.to_string())
        } else if e.is_decode() {
            LlmError::Malformed(e.to_string())
        } else {
            LlmError::Transient(e.to_string())
        }
    }
}

/// Unknown errors are treated as retryable; only a classified rejection stops early.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LlmError>()
        .map_or(true, LlmError::is_retryable)
}
