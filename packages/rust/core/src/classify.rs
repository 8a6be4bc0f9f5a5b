//! Error classification and retry policy.
//!
//! Pure functions: no I/O, no clock. The orchestrator records the retry
//! delay as metadata on the item and never sleeps on it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pipewright_shared::StepError;

/// Consecutive same-step failures before an item is dead-lettered.
pub const DEFAULT_DEAD_LETTER_THRESHOLD: u32 = 3;

const BASE_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Network trouble, timeouts, provider 5xx.
    Transient,
    /// Provider throttling.
    RateLimit,
    /// Bad input or permanent rejection; retrying will not help.
    Terminal,
    /// Nothing matched; treated as retryable.
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::Terminal => "terminal",
            Self::Unknown => "unknown",
        }
    }
}

/// Result of [`classify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub retryable: bool,
    pub reason: String,
    /// First-attempt backoff hint; `None` for terminal errors.
    pub suggested_delay_ms: Option<u64>,
}

impl ErrorClassification {
    fn new(error_type: ErrorType, reason: impl Into<String>) -> Self {
        let mut classification = Self {
            error_type,
            retryable: error_type != ErrorType::Terminal,
            reason: reason.into(),
            suggested_delay_ms: None,
        };
        classification.suggested_delay_ms =
            retry_delay(&classification, 1).map(|d| d.as_millis() as u64);
        classification
    }
}

fn contains_any(message: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| message.contains(needle))
}

/// Classify an agent failure by HTTP status and message shape.
///
/// Checks run in priority order: rate limit, server error, timeout,
/// network, client error, auth, validation. Anything else is unknown.
pub fn classify(error: &StepError) -> ErrorClassification {
    let message = error.message.to_lowercase();
    let status = error.status;

    if status == Some(429) || contains_any(&message, &["rate limit", "too many requests"]) {
        return ErrorClassification::new(ErrorType::RateLimit, "Rate limit exceeded");
    }
    if let Some(code @ 500..=599) = status {
        return ErrorClassification::new(ErrorType::Transient, format!("Server error ({code})"));
    }
    if contains_any(&message, &["timeout", "timed out", "etimedout", "econnreset"]) {
        return ErrorClassification::new(ErrorType::Transient, "Timeout or connection reset");
    }
    if contains_any(&message, &["econnrefused", "enotfound", "network"]) {
        return ErrorClassification::new(ErrorType::Transient, "Network error");
    }
    if let Some(code @ 400..=499) = status {
        return ErrorClassification::new(ErrorType::Terminal, format!("Client error ({code})"));
    }
    if contains_any(&message, &["unauthorized", "forbidden", "authentication"]) {
        return ErrorClassification::new(
            ErrorType::Terminal,
            "Authentication/authorization error",
        );
    }
    if contains_any(&message, &["validation", "invalid", "malformed"]) {
        return ErrorClassification::new(ErrorType::Terminal, "Validation error");
    }

    ErrorClassification::new(
        ErrorType::Unknown,
        "Unknown error type (defaulting to retryable)",
    )
}

/// Terminal errors go straight to dead letter; retryable ones once the same
/// step has failed `threshold` times in a row.
pub fn should_move_to_dead_letter(
    classification: &ErrorClassification,
    consecutive_failures: u32,
    threshold: u32,
) -> bool {
    !classification.retryable || consecutive_failures >= threshold
}

/// Exponential backoff for the `attempt`-th retry (1-based), capped at 60 s.
/// Rate limits start at 10 s, everything else at 1 s. `None` for terminal
/// errors.
pub fn retry_delay(classification: &ErrorClassification, attempt: u32) -> Option<Duration> {
    if !classification.retryable {
        return None;
    }
    let base = match classification.error_type {
        ErrorType::RateLimit => RATE_LIMIT_BASE_DELAY,
        _ => BASE_DELAY,
    };
    let exponent = attempt.saturating_sub(1).min(16);
    Some(base.saturating_mul(1 << exponent).min(MAX_DELAY))
}
