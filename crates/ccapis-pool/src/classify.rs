//! Failure classification for per-request outcomes
//!
//! Maps transport outcomes to the failure categories that drive the circuit
//! breaker. Classification is best-effort and idempotent: reclassifying an
//! outcome never changes recorded history.

use crate::error::TransportError;

/// Message fragments indicating a transient rate limit.
const RATE_LIMIT_PATTERNS: &[&str] = &["http 429", "rate limit", "too many requests"];

/// Message fragments indicating the account's quota window is exhausted.
const QUOTA_PATTERNS: &[&str] = &["quota", "limit exceeded", "usage limit"];

/// Failure category recorded against an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient throttling, cooled down for a fixed window
    RateLimited,
    /// Quota window exhausted, cooled down until the window resets
    QuotaExhausted,
    /// Everything else (network failures, 5xx, unexpected payloads)
    Generic,
}

impl FailureKind {
    /// Label for logging and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::QuotaExhausted => "quota_exhausted",
            FailureKind::Generic => "generic_error",
        }
    }
}

/// Outcome of one executed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(FailureKind),
}

/// Classify an error message by case-insensitive substring scan.
///
/// Rate-limit patterns are checked before quota patterns, so a message like
/// "rate limit exceeded" classifies as `RateLimited`. Empty messages are
/// `Generic`.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureKind::RateLimited;
    }
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return FailureKind::QuotaExhausted;
    }
    FailureKind::Generic
}

/// Classify an HTTP response by status, falling back to the body text.
///
/// 429 is always a rate limit and 402 always quota exhaustion; any other
/// status runs the substring rules against the body.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        402 => FailureKind::QuotaExhausted,
        _ => classify_message(body),
    }
}

/// Classify a transport error, preferring the status when one was observed.
pub fn classify_transport(error: &TransportError) -> FailureKind {
    match error.status {
        Some(status) => classify_status(status, &error.message),
        None => classify_message(&error.message),
    }
}

/// Map an operation result to its outcome.
pub fn classify_outcome<T>(result: &std::result::Result<T, TransportError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(error) => Outcome::Failure(classify_transport(error)),
    }
}

/// Whether the failure is expected to clear on its own.
pub fn is_transient(kind: FailureKind) -> bool {
    matches!(kind, FailureKind::RateLimited | FailureKind::QuotaExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_http_429_is_rate_limited() {
        assert_eq!(classify_message("HTTP 429 from upstream"), FailureKind::RateLimited);
    }

    #[test]
    fn message_rate_limit_is_rate_limited() {
        assert_eq!(classify_message("Rate limit hit, slow down"), FailureKind::RateLimited);
    }

    #[test]
    fn message_too_many_requests_is_rate_limited() {
        assert_eq!(classify_message("Too Many Requests"), FailureKind::RateLimited);
    }

    #[test]
    fn message_quota_is_quota_exhausted() {
        assert_eq!(classify_message("monthly quota reached"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn message_limit_exceeded_is_quota_exhausted() {
        assert_eq!(classify_message("Limit exceeded for this plan"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn message_usage_limit_is_quota_exhausted() {
        assert_eq!(classify_message("usage limit for your subscription"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn rate_limit_patterns_win_over_quota_patterns() {
        // Contains both "rate limit" and "limit exceeded"
        assert_eq!(classify_message("rate limit exceeded"), FailureKind::RateLimited);
    }

    #[test]
    fn unknown_message_is_generic() {
        assert_eq!(classify_message("connection reset by peer"), FailureKind::Generic);
    }

    #[test]
    fn empty_message_is_generic() {
        assert_eq!(classify_message(""), FailureKind::Generic);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify_message("TOO MANY REQUESTS"), FailureKind::RateLimited);
        assert_eq!(classify_message("USAGE LIMIT"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn status_429_is_rate_limited() {
        assert_eq!(classify_status(429, "anything"), FailureKind::RateLimited);
    }

    #[test]
    fn status_402_is_quota_exhausted() {
        assert_eq!(classify_status(402, "payment required"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn status_500_falls_back_to_body() {
        assert_eq!(classify_status(500, "internal error"), FailureKind::Generic);
        assert_eq!(classify_status(500, "usage limit reached"), FailureKind::QuotaExhausted);
    }

    #[test]
    fn transport_error_prefers_status() {
        let err = TransportError::from_status(429, "quota exhausted");
        assert_eq!(classify_transport(&err), FailureKind::RateLimited);
    }

    #[test]
    fn transport_error_without_status_scans_message() {
        let err = TransportError::from_message("upstream said too many requests");
        assert_eq!(classify_transport(&err), FailureKind::RateLimited);
    }

    #[test]
    fn outcome_of_ok_is_success() {
        let result: Result<u8, TransportError> = Ok(1);
        assert_eq!(classify_outcome(&result), Outcome::Success);
    }

    #[test]
    fn outcome_of_err_carries_kind() {
        let result: Result<u8, TransportError> = Err(TransportError::from_status(402, ""));
        assert_eq!(
            classify_outcome(&result),
            Outcome::Failure(FailureKind::QuotaExhausted)
        );
    }

    #[test]
    fn rate_limited_and_quota_are_transient() {
        assert!(is_transient(FailureKind::RateLimited));
        assert!(is_transient(FailureKind::QuotaExhausted));
        assert!(!is_transient(FailureKind::Generic));
    }
}
