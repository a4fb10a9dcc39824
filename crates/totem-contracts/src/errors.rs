use thiserror::Error;

/// Terminal and retryable failure kinds surfaced by the engine.
///
/// `TransientRateLimit` is normally absorbed by the invoker's retry loop and
/// only escapes when the budget is spent; everything else is terminal for the
/// pipeline call that produced it.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum TotemError {
    #[error("unsupported or undecodable image input: {0}")]
    InvalidInput(String),
    #[error("image re-encode failed: {0}")]
    EncodingFailure(String),
    #[error("no API credential configured")]
    MissingCredential,
    #[error("rate limited by the inference endpoint: {0}")]
    TransientRateLimit(String),
    #[error("usage quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("billing must be enabled for this credential: {0}")]
    BillingRequired(String),
    #[error("inference response carried no usable content")]
    EmptyResult,
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("inference endpoint error: {0}")]
    Remote(String),
    #[error("{0}")]
    Rejected(&'static str),
}

/// Classification of a failed inference exchange, derived purely from the
/// HTTP status and the human-readable message in the error body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    TransientRateLimit,
    QuotaExhausted,
    BillingRequired,
    Generic(String),
}

pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;
pub const HTTP_FORBIDDEN: u16 = 403;

const BILLING_MARKERS: [&str; 4] = [
    "billed users",
    "billing account",
    "billing required",
    "enable billing",
];

const QUOTA_MARKERS: [&str; 7] = [
    "quota",
    "exceed",
    "exhausted",
    "insufficient tokens",
    "billing",
    "billed users",
    "daily limit",
];

/// Maps `(status, message)` to a classification.
///
/// A 429 always classifies as `TransientRateLimit`; the caller decides whether
/// budget remains to retry it, and an exhausted 429 falls through to the quota
/// handling path. Billing markers are checked before the quota rule so the
/// more specific billing notice is never shadowed by a generic quota match.
pub fn classify_failure(status: u16, message: &str) -> ErrorClassification {
    if status == HTTP_TOO_MANY_REQUESTS {
        return ErrorClassification::TransientRateLimit;
    }
    let lowered = message.to_lowercase();
    if BILLING_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return ErrorClassification::BillingRequired;
    }
    if status == HTTP_FORBIDDEN
        || QUOTA_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
    {
        return ErrorClassification::QuotaExhausted;
    }
    ErrorClassification::Generic(message.to_string())
}
