use std::time::Duration;
use thiserror::Error;

/// Errors produced by exchange adapters and the request coordinator.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("coordinator blocked, retry in {retry_after:?}")]
    CoordinatorBlocked { retry_after: Duration },

    #[error("rate limited by venue (429)")]
    RateLimited,

    #[error("IP banned by venue for {duration:?}")]
    IpBanned { duration: Duration },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("insufficient available balance: {0}")]
    InsufficientFunds(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("venue error (HTTP {status}): {message}")]
    Venue { status: u16, message: String },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("unknown symbol: {0}")]
    SymbolNotFound(String),

    #[error("failed to decode venue response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether the operation may be retried with backoff.
    ///
    /// Coordinator rejections, permission errors, and insufficient-funds
    /// failures are terminal for the current attempt; only network faults
    /// and venue 5xx responses qualify for retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            ExchangeError::Network(_) => true,
            ExchangeError::Venue { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors from the LLM decision collaborator and tool dispatch.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("decision provider error: {0}")]
    Provider(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),
}

/// Validation errors for domain values.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Value must be non-negative")]
    MustBeNonNegative,

    #[error("Value must be finite")]
    MustBeFinite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_retriable());
        assert!(ExchangeError::Venue {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retriable());
        assert!(!ExchangeError::Venue {
            status: 400,
            message: "bad request".into()
        }
        .is_retriable());
        assert!(!ExchangeError::RateLimited.is_retriable());
        assert!(!ExchangeError::PermissionDenied("bad key".into()).is_retriable());
        assert!(!ExchangeError::InsufficientFunds("margin".into()).is_retriable());
        assert!(!ExchangeError::CoordinatorBlocked {
            retry_after: Duration::from_secs(30)
        }
        .is_retriable());
    }
}
