//! Error taxonomy and the stable, user-visible error codes.
//!
//! Every fallible operation in the core returns a discriminated result; no
//! expected error travels through panics. Errors fall into five kinds:
//! policy (non-retryable, surfaced verbatim), protocol (non-retryable),
//! crypto (non-retryable, never includes key material), transient
//! (retryable by the *caller*, never retried inside the core), and internal
//! (fatal, quarantines the affected session).

use crate::signer::SignError;
use crate::store::StoreError;

/// Stable machine-readable error codes published to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SessionExpired,
    SessionRevoked,
    SessionInvalid,
    LimitExceeded,
    PaymentFailed,
    PaymentTimeout,
    NetworkError,
    X402ParseError,
    TokenExpired,
    TokenInvalid,
    TokenRevoked,
}

impl ErrorCode {
    /// Numeric code. These values are part of the published interface and
    /// must never change.
    pub const fn code(self) -> u16 {
        match self {
            ErrorCode::SessionExpired => 1001,
            ErrorCode::SessionRevoked => 1002,
            ErrorCode::SessionInvalid => 1003,
            ErrorCode::LimitExceeded => 2001,
            ErrorCode::PaymentFailed => 4001,
            ErrorCode::PaymentTimeout => 4002,
            ErrorCode::NetworkError => 5001,
            ErrorCode::X402ParseError => 6001,
            ErrorCode::TokenExpired => 7001,
            ErrorCode::TokenInvalid => 7002,
            ErrorCode::TokenRevoked => 7003,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::SessionRevoked => "SESSION_REVOKED",
            ErrorCode::SessionInvalid => "SESSION_INVALID",
            ErrorCode::LimitExceeded => "LIMIT_EXCEEDED",
            ErrorCode::PaymentFailed => "PAYMENT_FAILED",
            ErrorCode::PaymentTimeout => "PAYMENT_TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::X402ParseError => "X402_PARSE_ERROR",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenInvalid => "TOKEN_INVALID",
            ErrorCode::TokenRevoked => "TOKEN_REVOKED",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, ErrorCode::PaymentTimeout | ErrorCode::NetworkError)
    }

    pub const fn remediation(self) -> &'static str {
        match self {
            ErrorCode::SessionExpired => "Create a new session key; this one has passed its expiry.",
            ErrorCode::SessionRevoked => "The session was revoked. Create a new session key.",
            ErrorCode::SessionInvalid => "The session could not be found or loaded. Create a new session key.",
            ErrorCode::LimitExceeded => "Reduce the amount or wait for the daily window to reset.",
            ErrorCode::PaymentFailed => "The payment was not accepted. Inspect the server reason before retrying.",
            ErrorCode::PaymentTimeout => "The request timed out. Retry with backoff.",
            ErrorCode::NetworkError => "A network or upstream error occurred. Retry with backoff.",
            ErrorCode::X402ParseError => "The 402 challenge could not be parsed. Contact the resource operator.",
            ErrorCode::TokenExpired => "Mint a fresh payment token from a valid session.",
            ErrorCode::TokenInvalid => "The token is malformed or unknown. Mint a fresh payment token.",
            ErrorCode::TokenRevoked => "The underlying session was revoked. Create a new session key.",
        }
    }
}

/// User-visible error surface: code, message, retryability and a remediation
/// hint, as published by the interface contract.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ErrorDetails {
    pub code: u16,
    pub message: String,
    pub retryable: bool,
    pub remediation: &'static str,
}

/// Policy violations: the session or its ledger refuses the spend.
///
/// Never retried internally, surfaced verbatim to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("session expired")]
    Expired,
    #[error("per-transaction limit exceeded: {reason}")]
    PerTxExceeded { reason: String },
    #[error("daily limit exceeded: {reason}")]
    DailyExceeded { reason: String },
    #[error("session revoked")]
    SessionRevoked,
    #[error("session not found")]
    SessionInvalid,
    #[error("chain {chain_id} is not allowed by the session policy")]
    ChainNotAllowed { chain_id: u64 },
}

impl PolicyError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            PolicyError::Expired => ErrorCode::SessionExpired,
            PolicyError::PerTxExceeded { .. } | PolicyError::DailyExceeded { .. } => {
                ErrorCode::LimitExceeded
            }
            PolicyError::SessionRevoked => ErrorCode::SessionRevoked,
            PolicyError::SessionInvalid => ErrorCode::SessionInvalid,
            PolicyError::ChainNotAllowed { .. } => ErrorCode::PaymentFailed,
        }
    }
}

/// Protocol failures: the 402 exchange itself went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed 402 challenge")]
    MalformedChallenge,
    #[error("malformed settlement response")]
    MalformedSettlement,
    #[error("server rejected the payment: {server_reason}")]
    PaymentRejected { server_reason: String },
}

impl ProtocolError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedChallenge | ProtocolError::MalformedSettlement => {
                ErrorCode::X402ParseError
            }
            ProtocolError::PaymentRejected { .. } => ErrorCode::PaymentFailed,
        }
    }
}

/// Transient failures. The core does not retry these; the caller may, with
/// backoff.
#[derive(Debug, thiserror::Error)]
pub enum TransientError {
    #[error("payment request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("price oracle error: {0}")]
    Oracle(String),
}

impl TransientError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            TransientError::Timeout => ErrorCode::PaymentTimeout,
            TransientError::Network(_) | TransientError::Oracle(_) => ErrorCode::NetworkError,
        }
    }
}

/// Internal failures: storage corruption or a caught invariant violation.
/// No silent recovery; the affected session is quarantined by the manager.
#[derive(Debug, thiserror::Error)]
pub enum InternalError {
    #[error("storage failure")]
    Storage(#[from] StoreError),
    #[error("ledger state violates its own caps; session quarantined")]
    LedgerCorruption,
}

/// The composite error type of the 402 negotiation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Crypto(#[from] SignError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Policy(e) => e.code(),
            EngineError::Protocol(e) => e.code(),
            EngineError::Crypto(_) => ErrorCode::PaymentFailed,
            EngineError::Transient(e) => e.code(),
            EngineError::Internal(_) => ErrorCode::PaymentFailed,
        }
    }

    /// The published error surface for this failure.
    pub fn details(&self) -> ErrorDetails {
        let code = self.code();
        ErrorDetails {
            code: code.code(),
            message: self.to_string(),
            retryable: code.retryable(),
            remediation: code.remediation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::SessionExpired.code(), 1001);
        assert_eq!(ErrorCode::SessionRevoked.code(), 1002);
        assert_eq!(ErrorCode::SessionInvalid.code(), 1003);
        assert_eq!(ErrorCode::LimitExceeded.code(), 2001);
        assert_eq!(ErrorCode::PaymentFailed.code(), 4001);
        assert_eq!(ErrorCode::PaymentTimeout.code(), 4002);
        assert_eq!(ErrorCode::NetworkError.code(), 5001);
        assert_eq!(ErrorCode::X402ParseError.code(), 6001);
        assert_eq!(ErrorCode::TokenExpired.code(), 7001);
        assert_eq!(ErrorCode::TokenInvalid.code(), 7002);
        assert_eq!(ErrorCode::TokenRevoked.code(), 7003);
    }

    #[test]
    fn test_retryability() {
        assert!(ErrorCode::PaymentTimeout.retryable());
        assert!(ErrorCode::NetworkError.retryable());
        assert!(!ErrorCode::LimitExceeded.retryable());
        assert!(!ErrorCode::SessionExpired.retryable());
        assert!(!ErrorCode::X402ParseError.retryable());
    }

    #[test]
    fn test_policy_error_mapping() {
        assert_eq!(PolicyError::Expired.code(), ErrorCode::SessionExpired);
        let e = PolicyError::PerTxExceeded {
            reason: "per-transaction limit".into(),
        };
        assert_eq!(e.code(), ErrorCode::LimitExceeded);
    }

    #[test]
    fn test_engine_error_details() {
        let err = EngineError::Transient(TransientError::Timeout);
        let details = err.details();
        assert_eq!(details.code, 4002);
        assert!(details.retryable);
        assert!(!details.remediation.is_empty());
    }
}
