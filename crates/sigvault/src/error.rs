//! error types for sigvault

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// message shown for every password or envelope failure
pub const VAULT_FAILURE_MESSAGE: &str = "incorrect password or corrupted vault";

/// message shown for every ceremony failure
pub const SIGNING_FAILURE_MESSAGE: &str = "signing failed";

#[derive(Debug, Error)]
pub enum Error {
    // === input errors ===
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    // === vault errors ===
    /// password or auth hash mismatch
    #[error("incorrect password or corrupted vault")]
    AuthenticationFailure,

    /// tag mismatch, wrong key or malformed envelope
    #[error("incorrect password or corrupted vault")]
    DecryptionFailure,

    #[error("rate limited: retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    // === share store errors ===
    #[error("share not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("share is leased by another ceremony")]
    ShareBusy,

    // === ceremony errors ===
    #[error("quorum not met: have {have}, need {need}")]
    QuorumNotMet { have: usize, need: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("domain unavailable: {0}")]
    DomainUnavailable(String),

    #[error("round timed out after {0:?}")]
    Timeout(Duration),

    #[error("wipe not confirmed by domain {0}")]
    WipeUnconfirmed(String),

    #[error("attestation rejected: {0}")]
    AttestationRejected(String),
}

impl Error {
    /// the only text a remote client is allowed to see
    pub fn client_message(&self) -> &'static str {
        match self {
            Error::AuthenticationFailure | Error::DecryptionFailure => VAULT_FAILURE_MESSAGE,
            Error::QuorumNotMet { .. }
            | Error::ProtocolViolation(_)
            | Error::DomainUnavailable(_)
            | Error::Timeout(_)
            | Error::WipeUnconfirmed(_)
            | Error::AttestationRejected(_)
            | Error::ShareBusy
            | Error::NotFound
            | Error::AccessDenied => SIGNING_FAILURE_MESSAGE,
            Error::InvalidInput(_) => "invalid request",
            Error::RateLimited { .. } => "too many attempts",
            Error::Config(_) | Error::Storage(_) => "internal error",
        }
    }

    /// failures a fresh ceremony with another participant subset may get past
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumNotMet { .. }
                | Error::DomainUnavailable(_)
                | Error::Timeout(_)
                | Error::ProtocolViolation(_)
                | Error::WipeUnconfirmed(_)
                | Error::AttestationRejected(_)
                | Error::ShareBusy
        )
    }
}
