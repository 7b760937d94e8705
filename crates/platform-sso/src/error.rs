//! Error types for single sign-on operations
//!
//! Every failure of the authentication state machine is reported through
//! [`AuthError`]. Variants are grouped into the coarse [`ErrorKind`]s that
//! callers use to pick an HTTP response and a log level. None of these errors
//! is ever recovered from silently inside the engine.

use platform_replay::ReplayError;
use thiserror::Error;

/// Authentication error types.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity provider answered with an explicit error
    #[error("Provider error {code}: {}", .description.as_deref().unwrap_or("no description"))]
    Protocol {
        /// Provider error code (OAuth `error`, SAML status, CAS failure code)
        code: String,
        /// Human readable description, when supplied
        description: Option<String>,
    },

    /// State, nonce, PKCE verifier or request correlation did not match
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// Signature missing where required, or failed verification
    #[error("Signature error: {0}")]
    Signature(String),

    /// Message identifier already consumed
    #[error("Replayed message: {0}")]
    Replay(String),

    /// Token or assertion outside its validity window
    #[error("Expired or not yet valid: {0}")]
    ExpiredOrNotYetValid(String),

    /// Issuer, audience, destination or recipient mismatch
    #[error("Invalid claim: {0}")]
    InvalidClaim(String),

    /// Malformed token, XML document or encoding
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Callback carried no usable credentials
    #[error("No credentials in request")]
    MissingCredentials,

    /// Network or timeout failure talking to the provider
    #[error("Communication error: {0}")]
    Communication(String),

    /// Configuration cannot be satisfied
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not offered by the configured protocol
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Session store failure
    #[error("Session error: {0}")]
    Session(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Coarse failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Provider returned an error response
    Protocol,
    /// Possible CSRF or session fixation
    StateMismatch,
    /// Signature missing or invalid
    Signature,
    /// Message reused
    Replay,
    /// Outside validity window
    ExpiredOrNotYetValid,
    /// Provider unreachable or too slow
    Communication,
    /// Misconfiguration, detected at construction
    Configuration,
    /// Claim or message content rejected
    Validation,
    /// Everything else
    Internal,
}

impl AuthError {
    /// Build a protocol error from a provider code and optional description.
    pub fn protocol(code: impl Into<String>, description: Option<String>) -> Self {
        AuthError::Protocol {
            code: code.into(),
            description,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Protocol { .. } => ErrorKind::Protocol,
            AuthError::StateMismatch(_) => ErrorKind::StateMismatch,
            AuthError::Signature(_) => ErrorKind::Signature,
            AuthError::Replay(_) => ErrorKind::Replay,
            AuthError::ExpiredOrNotYetValid(_) => ErrorKind::ExpiredOrNotYetValid,
            AuthError::Communication(_) => ErrorKind::Communication,
            AuthError::Configuration(_) | AuthError::Unsupported(_) => ErrorKind::Configuration,
            AuthError::InvalidClaim(_)
            | AuthError::InvalidMessage(_)
            | AuthError::MissingCredentials => ErrorKind::Validation,
            AuthError::Session(_) | AuthError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error should be logged at error level.
    ///
    /// Rejections of forged or stale input are expected traffic and are
    /// logged at warning level by the engine itself.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Internal | ErrorKind::Communication
        )
    }

    /// Check if this error indicates a possibly forged or replayed request.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StateMismatch | ErrorKind::Signature | ErrorKind::Replay
        )
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::StateMismatch(_)
            | AuthError::Signature(_)
            | AuthError::Replay(_)
            | AuthError::ExpiredOrNotYetValid(_)
            | AuthError::InvalidClaim(_)
            | AuthError::Protocol { .. } => 401,

            AuthError::InvalidMessage(_) | AuthError::MissingCredentials => 400,

            AuthError::Communication(_) => 502,

            AuthError::Unsupported(_) => 501,

            AuthError::Configuration(_) | AuthError::Session(_) | AuthError::Internal(_) => 500,
        }
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::Protocol { .. } => "PROVIDER_ERROR",
            AuthError::StateMismatch(_) => "STATE_MISMATCH",
            AuthError::Signature(_) => "INVALID_SIGNATURE",
            AuthError::Replay(_) => "REPLAY_DETECTED",
            AuthError::ExpiredOrNotYetValid(_) => "EXPIRED_OR_NOT_YET_VALID",
            AuthError::InvalidClaim(_) => "INVALID_CLAIM",
            AuthError::InvalidMessage(_) => "INVALID_MESSAGE",
            AuthError::MissingCredentials => "MISSING_CREDENTIALS",
            AuthError::Communication(_) => "COMMUNICATION_ERROR",
            AuthError::Configuration(_) => "CONFIG_ERROR",
            AuthError::Unsupported(_) => "UNSUPPORTED",
            AuthError::Session(_) => "SESSION_ERROR",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ReplayError> for AuthError {
    fn from(err: ReplayError) -> Self {
        AuthError::Internal(format!("Replay cache unavailable: {}", err))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Communication(format!("request timed out: {}", err))
        } else if err.is_decode() {
            AuthError::InvalidMessage(format!("undecodable provider response: {}", err))
        } else {
            AuthError::Communication(err.to_string())
        }
    }
}
