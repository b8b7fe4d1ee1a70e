use std::error::Error as StdError;

use thiserror::Error;

use crate::pipeline::Phase;
use crate::schema::SchemaViolation;

/// Scriptclone's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Scriptclone's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The credential was empty at call time. No request was made.
    #[error("missing credential: set an API key before running a stage")]
    MissingCredential,

    /// The generation service call failed or its output did not satisfy the schema.
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationFailure),

    /// The pipeline does not accept `intent` in `phase`. The state is unchanged.
    #[error("'{intent}' is not accepted while the pipeline is in {phase}")]
    Rejected { phase: Phase, intent: &'static str },

    /// The transcript or topic passed with `intent` was blank. The state is unchanged.
    #[error("'{intent}' needs non-empty input")]
    EmptyInput { intent: &'static str },

    /// A credential provider failed to read or persist its value.
    #[error("credential provider: {0}")]
    Credential(String),

    /// The worker running a stage call went away before producing an outcome.
    #[error("stage call aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error came from a stage call (as opposed to misuse of the pipeline).
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::Generation(_) | Self::Aborted(_)
        )
    }
}

/// Why a single structured generation call failed.
///
/// The cause is kept for logging; control flow only needs to know that the call failed.
#[derive(Debug, Error)]
pub enum GenerationFailure {
    /// The request never completed (DNS, TLS, timeout, connection reset).
    #[error("request failed: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),

    /// The service answered with a non-success status (auth, quota, bad request).
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered but produced no text to parse.
    #[error("service returned no usable payload")]
    EmptyPayload,

    /// The payload was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The payload was JSON but did not satisfy the closed schema.
    #[error("payload does not match the response schema: {0}")]
    Schema(#[from] SchemaViolation),

    /// The payload passed validation but could not be decoded into the typed artifact.
    #[error("payload could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

impl GenerationFailure {
    pub fn transport(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_a_stage_failure() {
        assert!(Error::MissingCredential.is_stage_failure());
        assert!(Error::from(GenerationFailure::EmptyPayload).is_stage_failure());
    }

    #[test]
    fn rejected_is_not_a_stage_failure() {
        let err = Error::Rejected {
            phase: Phase::Analyzing,
            intent: "submit",
        };
        assert!(!err.is_stage_failure());
        assert_eq!(
            err.to_string(),
            "'submit' is not accepted while the pipeline is in analyzing"
        );
    }

    #[test]
    fn status_failure_keeps_body_in_message() {
        let err = Error::from(GenerationFailure::Status {
            status: 429,
            body: "quota exceeded".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "generation failed: service returned status 429: quota exceeded"
        );
    }
}
