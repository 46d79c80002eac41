use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`ForgeError`].
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Top-level error type for the Forge workspace.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// A participant produced output that does not satisfy the result envelope.
    #[error("Contract violation: {0}")]
    Contract(String),

    /// The state machine was asked to fire an event with no matching edge.
    #[error("Invalid transition: no edge for '{event}' from state '{from}'")]
    InvalidTransition {
        /// State the machine was in.
        from: String,
        /// Event that was attempted.
        event: String,
    },

    /// An error originating from a participant or model backend.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from an outbound HTTP request (e.g. a completion API call).
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A security-related error (scan failure, policy refusal).
    #[error("Security error: {0}")]
    Security(String),

    /// An error from the isolation backend used to run generated code.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// The key-value store backing the cache and cost ledger failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An error from the run coordinator.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The run was cancelled by its owner.
    #[error("Run cancelled")]
    Cancelled,

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of an error recorded against a run.
///
/// Only [`ErrorKind::StageError`], [`ErrorKind::Timeout`] and
/// [`ErrorKind::Backend`] consume a retry; every other kind is either fatal
/// or informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Output failed envelope validation. Fatal.
    ContractViolation,
    /// A participant reported `status = error` inside a valid envelope.
    StageError,
    /// The participant did not answer within the turn deadline.
    Timeout,
    /// The model backend failed (HTTP, failover exhausted).
    Backend,
    /// The retry ceiling was exceeded. Fatal.
    RetryLimit,
    /// The round limit was exceeded. Fatal.
    RoundLimit,
    /// The run was cancelled. Fatal.
    Cancelled,
    /// An internal invariant was broken (e.g. illegal transition). Fatal.
    Internal,
}

impl ErrorKind {
    /// Whether this kind counts against the retry ceiling.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::StageError | ErrorKind::Timeout | ErrorKind::Backend
        )
    }
}
