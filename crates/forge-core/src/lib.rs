//! Core types and error definitions for Forge.
//!
//! This crate provides the foundational types shared across all Forge crates,
//! including error handling, participant identities, chat messages, and the
//! structured result envelope every participant must produce.
//!
//! # Main types
//!
//! - [`ForgeError`] - Unified error enum for all Forge subsystems.
//! - [`ForgeResult`] - Convenience alias for `Result<T, ForgeError>`.
//! - [`ErrorKind`] - Classification of errors recorded against a run.
//! - [`AgentRole`] - The fixed set of pipeline participants.
//! - [`Message`] - A single message within a run's transcript.
//! - [`StructuredResult`] - The validated participant result envelope.
//! - [`parse_structured_result`] - Strict envelope validator.

/// Structured result envelope and its validator.
pub mod envelope;
/// Error types.
pub mod error;
/// Message types.
pub mod message;
/// Participant identities.
pub mod role;

pub use envelope::{
    parse_structured_result, ContractViolation, ResultMetadata, ResultStatus, StructuredResult,
};
pub use error::{ErrorKind, ForgeError, ForgeResult};
pub use message::{Message, Role};
pub use role::AgentRole;
