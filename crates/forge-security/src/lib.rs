//! Security primitives for Forge.
//!
//! Provides the static scanner that gates sandbox execution, sanitization of
//! participant input and sandbox output, and the run audit trail.
//!
//! # Main types
//!
//! - [`CodeSecurityScanner`] - Lexical scanner for generated Python code.
//! - [`SecurityScanResult`] - Safe flag, [`RiskLevel`], violations and warnings.
//! - [`Sanitizer`] - Control-character and length checks on raw input.
//! - [`OutputRedactor`] - Path/IP/URL redaction and truncation of output.
//! - [`AuditLog`] - Append-only audit trail persisted to disk.

/// Audit logging module.
pub mod audit;
/// Input sanitization and output redaction.
pub mod sanitizer;
/// Static code scanning.
pub mod scanner;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use sanitizer::{OutputRedactor, SanitizeResult, Sanitizer};
pub use scanner::{check_syntax, CodeSecurityScanner, RiskLevel, SecurityScanResult};
