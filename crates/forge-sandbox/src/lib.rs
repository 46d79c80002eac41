//! Secure execution of generated code for Forge.
//!
//! Code is first scanned by [`forge_security::CodeSecurityScanner`]; only code
//! the scan allows is handed to an [`IsolationBackend`]. The container backend
//! (feature `docker`) is preferred; the restricted interpreter is a degraded
//! fallback that refuses medium-risk code.

pub mod backend;
pub mod config;
#[cfg(feature = "docker")]
pub mod docker;
pub mod executor;
pub mod restricted;

pub use backend::{IsolationBackend, RawExecution};
pub use config::SandboxConfig;
#[cfg(feature = "docker")]
pub use docker::DockerBackend;
pub use executor::{ExecutionResult, FailureKind, SecureExecutor};
pub use restricted::RestrictedProcessBackend;
