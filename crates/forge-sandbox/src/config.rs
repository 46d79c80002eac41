use forge_core::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits and image for sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container image (default: "python:3.11-alpine").
    #[serde(default = "default_image")]
    pub image: String,

    /// Memory limit in megabytes; swap is capped to the same value (default: 1024).
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// CPU core share (default: 0.5).
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Wall-clock timeout in seconds (default: 300).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether networking is enabled inside the container (default: false).
    #[serde(default)]
    pub network_enabled: bool,

    /// Interpreter used by the restricted fallback (default: "python3").
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_image() -> String {
    "python:3.11-alpine".to_string()
}

fn default_memory_limit_mb() -> u64 {
    1024
}

fn default_cpu_limit() -> f64 {
    0.5
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_interpreter() -> String {
    "python3".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            timeout_secs: default_timeout_secs(),
            network_enabled: false,
            interpreter: default_interpreter(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.memory_limit_mb == 0 {
            return Err(ForgeError::Config(
                "sandbox.memory_limit_mb must be positive".to_string(),
            ));
        }
        if !(self.cpu_limit > 0.0 && self.cpu_limit.is_finite()) {
            return Err(ForgeError::Config(
                "sandbox.cpu_limit must be a positive number".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ForgeError::Config(
                "sandbox.timeout_secs must be positive".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(ForgeError::Config("sandbox.image is empty".to_string()));
        }
        Ok(())
    }
}
