use crate::backend::IsolationBackend;
use crate::config::SandboxConfig;
use crate::restricted::RestrictedProcessBackend;
use forge_core::ForgeResult;
use forge_security::{CodeSecurityScanner, OutputRedactor, RiskLevel, SecurityScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SecurityRejected,
    Runtime,
    Timeout,
    Backend,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::SecurityRejected => "security_rejected",
            FailureKind::Runtime => "runtime",
            FailureKind::Timeout => "timeout",
            FailureKind::Backend => "backend",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Redacted, truncated stdout.
    pub output: String,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub duration_ms: u64,
    pub backend: String,
    pub degraded: bool,
    pub scan: SecurityScanResult,
}

/// Scans code and, when the scan allows it, runs it on an [`IsolationBackend`].
///
/// High-risk code never runs. Medium-risk code runs only when the backend is
/// not degraded. Everything returned to the caller passes through the
/// [`OutputRedactor`].
pub struct SecureExecutor {
    scanner: CodeSecurityScanner,
    redactor: OutputRedactor,
    backend: Arc<dyn IsolationBackend>,
    timeout: Duration,
}

impl SecureExecutor {
    pub fn new(backend: Arc<dyn IsolationBackend>, timeout: Duration) -> ForgeResult<Self> {
        Ok(Self {
            scanner: CodeSecurityScanner::new()?,
            redactor: OutputRedactor::new()?,
            backend,
            timeout,
        })
    }

    /// Build an executor on the strongest backend available.
    ///
    /// With the `docker` feature the container backend is tried first; if the
    /// daemon is unreachable the restricted interpreter is used and every
    /// result is flagged as degraded.
    pub async fn from_config(config: &SandboxConfig) -> ForgeResult<Self> {
        config.validate()?;
        let backend = select_backend(config).await;
        Self::new(backend, config.timeout())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_degraded(&self) -> bool {
        self.backend.degraded()
    }

    pub fn scan(&self, code: &str) -> SecurityScanResult {
        self.scanner.scan(code)
    }

    pub async fn execute(&self, code: &str) -> ExecutionResult {
        let started = Instant::now();
        let scan = self.scanner.scan(code);

        if !scan.safe {
            let refusal = match scan.risk_level {
                RiskLevel::High => Some("high-risk code is never executed".to_string()),
                RiskLevel::Medium if self.backend.degraded() => Some(format!(
                    "medium-risk code requires a non-degraded isolation backend (have {})",
                    self.backend.name()
                )),
                _ => None,
            };
            if let Some(reason) = refusal {
                warn!(
                    risk = %scan.risk_level,
                    violations = scan.violations.len(),
                    backend = self.backend.name(),
                    "Execution refused by security scan"
                );
                let error = format!(
                    "Security scan failed ({reason}): {}",
                    scan.violations.join("; ")
                );
                return self.finish(started, false, String::new(), Some(error), Some(FailureKind::SecurityRejected), scan);
            }
        }

        match self.backend.run(code, self.timeout).await {
            Ok(raw) if raw.timed_out => {
                let error = format!("Execution timed out after {}s", self.timeout.as_secs());
                let output = self.redactor.redact(&raw.stdout);
                self.finish(started, false, output, Some(error), Some(FailureKind::Timeout), scan)
            }
            Ok(raw) if raw.succeeded() => {
                let output = self.redactor.redact(&raw.stdout);
                self.finish(started, true, output, None, None, scan)
            }
            Ok(raw) => {
                let output = self.redactor.redact(&raw.stdout);
                let stderr = self.redactor.redact(raw.stderr.trim());
                let error = match raw.exit_code {
                    Some(code) if stderr.is_empty() => format!("Process exited with code {code}"),
                    _ => stderr,
                };
                self.finish(started, false, output, Some(error), Some(FailureKind::Runtime), scan)
            }
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Isolation backend failed");
                let error = self.redactor.redact(&e.to_string());
                self.finish(started, false, String::new(), Some(error), Some(FailureKind::Backend), scan)
            }
        }
    }

    fn finish(
        &self,
        started: Instant,
        success: bool,
        output: String,
        error: Option<String>,
        failure_kind: Option<FailureKind>,
        scan: SecurityScanResult,
    ) -> ExecutionResult {
        let result = ExecutionResult {
            success,
            output,
            error,
            failure_kind,
            duration_ms: started.elapsed().as_millis() as u64,
            backend: self.backend.name().to_string(),
            degraded: self.backend.degraded(),
            scan,
        };
        info!(
            success = result.success,
            failure_kind = ?result.failure_kind,
            backend = %result.backend,
            duration_ms = result.duration_ms,
            "Execution finished"
        );
        result
    }
}

#[cfg(feature = "docker")]
async fn select_backend(config: &SandboxConfig) -> Arc<dyn IsolationBackend> {
    match crate::docker::DockerBackend::connect(config.clone()).await {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            warn!(error = %e, "Docker unavailable, using degraded restricted interpreter");
            Arc::new(RestrictedProcessBackend::new(config.interpreter.clone()))
        }
    }
}

#[cfg(not(feature = "docker"))]
async fn select_backend(config: &SandboxConfig) -> Arc<dyn IsolationBackend> {
    warn!("Built without container support, using degraded restricted interpreter");
    Arc::new(RestrictedProcessBackend::new(config.interpreter.clone()))
}
