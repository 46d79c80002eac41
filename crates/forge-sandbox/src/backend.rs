use async_trait::async_trait;
use forge_core::ForgeResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unsanitized outcome of one isolated run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawExecution {
    /// Process exit code; `None` when the run was killed.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// The wall-clock limit was hit. `stdout`/`stderr` hold partial output.
    pub timed_out: bool,
}

impl RawExecution {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// An environment able to run untrusted Python source.
///
/// Implementations must enforce `timeout` themselves and must not leave the
/// child running once the returned future is dropped.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short identifier reported in execution results.
    fn name(&self) -> &str;

    /// A degraded backend offers weaker isolation than a container and is only
    /// trusted with low-risk code.
    fn degraded(&self) -> bool;

    async fn run(&self, code: &str, timeout: Duration) -> ForgeResult<RawExecution>;
}
