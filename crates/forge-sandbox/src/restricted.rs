//! Degraded fallback: an isolated `python3` child with an allow-listed
//! builtins table.
//!
//! The interpreter runs with `-I -S -B` (isolated mode, no `site`, no
//! bytecode), an environment holding only a minimal `PATH`, and a throwaway
//! working directory. The source is piped over stdin to a bootstrap that
//! compiles it and executes it with a `__builtins__` dict that has no
//! `open`, `__import__`, `eval` or `exec`. This is weaker than a container,
//! so the backend reports itself as degraded.

use crate::backend::{IsolationBackend, RawExecution};
use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

const BOOTSTRAP: &str = r#"
import sys
_src = sys.stdin.read()
import builtins as _b
_allowed = (
    "print", "len", "range", "str", "int", "float", "list", "dict", "tuple",
    "set", "bool", "abs", "min", "max", "sum", "sorted", "enumerate", "zip",
    "map", "filter", "any", "all", "isinstance", "round", "reversed",
    "Exception", "ValueError", "TypeError", "KeyError", "IndexError",
    "ZeroDivisionError", "AssertionError", "RuntimeError", "StopIteration",
    "__build_class__", "object", "super", "property", "staticmethod",
    "classmethod",
)
_safe = {n: getattr(_b, n) for n in _allowed}
_g = {"__builtins__": _safe, "__name__": "__main__", "__doc__": None, "__package__": None}
try:
    _code = compile(_src, "<generated>", "exec")
except SyntaxError as _e:
    sys.stderr.write("Syntax error: %s\n" % _e)
    sys.exit(2)
del _b, _allowed, _src
try:
    exec(_code, _g)
except BaseException as _e:
    sys.stderr.write("Execution error: %s: %s\n" % (type(_e).__name__, _e))
    sys.exit(1)
"#;

pub struct RestrictedProcessBackend {
    interpreter: String,
}

impl RestrictedProcessBackend {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for RestrictedProcessBackend {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl IsolationBackend for RestrictedProcessBackend {
    fn name(&self) -> &str {
        "restricted-process"
    }

    fn degraded(&self) -> bool {
        true
    }

    async fn run(&self, code: &str, timeout: Duration) -> ForgeResult<RawExecution> {
        let workdir = tempfile::tempdir()?;

        let mut child = Command::new(&self.interpreter)
            .args(["-I", "-S", "-B", "-c", BOOTSTRAP])
            .env_clear()
            .env("PATH", SAFE_PATH)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ForgeError::Sandbox(format!("failed to spawn {}: {e}", self.interpreter)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForgeError::Sandbox("child stdin not captured".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForgeError::Sandbox("child stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ForgeError::Sandbox("child stderr not captured".to_string()))?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let source = code.as_bytes().to_vec();
        let (out_buf, err_buf, running) = (&mut out, &mut err, &mut child);

        let outcome = tokio::time::timeout(timeout, async move {
            let feed = async move {
                let written = stdin.write_all(&source).await;
                drop(stdin);
                written
            };
            let (fed, read_out, read_err) = tokio::join!(
                feed,
                stdout.read_to_end(out_buf),
                stderr.read_to_end(err_buf)
            );
            if let Err(e) = fed {
                // The child may exit before consuming stdin; its stderr says why.
                debug!(error = %e, "Restricted interpreter closed stdin early");
            }
            read_out?;
            read_err?;
            running.wait().await
        })
        .await;

        let raw = match outcome {
            Ok(status) => {
                let status = status?;
                RawExecution {
                    exit_code: status.code().map(i64::from),
                    stdout: String::from_utf8_lossy(&out).into_owned(),
                    stderr: String::from_utf8_lossy(&err).into_owned(),
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Restricted execution timed out, killing child");
                let _ = child.start_kill();
                let _ = child.wait().await;
                RawExecution {
                    exit_code: None,
                    stdout: String::from_utf8_lossy(&out).into_owned(),
                    stderr: String::from_utf8_lossy(&err).into_owned(),
                    timed_out: true,
                }
            }
        };

        debug!(
            exit_code = ?raw.exit_code,
            stdout_len = raw.stdout.len(),
            stderr_len = raw.stderr.len(),
            "Restricted execution finished"
        );
        Ok(raw)
    }
}
