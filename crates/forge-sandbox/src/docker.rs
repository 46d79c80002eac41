//! Container backend built on the Docker Engine API.
//!
//! Each run gets a fresh container: the source directory is bind-mounted
//! read-only at `/code`, the root filesystem is read-only, networking is off,
//! all capabilities are dropped, privilege escalation is disabled and the
//! process runs as `nobody`. Memory and swap share one cap. On timeout the
//! container is force-removed; a container whose run future is dropped is
//! removed in the background.

use crate::backend::{IsolationBackend, RawExecution};
use crate::config::SandboxConfig;
use async_trait::async_trait;
use bollard::{
    container::{
        Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    models::HostConfig,
    Docker,
};
use forge_core::{ForgeError, ForgeResult};
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CPU_PERIOD: i64 = 100_000;

pub struct DockerBackend {
    client: Docker,
    config: SandboxConfig,
}

impl DockerBackend {
    /// Connect to the local Docker daemon and ping it.
    pub async fn connect(config: SandboxConfig) -> ForgeResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ForgeError::Sandbox(format!("Failed to connect to Docker daemon: {e}")))?;

        client
            .ping()
            .await
            .map_err(|e| ForgeError::Sandbox(format!("Docker daemon ping failed: {e}")))?;

        info!(image = %config.image, "Docker isolation backend ready");
        Ok(Self { client, config })
    }

    fn host_config(&self, code_dir: &str) -> HostConfig {
        let memory_bytes = (self.config.memory_limit_mb * 1024 * 1024) as i64;
        HostConfig {
            binds: Some(vec![format!("{code_dir}:/code:ro")]),
            memory: Some(memory_bytes),
            memory_swap: Some(memory_bytes),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some((CPU_PERIOD as f64 * self.config.cpu_limit) as i64),
            network_mode: if self.config.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    async fn collect_logs(&self, id: &str, raw: &mut RawExecution) {
        let mut logs = Box::pin(self.client.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    raw.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    raw.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    error!(container_id = %id, error = %e, "Error reading container logs");
                    break;
                }
            }
        }
    }
}

/// Force-removes the container when dropped, including when the awaiting run
/// is cancelled mid-flight.
struct ContainerGuard {
    client: Docker,
    id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let client = self.client.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let removed = client
                        .remove_container(
                            &id,
                            Some(RemoveContainerOptions {
                                force: true,
                                ..Default::default()
                            }),
                        )
                        .await;
                    match removed {
                        Ok(()) => debug!(container_id = %id, "Container removed"),
                        Err(e) => warn!(container_id = %id, error = %e, "Container removal failed"),
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %id, "No runtime to remove container; it may still exist");
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn degraded(&self) -> bool {
        false
    }

    async fn run(&self, code: &str, timeout: Duration) -> ForgeResult<RawExecution> {
        let code_dir = tempfile::tempdir()?;
        tokio::fs::write(code_dir.path().join("code.py"), code).await?;
        let code_dir_str = code_dir.path().to_string_lossy().into_owned();

        let container_config = ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["python".to_string(), "/code/code.py".to_string()]),
            working_dir: Some("/code".to_string()),
            user: Some("nobody:nogroup".to_string()),
            network_disabled: Some(!self.config.network_enabled),
            env: Some(Vec::new()),
            host_config: Some(self.host_config(&code_dir_str)),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, container_config)
            .await
            .map_err(|e| ForgeError::Sandbox(format!("Failed to create container: {e}")))?;

        let guard = ContainerGuard {
            client: self.client.clone(),
            id: created.id.clone(),
        };

        self.client
            .start_container(&guard.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ForgeError::Sandbox(format!("Failed to start container: {e}")))?;

        debug!(container_id = %guard.id, "Container started");

        let mut wait = Box::pin(
            self.client
                .wait_container(&guard.id, None::<WaitContainerOptions<String>>),
        );

        let mut raw = RawExecution::default();
        match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(status))) => raw.exit_code = Some(status.status_code),
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                raw.exit_code = Some(code);
            }
            Ok(Some(Err(e))) => {
                return Err(ForgeError::Sandbox(format!("Failed waiting on container: {e}")));
            }
            Ok(None) => {
                return Err(ForgeError::Sandbox(
                    "Container wait stream ended without status".to_string(),
                ));
            }
            Err(_) => {
                warn!(
                    container_id = %guard.id,
                    timeout_secs = timeout.as_secs(),
                    "Container execution timed out"
                );
                raw.timed_out = true;
            }
        }
        drop(wait);

        self.collect_logs(&guard.id, &mut raw).await;

        debug!(
            container_id = %guard.id,
            exit_code = ?raw.exit_code,
            stdout_len = raw.stdout.len(),
            stderr_len = raw.stderr.len(),
            "Container execution finished"
        );
        // Guard drop force-removes the container.
        drop(guard);
        Ok(raw)
    }
}
