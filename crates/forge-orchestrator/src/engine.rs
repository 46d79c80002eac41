use crate::config::{ForgeConfig, StoreBackend};
use crate::context::WorkflowRun;
use crate::dispatcher::Dispatcher;
use crate::monitor::{InMemoryMetrics, MetricsSink};
use crate::participant::default_registry;
use crate::registry::{ParticipantRegistry, TurnContext};
use crate::types::{GenerationRequest, GenerationResponse, WorkflowState};
use forge_agent::{ApiKeys, BackendFactory, ProviderBackendFactory, RetryPolicy};
use forge_core::{AgentRole, ErrorKind, ForgeResult, Message, StructuredResult};
use forge_cost::{CostLedger, CostRouter, InMemoryStore, KeyValueStore, SqliteStore};
use forge_sandbox::SecureExecutor;
use forge_security::{AuditLog, AuditOutcome, SanitizeResult, Sanitizer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cancels a run from outside the coordinator.
///
/// Cancelling drops the in-flight turn (killing any sandbox child it owns)
/// and forces the run to `Failed`. Clones share the same signal.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Every sender is gone, so no cancellation can arrive.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Drives runs from request to terminal state.
///
/// Each run is owned by the task that calls [`execute`](Self::execute); turns
/// within a run are strictly sequential. Runs share only the router (cost
/// ledger, routing log, response cache), the metrics sink and the audit log.
pub struct Orchestrator {
    registry: Arc<ParticipantRegistry>,
    router: Arc<CostRouter>,
    metrics: Arc<dyn MetricsSink>,
    audit: Option<Arc<AuditLog>>,
    dispatcher: Dispatcher,
    sanitizer: Sanitizer,
    max_rounds: u32,
    turn_timeout: Duration,
}

/// The configured shared store behind the cache, the ledger and the routing log.
pub(crate) fn open_store(config: &ForgeConfig) -> ForgeResult<Arc<dyn KeyValueStore>> {
    Ok(match config.store.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store_path())?),
        StoreBackend::Memory => {
            warn!("Using in-memory store, spend and cache are lost on exit");
            Arc::new(InMemoryStore::new())
        }
    })
}

impl Orchestrator {
    pub fn new(
        config: &ForgeConfig,
        registry: Arc<ParticipantRegistry>,
        router: Arc<CostRouter>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            router,
            metrics,
            audit: None,
            dispatcher: Dispatcher::new(config.workflow.max_retries),
            sanitizer: Sanitizer::default(),
            max_rounds: config.workflow.max_rounds,
            turn_timeout: config.workflow.turn_timeout(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Wires the default participants against real model providers and the
    /// strongest sandbox backend available.
    pub async fn from_config(config: &ForgeConfig, keys: &ApiKeys) -> ForgeResult<Self> {
        config.validate()?;

        let store = open_store(config)?;
        let ledger = Arc::new(CostLedger::new(
            store.clone(),
            config.budget.monthly_budget_usd,
            config.budget.cost_alert_threshold,
        ));
        let router = Arc::new(CostRouter::new(
            store,
            ledger,
            config.tiers.clone(),
            config.budget.cache_ttl(),
        ));
        let backends: Arc<dyn BackendFactory> = Arc::new(ProviderBackendFactory::new(
            &config.tiers,
            keys,
            RetryPolicy::default(),
        ));
        let executor = Arc::new(SecureExecutor::from_config(&config.sandbox).await?);
        info!(
            backend = executor.backend_name(),
            degraded = executor.is_degraded(),
            "Sandbox ready"
        );

        let registry = default_registry(&config.tiers, router.clone(), backends, executor);
        let audit = Arc::new(AuditLog::new(config.data_dir.join("audit")));

        Ok(Self::new(config, Arc::new(registry), router, Arc::new(InMemoryMetrics::new()))
            .with_audit(audit))
    }

    pub fn router(&self) -> &Arc<CostRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    /// Runs one request to completion.
    pub async fn execute(&self, request: GenerationRequest) -> ForgeResult<GenerationResponse> {
        self.execute_with_cancel(request, CancelToken::new()).await
    }

    /// Runs many requests concurrently. Results are in request order.
    pub async fn execute_many(
        &self,
        requests: Vec<GenerationRequest>,
    ) -> Vec<ForgeResult<GenerationResponse>> {
        futures_util::future::join_all(requests.into_iter().map(|r| self.execute(r))).await
    }

    /// Runs one request, stopping early if `cancel` fires.
    ///
    /// Errors are returned only for invalid requests; everything that goes
    /// wrong during the run is recorded in the response.
    pub async fn execute_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancelToken,
    ) -> ForgeResult<GenerationResponse> {
        request.validate()?;
        let mut run = WorkflowRun::new(request.to_payload());
        let run_id = run.id();
        info!(run_id = %run_id, project = %request.project_name, "Run started");
        self.audit(
            run_id,
            "run_started",
            None,
            serde_json::json!({"project_name": request.project_name}),
            AuditOutcome::Success,
        );

        let opening = serde_json::to_string(run.requirements())?;
        run.push_message(Message::user(opening, run_id));

        let mut next = self.dispatcher.select_next(&mut run);
        while let Some(role) = next {
            if run.rounds() >= self.max_rounds {
                run.fail(
                    None,
                    ErrorKind::RoundLimit,
                    format!("round limit of {} reached", self.max_rounds),
                );
                break;
            }
            if cancel.is_cancelled() {
                run.fail(None, ErrorKind::Cancelled, "run cancelled");
                break;
            }
            let round = run.begin_round();

            let participant = match self.registry.get(role) {
                Ok(p) => p,
                Err(e) => {
                    run.fail(Some(role), ErrorKind::Internal, e.to_string());
                    break;
                }
            };
            let ctx = TurnContext {
                run_id,
                state: run.state(),
                requirements: run.requirements().clone(),
                artifacts: run.artifacts().clone(),
                last_error: run.errors().last().cloned(),
                retry_count: run.retry_count(),
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tokio::time::timeout(self.turn_timeout, participant.handler.respond(&ctx)) => Some(res),
            };
            let latency = started.elapsed();

            let raw = match outcome {
                None => {
                    warn!(run_id = %run_id, participant = %role, "Run cancelled during turn");
                    run.fail(Some(role), ErrorKind::Cancelled, "run cancelled");
                    break;
                }
                Some(Err(_)) => {
                    warn!(run_id = %run_id, participant = %role, timeout_secs = self.turn_timeout.as_secs(), "Turn timed out");
                    failed_turn(
                        role,
                        ErrorKind::Timeout,
                        format!("no response within {}s", self.turn_timeout.as_secs()),
                    )?
                }
                Some(Ok(Err(e))) => {
                    warn!(run_id = %run_id, participant = %role, error = %e, "Turn failed");
                    failed_turn(role, ErrorKind::Backend, e.to_string())?
                }
                Some(Ok(Ok(output))) => {
                    run.add_usage(output.cost_usd, output.tokens_used);
                    self.metrics.record_turn(role, latency, output.tokens_used).await;
                    if let Some(tier) = output.tier {
                        self.metrics.record_cost(tier, output.cost_usd).await;
                    }
                    match self.sanitizer.sanitize(&output.raw) {
                        SanitizeResult::Clean(s) | SanitizeResult::Cleaned(s) => s,
                        SanitizeResult::Rejected(reason) => {
                            error!(run_id = %run_id, participant = %role, reason = %reason, "Participant output rejected");
                            run.fail(Some(role), ErrorKind::ContractViolation, reason);
                            break;
                        }
                    }
                }
            };

            run.push_message(Message::from_participant(role, raw, run_id));
            let state_before = run.state();
            next = self.dispatcher.select_next(&mut run);
            self.audit(
                run_id,
                "turn",
                Some(role),
                serde_json::json!({
                    "round": round,
                    "from": state_before,
                    "to": run.state(),
                    "latency_ms": latency.as_millis() as u64,
                }),
                if run.state() == WorkflowState::Failed {
                    AuditOutcome::Error
                } else {
                    AuditOutcome::Success
                },
            );
        }

        if !run.machine().is_terminal() {
            run.fail(None, ErrorKind::Internal, "no participant selected for a live run");
        }

        for err in run.errors() {
            self.metrics.record_error(err.participant, err.kind).await;
        }
        self.metrics.record_workflow(run.state()).await;

        let response = run.into_response();
        info!(
            run_id = %run_id,
            final_state = %response.final_state,
            rounds = response.rounds,
            retries = response.retries,
            cost_usd = response.total_cost_usd,
            duration_ms = response.duration_ms,
            "Run finished"
        );
        self.audit(
            run_id,
            "run_finished",
            None,
            serde_json::json!({
                "final_state": response.final_state,
                "rounds": response.rounds,
                "retries": response.retries,
                "cost_usd": response.total_cost_usd,
            }),
            if response.success {
                AuditOutcome::Success
            } else {
                AuditOutcome::Error
            },
        );
        Ok(response)
    }

    fn audit(
        &self,
        run_id: Uuid,
        action: &str,
        participant: Option<AgentRole>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        if let Some(audit) = &self.audit {
            audit.log_action(run_id, action, participant, details, outcome);
        }
    }
}

/// Error envelope standing in for a turn that produced no output.
fn failed_turn(role: AgentRole, kind: ErrorKind, message: String) -> ForgeResult<String> {
    let mut envelope = StructuredResult::error(role, "turn", message);
    envelope
        .result
        .insert("kind".into(), serde_json::to_value(kind)?);
    envelope.to_json()
}
