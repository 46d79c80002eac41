//! End-to-end orchestration tests.
//!
//! Runs the full pipeline through the engine with a scripted model backend
//! and a scripted isolation backend, so every participant goes through the
//! real router, cost ledger, response cache, dispatcher and state machine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use forge_agent::{BackendFactory, Completion, LlmBackend, ModelTier, TierTable};
use forge_core::{AgentRole, ErrorKind, ForgeError, ForgeResult, Message, StructuredResult};
use forge_cost::{CostLedger, CostRouter, InMemoryStore, KeyValueStore};
use forge_orchestrator::*;
use forge_sandbox::{IsolationBackend, RawExecution, SecureExecutor};
use forge_security::AuditLog;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scripted model backend
// ---------------------------------------------------------------------------

type Script = Arc<dyn Fn(AgentRole, &Value) -> String + Send + Sync>;

struct ScriptedModel {
    script: Script,
    tokens: u64,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmBackend for ScriptedModel {
    async fn complete(&self, system: Option<&str>, messages: &[Message]) -> ForgeResult<Completion> {
        let payload: Value = serde_json::from_str(&messages[0].content).unwrap();
        let role: AgentRole = serde_json::from_value(payload["participant"].clone()).unwrap();
        assert!(system.unwrap().contains(role.as_str()));
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            text: (self.script)(role, &payload),
            tokens_used: self.tokens,
            model: "scripted".into(),
        })
    }
}

struct Models(Arc<ScriptedModel>);

impl BackendFactory for Models {
    fn backend(&self, _tier: ModelTier) -> ForgeResult<Arc<dyn LlmBackend>> {
        Ok(self.0.clone())
    }
}

/// The answer a well-behaved participant gives.
fn success_reply(role: AgentRole, payload: &Value) -> String {
    let project = payload["requirements"]["project_name"].clone();
    let result = match role {
        AgentRole::CodeGenerator => json!({
            "code": "def add(a, b):\n    return a + b\n",
            "project": project,
        }),
        AgentRole::TestRunner => json!({
            "tests": "assert add(2, 3) == 5\n",
            "project": project,
        }),
        _ => json!({"summary": format!("{role} done"), "project": project}),
    };
    StructuredResult::success(role, "work", result).to_json().unwrap()
}

fn well_behaved() -> Script {
    Arc::new(success_reply)
}

// ---------------------------------------------------------------------------
// Scripted sandbox
// ---------------------------------------------------------------------------

struct ScriptedSandbox {
    exit_codes: Mutex<VecDeque<i64>>,
    runs: AtomicUsize,
}

impl ScriptedSandbox {
    fn new(exit_codes: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            exit_codes: Mutex::new(exit_codes.iter().copied().collect()),
            runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IsolationBackend for ScriptedSandbox {
    fn name(&self) -> &str {
        "scripted"
    }
    fn degraded(&self) -> bool {
        false
    }
    async fn run(&self, _code: &str, _timeout: Duration) -> ForgeResult<RawExecution> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let exit = self.exit_codes.lock().pop_front().unwrap_or(0);
        Ok(RawExecution {
            exit_code: Some(exit),
            stdout: String::new(),
            stderr: if exit == 0 {
                String::new()
            } else {
                "AssertionError: add(2, 3) != 5".into()
            },
            timed_out: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Orchestrator,
    model: Arc<ScriptedModel>,
    sandbox: Arc<ScriptedSandbox>,
    metrics: Arc<InMemoryMetrics>,
    router: Arc<CostRouter>,
}

fn harness_with(config: ForgeConfig, script: Script, tokens: u64, exit_codes: &[i64]) -> Harness {
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
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
    let model = Arc::new(ScriptedModel {
        script,
        tokens,
        calls: AtomicUsize::new(0),
    });
    let sandbox = ScriptedSandbox::new(exit_codes);
    let executor = Arc::new(SecureExecutor::new(sandbox.clone(), Duration::from_secs(5)).unwrap());
    let registry = default_registry(
        &config.tiers,
        router.clone(),
        Arc::new(Models(model.clone())),
        executor,
    );
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(&config, Arc::new(registry), router.clone(), metrics.clone());
    Harness {
        orchestrator,
        model,
        sandbox,
        metrics,
        router,
    }
}

fn harness(script: Script, exit_codes: &[i64]) -> Harness {
    harness_with(ForgeConfig::default(), script, 1000, exit_codes)
}

fn request(name: &str) -> GenerationRequest {
    GenerationRequest::new(name, "A small calculator library")
        .with_requirement("operations", json!(["add"]))
}

// ---------------------------------------------------------------------------
// Pipeline scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_completes() {
    let h = harness(well_behaved(), &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();

    assert!(resp.success);
    assert_eq!(resp.final_state, WorkflowState::Completed);
    assert_eq!(resp.rounds, 9);
    assert_eq!(resp.retries, 0);
    assert!(resp.errors.is_empty());
    assert!(resp.terminal_error().is_none());
    assert!(resp.total_cost_usd > 0.0);
    assert_eq!(resp.tokens_used, 9000);

    // Every stage left an artifact; the executor never speaks on its own.
    assert_eq!(resp.artifacts.len(), 8);
    assert!(!resp.artifacts.contains_key(&AgentRole::Executor));
    let tests = &resp.artifacts[&AgentRole::TestRunner];
    assert_eq!(tests["execution"]["success"], true);
    assert_eq!(tests["execution"]["backend"], "scripted");

    assert_eq!(h.model.calls.load(Ordering::SeqCst), 9);
    assert_eq!(h.sandbox.runs.load(Ordering::SeqCst), 1);
    let architect = h.metrics.get(AgentRole::SystemArchitect).await.unwrap();
    assert_eq!(architect.turns, 2);
    let snapshot = h.metrics.snapshot().await;
    assert_eq!(snapshot.workflows[&WorkflowState::Completed], 1);
}

#[tokio::test]
async fn test_failing_tests_route_back_to_code_generation() {
    let h = harness(well_behaved(), &[1]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();

    assert!(resp.success);
    assert_eq!(resp.retries, 1);
    assert_eq!(resp.errors.len(), 1);
    let err = &resp.errors[0];
    assert_eq!(err.participant, Some(AgentRole::TestRunner));
    assert_eq!(err.kind, ErrorKind::StageError);
    assert_eq!(err.state, WorkflowState::SecurityValidated);
    assert!(err.message.contains("AssertionError"));
    // Review, security and tests run a second time after the retry edge.
    assert_eq!(resp.rounds, 12);
    assert_eq!(h.sandbox.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_persistent_errors_exhaust_retries() {
    let script: Script = Arc::new(|role, payload| {
        if role == AgentRole::SystemArchitect {
            StructuredResult::error(role, "analyze_requirements", "requirements are contradictory")
                .to_json()
                .unwrap()
        } else {
            success_reply(role, payload)
        }
    });
    let h = harness(script, &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();

    assert!(!resp.success);
    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.retries, 4);
    assert_eq!(resp.rounds, 4);
    assert_eq!(resp.terminal_error().unwrap().kind, ErrorKind::RetryLimit);
    let stage_errors = resp
        .errors
        .iter()
        .filter(|e| e.kind == ErrorKind::StageError)
        .count();
    assert_eq!(stage_errors, 4);
    assert!(resp.artifacts.is_empty());
}

#[tokio::test]
async fn test_malformed_output_fails_immediately() {
    let script: Script = Arc::new(|role, payload| {
        if role == AgentRole::SystemArchitect {
            "I think the architecture should use three layers.".to_string()
        } else {
            success_reply(role, payload)
        }
    });
    let h = harness(script, &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();

    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.retries, 0);
    assert_eq!(resp.rounds, 1);
    assert_eq!(resp.errors.len(), 1);
    assert_eq!(resp.errors[0].kind, ErrorKind::ContractViolation);
    assert_eq!(resp.errors[0].participant, Some(AgentRole::SystemArchitect));
}

#[tokio::test]
async fn test_unknown_envelope_key_is_contract_violation() {
    let script: Script = Arc::new(|role, payload| {
        if role == AgentRole::PromptEngineer {
            let mut v: Value = serde_json::from_str(&success_reply(role, payload)).unwrap();
            v["confidence"] = json!(0.9);
            v.to_string()
        } else {
            success_reply(role, payload)
        }
    });
    let h = harness(script, &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();
    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.rounds, 3);
    assert_eq!(resp.retries, 0);
    assert!(resp.terminal_error().unwrap().message.contains("confidence"));
}

#[tokio::test]
async fn test_pending_forever_hits_round_limit() {
    let script: Script = Arc::new(|role, _| {
        StructuredResult::pending(role, "thinking").to_json().unwrap()
    });
    let mut config = ForgeConfig::default();
    config.workflow.max_rounds = 5;
    let h = harness_with(config, script, 10, &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();
    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.rounds, 5);
    assert_eq!(resp.retries, 0);
    assert_eq!(resp.terminal_error().unwrap().kind, ErrorKind::RoundLimit);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_running() {
    let h = harness(well_behaved(), &[]);
    let err = h
        .orchestrator
        .execute(GenerationRequest::new("", "nothing"))
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::Orchestrator(_)));
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Cost routing across runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_identical_request_served_from_cache() {
    let h = harness(well_behaved(), &[]);
    let first = h.orchestrator.execute(request("calc")).await.unwrap();
    let second = h.orchestrator.execute(request("calc")).await.unwrap();

    assert!(first.success && second.success);
    assert_ne!(first.run_id, second.run_id);
    // Stages up to the test writer see identical payloads and are served from
    // cache; later stages see execution timings and may miss.
    let calls = h.model.calls.load(Ordering::SeqCst);
    assert!((9..=11).contains(&calls), "{calls} model calls");
    assert!(second.tokens_used <= 2000);
    assert!(second.total_cost_usd < first.total_cost_usd);
    // Cached test code is still executed.
    assert_eq!(h.sandbox.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_budget_pressure_downgrades_tiers() {
    let mut config = ForgeConfig::default();
    config.budget.monthly_budget_usd = 1.0;
    config.budget.cost_alert_threshold = 0.5;
    // 10k tokens on the top tier costs 0.75, over the 0.5 threshold.
    let h = harness_with(config, well_behaved(), 10_000, &[]);
    let resp = h.orchestrator.execute(request("calc")).await.unwrap();
    assert!(resp.success);

    let log = h.router.routing_log().await;
    assert_eq!(log.len(), 9);
    assert_eq!(log[0].agent_type, AgentRole::SystemArchitect);
    assert_eq!(log[0].selected_tier, ModelTier::HighPerformance);
    assert!(!log[0].downgraded);
    assert_eq!(log[1].agent_type, AgentRole::SystemArchitect);
    assert_eq!(log[1].selected_tier, ModelTier::Standard);
    assert!(log[1..].iter().all(|r| r.downgraded));

    let analysis = h.router.analyze_routing().await;
    assert_eq!(analysis.total_decisions, 9);
    assert!(h.router.ledger().monthly_spend().await >= 0.75);
}

// ---------------------------------------------------------------------------
// Turn-level faults, cancellation, concurrency
// ---------------------------------------------------------------------------

/// Answers for its role, echoing the project name into the artifact.
struct StaticHandler {
    role: AgentRole,
}

#[async_trait]
impl ParticipantHandler for StaticHandler {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput> {
        let payload = ctx.request_payload(self.role);
        Ok(TurnOutput::local(success_reply(self.role, &payload)))
    }
}

/// Misbehaves on its first call, then answers normally.
struct FlakyArchitect {
    calls: AtomicUsize,
    first: Flake,
}

enum Flake {
    Sleep(Duration),
    Fail,
}

#[async_trait]
impl ParticipantHandler for FlakyArchitect {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            match self.first {
                Flake::Sleep(d) => tokio::time::sleep(d).await,
                Flake::Fail => return Err(ForgeError::Http("HTTP 503: overloaded".into())),
            }
        }
        StaticHandler {
            role: AgentRole::SystemArchitect,
        }
        .respond(ctx)
        .await
    }
}

fn static_registry(architect: Option<Arc<dyn ParticipantHandler>>) -> ParticipantRegistry {
    let mut registry = ParticipantRegistry::new();
    for profile in default_profiles(&TierTable::default()) {
        let role = profile.role;
        let handler: Arc<dyn ParticipantHandler> = match (&architect, role) {
            (Some(a), AgentRole::SystemArchitect) => a.clone(),
            _ => Arc::new(StaticHandler { role }),
        };
        registry.register(profile, handler);
    }
    registry
}

fn static_orchestrator(config: &ForgeConfig, registry: ParticipantRegistry) -> (Orchestrator, Arc<InMemoryMetrics>) {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(CostLedger::new(store.clone(), 1000.0, 0.8));
    let router = Arc::new(CostRouter::new(
        store,
        ledger,
        TierTable::default(),
        Duration::from_secs(60),
    ));
    let metrics = Arc::new(InMemoryMetrics::new());
    (
        Orchestrator::new(config, Arc::new(registry), router, metrics.clone()),
        metrics,
    )
}

#[tokio::test]
async fn test_turn_timeout_is_a_stage_error() {
    let mut config = ForgeConfig::default();
    config.workflow.turn_timeout_secs = 1;
    let architect = Arc::new(FlakyArchitect {
        calls: AtomicUsize::new(0),
        first: Flake::Sleep(Duration::from_secs(30)),
    });
    let (orchestrator, _) = static_orchestrator(&config, static_registry(Some(architect)));

    let resp = tokio::time::timeout(Duration::from_secs(10), orchestrator.execute(request("calc")))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.retries, 1);
    assert_eq!(resp.rounds, 10);
    assert_eq!(resp.errors[0].kind, ErrorKind::Timeout);
    assert_eq!(resp.errors[0].participant, Some(AgentRole::SystemArchitect));
}

#[tokio::test]
async fn test_backend_failure_is_a_stage_error() {
    let architect = Arc::new(FlakyArchitect {
        calls: AtomicUsize::new(0),
        first: Flake::Fail,
    });
    let (orchestrator, metrics) =
        static_orchestrator(&ForgeConfig::default(), static_registry(Some(architect)));
    let resp = orchestrator.execute(request("calc")).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.retries, 1);
    assert_eq!(resp.errors[0].kind, ErrorKind::Backend);
    assert!(resp.errors[0].message.contains("503"));
    assert_eq!(metrics.snapshot().await.errors_by_kind["backend"], 1);
}

#[tokio::test]
async fn test_cancel_stops_run_mid_turn() {
    let architect = Arc::new(FlakyArchitect {
        calls: AtomicUsize::new(0),
        first: Flake::Sleep(Duration::from_secs(60)),
    });
    let (orchestrator, metrics) =
        static_orchestrator(&ForgeConfig::default(), static_registry(Some(architect)));

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.execute_with_cancel(request("calc"), cancel),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.retries, 0);
    assert_eq!(resp.terminal_error().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(metrics.snapshot().await.workflows[&WorkflowState::Failed], 1);
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let (orchestrator, metrics) = static_orchestrator(&ForgeConfig::default(), static_registry(None));
    let names = ["alpha", "beta", "gamma", "delta"];
    let responses = orchestrator
        .execute_many(names.iter().map(|n| request(n)).collect())
        .await;

    let mut ids = HashSet::new();
    for (name, resp) in names.iter().zip(responses) {
        let resp = resp.unwrap();
        assert!(resp.success, "{name}");
        assert_eq!(resp.rounds, 9);
        assert!(ids.insert(resp.run_id));
        for artifact in resp.artifacts.values() {
            assert_eq!(artifact["project"], *name);
        }
    }
    assert_eq!(metrics.snapshot().await.workflows[&WorkflowState::Completed], 4);
}

#[tokio::test]
async fn test_missing_participant_fails_run() {
    let mut registry = ParticipantRegistry::new();
    for profile in default_profiles(&TierTable::default()) {
        if profile.role != AgentRole::CodeReviewer {
            let role = profile.role;
            registry.register(profile, Arc::new(StaticHandler { role }));
        }
    }
    let (orchestrator, _) = static_orchestrator(&ForgeConfig::default(), registry);
    let resp = orchestrator.execute(request("calc")).await.unwrap();
    assert_eq!(resp.final_state, WorkflowState::Failed);
    assert_eq!(resp.terminal_error().unwrap().kind, ErrorKind::Internal);
    assert!(resp.terminal_error().unwrap().message.contains("CodeReviewer"));
}

#[tokio::test]
async fn test_audit_trail_written() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _) = static_orchestrator(&ForgeConfig::default(), static_registry(None));
    let orchestrator = orchestrator.with_audit(Arc::new(AuditLog::new(dir.path().to_path_buf())));
    let resp = orchestrator.execute(request("calc")).await.unwrap();

    let path = dir.path().join("audit.jsonl");
    let mut lines = Vec::new();
    for _ in 0..50 {
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            lines = content.lines().map(str::to_string).collect();
            if lines.len() >= 11 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // run_started, nine turns, run_finished.
    assert_eq!(lines.len(), 11);
    let first: Value = serde_json::from_str(&lines[0]).unwrap();
    let last: Value = serde_json::from_str(&lines[10]).unwrap();
    assert_eq!(first["action"], "run_started");
    assert_eq!(first["run_id"], resp.run_id.to_string());
    assert_eq!(last["action"], "run_finished");
    assert_eq!(last["details"]["final_state"], "completed");
    assert_eq!(last["outcome"], "success");
}
