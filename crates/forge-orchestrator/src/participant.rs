//! Participant handlers: model-backed stages, the sandbox executor, and the
//! test runner that combines the two.

use crate::profiles::{contract_prompt, default_profiles, ParticipantProfile};
use crate::registry::{ParticipantHandler, ParticipantRegistry, TurnContext, TurnOutput};
use async_trait::async_trait;
use forge_agent::{BackendFactory, TierTable};
use forge_core::{
    parse_structured_result, AgentRole, ForgeResult, Message, ResultStatus, StructuredResult,
};
use forge_cost::{CostRecord, CostRouter, RouteDecision};
use forge_sandbox::{ExecutionResult, SecureExecutor};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// A participant answered by a language model, routed through the cost router.
pub struct GenerativeParticipant {
    role: AgentRole,
    system_prompt: String,
    router: Arc<CostRouter>,
    backends: Arc<dyn BackendFactory>,
}

impl GenerativeParticipant {
    pub fn new(
        profile: &ParticipantProfile,
        router: Arc<CostRouter>,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            role: profile.role,
            system_prompt: contract_prompt(profile),
            router,
            backends,
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }
}

#[async_trait]
impl ParticipantHandler for GenerativeParticipant {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput> {
        let payload = ctx.request_payload(self.role);

        let (tier, config, complexity, digest) = match self.router.route(&payload, self.role).await {
            RouteDecision::Cached { raw, .. } => {
                return Ok(TurnOutput {
                    raw,
                    cached: true,
                    ..Default::default()
                });
            }
            RouteDecision::Model {
                tier,
                config,
                complexity,
                digest,
                ..
            } => (tier, config, complexity, digest),
        };

        let backend = self.backends.backend(tier)?;
        let request = Message::user(serde_json::to_string(&payload)?, ctx.run_id);
        let completion = backend
            .complete(Some(&self.system_prompt), std::slice::from_ref(&request))
            .await?;

        let cost = config.cost_for(completion.tokens_used);
        self.router
            .ledger()
            .record(CostRecord::new(
                completion.model.clone(),
                completion.tokens_used,
                cost,
                ctx.run_id,
                complexity.score,
            ))
            .await;

        // Only answers the dispatcher would accept as this stage's success
        // are worth replaying.
        let reusable = parse_structured_result(&completion.text)
            .map(|r| r.status == ResultStatus::Success && r.agent == self.role)
            .unwrap_or(false);
        if reusable {
            self.router.cache_response(&digest, &completion.text).await;
        }

        debug!(
            run_id = %ctx.run_id,
            role = %self.role,
            model = %completion.model,
            tokens = completion.tokens_used,
            cached = reusable,
            "Model turn finished"
        );

        Ok(TurnOutput {
            raw: completion.text,
            tokens_used: completion.tokens_used,
            cost_usd: cost,
            tier: Some(tier),
            cached: false,
        })
    }
}

/// Runs the generated program in the sandbox.
pub struct ExecutorParticipant {
    executor: Arc<SecureExecutor>,
}

impl ExecutorParticipant {
    pub fn new(executor: Arc<SecureExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &SecureExecutor {
        &self.executor
    }

    pub async fn run(&self, code: &str) -> ExecutionResult {
        self.executor.execute(code).await
    }
}

fn generated_code(ctx: &TurnContext) -> Option<&str> {
    ctx.artifact(AgentRole::CodeGenerator)
        .and_then(|a| a.get("code"))
        .and_then(Value::as_str)
        .filter(|code| !code.trim().is_empty())
}

fn execution_envelope(
    agent: AgentRole,
    action: &str,
    execution: &ExecutionResult,
) -> ForgeResult<StructuredResult> {
    let value = serde_json::to_value(execution)?;
    let mut result = if execution.success {
        StructuredResult::success(agent, action, serde_json::json!({}))
    } else {
        let message = execution
            .error
            .clone()
            .unwrap_or_else(|| "execution failed".to_string());
        StructuredResult::error(agent, action, message)
    };
    result.result.insert("execution".into(), value);
    Ok(result)
}

#[async_trait]
impl ParticipantHandler for ExecutorParticipant {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput> {
        let Some(code) = generated_code(ctx) else {
            let envelope = StructuredResult::error(
                AgentRole::Executor,
                "execute_code",
                "no generated code to execute",
            );
            return Ok(TurnOutput::local(envelope.to_json()?));
        };
        let execution = self.run(code).await;
        let envelope = execution_envelope(AgentRole::Executor, "execute_code", &execution)?;
        Ok(TurnOutput::local(envelope.to_json()?))
    }
}

/// TestRunner that writes tests with a model and then runs program plus
/// tests in the sandbox.
///
/// A failing execution turns the turn into a `TestRunner` error so the run
/// takes the test retry edge back to code generation.
pub struct ExecutingTestRunner {
    writer: Arc<dyn ParticipantHandler>,
    executor: Arc<ExecutorParticipant>,
}

impl ExecutingTestRunner {
    pub fn new(writer: Arc<dyn ParticipantHandler>, executor: Arc<ExecutorParticipant>) -> Self {
        Self { writer, executor }
    }
}

#[async_trait]
impl ParticipantHandler for ExecutingTestRunner {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput> {
        let mut output = self.writer.respond(ctx).await?;

        let mut written = match parse_structured_result(&output.raw) {
            Ok(r) if r.status == ResultStatus::Success && r.agent == AgentRole::TestRunner => r,
            // Anything else goes to the dispatcher untouched.
            _ => return Ok(output),
        };

        let Some(code) = generated_code(ctx) else {
            let envelope = StructuredResult::error(
                AgentRole::TestRunner,
                written.action,
                "no generated code to test",
            );
            output.raw = envelope.to_json()?;
            return Ok(output);
        };

        let program = match written.result.get("tests").and_then(Value::as_str) {
            Some(tests) if !tests.trim().is_empty() => format!("{code}\n\n{tests}\n"),
            _ => code.to_string(),
        };
        let execution = self.executor.run(&program).await;
        info!(
            run_id = %ctx.run_id,
            success = execution.success,
            failure_kind = ?execution.failure_kind,
            "Tests executed"
        );

        let envelope = if execution.success {
            written
                .result
                .insert("execution".into(), serde_json::to_value(&execution)?);
            written
        } else {
            execution_envelope(AgentRole::TestRunner, &written.action, &execution)?
        };
        output.raw = envelope.to_json()?;
        Ok(output)
    }
}

/// Registry with every role bound to its standard handler.
///
/// Model-backed roles share `router` and `backends`; the test runner and the
/// executor share `executor`.
pub fn default_registry(
    tiers: &TierTable,
    router: Arc<CostRouter>,
    backends: Arc<dyn BackendFactory>,
    executor: Arc<SecureExecutor>,
) -> ParticipantRegistry {
    let executor = Arc::new(ExecutorParticipant::new(executor));
    let mut registry = ParticipantRegistry::new();
    for profile in default_profiles(tiers) {
        let handler: Arc<dyn ParticipantHandler> = match profile.role {
            AgentRole::Executor => executor.clone(),
            AgentRole::TestRunner => {
                let writer = GenerativeParticipant::new(&profile, router.clone(), backends.clone());
                Arc::new(ExecutingTestRunner::new(Arc::new(writer), executor.clone()))
            }
            _ => Arc::new(GenerativeParticipant::new(
                &profile,
                router.clone(),
                backends.clone(),
            )),
        };
        registry.register(profile, handler);
    }
    registry
}
