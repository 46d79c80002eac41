use crate::fsm::WorkflowMachine;
use crate::types::{GenerationResponse, RunError, WorkflowState};
use chrono::{DateTime, Utc};
use forge_core::{AgentRole, ErrorKind, Message, StructuredResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// One accepted participant result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub participant: AgentRole,
    pub result: StructuredResult,
    pub timestamp: DateTime<Utc>,
}

/// Everything one run accumulates.
///
/// Owned by a single coordinator task; only the dispatcher (and the
/// coordinator, for timeouts and cancellation) mutate it.
pub struct WorkflowRun {
    id: Uuid,
    requirements: Value,
    machine: WorkflowMachine,
    transcript: Vec<Message>,
    history: Vec<HistoryEntry>,
    artifacts: BTreeMap<AgentRole, Map<String, Value>>,
    errors: Vec<RunError>,
    retry_count: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    cost_usd: f64,
    tokens_used: u64,
    rounds: u32,
}

impl WorkflowRun {
    pub fn new(requirements: Value) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            requirements,
            machine: WorkflowMachine::new(id),
            transcript: Vec::new(),
            history: Vec::new(),
            artifacts: BTreeMap::new(),
            errors: Vec::new(),
            retry_count: 0,
            started_at: Utc::now(),
            started: Instant::now(),
            cost_usd: 0.0,
            tokens_used: 0,
            rounds: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn requirements(&self) -> &Value {
        &self.requirements
    }

    pub fn state(&self) -> WorkflowState {
        self.machine.state()
    }

    pub fn machine(&self) -> &WorkflowMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut WorkflowMachine {
        &mut self.machine
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn push_message(&mut self, message: Message) {
        self.transcript.push(message);
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn artifacts(&self) -> &BTreeMap<AgentRole, Map<String, Value>> {
        &self.artifacts
    }

    pub fn artifact(&self, role: AgentRole) -> Option<&Map<String, Value>> {
        self.artifacts.get(&role)
    }

    pub fn errors(&self) -> &[RunError] {
        &self.errors
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub(crate) fn begin_round(&mut self) -> u32 {
        self.rounds += 1;
        self.rounds
    }

    pub fn add_usage(&mut self, cost_usd: f64, tokens: u64) {
        self.cost_usd += cost_usd;
        self.tokens_used += tokens;
    }

    /// Appends a successful result; later successes from the same
    /// participant replace its artifact.
    pub fn record_success(&mut self, result: StructuredResult) {
        self.artifacts.insert(result.agent, result.result.clone());
        self.history.push(HistoryEntry {
            participant: result.agent,
            result,
            timestamp: Utc::now(),
        });
    }

    /// Records a recoverable error and returns the new retry count.
    pub fn record_error(
        &mut self,
        participant: AgentRole,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> u32 {
        self.retry_count += 1;
        let message = message.into();
        warn!(
            run_id = %self.id,
            participant = %participant,
            kind = ?kind,
            retry_count = self.retry_count,
            error = %message,
            "Stage error"
        );
        self.push_error(Some(participant), kind, message);
        self.retry_count
    }

    /// Records an error that does not consume a retry.
    pub fn record_failure(
        &mut self,
        participant: Option<AgentRole>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        let message = message.into();
        warn!(
            run_id = %self.id,
            participant = ?participant,
            kind = ?kind,
            error = %message,
            "Run failure recorded"
        );
        self.push_error(participant, kind, message);
    }

    fn push_error(&mut self, participant: Option<AgentRole>, kind: ErrorKind, message: String) {
        self.errors.push(RunError {
            participant,
            kind,
            message,
            state: self.machine.state(),
            timestamp: Utc::now(),
        });
    }

    /// Records a fatal error and forces the run to `Failed`.
    pub fn fail(&mut self, participant: Option<AgentRole>, kind: ErrorKind, message: impl Into<String>) {
        self.record_failure(participant, kind, message);
        self.machine.force_fail();
    }

    pub fn into_response(self) -> GenerationResponse {
        let final_state = self.machine.state();
        GenerationResponse {
            success: final_state == WorkflowState::Completed,
            run_id: self.id,
            final_state,
            artifacts: self.artifacts,
            errors: self.errors,
            duration_ms: self.started.elapsed().as_millis() as u64,
            total_cost_usd: self.cost_usd,
            tokens_used: self.tokens_used,
            retries: self.retry_count,
            rounds: self.rounds,
        }
    }
}
