use crate::types::WorkflowState;
use async_trait::async_trait;
use forge_agent::ModelTier;
use forge_core::{AgentRole, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Receives run and turn metrics from the orchestrator.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// A run finished in `state`.
    async fn record_workflow(&self, state: WorkflowState);
    /// A participant turn completed.
    async fn record_turn(&self, role: AgentRole, latency: Duration, tokens: u64);
    /// An error was recorded against `role`.
    async fn record_error(&self, role: Option<AgentRole>, kind: ErrorKind);
    /// Spend attributed to a tier.
    async fn record_cost(&self, tier: ModelTier, cost_usd: f64);
}

/// Counters kept for one participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    pub turns: u64,
    pub errors: u64,
    pub tokens_used: u64,
    pub total_latency_ms: u64,
}

impl ParticipantMetrics {
    pub fn avg_latency_ms(&self) -> u64 {
        if self.turns == 0 {
            0
        } else {
            self.total_latency_ms / self.turns
        }
    }
}

/// Point-in-time copy of everything an [`InMemoryMetrics`] holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Finished runs by final state.
    pub workflows: BTreeMap<WorkflowState, u64>,
    pub participants: BTreeMap<AgentRole, ParticipantMetrics>,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub cost_by_tier: BTreeMap<ModelTier, f64>,
}

#[derive(Default)]
struct MetricsState {
    workflows: HashMap<WorkflowState, u64>,
    participants: HashMap<AgentRole, ParticipantMetrics>,
    errors_by_kind: HashMap<ErrorKind, u64>,
    cost_by_tier: HashMap<ModelTier, f64>,
}

/// Process-local metrics sink.
#[derive(Clone, Default)]
pub struct InMemoryMetrics {
    state: Arc<RwLock<MetricsState>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of a single participant.
    pub async fn get(&self, role: AgentRole) -> Option<ParticipantMetrics> {
        let state = self.state.read().await;
        state.participants.get(&role).cloned()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        MetricsSnapshot {
            workflows: state.workflows.iter().map(|(k, v)| (*k, *v)).collect(),
            participants: state
                .participants
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
            errors_by_kind: state
                .errors_by_kind
                .iter()
                .map(|(k, v)| (error_kind_name(*k), *v))
                .collect(),
            cost_by_tier: state.cost_by_tier.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    /// Totals across every participant.
    pub async fn aggregate(&self) -> ParticipantMetrics {
        let state = self.state.read().await;
        let mut total = ParticipantMetrics::default();
        for m in state.participants.values() {
            total.turns += m.turns;
            total.errors += m.errors;
            total.tokens_used += m.tokens_used;
            total.total_latency_ms += m.total_latency_ms;
        }
        total
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "metrics": snapshot,
            "aggregate": aggregate,
        })
    }
}

fn error_kind_name(kind: ErrorKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{kind:?}"))
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn record_workflow(&self, state: WorkflowState) {
        let mut s = self.state.write().await;
        *s.workflows.entry(state).or_default() += 1;
    }

    async fn record_turn(&self, role: AgentRole, latency: Duration, tokens: u64) {
        let mut s = self.state.write().await;
        let m = s.participants.entry(role).or_default();
        m.turns += 1;
        m.tokens_used += tokens;
        m.total_latency_ms += latency.as_millis() as u64;
    }

    async fn record_error(&self, role: Option<AgentRole>, kind: ErrorKind) {
        let mut s = self.state.write().await;
        *s.errors_by_kind.entry(kind).or_default() += 1;
        if let Some(role) = role {
            s.participants.entry(role).or_default().errors += 1;
        }
    }

    async fn record_cost(&self, tier: ModelTier, cost_usd: f64) {
        let mut s = self.state.write().await;
        *s.cost_by_tier.entry(tier).or_default() += cost_usd;
    }
}
