use crate::profiles::ParticipantProfile;
use crate::types::{RunError, WorkflowState};
use async_trait::async_trait;
use forge_agent::ModelTier;
use forge_core::{AgentRole, ForgeError, ForgeResult};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// What a participant sees when it is asked to take a turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub run_id: Uuid,
    pub state: WorkflowState,
    pub requirements: Value,
    /// Latest successful result per participant.
    pub artifacts: BTreeMap<AgentRole, Map<String, Value>>,
    pub last_error: Option<RunError>,
    pub retry_count: u32,
}

impl TurnContext {
    /// Request body sent to the model serving `role`.
    ///
    /// The run id is left out so identical work in different runs shares
    /// cache entries.
    pub fn request_payload(&self, role: AgentRole) -> Value {
        serde_json::json!({
            "participant": role,
            "stage": self.state,
            "requirements": self.requirements,
            "artifacts": self.artifacts,
            "last_error": self.last_error.as_ref().map(|e| serde_json::json!({
                "participant": e.participant,
                "kind": e.kind,
                "message": e.message,
            })),
            "retry_count": self.retry_count,
        })
    }

    pub fn artifact(&self, role: AgentRole) -> Option<&Map<String, Value>> {
        self.artifacts.get(&role)
    }
}

/// Raw output of one turn plus what it cost.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    /// Unvalidated participant output.
    pub raw: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
    /// Tier that served the turn, if a model was called.
    pub tier: Option<ModelTier>,
    pub cached: bool,
}

impl TurnOutput {
    /// Output that involved no model call.
    pub fn local(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            ..Default::default()
        }
    }
}

/// Produces a participant's turn.
///
/// Implementations return raw text; validation happens in the dispatcher so
/// a misbehaving handler cannot bypass the envelope contract.
#[async_trait]
pub trait ParticipantHandler: Send + Sync {
    async fn respond(&self, ctx: &TurnContext) -> ForgeResult<TurnOutput>;
}

/// A registered participant: static profile plus the handler that acts for it.
#[derive(Clone)]
pub struct Participant {
    pub profile: ParticipantProfile,
    pub handler: Arc<dyn ParticipantHandler>,
}

/// Capability map from role to participant.
#[derive(Default, Clone)]
pub struct ParticipantRegistry {
    participants: HashMap<AgentRole, Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for the profile's role, replacing any previous one.
    pub fn register(&mut self, profile: ParticipantProfile, handler: Arc<dyn ParticipantHandler>) {
        self.participants
            .insert(profile.role, Participant { profile, handler });
    }

    pub fn get(&self, role: AgentRole) -> ForgeResult<&Participant> {
        self.participants
            .get(&role)
            .ok_or_else(|| ForgeError::Orchestrator(format!("no participant registered for {role}")))
    }

    pub fn contains(&self, role: AgentRole) -> bool {
        self.participants.contains_key(&role)
    }

    /// Registered roles in pipeline order.
    pub fn roles(&self) -> Vec<AgentRole> {
        let mut roles: Vec<_> = self.participants.keys().copied().collect();
        roles.sort();
        roles
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
