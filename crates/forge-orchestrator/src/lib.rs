//! Run coordination for Forge.
//!
//! A run walks a fixed pipeline of participants, from requirements analysis
//! to the quality gate, under an explicit state machine. Each turn's raw
//! output is validated against the result envelope by the [`Dispatcher`],
//! which applies it to the [`WorkflowRun`] and picks the next participant.
//!
//! # Main types
//!
//! - [`Orchestrator`] - Drives runs from request to terminal state.
//! - [`WorkflowMachine`] - Transition table and per-run transition log.
//! - [`Dispatcher`] - Turn selection and retry policy.
//! - [`ParticipantRegistry`] - Handlers keyed by role.
//! - [`ForgeConfig`] - Configuration loaded from `forge.toml`.

/// Configuration.
pub mod config;
/// Per-run state.
pub mod context;
/// Turn selection.
pub mod dispatcher;
/// Run coordinator.
pub mod engine;
/// Workflow state machine.
pub mod fsm;
/// Run and participant metrics.
pub mod monitor;
/// Participant handlers.
pub mod participant;
/// Static participant definitions and the contract prompt.
pub mod profiles;
/// Participant registry and turn context.
pub mod registry;
/// Request, response and state types.
pub mod types;

pub use config::{BudgetConfig, ForgeConfig, StoreBackend, StoreConfig, WorkflowConfig};
pub use context::{HistoryEntry, WorkflowRun};
pub use dispatcher::{Dispatcher, ENTRY_PARTICIPANT};
pub use engine::{CancelToken, Orchestrator};
pub use fsm::{
    forward_event, next_state, retry_event, stage_owner, TransitionRecord, WorkflowEvent,
    WorkflowMachine,
};
pub use monitor::{InMemoryMetrics, MetricsSink, MetricsSnapshot, ParticipantMetrics};
pub use participant::{
    default_registry, ExecutingTestRunner, ExecutorParticipant, GenerativeParticipant,
};
pub use profiles::{assigned_tier, contract_prompt, default_profiles, ParticipantProfile};
pub use registry::{
    Participant, ParticipantHandler, ParticipantRegistry, TurnContext, TurnOutput,
};
pub use types::{GenerationRequest, GenerationResponse, RunError, WorkflowState};
