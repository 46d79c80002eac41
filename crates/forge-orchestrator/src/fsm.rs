//! The workflow state machine.
//!
//! Transitions are an explicit `(state, event) -> state` table. Firing an
//! event with no edge from the current state is an error, never a no-op, and
//! the machine never advances on its own.

use crate::types::WorkflowState;
use chrono::{DateTime, Utc};
use forge_core::{AgentRole, ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    AnalyzeRequirements,
    DesignArchitecture,
    EngineerPrompt,
    GenerateCode,
    ReviewCode,
    ValidateSecurity,
    ExecuteTests,
    GenerateDocumentation,
    ApproveQuality,
    CompleteWorkflow,
    Fail,
    RetryFromReview,
    RetryFromSecurity,
    RetryFromTests,
    RetryFromQuality,
}

impl WorkflowEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowEvent::AnalyzeRequirements => "analyze_requirements",
            WorkflowEvent::DesignArchitecture => "design_architecture",
            WorkflowEvent::EngineerPrompt => "engineer_prompt",
            WorkflowEvent::GenerateCode => "generate_code",
            WorkflowEvent::ReviewCode => "review_code",
            WorkflowEvent::ValidateSecurity => "validate_security",
            WorkflowEvent::ExecuteTests => "execute_tests",
            WorkflowEvent::GenerateDocumentation => "generate_documentation",
            WorkflowEvent::ApproveQuality => "approve_quality",
            WorkflowEvent::CompleteWorkflow => "complete_workflow",
            WorkflowEvent::Fail => "fail",
            WorkflowEvent::RetryFromReview => "retry_from_review",
            WorkflowEvent::RetryFromSecurity => "retry_from_security",
            WorkflowEvent::RetryFromTests => "retry_from_tests",
            WorkflowEvent::RetryFromQuality => "retry_from_quality",
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use WorkflowEvent as E;
use WorkflowState as S;

const TRANSITIONS: &[(WorkflowState, WorkflowEvent, WorkflowState)] = &[
    // Forward chain
    (S::Initialized, E::AnalyzeRequirements, S::RequirementsAnalyzed),
    (S::RequirementsAnalyzed, E::DesignArchitecture, S::ArchitectureDesigned),
    (S::ArchitectureDesigned, E::EngineerPrompt, S::PromptEngineered),
    (S::PromptEngineered, E::GenerateCode, S::CodeGenerated),
    (S::CodeGenerated, E::ReviewCode, S::CodeReviewed),
    (S::CodeReviewed, E::ValidateSecurity, S::SecurityValidated),
    (S::SecurityValidated, E::ExecuteTests, S::TestsExecuted),
    (S::TestsExecuted, E::GenerateDocumentation, S::DocumentationGenerated),
    (S::DocumentationGenerated, E::ApproveQuality, S::QualityApproved),
    (S::QualityApproved, E::CompleteWorkflow, S::Completed),
    // Retry edges
    (S::CodeReviewed, E::RetryFromReview, S::PromptEngineered),
    (S::SecurityValidated, E::RetryFromSecurity, S::CodeGenerated),
    (S::TestsExecuted, E::RetryFromTests, S::CodeGenerated),
    (S::QualityApproved, E::RetryFromQuality, S::ArchitectureDesigned),
    // Failure from every non-terminal state
    (S::Initialized, E::Fail, S::Failed),
    (S::RequirementsAnalyzed, E::Fail, S::Failed),
    (S::ArchitectureDesigned, E::Fail, S::Failed),
    (S::PromptEngineered, E::Fail, S::Failed),
    (S::CodeGenerated, E::Fail, S::Failed),
    (S::CodeReviewed, E::Fail, S::Failed),
    (S::SecurityValidated, E::Fail, S::Failed),
    (S::TestsExecuted, E::Fail, S::Failed),
    (S::DocumentationGenerated, E::Fail, S::Failed),
    (S::QualityApproved, E::Fail, S::Failed),
];

/// Target of `event` fired from `from`, if the table has that edge.
pub fn next_state(from: WorkflowState, event: WorkflowEvent) -> Option<WorkflowState> {
    TRANSITIONS
        .iter()
        .find(|(s, e, _)| *s == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// The participant that acts while the run is in `state`.
///
/// `None` for the terminal states and for [`WorkflowState::QualityApproved`],
/// which completes without another turn.
pub fn stage_owner(state: WorkflowState) -> Option<AgentRole> {
    match state {
        S::Initialized | S::RequirementsAnalyzed => Some(AgentRole::SystemArchitect),
        S::ArchitectureDesigned => Some(AgentRole::PromptEngineer),
        S::PromptEngineered => Some(AgentRole::CodeGenerator),
        S::CodeGenerated => Some(AgentRole::CodeReviewer),
        S::CodeReviewed => Some(AgentRole::SecurityValidator),
        S::SecurityValidated => Some(AgentRole::TestRunner),
        S::TestsExecuted => Some(AgentRole::DocumentationGenerator),
        S::DocumentationGenerated => Some(AgentRole::QualityGate),
        S::QualityApproved | S::Completed | S::Failed => None,
    }
}

/// Event fired when the owner of `state` reports success.
pub fn forward_event(state: WorkflowState) -> Option<WorkflowEvent> {
    match state {
        S::Initialized => Some(E::AnalyzeRequirements),
        S::RequirementsAnalyzed => Some(E::DesignArchitecture),
        S::ArchitectureDesigned => Some(E::EngineerPrompt),
        S::PromptEngineered => Some(E::GenerateCode),
        S::CodeGenerated => Some(E::ReviewCode),
        S::CodeReviewed => Some(E::ValidateSecurity),
        S::SecurityValidated => Some(E::ExecuteTests),
        S::TestsExecuted => Some(E::GenerateDocumentation),
        S::DocumentationGenerated => Some(E::ApproveQuality),
        S::QualityApproved => Some(E::CompleteWorkflow),
        S::Completed | S::Failed => None,
    }
}

/// Retry edge leaving `state`, if it has one.
///
/// Looked up with the state current when the error arrives, and that state is
/// owned by the participant *after* the one the edge is named for: an error
/// from the [`AgentRole::SecurityValidator`] (owner of `CodeReviewed`) fires
/// `RetryFromReview`, while an error from the [`AgentRole::CodeReviewer`]
/// (owner of `CodeGenerated`) has no edge and the reviewer is simply re-run.
pub fn retry_event(state: WorkflowState) -> Option<WorkflowEvent> {
    match state {
        S::CodeReviewed => Some(E::RetryFromReview),
        S::SecurityValidated => Some(E::RetryFromSecurity),
        S::TestsExecuted => Some(E::RetryFromTests),
        S::QualityApproved => Some(E::RetryFromQuality),
        _ => None,
    }
}

/// One fired transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowState,
    pub event: WorkflowEvent,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
}

/// State machine for a single run.
#[derive(Debug, Clone)]
pub struct WorkflowMachine {
    run_id: Uuid,
    state: WorkflowState,
    log: Vec<TransitionRecord>,
}

impl WorkflowMachine {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: WorkflowState::Initialized,
            log: Vec::new(),
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_fire(&self, event: WorkflowEvent) -> bool {
        next_state(self.state, event).is_some()
    }

    /// Fires `event`, returning the new state.
    pub fn fire(&mut self, event: WorkflowEvent) -> ForgeResult<WorkflowState> {
        let from = self.state;
        let to = next_state(from, event).ok_or_else(|| ForgeError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        })?;
        self.state = to;
        self.log.push(TransitionRecord {
            from,
            event,
            to,
            timestamp: Utc::now(),
        });
        info!(
            run_id = %self.run_id,
            from = %from,
            event = %event,
            to = %to,
            "Workflow state changed"
        );
        Ok(to)
    }

    /// Moves a non-terminal run to `Failed`. Returns `false` if the run had
    /// already terminated.
    pub fn force_fail(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.fire(WorkflowEvent::Fail).is_ok()
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const FORWARD: [WorkflowState; 11] = [
        S::Initialized,
        S::RequirementsAnalyzed,
        S::ArchitectureDesigned,
        S::PromptEngineered,
        S::CodeGenerated,
        S::CodeReviewed,
        S::SecurityValidated,
        S::TestsExecuted,
        S::DocumentationGenerated,
        S::QualityApproved,
        S::Completed,
    ];

    #[test]
    fn test_forward_event_advances_exactly_one_stage() {
        for pair in FORWARD.windows(2) {
            let mut m = WorkflowMachine::new(Uuid::new_v4());
            m.state = pair[0];
            let event = forward_event(pair[0]).unwrap();
            assert_eq!(m.fire(event).unwrap(), pair[1]);
            assert_eq!(m.log().len(), 1);
        }
    }

    #[test]
    fn test_full_chain_reaches_completed() {
        let mut m = WorkflowMachine::new(Uuid::new_v4());
        while let Some(event) = forward_event(m.state()) {
            m.fire(event).unwrap();
        }
        assert_eq!(m.state(), S::Completed);
        assert_eq!(m.log().len(), 10);
        assert_eq!(m.log()[0].from, S::Initialized);
        assert_eq!(m.log()[9].to, S::Completed);
    }

    #[test]
    fn test_no_edge_is_an_error() {
        let mut m = WorkflowMachine::new(Uuid::new_v4());
        let err = m.fire(E::ReviewCode).unwrap_err();
        match err {
            ForgeError::InvalidTransition { from, event } => {
                assert_eq!(from, "initialized");
                assert_eq!(event, "review_code");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(m.state(), S::Initialized);
        assert!(m.log().is_empty());
    }

    #[test]
    fn test_retry_edges() {
        assert_eq!(next_state(S::CodeReviewed, E::RetryFromReview), Some(S::PromptEngineered));
        assert_eq!(next_state(S::SecurityValidated, E::RetryFromSecurity), Some(S::CodeGenerated));
        assert_eq!(next_state(S::TestsExecuted, E::RetryFromTests), Some(S::CodeGenerated));
        assert_eq!(
            next_state(S::QualityApproved, E::RetryFromQuality),
            Some(S::ArchitectureDesigned)
        );
        assert_eq!(retry_event(S::PromptEngineered), None);
        for state in FORWARD {
            if let Some(event) = retry_event(state) {
                assert!(next_state(state, event).is_some());
            }
        }
    }

    #[test]
    fn test_retry_edge_follows_erroring_owner() {
        let cases = [
            (AgentRole::CodeReviewer, None),
            (AgentRole::SecurityValidator, Some(S::PromptEngineered)),
            (AgentRole::TestRunner, Some(S::CodeGenerated)),
            (AgentRole::DocumentationGenerator, Some(S::CodeGenerated)),
        ];
        for (role, rewind_to) in cases {
            let state = FORWARD
                .iter()
                .copied()
                .find(|s| stage_owner(*s) == Some(role))
                .unwrap();
            let target = retry_event(state).and_then(|event| next_state(state, event));
            assert_eq!(target, rewind_to, "{role}");
        }
    }

    #[test]
    fn test_fail_reachable_from_every_non_terminal_state() {
        for state in FORWARD.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(next_state(*state, E::Fail), Some(S::Failed), "{state}");
        }
        assert_eq!(next_state(S::Completed, E::Fail), None);
        assert_eq!(next_state(S::Failed, E::Fail), None);
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        let mut m = WorkflowMachine::new(Uuid::new_v4());
        assert!(m.force_fail());
        assert_eq!(m.state(), S::Failed);
        assert!(!m.force_fail());
        for (_, event, _) in TRANSITIONS {
            assert!(!m.can_fire(*event));
        }
    }

    #[test]
    fn test_stage_owners() {
        assert_eq!(stage_owner(S::Initialized), Some(AgentRole::SystemArchitect));
        assert_eq!(stage_owner(S::RequirementsAnalyzed), Some(AgentRole::SystemArchitect));
        assert_eq!(stage_owner(S::SecurityValidated), Some(AgentRole::TestRunner));
        assert_eq!(stage_owner(S::DocumentationGenerated), Some(AgentRole::QualityGate));
        assert_eq!(stage_owner(S::QualityApproved), None);
        assert_eq!(stage_owner(S::Failed), None);
    }
}
