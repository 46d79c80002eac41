//! Turn selection.
//!
//! The dispatcher reads the newest transcript message, validates it against
//! the result envelope, applies it to the run and names the participant that
//! speaks next. It is the only place run state changes in response to a
//! participant's output.

use crate::context::WorkflowRun;
use crate::fsm::{forward_event, retry_event, stage_owner, WorkflowEvent};
use crate::types::WorkflowState;
use forge_core::{parse_structured_result, AgentRole, ErrorKind, ResultStatus, StructuredResult};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// The participant every run starts with.
pub const ENTRY_PARTICIPANT: AgentRole = AgentRole::SystemArchitect;

/// Applies the newest participant message to a run and picks the next speaker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    max_retries: u32,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Dispatcher {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the next participant, or `None` once the run is terminal.
    pub fn select_next(&self, run: &mut WorkflowRun) -> Option<AgentRole> {
        if run.machine().is_terminal() {
            return None;
        }

        let Some(last) = run.transcript().last() else {
            return Some(ENTRY_PARTICIPANT);
        };
        let Some(sender) = last.sender else {
            // Requester or coordinator message: nobody has answered yet.
            return stage_owner(run.state());
        };
        let raw = last.content.clone();

        let result = match parse_structured_result(&raw) {
            Ok(result) => result,
            Err(violation) => {
                error!(run_id = %run.id(), participant = %sender, error = %violation, "Malformed participant output");
                run.fail(Some(sender), ErrorKind::ContractViolation, violation.to_string());
                return None;
            }
        };

        if result.agent != sender {
            let message = format!(
                "message from {sender} claims to come from {}",
                result.agent
            );
            error!(run_id = %run.id(), "{message}");
            run.fail(Some(sender), ErrorKind::ContractViolation, message);
            return None;
        }

        let next = match result.status {
            ResultStatus::Success => self.on_success(run, result.clone()),
            ResultStatus::Error => self.on_error(run, &result),
            ResultStatus::Pending => {
                debug!(run_id = %run.id(), participant = %result.agent, "Participant pending, polling again");
                Some(result.agent)
            }
        };

        if let (Some(hint), Some(chosen)) = (result.next_agent, next) {
            if hint != chosen {
                warn!(
                    run_id = %run.id(),
                    participant = %result.agent,
                    hint = %hint,
                    selected = %chosen,
                    "Ignoring next_agent hint that disagrees with the stage chain"
                );
            }
        }
        next
    }

    fn on_success(&self, run: &mut WorkflowRun, result: StructuredResult) -> Option<AgentRole> {
        let state = run.state();
        let owner = stage_owner(state);
        if owner != Some(result.agent) {
            let message = format!(
                "{} reported success in state {state}, which belongs to {}",
                result.agent,
                owner.map_or("nobody", AgentRole::as_str)
            );
            error!(run_id = %run.id(), "{message}");
            run.fail(Some(result.agent), ErrorKind::ContractViolation, message);
            return None;
        }

        let participant = result.agent;
        run.record_success(result);
        self.advance(run, forward_event(state))?;

        if run.state() == WorkflowState::QualityApproved {
            // No participant acts in this stage; completion follows immediately.
            self.advance(run, forward_event(run.state()))?;
        }

        let next = stage_owner(run.state());
        info!(
            run_id = %run.id(),
            participant = %participant,
            state = %run.state(),
            next = ?next,
            "Stage accepted"
        );
        next
    }

    fn on_error(&self, run: &mut WorkflowRun, result: &StructuredResult) -> Option<AgentRole> {
        let kind = error_kind(result);
        let message = result
            .error_message()
            .unwrap_or("participant reported an error without a message")
            .to_string();
        let retries = run.record_error(result.agent, kind, message);

        if retries > self.max_retries {
            run.fail(
                Some(result.agent),
                ErrorKind::RetryLimit,
                format!("retry limit of {} exceeded", self.max_retries),
            );
            return None;
        }

        match retry_event(run.state()) {
            Some(event) => {
                self.advance(run, Some(event))?;
                stage_owner(run.state())
            }
            None => stage_owner(run.state()),
        }
    }

    /// Fires `event`; a missing edge fails the run.
    fn advance(&self, run: &mut WorkflowRun, event: Option<WorkflowEvent>) -> Option<()> {
        let state = run.state();
        let Some(event) = event else {
            run.fail(None, ErrorKind::Internal, format!("no event leaves state {state}"));
            return None;
        };
        match run.machine_mut().fire(event) {
            Ok(_) => Some(()),
            Err(e) => {
                run.fail(None, ErrorKind::Internal, e.to_string());
                None
            }
        }
    }
}

/// Kind carried by a synthesized error envelope, if it is one the retry path
/// accepts. Participants cannot escalate their own errors to fatal kinds.
fn error_kind(result: &StructuredResult) -> ErrorKind {
    result
        .result
        .get("kind")
        .cloned()
        .and_then(|v: Value| serde_json::from_value::<ErrorKind>(v).ok())
        .filter(|kind| kind.is_recoverable())
        .unwrap_or(ErrorKind::StageError)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::WorkflowState as S;
    use forge_core::Message;
    use serde_json::json;

    fn say(run: &mut WorkflowRun, result: StructuredResult) {
        let raw = result.to_json().unwrap();
        let id = run.id();
        run.push_message(Message::from_participant(result.agent, raw, id));
    }

    fn ok(agent: AgentRole) -> StructuredResult {
        StructuredResult::success(agent, "work", json!({"done": agent.as_str()}))
    }

    const CHAIN: [AgentRole; 9] = [
        AgentRole::SystemArchitect,
        AgentRole::SystemArchitect,
        AgentRole::PromptEngineer,
        AgentRole::CodeGenerator,
        AgentRole::CodeReviewer,
        AgentRole::SecurityValidator,
        AgentRole::TestRunner,
        AgentRole::DocumentationGenerator,
        AgentRole::QualityGate,
    ];

    fn drive_to(run: &mut WorkflowRun, d: &Dispatcher, steps: usize) {
        for role in CHAIN.iter().take(steps) {
            say(run, ok(*role));
            d.select_next(run);
        }
    }

    #[test]
    fn test_empty_transcript_selects_entry() {
        let mut run = WorkflowRun::new(json!({}));
        assert_eq!(Dispatcher::default().select_next(&mut run), Some(AgentRole::SystemArchitect));
        let id = run.id();
        run.push_message(Message::user("build a todo app", id));
        assert_eq!(Dispatcher::default().select_next(&mut run), Some(AgentRole::SystemArchitect));
    }

    #[test]
    fn test_happy_path_completes() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        let mut selected = vec![d.select_next(&mut run).unwrap()];
        for role in CHAIN {
            say(&mut run, ok(role));
            if let Some(next) = d.select_next(&mut run) {
                selected.push(next);
            }
        }
        assert_eq!(run.state(), S::Completed);
        assert_eq!(selected, CHAIN.to_vec());
        assert_eq!(run.history().len(), 9);
        assert_eq!(run.retry_count(), 0);
        assert_eq!(run.machine().log().len(), 10);
    }

    #[test]
    fn test_test_failure_routes_back_to_generation() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        drive_to(&mut run, &d, 6);
        assert_eq!(run.state(), S::SecurityValidated);

        say(&mut run, StructuredResult::error(AgentRole::TestRunner, "run_tests", "2 tests failed"));
        let next = d.select_next(&mut run);
        assert_eq!(run.state(), S::CodeGenerated);
        assert_eq!(next, Some(AgentRole::CodeReviewer));
        assert_eq!(run.retry_count(), 1);
        assert_eq!(run.errors()[0].kind, ErrorKind::StageError);
        assert_eq!(run.errors()[0].message, "2 tests failed");
    }

    #[test]
    fn test_fourth_error_fails_run() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        for i in 0..3 {
            say(&mut run, StructuredResult::error(AgentRole::SystemArchitect, "analyze", format!("e{i}")));
            assert_eq!(d.select_next(&mut run), Some(AgentRole::SystemArchitect));
            assert_eq!(run.state(), S::Initialized);
        }
        say(&mut run, StructuredResult::error(AgentRole::SystemArchitect, "analyze", "e3"));
        assert_eq!(d.select_next(&mut run), None);
        assert_eq!(run.state(), S::Failed);
        assert_eq!(run.retry_count(), 4);
        assert_eq!(run.errors().last().unwrap().kind, ErrorKind::RetryLimit);
        // Terminal: nothing further is selected.
        assert_eq!(d.select_next(&mut run), None);
    }

    #[test]
    fn test_malformed_output_fails_without_retry() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        let id = run.id();
        run.push_message(Message::from_participant(
            AgentRole::SystemArchitect,
            "Sure, here is the architecture!",
            id,
        ));
        assert_eq!(d.select_next(&mut run), None);
        assert_eq!(run.state(), S::Failed);
        assert_eq!(run.retry_count(), 0);
        assert_eq!(run.errors()[0].kind, ErrorKind::ContractViolation);
    }

    #[test]
    fn test_success_from_wrong_participant_is_violation() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        say(&mut run, ok(AgentRole::CodeGenerator));
        assert_eq!(d.select_next(&mut run), None);
        assert_eq!(run.state(), S::Failed);
        assert!(run.history().is_empty());
    }

    #[test]
    fn test_spoofed_agent_is_violation() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        let raw = ok(AgentRole::SystemArchitect).to_json().unwrap();
        let id = run.id();
        run.push_message(Message::from_participant(AgentRole::QualityGate, raw, id));
        assert_eq!(d.select_next(&mut run), None);
        assert_eq!(run.errors()[0].kind, ErrorKind::ContractViolation);
    }

    #[test]
    fn test_pending_reselects_without_mutation() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        say(&mut run, StructuredResult::pending(AgentRole::SystemArchitect, "thinking"));
        assert_eq!(d.select_next(&mut run), Some(AgentRole::SystemArchitect));
        assert_eq!(run.state(), S::Initialized);
        assert!(run.history().is_empty());
        assert_eq!(run.retry_count(), 0);
    }

    #[test]
    fn test_disagreeing_hint_is_ignored() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        say(&mut run, ok(AgentRole::SystemArchitect).with_next(AgentRole::QualityGate));
        assert_eq!(d.select_next(&mut run), Some(AgentRole::SystemArchitect));
        assert_eq!(run.state(), S::RequirementsAnalyzed);
    }

    #[test]
    fn test_review_error_takes_retry_edge() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        drive_to(&mut run, &d, 5);
        assert_eq!(run.state(), S::CodeReviewed);
        say(&mut run, StructuredResult::error(AgentRole::SecurityValidator, "validate", "secrets found"));
        assert_eq!(d.select_next(&mut run), Some(AgentRole::CodeGenerator));
        assert_eq!(run.state(), S::PromptEngineered);
    }

    #[test]
    fn test_recoverable_kind_is_kept_and_fatal_kind_downgraded() {
        let d = Dispatcher::default();
        let mut run = WorkflowRun::new(json!({}));
        let mut timeout = StructuredResult::error(AgentRole::SystemArchitect, "turn", "deadline");
        timeout.result.insert("kind".into(), json!("timeout"));
        say(&mut run, timeout);
        d.select_next(&mut run);

        let mut escalated = StructuredResult::error(AgentRole::SystemArchitect, "turn", "x");
        escalated.result.insert("kind".into(), json!("cancelled"));
        say(&mut run, escalated);
        d.select_next(&mut run);

        assert_eq!(run.errors()[0].kind, ErrorKind::Timeout);
        assert_eq!(run.errors()[1].kind, ErrorKind::StageError);
        assert_eq!(run.state(), S::Initialized);
    }
}
