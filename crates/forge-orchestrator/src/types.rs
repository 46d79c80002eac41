use chrono::{DateTime, Utc};
use forge_core::{AgentRole, ErrorKind, ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Initialized,
    RequirementsAnalyzed,
    ArchitectureDesigned,
    PromptEngineered,
    CodeGenerated,
    CodeReviewed,
    SecurityValidated,
    TestsExecuted,
    DocumentationGenerated,
    QualityApproved,
    Completed,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Initialized => "initialized",
            WorkflowState::RequirementsAnalyzed => "requirements_analyzed",
            WorkflowState::ArchitectureDesigned => "architecture_designed",
            WorkflowState::PromptEngineered => "prompt_engineered",
            WorkflowState::CodeGenerated => "code_generated",
            WorkflowState::CodeReviewed => "code_reviewed",
            WorkflowState::SecurityValidated => "security_validated",
            WorkflowState::TestsExecuted => "tests_executed",
            WorkflowState::DocumentationGenerated => "documentation_generated",
            WorkflowState::QualityApproved => "quality_approved",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub project_name: String,
    pub description: String,
    pub requirements: Map<String, Value>,
    #[serde(default)]
    pub constraints: Map<String, Value>,
    #[serde(default)]
    pub technology_stack: Vec<String>,
    /// One of `auto`, `simple`, `moderate`, `complex`.
    #[serde(default = "default_complexity_hint")]
    pub complexity_hint: String,
}

fn default_complexity_hint() -> String {
    "auto".to_string()
}

const COMPLEXITY_HINTS: &[&str] = &["auto", "simple", "moderate", "complex"];

impl GenerationRequest {
    pub fn new(project_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            description: description.into(),
            requirements: Map::new(),
            constraints: Map::new(),
            technology_stack: Vec::new(),
            complexity_hint: default_complexity_hint(),
        }
    }

    pub fn with_requirement(mut self, key: impl Into<String>, value: Value) -> Self {
        self.requirements.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if self.project_name.trim().is_empty() {
            return Err(ForgeError::Orchestrator("project_name is empty".into()));
        }
        if self.description.trim().is_empty() {
            return Err(ForgeError::Orchestrator("description is empty".into()));
        }
        if !COMPLEXITY_HINTS.contains(&self.complexity_hint.as_str()) {
            return Err(ForgeError::Orchestrator(format!(
                "unknown complexity_hint '{}'",
                self.complexity_hint
            )));
        }
        Ok(())
    }

    /// The requirements payload the run carries and participants receive.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "project_name": self.project_name,
            "description": self.description,
            "requirements": self.requirements,
            "constraints": self.constraints,
            "technology_stack": self.technology_stack,
            "complexity_hint": self.complexity_hint,
        })
    }
}

/// An error recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub participant: Option<AgentRole>,
    pub kind: ErrorKind,
    pub message: String,
    /// Stage the run was in when the error was recorded.
    pub state: WorkflowState,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub success: bool,
    pub run_id: Uuid,
    pub final_state: WorkflowState,
    /// Latest successful result per participant.
    pub artifacts: BTreeMap<AgentRole, Map<String, Value>>,
    pub errors: Vec<RunError>,
    pub duration_ms: u64,
    pub total_cost_usd: f64,
    pub tokens_used: u64,
    pub retries: u32,
    pub rounds: u32,
}

impl GenerationResponse {
    /// The error that ended a failed run.
    pub fn terminal_error(&self) -> Option<&RunError> {
        if self.success {
            None
        } else {
            self.errors.last()
        }
    }
}
