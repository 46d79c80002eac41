use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ForgeError;

/// The fixed set of pipeline participants.
///
/// Serialized with the PascalCase names participants use in the `agent` and
/// `next_agent` fields of a [`StructuredResult`](crate::StructuredResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentRole {
    /// Analyses requirements and designs the architecture.
    SystemArchitect,
    /// Turns the architecture into generation prompts.
    PromptEngineer,
    /// Produces the source code.
    CodeGenerator,
    /// Reviews generated code for quality and correctness.
    CodeReviewer,
    /// Validates generated code for security issues.
    SecurityValidator,
    /// Writes and runs tests against generated code.
    TestRunner,
    /// Writes user and API documentation.
    DocumentationGenerator,
    /// Final quality gate before completion.
    QualityGate,
    /// Runs generated code in the sandbox. Has no model behind it.
    Executor,
}

impl AgentRole {
    /// Every role, in pipeline order.
    pub const ALL: [AgentRole; 9] = [
        AgentRole::SystemArchitect,
        AgentRole::PromptEngineer,
        AgentRole::CodeGenerator,
        AgentRole::CodeReviewer,
        AgentRole::SecurityValidator,
        AgentRole::TestRunner,
        AgentRole::DocumentationGenerator,
        AgentRole::QualityGate,
        AgentRole::Executor,
    ];

    /// The wire name of this role.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::SystemArchitect => "SystemArchitect",
            AgentRole::PromptEngineer => "PromptEngineer",
            AgentRole::CodeGenerator => "CodeGenerator",
            AgentRole::CodeReviewer => "CodeReviewer",
            AgentRole::SecurityValidator => "SecurityValidator",
            AgentRole::TestRunner => "TestRunner",
            AgentRole::DocumentationGenerator => "DocumentationGenerator",
            AgentRole::QualityGate => "QualityGate",
            AgentRole::Executor => "Executor",
        }
    }

    /// Roles whose work is always routed to the highest tier.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            AgentRole::SystemArchitect | AgentRole::SecurityValidator | AgentRole::QualityGate
        )
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ForgeError::Contract(format!("unknown agent '{s}'")))
    }
}
