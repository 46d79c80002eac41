use forge_agent::{ModelTier, TierTable};
use forge_core::AgentRole;
use serde::{Deserialize, Serialize};

/// Static definition of a pipeline participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub role: AgentRole,
    pub description: String,
    /// Tier the participant is nominally assigned. Informational: the router
    /// decides the tier of every call.
    pub tier: Option<ModelTier>,
    /// Estimated cost per 1k tokens at the assigned tier.
    pub cost_per_1k_tokens: f64,
}

impl ParticipantProfile {
    fn new(role: AgentRole, tier: Option<ModelTier>, tiers: &TierTable) -> Self {
        Self {
            role,
            description: role_description(role).to_string(),
            tier,
            cost_per_1k_tokens: tier.map_or(0.0, |t| tiers.get(t).cost_per_1k_tokens),
        }
    }

    /// Whether a model answers for this participant.
    pub fn is_generative(&self) -> bool {
        self.role != AgentRole::Executor
    }
}

/// Profiles for every role, in pipeline order.
pub fn default_profiles(tiers: &TierTable) -> Vec<ParticipantProfile> {
    AgentRole::ALL
        .into_iter()
        .map(|role| ParticipantProfile::new(role, assigned_tier(role), tiers))
        .collect()
}

/// Nominal tier per role.
pub fn assigned_tier(role: AgentRole) -> Option<ModelTier> {
    match role {
        AgentRole::SystemArchitect | AgentRole::SecurityValidator | AgentRole::QualityGate => {
            Some(ModelTier::HighPerformance)
        }
        AgentRole::PromptEngineer | AgentRole::CodeReviewer => Some(ModelTier::Standard),
        AgentRole::CodeGenerator | AgentRole::TestRunner | AgentRole::DocumentationGenerator => {
            Some(ModelTier::Local)
        }
        AgentRole::Executor => None,
    }
}

fn role_description(role: AgentRole) -> &'static str {
    match role {
        AgentRole::SystemArchitect => {
            "Analyze high-level requirements and design a robust, modular system architecture."
        }
        AgentRole::PromptEngineer => {
            "Convert system architecture into detailed prompts for the CodeGenerator."
        }
        AgentRole::CodeGenerator => {
            "Write clean, production-ready code based exactly on the prompts provided. \
             Put the full program source in result.code."
        }
        AgentRole::CodeReviewer => {
            "Perform a critical review of the generated code for bugs, standards, and performance."
        }
        AgentRole::SecurityValidator => {
            "Conduct a thorough security analysis of the generated code."
        }
        AgentRole::TestRunner => {
            "Generate a comprehensive suite of unit and integration tests. \
             Put plain assert-based test code that exercises result code from \
             CodeGenerator in result.tests; it is appended to the program and run."
        }
        AgentRole::DocumentationGenerator => {
            "Create comprehensive and user-friendly documentation for the code."
        }
        AgentRole::QualityGate => {
            "Act as the final quality assurance step, providing a final pass/fail decision."
        }
        AgentRole::Executor => "Run generated code in the isolated sandbox and report the outcome.",
    }
}

/// System prompt binding a generative participant to the result envelope.
pub fn contract_prompt(profile: &ParticipantProfile) -> String {
    let name = profile.role.as_str();
    format!(
        "You are the {name}, a critical component in an automated software generation pipeline.
# YOUR ROLE
{description}
# INPUT
Each request is a JSON object with the project requirements, the results of \
earlier stages keyed by participant name, the last recorded error (if any) \
and the retry count.
# CRITICAL RULES
1. JSON-ONLY OUTPUT: respond ONLY with a single, valid JSON object.
2. STRICT STRUCTURE: use this EXACT structure for ALL responses, with no other keys:
   {{
     \"agent\": \"{name}\",
     \"action\": \"A short, descriptive name for the action you performed.\",
     \"status\": \"success | error | pending\",
     \"result\": {{}},
     \"next_agent\": \"The name of the participant who should receive your output, or null.\"
   }}
3. ERROR HANDLING: if you cannot fulfill the request, set status to \"error\" \
and put a clear message in result.error.
",
        description = profile.description,
    )
}
