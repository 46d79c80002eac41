//! The structured result envelope every participant must produce.
//!
//! A participant's raw output is accepted only if it parses to a JSON object
//! with exactly the keys `agent`, `action`, `status`, `result`, `next_agent`
//! and optionally `metadata`. Anything else is a [`ContractViolation`] and is
//! rejected before it can touch run state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::{ForgeError, ForgeResult};
use crate::role::AgentRole;

const REQUIRED_KEYS: [&str; 5] = ["agent", "action", "status", "result", "next_agent"];
const OPTIONAL_KEYS: [&str; 1] = ["metadata"];
const METADATA_KEYS: [&str; 3] = ["timestamp", "tokens_used", "complexity_score"];

/// Outcome reported by a participant for its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The stage's work is done.
    Success,
    /// The stage failed and should be retried.
    Error,
    /// The participant needs another turn before it can report.
    Pending,
}

impl ResultStatus {
    /// The wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Error => "error",
            ResultStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = ContractViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResultStatus::Success),
            "error" => Ok(ResultStatus::Error),
            "pending" => Ok(ResultStatus::Pending),
            other => Err(ContractViolation::InvalidStatus(other.to_string())),
        }
    }
}

/// Optional bookkeeping attached to a result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultMetadata {
    /// When the participant produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Tokens consumed producing the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Complexity score of the routed request, in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity_score: Option<f64>,
}

/// A validated participant result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredResult {
    /// The participant that produced this result.
    pub agent: AgentRole,
    /// Short description of what the participant did.
    pub action: String,
    /// Outcome of the turn.
    pub status: ResultStatus,
    /// Stage payload.
    pub result: Map<String, Value>,
    /// The participant the author expects to act next. Advisory only.
    pub next_agent: Option<AgentRole>,
    /// Optional bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
}

/// Why a raw participant output was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractViolation {
    /// The output is not valid JSON.
    #[error("output is not valid JSON: {0}")]
    NotJson(String),
    /// The output is JSON but not an object.
    #[error("output is not a JSON object")]
    NotObject,
    /// A required key is absent.
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    /// A key outside the envelope is present.
    #[error("unknown key '{0}'")]
    UnknownKey(String),
    /// `agent` or `next_agent` names no registered participant.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    /// `status` is not one of success, error, pending.
    #[error("invalid status '{0}'")]
    InvalidStatus(String),
    /// A key is present but has the wrong type or range.
    #[error("invalid value for '{key}': {reason}")]
    InvalidField {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<ContractViolation> for ForgeError {
    fn from(v: ContractViolation) -> Self {
        ForgeError::Contract(v.to_string())
    }
}

impl StructuredResult {
    fn new(agent: AgentRole, action: impl Into<String>, status: ResultStatus, result: Value) -> Self {
        let result = match result {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("output".into(), other);
                map
            }
        };
        Self {
            agent,
            action: action.into(),
            status,
            result,
            next_agent: None,
            metadata: None,
        }
    }

    /// A `success` result. Non-object payloads are wrapped under `"output"`.
    pub fn success(agent: AgentRole, action: impl Into<String>, result: Value) -> Self {
        Self::new(agent, action, ResultStatus::Success, result)
    }

    /// An `error` result carrying `message` under `result.error`.
    pub fn error(agent: AgentRole, action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            agent,
            action,
            ResultStatus::Error,
            serde_json::json!({ "error": message.into() }),
        )
    }

    /// A `pending` result with an empty payload.
    pub fn pending(agent: AgentRole, action: impl Into<String>) -> Self {
        Self::new(agent, action, ResultStatus::Pending, Value::Null)
    }

    /// Sets the `next_agent` hint.
    pub fn with_next(mut self, next: AgentRole) -> Self {
        self.next_agent = Some(next);
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The error text of an `error` result, if the payload carries one.
    pub fn error_message(&self) -> Option<&str> {
        self.result
            .get("error")
            .or_else(|| self.result.get("message"))
            .and_then(Value::as_str)
    }

    /// Serializes this result to compact JSON.
    pub fn to_json(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parses and strictly validates a participant's raw output.
///
/// A single surrounding Markdown code fence (` ```json ... ``` `) is stripped
/// before parsing; nothing else is repaired.
pub fn parse_structured_result(raw: &str) -> Result<StructuredResult, ContractViolation> {
    let body = strip_code_fence(raw.trim());
    let value: Value =
        serde_json::from_str(body).map_err(|e| ContractViolation::NotJson(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(ContractViolation::NotObject);
    };

    for key in REQUIRED_KEYS {
        if !obj.contains_key(key) {
            return Err(ContractViolation::MissingKey(key));
        }
    }
    if let Some(unknown) = obj
        .keys()
        .find(|k| !REQUIRED_KEYS.contains(&k.as_str()) && !OPTIONAL_KEYS.contains(&k.as_str()))
    {
        return Err(ContractViolation::UnknownKey(unknown.clone()));
    }

    let agent = parse_agent(obj.remove("agent"), "agent")?
        .ok_or_else(|| invalid("agent", "must not be null"))?;

    let action = match obj.remove("action") {
        Some(Value::String(s)) => s,
        _ => return Err(invalid("action", "must be a string")),
    };

    let status = match obj.remove("status") {
        Some(Value::String(s)) => s.parse::<ResultStatus>()?,
        Some(other) => return Err(ContractViolation::InvalidStatus(other.to_string())),
        None => return Err(ContractViolation::MissingKey("status")),
    };

    let result = match obj.remove("result") {
        Some(Value::Object(map)) => map,
        _ => return Err(invalid("result", "must be a JSON object")),
    };

    let next_agent = parse_agent(obj.remove("next_agent"), "next_agent")?;

    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => None,
        Some(Value::Object(meta)) => Some(parse_metadata(meta)?),
        Some(_) => return Err(invalid("metadata", "must be a JSON object")),
    };

    Ok(StructuredResult {
        agent,
        action,
        status,
        result,
        next_agent,
        metadata,
    })
}

fn parse_agent(
    value: Option<Value>,
    key: &'static str,
) -> Result<Option<AgentRole>, ContractViolation> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => name
            .parse::<AgentRole>()
            .map(Some)
            .map_err(|_| ContractViolation::UnknownAgent(name)),
        Some(_) => Err(invalid(key, "must be a participant name")),
    }
}

fn parse_metadata(meta: Map<String, Value>) -> Result<ResultMetadata, ContractViolation> {
    if let Some(unknown) = meta.keys().find(|k| !METADATA_KEYS.contains(&k.as_str())) {
        return Err(ContractViolation::UnknownKey(format!("metadata.{unknown}")));
    }

    let timestamp = match meta.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| invalid("metadata.timestamp", e.to_string()))?
                .with_timezone(&Utc),
        ),
        Some(_) => return Err(invalid("metadata.timestamp", "must be an RFC 3339 string")),
    };

    let tokens_used = match meta.get("tokens_used") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| invalid("metadata.tokens_used", "must be a non-negative integer"))?,
        ),
    };

    let complexity_score = match meta.get("complexity_score") {
        None | Some(Value::Null) => None,
        Some(v) => {
            let score = v
                .as_f64()
                .ok_or_else(|| invalid("metadata.complexity_score", "must be a number"))?;
            if !(0.0..=1.0).contains(&score) {
                return Err(invalid("metadata.complexity_score", "must be within [0, 1]"));
            }
            Some(score)
        }
    };

    Ok(ResultMetadata {
        timestamp,
        tokens_used,
        complexity_score,
    })
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ContractViolation {
    ContractViolation::InvalidField {
        key,
        reason: reason.into(),
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return s;
    };
    // Drop the info string ("json") on the opening fence line.
    match rest.find('\n') {
        Some(idx) => rest[idx + 1..].trim(),
        None => rest.trim(),
    }
}
