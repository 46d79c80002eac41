use crate::cache::{canonical_json, request_digest, ResponseCache, PREFIX_LEN};
use crate::complexity::{self, ComplexityScore};
use crate::ledger::CostLedger;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use forge_agent::{ModelTier, TierConfig, TierTable};
use forge_core::AgentRole;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const ROUTING_LOG_KEY: &str = "routing_decisions";
/// Only the newest decisions are considered by [`CostRouter::analyze_routing`].
const ANALYSIS_WINDOW: usize = 1000;

/// Where a request should go.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// A cached response is available; no model call is needed.
    Cached { raw: String, digest: String },
    /// Call a model from `tier`.
    Model {
        tier: ModelTier,
        config: TierConfig,
        complexity: ComplexityScore,
        digest: String,
        downgraded: bool,
    },
}

impl RouteDecision {
    pub fn digest(&self) -> &str {
        match self {
            RouteDecision::Cached { digest, .. } | RouteDecision::Model { digest, .. } => digest,
        }
    }
}

/// One entry of the routing log. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub request_hash: String,
    pub agent_type: AgentRole,
    pub selected_tier: ModelTier,
    pub complexity_score: f64,
    #[serde(default)]
    pub downgraded: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-role routing pattern inside a [`RoutingAnalysis`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPattern {
    pub tiers: BTreeMap<ModelTier, usize>,
    pub avg_complexity: f64,
}

/// Aggregate view over recent routing decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingAnalysis {
    pub total_decisions: usize,
    pub tier_usage: BTreeMap<ModelTier, usize>,
    pub agent_patterns: BTreeMap<AgentRole, AgentPattern>,
    pub suggestions: Vec<String>,
}

/// Cost-aware router: cache lookup, complexity scoring, role overrides and
/// budget downgrade.
pub struct CostRouter {
    store: Arc<dyn KeyValueStore>,
    cache: ResponseCache,
    ledger: Arc<CostLedger>,
    tiers: TierTable,
    cache_ttl: Duration,
}

impl CostRouter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        ledger: Arc<CostLedger>,
        tiers: TierTable,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            cache: ResponseCache::new(store.clone()),
            store,
            ledger,
            tiers,
            cache_ttl,
        }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Decides where `payload`, produced for `role`, should be served from.
    pub async fn route(&self, payload: &Value, role: AgentRole) -> RouteDecision {
        let digest = request_digest(payload);

        if let Some(hit) = self.cache.get(&digest).await {
            info!(role = %role, matched = ?hit.matched, "Serving from cache");
            return RouteDecision::Cached {
                raw: hit.payload,
                digest,
            };
        }

        let complexity = complexity::analyze(&canonical_json(payload));
        let requested = if role.is_critical() {
            ModelTier::HighPerformance
        } else {
            complexity.recommended_tier
        };

        let downgraded = self.ledger.budget_exceeded().await;
        let tier = if downgraded {
            let lower = requested.downgrade();
            warn!(role = %role, from = %requested, to = %lower, "Budget exceeded, downgrading tier");
            lower
        } else {
            requested
        };

        self.log_decision(RoutingRecord {
            request_hash: digest.get(..PREFIX_LEN).unwrap_or(&digest).to_string(),
            agent_type: role,
            selected_tier: tier,
            complexity_score: complexity.score,
            downgraded,
            timestamp: Utc::now(),
        })
        .await;

        info!(
            role = %role,
            tier = %tier,
            complexity = complexity.score,
            downgraded,
            "Routed request"
        );

        RouteDecision::Model {
            tier,
            config: self.tiers.get(tier).clone(),
            complexity,
            digest,
            downgraded,
        }
    }

    /// Stores a model response for future identical requests.
    pub async fn cache_response(&self, digest: &str, raw: &str) {
        self.cache.put(digest, raw, self.cache_ttl).await;
    }

    async fn log_decision(&self, record: RoutingRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialize routing decision");
                return;
            }
        };
        if let Err(e) = self.store.push(ROUTING_LOG_KEY, &line).await {
            error!(error = %e, "Failed to log routing decision");
        }
    }

    /// Recent routing decisions, oldest first.
    pub async fn routing_log(&self) -> Vec<RoutingRecord> {
        match self.store.range(ROUTING_LOG_KEY).await {
            Ok(lines) => {
                let skip = lines.len().saturating_sub(ANALYSIS_WINDOW);
                lines
                    .iter()
                    .skip(skip)
                    .filter_map(|l| serde_json::from_str(l).ok())
                    .collect()
            }
            Err(e) => {
                error!(error = %e, "Failed to read routing log");
                Vec::new()
            }
        }
    }

    /// Tier histogram, per-role patterns and cost suggestions.
    pub async fn analyze_routing(&self) -> RoutingAnalysis {
        analyze_decisions(&self.routing_log().await)
    }
}

/// Builds a [`RoutingAnalysis`] from a set of decisions.
pub fn analyze_decisions(decisions: &[RoutingRecord]) -> RoutingAnalysis {
    if decisions.is_empty() {
        return RoutingAnalysis::default();
    }

    let mut tier_usage: BTreeMap<ModelTier, usize> = BTreeMap::new();
    let mut complexities: BTreeMap<AgentRole, Vec<f64>> = BTreeMap::new();
    let mut agent_patterns: BTreeMap<AgentRole, AgentPattern> = BTreeMap::new();

    for d in decisions {
        *tier_usage.entry(d.selected_tier).or_default() += 1;
        *agent_patterns
            .entry(d.agent_type)
            .or_default()
            .tiers
            .entry(d.selected_tier)
            .or_default() += 1;
        complexities
            .entry(d.agent_type)
            .or_default()
            .push(d.complexity_score);
    }

    for (role, scores) in &complexities {
        if let Some(p) = agent_patterns.get_mut(role) {
            p.avg_complexity = scores.iter().sum::<f64>() / scores.len() as f64;
        }
    }

    let mut suggestions = Vec::new();
    let total = decisions.len();
    let local = tier_usage.get(&ModelTier::Local).copied().unwrap_or(0);
    if (local as f64 / total as f64) < 0.5 {
        suggestions.push(
            "Consider routing more simple requests to local models for cost savings".to_string(),
        );
    }
    for (role, pattern) in &agent_patterns {
        if pattern.avg_complexity < 0.5 && !role.is_critical() {
            suggestions.push(format!(
                "Agent {role} has low average complexity ({:.2}), consider using more economic models",
                pattern.avg_complexity
            ));
        }
    }

    RoutingAnalysis {
        total_decisions: total,
        tier_usage,
        agent_patterns,
        suggestions,
    }
}
