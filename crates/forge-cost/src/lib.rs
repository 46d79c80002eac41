//! Cost-aware routing for Forge.
//!
//! Requests are scored for complexity, mapped to a [`ModelTier`](forge_agent::ModelTier),
//! and downgraded when month-to-date spend crosses the alert threshold.
//! Responses are cached by content digest, spend is tracked per run and per
//! day, and every routing decision is logged for later analysis. All shared
//! state lives behind the [`KeyValueStore`] trait.

pub mod cache;
pub mod complexity;
pub mod ledger;
pub mod router;
pub mod sqlite_store;
pub mod store;

pub use cache::{canonical_json, request_digest, CacheHit, CacheMatch, ResponseCache};
pub use complexity::{analyze, ComplexityFactors, ComplexityScore};
pub use ledger::{CostLedger, CostRecord, CostReport, ModelUsage};
pub use router::{
    analyze_decisions, AgentPattern, CostRouter, RouteDecision, RoutingAnalysis, RoutingRecord,
};
pub use sqlite_store::SqliteStore;
pub use store::{InMemoryStore, KeyValueStore, MAX_LIST_LEN};
