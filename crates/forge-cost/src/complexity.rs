//! Keyword-driven complexity scoring.
//!
//! Every factor is a count saturated into `[0, 1]`, so adding words or
//! keywords to a request never lowers its score.

use forge_agent::ModelTier;
use serde::{Deserialize, Serialize};

const CODE_KEYWORDS: &[&str] = &[
    "algorithm",
    "optimization",
    "parallel",
    "distributed",
    "machine learning",
    "neural network",
    "cryptography",
];

const DOMAIN_KEYWORDS: &[&str] = &[
    "financial",
    "trading",
    "medical",
    "legal",
    "compliance",
    "real-time",
    "high-frequency",
    "mission-critical",
];

const SECURITY_KEYWORDS: &[&str] = &[
    "security",
    "authentication",
    "encryption",
    "authorization",
    "vulnerability",
    "penetration",
    "compliance",
];

const PERFORMANCE_KEYWORDS: &[&str] = &[
    "performance",
    "optimization",
    "latency",
    "throughput",
    "scalability",
    "concurrent",
    "real-time",
];

const WEIGHT_TOKENS: f64 = 0.15;
const WEIGHT_CODE: f64 = 0.25;
const WEIGHT_DOMAIN: f64 = 0.25;
const WEIGHT_SECURITY: f64 = 0.20;
const WEIGHT_PERFORMANCE: f64 = 0.15;

/// The five named factors, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComplexityFactors {
    pub token_count: f64,
    pub code_complexity: f64,
    pub domain_complexity: f64,
    pub security_requirements: f64,
    pub performance_requirements: f64,
}

/// Result of scoring one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityScore {
    pub score: f64,
    pub factors: ComplexityFactors,
    pub recommended_tier: ModelTier,
}

/// Scores a serialized request payload.
pub fn analyze(text: &str) -> ComplexityScore {
    let lower = text.to_lowercase();
    let token_estimate = text.split_whitespace().count() as f64 * 1.3;

    let factors = ComplexityFactors {
        token_count: (token_estimate / 1000.0).min(1.0),
        code_complexity: saturate(occurrences(&lower, CODE_KEYWORDS), 3.0),
        domain_complexity: saturate(occurrences(&lower, DOMAIN_KEYWORDS), 2.0),
        security_requirements: saturate(occurrences(&lower, SECURITY_KEYWORDS), 2.0),
        performance_requirements: saturate(occurrences(&lower, PERFORMANCE_KEYWORDS), 2.0),
    };

    let score = (factors.token_count * WEIGHT_TOKENS
        + factors.code_complexity * WEIGHT_CODE
        + factors.domain_complexity * WEIGHT_DOMAIN
        + factors.security_requirements * WEIGHT_SECURITY
        + factors.performance_requirements * WEIGHT_PERFORMANCE)
        .clamp(0.0, 1.0);

    ComplexityScore {
        score,
        factors,
        recommended_tier: ModelTier::from_score(score),
    }
}

fn occurrences(haystack: &str, keywords: &[&str]) -> usize {
    keywords.iter().map(|k| haystack.matches(k).count()).sum()
}

fn saturate(count: usize, divisor: f64) -> f64 {
    (count as f64 / divisor).min(1.0)
}
