use forge_agent::{ModelTier, TierTable};
use forge_core::{ForgeError, ForgeResult};
use forge_sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from `forge.toml`.
///
/// Built once by the caller and passed to the [`Orchestrator`](crate::Orchestrator);
/// nothing in the workspace reads configuration from globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub tiers: TierTable,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            budget: BudgetConfig::default(),
            tiers: TierTable::default(),
            sandbox: SandboxConfig::default(),
            store: StoreConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Errors tolerated per run; one more forces the run to fail.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upper bound on participant turns per run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_rounds: default_max_rounds(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

impl WorkflowConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_monthly_budget")]
    pub monthly_budget_usd: f64,
    /// Fraction of the monthly budget after which tiers are downgraded.
    #[serde(default = "default_alert_threshold")]
    pub cost_alert_threshold: f64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_budget_usd: default_monthly_budget(),
            cost_alert_threshold: default_alert_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl BudgetConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Where spend counters, cached responses and routing decisions are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// `{data_dir}/forge.db`, kept across restarts.
    #[default]
    Sqlite,
    /// Process-local; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

impl ForgeConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("forge.db")
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_rounds() -> u32 {
    50
}
fn default_turn_timeout_secs() -> u64 {
    300
}
fn default_monthly_budget() -> f64 {
    1000.0
}
fn default_alert_threshold() -> f64 {
    0.8
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

impl ForgeConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> ForgeResult<Self> {
        let config: ForgeConfig =
            toml::from_str(s).map_err(|e| ForgeError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub async fn load(path: &Path) -> ForgeResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ForgeError::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.workflow.max_rounds == 0 {
            return Err(ForgeError::Config("workflow.max_rounds must be positive".into()));
        }
        if self.workflow.turn_timeout_secs == 0 {
            return Err(ForgeError::Config(
                "workflow.turn_timeout_secs must be positive".into(),
            ));
        }
        if !(self.budget.monthly_budget_usd.is_finite() && self.budget.monthly_budget_usd > 0.0) {
            return Err(ForgeError::Config(
                "budget.monthly_budget_usd must be a positive number".into(),
            ));
        }
        let threshold = self.budget.cost_alert_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ForgeError::Config(format!(
                "budget.cost_alert_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.budget.cache_ttl_secs == 0 {
            return Err(ForgeError::Config("budget.cache_ttl_secs must be positive".into()));
        }
        for tier in ModelTier::ALL {
            let cfg = self.tiers.get(tier);
            if cfg.models.is_empty() {
                return Err(ForgeError::Config(format!("tiers.{tier} has no models")));
            }
            if !(cfg.cost_per_1k_tokens.is_finite() && cfg.cost_per_1k_tokens >= 0.0) {
                return Err(ForgeError::Config(format!(
                    "tiers.{tier}.cost_per_1k_tokens must be non-negative"
                )));
            }
            if cfg.max_tokens == 0 {
                return Err(ForgeError::Config(format!("tiers.{tier}.max_tokens must be positive")));
            }
            if !(0.0..=2.0).contains(&cfg.temperature) {
                return Err(ForgeError::Config(format!(
                    "tiers.{tier}.temperature must be in [0, 2]"
                )));
            }
        }
        self.sandbox.validate()
    }
}
