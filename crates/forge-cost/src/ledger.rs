use crate::store::KeyValueStore;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One billed model call. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub model: String,
    pub tokens: u64,
    pub cost: f64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub complexity: f64,
}

impl CostRecord {
    pub fn new(model: impl Into<String>, tokens: u64, cost: f64, run_id: Uuid, complexity: f64) -> Self {
        Self {
            model: model.into(),
            tokens,
            cost,
            run_id,
            timestamp: Utc::now(),
            complexity,
        }
    }
}

/// Per-model totals inside a [`CostReport`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub cost: f64,
    pub tokens: u64,
    pub requests: usize,
}

/// Spend summary over a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_requests: usize,
    pub model_breakdown: BTreeMap<String, ModelUsage>,
    pub average_complexity: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Records older than this are dropped from the in-process history.
const HISTORY_RETENTION_DAYS: i64 = 90;
/// Hard cap on the in-process history, oldest dropped first.
const MAX_HISTORY_RECORDS: usize = 100_000;

fn daily_key(date: NaiveDate) -> String {
    format!("daily_cost:{}", date.format("%Y-%m-%d"))
}

/// Tracks spend per run and per day.
///
/// Records are persisted to the shared store under `usage:{run_id}` and summed
/// into `daily_cost:{YYYY-MM-DD}`; a process-local copy, bounded by age and
/// count, backs [`report`].
/// The ledger fails open: store errors are logged and never block a run.
///
/// [`report`]: CostLedger::report
pub struct CostLedger {
    store: Arc<dyn KeyValueStore>,
    history: RwLock<Vec<CostRecord>>,
    monthly_budget_usd: f64,
    alert_threshold: f64,
}

impl CostLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, monthly_budget_usd: f64, alert_threshold: f64) -> Self {
        Self {
            store,
            history: RwLock::new(Vec::new()),
            monthly_budget_usd,
            alert_threshold,
        }
    }

    /// Appends a record and returns today's updated total, if the store answered.
    pub async fn record(&self, record: CostRecord) -> Option<f64> {
        {
            let mut history = self.history.write();
            history.push(record.clone());
            prune_history(&mut history, Utc::now());
        }

        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = self.store.push(&format!("usage:{}", record.run_id), &line).await {
                    error!(run_id = %record.run_id, error = %e, "Failed to persist usage record");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize usage record"),
        }

        let key = daily_key(record.timestamp.date_naive());
        match self.store.incr_by_float(&key, record.cost).await {
            Ok(total) => {
                info!(
                    run_id = %record.run_id,
                    model = %record.model,
                    tokens = record.tokens,
                    cost = record.cost,
                    daily_total = total,
                    "Recorded model usage"
                );
                Some(total)
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to update daily cost");
                None
            }
        }
    }

    /// Month-to-date spend, summed from the daily counters.
    pub async fn monthly_spend(&self) -> f64 {
        self.spend_for_month(Utc::now().date_naive()).await
    }

    async fn spend_for_month(&self, today: NaiveDate) -> f64 {
        let mut total = 0.0;
        for day in 1..=31 {
            let Some(date) = NaiveDate::from_ymd_opt(today.year(), today.month(), day) else {
                break;
            };
            match self.store.get(&daily_key(date)).await {
                Ok(Some(raw)) => match raw.parse::<f64>() {
                    Ok(v) => total += v,
                    Err(e) => warn!(date = %date, error = %e, "Ignoring malformed daily cost"),
                },
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Budget check failed, assuming under budget");
                    return 0.0;
                }
            }
        }
        total
    }

    /// True once month-to-date spend reaches `budget × alert_threshold`.
    pub async fn budget_exceeded(&self) -> bool {
        let spend = self.monthly_spend().await;
        let threshold = self.monthly_budget_usd * self.alert_threshold;
        let exceeded = spend >= threshold;
        if exceeded {
            warn!(spend, threshold, "Monthly spend over alert threshold");
        }
        exceeded
    }

    /// Records stored for a run, oldest first.
    pub async fn run_usage(&self, run_id: Uuid) -> Vec<CostRecord> {
        match self.store.range(&format!("usage:{run_id}")).await {
            Ok(lines) => lines
                .iter()
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect(),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to read usage");
                Vec::new()
            }
        }
    }

    /// Summarizes the records of the last `period`.
    pub fn report(&self, period: Duration) -> CostReport {
        let period_end = Utc::now();
        let period_start = period_end - period;

        let history = self.history.read();
        let in_period: Vec<&CostRecord> = history
            .iter()
            .filter(|r| r.timestamp >= period_start && r.timestamp <= period_end)
            .collect();

        let mut model_breakdown: BTreeMap<String, ModelUsage> = BTreeMap::new();
        for r in &in_period {
            let usage = model_breakdown.entry(r.model.clone()).or_default();
            usage.cost += r.cost;
            usage.tokens += r.tokens;
            usage.requests += 1;
        }

        let total_requests = in_period.len();
        let average_complexity = if total_requests == 0 {
            0.0
        } else {
            in_period.iter().map(|r| r.complexity).sum::<f64>() / total_requests as f64
        };

        CostReport {
            total_cost: in_period.iter().map(|r| r.cost).sum(),
            total_tokens: in_period.iter().map(|r| r.tokens).sum(),
            total_requests,
            model_breakdown,
            average_complexity,
            period_start,
            period_end,
        }
    }
}

fn prune_history(history: &mut Vec<CostRecord>, now: DateTime<Utc>) {
    let cutoff = now - Duration::days(HISTORY_RETENTION_DAYS);
    history.retain(|r| r.timestamp >= cutoff);
    if history.len() > MAX_HISTORY_RECORDS {
        let excess = history.len() - MAX_HISTORY_RECORDS;
        history.drain(..excess);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn ledger(budget: f64) -> (Arc<InMemoryStore>, CostLedger) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), CostLedger::new(store, budget, 0.8))
    }

    #[tokio::test]
    async fn test_record_updates_daily_counter() {
        let (store, ledger) = ledger(100.0);
        let run = Uuid::new_v4();
        ledger.record(CostRecord::new("gpt-4", 1000, 0.03, run, 0.4)).await;
        let total = ledger
            .record(CostRecord::new("gpt-4", 2000, 0.06, run, 0.6))
            .await
            .unwrap();
        assert!((total - 0.09).abs() < 1e-9);

        let key = daily_key(Utc::now().date_naive());
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(ledger.run_usage(run).await.len(), 2);
    }

    #[tokio::test]
    async fn test_budget_threshold() {
        let (_, ledger) = ledger(10.0);
        let run = Uuid::new_v4();
        ledger.record(CostRecord::new("m", 1, 7.5, run, 0.1)).await;
        assert!(!ledger.budget_exceeded().await);
        ledger.record(CostRecord::new("m", 1, 0.5, run, 0.1)).await;
        assert!(ledger.budget_exceeded().await);
    }

    #[tokio::test]
    async fn test_monthly_sum_excludes_other_months() {
        let (store, ledger) = ledger(10.0);
        store.set("daily_cost:2024-02-03", "1.5").await.unwrap();
        store.set("daily_cost:2024-02-29", "2.0").await.unwrap();
        store.set("daily_cost:2024-03-01", "9.0").await.unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
        assert!((ledger.spend_for_month(today).await - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_report_breakdown() {
        let (_, ledger) = ledger(100.0);
        let run = Uuid::new_v4();
        ledger.record(CostRecord::new("gpt-4", 1000, 0.03, run, 0.2)).await;
        ledger.record(CostRecord::new("gpt-4", 1000, 0.03, run, 0.4)).await;
        ledger.record(CostRecord::new("codellama:34b", 500, 0.0001, run, 0.6)).await;

        let report = ledger.report(Duration::hours(1));
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.total_tokens, 2500);
        assert_eq!(report.model_breakdown["gpt-4"].requests, 2);
        assert!((report.average_complexity - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_old_history_is_pruned() {
        let (_, ledger) = ledger(100.0);
        let run = Uuid::new_v4();
        let mut stale = CostRecord::new("gpt-4", 100, 0.01, run, 0.5);
        stale.timestamp = Utc::now() - Duration::days(HISTORY_RETENTION_DAYS + 1);
        ledger.history.write().push(stale);

        ledger.record(CostRecord::new("gpt-4", 100, 0.01, run, 0.5)).await;
        assert_eq!(ledger.history.read().len(), 1);
        assert_eq!(ledger.report(Duration::days(365)).total_requests, 1);
    }

    #[test]
    fn test_history_is_capped() {
        let run = Uuid::new_v4();
        let mut history: Vec<CostRecord> = (0..MAX_HISTORY_RECORDS + 3)
            .map(|i| CostRecord::new("m", i as u64, 0.0, run, 0.0))
            .collect();
        prune_history(&mut history, Utc::now());
        assert_eq!(history.len(), MAX_HISTORY_RECORDS);
        assert_eq!(history[0].tokens, 3);
    }

    #[test]
    fn test_empty_report() {
        let (_, ledger) = ledger(100.0);
        let report = ledger.report(Duration::days(1));
        assert_eq!(report.total_requests, 0);
        assert_eq!(report.average_complexity, 0.0);
    }
}
