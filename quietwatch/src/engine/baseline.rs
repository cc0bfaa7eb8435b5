// quietwatch/src/engine/baseline.rs
//
// Baseline calculator: daily per-account statistical norms.
//
// For each active account at least 7 days old with events in the trailing
// 14 days:
//   - hourly click counts over [max(created_at, now − 14d), now), empty hours
//     included; mean and population standard deviation
//   - mean cost per click over events that carry a cost
//   - device / network / geo distributions as fractions of all events
//
// The snapshot replaces the active one (history is kept). Learning mode is
// exited once, one way: ≥ 1000 events in 14 days, account ≥ 14 days old.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::Stores;
use crate::error::{DetectError, DetectResult};
use crate::events::{Account, BaselineSnapshot, ClickEvent, JobRun, JobStatus};
use crate::state::JobLog;

pub const JOB_NAME: &str = "baseline_calculation";

pub const WINDOW_DAYS: i64 = 14;
pub const MIN_ACCOUNT_AGE_DAYS: i64 = 7;
pub const LEARNING_EXIT_EVENTS: u64 = 1000;
pub const LEARNING_EXIT_AGE_DAYS: i64 = 14;
pub const VALIDITY_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooYoung,
    NoEvents,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BaselineOutcome {
    Computed { version: u32, exited_learning: bool },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub exited_learning: usize,
}

/// Mean and population standard deviation. (0, 0) for no values.
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn distribution<'e>(keys: impl Iterator<Item = &'e str>, total: usize) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for k in keys {
        *counts.entry(k.to_string()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(k, n)| (k, n as f64 / total.max(1) as f64))
        .collect()
}

/// Build a snapshot from the events in `[start, now]`. Version is assigned
/// by the store.
pub fn build_snapshot(
    account_id: &str,
    events: &[ClickEvent],
    start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> BaselineSnapshot {
    let span_secs = (now - start).num_seconds().max(1);
    let hours = ((span_secs + 3599) / 3600) as usize;
    let mut buckets = vec![0.0_f64; hours];
    for e in events {
        let idx = ((e.timestamp - start).num_seconds().max(0) / 3600) as usize;
        buckets[idx.min(hours - 1)] += 1.0;
    }
    let (mean, stddev) = mean_stddev(&buckets);

    let costs: Vec<f64> = events.iter().filter_map(|e| e.cost_micros).map(|c| c as f64).collect();
    let mean_cpc = if costs.is_empty() {
        None
    } else {
        Some(costs.iter().sum::<f64>() / costs.len() as f64)
    };

    let total = events.len();
    BaselineSnapshot {
        account_id: account_id.to_string(),
        version: 0,
        mean_clicks_per_hour: mean,
        stddev_clicks_per_hour: stddev,
        mean_cpc_micros: mean_cpc,
        device_distribution: distribution(events.iter().map(|e| e.device.as_str()), total),
        network_distribution: distribution(events.iter().map(|e| e.network.as_str()), total),
        geo_distribution: distribution(events.iter().map(|e| e.country.as_str()), total),
        sample_size: total as u64,
        window_start: start,
        window_end: now,
        computed_at: now,
        valid_until: now + Duration::hours(VALIDITY_HOURS),
    }
}

pub struct BaselineCalculator {
    stores: Stores,
    jobs: Arc<dyn JobLog>,
}

impl BaselineCalculator {
    pub fn new(stores: Stores, jobs: Arc<dyn JobLog>) -> Self {
        Self { stores, jobs }
    }

    /// Daily pass over every active account.
    pub async fn run(&self, now: DateTime<Utc>) -> DetectResult<BaselineSummary> {
        let accounts = match self.stores.registry.active_accounts().await {
            Ok(a) => a,
            Err(e) => {
                error!("Account enumeration failed, aborting baseline run: {}", e);
                self.log_job(JobStatus::Failed, json!({ "error": e.to_string() }), now).await;
                return Err(e.into());
            }
        };

        let mut summary = BaselineSummary::default();
        for account in &accounts {
            match self.compute_for(account, now).await {
                Ok(BaselineOutcome::Computed { exited_learning, .. }) => {
                    summary.computed += 1;
                    if exited_learning {
                        summary.exited_learning += 1;
                    }
                }
                Ok(BaselineOutcome::Skipped(reason)) => {
                    debug!(account = %account.id, ?reason, "Baseline skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(account = %account.id, "Baseline failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            computed = summary.computed,
            skipped = summary.skipped,
            failed = summary.failed,
            exited_learning = summary.exited_learning,
            "Baseline run complete"
        );
        let metadata = serde_json::to_value(&summary).unwrap_or_default();
        self.log_job(JobStatus::Success, metadata, now).await;
        Ok(summary)
    }

    pub async fn compute_for(&self, account: &Account, now: DateTime<Utc>) -> DetectResult<BaselineOutcome> {
        if account.age(now) < Duration::days(MIN_ACCOUNT_AGE_DAYS) {
            return Ok(BaselineOutcome::Skipped(SkipReason::TooYoung));
        }
        let trailing = now - Duration::days(WINDOW_DAYS);
        let start = account.created_at.max(trailing);
        let events = self.stores.events.events_between(&account.id, start, now).await?;
        if events.is_empty() {
            return Ok(BaselineOutcome::Skipped(SkipReason::NoEvents));
        }

        let snapshot = build_snapshot(&account.id, &events, start, now);
        let (mean, sample) = (snapshot.mean_clicks_per_hour, snapshot.sample_size);
        let version = self.stores.baselines.upsert(snapshot).await?;
        info!(account = %account.id, version, mean, sample, "Baseline stored");

        let exited_learning = self.maybe_exit_learning(account, trailing, now).await?;
        Ok(BaselineOutcome::Computed { version, exited_learning })
    }

    async fn maybe_exit_learning(
        &self,
        account: &Account,
        trailing: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DetectResult<bool> {
        if !account.learning_mode || account.age(now) < Duration::days(LEARNING_EXIT_AGE_DAYS) {
            return Ok(false);
        }
        let count = self.stores.events.count_between(&account.id, trailing, now, None).await?;
        if count < LEARNING_EXIT_EVENTS {
            return Ok(false);
        }
        let flipped = self.stores.registry.exit_learning_mode(&account.id).await?;
        if flipped {
            info!(account = %account.id, events = count, "Account left learning mode");
        }
        Ok(flipped)
    }

    /// Single account by id, for the CLI.
    pub async fn compute_by_id(&self, account_id: &str, now: DateTime<Utc>) -> DetectResult<BaselineOutcome> {
        let account = self
            .stores
            .registry
            .account(account_id)
            .await?
            .ok_or_else(|| DetectError::AccountNotFound(account_id.to_string()))?;
        self.compute_for(&account, now).await
    }

    async fn log_job(&self, status: JobStatus, metadata: serde_json::Value, now: DateTime<Utc>) {
        let run = JobRun { job_name: JOB_NAME.to_string(), status, metadata, timestamp: now };
        if let Err(e) = self.jobs.record(run).await {
            warn!("Job log write failed: {}", e);
        }
    }
}
