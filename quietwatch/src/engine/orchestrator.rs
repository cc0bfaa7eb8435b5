// quietwatch/src/engine/orchestrator.rs
//
// Detection orchestrator: one scheduled pass of the rule catalog over every
// active account.
//
// Failure containment:
//   rule    : logged at warn, counted, the next rule runs
//   account : logged at error, account marked failed, the next account runs
//   run     : only a failed account enumeration aborts; it is written to the
//              job log as `failed` and returned to the scheduler
//
// Accounts run on a JoinSet bounded by a semaphore. With
// `max_parallel_accounts = 1` the loop is strictly sequential. Rules within
// one account always run in catalog order, so meta rules see this run's
// committed detections.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::cooldown::CooldownTracker;
use super::metrics::DetectionMetrics;
use super::{widest_lookback, Stores};
use crate::config::{AppConfig, ResolvedProfile};
use crate::error::{DetectError, DetectResult};
use crate::events::{Account, Detection, JobRun, JobStatus, RuleKind};
use crate::rules::{DetectionCandidate, LookbackWindow, RuleContext};
use crate::state::{AlertSink, JobLog};

pub const JOB_NAME: &str = "anomaly_detection";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub accounts_total: usize,
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub detections_created: usize,
    pub rule_failures: usize,
    pub suppressed: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct AccountOutcome {
    created: usize,
    rule_failures: usize,
}

pub struct Orchestrator {
    stores: Stores,
    cooldowns: Arc<CooldownTracker>,
    alerts: Arc<dyn AlertSink>,
    jobs: Arc<dyn JobLog>,
    metrics: Arc<DetectionMetrics>,
    config: Arc<AppConfig>,
}

impl Orchestrator {
    pub fn new(
        stores: Stores,
        cooldowns: Arc<CooldownTracker>,
        alerts: Arc<dyn AlertSink>,
        jobs: Arc<dyn JobLog>,
        metrics: Arc<DetectionMetrics>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self { stores, cooldowns, alerts, jobs, metrics, config }
    }

    pub fn metrics(&self) -> &Arc<DetectionMetrics> {
        &self.metrics
    }

    pub async fn run(self: &Arc<Self>, now: DateTime<Utc>) -> DetectResult<RunSummary> {
        let started = Instant::now();
        let suppressed_before = self.cooldowns.suppressed_hits();

        let accounts = match self.stores.registry.active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Account enumeration failed, aborting run: {}", e);
                self.log_job(JobStatus::Failed, json!({ "error": e.to_string() }), now).await;
                return Err(e.into());
            }
        };

        let mut summary = RunSummary { accounts_total: accounts.len(), ..Default::default() };
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_accounts.max(1)));
        let mut tasks = JoinSet::new();

        for account in accounts {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| DetectError::TaskFailed(e.to_string()))?;
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let id = account.id.clone();
                (id, this.process_account(account, now).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    summary.accounts_processed += 1;
                    summary.detections_created += outcome.created;
                    summary.rule_failures += outcome.rule_failures;
                }
                Ok((id, Err(e))) => {
                    error!(account = %id, "Account processing failed: {}", e);
                    summary.accounts_failed += 1;
                    DetectionMetrics::add(&self.metrics.accounts_failed, 1);
                }
                Err(e) => {
                    let e = DetectError::TaskFailed(e.to_string());
                    error!("Account processing failed: {}", e);
                    summary.accounts_failed += 1;
                    DetectionMetrics::add(&self.metrics.accounts_failed, 1);
                }
            }
        }

        summary.suppressed = self.cooldowns.suppressed_hits().saturating_sub(suppressed_before);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        DetectionMetrics::add(&self.metrics.runs, 1);
        DetectionMetrics::add(&self.metrics.suppressed, summary.suppressed);

        info!(
            accounts = summary.accounts_total,
            processed = summary.accounts_processed,
            failed = summary.accounts_failed,
            detections = summary.detections_created,
            suppressed = summary.suppressed,
            duration_ms = summary.duration_ms,
            "Detection run complete"
        );
        let metadata = serde_json::to_value(&summary).unwrap_or_default();
        self.log_job(JobStatus::Success, metadata, now).await;
        Ok(summary)
    }

    async fn process_account(&self, account: Account, now: DateTime<Utc>) -> DetectResult<AccountOutcome> {
        let stored = self.stores.registry.detection_profile(&account.id).await?;
        let profile = ResolvedProfile::resolve(&account, stored, &self.config.default_profile);
        let baseline = self.stores.baselines.active(&account.id).await?;

        let max = self.config.max_lookback();
        let events = self
            .stores
            .events
            .events_between(&account.id, now - widest_lookback(max), now)
            .await?;
        DetectionMetrics::add(&self.metrics.events_scanned, events.len() as u64);

        let ctx = RuleContext {
            account: &account,
            profile: &profile,
            baseline: baseline.as_ref(),
            events: &events,
            detections: self.stores.detections.as_ref(),
            cooldowns: Some(self.cooldowns.as_ref()),
            now,
        };

        let mut outcome = AccountOutcome::default();
        let mut created: Vec<Detection> = Vec::new();
        for rule in RuleKind::ALL {
            let window = LookbackWindow::for_rule(rule, now, max);
            let candidates = match rule.detect(&ctx, window).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(account = %account.id, rule = %rule, "Rule failed: {}", e);
                    outcome.rule_failures += 1;
                    DetectionMetrics::add(&self.metrics.rule_failures, 1);
                    continue;
                }
            };
            DetectionMetrics::add(&self.metrics.candidates, candidates.len() as u64);

            for candidate in candidates {
                match self.commit(&account.id, candidate, profile.cooldown_hours(), now).await {
                    Ok(d) => created.push(d),
                    Err(e) => {
                        warn!(account = %account.id, rule = %rule, "Storing detection failed: {}", e);
                        outcome.rule_failures += 1;
                        DetectionMetrics::add(&self.metrics.rule_failures, 1);
                    }
                }
            }
        }

        // detections are already stored and their cooldowns claimed
        if let Err(e) = self.stores.detections.record_stats(&account.id, &created, now).await {
            warn!(account = %account.id, "Stats update failed: {}", e);
        }
        if !created.is_empty() {
            if let Err(e) = self.alerts.notify(&account.id, &created).await {
                warn!(account = %account.id, "Alert trigger failed: {}", e);
            }
        }

        outcome.created = created.len();
        debug!(account = %account.id, preset = %profile.preset(), detections = outcome.created, "Account processed");
        Ok(outcome)
    }

    /// Insert first, then claim the cooldown. A failed insert leaves no claim.
    async fn commit(
        &self,
        account_id: &str,
        candidate: DetectionCandidate,
        cooldown_hours: u32,
        now: DateTime<Utc>,
    ) -> DetectResult<Detection> {
        let rule = candidate.rule;
        let key = candidate.cooldown_key.clone();
        let detection = candidate.into_detection(account_id, now);
        self.stores.detections.insert(&detection).await?;

        if let Err(e) = self.cooldowns.suppress(account_id, rule, &key, cooldown_hours, now).await {
            warn!(account = %account_id, rule = %rule, key = %key, "Cooldown write failed: {}", e);
        }
        self.metrics.record_detection(detection.severity);
        info!(
            account = %account_id,
            rule = %rule,
            severity = %detection.severity,
            key = %key,
            "Detection created"
        );
        Ok(detection)
    }

    async fn log_job(&self, status: JobStatus, metadata: serde_json::Value, now: DateTime<Utc>) {
        let run = JobRun { job_name: JOB_NAME.to_string(), status, metadata, timestamp: now };
        if let Err(e) = self.jobs.record(run).await {
            warn!("Job log write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionProfile;
    use crate::error::{StoreError, StoreResult};
    use crate::events::{AccountStats, CooldownEntry, CooldownKey, DetectionStatus, Sensitivity, Severity};
    use crate::state::memory::MemoryStore;
    use crate::state::{AccountRegistry, CooldownStore, DetectionStore};
    use crate::testutil::{account_record, account_with_profile, at, baseline, clicks};
    use async_trait::async_trait;
    use chrono::Duration;

    fn orchestrator(store: &Arc<MemoryStore>, config: AppConfig) -> Arc<Orchestrator> {
        let stores = Stores::memory(store);
        Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CooldownTracker::new(stores.cooldowns.clone())),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(config),
        ))
    }

    fn seeded(now: DateTime<Utc>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_account(account_record("a", now - Duration::days(60), false));
        store.ingest_many(clicks("a", now - Duration::minutes(10), Duration::seconds(30), 4, "mobile"));
        store
    }

    #[tokio::test]
    async fn rapid_repeat_fires_once_then_cools_down() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        let orch = orchestrator(&store, AppConfig::default());

        let first = orch.run(now).await.unwrap();
        let rapid: Vec<_> = store
            .detections_for("a")
            .into_iter()
            .filter(|d| d.rule_id == "rapid_repeat")
            .collect();
        assert_eq!(rapid.len(), 1);
        assert_eq!(rapid[0].severity, Severity::High);
        assert_eq!(rapid[0].evidence["clicks_count"], 4);
        assert!(store.get(&CooldownKey::new("a", RuleKind::RapidRepeat, "mobile::search::DE::c1")).await.unwrap().is_some());
        assert!(first.detections_created >= 1);

        let total = store.n_detections();
        let second = orch.run(now).await.unwrap();
        assert_eq!(second.detections_created, 0);
        assert_eq!(store.n_detections(), total);
        assert!(second.suppressed >= 1);
    }

    #[tokio::test]
    async fn meta_rules_confirm_same_run_detections() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        // rapid + sustained need 3 / 6 clicks; 6 clicks in 3 minutes fire both
        store.ingest_many(clicks("a", now - Duration::minutes(8), Duration::seconds(30), 2, "mobile"));
        let orch = orchestrator(&store, AppConfig::default());
        orch.run(now).await.unwrap();

        let rules: Vec<String> = store.detections_for("a").into_iter().map(|d| d.rule_id).collect();
        assert!(rules.contains(&"rapid_repeat".to_string()));
        assert!(rules.contains(&"sustained_repeat".to_string()));
        assert!(rules.contains(&"multi_rule_confirmation".to_string()));
    }

    #[tokio::test]
    async fn records_stats_alerts_and_job_run() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        let orch = orchestrator(&store, AppConfig::default());
        let summary = orch.run(now).await.unwrap();

        let stats: AccountStats = store.stats("a").await.unwrap().unwrap();
        assert_eq!(stats.total_detections as usize, summary.detections_created);
        assert_eq!(stats.last_run_at, Some(now));

        let alerts = store.alerts_sent();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1.len(), summary.detections_created);

        let jobs = store.job_runs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name, JOB_NAME);
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[0].metadata["accounts_processed"], 1);
    }

    #[tokio::test]
    async fn handled_detections_are_left_alone() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        let orch = orchestrator(&store, AppConfig::default());
        orch.run(now).await.unwrap();
        let id = store.detections_for("a")[0].id.clone();
        assert!(store.set_status(&id, DetectionStatus::Dismissed));

        orch.run(now + Duration::minutes(5)).await.unwrap();
        let row = store.detections_for("a").into_iter().find(|d| d.id == id).unwrap();
        assert_eq!(row.status, DetectionStatus::Dismissed);
    }

    #[tokio::test]
    async fn stored_profile_tunes_cooldown_and_threshold() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = Arc::new(MemoryStore::new());
        let profile = DetectionProfile { preset: Sensitivity::Easy, cooldown_hours: 2, ..Default::default() };
        store.upsert_account(account_with_profile("a", now - Duration::days(60), profile));
        // 3 clicks: enough for normal, not for easy (4)
        store.ingest_many(clicks("a", now - Duration::minutes(10), Duration::seconds(30), 3, "mobile"));
        store.ingest_many(clicks("a", now - Duration::minutes(30), Duration::seconds(5), 4, "tablet"));
        let orch = orchestrator(&store, AppConfig::default());
        orch.run(now).await.unwrap();

        let rapid: Vec<_> = store
            .detections_for("a")
            .into_iter()
            .filter(|d| d.rule_id == "rapid_repeat")
            .collect();
        assert_eq!(rapid.len(), 1);
        assert_eq!(rapid[0].evidence["device"], "tablet");
        let entry = store
            .get(&CooldownKey::new("a", RuleKind::RapidRepeat, "tablet::search::DE::c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.expires_at, now + Duration::hours(2));
    }

    #[tokio::test]
    async fn spike_fires_with_baseline_only() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = Arc::new(MemoryStore::new());
        store.upsert_account(account_record("a", now - Duration::days(60), false));
        store.upsert_account(account_record("b", now - Duration::days(60), false));
        for id in ["a", "b"] {
            let mut events = Vec::new();
            for i in 0..21 {
                let device = format!("dev-{i}");
                events.extend(clicks(id, now - Duration::minutes(55) + Duration::minutes(2 * i), Duration::seconds(1), 1, &device));
            }
            store.ingest_many(events);
        }
        crate::state::BaselineStore::upsert(store.as_ref(), baseline("a", 10.0, now - Duration::hours(2)))
            .await
            .unwrap();

        let orch = orchestrator(&store, AppConfig { max_parallel_accounts: 2, ..Default::default() });
        let summary = orch.run(now).await.unwrap();
        assert_eq!(summary.accounts_processed, 2);

        let spikes_a: Vec<_> = store.detections_for("a").into_iter().filter(|d| d.rule_id == "account_spike").collect();
        assert_eq!(spikes_a.len(), 1);
        assert_eq!(spikes_a[0].evidence["spike_ratio"], 2.1);
        assert!(store.detections_for("b").iter().all(|d| d.rule_id != "account_spike"));
    }

    #[tokio::test]
    async fn learning_account_does_not_spike() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = Arc::new(MemoryStore::new());
        store.upsert_account(account_record("a", now - Duration::days(9), true));
        let mut events = Vec::new();
        for i in 0..21 {
            let device = format!("dev-{i}");
            events.extend(clicks("a", now - Duration::minutes(55) + Duration::minutes(2 * i), Duration::seconds(1), 1, &device));
        }
        store.ingest_many(events);
        crate::state::BaselineStore::upsert(store.as_ref(), baseline("a", 10.0, now - Duration::hours(2)))
            .await
            .unwrap();

        orchestrator(&store, AppConfig::default()).run(now).await.unwrap();
        assert!(store.detections_for("a").iter().all(|d| d.rule_id != "account_spike"));
    }

    // ── Failure containment ───────────────────────────────────────────────────

    struct BrokenRegistry;

    #[async_trait]
    impl AccountRegistry for BrokenRegistry {
        async fn active_accounts(&self) -> StoreResult<Vec<Account>> {
            Err(StoreError::Backend("registry offline".into()))
        }
        async fn account(&self, _: &str) -> StoreResult<Option<Account>> {
            Ok(None)
        }
        async fn detection_profile(&self, _: &str) -> StoreResult<Option<DetectionProfile>> {
            Ok(None)
        }
        async fn exit_learning_mode(&self, _: &str) -> StoreResult<bool> {
            Ok(false)
        }
    }

    /// Fails profile lookups for one account only, or panics on them.
    struct FlakyProfiles {
        inner: Arc<MemoryStore>,
        broken: &'static str,
        panics: bool,
    }

    #[async_trait]
    impl AccountRegistry for FlakyProfiles {
        async fn active_accounts(&self) -> StoreResult<Vec<Account>> {
            self.inner.active_accounts().await
        }
        async fn account(&self, id: &str) -> StoreResult<Option<Account>> {
            self.inner.account(id).await
        }
        async fn detection_profile(&self, id: &str) -> StoreResult<Option<DetectionProfile>> {
            if id == self.broken {
                if self.panics {
                    panic!("profile row for {id} is corrupt");
                }
                return Err(StoreError::Backend("profile table unavailable".into()));
            }
            self.inner.detection_profile(id).await
        }
        async fn exit_learning_mode(&self, id: &str) -> StoreResult<bool> {
            self.inner.exit_learning_mode(id).await
        }
    }

    /// Cooldown store whose reads always fail.
    struct FailingCooldowns;

    #[async_trait]
    impl CooldownStore for FailingCooldowns {
        async fn get(&self, _: &CooldownKey) -> StoreResult<Option<CooldownEntry>> {
            Err(StoreError::Backend("cooldown table locked".into()))
        }
        async fn upsert(&self, _: CooldownEntry) -> StoreResult<()> {
            Ok(())
        }
        async fn purge_expired(&self, _: DateTime<Utc>) -> StoreResult<usize> {
            Ok(0)
        }
    }

    /// Detection store whose stats writes always fail.
    struct FailingStats {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl DetectionStore for FailingStats {
        async fn insert(&self, detection: &Detection) -> StoreResult<()> {
            DetectionStore::insert(self.inner.as_ref(), detection).await
        }
        async fn pending_between(
            &self,
            account_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StoreResult<Vec<Detection>> {
            self.inner.pending_between(account_id, start, end).await
        }
        async fn record_stats(&self, _: &str, _: &[Detection], _: DateTime<Utc>) -> StoreResult<()> {
            Err(StoreError::Backend("stats table unavailable".into()))
        }
        async fn stats(&self, account_id: &str) -> StoreResult<Option<AccountStats>> {
            self.inner.stats(account_id).await
        }
    }

    #[tokio::test]
    async fn stats_failure_still_alerts_and_counts() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        let mut stores = Stores::memory(&store);
        stores.detections = Arc::new(FailingStats { inner: store.clone() });
        let orch = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CooldownTracker::new(stores.cooldowns.clone())),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(AppConfig::default()),
        ));

        let summary = orch.run(now).await.unwrap();
        assert_eq!(summary.accounts_failed, 0);
        assert_eq!(summary.accounts_processed, 1);
        assert!(summary.detections_created >= 1);
        assert_eq!(summary.detections_created, store.n_detections());

        let alerts = store.alerts_sent();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1.len(), summary.detections_created);
    }

    #[tokio::test]
    async fn enumeration_failure_is_fatal_and_logged() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = Arc::new(MemoryStore::new());
        let mut stores = Stores::memory(&store);
        stores.registry = Arc::new(BrokenRegistry);
        let orch = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CooldownTracker::new(stores.cooldowns.clone())),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(AppConfig::default()),
        ));

        assert!(orch.run(now).await.is_err());
        let jobs = store.job_runs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn one_failing_account_does_not_stop_the_loop() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        store.upsert_account(account_record("z", now - Duration::days(60), false));
        let mut stores = Stores::memory(&store);
        stores.registry = Arc::new(FlakyProfiles { inner: store.clone(), broken: "z", panics: false });
        let orch = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CooldownTracker::new(stores.cooldowns.clone())),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(AppConfig::default()),
        ));

        let summary = orch.run(now).await.unwrap();
        assert_eq!(summary.accounts_total, 2);
        assert_eq!(summary.accounts_failed, 1);
        assert_eq!(summary.accounts_processed, 1);
        assert!(!store.detections_for("a").is_empty());
    }

    #[tokio::test]
    async fn panicking_account_task_is_counted_as_failed() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        store.upsert_account(account_record("z", now - Duration::days(60), false));
        let mut stores = Stores::memory(&store);
        stores.registry = Arc::new(FlakyProfiles { inner: store.clone(), broken: "z", panics: true });
        let orch = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::new(CooldownTracker::new(stores.cooldowns.clone())),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(AppConfig::default()),
        ));

        let summary = orch.run(now).await.unwrap();
        assert_eq!(summary.accounts_failed, 1);
        assert_eq!(summary.accounts_processed, 1);
        assert_eq!(orch.metrics().snapshot()["accounts_failed"], 1);
        assert_eq!(store.job_runs().len(), 1);
    }

    #[tokio::test]
    async fn rule_failures_are_contained() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let store = seeded(now);
        let stores = Stores::memory(&store);
        let orch = Arc::new(Orchestrator::new(
            stores,
            Arc::new(CooldownTracker::new(Arc::new(FailingCooldowns))),
            store.clone(),
            store.clone(),
            DetectionMetrics::new(),
            Arc::new(AppConfig::default()),
        ));

        let summary = orch.run(now).await.unwrap();
        assert_eq!(summary.accounts_processed, 1);
        assert!(summary.rule_failures >= 1);
        assert_eq!(orch.metrics().snapshot()["rule_failures"], summary.rule_failures as u64);
    }
}
