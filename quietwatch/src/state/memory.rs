// quietwatch/src/state/memory.rs
//
// In-process store backing every store trait.
// DashMap = sharded concurrent HashMap: safe across tokio tasks with no
// global mutex. Every write touches exactly one map entry, so upserts are
// atomic per key.
//
// Layout:
//   - accounts    account_id → account + optional stored profile
//   - events      account_id → chronologically sorted click events
//   - detections  account_id → detection rows (insertion order)
//   - cooldowns   (account, rule, key) → expiry
//   - baselines   account_id → snapshot history, last = active
//   - quiet_index account_id → record history, last = latest

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::checkpoint::CoreState;
use super::{
    AccountRegistry, AlertSink, BaselineStore, CooldownStore, DetectionStore, EventStore, JobLog,
    QuietIndexStore,
};
use crate::config::DetectionProfile;
use crate::error::{StoreError, StoreResult};
use crate::events::{
    Account, AccountStats, BaselineSnapshot, ClickEvent, CooldownEntry, CooldownKey, Detection,
    DetectionStatus, JobRun, QuietIndexRecord,
};

/// Registry row: the account plus the profile its owner saved, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(flatten)]
    pub account: Account,
    #[serde(default)]
    pub profile: Option<DetectionProfile>,
}

pub struct MemoryStore {
    accounts: DashMap<String, AccountRecord>,
    events: DashMap<String, Arc<RwLock<Vec<ClickEvent>>>>,
    detections: DashMap<String, Vec<Detection>>,
    stats: DashMap<String, AccountStats>,
    cooldowns: DashMap<CooldownKey, CooldownEntry>,
    baselines: DashMap<String, Vec<BaselineSnapshot>>,
    quiet_index: DashMap<String, Vec<QuietIndexRecord>>,
    jobs: Mutex<Vec<JobRun>>,
    alerts: Mutex<Vec<(String, Vec<String>)>>,

    pub total_events: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            events: DashMap::new(),
            detections: DashMap::new(),
            stats: DashMap::new(),
            cooldowns: DashMap::new(),
            baselines: DashMap::new(),
            quiet_index: DashMap::new(),
            jobs: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            total_events: AtomicU64::new(0),
        }
    }

    // ── Ingestion (external collaborators' side) ──────────────────────────────

    pub fn upsert_account(&self, record: AccountRecord) {
        self.accounts.insert(record.account.id.clone(), record);
    }

    /// Insert one event keeping the per-account list sorted by timestamp.
    /// Events with equal timestamps keep arrival order.
    pub fn ingest(&self, event: ClickEvent) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let list = self
            .events
            .entry(event.account_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone();
        let mut list = list.write();
        let at = list.partition_point(|e| e.timestamp <= event.timestamp);
        list.insert(at, event);
    }

    pub fn ingest_many(&self, events: impl IntoIterator<Item = ClickEvent>) {
        for event in events {
            self.ingest(event);
        }
    }

    /// Status change made by an account holder (resolve/dismiss/investigate).
    pub fn set_status(&self, detection_id: &str, status: DetectionStatus) -> bool {
        for mut rows in self.detections.iter_mut() {
            if let Some(d) = rows.iter_mut().find(|d| d.id == detection_id) {
                d.status = status;
                return true;
            }
        }
        false
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn n_accounts(&self) -> usize {
        self.accounts.len()
    }

    /// Every registered account id, sorted.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn detections_for(&self, account_id: &str) -> Vec<Detection> {
        self.detections.get(account_id).map(|d| d.clone()).unwrap_or_default()
    }

    pub fn n_detections(&self) -> usize {
        self.detections.iter().map(|d| d.len()).sum()
    }

    pub fn cooldown_entries(&self) -> Vec<CooldownEntry> {
        self.cooldowns.iter().map(|e| e.value().clone()).collect()
    }

    pub fn job_runs(&self) -> Vec<JobRun> {
        self.jobs.lock().clone()
    }

    pub fn alerts_sent(&self) -> Vec<(String, Vec<String>)> {
        self.alerts.lock().clone()
    }

    // ── Checkpoint support ────────────────────────────────────────────────────

    pub fn export_core_state(&self) -> CoreState {
        CoreState {
            cooldowns: self.cooldown_entries(),
            baselines: self.baselines.iter().flat_map(|e| e.value().clone()).collect(),
            quiet_index: self.quiet_index.iter().flat_map(|e| e.value().clone()).collect(),
            detections: self.detections.iter().flat_map(|e| e.value().clone()).collect(),
            stats: self.stats.iter().map(|e| e.value().clone()).collect(),
            learning_exited: self
                .accounts
                .iter()
                .filter(|r| !r.account.learning_mode)
                .map(|r| r.account.id.clone())
                .collect(),
        }
    }

    /// Restore core-owned state. Registry rows must already be loaded; the
    /// learning flag is only ever cleared, never set.
    pub fn import_core_state(&self, state: CoreState) {
        for entry in state.cooldowns {
            self.cooldowns.insert(entry.key.clone(), entry);
        }
        for snapshot in state.baselines {
            self.baselines.entry(snapshot.account_id.clone()).or_default().push(snapshot);
        }
        for mut history in self.baselines.iter_mut() {
            history.sort_by_key(|s| s.version);
        }
        for record in state.quiet_index {
            self.quiet_index.entry(record.account_id.clone()).or_default().push(record);
        }
        for mut history in self.quiet_index.iter_mut() {
            history.sort_by_key(|r| r.computed_at);
        }
        let mut seen: HashSet<String> = HashSet::new();
        for detection in state.detections {
            if seen.insert(detection.id.clone()) {
                self.detections.entry(detection.account_id.clone()).or_default().push(detection);
            }
        }
        for stats in state.stats {
            self.stats.insert(stats.account_id.clone(), stats);
        }
        for id in state.learning_exited {
            if let Some(mut r) = self.accounts.get_mut(&id) {
                r.account.learning_mode = false;
            }
        }
        debug!(
            cooldowns = self.cooldowns.len(),
            accounts = self.baselines.len(),
            "core state restored"
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn range_of(list: &[ClickEvent], start: DateTime<Utc>, end: DateTime<Utc>) -> std::ops::Range<usize> {
    let lo = list.partition_point(|e| e.timestamp < start);
    let hi = list.partition_point(|e| e.timestamp <= end);
    lo..hi.max(lo)
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn events_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ClickEvent>> {
        let Some(list) = self.events.get(account_id).map(|l| l.clone()) else {
            return Ok(Vec::new());
        };
        let list = list.read();
        Ok(list[range_of(&list, start, end)].to_vec())
    }

    async fn count_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        campaign_id: Option<&str>,
    ) -> StoreResult<u64> {
        let Some(list) = self.events.get(account_id).map(|l| l.clone()) else {
            return Ok(0);
        };
        let list = list.read();
        let slice = &list[range_of(&list, start, end)];
        let n = match campaign_id {
            Some(c) => slice.iter().filter(|e| e.campaign_id.as_deref() == Some(c)).count(),
            None => slice.len(),
        };
        Ok(n as u64)
    }
}

#[async_trait]
impl AccountRegistry for MemoryStore {
    async fn active_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|r| r.account.active)
            .map(|r| r.account.clone())
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>> {
        Ok(self.accounts.get(account_id).map(|r| r.account.clone()))
    }

    async fn detection_profile(&self, account_id: &str) -> StoreResult<Option<DetectionProfile>> {
        Ok(self.accounts.get(account_id).and_then(|r| r.profile.clone()))
    }

    async fn exit_learning_mode(&self, account_id: &str) -> StoreResult<bool> {
        let mut record = self
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        if record.account.learning_mode {
            record.account.learning_mode = false;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[async_trait]
impl DetectionStore for MemoryStore {
    async fn insert(&self, detection: &Detection) -> StoreResult<()> {
        let mut rows = self.detections.entry(detection.account_id.clone()).or_default();
        if rows.iter().any(|d| d.id == detection.id) {
            return Err(StoreError::Backend(format!("duplicate detection id {}", detection.id)));
        }
        rows.push(detection.clone());
        Ok(())
    }

    async fn pending_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Detection>> {
        let mut pending: Vec<Detection> = self
            .detections
            .get(account_id)
            .map(|rows| {
                rows.iter()
                    .filter(|d| d.status == DetectionStatus::Pending)
                    .filter(|d| d.created_at >= start && d.created_at <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by_key(|d| d.created_at);
        Ok(pending)
    }

    async fn record_stats(
        &self,
        account_id: &str,
        created: &[Detection],
        run_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut stats = self.stats.entry(account_id.to_string()).or_insert_with(|| AccountStats {
            account_id: account_id.to_string(),
            ..Default::default()
        });
        for d in created {
            stats.total_detections += 1;
            *stats.by_severity.entry(d.severity.to_string()).or_default() += 1;
            *stats.by_rule.entry(d.rule_id.clone()).or_default() += 1;
            if stats.last_detection_at.map_or(true, |t| d.created_at > t) {
                stats.last_detection_at = Some(d.created_at);
            }
        }
        stats.last_run_at = Some(run_at);
        Ok(())
    }

    async fn stats(&self, account_id: &str) -> StoreResult<Option<AccountStats>> {
        Ok(self.stats.get(account_id).map(|s| s.clone()))
    }
}

#[async_trait]
impl CooldownStore for MemoryStore {
    async fn get(&self, key: &CooldownKey) -> StoreResult<Option<CooldownEntry>> {
        Ok(self.cooldowns.get(key).map(|e| e.clone()))
    }

    async fn upsert(&self, entry: CooldownEntry) -> StoreResult<()> {
        self.cooldowns.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let before = self.cooldowns.len();
        self.cooldowns.retain(|_, e| e.is_active(now));
        Ok(before.saturating_sub(self.cooldowns.len()))
    }
}

#[async_trait]
impl BaselineStore for MemoryStore {
    async fn active(&self, account_id: &str) -> StoreResult<Option<BaselineSnapshot>> {
        Ok(self.baselines.get(account_id).and_then(|h| h.last().cloned()))
    }

    async fn upsert(&self, mut snapshot: BaselineSnapshot) -> StoreResult<u32> {
        let mut history = self.baselines.entry(snapshot.account_id.clone()).or_default();
        let version = history.last().map_or(1, |s| s.version + 1);
        snapshot.version = version;
        history.push(snapshot);
        Ok(version)
    }

    async fn history(&self, account_id: &str) -> StoreResult<Vec<BaselineSnapshot>> {
        Ok(self.baselines.get(account_id).map(|h| h.clone()).unwrap_or_default())
    }
}

#[async_trait]
impl QuietIndexStore for MemoryStore {
    async fn latest(&self, account_id: &str) -> StoreResult<Option<QuietIndexRecord>> {
        Ok(self.quiet_index.get(account_id).and_then(|h| h.last().cloned()))
    }

    async fn insert(&self, record: QuietIndexRecord) -> StoreResult<()> {
        self.quiet_index.entry(record.account_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn history(&self, account_id: &str, limit: usize) -> StoreResult<Vec<QuietIndexRecord>> {
        Ok(self
            .quiet_index
            .get(account_id)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl JobLog for MemoryStore {
    async fn record(&self, run: JobRun) -> StoreResult<()> {
        self.jobs.lock().push(run);
        Ok(())
    }
}

#[async_trait]
impl AlertSink for MemoryStore {
    async fn notify(&self, account_id: &str, detections: &[Detection]) -> StoreResult<()> {
        let ids = detections.iter().map(|d| d.id.clone()).collect();
        self.alerts.lock().push((account_id.to_string(), ids));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{RuleKind, Severity};
    use crate::testutil::{account_record, at, click, detection};
    use chrono::Duration;

    #[tokio::test]
    async fn events_stay_sorted_and_range_is_inclusive() {
        let store = MemoryStore::new();
        let t0 = at(2024, 3, 1, 12, 0, 0);
        store.ingest(click("a", t0 + Duration::seconds(30), "fp"));
        store.ingest(click("a", t0, "fp"));
        store.ingest(click("a", t0 + Duration::seconds(60), "fp"));

        let all = store.events_between("a", t0, t0 + Duration::seconds(60)).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let tail = store
            .events_between("a", t0 + Duration::seconds(1), t0 + Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert!(store.events_between("missing", t0, t0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_filters_by_campaign() {
        let store = MemoryStore::new();
        let t0 = at(2024, 3, 1, 12, 0, 0);
        let mut other = click("a", t0, "fp");
        other.campaign_id = Some("other".into());
        store.ingest(click("a", t0, "fp"));
        store.ingest(other);
        let end = t0 + Duration::minutes(1);
        assert_eq!(store.count_between("a", t0, end, None).await.unwrap(), 2);
        assert_eq!(store.count_between("a", t0, end, Some("other")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cooldown_upsert_replaces_and_purge_drops_expired() {
        let store = MemoryStore::new();
        let now = at(2024, 3, 1, 12, 0, 0);
        let key = CooldownKey::new("a", RuleKind::RapidRepeat, "fp");
        let entry = |hours| CooldownEntry {
            key: key.clone(),
            created_at: now,
            expires_at: now + Duration::hours(hours),
        };
        CooldownStore::upsert(&store, entry(1)).await.unwrap();
        CooldownStore::upsert(&store, entry(12)).await.unwrap();
        assert_eq!(store.cooldown_entries().len(), 1);
        assert_eq!(store.get(&key).await.unwrap().unwrap().expires_at, now + Duration::hours(12));

        assert_eq!(store.purge_expired(now + Duration::hours(11)).await.unwrap(), 0);
        assert_eq!(store.purge_expired(now + Duration::hours(12)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn baseline_upsert_supersedes_without_deleting() {
        let store = MemoryStore::new();
        let snapshot = crate::testutil::baseline("a", 10.0, at(2024, 3, 1, 0, 0, 0));
        assert_eq!(BaselineStore::upsert(&store, snapshot.clone()).await.unwrap(), 1);
        assert_eq!(BaselineStore::upsert(&store, snapshot).await.unwrap(), 2);
        assert_eq!(store.active("a").await.unwrap().unwrap().version, 2);
        assert_eq!(BaselineStore::history(&store, "a").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn learning_mode_only_exits_once() {
        let store = MemoryStore::new();
        store.upsert_account(account_record("a", at(2024, 1, 1, 0, 0, 0), true));
        assert!(store.exit_learning_mode("a").await.unwrap());
        assert!(!store.exit_learning_mode("a").await.unwrap());
        assert!(store.exit_learning_mode("missing").await.is_err());
    }

    #[tokio::test]
    async fn pending_between_skips_handled_rows() {
        let store = MemoryStore::new();
        let now = at(2024, 3, 1, 12, 0, 0);
        let d1 = detection("a", RuleKind::RapidRepeat, Severity::High, "fp", now);
        let mut d2 = detection("a", RuleKind::NetworkSwitch, Severity::Medium, "fp", now);
        d2.id = "other".into();
        DetectionStore::insert(&store, &d1).await.unwrap();
        DetectionStore::insert(&store, &d2).await.unwrap();
        assert!(store.set_status("other", DetectionStatus::Dismissed));

        let pending = store
            .pending_between("a", now - Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, d1.id);
    }

    #[tokio::test]
    async fn duplicate_detection_ids_are_rejected() {
        let store = MemoryStore::new();
        let now = at(2024, 3, 1, 12, 0, 0);
        let d = detection("a", RuleKind::RapidRepeat, Severity::High, "fp", now);
        DetectionStore::insert(&store, &d).await.unwrap();
        assert!(DetectionStore::insert(&store, &d).await.is_err());
        assert_eq!(store.n_detections(), 1);
    }

    #[tokio::test]
    async fn stats_accumulate_across_runs() {
        let store = MemoryStore::new();
        let now = at(2024, 3, 1, 12, 0, 0);
        let d = detection("a", RuleKind::RapidRepeat, Severity::High, "fp", now);
        store.record_stats("a", std::slice::from_ref(&d), now).await.unwrap();
        store.record_stats("a", &[], now + Duration::hours(1)).await.unwrap();
        let stats = store.stats("a").await.unwrap().unwrap();
        assert_eq!(stats.total_detections, 1);
        assert_eq!(stats.by_severity.get("high"), Some(&1));
        assert_eq!(stats.by_rule.get("rapid_repeat"), Some(&1));
        assert_eq!(stats.last_run_at, Some(now + Duration::hours(1)));
    }
}
