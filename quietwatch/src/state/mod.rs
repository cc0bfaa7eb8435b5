// quietwatch/src/state/mod.rs
//
// Narrow, account-scoped store interfaces.
//
// Event store and account registry are external collaborators and are only
// read. Cooldown, baseline and Quiet Index stores are owned by the core and
// must upsert by key so concurrent writers never duplicate rows. The
// detection store is append-only from the core's point of view.

pub mod checkpoint;
pub mod fixtures;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DetectionProfile;
use crate::error::StoreResult;
use crate::events::{
    Account, AccountStats, BaselineSnapshot, ClickEvent, CooldownEntry, CooldownKey, Detection,
    JobRun, QuietIndexRecord,
};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events with `start <= timestamp <= end`, oldest first.
    async fn events_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ClickEvent>>;

    async fn count_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        campaign_id: Option<&str>,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    async fn active_accounts(&self) -> StoreResult<Vec<Account>>;

    async fn account(&self, account_id: &str) -> StoreResult<Option<Account>>;

    async fn detection_profile(&self, account_id: &str) -> StoreResult<Option<DetectionProfile>>;

    /// Clears the learning flag. Returns true if it was set. Never sets it.
    async fn exit_learning_mode(&self, account_id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait DetectionStore: Send + Sync {
    async fn insert(&self, detection: &Detection) -> StoreResult<()>;

    /// Pending detections created within `[start, end]`, oldest first.
    async fn pending_between(
        &self,
        account_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Detection>>;

    async fn record_stats(
        &self,
        account_id: &str,
        created: &[Detection],
        run_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn stats(&self, account_id: &str) -> StoreResult<Option<AccountStats>>;
}

#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn get(&self, key: &CooldownKey) -> StoreResult<Option<CooldownEntry>>;

    /// Insert or replace the entry for `entry.key`.
    async fn upsert(&self, entry: CooldownEntry) -> StoreResult<()>;

    /// Drops expired entries, returning how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn active(&self, account_id: &str) -> StoreResult<Option<BaselineSnapshot>>;

    /// Stores `snapshot` as the active one; the previous snapshot is kept in
    /// history. Returns the assigned version.
    async fn upsert(&self, snapshot: BaselineSnapshot) -> StoreResult<u32>;

    async fn history(&self, account_id: &str) -> StoreResult<Vec<BaselineSnapshot>>;
}

#[async_trait]
pub trait QuietIndexStore: Send + Sync {
    async fn latest(&self, account_id: &str) -> StoreResult<Option<QuietIndexRecord>>;

    async fn insert(&self, record: QuietIndexRecord) -> StoreResult<()>;

    /// Newest first.
    async fn history(&self, account_id: &str, limit: usize) -> StoreResult<Vec<QuietIndexRecord>>;
}

#[async_trait]
pub trait JobLog: Send + Sync {
    async fn record(&self, run: JobRun) -> StoreResult<()>;
}

/// Downstream alerting hook, called once per account per run.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, account_id: &str, detections: &[Detection]) -> StoreResult<()>;
}
