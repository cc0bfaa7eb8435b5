// quietwatch/src/engine/cooldown.rs
//
// Cooldown tracker: suppresses repeat alerts for one (account, rule, key).
//
// Expiry is checked at read time, so correctness never depends on the purge
// loop having run. The purge only keeps the store bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::events::{CooldownEntry, CooldownKey, RuleKind};
use crate::state::CooldownStore;

pub struct CooldownTracker {
    store: Arc<dyn CooldownStore>,
    suppressed_hits: AtomicU64,
}

impl CooldownTracker {
    pub fn new(store: Arc<dyn CooldownStore>) -> Self {
        Self { store, suppressed_hits: AtomicU64::new(0) }
    }

    pub async fn is_suppressed(
        &self,
        account_id: &str,
        rule: RuleKind,
        key: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let k = CooldownKey::new(account_id, rule, key);
        match self.store.get(&k).await? {
            Some(entry) if entry.is_active(now) => {
                self.suppressed_hits.fetch_add(1, Ordering::Relaxed);
                debug!(cooldown = %k, expires_at = %entry.expires_at, "suppressed");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Idempotent: replaces any existing entry for the key.
    pub async fn suppress(
        &self,
        account_id: &str,
        rule: RuleKind,
        key: &str,
        hours: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<CooldownEntry> {
        let entry = CooldownEntry {
            key: CooldownKey::new(account_id, rule, key),
            created_at: now,
            expires_at: now + Duration::hours(hours as i64),
        };
        self.store.upsert(entry.clone()).await?;
        Ok(entry)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.store.purge_expired(now).await
    }

    pub fn suppressed_hits(&self) -> u64 {
        self.suppressed_hits.load(Ordering::Relaxed)
    }

    /// Background purge of expired entries.
    pub async fn housekeeping_loop(self: Arc<Self>, every: std::time::Duration) {
        loop {
            tokio::time::sleep(every).await;
            match self.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "expired cooldowns purged"),
                Err(e) => warn!("cooldown purge failed: {}", e),
            }
        }
    }
}
