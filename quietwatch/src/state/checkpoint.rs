// quietwatch/src/state/checkpoint.rs
//
// File-backed persistence for core-owned state.
//
// On graceful shutdown (and every checkpoint interval) the daemon serializes
// cooldowns, baselines, Quiet Index history, detections, stats and learning
// flags to `<output>/state.json`, so a restart does not re-alert on sources
// that are still cooling down or recompute baselines from scratch.
//
// Writes go to a temp file and are renamed into place; a crash mid-write
// leaves the previous checkpoint intact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::memory::MemoryStore;
use crate::events::{AccountStats, BaselineSnapshot, CooldownEntry, Detection, QuietIndexRecord};

pub const CHECKPOINT_FILE: &str = "state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreState {
    #[serde(default)]
    pub cooldowns: Vec<CooldownEntry>,
    #[serde(default)]
    pub baselines: Vec<BaselineSnapshot>,
    #[serde(default)]
    pub quiet_index: Vec<QuietIndexRecord>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub stats: Vec<AccountStats>,
    /// Accounts whose learning flag was cleared by the baseline job.
    #[serde(default)]
    pub learning_exited: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    saved_at: DateTime<Utc>,
    state: CoreState,
}

pub struct Checkpoint {
    path: PathBuf,
    store: Arc<MemoryStore>,
    interval: Duration,
}

impl Checkpoint {
    pub fn new(dir: &Path, store: Arc<MemoryStore>, interval_secs: u64) -> Self {
        Self {
            path: dir.join(CHECKPOINT_FILE),
            store,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Background checkpoint loop.
    pub async fn checkpoint_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.save().await {
                error!("Checkpoint failed: {:#}", e);
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let file = CheckpointFile { saved_at: Utc::now(), state: self.store.export_core_state() };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        info!(
            cooldowns = file.state.cooldowns.len(),
            baselines = file.state.baselines.len(),
            detections = file.state.detections.len(),
            "Checkpoint saved to {}",
            self.path.display()
        );
        Ok(())
    }

    /// Restore a previous checkpoint, if one exists. Returns when it was saved.
    pub async fn restore(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No checkpoint at {}, starting fresh", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let file: CheckpointFile = match serde_json::from_slice(&raw) {
            Ok(f) => f,
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };
        self.store.import_core_state(file.state);
        info!(saved_at = %file.saved_at, "Checkpoint restored");
        Ok(Some(file.saved_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CooldownKey, RuleKind};
    use crate::state::{AccountRegistry, BaselineStore, CooldownStore};
    use crate::testutil::{account_record, at, baseline};

    #[tokio::test]
    async fn save_then_restore_carries_core_state() {
        let dir = tempfile::tempdir().unwrap();
        let now = at(2024, 3, 1, 12, 0, 0);

        let store = Arc::new(MemoryStore::new());
        store.upsert_account(account_record("a", at(2024, 1, 1, 0, 0, 0), true));
        let key = CooldownKey::new("a", RuleKind::RapidRepeat, "fp");
        CooldownStore::upsert(
            store.as_ref(),
            CooldownEntry { key: key.clone(), created_at: now, expires_at: now + chrono::Duration::hours(12) },
        )
        .await
        .unwrap();
        BaselineStore::upsert(store.as_ref(), baseline("a", 10.0, now)).await.unwrap();
        store.exit_learning_mode("a").await.unwrap();

        Checkpoint::new(dir.path(), store.clone(), 60).save().await.unwrap();

        let fresh = Arc::new(MemoryStore::new());
        fresh.upsert_account(account_record("a", at(2024, 1, 1, 0, 0, 0), true));
        let saved_at = Checkpoint::new(dir.path(), fresh.clone(), 60).restore().await.unwrap();
        assert!(saved_at.is_some());
        assert!(fresh.get(&key).await.unwrap().is_some());
        assert_eq!(fresh.active("a").await.unwrap().unwrap().version, 1);
        assert!(!fresh.account("a").await.unwrap().unwrap().learning_mode);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let restored = Checkpoint::new(dir.path(), store, 60).restore().await.unwrap();
        assert!(restored.is_none());
    }
}
