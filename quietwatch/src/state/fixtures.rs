// quietwatch/src/state/fixtures.rs
//
// File loaders standing in for the external registry and ingestion pipeline.
//
//   accounts: JSON array of AccountRecord (account fields + optional profile)
//   events  : JSONL, one ClickEvent per line; malformed lines are skipped

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::memory::{AccountRecord, MemoryStore};
use crate::events::ClickEvent;

pub async fn load_accounts(path: &Path) -> Result<Vec<AccountRecord>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading accounts {}", path.display()))?;
    let records: Vec<AccountRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing accounts {}", path.display()))?;
    for record in &records {
        if let Some(ref profile) = record.profile {
            profile
                .validate()
                .with_context(|| format!("profile for account {}", record.account.id))?;
        }
    }
    Ok(records)
}

pub fn parse_event_line(line: &str) -> Option<ClickEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ClickEvent>(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Parse error: {}", e);
            None
        }
    }
}

pub async fn load_events(path: &Path) -> Result<Vec<ClickEvent>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading events {}", path.display()))?;
    Ok(raw.lines().filter_map(parse_event_line).collect())
}

/// Load both fixture files into `store`. Returns (accounts, events) loaded.
pub async fn load_into(store: &MemoryStore, accounts: &Path, events: Option<&Path>) -> Result<(usize, usize)> {
    let records = load_accounts(accounts).await?;
    let n_accounts = records.len();
    for record in records {
        store.upsert_account(record);
    }

    let n_events = match events {
        Some(p) => {
            let events = load_events(p).await?;
            let n = events.len();
            store.ingest_many(events);
            n
        }
        None => 0,
    };

    info!(accounts = n_accounts, events = n_events, "Fixtures loaded");
    Ok((n_accounts, n_events))
}
