// quietwatch/src/testutil.rs
//
// Builders shared by unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use crate::config::{DetectionProfile, ResolvedProfile};
use crate::engine::cooldown::CooldownTracker;
use crate::events::{
    Account, ActionKind, BaselineSnapshot, ClickEvent, Detection, DetectionStatus, RuleKind,
    Severity,
};
use crate::rules::{DetectionCandidate, LookbackWindow, RuleContext};
use crate::state::memory::{AccountRecord, MemoryStore};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn account(id: &str, created_at: DateTime<Utc>, learning_mode: bool) -> Account {
    Account {
        id: id.into(),
        owner_id: format!("owner-{id}"),
        active: true,
        created_at,
        sensitivity: None,
        learning_mode,
    }
}

pub fn account_record(id: &str, created_at: DateTime<Utc>, learning_mode: bool) -> AccountRecord {
    AccountRecord { account: account(id, created_at, learning_mode), profile: None }
}

pub fn account_with_profile(id: &str, created_at: DateTime<Utc>, profile: DetectionProfile) -> AccountRecord {
    AccountRecord { account: account(id, created_at, false), profile: Some(profile) }
}

/// Click on network "search" in DE for campaign "c1".
pub fn click(account_id: &str, ts: DateTime<Utc>, device: &str) -> ClickEvent {
    click_on(account_id, ts, device, "search", Some("c1"))
}

pub fn click_on(
    account_id: &str,
    ts: DateTime<Utc>,
    device: &str,
    network: &str,
    campaign: Option<&str>,
) -> ClickEvent {
    ClickEvent {
        id: format!("ev-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        account_id: account_id.into(),
        timestamp: ts,
        device: device.into(),
        network: network.into(),
        country: "DE".into(),
        campaign_id: campaign.map(str::to_string),
        cost_micros: Some(250_000),
    }
}

/// `n` clicks from one device spaced `gap` apart starting at `start`.
pub fn clicks(account_id: &str, start: DateTime<Utc>, gap: Duration, n: usize, device: &str) -> Vec<ClickEvent> {
    (0..n).map(|i| click(account_id, start + gap * i as i32, device)).collect()
}

pub fn detection(account_id: &str, rule: RuleKind, severity: Severity, key: &str, created_at: DateTime<Utc>) -> Detection {
    Detection {
        id: format!("det-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        account_id: account_id.into(),
        rule_id: rule.id().into(),
        rule_name: rule.name().into(),
        severity,
        window_start: created_at - Duration::hours(1),
        window_end: created_at,
        campaign_id: Some("c1".into()),
        evidence: json!({ "fingerprint": key }),
        action: ActionKind::Report,
        status: DetectionStatus::Pending,
        created_at,
    }
}

pub fn baseline(account_id: &str, mean: f64, computed_at: DateTime<Utc>) -> BaselineSnapshot {
    BaselineSnapshot {
        account_id: account_id.into(),
        version: 0,
        mean_clicks_per_hour: mean,
        stddev_clicks_per_hour: 1.0,
        mean_cpc_micros: None,
        device_distribution: BTreeMap::new(),
        network_distribution: BTreeMap::new(),
        geo_distribution: BTreeMap::new(),
        sample_size: 500,
        window_start: computed_at - Duration::days(14),
        window_end: computed_at,
        computed_at,
        valid_until: computed_at + Duration::hours(48),
    }
}

/// Single-account fixture for exercising one rule at a time.
pub struct RuleHarness {
    pub store: Arc<MemoryStore>,
    pub tracker: CooldownTracker,
    pub account: Account,
    pub profile: ResolvedProfile,
    pub baseline: Option<BaselineSnapshot>,
    pub events: Vec<ClickEvent>,
    pub now: DateTime<Utc>,
}

impl RuleHarness {
    /// Account "a", 60 days old, out of learning mode, platform default profile.
    pub fn new(now: DateTime<Utc>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let account = account("a", now - Duration::days(60), false);
        let profile = ResolvedProfile::resolve(&account, None, &DetectionProfile::default());
        Self {
            tracker: CooldownTracker::new(store.clone()),
            store,
            account,
            profile,
            baseline: None,
            events: Vec::new(),
            now,
        }
    }

    pub fn with_events(mut self, mut events: Vec<ClickEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp);
        self.events = events;
        self
    }

    pub fn with_baseline(mut self, baseline: BaselineSnapshot) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Stored per-account profile.
    pub fn with_profile(mut self, profile: DetectionProfile) -> Self {
        self.profile = ResolvedProfile::resolve(&self.account, Some(profile), &DetectionProfile::default());
        self
    }

    pub fn ctx(&self, live: bool) -> RuleContext<'_> {
        RuleContext {
            account: &self.account,
            profile: &self.profile,
            baseline: self.baseline.as_ref(),
            events: &self.events,
            detections: self.store.as_ref(),
            cooldowns: if live { Some(&self.tracker) } else { None },
            now: self.now,
        }
    }

    pub async fn run(&self, rule: RuleKind) -> Vec<DetectionCandidate> {
        self.run_mode(rule, true).await
    }

    pub async fn run_dry(&self, rule: RuleKind) -> Vec<DetectionCandidate> {
        self.run_mode(rule, false).await
    }

    async fn run_mode(&self, rule: RuleKind, live: bool) -> Vec<DetectionCandidate> {
        let ctx = self.ctx(live);
        let window = LookbackWindow::for_rule(rule, self.now, Duration::hours(24));
        rule.detect(&ctx, window).await.unwrap()
    }
}
