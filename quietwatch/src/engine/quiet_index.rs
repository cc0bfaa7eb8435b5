// quietwatch/src/engine/quiet_index.rs
//
// Quiet Index: 0..100 trust score per account (higher = cleaner traffic).
//
// Every click in the scoring window is run through the full rule catalog in
// dry-run mode (no cooldowns read or written, nothing stored). Each rule is
// evaluated over consecutive slices of its own lookback that together cover
// the scoring window. Sliding-window rules see each slice widened back by
// their threshold width, so a run straddling a slice boundary is still found.
// A candidate flags the events its scope covers.
//
// Per-event fraud probability (percent), noisy-OR over flagging rules, each
// rule contributing its strongest severity:
//   high 0.80   medium 0.50   low 0.25
//   p = 1 − Π(1 − p_rule)
//
// score = clamp(round(100 − mean(p)), 0, 100); 100 when there are no events.
// A stored record younger than one hour is served instead of recomputing.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{widest_lookback, Stores};
use crate::config::{AppConfig, ResolvedProfile, MAX_WINDOW_HOURS};
use crate::error::{DetectError, DetectResult};
use crate::events::{Account, QuietBand, QuietIndexRecord, RuleKind, Severity, Trend};
use crate::rules::{LookbackWindow, RuleContext};

/// Events at or above this probability count as fraud clicks.
pub const FRAUD_PROBABILITY_CUTOFF: f64 = 50.0;

pub fn cache_ttl() -> Duration {
    Duration::hours(1)
}

fn severity_probability(s: Severity) -> f64 {
    match s {
        Severity::High => 0.80,
        Severity::Medium => 0.50,
        Severity::Low => 0.25,
    }
}

/// Noisy-OR in percent.
pub fn fraud_probability(severities: impl IntoIterator<Item = Severity>) -> f64 {
    let clean: f64 = severities.into_iter().map(|s| 1.0 - severity_probability(s)).product();
    (1.0 - clean) * 100.0
}

/// Inverse of the average fraud probability, clamped.
pub fn index_from_probability(avg_probability: f64) -> u8 {
    (100.0 - avg_probability).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuietIndexReport {
    pub record: QuietIndexRecord,
    pub band: QuietBand,
    pub message: String,
    pub trend: Option<Trend>,
    pub previous_score: Option<u8>,
    pub cached: bool,
}

impl QuietIndexReport {
    fn new(record: QuietIndexRecord, previous: Option<&QuietIndexRecord>, cached: bool) -> Self {
        let band = QuietBand::from_score(record.score);
        Self {
            band,
            message: band.message().to_string(),
            trend: previous.map(|p| Trend::between(p.score, record.score)),
            previous_score: previous.map(|p| p.score),
            cached,
            record,
        }
    }
}

pub struct QuietIndexScorer {
    stores: Stores,
    config: std::sync::Arc<AppConfig>,
}

impl QuietIndexScorer {
    pub fn new(stores: Stores, config: std::sync::Arc<AppConfig>) -> Self {
        Self { stores, config }
    }

    /// Latest score for an account, recomputing if the stored one is stale.
    pub async fn score(&self, account_id: &str, window_hours: i64, now: DateTime<Utc>) -> DetectResult<QuietIndexReport> {
        let account = self
            .stores
            .registry
            .account(account_id)
            .await?
            .ok_or_else(|| DetectError::AccountNotFound(account_id.to_string()))?;

        let recent = self.stores.quiet_index.history(account_id, 2).await?;
        if let Some(latest) = recent.first() {
            if now - latest.computed_at < cache_ttl() {
                debug!(account = %account_id, score = latest.score, "Quiet Index served from cache");
                return Ok(QuietIndexReport::new(latest.clone(), recent.get(1), true));
            }
        }

        let record = self.compute(&account, window_hours, now).await?;
        self.stores.quiet_index.insert(record.clone()).await?;
        info!(account = %account_id, score = record.score, fraud = record.fraud_clicks, "Quiet Index computed");
        Ok(QuietIndexReport::new(record, recent.first(), false))
    }

    /// Score without storing.
    pub async fn compute(&self, account: &Account, window_hours: i64, now: DateTime<Utc>) -> DetectResult<QuietIndexRecord> {
        let scoring = LookbackWindow::ending_at(now, Duration::hours(window_hours.clamp(1, MAX_WINDOW_HOURS)));
        let max = self.config.max_lookback();
        let events = self
            .stores
            .events
            .events_between(&account.id, scoring.start - widest_lookback(max), now)
            .await?;
        let lo = events.partition_point(|e| e.timestamp < scoring.start);
        let scored = &events[lo..];

        let mut record = QuietIndexRecord {
            account_id: account.id.clone(),
            score: 100,
            total_clicks: scored.len() as u64,
            clean_clicks: scored.len() as u64,
            fraud_clicks: 0,
            rule_breakdown: BTreeMap::new(),
            window_start: scoring.start,
            window_end: scoring.end,
            computed_at: now,
        };
        if scored.is_empty() {
            return Ok(record);
        }

        let stored = self.stores.registry.detection_profile(&account.id).await?;
        let profile = ResolvedProfile::resolve(account, stored, &self.config.default_profile);
        let baseline = self.stores.baselines.active(&account.id).await?;
        let ctx = RuleContext {
            account,
            profile: &profile,
            baseline: baseline.as_ref(),
            events: &events,
            detections: self.stores.detections.as_ref(),
            cooldowns: None,
            now,
        };

        // per scored event: rule → strongest severity
        let mut flags: Vec<HashMap<RuleKind, Severity>> = vec![HashMap::new(); scored.len()];
        for rule in RuleKind::ALL {
            let overlap = sliding_width(rule, &profile);
            for window in slices(rule, scoring, max, overlap) {
                let candidates = match rule.detect(&ctx, window).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(account = %account.id, rule = %rule, "Rule failed while scoring: {}", e);
                        continue;
                    }
                };
                for candidate in &candidates {
                    for (i, event) in scored.iter().enumerate() {
                        if candidate.covers(event) {
                            let s = flags[i].entry(rule).or_insert(candidate.severity);
                            *s = (*s).max(candidate.severity);
                        }
                    }
                }
            }
        }

        let mut total_probability = 0.0;
        let mut fraud = 0u64;
        for f in &flags {
            let p = fraud_probability(f.values().copied());
            total_probability += p;
            if p >= FRAUD_PROBABILITY_CUTOFF {
                fraud += 1;
            }
            for rule in f.keys() {
                *record.rule_breakdown.entry(rule.id().to_string()).or_insert(0) += 1;
            }
        }

        record.score = index_from_probability(total_probability / scored.len() as f64);
        record.fraud_clicks = fraud;
        record.clean_clicks = record.total_clicks - fraud;
        Ok(record)
    }

    /// Latest stored record per account, worst score first. Accounts never
    /// scored are left out.
    pub async fn compare(&self, account_ids: &[String]) -> DetectResult<Vec<QuietIndexRecord>> {
        let mut out = Vec::new();
        for id in account_ids {
            if let Some(r) = self.stores.quiet_index.latest(id).await? {
                out.push(r);
            }
        }
        out.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.account_id.cmp(&b.account_id)));
        Ok(out)
    }

    /// Score every active account. Per-account failures are logged and skipped.
    pub async fn refresh_all(&self, now: DateTime<Utc>) -> DetectResult<Vec<QuietIndexReport>> {
        let accounts = self.stores.registry.active_accounts().await?;
        let mut reports = Vec::with_capacity(accounts.len());
        for account in accounts {
            match self.score(&account.id, self.config.quiet_index_window_hours, now).await {
                Ok(r) => reports.push(r),
                Err(e) => warn!(account = %account.id, "Quiet Index failed: {}", e),
            }
        }
        Ok(reports)
    }
}

/// Width of the sliding window a rule scans with. Zero for rules that take
/// their whole lookback as one window.
fn sliding_width(rule: RuleKind, profile: &ResolvedProfile) -> Duration {
    match rule {
        RuleKind::RapidRepeat
        | RuleKind::SustainedRepeat
        | RuleKind::MicroBurst
        | RuleKind::NightBurst
        | RuleKind::NetworkSwitch => profile.threshold(rule).window().max(Duration::zero()),
        _ => Duration::zero(),
    }
}

/// Consecutive rule windows, newest first, stepping back one lookback at a
/// time until the scoring window's start is covered. Each slice starts
/// `overlap` earlier than the previous slice's end.
fn slices(rule: RuleKind, scoring: LookbackWindow, max: Duration, overlap: Duration) -> Vec<LookbackWindow> {
    let span = rule.lookback().min(max);
    let mut out = Vec::new();
    let mut end = scoring.end;
    loop {
        let w = LookbackWindow::ending_at(end, span);
        out.push(LookbackWindow { start: w.start - overlap, end: w.end });
        if w.start <= scoring.start || span <= Duration::zero() {
            break;
        }
        end = w.start;
    }
    out
}
