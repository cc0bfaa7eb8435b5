// quietwatch/src/rules/mod.rs
//
// Rule evaluation framework.
//
// Every rule in the catalog is a variant of the closed `RuleKind` enum and is
// dispatched through `RuleKind::detect`. A rule reads from a `RuleContext`
// (account, resolved profile, baseline, prefetched events, pending
// detections, cooldowns) and returns candidates. It never writes: the
// orchestrator inserts each candidate and only then applies its cooldown
// claim, so a failed insert never leaves a dangling suppression.
//
// Families:
//   frequency : one source fingerprint repeating (rapid/sustained/daily)
//   volume    : baseline spikes and absolute bursts
//   temporal  : off-hours concentration
//   diversity : one device hopping between networks
//   meta      : correlation over already-committed pending detections

pub mod diversity;
pub mod frequency;
pub mod meta;
pub mod temporal;
pub mod volume;
pub mod window;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{BusinessHours, ResolvedProfile, Threshold};
use crate::engine::cooldown::CooldownTracker;
use crate::error::DetectResult;
use crate::events::{
    Account, ActionKind, BaselineSnapshot, ChannelGroup, ClickEvent, Detection, DetectionStatus,
    RuleKind, Severity, SourceFingerprint,
};
use crate::state::DetectionStore;

// ── Evaluation context ────────────────────────────────────────────────────────

/// Inclusive time range a rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LookbackWindow {
    pub fn ending_at(end: DateTime<Utc>, span: Duration) -> Self {
        Self { start: end - span, end }
    }

    /// The rule's documented lookback, capped at `max`.
    pub fn for_rule(rule: RuleKind, end: DateTime<Utc>, max: Duration) -> Self {
        Self::ending_at(end, rule.lookback().min(max))
    }
}

pub struct RuleContext<'a> {
    pub account: &'a Account,
    pub profile: &'a ResolvedProfile,
    /// Active snapshot, trusted or not. Spike rules check trust themselves.
    pub baseline: Option<&'a BaselineSnapshot>,
    /// Chronological events covering the widest window any rule will ask for.
    pub events: &'a [ClickEvent],
    pub detections: &'a dyn DetectionStore,
    /// `None` in dry-run mode.
    pub cooldowns: Option<&'a CooldownTracker>,
    pub now: DateTime<Utc>,
}

impl<'a> RuleContext<'a> {
    pub fn events_in(&self, window: LookbackWindow) -> &'a [ClickEvent] {
        let lo = self.events.partition_point(|e| e.timestamp < window.start);
        let hi = self.events.partition_point(|e| e.timestamp <= window.end);
        &self.events[lo..hi.max(lo)]
    }

    pub fn threshold(&self, rule: RuleKind) -> Threshold {
        self.profile.threshold(rule)
    }

    pub async fn is_suppressed(&self, rule: RuleKind, key: &str) -> DetectResult<bool> {
        match self.cooldowns {
            Some(tracker) => Ok(tracker.is_suppressed(&self.account.id, rule, key, self.now).await?),
            None => Ok(false),
        }
    }
}

// ── Candidates ────────────────────────────────────────────────────────────────

/// Which events a candidate speaks about, within its window bounds.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateScope {
    Source(SourceFingerprint),
    Channel(ChannelGroup),
    Campaign(String),
    Account,
    /// Events falling outside the calendar.
    OffHours(BusinessHours),
    /// Meta-rule group key: a fingerprint, channel group or campaign id.
    Group(String),
}

impl CandidateScope {
    pub fn covers(&self, event: &ClickEvent) -> bool {
        match self {
            Self::Source(fp) => fp.matches(event),
            Self::Channel(group) => group.matches(event),
            Self::Campaign(id) => event.campaign_id.as_deref() == Some(id.as_str()),
            Self::Account => true,
            Self::OffHours(calendar) => !calendar.is_within(event.timestamp),
            Self::Group(key) => {
                event.campaign_id.as_deref() == Some(key.as_str())
                    || SourceFingerprint::of(event).canonical() == *key
                    || ChannelGroup::of(event).canonical() == *key
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionCandidate {
    pub rule: RuleKind,
    pub severity: Severity,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub campaign_id: Option<String>,
    pub evidence: Value,
    pub scope: CandidateScope,
    /// Key the cooldown claim is written under once the detection is stored.
    pub cooldown_key: String,
}

impl DetectionCandidate {
    pub fn covers(&self, event: &ClickEvent) -> bool {
        event.timestamp >= self.window_start
            && event.timestamp <= self.window_end
            && self.scope.covers(event)
    }

    pub fn into_detection(self, account_id: &str, created_at: DateTime<Utc>) -> Detection {
        let mut h = Sha256::new();
        h.update(account_id.as_bytes());
        h.update(self.rule.id().as_bytes());
        h.update(self.cooldown_key.as_bytes());
        h.update(self.window_start.to_rfc3339().as_bytes());
        h.update(created_at.to_rfc3339().as_bytes());
        Detection {
            id: hex::encode(&h.finalize()[..16]),
            account_id: account_id.to_string(),
            rule_id: self.rule.id().to_string(),
            rule_name: self.rule.name().to_string(),
            severity: self.severity,
            window_start: self.window_start,
            window_end: self.window_end,
            campaign_id: self.campaign_id,
            evidence: self.evidence,
            action: ActionKind::Report,
            status: DetectionStatus::Pending,
            created_at,
        }
    }
}

/// Detection-level override, else the rule's declared severity, else medium.
pub fn resolve_severity(rule: RuleKind, overridden: Option<Severity>) -> Severity {
    overridden.or_else(|| rule.declared_severity()).unwrap_or(Severity::Medium)
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

impl RuleKind {
    pub async fn detect(
        self,
        ctx: &RuleContext<'_>,
        window: LookbackWindow,
    ) -> DetectResult<Vec<DetectionCandidate>> {
        match self {
            RuleKind::RapidRepeat | RuleKind::SustainedRepeat => {
                frequency::repeat_in_window(self, ctx, window).await
            }
            RuleKind::DailyRepeat => frequency::repeat_over_lookback(ctx, window).await,
            RuleKind::AccountSpike => volume::account_spike(ctx, window).await,
            RuleKind::CampaignSpike => volume::campaign_spike(ctx, window).await,
            RuleKind::MicroBurst => volume::micro_burst(ctx, window).await,
            RuleKind::NightBurst => volume::night_burst(ctx, window).await,
            RuleKind::OffHours => temporal::off_hours(ctx, window).await,
            RuleKind::NetworkSwitch => diversity::network_switch(ctx, window).await,
            RuleKind::MultiRuleConfirmation => meta::multi_rule_confirmation(ctx, window).await,
            RuleKind::SuspiciousScore => meta::suspicious_score(ctx, window).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, click, click_on};

    #[test]
    fn severity_falls_back_in_order() {
        assert_eq!(resolve_severity(RuleKind::OffHours, Some(Severity::Medium)), Severity::Medium);
        assert_eq!(resolve_severity(RuleKind::OffHours, None), Severity::Low);
        assert_eq!(resolve_severity(RuleKind::RapidRepeat, None), Severity::High);
    }

    #[test]
    fn window_is_capped_by_max_lookback() {
        let end = at(2024, 3, 1, 12, 0, 0);
        let w = LookbackWindow::for_rule(RuleKind::DailyRepeat, end, Duration::hours(6));
        assert_eq!(w.start, end - Duration::hours(6));
        let w = LookbackWindow::for_rule(RuleKind::RapidRepeat, end, Duration::hours(6));
        assert_eq!(w.start, end - Duration::hours(1));
        assert_eq!(w.end, end);
    }

    #[test]
    fn group_scope_matches_fingerprints_and_campaigns() {
        let ev = click_on("a", at(2024, 3, 1, 12, 0, 0), "mobile", "search", Some("c7"));
        assert!(CandidateScope::Group("c7".into()).covers(&ev));
        assert!(CandidateScope::Group("mobile::search::DE::c7".into()).covers(&ev));
        assert!(CandidateScope::Group("mobile::DE::c7".into()).covers(&ev));
        assert!(!CandidateScope::Group("unknown".into()).covers(&ev));
    }

    #[test]
    fn detection_ids_are_deterministic() {
        let now = at(2024, 3, 1, 12, 0, 0);
        let ev = click("a", now, "mobile");
        let candidate = DetectionCandidate {
            rule: RuleKind::RapidRepeat,
            severity: Severity::High,
            window_start: now,
            window_end: now,
            campaign_id: None,
            evidence: Value::Null,
            scope: CandidateScope::Source(SourceFingerprint::of(&ev)),
            cooldown_key: "k".into(),
        };
        let a = candidate.clone().into_detection("a", now);
        let b = candidate.into_detection("a", now);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert_eq!(a.status, DetectionStatus::Pending);
    }
}
