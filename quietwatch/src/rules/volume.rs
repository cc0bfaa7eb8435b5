// quietwatch/src/rules/volume.rs
//
// Volume rules.
//
// Spike rules compare the trailing hour against the active baseline. They
// never fire without a trusted baseline or while the account is still in
// learning mode. Burst rules ignore the baseline and look for an absolute
// click count inside a one-minute window, account-wide.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate, Timelike};
use serde_json::json;

use super::window::first_dense_run;
use super::{
    resolve_severity, round2, CandidateScope, DetectionCandidate, LookbackWindow, RuleContext,
};
use crate::error::DetectResult;
use crate::events::{BaselineSnapshot, RuleKind, Severity};

const ACCOUNT_KEY: &str = "account";

/// Night windows must start before this local hour.
const NIGHT_END_HOUR: u32 = 6;

fn trusted<'a>(ctx: &RuleContext<'a>) -> Option<&'a BaselineSnapshot> {
    if ctx.account.learning_mode {
        return None;
    }
    ctx.baseline.filter(|b| b.is_trusted())
}

fn trailing_hour(window: LookbackWindow) -> LookbackWindow {
    LookbackWindow::ending_at(window.end, Duration::hours(1))
}

fn spike_evidence(actual: usize, baseline: &BaselineSnapshot, multiplier: f64) -> serde_json::Value {
    json!({
        "actual_clicks":    actual,
        "baseline_mean":    baseline.mean_clicks_per_hour,
        "baseline_stddev":  baseline.stddev_clicks_per_hour,
        "baseline_version": baseline.version,
        "multiplier":       multiplier,
        "threshold":        round2(baseline.mean_clicks_per_hour * multiplier),
        "spike_ratio":      round2(actual as f64 / baseline.mean_clicks_per_hour),
    })
}

// ── Spikes ────────────────────────────────────────────────────────────────────

pub async fn account_spike(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::AccountSpike;
    let Some(baseline) = trusted(ctx) else {
        return Ok(Vec::new());
    };
    let multiplier = ctx.threshold(rule).multiplier;
    let hour = trailing_hour(window);
    let actual = ctx.events_in(hour).len();

    if (actual as f64) < baseline.mean_clicks_per_hour * multiplier {
        return Ok(Vec::new());
    }
    if ctx.is_suppressed(rule, ACCOUNT_KEY).await? {
        return Ok(Vec::new());
    }
    Ok(vec![DetectionCandidate {
        rule,
        severity: resolve_severity(rule, None),
        window_start: hour.start,
        window_end: hour.end,
        campaign_id: None,
        evidence: spike_evidence(actual, baseline, multiplier),
        scope: CandidateScope::Account,
        cooldown_key: ACCOUNT_KEY.to_string(),
    }])
}

/// Each campaign's trailing-hour count against the account baseline mean.
pub async fn campaign_spike(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::CampaignSpike;
    let Some(baseline) = trusted(ctx) else {
        return Ok(Vec::new());
    };
    let multiplier = ctx.threshold(rule).multiplier;
    let limit = baseline.mean_clicks_per_hour * multiplier;
    let hour = trailing_hour(window);

    let mut per_campaign: BTreeMap<&str, usize> = BTreeMap::new();
    for event in ctx.events_in(hour) {
        if let Some(ref c) = event.campaign_id {
            *per_campaign.entry(c.as_str()).or_insert(0) += 1;
        }
    }

    let mut out = Vec::new();
    for (campaign, actual) in per_campaign {
        if (actual as f64) < limit {
            continue;
        }
        let key = format!("campaign_{campaign}");
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }
        let mut evidence = spike_evidence(actual, baseline, multiplier);
        evidence["campaign_id"] = json!(campaign);
        out.push(DetectionCandidate {
            rule,
            severity: resolve_severity(rule, None),
            window_start: hour.start,
            window_end: hour.end,
            campaign_id: Some(campaign.to_string()),
            evidence,
            scope: CandidateScope::Campaign(campaign.to_string()),
            cooldown_key: key,
        });
    }
    Ok(out)
}

// ── Bursts ────────────────────────────────────────────────────────────────────

pub async fn micro_burst(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::MicroBurst;
    let threshold = ctx.threshold(rule);
    let events = ctx.events_in(window);
    if events.len() < threshold.count as usize {
        return Ok(Vec::new());
    }
    if ctx.is_suppressed(rule, ACCOUNT_KEY).await? {
        return Ok(Vec::new());
    }

    let times: Vec<_> = events.iter().map(|e| e.timestamp).collect();
    let Some(run) = first_dense_run(&times, threshold.window(), threshold.count as usize, |_| true)
    else {
        return Ok(Vec::new());
    };
    Ok(vec![burst_candidate(rule, None, &times[run], threshold.count, ACCOUNT_KEY.to_string())])
}

/// Micro-burst restricted to windows starting between 00:00 and 06:00 local
/// time, escalated to high. At most one detection per local calendar day.
pub async fn night_burst(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::NightBurst;
    let threshold = ctx.threshold(rule);
    let events = ctx.events_in(window);
    if events.len() < threshold.count as usize {
        return Ok(Vec::new());
    }

    let offset = ctx.profile.utc_offset();
    let times: Vec<_> = events.iter().map(|e| e.timestamp).collect();
    let local_date = |t: chrono::DateTime<chrono::Utc>| t.with_timezone(&offset).date_naive();
    let is_night = |t: chrono::DateTime<chrono::Utc>| t.with_timezone(&offset).hour() < NIGHT_END_HOUR;

    let mut done: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut out = Vec::new();
    loop {
        let run = first_dense_run(&times, threshold.window(), threshold.count as usize, |t| {
            is_night(t) && !done.contains(&local_date(t))
        });
        let Some(run) = run else { break };
        let date = local_date(times[run.start]);
        done.insert(date);

        let key = format!("night_{date}");
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }
        out.push(burst_candidate(rule, Some(Severity::High), &times[run], threshold.count, key));
    }
    Ok(out)
}

fn burst_candidate(
    rule: RuleKind,
    severity: Option<Severity>,
    times: &[chrono::DateTime<chrono::Utc>],
    threshold: u32,
    key: String,
) -> DetectionCandidate {
    let start = times[0];
    let end = times[times.len() - 1];
    DetectionCandidate {
        rule,
        severity: resolve_severity(rule, severity),
        window_start: start,
        window_end: end,
        campaign_id: None,
        evidence: json!({
            "clicks_count":   times.len(),
            "threshold":      threshold,
            "window_seconds": (end - start).num_seconds(),
            "burst_start":    start,
            "burst_end":      end,
            "escalated":      severity.is_some(),
        }),
        scope: CandidateScope::Account,
        cooldown_key: key,
    }
}
