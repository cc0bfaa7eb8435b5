// quietwatch/src/rules/meta.rs
//
// Meta rules: correlation over detections already committed and still
// pending. Handled rows (resolved, dismissed, investigating) are never read,
// so a cluster an account holder already dealt with is not re-confirmed.
//
// Grouping key per detection, first hit wins:
//   evidence.fingerprint → campaign id → "unknown"
//
// Neither rule counts its own earlier output.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use super::{resolve_severity, CandidateScope, DetectionCandidate, LookbackWindow, RuleContext};
use crate::error::DetectResult;
use crate::events::{Detection, RuleKind, Severity};

pub const UNKNOWN_GROUP: &str = "unknown";

pub fn group_key(d: &Detection) -> String {
    d.evidence
        .get("fingerprint")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| d.campaign_id.clone())
        .or_else(|| d.evidence.get("campaign_id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_GROUP.to_string())
}

fn severity_weight(s: Severity) -> f64 {
    match s {
        Severity::High => 40.0,
        Severity::Medium => 25.0,
        Severity::Low => 15.0,
    }
}

fn rule_weight(rule_id: &str) -> f64 {
    match rule_id.parse::<RuleKind>() {
        Ok(RuleKind::RapidRepeat) => 40.0,
        Ok(RuleKind::SustainedRepeat) => 30.0,
        Ok(RuleKind::DailyRepeat) => 20.0,
        Ok(RuleKind::AccountSpike) | Ok(RuleKind::CampaignSpike) => 25.0,
        Ok(RuleKind::MicroBurst) => 35.0,
        Ok(RuleKind::NightBurst) => 45.0,
        Ok(RuleKind::OffHours) => 10.0,
        Ok(RuleKind::NetworkSwitch) => 30.0,
        Ok(RuleKind::MultiRuleConfirmation) => 50.0,
        Ok(RuleKind::SuspiciousScore) | Err(_) => 10.0,
    }
}

/// Sum of `(severity weight + rule weight) / 2`, capped at 100. Adding a
/// detection never lowers the score.
pub fn suspicion_score<'d>(detections: impl IntoIterator<Item = &'d Detection>) -> f64 {
    let sum: f64 = detections
        .into_iter()
        .map(|d| (severity_weight(d.severity) + rule_weight(&d.rule_id)) / 2.0)
        .sum();
    sum.clamp(0.0, 100.0)
}

/// Pending detections in the window, minus `exclude`'s own rows, grouped.
async fn pending_groups(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
    exclude: RuleKind,
) -> DetectResult<BTreeMap<String, Vec<Detection>>> {
    let pending = ctx
        .detections
        .pending_between(&ctx.account.id, window.start, window.end)
        .await?;
    let mut groups: BTreeMap<String, Vec<Detection>> = BTreeMap::new();
    for d in pending.into_iter().filter(|d| d.rule_id != exclude.id()) {
        groups.entry(group_key(&d)).or_default().push(d);
    }
    Ok(groups)
}

fn bounds(group: &[Detection], window: LookbackWindow) -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
    let start = group.iter().map(|d| d.window_start).min().unwrap_or(window.start);
    let end = group.iter().map(|d| d.window_end).max().unwrap_or(window.end);
    (start, end)
}

pub async fn multi_rule_confirmation(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::MultiRuleConfirmation;
    let threshold = ctx.threshold(rule).count.max(1) as usize;
    let groups = pending_groups(ctx, window, rule).await?;

    let mut out = Vec::new();
    for (key, group) in groups {
        // rule id → (count, highest severity)
        let mut by_rule: BTreeMap<&str, (u32, Severity)> = BTreeMap::new();
        for d in &group {
            let entry = by_rule.entry(d.rule_id.as_str()).or_insert((0, d.severity));
            entry.0 += 1;
            entry.1 = entry.1.max(d.severity);
        }
        if by_rule.len() < threshold {
            continue;
        }
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }

        let rules: Vec<Value> = by_rule
            .iter()
            .map(|(id, (count, severity))| json!({ "rule_id": id, "count": count, "severity": severity }))
            .collect();
        let (start, end) = bounds(&group, window);
        out.push(DetectionCandidate {
            rule,
            severity: resolve_severity(rule, None),
            window_start: start,
            window_end: end,
            campaign_id: group.iter().find_map(|d| d.campaign_id.clone()),
            evidence: json!({
                "fingerprint":    key,
                "distinct_rules": by_rule.len(),
                "threshold":      threshold,
                "rules":          rules,
                "detection_ids":  group.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            }),
            scope: CandidateScope::Group(key.clone()),
            cooldown_key: key,
        });
    }
    Ok(out)
}

pub async fn suspicious_score(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::SuspiciousScore;
    let threshold = ctx.threshold(rule).score;
    let groups = pending_groups(ctx, window, rule).await?;

    let mut out = Vec::new();
    for (key, group) in groups {
        let score = suspicion_score(&group);
        if score < threshold {
            continue;
        }
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }

        let contributing: Vec<Value> = group
            .iter()
            .map(|d| json!({ "rule_id": d.rule_id, "severity": d.severity, "detection_id": d.id }))
            .collect();
        let (start, end) = bounds(&group, window);
        out.push(DetectionCandidate {
            rule,
            severity: resolve_severity(rule, None),
            window_start: start,
            window_end: end,
            campaign_id: group.iter().find_map(|d| d.campaign_id.clone()),
            evidence: json!({
                "fingerprint":     key,
                "score":           score,
                "threshold":       threshold,
                "detection_count": group.len(),
                "contributing":    contributing,
            }),
            scope: CandidateScope::Group(key.clone()),
            cooldown_key: key,
        });
    }
    Ok(out)
}
