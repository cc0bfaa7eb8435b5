// quietwatch/src/rules/frequency.rs
//
// Frequency rules: one source fingerprint clicking too often.
//
//   rapid_repeat      N clicks within 2 min      (sliding window)
//   sustained_repeat  N clicks within 30 min     (sliding window)
//   daily_repeat      N clicks over the 24 h lookback, taken as one window
//
// Fingerprint groups are visited in order of their first click. A group
// already under cooldown is skipped before its window is scanned.

use serde_json::json;

use super::window::{first_dense_run, group_chronologically};
use super::{resolve_severity, CandidateScope, DetectionCandidate, LookbackWindow, RuleContext};
use crate::error::DetectResult;
use crate::events::{ClickEvent, RuleKind, SourceFingerprint};

pub async fn repeat_in_window(
    rule: RuleKind,
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let threshold = ctx.threshold(rule);
    let groups = group_chronologically(ctx.events_in(window), SourceFingerprint::of);

    let mut out = Vec::new();
    for (fp, group) in groups {
        if group.len() < threshold.count as usize {
            continue;
        }
        let key = fp.canonical();
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }
        let times: Vec<_> = group.iter().map(|e| e.timestamp).collect();
        let Some(run) = first_dense_run(&times, threshold.window(), threshold.count as usize, |_| true)
        else {
            continue;
        };
        let hits = &group[run];
        out.push(candidate(rule, fp, key, hits, threshold.count, threshold.window_minutes));
    }
    Ok(out)
}

pub async fn repeat_over_lookback(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::DailyRepeat;
    let threshold = ctx.threshold(rule);
    let groups = group_chronologically(ctx.events_in(window), SourceFingerprint::of);

    let mut out = Vec::new();
    for (fp, group) in groups {
        if group.len() < threshold.count.max(1) as usize {
            continue;
        }
        let key = fp.canonical();
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }
        let minutes = (window.end - window.start).num_minutes() as u32;
        out.push(candidate(rule, fp, key, &group, threshold.count, minutes));
    }
    Ok(out)
}

fn candidate(
    rule: RuleKind,
    fp: SourceFingerprint,
    key: String,
    hits: &[&ClickEvent],
    threshold: u32,
    window_minutes: u32,
) -> DetectionCandidate {
    // hits is never empty: callers only pass runs that met a threshold >= 1
    let first = hits[0];
    let last = hits[hits.len() - 1];
    let evidence = json!({
        "fingerprint":    key,
        "device":         fp.device,
        "network":        fp.network,
        "country":        fp.country,
        "campaign":       fp.campaign,
        "clicks_count":   hits.len(),
        "threshold":      threshold,
        "window_minutes": window_minutes,
        "first_click":    first.timestamp,
        "last_click":     last.timestamp,
        "event_ids":      hits.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
    });
    DetectionCandidate {
        rule,
        severity: resolve_severity(rule, None),
        window_start: first.timestamp,
        window_end: last.timestamp,
        campaign_id: first.campaign_id.clone(),
        evidence,
        scope: CandidateScope::Source(fp),
        cooldown_key: key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use crate::testutil::{at, click, clicks, RuleHarness};
    use chrono::Duration;

    #[tokio::test]
    async fn four_clicks_in_ninety_seconds_fire_rapid_repeat_once() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let h = RuleHarness::new(now)
            .with_events(clicks("a", now - Duration::minutes(10), Duration::seconds(30), 4, "mobile"));

        let found = h.run(RuleKind::RapidRepeat).await;
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.evidence["clicks_count"], 4);
        assert_eq!(d.cooldown_key, "mobile::search::DE::c1");
        assert_eq!(d.window_end - d.window_start, Duration::seconds(90));
    }

    #[tokio::test]
    async fn suppressed_fingerprint_never_fires() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let h = RuleHarness::new(now)
            .with_events(clicks("a", now - Duration::minutes(10), Duration::seconds(1), 40, "mobile"));
        h.tracker
            .suppress("a", RuleKind::RapidRepeat, "mobile::search::DE::c1", 12, now - Duration::hours(1))
            .await
            .unwrap();
        assert!(h.run(RuleKind::RapidRepeat).await.is_empty());
        // dry runs ignore cooldowns
        assert_eq!(h.run_dry(RuleKind::RapidRepeat).await.len(), 1);
    }

    #[tokio::test]
    async fn spread_out_clicks_do_not_fire() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let h = RuleHarness::new(now)
            .with_events(clicks("a", now - Duration::minutes(50), Duration::minutes(5), 8, "mobile"));
        assert!(h.run(RuleKind::RapidRepeat).await.is_empty());
        // 8 clicks 5 min apart: at most 7 fall within 30 minutes, 6 needed
        assert_eq!(h.run(RuleKind::SustainedRepeat).await.len(), 1);
    }

    #[tokio::test]
    async fn each_fingerprint_fires_independently() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let mut events = clicks("a", now - Duration::minutes(20), Duration::seconds(10), 3, "mobile");
        events.extend(clicks("a", now - Duration::minutes(30), Duration::seconds(10), 3, "desktop"));
        events.push(click("a", now - Duration::minutes(5), "tablet"));
        let h = RuleHarness::new(now).with_events(events);

        let found = h.run(RuleKind::RapidRepeat).await;
        let keys: Vec<_> = found.iter().map(|c| c.cooldown_key.as_str()).collect();
        assert_eq!(keys, vec!["desktop::search::DE::c1", "mobile::search::DE::c1"]);
    }

    #[tokio::test]
    async fn daily_repeat_compares_whole_group() {
        let now = at(2024, 3, 6, 12, 0, 0);
        let h = RuleHarness::new(now)
            .with_events(clicks("a", now - Duration::hours(20), Duration::hours(1), 15, "mobile"));
        let found = h.run(RuleKind::DailyRepeat).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].evidence["clicks_count"], 15);
        assert_eq!(found[0].window_start, now - Duration::hours(20));
        assert_eq!(found[0].window_end, now - Duration::hours(6));
    }
}
