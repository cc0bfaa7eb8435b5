// quietwatch/src/rules/diversity.rs
//
// Network switching: one device::country::campaign group seen on several
// distinct networks within a short window.

use serde_json::json;

use super::window::{first_diverse_run, group_chronologically};
use super::{resolve_severity, CandidateScope, DetectionCandidate, LookbackWindow, RuleContext};
use crate::error::DetectResult;
use crate::events::{ChannelGroup, RuleKind};

pub async fn network_switch(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::NetworkSwitch;
    let threshold = ctx.threshold(rule);
    let groups = group_chronologically(ctx.events_in(window), ChannelGroup::of);

    let mut out = Vec::new();
    for (group, events) in groups {
        if events.len() < threshold.count as usize {
            continue;
        }
        let key = group.canonical();
        if ctx.is_suppressed(rule, &key).await? {
            continue;
        }
        let items: Vec<_> = events.iter().map(|e| (e.timestamp, e.network.as_str())).collect();
        let Some(run) = first_diverse_run(&items, threshold.window(), threshold.count as usize) else {
            continue;
        };

        let hits = &events[run];
        // ordered sequence, repeats included
        let networks: Vec<&str> = hits.iter().map(|e| e.network.as_str()).collect();
        let mut distinct = networks.clone();
        distinct.sort_unstable();
        distinct.dedup();

        let first = hits[0];
        let last = hits[hits.len() - 1];
        out.push(DetectionCandidate {
            rule,
            severity: resolve_severity(rule, None),
            window_start: first.timestamp,
            window_end: last.timestamp,
            campaign_id: first.campaign_id.clone(),
            evidence: json!({
                "fingerprint":       key,
                "device":            group.device,
                "country":           group.country,
                "campaign":          group.campaign,
                "networks":          networks,
                "distinct_networks": distinct.len(),
                "clicks_count":      hits.len(),
                "threshold":         threshold.count,
                "window_minutes":    threshold.window_minutes,
            }),
            scope: CandidateScope::Channel(group),
            cooldown_key: key,
        });
    }
    Ok(out)
}
