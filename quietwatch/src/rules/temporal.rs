// quietwatch/src/rules/temporal.rs
//
// Off-hours concentration. Only runs for accounts that configured their own
// business-hours calendar; the platform default calendar is not used.

use serde_json::json;

use super::{resolve_severity, round2, CandidateScope, DetectionCandidate, LookbackWindow, RuleContext};
use crate::error::DetectResult;
use crate::events::{RuleKind, Severity};

/// Smaller samples make the percentage meaningless.
pub const MIN_OFF_HOURS_EVENTS: usize = 5;

/// Above this share the detection escalates from low to medium.
const ESCALATE_PERCENT: f64 = 50.0;

/// Share of events outside business hours, in [0, 100]. 0 for no events.
pub fn off_hours_percentage(outside: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (outside.min(total) as f64 / total as f64) * 100.0
}

pub async fn off_hours(
    ctx: &RuleContext<'_>,
    window: LookbackWindow,
) -> DetectResult<Vec<DetectionCandidate>> {
    let rule = RuleKind::OffHours;
    let Some(calendar) = ctx.profile.account_calendar() else {
        return Ok(Vec::new());
    };
    let events = ctx.events_in(window);
    if events.len() < MIN_OFF_HOURS_EVENTS {
        return Ok(Vec::new());
    }

    let outside = events.iter().filter(|e| !calendar.is_within(e.timestamp)).count();
    let pct = off_hours_percentage(outside, events.len());
    let threshold = ctx.threshold(rule).percent;
    if pct < threshold {
        return Ok(Vec::new());
    }

    let key = format!("offhours_{}", calendar.local_date(window.end));
    if ctx.is_suppressed(rule, &key).await? {
        return Ok(Vec::new());
    }

    let severity = if pct > ESCALATE_PERCENT { Severity::Medium } else { Severity::Low };
    Ok(vec![DetectionCandidate {
        rule,
        severity: resolve_severity(rule, Some(severity)),
        window_start: window.start,
        window_end: window.end,
        campaign_id: None,
        evidence: json!({
            "total_clicks":         events.len(),
            "off_hours_clicks":     outside,
            "off_hours_percentage": round2(pct),
            "threshold_percent":    threshold,
            "utc_offset_minutes":   calendar.utc_offset_minutes,
        }),
        scope: CandidateScope::OffHours(calendar.clone()),
        cooldown_key: key,
    }])
}
