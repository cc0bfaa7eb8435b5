// quietwatch/src/engine/metrics.rs
//
// Process-wide detection counters.
//
//   quietwatch_runs_total                    Counter: orchestrator runs
//   quietwatch_events_scanned_total          Counter: events prefetched for rules
//   quietwatch_candidates_total              Counter: candidates returned by rules
//   quietwatch_suppressed_total              Counter: cooldown hits
//   quietwatch_detections_total{severity}    Counter: detections stored
//   quietwatch_rule_failures_total           Counter: rule evaluations that errored
//   quietwatch_accounts_failed_total         Counter: accounts whose processing failed
//
// Rendered as Prometheus text into `<output>/metrics.prom` after each run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::events::Severity;

#[derive(Default)]
pub struct DetectionMetrics {
    pub runs: AtomicU64,
    pub events_scanned: AtomicU64,
    pub candidates: AtomicU64,
    pub suppressed: AtomicU64,
    pub detections_high: AtomicU64,
    pub detections_medium: AtomicU64,
    pub detections_low: AtomicU64,
    pub rule_failures: AtomicU64,
    pub accounts_failed: AtomicU64,
}

impl DetectionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_detection(&self, severity: Severity) {
        match severity {
            Severity::High => self.detections_high.fetch_add(1, Ordering::Relaxed),
            Severity::Medium => self.detections_medium.fetch_add(1, Ordering::Relaxed),
            Severity::Low => self.detections_low.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "runs":            self.runs.load(Ordering::Relaxed),
            "events_scanned":  self.events_scanned.load(Ordering::Relaxed),
            "candidates":      self.candidates.load(Ordering::Relaxed),
            "suppressed":      self.suppressed.load(Ordering::Relaxed),
            "detections": {
                "high":   self.detections_high.load(Ordering::Relaxed),
                "medium": self.detections_medium.load(Ordering::Relaxed),
                "low":    self.detections_low.load(Ordering::Relaxed),
            },
            "rule_failures":   self.rule_failures.load(Ordering::Relaxed),
            "accounts_failed": self.accounts_failed.load(Ordering::Relaxed),
        })
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(2048);

        macro_rules! counter {
            ($name:expr, $help:expr, $val:expr) => {
                out.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $name, $help, $name, $name, $val
                ));
            };
        }

        counter!("quietwatch_runs_total", "Orchestrator runs", self.runs.load(Ordering::Relaxed));
        counter!(
            "quietwatch_events_scanned_total",
            "Events prefetched for rule evaluation",
            self.events_scanned.load(Ordering::Relaxed)
        );
        counter!(
            "quietwatch_candidates_total",
            "Detection candidates returned by rules",
            self.candidates.load(Ordering::Relaxed)
        );
        counter!(
            "quietwatch_suppressed_total",
            "Cooldown hits",
            self.suppressed.load(Ordering::Relaxed)
        );

        out.push_str("# HELP quietwatch_detections_total Detections stored by severity\n");
        out.push_str("# TYPE quietwatch_detections_total counter\n");
        for (label, counter) in [
            ("high", &self.detections_high),
            ("medium", &self.detections_medium),
            ("low", &self.detections_low),
        ] {
            out.push_str(&format!(
                "quietwatch_detections_total{{severity=\"{}\"}} {}\n",
                label,
                counter.load(Ordering::Relaxed)
            ));
        }

        counter!(
            "quietwatch_rule_failures_total",
            "Rule evaluations that returned an error",
            self.rule_failures.load(Ordering::Relaxed)
        );
        counter!(
            "quietwatch_accounts_failed_total",
            "Accounts whose processing failed",
            self.accounts_failed.load(Ordering::Relaxed)
        );
        out
    }
}
