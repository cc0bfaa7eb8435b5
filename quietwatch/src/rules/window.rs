// quietwatch/src/rules/window.rs
//
// Sliding-window scans over chronologically sorted events.
//
// Both scans sweep window starts from the oldest event forward and stop at
// the first window instance meeting the threshold (first match, not maximum
// match). A window instance starting at event i covers [t_i, t_i + width].
// Two pointers: the right edge never moves backwards, so each scan is O(n).

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Range;

use chrono::{DateTime, Duration, Utc};

use crate::events::ClickEvent;

/// First window holding at least `threshold` timestamps. Window starts for
/// which `admits_start` is false are skipped. Returns the index range of the
/// events inside that window.
pub fn first_dense_run(
    times: &[DateTime<Utc>],
    width: Duration,
    threshold: usize,
    admits_start: impl Fn(DateTime<Utc>) -> bool,
) -> Option<Range<usize>> {
    let threshold = threshold.max(1);
    let mut hi = 0;
    for lo in 0..times.len() {
        let edge = times[lo] + width;
        hi = hi.max(lo);
        while hi < times.len() && times[hi] <= edge {
            hi += 1;
        }
        if hi - lo >= threshold && admits_start(times[lo]) {
            return Some(lo..hi);
        }
    }
    None
}

/// First window in which at least `threshold` distinct keys appear.
pub fn first_diverse_run<K: Eq + Hash + Clone>(
    items: &[(DateTime<Utc>, K)],
    width: Duration,
    threshold: usize,
) -> Option<Range<usize>> {
    let threshold = threshold.max(1);
    let mut counts: HashMap<K, usize> = HashMap::new();
    let mut hi = 0;
    for lo in 0..items.len() {
        let edge = items[lo].0 + width;
        while hi < items.len() && items[hi].0 <= edge {
            *counts.entry(items[hi].1.clone()).or_insert(0) += 1;
            hi += 1;
        }
        if counts.len() >= threshold {
            return Some(lo..hi);
        }
        let key = &items[lo].1;
        if let Some(n) = counts.get_mut(key) {
            *n -= 1;
            if *n == 0 {
                counts.remove(key);
            }
        }
    }
    None
}

/// Group events by `key`, groups ordered by their first event's timestamp
/// (arrival order on ties). Events inside a group stay chronological.
pub fn group_chronologically<'e, K, F>(events: &'e [ClickEvent], key: F) -> Vec<(K, Vec<&'e ClickEvent>)>
where
    K: Eq + Hash + Clone,
    F: Fn(&ClickEvent) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<&ClickEvent>)> = Vec::new();
    for event in events {
        let k = key(event);
        match index.get(&k) {
            Some(&i) => groups[i].1.push(event),
            None => {
                index.insert(k.clone(), groups.len());
                groups.push((k, vec![event]));
            }
        }
    }
    groups
}
