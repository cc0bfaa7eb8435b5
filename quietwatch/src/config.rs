// quietwatch/src/config.rs
//
// Detection profiles, preset thresholds and process configuration.
//
// Profile resolution (first hit wins):
//   1. profile stored for the account in the registry
//   2. platform-wide default profile from the config file
//   3. DetectionProfile::default() compiled in below
// Layers 2 and 3 take the account's onboarding preset when it has one.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DetectError;
use crate::events::{Account, RuleKind, Sensitivity};

pub const DEFAULT_COOLDOWN_HOURS: u32 = 12;

/// Upper bound for any configured or requested window, in hours (one year).
pub const MAX_WINDOW_HOURS: i64 = 24 * 366;

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Flat threshold tuple. Each rule reads only the fields it needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub count: u32,
    pub window_minutes: u32,
    pub multiplier: f64,
    pub percent: f64,
    pub score: f64,
}

impl Threshold {
    const ZERO: Threshold = Threshold {
        count: 0,
        window_minutes: 0,
        multiplier: 0.0,
        percent: 0.0,
        score: 0.0,
    };

    fn count(count: u32, window_minutes: u32) -> Self {
        Self { count, window_minutes, ..Self::ZERO }
    }

    fn multiplier(multiplier: f64) -> Self {
        Self { multiplier, ..Self::ZERO }
    }

    fn percent(percent: f64) -> Self {
        Self { percent, ..Self::ZERO }
    }

    fn score(score: f64) -> Self {
        Self { score, ..Self::ZERO }
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }
}

fn pick<T>(preset: Sensitivity, easy: T, normal: T, aggressive: T) -> T {
    match preset {
        Sensitivity::Easy => easy,
        Sensitivity::Normal => normal,
        Sensitivity::Aggressive => aggressive,
    }
}

/// Documented thresholds per rule and preset.
pub fn preset_threshold(rule: RuleKind, preset: Sensitivity) -> Threshold {
    match rule {
        RuleKind::RapidRepeat => Threshold::count(pick(preset, 4, 3, 2), 2),
        RuleKind::SustainedRepeat => Threshold::count(pick(preset, 8, 6, 4), 30),
        RuleKind::DailyRepeat => Threshold::count(pick(preset, 20, 15, 10), 24 * 60),
        RuleKind::AccountSpike => Threshold::multiplier(pick(preset, 2.5, 2.0, 1.5)),
        RuleKind::CampaignSpike => Threshold::multiplier(pick(preset, 2.8, 2.3, 2.0)),
        RuleKind::MicroBurst | RuleKind::NightBurst => Threshold::count(pick(preset, 12, 10, 6), 1),
        RuleKind::OffHours => Threshold::percent(pick(preset, 40.0, 30.0, 20.0)),
        RuleKind::NetworkSwitch => {
            Threshold::count(pick(preset, 3, 2, 2), pick(preset, 10, 10, 5))
        }
        RuleKind::MultiRuleConfirmation => Threshold::count(pick(preset, 3, 2, 2), 60),
        RuleKind::SuspiciousScore => Threshold::score(pick(preset, 90.0, 80.0, 70.0)),
    }
}

/// Partial threshold stored on a profile; unset fields fall back to the preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOverride {
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub window_minutes: Option<u32>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl ThresholdOverride {
    pub fn apply(&self, base: Threshold) -> Threshold {
        Threshold {
            count: self.count.unwrap_or(base.count),
            window_minutes: self.window_minutes.unwrap_or(base.window_minutes),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            percent: self.percent.unwrap_or(base.percent),
            score: self.score.unwrap_or(base.score),
        }
    }
}

// ── Business-hours calendar ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DayHours {
    fn open(start_hour: u32, end_hour: u32) -> Self {
        Self {
            enabled: true,
            start: NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end_hour, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    fn closed() -> Self {
        Self { enabled: false, ..Self::open(0, 0) }
    }

    /// Part of this day's shift that falls on this calendar date.
    fn contains(&self, t: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start
        }
    }

    /// Overnight shift (e.g. 22:00-06:00) running on into the next date.
    fn carries_into_next_day(&self, t: NaiveTime) -> bool {
        self.enabled && self.start > self.end && t < self.end
    }
}

/// Weekly calendar in the account's local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub enabled: bool,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Monday first.
    pub days: [DayHours; 7],
}

impl Default for BusinessHours {
    fn default() -> Self {
        let weekday = DayHours::open(9, 18);
        Self {
            enabled: true,
            utc_offset_minutes: 0,
            days: [
                weekday,
                weekday,
                weekday,
                weekday,
                weekday,
                DayHours::closed(),
                DayHours::closed(),
            ],
        }
    }
}

impl BusinessHours {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    pub fn is_within(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&self.offset());
        let idx = local.weekday().num_days_from_monday() as usize;
        let previous = &self.days[(idx + 6) % 7];
        self.days[idx].contains(local.time()) || previous.carries_into_next_day(local.time())
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.offset()).date_naive()
    }

    fn validate(&self) -> Result<(), DetectError> {
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(DetectError::InvalidConfig(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }
}

// ── Detection profile ─────────────────────────────────────────────────────────

fn default_cooldown_hours() -> u32 {
    DEFAULT_COOLDOWN_HOURS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionProfile {
    #[serde(default)]
    pub preset: Sensitivity,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u32,
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
    /// Keyed by rule id.
    #[serde(default)]
    pub overrides: BTreeMap<String, ThresholdOverride>,
}

impl Default for DetectionProfile {
    fn default() -> Self {
        Self {
            preset: Sensitivity::Normal,
            cooldown_hours: DEFAULT_COOLDOWN_HOURS,
            business_hours: Some(BusinessHours::default()),
            overrides: BTreeMap::new(),
        }
    }
}

impl DetectionProfile {
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.cooldown_hours == 0 {
            return Err(DetectError::InvalidConfig("cooldown_hours must be > 0".into()));
        }
        for (rule_id, o) in &self.overrides {
            rule_id.parse::<RuleKind>().map_err(DetectError::InvalidConfig)?;
            if o.count == Some(0) {
                return Err(DetectError::InvalidConfig(format!("{rule_id}: count must be >= 1")));
            }
            if o.window_minutes.is_some_and(|m| m as i64 > MAX_WINDOW_HOURS * 60) {
                return Err(DetectError::InvalidConfig(format!("{rule_id}: window_minutes too large")));
            }
        }
        if let Some(ref bh) = self.business_hours {
            bh.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    Account,
    PlatformDefault,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub profile: DetectionProfile,
    pub source: ProfileSource,
}

impl ResolvedProfile {
    pub fn resolve(
        account: &Account,
        stored: Option<DetectionProfile>,
        platform_default: &DetectionProfile,
    ) -> Self {
        match stored {
            Some(profile) => match profile.validate() {
                Ok(()) => Self { profile, source: ProfileSource::Account },
                Err(e) => {
                    warn!(account = %account.id, "Stored profile rejected, using platform default: {}", e);
                    Self::resolve(account, None, platform_default)
                }
            },
            None => {
                let mut profile = platform_default.clone();
                if let Some(preset) = account.sensitivity {
                    profile.preset = preset;
                }
                Self { profile, source: ProfileSource::PlatformDefault }
            }
        }
    }

    pub fn preset(&self) -> Sensitivity {
        self.profile.preset
    }

    pub fn threshold(&self, rule: RuleKind) -> Threshold {
        let base = preset_threshold(rule, self.profile.preset);
        match self.profile.overrides.get(rule.id()) {
            Some(o) => o.apply(base),
            None => base,
        }
    }

    pub fn cooldown_hours(&self) -> u32 {
        self.profile.cooldown_hours
    }

    /// Calendar explicitly configured for this account. The default
    /// calendar carried by the platform profile does not count.
    pub fn account_calendar(&self) -> Option<&BusinessHours> {
        if self.source != ProfileSource::Account {
            return None;
        }
        self.profile.business_hours.as_ref().filter(|bh| bh.enabled)
    }

    /// Offset used to interpret "local" hours (night windows, day keys).
    pub fn utc_offset(&self) -> FixedOffset {
        self.profile
            .business_hours
            .as_ref()
            .map(BusinessHours::offset)
            .unwrap_or_else(|| Utc.fix())
    }
}

// ── Process configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_profile: DetectionProfile,
    /// 1 keeps the strictly sequential account loop.
    pub max_parallel_accounts: usize,
    pub detection_interval_secs: u64,
    pub baseline_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    /// Upper bound on any rule's lookback; bounds the run time per account.
    pub max_lookback_hours: i64,
    pub quiet_index_window_hours: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_profile: DetectionProfile::default(),
            max_parallel_accounts: 1,
            detection_interval_secs: 3600,  // hourly
            baseline_interval_secs: 86_400, // daily
            purge_interval_secs: 300,
            checkpoint_interval_secs: 300,
            max_lookback_hours: 24,
            quiet_index_window_hours: 24,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                serde_json::from_str::<AppConfig>(&raw)
                    .with_context(|| format!("parsing config {}", p.display()))?
            }
            None => AppConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectError> {
        if self.max_parallel_accounts == 0 {
            return Err(DetectError::InvalidConfig("max_parallel_accounts must be >= 1".into()));
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.max_lookback_hours) {
            return Err(DetectError::InvalidConfig(format!(
                "max_lookback_hours must be in 1..={MAX_WINDOW_HOURS}"
            )));
        }
        if !(1..=MAX_WINDOW_HOURS).contains(&self.quiet_index_window_hours) {
            return Err(DetectError::InvalidConfig(format!(
                "quiet_index_window_hours must be in 1..={MAX_WINDOW_HOURS}"
            )));
        }
        self.default_profile.validate()
    }

    pub fn max_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_lookback_hours)
    }
}
