// quietwatch/src/events.rs
//
// Shared domain types flowing through quietwatch.
//
// Accounts and click events are owned by external collaborators (onboarding,
// ingestion) and are read-only here. Baselines, cooldowns and Quiet Index
// records are owned by the core. Detections are created by the core and may
// be mutated afterwards by account holders (status only).

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Accounts ──────────────────────────────────────────────────────────────────

/// Detection sensitivity preset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Easy,
    #[default]
    Normal,
    Aggressive,
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Normal => write!(f, "normal"),
            Self::Aggressive => write!(f, "aggressive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub owner_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Preset chosen at onboarding. Only consulted when no stored profile exists.
    #[serde(default)]
    pub sensitivity: Option<Sensitivity>,
    /// New accounts start in learning mode; the baseline job flips it off once.
    #[serde(default = "learning_by_default")]
    pub learning_mode: bool,
}

fn learning_by_default() -> bool {
    true
}

impl Account {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

// ── Click events ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClickEvent {
    pub id: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub network: String,
    pub country: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Click cost in micros of the account currency.
    #[serde(default)]
    pub cost_micros: Option<i64>,
}

impl ClickEvent {
    pub fn campaign_or_none(&self) -> &str {
        self.campaign_id.as_deref().unwrap_or(NO_CAMPAIGN)
    }
}

const NO_CAMPAIGN: &str = "none";

// ── Source fingerprints ───────────────────────────────────────────────────────
// Grouping keys approximating "the same actor". Kept as value types; the
// `::`-joined string form only exists at the storage/evidence boundary.

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub device: String,
    pub network: String,
    pub country: String,
    pub campaign: String,
}

impl SourceFingerprint {
    pub fn of(event: &ClickEvent) -> Self {
        Self {
            device: event.device.clone(),
            network: event.network.clone(),
            country: event.country.clone(),
            campaign: event.campaign_or_none().to_string(),
        }
    }

    pub fn matches(&self, event: &ClickEvent) -> bool {
        self.device == event.device
            && self.network == event.network
            && self.country == event.country
            && self.campaign == event.campaign_or_none()
    }

    pub fn canonical(&self) -> String {
        format!("{}::{}::{}::{}", self.device, self.network, self.country, self.campaign)
    }
}

impl std::fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Fingerprint with the network/channel attribute left out, so that one actor
/// hopping between networks still lands in a single group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub device: String,
    pub country: String,
    pub campaign: String,
}

impl ChannelGroup {
    pub fn of(event: &ClickEvent) -> Self {
        Self {
            device: event.device.clone(),
            country: event.country.clone(),
            campaign: event.campaign_or_none().to_string(),
        }
    }

    pub fn matches(&self, event: &ClickEvent) -> bool {
        self.device == event.device
            && self.country == event.country
            && self.campaign == event.campaign_or_none()
    }

    pub fn canonical(&self) -> String {
        format!("{}::{}::{}", self.device, self.country, self.campaign)
    }
}

impl std::fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

// ── Rule catalog ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    // Frequency: one source repeating
    RapidRepeat,
    SustainedRepeat,
    DailyRepeat,
    // Volume: relative to baseline, or absolute bursts
    AccountSpike,
    CampaignSpike,
    MicroBurst,
    NightBurst,
    // Temporal
    OffHours,
    // Diversity
    NetworkSwitch,
    // Meta: over already-committed detections
    MultiRuleConfirmation,
    SuspiciousScore,
}

impl RuleKind {
    /// Evaluation order. Meta rules run last so they see this run's
    /// committed detections from the raw-event rules.
    pub const ALL: [RuleKind; 11] = [
        RuleKind::RapidRepeat,
        RuleKind::SustainedRepeat,
        RuleKind::DailyRepeat,
        RuleKind::AccountSpike,
        RuleKind::CampaignSpike,
        RuleKind::MicroBurst,
        RuleKind::NightBurst,
        RuleKind::OffHours,
        RuleKind::NetworkSwitch,
        RuleKind::MultiRuleConfirmation,
        RuleKind::SuspiciousScore,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::RapidRepeat => "rapid_repeat",
            Self::SustainedRepeat => "sustained_repeat",
            Self::DailyRepeat => "daily_repeat",
            Self::AccountSpike => "account_spike",
            Self::CampaignSpike => "campaign_spike",
            Self::MicroBurst => "micro_burst",
            Self::NightBurst => "night_burst",
            Self::OffHours => "off_hours",
            Self::NetworkSwitch => "network_switch",
            Self::MultiRuleConfirmation => "multi_rule_confirmation",
            Self::SuspiciousScore => "suspicious_score",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RapidRepeat => "Rapid repeat clicks",
            Self::SustainedRepeat => "Sustained repeat clicks",
            Self::DailyRepeat => "Daily repeat clicks",
            Self::AccountSpike => "Account click spike",
            Self::CampaignSpike => "Campaign click spike",
            Self::MicroBurst => "Click micro-burst",
            Self::NightBurst => "Night-time click burst",
            Self::OffHours => "Off-hours click concentration",
            Self::NetworkSwitch => "Implausible network switching",
            Self::MultiRuleConfirmation => "Multi-rule confirmation",
            Self::SuspiciousScore => "Suspicious source score",
        }
    }

    /// Severity declared by the rule. Individual detections may override it.
    pub fn declared_severity(self) -> Option<Severity> {
        match self {
            Self::RapidRepeat | Self::NightBurst => Some(Severity::High),
            Self::MultiRuleConfirmation | Self::SuspiciousScore => Some(Severity::High),
            Self::OffHours => Some(Severity::Low),
            Self::SustainedRepeat
            | Self::DailyRepeat
            | Self::AccountSpike
            | Self::CampaignSpike
            | Self::MicroBurst
            | Self::NetworkSwitch => Some(Severity::Medium),
        }
    }

    /// How far back the rule looks on each scheduled run.
    pub fn lookback(self) -> Duration {
        match self {
            Self::SustainedRepeat => Duration::hours(2),
            Self::NightBurst => Duration::hours(6),
            Self::DailyRepeat | Self::OffHours => Duration::hours(24),
            _ => Duration::hours(1),
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleKind::ALL
            .into_iter()
            .find(|r| r.id() == s)
            .ok_or_else(|| format!("unknown rule id: {s}"))
    }
}

// ── Detections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    #[default]
    Pending,
    Resolved,
    Dismissed,
    Investigating,
}

/// Action attached to a detection. Blocking is decided downstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub id: String,
    pub account_id: String,
    /// Kept as a string: rows written by other producers may carry ids
    /// outside the current catalog.
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub evidence: serde_json::Value,
    #[serde(default)]
    pub action: ActionKind,
    #[serde(default)]
    pub status: DetectionStatus,
    pub created_at: DateTime<Utc>,
}

impl Detection {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Per-account aggregate counters maintained by the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountStats {
    pub account_id: String,
    pub total_detections: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_rule: BTreeMap<String, u64>,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

// ── Baselines ─────────────────────────────────────────────────────────────────

/// Spike rules ignore snapshots built from fewer events than this.
pub const MIN_TRUSTED_SAMPLE: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineSnapshot {
    pub account_id: String,
    pub version: u32,
    pub mean_clicks_per_hour: f64,
    pub stddev_clicks_per_hour: f64,
    pub mean_cpc_micros: Option<f64>,
    pub device_distribution: BTreeMap<String, f64>,
    pub network_distribution: BTreeMap<String, f64>,
    pub geo_distribution: BTreeMap<String, f64>,
    pub sample_size: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl BaselineSnapshot {
    pub fn is_trusted(&self) -> bool {
        self.sample_size >= MIN_TRUSTED_SAMPLE && self.mean_clicks_per_hour > 0.0
    }
}

// ── Cooldowns ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CooldownKey {
    pub account_id: String,
    pub rule_id: String,
    pub key: String,
}

impl CooldownKey {
    pub fn new(account_id: &str, rule: RuleKind, key: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            rule_id: rule.id().to_string(),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.account_id, self.rule_id, self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CooldownEntry {
    pub key: CooldownKey,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CooldownEntry {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

// ── Quiet Index ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuietIndexRecord {
    pub account_id: String,
    pub score: u8,
    pub total_clicks: u64,
    pub clean_clicks: u64,
    pub fraud_clicks: u64,
    pub rule_breakdown: BTreeMap<String, u64>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QuietBand {
    Excellent,
    Good,
    Warning,
    Poor,
    Critical,
}

impl QuietBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Excellent,
            60..=79 => Self::Good,
            40..=59 => Self::Warning,
            20..=39 => Self::Poor,
            _ => Self::Critical,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Excellent => "Traffic is clean. No action needed.",
            Self::Good => "Traffic is mostly clean. Keep monitoring the flagged sources.",
            Self::Warning => "Noticeable suspicious activity. Review pending detections.",
            Self::Poor => "Significant invalid traffic. Consider excluding the flagged sources.",
            Self::Critical => "Traffic is dominated by invalid clicks. Act on detections immediately.",
        }
    }
}

impl std::fmt::Display for QuietBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Warning => write!(f, "warning"),
            Self::Poor => write!(f, "poor"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn between(previous: u8, current: u8) -> Self {
        let delta = current as i16 - previous as i16;
        if delta > 5 {
            Self::Up
        } else if delta < -5 {
            Self::Down
        } else {
            Self::Stable
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

// ── Job execution log ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_name: String,
    pub status: JobStatus,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl JobRun {
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn click(device: &str, network: &str, campaign: Option<&str>) -> ClickEvent {
        ClickEvent {
            id: "c1".into(),
            account_id: "acc".into(),
            timestamp: Utc::now(),
            device: device.into(),
            network: network.into(),
            country: "DE".into(),
            campaign_id: campaign.map(str::to_string),
            cost_micros: None,
        }
    }

    #[test]
    fn fingerprint_canonical_form() {
        let fp = SourceFingerprint::of(&click("mobile", "search", Some("c-9")));
        assert_eq!(fp.canonical(), "mobile::search::DE::c-9");
        let no_campaign = SourceFingerprint::of(&click("mobile", "search", None));
        assert_eq!(no_campaign.canonical(), "mobile::search::DE::none");
    }

    #[test]
    fn channel_group_ignores_network() {
        let a = click("desktop", "search", Some("c"));
        let b = click("desktop", "display", Some("c"));
        assert_eq!(ChannelGroup::of(&a), ChannelGroup::of(&b));
        assert_ne!(SourceFingerprint::of(&a), SourceFingerprint::of(&b));
        assert_eq!(ChannelGroup::of(&a).canonical(), "desktop::DE::c");
    }

    #[test]
    fn rule_ids_round_trip_through_from_str() {
        for rule in RuleKind::ALL {
            assert_eq!(rule.id().parse::<RuleKind>(), Ok(rule));
        }
        assert!("not_a_rule".parse::<RuleKind>().is_err());
    }

    #[test]
    fn band_boundaries() {
        assert_eq!(QuietBand::from_score(100), QuietBand::Excellent);
        assert_eq!(QuietBand::from_score(80), QuietBand::Excellent);
        assert_eq!(QuietBand::from_score(79), QuietBand::Good);
        assert_eq!(QuietBand::from_score(40), QuietBand::Warning);
        assert_eq!(QuietBand::from_score(20), QuietBand::Poor);
        assert_eq!(QuietBand::from_score(19), QuietBand::Critical);
    }

    #[test]
    fn trend_uses_five_point_dead_band() {
        assert_eq!(Trend::between(50, 56), Trend::Up);
        assert_eq!(Trend::between(50, 55), Trend::Stable);
        assert_eq!(Trend::between(50, 44), Trend::Down);
        assert_eq!(Trend::between(50, 45), Trend::Stable);
    }
}
