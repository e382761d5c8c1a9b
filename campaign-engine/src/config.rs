//! Engine configuration.
//!
//! Provides thresholds for every component plus the scheduler settings.
//! All sections default to the reference values, so an empty TOML document
//! is a valid configuration. Per-campaign override tables replace only the
//! fields they set.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attribution::AttributionModel;
use crate::error::{EngineError, Result};
use crate::experiment::ConfidenceMethod;
use crate::types::{CampaignId, Money};

/// Default bot signatures matched against user-agent strings.
pub const DEFAULT_BOT_SIGNATURES: [&str; 4] = ["bot", "crawler", "spider", "scraper"];

/// Main configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fraud: FraudConfig,
    pub attribution: AttributionConfig,
    pub budget: BudgetConfig,
    pub experiment: ExperimentConfig,
    pub insights: InsightConfig,
    pub scheduler: SchedulerConfig,
    /// Per-campaign overrides keyed by campaign id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub campaigns: BTreeMap<String, CampaignOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fraud: FraudConfig::default(),
            attribution: AttributionConfig::default(),
            budget: BudgetConfig::default(),
            experiment: ExperimentConfig::default(),
            insights: InsightConfig::default(),
            scheduler: SchedulerConfig::default(),
            campaigns: BTreeMap::new(),
        }
    }
}

/// Fraud detection thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    /// Clicks from one IP at or above this count are flagged.
    pub click_threshold: u64,
    /// Clicks above this count make the alert critical.
    pub critical_threshold: u64,
    /// Assumed cost of one click, used for the loss estimate.
    pub cost_per_click: Money,
    /// Case-insensitive substrings identifying bot user agents.
    pub bot_signatures: Vec<String>,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            click_threshold: 50,
            critical_threshold: 100,
            cost_per_click: 0.50,
            bot_signatures: DEFAULT_BOT_SIGNATURES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

/// Attribution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Model reported in the cycle summary.
    pub model: AttributionModel,
    /// How far back a conversion may look for its click, in hours.
    pub window_hours: u32,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            model: AttributionModel::TimeDecay,
            window_hours: 24 * 30,
        }
    }
}

/// Budget optimizer and pacing thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Channels with ROI above this are scaled.
    pub scale_roi_threshold: f64,
    /// Multiplier applied to a scaled channel's daily budget.
    pub scale_factor: f64,
    /// Spend above which a losing channel can be paused.
    pub pause_min_spend: Money,
    /// Channels with ROI below this (and enough spend) are paused.
    pub pause_roi_threshold: f64,
    /// Relative band around the ideal daily budget counted as on track.
    pub pacing_tolerance: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            scale_roi_threshold: 0.20,
            scale_factor: 1.5,
            pause_min_spend: 50.0,
            pause_roi_threshold: -0.50,
            pacing_tolerance: 0.20,
        }
    }
}

/// Experiment evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Confidence percentage a variant must exceed to win.
    pub confidence_threshold: f64,
    /// How a z-score becomes a confidence percentage.
    pub confidence_method: ConfidenceMethod,
    /// Stop tests automatically once they have a winner.
    pub auto_complete_on_winner: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 90.0,
            confidence_method: ConfidenceMethod::NormalCdf,
            auto_complete_on_winner: false,
        }
    }
}

/// Insight ranking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    /// Maximum number of insights returned.
    pub max_insights: usize,
    /// Bot-rate percentage above which traffic review is suggested.
    pub bot_rate_alert_pct: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            max_insights: 5,
            bot_rate_alert_pct: 10.0,
        }
    }
}

/// Scheduler and store-access settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between cycles for each campaign.
    pub poll_interval_secs: u64,
    /// Upper bound for a single store call, in milliseconds.
    pub store_timeout_ms: u64,
    /// Attempts for snapshot reads before the cycle is degraded.
    pub retry_attempts: u32,
    /// First backoff delay, doubled on each retry, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Days of events each cycle recomputes.
    pub lookback_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            store_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_base_delay_ms: 200,
            lookback_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Campaign-specific overrides (optional fields for merging).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignOverride {
    /// Replaces the stored campaign budget ceiling.
    pub total_budget: Option<Money>,
    pub click_threshold: Option<u64>,
    pub cost_per_click: Option<Money>,
    pub bot_signatures: Option<Vec<String>>,
    pub scale_roi_threshold: Option<f64>,
    pub scale_factor: Option<f64>,
    pub pause_min_spend: Option<Money>,
    pub pause_roi_threshold: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub poll_interval_secs: Option<u64>,
}

impl EngineConfig {
    /// Parse configuration from TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Override entry for a campaign, if any.
    pub fn override_for(&self, campaign_id: &CampaignId) -> Option<&CampaignOverride> {
        self.campaigns.get(campaign_id.as_str())
    }

    /// Effective configuration for one campaign with its overrides applied.
    #[must_use]
    pub fn for_campaign(&self, campaign_id: &CampaignId) -> Self {
        let mut config = self.clone();
        config.campaigns.clear();

        let Some(o) = self.override_for(campaign_id) else {
            return config;
        };

        if let Some(v) = o.click_threshold {
            config.fraud.click_threshold = v;
        }
        if let Some(v) = o.cost_per_click {
            config.fraud.cost_per_click = v;
        }
        if let Some(v) = &o.bot_signatures {
            config.fraud.bot_signatures = v.clone();
        }
        if let Some(v) = o.scale_roi_threshold {
            config.budget.scale_roi_threshold = v;
        }
        if let Some(v) = o.scale_factor {
            config.budget.scale_factor = v;
        }
        if let Some(v) = o.pause_min_spend {
            config.budget.pause_min_spend = v;
        }
        if let Some(v) = o.pause_roi_threshold {
            config.budget.pause_roi_threshold = v;
        }
        if let Some(v) = o.confidence_threshold {
            config.experiment.confidence_threshold = v;
        }
        if let Some(v) = o.poll_interval_secs {
            config.scheduler.poll_interval_secs = v;
        }
        config
    }

    /// Reject values no cycle can run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(EngineError::Configuration(msg.to_string()));

        if self.fraud.click_threshold == 0 {
            return invalid("fraud.click_threshold must be at least 1");
        }
        if self.fraud.critical_threshold < self.fraud.click_threshold {
            return invalid("fraud.critical_threshold must not be below click_threshold");
        }
        if !(self.fraud.cost_per_click >= 0.0) {
            return invalid("fraud.cost_per_click must be non-negative");
        }
        if self.fraud.bot_signatures.iter().all(|s| s.trim().is_empty()) {
            return invalid("fraud.bot_signatures must contain at least one signature");
        }
        if !(self.budget.scale_factor >= 1.0) {
            return invalid("budget.scale_factor must be at least 1.0");
        }
        if !(self.budget.pause_min_spend >= 0.0) {
            return invalid("budget.pause_min_spend must be non-negative");
        }
        if !(self.budget.pacing_tolerance > 0.0 && self.budget.pacing_tolerance < 1.0) {
            return invalid("budget.pacing_tolerance must be between 0 and 1");
        }
        if !(self.experiment.confidence_threshold > 0.0
            && self.experiment.confidence_threshold < 100.0)
        {
            return invalid("experiment.confidence_threshold must be between 0 and 100");
        }
        if self.insights.max_insights == 0 {
            return invalid("insights.max_insights must be at least 1");
        }
        if self.scheduler.poll_interval_secs == 0 {
            return invalid("scheduler.poll_interval_secs must be at least 1");
        }
        if self.scheduler.store_timeout_ms == 0 {
            return invalid("scheduler.store_timeout_ms must be at least 1");
        }
        if self.scheduler.lookback_days == 0 {
            return invalid("scheduler.lookback_days must be at least 1");
        }
        for (campaign, o) in &self.campaigns {
            if let Some(budget) = o.total_budget
                && !(budget > 0.0)
            {
                return Err(EngineError::Configuration(format!(
                    "campaigns.{campaign}.total_budget must be positive"
                )));
            }
        }
        Ok(())
    }
}
