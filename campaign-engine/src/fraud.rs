//! Click-fraud detection.
//!
//! Flags IP addresses with anomalous click volume and measures the share of
//! clicks coming from known bot user agents. Only IP volume produces alerts;
//! the bot rate is a metric.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FraudConfig;
use crate::events::ClickEvent;
use crate::types::{AlertId, CampaignId, Money};

/// How serious a fraud alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Volume at or above the click threshold
    High,
    /// Volume above the critical threshold
    Critical,
}

impl Severity {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// A suspicious traffic source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub id: AlertId,
    pub campaign_id: CampaignId,
    /// IP address (or user-agent fingerprint) the traffic came from.
    pub source_key: String,
    pub severity: Severity,
    pub click_count: u64,
    pub estimated_loss: Money,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Bot versus human click tally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotTraffic {
    pub bot_clicks: u64,
    pub human_clicks: u64,
    /// Bot share of all clicks as a percentage, 0 when there are no clicks.
    pub bot_rate_pct: f64,
}

/// Output of one detection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FraudReport {
    pub alerts: Vec<FraudAlert>,
    pub bot_traffic: BotTraffic,
    pub total_clicks: u64,
    pub unique_ips: u64,
}

/// Result of matching a detected alert against the open ones.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertUpsert {
    /// No open alert exists for the source.
    Insert(FraudAlert),
    /// An open alert exists; it keeps its id and creation time.
    Update(FraudAlert),
}

impl AlertUpsert {
    /// The alert to persist.
    pub fn alert(&self) -> &FraudAlert {
        match self {
            Self::Insert(alert) | Self::Update(alert) => alert,
        }
    }
}

/// Detects fraudulent traffic in a set of clicks.
#[derive(Debug, Clone)]
pub struct FraudDetector {
    click_threshold: u64,
    critical_threshold: u64,
    cost_per_click: Money,
    signatures: Vec<String>,
}

impl FraudDetector {
    pub fn new(config: &FraudConfig) -> Self {
        Self {
            click_threshold: config.click_threshold,
            critical_threshold: config.critical_threshold,
            cost_per_click: config.cost_per_click,
            signatures: config
                .bot_signatures
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Whether a user agent matches any bot signature (case-insensitive).
    pub fn is_bot(&self, user_agent: &str) -> bool {
        let ua = user_agent.to_lowercase();
        self.signatures.iter().any(|sig| ua.contains(sig.as_str()))
    }

    /// Severity for an IP with `clicks` clicks, or `None` below the threshold.
    pub fn severity_for(&self, clicks: u64) -> Option<Severity> {
        if clicks < self.click_threshold {
            None
        } else if clicks > self.critical_threshold {
            Some(Severity::Critical)
        } else {
            Some(Severity::High)
        }
    }

    /// Tally bot and human clicks.
    pub fn classify(&self, clicks: &[ClickEvent]) -> BotTraffic {
        let bot_clicks = clicks.iter().filter(|c| self.is_bot(&c.user_agent)).count() as u64;
        let total = clicks.len() as u64;
        let bot_rate_pct = if total == 0 {
            0.0
        } else {
            bot_clicks as f64 / total as f64 * 100.0
        };
        BotTraffic {
            bot_clicks,
            human_clicks: total - bot_clicks,
            bot_rate_pct,
        }
    }

    /// Run detection over the clicks of one campaign.
    ///
    /// Produces at most one alert per IP, ordered by click count descending
    /// (ties by IP). Alerts are fresh; use [`reconcile`] to match them against
    /// alerts already open for the campaign.
    pub fn detect(
        &self,
        campaign_id: &CampaignId,
        clicks: &[ClickEvent],
        now: DateTime<Utc>,
    ) -> FraudReport {
        let mut per_ip: BTreeMap<&str, u64> = BTreeMap::new();
        for click in clicks {
            *per_ip.entry(click.ip_address.as_str()).or_default() += 1;
        }

        let mut flagged: Vec<(&str, u64, Severity)> = per_ip
            .iter()
            .filter_map(|(ip, count)| self.severity_for(*count).map(|s| (*ip, *count, s)))
            .collect();
        flagged.sort_by(|a, b| b.1.cmp(&a.1));

        let alerts: Vec<FraudAlert> = flagged
            .into_iter()
            .map(|(ip, count, severity)| FraudAlert {
                id: AlertId::new(),
                campaign_id: campaign_id.clone(),
                source_key: ip.to_string(),
                severity,
                click_count: count,
                estimated_loss: count as f64 * self.cost_per_click,
                created_at: now,
                resolved: false,
            })
            .collect();

        let bot_traffic = self.classify(clicks);

        debug!(
            campaign_id = %campaign_id,
            clicks = clicks.len(),
            flagged = alerts.len(),
            bot_rate_pct = bot_traffic.bot_rate_pct,
            "fraud detection complete"
        );

        FraudReport {
            alerts,
            bot_traffic,
            total_clicks: clicks.len() as u64,
            unique_ips: per_ip.len() as u64,
        }
    }
}

/// Match freshly detected alerts against the campaign's open alerts.
///
/// A detected alert for a source that already has an open alert keeps that
/// alert's id and creation time and carries the new volume, loss and severity.
/// Resolved alerts never match, so a source that reappears opens a new alert.
pub fn reconcile(existing: &[FraudAlert], detected: Vec<FraudAlert>) -> Vec<AlertUpsert> {
    let open: HashMap<(&CampaignId, &str), &FraudAlert> = existing
        .iter()
        .filter(|a| !a.resolved)
        .map(|a| ((&a.campaign_id, a.source_key.as_str()), a))
        .collect();

    detected
        .into_iter()
        .map(|alert| {
            let current = open
                .get(&(&alert.campaign_id, alert.source_key.as_str()))
                .copied();
            match current {
                Some(current) => AlertUpsert::Update(FraudAlert {
                    id: current.id,
                    created_at: current.created_at,
                    ..alert
                }),
                None => AlertUpsert::Insert(alert),
            }
        })
        .collect()
}
