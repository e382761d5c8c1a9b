//! Raw event types handed over by the ingestion layer.
//!
//! Clicks and conversions are append-only. Each carries a unique id so the
//! same feed can be re-ingested without double counting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};
use crate::experiment::{ExperimentTest, ExperimentVariant};
use crate::types::{ChannelId, ClickId, ConversionId, LinkId, Money};

/// A single click on a tracked link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub id: ClickId,
    pub link_id: LinkId,
    pub timestamp: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
    #[serde(default)]
    pub referrer_source: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// Set once when a conversion is matched to this click.
    #[serde(default)]
    pub converted: bool,
}

/// A commercial transaction attributed to a tracked link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: ConversionId,
    pub link_id: LinkId,
    pub channel_id: ChannelId,
    pub timestamp: DateTime<Utc>,
    pub sale_amount: Money,
    pub commission_amount: Money,
}

/// Payout state of a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    /// Recorded, awaiting approval
    Pending,
    /// Approved for payout
    Approved,
    /// Paid out
    Paid,
}

impl CommissionStatus {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Paid => "paid",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

/// Commission owed for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRecord {
    pub id: Uuid,
    pub conversion_id: ConversionId,
    pub link_id: LinkId,
    pub amount: Money,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}

impl CommissionRecord {
    /// Derive the pending commission for a conversion.
    #[must_use]
    pub fn for_conversion(conversion: &ConversionEvent) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversion_id: conversion.id.clone(),
            link_id: conversion.link_id.clone(),
            amount: conversion.commission_amount,
            status: CommissionStatus::Pending,
            created_at: conversion.timestamp,
        }
    }
}

/// One line of an ingestion feed.
///
/// Events and the metadata they refer to travel through the same feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestRecord {
    Click(ClickEvent),
    Conversion(ConversionEvent),
    Campaign(Campaign),
    Link(TrackedLink),
    ChannelBudget(ChannelBudget),
    Spend(SpendRecord),
    ExperimentTest(ExperimentTest),
    ExperimentVariant(ExperimentVariant),
}

impl IngestRecord {
    /// Short name of the record kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click(_) => "click",
            Self::Conversion(_) => "conversion",
            Self::Campaign(_) => "campaign",
            Self::Link(_) => "link",
            Self::ChannelBudget(_) => "channel_budget",
            Self::Spend(_) => "spend",
            Self::ExperimentTest(_) => "experiment_test",
            Self::ExperimentVariant(_) => "experiment_variant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_conversion() -> ConversionEvent {
        ConversionEvent {
            id: ConversionId::from("conv-1"),
            link_id: LinkId::from("link-1"),
            channel_id: ChannelId::from("search"),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap(),
            sale_amount: 80.0,
            commission_amount: 8.0,
        }
    }

    #[test]
    fn commission_status_parse_returns_correct_variants() {
        assert_eq!(
            CommissionStatus::parse("pending"),
            Some(CommissionStatus::Pending)
        );
        assert_eq!(
            CommissionStatus::parse("approved"),
            Some(CommissionStatus::Approved)
        );
        assert_eq!(CommissionStatus::parse("paid"), Some(CommissionStatus::Paid));
        assert_eq!(CommissionStatus::parse("refunded"), None);
        assert_eq!(CommissionStatus::Paid.as_str(), "paid");
    }

    #[test]
    fn commission_for_conversion_copies_amount_and_link() {
        let conversion = sample_conversion();
        let commission = CommissionRecord::for_conversion(&conversion);

        assert_eq!(commission.conversion_id, conversion.id);
        assert_eq!(commission.link_id, conversion.link_id);
        assert_eq!(commission.amount, 8.0);
        assert_eq!(commission.status, CommissionStatus::Pending);
    }

    #[test]
    fn ingest_record_parses_tagged_click_line() {
        let line = r#"{"type":"click","id":"c1","link_id":"l1","timestamp":"2025-01-01T00:00:00Z","ip_address":"10.0.0.1","user_agent":"Mozilla/5.0"}"#;
        let record: IngestRecord = serde_json::from_str(line).unwrap();

        match record {
            IngestRecord::Click(click) => {
                assert_eq!(click.id.as_str(), "c1");
                assert!(!click.converted);
                assert!(click.country.is_none());
            }
            other => panic!("expected click, got {}", other.kind()),
        }
    }

    #[test]
    fn ingest_record_parses_tagged_conversion_line() {
        let record = IngestRecord::Conversion(sample_conversion());
        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"type\":\"conversion\""));
        let parsed: IngestRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
