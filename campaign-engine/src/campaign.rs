//! Campaign metadata supplied by the ingestion layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CampaignId, ChannelId, LinkId, Money};

/// A campaign and its budget ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    /// Ceiling for the sum of recommended channel budgets.
    pub total_budget: Money,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl Campaign {
    /// Whole days since the flight started, floored at 1.
    #[must_use]
    pub fn days_elapsed(&self, now: DateTime<Utc>) -> u32 {
        let days = (now - self.starts_at).num_days();
        days.max(1).try_into().unwrap_or(u32::MAX)
    }

    /// Whole days until the flight ends, never negative.
    #[must_use]
    pub fn days_remaining(&self, now: DateTime<Utc>) -> u32 {
        let days = (self.ends_at - now).num_days();
        days.max(0).try_into().unwrap_or(u32::MAX)
    }
}

/// A tracked link, joining link-level events to a channel and campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedLink {
    pub id: LinkId,
    pub campaign_id: CampaignId,
    pub channel_id: ChannelId,
}

/// Current daily budget of a channel within a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelBudget {
    pub campaign_id: CampaignId,
    pub channel_id: ChannelId,
    pub daily_budget: Money,
}

/// Spend booked against a channel on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendRecord {
    pub campaign_id: CampaignId,
    pub channel_id: ChannelId,
    pub day: NaiveDate,
    pub amount: Money,
}
