//! Spend pacing against the ideal daily budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::Campaign;
use crate::types::Money;

/// Whether spend is tracking the ideal rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingStatus {
    OnTrack,
    Overspending,
    Underspending,
}

impl PacingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTrack => "on_track",
            Self::Overspending => "overspending",
            Self::Underspending => "underspending",
        }
    }

    /// Fixed advice for the status.
    #[must_use]
    pub fn recommendations(&self) -> &'static [&'static str] {
        match self {
            Self::OnTrack => &[
                "Maintain current bids and channel budgets",
                "Keep monitoring daily spend against the ideal pace",
            ],
            Self::Overspending => &[
                "Lower bids on the lowest-ROI channels",
                "Cap daily spend at the ideal daily budget",
                "Narrow targeting to cut low-intent traffic",
            ],
            Self::Underspending => &[
                "Raise bids on the highest-ROI channels",
                "Broaden targeting to reach more qualified traffic",
                "Add placements on channels with headroom",
            ],
        }
    }
}

/// Pacing of one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingReport {
    pub status: PacingStatus,
    /// Remaining budget spread over the remaining days.
    pub ideal_daily_budget: Money,
    /// Average spend per elapsed day.
    pub current_pace: Money,
    pub spent_so_far: Money,
    pub days_elapsed: u32,
    pub days_remaining: u32,
    pub recommendations: Vec<String>,
}

/// Classify spend pacing.
///
/// `days_elapsed` and `days_remaining` are floored at 1. A pace more than
/// `tolerance` above the ideal is overspending; more than `tolerance` below
/// is underspending.
#[must_use]
pub fn pace(
    total_budget: Money,
    days_remaining: u32,
    days_elapsed: u32,
    spent_so_far: Money,
    tolerance: f64,
) -> PacingReport {
    let days_elapsed = days_elapsed.max(1);
    let ideal_daily_budget = (total_budget - spent_so_far) / f64::from(days_remaining.max(1));
    let current_pace = spent_so_far / f64::from(days_elapsed);

    let status = if current_pace > ideal_daily_budget * (1.0 + tolerance) {
        PacingStatus::Overspending
    } else if current_pace < ideal_daily_budget * (1.0 - tolerance) {
        PacingStatus::Underspending
    } else {
        PacingStatus::OnTrack
    };

    PacingReport {
        status,
        ideal_daily_budget,
        current_pace,
        spent_so_far,
        days_elapsed,
        days_remaining,
        recommendations: status
            .recommendations()
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
    }
}

/// Pacing of a campaign at `now` with the given total spend.
#[must_use]
pub fn pace_campaign(
    campaign: &Campaign,
    total_budget: Money,
    spent_so_far: Money,
    now: DateTime<Utc>,
    tolerance: f64,
) -> PacingReport {
    pace(
        total_budget,
        campaign.days_remaining(now),
        campaign.days_elapsed(now),
        spent_so_far,
        tolerance,
    )
}
