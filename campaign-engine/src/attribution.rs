//! Conversion credit across channels.
//!
//! Every model is a fixed weighting of a channel's click share and revenue
//! share. Each channel is weighted independently, so a model's credit shares
//! need not sum to one; call [`renormalize`] when a strict partition is needed.

use serde::{Deserialize, Serialize};

use crate::aggregator::{ChannelAggregate, rollup};
use crate::types::ChannelId;

/// Rule for splitting conversion credit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstTouch,
    LastTouch,
    Linear,
    #[default]
    TimeDecay,
    PositionBased,
}

impl AttributionModel {
    /// Every model, in reporting order.
    pub const ALL: [Self; 5] = [
        Self::FirstTouch,
        Self::LastTouch,
        Self::Linear,
        Self::TimeDecay,
        Self::PositionBased,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstTouch => "first_touch",
            Self::LastTouch => "last_touch",
            Self::Linear => "linear",
            Self::TimeDecay => "time_decay",
            Self::PositionBased => "position_based",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_touch" => Some(Self::FirstTouch),
            "last_touch" => Some(Self::LastTouch),
            "linear" => Some(Self::Linear),
            "time_decay" => Some(Self::TimeDecay),
            "position_based" => Some(Self::PositionBased),
            _ => None,
        }
    }

    /// Credit for a channel with the given click and revenue shares.
    #[must_use]
    pub fn weight(&self, click_share: f64, revenue_share: f64) -> f64 {
        match self {
            Self::Linear => click_share,
            Self::LastTouch => revenue_share,
            Self::FirstTouch => 0.4 * click_share + 0.6 * revenue_share,
            Self::TimeDecay => 0.3 * click_share + 0.7 * revenue_share,
            Self::PositionBased => (click_share + revenue_share) / 2.0,
        }
    }
}

impl std::fmt::Display for AttributionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credit assigned to one channel under one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionResult {
    pub channel_id: ChannelId,
    pub model: AttributionModel,
    pub credit_share: f64,
}

/// Results of one model over a set of channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub model: AttributionModel,
    pub results: Vec<AttributionResult>,
    /// Suggested model when the data cannot support attribution.
    pub recommended_model: Option<AttributionModel>,
    /// Zero total clicks or zero total revenue.
    pub insufficient_data: bool,
}

/// Attribute credit across channels under `model`.
///
/// Rows are rolled up per channel first. With zero total clicks or zero
/// total revenue every share is zero and `time_decay` is recommended.
pub fn attribute(channel_stats: &[ChannelAggregate], model: AttributionModel) -> AttributionReport {
    let totals = rollup(channel_stats);
    let total_clicks: u64 = totals.iter().map(|t| t.clicks).sum();
    let total_revenue: f64 = totals.iter().map(|t| t.revenue).sum();
    let insufficient_data = total_clicks == 0 || total_revenue <= 0.0;

    let results = totals
        .into_iter()
        .map(|t| {
            let credit_share = if insufficient_data {
                0.0
            } else {
                let click_share = t.clicks as f64 / total_clicks as f64;
                let revenue_share = t.revenue / total_revenue;
                model.weight(click_share, revenue_share)
            };
            AttributionResult {
                channel_id: t.channel_id,
                model,
                credit_share,
            }
        })
        .collect();

    AttributionReport {
        model,
        results,
        recommended_model: insufficient_data.then_some(AttributionModel::TimeDecay),
        insufficient_data,
    }
}

/// Attribute credit under every model.
pub fn attribute_all(channel_stats: &[ChannelAggregate]) -> Vec<AttributionReport> {
    AttributionModel::ALL
        .iter()
        .map(|model| attribute(channel_stats, *model))
        .collect()
}

/// Scale shares so they sum to one. All-zero input is returned unchanged.
pub fn renormalize(results: &[AttributionResult]) -> Vec<AttributionResult> {
    let sum: f64 = results.iter().map(|r| r.credit_share).sum();
    if sum <= 0.0 {
        return results.to_vec();
    }
    results
        .iter()
        .map(|r| AttributionResult {
            credit_share: r.credit_share / sum,
            ..r.clone()
        })
        .collect()
}
