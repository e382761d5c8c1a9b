//! ROI-ranked budget reallocation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregator::{ChannelAggregate, rollup};
use crate::campaign::ChannelBudget;
use crate::config::BudgetConfig;
use crate::error::{EngineError, Result};
use crate::types::{ChannelId, Money};

/// What the optimizer decided for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Weighted share only
    Active,
    /// Grown toward its scaled daily budget
    Scaled,
    /// Losing money; budget withdrawn
    Paused,
}

impl AllocationStatus {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scaled => "scaled",
            Self::Paused => "paused",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "scaled" => Some(Self::Scaled),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Recommended budget for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub channel_id: ChannelId,
    /// Daily budget in effect before this cycle.
    pub previous_budget: Money,
    pub recommended_budget: Money,
    /// One-based position in the ROI ordering.
    pub rank: u32,
    pub roi: f64,
    pub weight: u32,
    pub status: AllocationStatus,
    /// Spend over the aggregated window.
    pub spend: Money,
}

/// `(revenue - spend) / spend`, or 0 without spend.
#[must_use]
pub fn roi(revenue: Money, spend: Money) -> f64 {
    if spend > 0.0 {
        (revenue - spend) / spend
    } else {
        0.0
    }
}

/// Ranks channels by ROI and splits the campaign budget between them.
#[derive(Debug, Clone)]
pub struct BudgetOptimizer {
    config: BudgetConfig,
}

impl BudgetOptimizer {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Rank-weighted split of `total_budget`, before the pause and scale passes.
    ///
    /// Channels are rolled up, then stably ordered by ROI descending, so ties
    /// stay in channel id order. The
    /// channel at zero-based position `i` of `n` gets weight `max(1, n - i)`,
    /// and the shares sum to `total_budget`.
    pub fn weighted_split(
        &self,
        channels: &[ChannelAggregate],
        daily_budgets: &[ChannelBudget],
        total_budget: Money,
    ) -> Vec<BudgetAllocation> {
        let previous: HashMap<&ChannelId, Money> = daily_budgets
            .iter()
            .map(|b| (&b.channel_id, b.daily_budget))
            .collect();

        let mut ranked: Vec<(ChannelId, f64, Money)> = rollup(channels)
            .into_iter()
            .map(|t| {
                let r = roi(t.revenue, t.spend);
                (t.channel_id, r, t.spend)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let n = ranked.len();
        let weights: Vec<u32> = (0..n)
            .map(|i| u32::try_from(n - i).unwrap_or(u32::MAX).max(1))
            .collect();
        let weight_sum: f64 = weights.iter().map(|w| f64::from(*w)).sum();

        ranked
            .into_iter()
            .zip(weights)
            .enumerate()
            .map(|(i, ((channel_id, roi, spend), weight))| BudgetAllocation {
                previous_budget: previous.get(&channel_id).copied().unwrap_or(0.0),
                recommended_budget: f64::from(weight) / weight_sum * total_budget,
                rank: u32::try_from(i + 1).unwrap_or(u32::MAX),
                roi,
                weight,
                status: AllocationStatus::Active,
                spend,
                channel_id,
            })
            .collect()
    }

    /// Full allocation: weighted split, then the pause pass, then scaling.
    ///
    /// Paused channels drop to zero and release their share. Channels above
    /// the scale threshold, best ROI first, grow toward `daily_budget *
    /// scale_factor` out of the released share only, so the sum never
    /// exceeds `total_budget`.
    pub fn optimize(
        &self,
        channels: &[ChannelAggregate],
        daily_budgets: &[ChannelBudget],
        total_budget: Money,
    ) -> Result<Vec<BudgetAllocation>> {
        if !(total_budget > 0.0) {
            return Err(EngineError::Configuration(format!(
                "total budget must be positive, got {total_budget}"
            )));
        }

        let mut allocations = self.weighted_split(channels, daily_budgets, total_budget);

        let mut headroom = 0.0;
        for alloc in &mut allocations {
            if alloc.spend > self.config.pause_min_spend
                && alloc.roi < self.config.pause_roi_threshold
            {
                headroom += alloc.recommended_budget;
                alloc.recommended_budget = 0.0;
                alloc.status = AllocationStatus::Paused;
            }
        }

        for alloc in &mut allocations {
            if alloc.status == AllocationStatus::Paused
                || alloc.roi <= self.config.scale_roi_threshold
            {
                continue;
            }
            let target = alloc.previous_budget * self.config.scale_factor;
            let grow = (target - alloc.recommended_budget).min(headroom);
            if grow > 0.0 {
                alloc.recommended_budget += grow;
                headroom -= grow;
                alloc.status = AllocationStatus::Scaled;
            }
        }

        debug!(
            channels = allocations.len(),
            total_budget,
            unallocated = headroom,
            "budget optimization complete"
        );

        Ok(allocations)
    }
}
