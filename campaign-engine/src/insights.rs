//! Ranked recommendations composed from the other components' outputs.
//!
//! Nothing here computes new figures. Candidates are collected in a fixed
//! order (fraud, budget, pacing, experiments), stably sorted by impact and
//! truncated, so equal scores keep their collection order.

use serde::{Deserialize, Serialize};

use crate::aggregator::{ChannelAggregate, rollup};
use crate::budget::{AllocationStatus, BudgetAllocation, PacingReport, PacingStatus};
use crate::config::{FraudConfig, InsightConfig};
use crate::experiment::ExperimentResult;
use crate::fraud::FraudReport;
use crate::types::Money;

/// What the reader should do about an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightAction {
    BlockSource,
    ReviewTraffic,
    ScaleChannel,
    PauseChannel,
    AdjustPacing,
    RollOutVariant,
}

impl InsightAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockSource => "block_source",
            Self::ReviewTraffic => "review_traffic",
            Self::ScaleChannel => "scale_channel",
            Self::PauseChannel => "pause_channel",
            Self::AdjustPacing => "adjust_pacing",
            Self::RollOutVariant => "roll_out_variant",
        }
    }
}

/// A human-readable recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub title: String,
    pub description: String,
    pub impact_score: f64,
    pub action: InsightAction,
}

/// Component outputs for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct InsightInputs<'a> {
    pub aggregates: &'a [ChannelAggregate],
    pub fraud: &'a FraudReport,
    pub allocations: &'a [BudgetAllocation],
    pub pacing: Option<&'a PacingReport>,
    pub experiments: &'a [ExperimentResult],
}

/// Selects and formats insights.
#[derive(Debug, Clone)]
pub struct InsightSynthesizer {
    max_insights: usize,
    bot_rate_alert_pct: f64,
    cost_per_click: Money,
}

impl InsightSynthesizer {
    pub fn new(config: &InsightConfig, fraud: &FraudConfig) -> Self {
        Self {
            max_insights: config.max_insights,
            bot_rate_alert_pct: config.bot_rate_alert_pct,
            cost_per_click: fraud.cost_per_click,
        }
    }

    /// Top insights by impact, descending.
    pub fn synthesize(&self, inputs: InsightInputs<'_>) -> Vec<Insight> {
        let mut insights = Vec::new();
        self.fraud_insights(inputs.fraud, &mut insights);
        budget_insights(inputs.aggregates, inputs.allocations, &mut insights);
        if let Some(pacing) = inputs.pacing {
            pacing_insight(pacing, &mut insights);
        }
        experiment_insights(inputs.experiments, &mut insights);

        insights.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));
        insights.truncate(self.max_insights);
        insights
    }

    fn fraud_insights(&self, fraud: &FraudReport, out: &mut Vec<Insight>) {
        for alert in &fraud.alerts {
            out.push(Insight {
                title: format!("Block suspicious source {}", alert.source_key),
                description: format!(
                    "{} clicks from {} ({} severity), an estimated ${:.2} lost",
                    alert.click_count,
                    alert.source_key,
                    alert.severity.as_str(),
                    alert.estimated_loss
                ),
                impact_score: alert.estimated_loss,
                action: InsightAction::BlockSource,
            });
        }

        let bot = &fraud.bot_traffic;
        if bot.bot_rate_pct > self.bot_rate_alert_pct {
            out.push(Insight {
                title: "Review bot traffic".to_string(),
                description: format!(
                    "{:.1}% of clicks ({} of {}) come from known bot user agents",
                    bot.bot_rate_pct,
                    bot.bot_clicks,
                    bot.bot_clicks + bot.human_clicks
                ),
                impact_score: bot.bot_clicks as f64 * self.cost_per_click,
                action: InsightAction::ReviewTraffic,
            });
        }
    }
}

fn budget_insights(
    aggregates: &[ChannelAggregate],
    allocations: &[BudgetAllocation],
    out: &mut Vec<Insight>,
) {
    let totals = rollup(aggregates);
    for alloc in allocations {
        match alloc.status {
            AllocationStatus::Scaled => out.push(Insight {
                title: format!("Scale channel {}", alloc.channel_id),
                description: format!(
                    "ROI of {:.0}% supports raising the budget from ${:.2} to ${:.2}",
                    alloc.roi * 100.0,
                    alloc.previous_budget,
                    alloc.recommended_budget
                ),
                impact_score: (alloc.recommended_budget - alloc.previous_budget).max(0.0),
                action: InsightAction::ScaleChannel,
            }),
            AllocationStatus::Paused => {
                let revenue = totals
                    .iter()
                    .find(|t| t.channel_id == alloc.channel_id)
                    .map_or(0.0, |t| t.revenue);
                out.push(Insight {
                    title: format!("Pause channel {}", alloc.channel_id),
                    description: format!(
                        "${:.2} spent for ${:.2} revenue (ROI {:.0}%)",
                        alloc.spend,
                        revenue,
                        alloc.roi * 100.0
                    ),
                    impact_score: alloc.spend,
                    action: InsightAction::PauseChannel,
                });
            }
            AllocationStatus::Active => {}
        }
    }
}

fn pacing_insight(pacing: &PacingReport, out: &mut Vec<Insight>) {
    let title = match pacing.status {
        PacingStatus::OnTrack => return,
        PacingStatus::Overspending => "Slow down campaign spend",
        PacingStatus::Underspending => "Speed up campaign spend",
    };
    out.push(Insight {
        title: title.to_string(),
        description: format!(
            "Spending ${:.2}/day against an ideal ${:.2}/day. {}",
            pacing.current_pace,
            pacing.ideal_daily_budget,
            pacing.recommendations.first().map_or("", String::as_str)
        ),
        impact_score: (pacing.current_pace - pacing.ideal_daily_budget).abs(),
        action: InsightAction::AdjustPacing,
    });
}

fn experiment_insights(experiments: &[ExperimentResult], out: &mut Vec<Insight>) {
    for result in experiments {
        let Some(winner) = result.winner_stats() else {
            continue;
        };
        out.push(Insight {
            title: format!("Roll out variant {}", winner.variant_id),
            description: result.message.clone(),
            impact_score: winner.lift * winner.visitors as f64 * winner.conversion_rate,
            action: InsightAction::RollOutVariant,
        });
    }
}
