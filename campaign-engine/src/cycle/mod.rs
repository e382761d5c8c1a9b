//! Optimization cycles.
//!
//! A cycle reads one snapshot of a campaign, runs every component over it in
//! order and persists the derived records. [`CycleRunner`] runs single
//! cycles; [`Scheduler`] drives them on a polling interval.

mod runner;
mod scheduler;

pub use runner::CycleRunner;
pub use scheduler::{CycleOutcome, Scheduler};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregator::ChannelAggregate;
use crate::attribution::{AttributionModel, AttributionReport};
use crate::budget::{BudgetAllocation, PacingReport};
use crate::campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};
use crate::events::{ClickEvent, ConversionEvent};
use crate::experiment::{ExperimentResult, ExperimentTest, ExperimentVariant};
use crate::fraud::{FraudAlert, FraudReport};
use crate::insights::Insight;
use crate::types::{CampaignId, CycleId, TestId, TimeRange};

/// Category of a non-fatal problem met during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Events referenced links without channel metadata
    MissingChannel,
    /// A component had too little data for a meaningful result
    InsufficientData,
    /// A write failed or timed out; the figures are still reported
    Persistence,
    /// Another writer changed a record first
    ConcurrentModification,
}

impl WarningKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingChannel => "missing_channel",
            Self::InsufficientData => "insufficient_data",
            Self::Persistence => "persistence",
            Self::ConcurrentModification => "concurrent_modification",
        }
    }
}

/// A non-fatal problem recorded in the cycle report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl CycleWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a cycle reads, fetched once at its start.
#[derive(Debug, Clone)]
pub struct CycleSnapshot {
    pub campaign: Campaign,
    pub window: TimeRange,
    pub links: Vec<TrackedLink>,
    pub budgets: Vec<ChannelBudget>,
    pub spend: Vec<SpendRecord>,
    pub clicks: Vec<ClickEvent>,
    pub conversions: Vec<ConversionEvent>,
    pub open_alerts: Vec<FraudAlert>,
    /// Running tests with their variants.
    pub tests: Vec<(ExperimentTest, Vec<ExperimentVariant>)>,
}

/// Output of one cycle for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: CycleId,
    pub campaign_id: CampaignId,
    pub started_at: DateTime<Utc>,
    pub window: TimeRange,
    pub aggregates: Vec<ChannelAggregate>,
    /// Events skipped for missing channel metadata.
    pub skipped: u64,
    /// Clicks newly marked converted by this cycle.
    pub converted_clicks: u64,
    pub fraud: FraudReport,
    /// Model configured for the summary.
    pub attribution_model: AttributionModel,
    /// One report per attribution model.
    pub attribution: Vec<AttributionReport>,
    pub allocations: Vec<BudgetAllocation>,
    pub pacing: Option<PacingReport>,
    pub experiments: Vec<ExperimentResult>,
    /// Tests this cycle completed automatically.
    pub stopped_tests: Vec<TestId>,
    pub insights: Vec<Insight>,
    pub warnings: Vec<CycleWarning>,
}

impl CycleReport {
    /// The report of the configured attribution model.
    pub fn primary_attribution(&self) -> Option<&AttributionReport> {
        self.attribution
            .iter()
            .find(|r| r.model == self.attribution_model)
    }

    /// Whether the cycle met any non-fatal problem.
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}
