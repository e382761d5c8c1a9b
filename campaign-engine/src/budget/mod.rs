//! Budget reallocation and spend pacing.

mod optimizer;
mod pacing;

pub use optimizer::{AllocationStatus, BudgetAllocation, BudgetOptimizer, roi};
pub use pacing::{PacingReport, PacingStatus, pace, pace_campaign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CampaignId, CycleId};

/// Allocations recorded by one cycle, kept for audit and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub cycle_id: CycleId,
    pub campaign_id: CampaignId,
    pub created_at: DateTime<Utc>,
    pub allocations: Vec<BudgetAllocation>,
}
