//! A/B test and variant records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{CampaignId, TestId, VariantId};

/// Lifecycle state of a test. `Running -> Completed` is one-way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Accepting visits and conversions
    #[default]
    Running,
    /// Stopped (terminal state)
    Completed,
}

impl TestStatus {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    /// Parse from database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// An A/B test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTest {
    pub id: TestId,
    pub campaign_id: CampaignId,
    pub name: String,
    #[serde(default)]
    pub status: TestStatus,
    #[serde(default)]
    pub winner_variant_id: Option<VariantId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExperimentTest {
    /// Create a running test.
    #[must_use]
    pub fn new(
        id: impl Into<TestId>,
        campaign_id: impl Into<CampaignId>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            campaign_id: campaign_id.into(),
            name: name.into(),
            status: TestStatus::Running,
            winner_variant_id: None,
            created_at,
            completed_at: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == TestStatus::Running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::TestNotRunning(self.id.clone()))
        }
    }

    /// Count a visitor on one of this test's variants.
    pub fn record_visit(&self, variant: &mut ExperimentVariant) -> Result<()> {
        self.ensure_running()?;
        variant.visitors += 1;
        Ok(())
    }

    /// Count a conversion on one of this test's variants.
    pub fn record_conversion(&self, variant: &mut ExperimentVariant) -> Result<()> {
        self.ensure_running()?;
        variant.conversions += 1;
        Ok(())
    }

    /// Move to `Completed`, recording the winner if there is one.
    pub fn complete(&mut self, winner: Option<VariantId>, now: DateTime<Utc>) -> Result<()> {
        self.ensure_running()?;
        self.status = TestStatus::Completed;
        self.winner_variant_id = winner;
        self.completed_at = Some(now);
        Ok(())
    }
}

/// One arm of an A/B test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentVariant {
    pub id: VariantId,
    pub test_id: TestId,
    #[serde(default)]
    pub name: String,
    pub is_control: bool,
    /// Only ever increases.
    #[serde(default)]
    pub visitors: u64,
    /// Only ever increases.
    #[serde(default)]
    pub conversions: u64,
}

impl ExperimentVariant {
    /// Conversions per visitor, 0 without visitors.
    #[must_use]
    pub fn conversion_rate(&self) -> f64 {
        if self.visitors == 0 {
            0.0
        } else {
            self.conversions as f64 / self.visitors as f64
        }
    }
}
