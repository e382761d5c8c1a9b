//! Event store adapter.
//!
//! Raw events are append-only and idempotent on their ids. Derived records
//! (alerts, allocations, test completion) are written with upsert or
//! compare-and-set statements so a retried cycle cannot double count.
//!
//! Two implementations are provided:
//! - [`TursoEventStore`] - libSQL, either a local file or `:memory:`
//! - [`MemoryEventStore`] - in-process maps, for tests and dry runs

mod error;
mod memory;
mod turso;

pub use error::{Error, Result};
pub use memory::MemoryEventStore;
pub use turso::TursoEventStore;

use async_trait::async_trait;

use crate::budget::AllocationSnapshot;
use crate::campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};
use crate::events::{ClickEvent, CommissionRecord, ConversionEvent, IngestRecord};
use crate::experiment::{ExperimentTest, ExperimentVariant};
use crate::fraud::FraudAlert;
use crate::types::{AlertId, CampaignId, ClickId, ConversionId, TestId, TimeRange, VariantId};

/// Storage for events, campaign metadata and cycle results.
///
/// Event queries for a campaign include events whose link is unknown to
/// every campaign, so the aggregator can report them as skipped.
#[async_trait]
pub trait EventStore: Send + Sync {
    // === Campaign metadata ===

    /// Insert or replace a campaign.
    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// Get a campaign by ID.
    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>>;

    /// List all campaigns ordered by id.
    async fn list_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Insert or replace a tracked link.
    async fn upsert_link(&self, link: &TrackedLink) -> Result<()>;

    /// Links belonging to a campaign.
    async fn links_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<TrackedLink>>;

    /// Insert or replace a channel's daily budget.
    async fn upsert_channel_budget(&self, budget: &ChannelBudget) -> Result<()>;

    /// Daily budgets of a campaign's channels.
    async fn channel_budgets(&self, campaign_id: &CampaignId) -> Result<Vec<ChannelBudget>>;

    /// Insert or replace the spend of a channel on a day.
    async fn record_spend(&self, spend: &SpendRecord) -> Result<()>;

    /// All spend booked for a campaign, ordered by day.
    async fn spend_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<SpendRecord>>;

    // === Events ===

    /// Append a click. Returns `false` if the id was already stored.
    async fn append_click(&self, click: &ClickEvent) -> Result<bool>;

    /// Append a conversion. Returns `false` if the id was already stored.
    async fn append_conversion(&self, conversion: &ConversionEvent) -> Result<bool>;

    /// Clicks of a campaign within `range`, ordered by timestamp.
    async fn clicks_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ClickEvent>>;

    /// Conversions of a campaign within `range`, ordered by timestamp.
    async fn conversions_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ConversionEvent>>;

    /// Set `converted` on an unconverted click.
    ///
    /// Returns `false` if the click is unknown or already converted.
    async fn mark_click_converted(&self, click_id: &ClickId) -> Result<bool>;

    /// Store a commission. Returns `false` if the conversion already has one.
    async fn record_commission(&self, commission: &CommissionRecord) -> Result<bool>;

    /// Commission of a conversion.
    async fn commission_for_conversion(
        &self,
        conversion_id: &ConversionId,
    ) -> Result<Option<CommissionRecord>>;

    // === Fraud alerts ===

    /// Insert an alert, or update loss and severity of the open alert for
    /// the same `(campaign_id, source_key)`. Returns the stored alert's id.
    async fn upsert_alert(&self, alert: &FraudAlert) -> Result<AlertId>;

    /// Unresolved alerts of a campaign.
    async fn open_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>>;

    /// All alerts of a campaign, newest first.
    async fn list_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>>;

    /// Mark an alert resolved. Returns `false` if unknown or already resolved.
    async fn resolve_alert(&self, id: AlertId) -> Result<bool>;

    // === Budget allocations ===

    /// Store a cycle's allocations. Storing the same cycle twice is a no-op.
    async fn save_allocations(&self, snapshot: &AllocationSnapshot) -> Result<()>;

    /// Most recent allocations of a campaign, newest first.
    async fn allocation_history(
        &self,
        campaign_id: &CampaignId,
        limit: usize,
    ) -> Result<Vec<AllocationSnapshot>>;

    // === Experiments ===

    /// Insert a test, or rename an existing one. Status is never overwritten.
    async fn upsert_test(&self, test: &ExperimentTest) -> Result<()>;

    /// Get a test by ID.
    async fn get_test(&self, id: &TestId) -> Result<Option<ExperimentTest>>;

    /// Tests of a campaign ordered by creation time.
    async fn tests_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<ExperimentTest>>;

    /// Insert a variant, or raise its counters to the given values.
    /// Counters never decrease.
    async fn upsert_variant(&self, variant: &ExperimentVariant) -> Result<()>;

    /// Variants of a test, control first.
    async fn variants_for_test(&self, test_id: &TestId) -> Result<Vec<ExperimentVariant>>;

    /// Add to a variant's counters while its test is running.
    ///
    /// Returns `false` if the variant is unknown, belongs to another test, or
    /// the test is completed.
    async fn increment_variant(
        &self,
        test_id: &TestId,
        variant_id: &VariantId,
        visitors: u64,
        conversions: u64,
    ) -> Result<bool>;

    /// Persist completion of a running test.
    ///
    /// Returns `false` if the test was not running.
    async fn complete_test(&self, test: &ExperimentTest) -> Result<bool>;

    // === Ingestion ===

    /// Apply one ingestion record. Returns `false` for a duplicate event.
    async fn ingest(&self, record: &IngestRecord) -> Result<bool> {
        match record {
            IngestRecord::Click(click) => self.append_click(click).await,
            IngestRecord::Conversion(conversion) => {
                let inserted = self.append_conversion(conversion).await?;
                // A replay fills in a commission a failed earlier attempt missed.
                self.record_commission(&CommissionRecord::for_conversion(conversion))
                    .await?;
                Ok(inserted)
            }
            IngestRecord::Campaign(campaign) => self.upsert_campaign(campaign).await.map(|_| true),
            IngestRecord::Link(link) => self.upsert_link(link).await.map(|_| true),
            IngestRecord::ChannelBudget(budget) => {
                self.upsert_channel_budget(budget).await.map(|_| true)
            }
            IngestRecord::Spend(spend) => self.record_spend(spend).await.map(|_| true),
            IngestRecord::ExperimentTest(test) => self.upsert_test(test).await.map(|_| true),
            IngestRecord::ExperimentVariant(variant) => {
                self.upsert_variant(variant).await.map(|_| true)
            }
        }
    }
}
