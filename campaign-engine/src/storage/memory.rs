//! In-memory event store.
//!
//! Mirrors the libSQL store's upsert and compare-and-set semantics so cycle
//! logic can be exercised without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;
use tracing::instrument;

use super::{EventStore, Result};
use crate::budget::AllocationSnapshot;
use crate::campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};
use crate::events::{ClickEvent, CommissionRecord, ConversionEvent};
use crate::experiment::{ExperimentTest, ExperimentVariant, TestStatus};
use crate::fraud::FraudAlert;
use crate::types::{
    AlertId, CampaignId, ChannelId, ClickId, ConversionId, LinkId, TestId, TimeRange, VariantId,
};

#[derive(Default)]
struct State {
    campaigns: BTreeMap<CampaignId, Campaign>,
    links: BTreeMap<LinkId, TrackedLink>,
    budgets: BTreeMap<(CampaignId, ChannelId), ChannelBudget>,
    spend: BTreeMap<(CampaignId, ChannelId, NaiveDate), SpendRecord>,
    clicks: BTreeMap<ClickId, ClickEvent>,
    conversions: BTreeMap<ConversionId, ConversionEvent>,
    commissions: HashMap<ConversionId, CommissionRecord>,
    alerts: Vec<FraudAlert>,
    allocations: Vec<AllocationSnapshot>,
    tests: BTreeMap<TestId, ExperimentTest>,
    variants: BTreeMap<VariantId, ExperimentVariant>,
}

impl State {
    /// Whether an event on `link_id` belongs in a campaign's snapshot.
    fn link_visible(&self, link_id: &LinkId, campaign_id: &CampaignId) -> bool {
        self.links
            .get(link_id)
            .is_none_or(|link| &link.campaign_id == campaign_id)
    }
}

/// Event store backed by in-process maps.
#[derive(Default)]
pub struct MemoryEventStore {
    state: RwLock<State>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let mut state = self.state.write().await;
        state.campaigns.insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state.read().await.campaigns.get(id).cloned())
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.state.read().await.campaigns.values().cloned().collect())
    }

    async fn upsert_link(&self, link: &TrackedLink) -> Result<()> {
        let mut state = self.state.write().await;
        state.links.insert(link.id.clone(), link.clone());
        Ok(())
    }

    async fn links_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<TrackedLink>> {
        let state = self.state.read().await;
        Ok(state
            .links
            .values()
            .filter(|l| &l.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn upsert_channel_budget(&self, budget: &ChannelBudget) -> Result<()> {
        let mut state = self.state.write().await;
        state.budgets.insert(
            (budget.campaign_id.clone(), budget.channel_id.clone()),
            budget.clone(),
        );
        Ok(())
    }

    async fn channel_budgets(&self, campaign_id: &CampaignId) -> Result<Vec<ChannelBudget>> {
        let state = self.state.read().await;
        Ok(state
            .budgets
            .values()
            .filter(|b| &b.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn record_spend(&self, spend: &SpendRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.spend.insert(
            (spend.campaign_id.clone(), spend.channel_id.clone(), spend.day),
            spend.clone(),
        );
        Ok(())
    }

    async fn spend_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<SpendRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<SpendRecord> = state
            .spend
            .values()
            .filter(|s| &s.campaign_id == campaign_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.day.cmp(&b.day).then_with(|| a.channel_id.cmp(&b.channel_id)));
        Ok(records)
    }

    #[instrument(skip(self, click), fields(click_id = %click.id), level = "debug")]
    async fn append_click(&self, click: &ClickEvent) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.clicks.contains_key(&click.id) {
            return Ok(false);
        }
        state.clicks.insert(click.id.clone(), click.clone());
        Ok(true)
    }

    #[instrument(skip(self, conversion), fields(conversion_id = %conversion.id), level = "debug")]
    async fn append_conversion(&self, conversion: &ConversionEvent) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.conversions.contains_key(&conversion.id) {
            return Ok(false);
        }
        state
            .conversions
            .insert(conversion.id.clone(), conversion.clone());
        Ok(true)
    }

    async fn clicks_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ClickEvent>> {
        let state = self.state.read().await;
        let mut clicks: Vec<ClickEvent> = state
            .clicks
            .values()
            .filter(|c| range.contains(c.timestamp) && state.link_visible(&c.link_id, campaign_id))
            .cloned()
            .collect();
        clicks.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(clicks)
    }

    async fn conversions_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ConversionEvent>> {
        let state = self.state.read().await;
        let mut conversions: Vec<ConversionEvent> = state
            .conversions
            .values()
            .filter(|c| range.contains(c.timestamp) && state.link_visible(&c.link_id, campaign_id))
            .cloned()
            .collect();
        conversions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(conversions)
    }

    async fn mark_click_converted(&self, click_id: &ClickId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.clicks.get_mut(click_id) {
            Some(click) if !click.converted => {
                click.converted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_commission(&self, commission: &CommissionRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.commissions.contains_key(&commission.conversion_id) {
            return Ok(false);
        }
        state
            .commissions
            .insert(commission.conversion_id.clone(), commission.clone());
        Ok(true)
    }

    async fn commission_for_conversion(
        &self,
        conversion_id: &ConversionId,
    ) -> Result<Option<CommissionRecord>> {
        Ok(self.state.read().await.commissions.get(conversion_id).cloned())
    }

    #[instrument(skip(self, alert), fields(source_key = %alert.source_key), level = "debug")]
    async fn upsert_alert(&self, alert: &FraudAlert) -> Result<AlertId> {
        let mut state = self.state.write().await;
        let open = state.alerts.iter_mut().find(|a| {
            !a.resolved && a.campaign_id == alert.campaign_id && a.source_key == alert.source_key
        });
        match open {
            Some(existing) => {
                existing.severity = alert.severity;
                existing.click_count = alert.click_count;
                existing.estimated_loss = alert.estimated_loss;
                Ok(existing.id)
            }
            None => {
                let mut stored = alert.clone();
                stored.resolved = false;
                state.alerts.push(stored);
                Ok(alert.id)
            }
        }
    }

    async fn open_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .filter(|a| !a.resolved && &a.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn list_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .rev()
            .filter(|a| &a.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn resolve_alert(&self, id: AlertId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) if !alert.resolved => {
                alert.resolved = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_allocations(&self, snapshot: &AllocationSnapshot) -> Result<()> {
        let mut state = self.state.write().await;
        if !state
            .allocations
            .iter()
            .any(|s| s.cycle_id == snapshot.cycle_id)
        {
            state.allocations.push(snapshot.clone());
        }
        Ok(())
    }

    async fn allocation_history(
        &self,
        campaign_id: &CampaignId,
        limit: usize,
    ) -> Result<Vec<AllocationSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .iter()
            .rev()
            .filter(|s| &s.campaign_id == campaign_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_test(&self, test: &ExperimentTest) -> Result<()> {
        let mut state = self.state.write().await;
        match state.tests.get_mut(&test.id) {
            Some(existing) => existing.name = test.name.clone(),
            None => {
                state.tests.insert(test.id.clone(), test.clone());
            }
        }
        Ok(())
    }

    async fn get_test(&self, id: &TestId) -> Result<Option<ExperimentTest>> {
        Ok(self.state.read().await.tests.get(id).cloned())
    }

    async fn tests_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<ExperimentTest>> {
        let state = self.state.read().await;
        let mut tests: Vec<ExperimentTest> = state
            .tests
            .values()
            .filter(|t| &t.campaign_id == campaign_id)
            .cloned()
            .collect();
        tests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tests)
    }

    async fn upsert_variant(&self, variant: &ExperimentVariant) -> Result<()> {
        let mut state = self.state.write().await;
        match state.variants.get_mut(&variant.id) {
            Some(existing) => {
                existing.visitors = existing.visitors.max(variant.visitors);
                existing.conversions = existing.conversions.max(variant.conversions);
            }
            None => {
                state.variants.insert(variant.id.clone(), variant.clone());
            }
        }
        Ok(())
    }

    async fn variants_for_test(&self, test_id: &TestId) -> Result<Vec<ExperimentVariant>> {
        let state = self.state.read().await;
        let mut variants: Vec<ExperimentVariant> = state
            .variants
            .values()
            .filter(|v| &v.test_id == test_id)
            .cloned()
            .collect();
        variants.sort_by(|a, b| b.is_control.cmp(&a.is_control).then_with(|| a.id.cmp(&b.id)));
        Ok(variants)
    }

    async fn increment_variant(
        &self,
        test_id: &TestId,
        variant_id: &VariantId,
        visitors: u64,
        conversions: u64,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let State {
            tests, variants, ..
        } = &mut *state;
        let Some(variant) = variants
            .get_mut(variant_id)
            .filter(|v| &v.test_id == test_id)
        else {
            return Ok(false);
        };
        let running = tests
            .get(&variant.test_id)
            .is_some_and(|t| t.status == TestStatus::Running);
        if !running {
            return Ok(false);
        }
        variant.visitors += visitors;
        variant.conversions += conversions;
        Ok(true)
    }

    async fn complete_test(&self, test: &ExperimentTest) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tests.get_mut(&test.id) {
            Some(stored) if stored.status == TestStatus::Running => {
                stored.status = TestStatus::Completed;
                stored.winner_variant_id = test.winner_variant_id.clone();
                stored.completed_at = test.completed_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
