//! Runs one optimization cycle for one campaign.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{CycleReport, CycleSnapshot, CycleWarning, WarningKind};
use crate::aggregator::{Aggregator, match_conversions};
use crate::attribution::attribute_all;
use crate::budget::{AllocationSnapshot, BudgetOptimizer, pace_campaign};
use crate::campaign::Campaign;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::ClickEvent;
use crate::experiment::ExperimentEvaluator;
use crate::fraud::{FraudDetector, reconcile};
use crate::insights::{InsightInputs, InsightSynthesizer};
use crate::storage::{self, EventStore};
use crate::types::{CampaignId, CycleId, Money, TimeRange};

/// Runs cycles against a store, at most one per campaign at a time.
pub struct CycleRunner {
    store: Arc<dyn EventStore>,
    config: EngineConfig,
    in_flight: Arc<Mutex<HashSet<CampaignId>>>,
}

/// Holds a campaign's in-flight slot until dropped.
struct InFlightGuard {
    slots: Arc<Mutex<HashSet<CampaignId>>>,
    campaign_id: CampaignId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.campaign_id);
    }
}

impl CycleRunner {
    pub fn new(store: Arc<dyn EventStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Whether a cycle for the campaign is currently running.
    pub fn is_in_flight(&self, campaign_id: &CampaignId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(campaign_id)
    }

    fn acquire(&self, campaign_id: &CampaignId) -> Result<InFlightGuard> {
        let mut slots = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !slots.insert(campaign_id.clone()) {
            return Err(EngineError::ConcurrentModification(format!(
                "a cycle for campaign {campaign_id} is already running"
            )));
        }
        Ok(InFlightGuard {
            slots: Arc::clone(&self.in_flight),
            campaign_id: campaign_id.clone(),
        })
    }

    /// All campaigns known to the store.
    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let store = self.store.as_ref();
        self.read("campaigns", move || store.list_campaigns()).await
    }

    /// Run one cycle to completion.
    pub async fn run_cycle(
        &self,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        self.run_cycle_until(campaign_id, now, &CancellationToken::new())
            .await
    }

    /// Run one cycle, giving up with `Cancelled` when `shutdown` fires.
    ///
    /// Fails with `ConcurrentModification`, before touching the store, if a
    /// cycle for the same campaign is already running.
    #[instrument(skip(self, shutdown), fields(campaign_id = %campaign_id))]
    pub async fn run_cycle_until(
        &self,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport> {
        let _guard = self.acquire(campaign_id)?;

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                warn!("cycle cancelled");
                Err(EngineError::Cancelled)
            }

            result = self.execute(campaign_id, now) => result,
        }
    }

    async fn execute(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> Result<CycleReport> {
        let config = self.config.for_campaign(campaign_id);
        config.validate()?;

        let snapshot = self.fetch_snapshot(campaign_id, now, &config).await?;
        let total_budget = self
            .config
            .override_for(campaign_id)
            .and_then(|o| o.total_budget)
            .unwrap_or(snapshot.campaign.total_budget);
        if !(total_budget > 0.0) {
            return Err(EngineError::Configuration(format!(
                "campaign {campaign_id} has no positive total budget"
            )));
        }

        let cycle_id = CycleId::new();
        let mut warnings = Vec::new();

        // Aggregation
        let aggregator = Aggregator::new(campaign_id.clone(), &snapshot.links, &snapshot.spend);
        let aggregation =
            aggregator.aggregate(&snapshot.clicks, &snapshot.conversions, snapshot.window);
        if aggregation.skipped > 0 {
            warnings.push(CycleWarning::new(
                WarningKind::MissingChannel,
                format!(
                    "{} events reference links without channel metadata",
                    aggregation.skipped
                ),
            ));
        }

        // Conversion marking
        let attribution_window = ChronoDuration::hours(i64::from(config.attribution.window_hours));
        let mut converted_clicks = 0u64;
        for click_id in match_conversions(&snapshot.clicks, &snapshot.conversions, attribution_window)
        {
            let marked = self
                .call("mark click converted", self.store.mark_click_converted(&click_id))
                .await;
            match marked {
                Ok(true) => converted_clicks += 1,
                Ok(false) => {}
                Err(e) => {
                    warnings.push(CycleWarning::new(WarningKind::Persistence, e.to_string()));
                    break;
                }
            }
        }

        // Fraud detection over clicks with known channels
        let known_clicks: Vec<ClickEvent> = snapshot
            .clicks
            .iter()
            .filter(|c| aggregator.channel_for(&c.link_id).is_some())
            .cloned()
            .collect();
        let mut fraud = FraudDetector::new(&config.fraud).detect(campaign_id, &known_clicks, now);
        let detected = std::mem::take(&mut fraud.alerts);
        for upsert in reconcile(&snapshot.open_alerts, detected) {
            let mut alert = upsert.alert().clone();
            let stored = self
                .call("upsert alert", self.store.upsert_alert(&alert))
                .await;
            match stored {
                Ok(id) => alert.id = id,
                Err(e) => {
                    warnings.push(CycleWarning::new(WarningKind::Persistence, e.to_string()));
                }
            }
            fraud.alerts.push(alert);
        }

        // Attribution
        let attribution = attribute_all(&aggregation.aggregates);
        if attribution.iter().any(|r| r.insufficient_data) {
            warnings.push(CycleWarning::new(
                WarningKind::InsufficientData,
                "no clicks or revenue in the window, attribution shares are zero",
            ));
        }

        // Budget
        let allocations = BudgetOptimizer::new(&config.budget).optimize(
            &aggregation.aggregates,
            &snapshot.budgets,
            total_budget,
        )?;
        if !allocations.is_empty() {
            let record = AllocationSnapshot {
                cycle_id,
                campaign_id: campaign_id.clone(),
                created_at: now,
                allocations: allocations.clone(),
            };
            let saved = self
                .call("save allocations", self.store.save_allocations(&record))
                .await;
            if let Err(e) = saved {
                warnings.push(CycleWarning::new(WarningKind::Persistence, e.to_string()));
            }
        }

        let today = now.date_naive();
        let spent: Money = snapshot
            .spend
            .iter()
            .filter(|s| s.day <= today)
            .map(|s| s.amount)
            .sum();
        let pacing = pace_campaign(
            &snapshot.campaign,
            total_budget,
            spent,
            now,
            config.budget.pacing_tolerance,
        );

        // Experiments
        let evaluator = ExperimentEvaluator::new(&config.experiment);
        let mut experiments = Vec::with_capacity(snapshot.tests.len());
        let mut stopped_tests = Vec::new();
        for (test, variants) in &snapshot.tests {
            let result = evaluator.evaluate(test, variants);
            if result.insufficient_data {
                warnings.push(CycleWarning::new(
                    WarningKind::InsufficientData,
                    format!("test {}: {}", test.id, result.message),
                ));
            }

            if config.experiment.auto_complete_on_winner && result.winner.is_some() {
                match evaluator.stop(test, variants, now) {
                    Ok(stopped) => {
                        let completed = self
                            .call("complete test", self.store.complete_test(&stopped.test))
                            .await;
                        match completed {
                            Ok(true) => {
                                info!(test_id = %test.id, winner = ?stopped.result.winner, "test completed");
                                stopped_tests.push(test.id.clone());
                            }
                            Ok(false) => warnings.push(CycleWarning::new(
                                WarningKind::ConcurrentModification,
                                format!("test {} was completed by another writer", test.id),
                            )),
                            Err(e) => warnings
                                .push(CycleWarning::new(WarningKind::Persistence, e.to_string())),
                        }
                    }
                    Err(e) => warnings.push(CycleWarning::new(
                        WarningKind::ConcurrentModification,
                        e.to_string(),
                    )),
                }
            }
            experiments.push(result);
        }

        let insights = InsightSynthesizer::new(&config.insights, &config.fraud).synthesize(
            InsightInputs {
                aggregates: &aggregation.aggregates,
                fraud: &fraud,
                allocations: &allocations,
                pacing: Some(&pacing),
                experiments: &experiments,
            },
        );

        for warning in &warnings {
            warn!(kind = warning.kind.as_str(), "{}", warning.message);
        }
        info!(
            cycle_id = %cycle_id,
            channels = allocations.len(),
            alerts = fraud.alerts.len(),
            converted_clicks,
            insights = insights.len(),
            warnings = warnings.len(),
            "cycle complete"
        );

        Ok(CycleReport {
            cycle_id,
            campaign_id: campaign_id.clone(),
            started_at: now,
            window: snapshot.window,
            aggregates: aggregation.aggregates,
            skipped: aggregation.skipped,
            converted_clicks,
            fraud,
            attribution_model: config.attribution.model,
            attribution,
            allocations,
            pacing: Some(pacing),
            experiments,
            stopped_tests,
            insights,
            warnings,
        })
    }

    /// Read everything a cycle needs, retrying failed reads with backoff.
    #[instrument(skip(self, config), level = "debug")]
    pub async fn fetch_snapshot(
        &self,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<CycleSnapshot> {
        let store = self.store.as_ref();
        let campaign = self
            .read("campaign", move || store.get_campaign(campaign_id))
            .await?
            .ok_or_else(|| EngineError::CampaignNotFound(campaign_id.clone()))?;
        let window = TimeRange::trailing_days(now, config.scheduler.lookback_days);

        let links = self
            .read("links", move || store.links_for_campaign(campaign_id))
            .await?;
        let budgets = self
            .read("channel budgets", move || store.channel_budgets(campaign_id))
            .await?;
        let spend = self
            .read("spend", move || store.spend_for_campaign(campaign_id))
            .await?;
        let clicks = self
            .read("clicks", move || store.clicks_for_campaign(campaign_id, window))
            .await?;
        let conversions = self
            .read("conversions", move || {
                store.conversions_for_campaign(campaign_id, window)
            })
            .await?;
        let open_alerts = self
            .read("open alerts", move || store.open_alerts(campaign_id))
            .await?;

        let mut tests = Vec::new();
        let all_tests = self
            .read("tests", move || store.tests_for_campaign(campaign_id))
            .await?;
        for test in all_tests.into_iter().filter(|t| t.is_running()) {
            let test_id = &test.id;
            let variants = self
                .read("variants", move || store.variants_for_test(test_id))
                .await?;
            tests.push((test, variants));
        }

        debug!(
            clicks = clicks.len(),
            conversions = conversions.len(),
            links = links.len(),
            tests = tests.len(),
            "snapshot loaded"
        );

        Ok(CycleSnapshot {
            campaign,
            window,
            links,
            budgets,
            spend,
            clicks,
            conversions,
            open_alerts,
            tests,
        })
    }

    /// A store read with timeout and exponential backoff.
    async fn read<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = storage::Result<T>>,
    {
        let scheduler = &self.config.scheduler;
        let attempts = scheduler.retry_attempts.max(1);
        let mut delay = scheduler.retry_base_delay();
        let mut attempt = 1;
        loop {
            match self.call(what, op()).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    warn!(what, attempt, error = %e, "store read failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A single store call bounded by the store timeout.
    async fn call<T>(
        &self,
        what: &str,
        fut: impl Future<Output = storage::Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.scheduler.store_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(EngineError::DataUnavailable(format!("{what}: {e}"))),
            Err(_) => Err(EngineError::DataUnavailable(format!(
                "{what} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{ChannelBudget, SpendRecord, TrackedLink};
    use crate::events::ConversionEvent;
    use crate::experiment::{ExperimentTest, ExperimentVariant};
    use crate::fraud::Severity;
    use crate::storage::MemoryEventStore;
    use crate::types::{ClickId, ConversionId, TestId};
    use chrono::{NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 11, 12, 0, 0).unwrap()
    }

    fn campaign(total_budget: Money) -> Campaign {
        Campaign {
            id: CampaignId::from("spring"),
            name: "Spring sale".to_string(),
            total_budget,
            starts_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap(),
        }
    }

    fn click(id: usize, ip: &str, minute: i64) -> ClickEvent {
        ClickEvent {
            id: ClickId::new(format!("c{id}")),
            link_id: "l-search".into(),
            timestamp: now() - ChronoDuration::hours(2) + ChronoDuration::minutes(minute),
            ip_address: ip.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            referrer_source: None,
            device_type: None,
            country: None,
            converted: false,
        }
    }

    async fn seeded_store(total_budget: Money) -> Arc<MemoryEventStore> {
        let store = Arc::new(MemoryEventStore::new());
        store.upsert_campaign(&campaign(total_budget)).await.unwrap();
        store
            .upsert_link(&TrackedLink {
                id: "l-search".into(),
                campaign_id: "spring".into(),
                channel_id: "search".into(),
            })
            .await
            .unwrap();
        store
            .upsert_channel_budget(&ChannelBudget {
                campaign_id: "spring".into(),
                channel_id: "search".into(),
                daily_budget: 40.0,
            })
            .await
            .unwrap();
        store
            .record_spend(&SpendRecord {
                campaign_id: "spring".into(),
                channel_id: "search".into(),
                day: NaiveDate::from_ymd_opt(2025, 3, 11).unwrap(),
                amount: 30.0,
            })
            .await
            .unwrap();
        for i in 0..60 {
            store.append_click(&click(i, "198.51.100.4", 0)).await.unwrap();
        }
        store
            .append_conversion(&ConversionEvent {
                id: ConversionId::from("v1"),
                link_id: "l-search".into(),
                channel_id: "search".into(),
                timestamp: now() - ChronoDuration::minutes(30),
                sale_amount: 90.0,
                commission_amount: 9.0,
            })
            .await
            .unwrap();
        store
    }

    fn runner(store: Arc<MemoryEventStore>) -> CycleRunner {
        CycleRunner::new(store, EngineConfig::default())
    }

    #[tokio::test]
    async fn cycle_produces_report_and_persists_results() {
        let store = seeded_store(300.0).await;
        let runner = runner(store.clone());

        let report = runner.run_cycle(&"spring".into(), now()).await.unwrap();

        assert_eq!(report.aggregates.len(), 1);
        assert_eq!(report.aggregates[0].clicks, 60);
        assert_eq!(report.converted_clicks, 1);
        assert_eq!(report.fraud.alerts.len(), 1);
        assert_eq!(report.fraud.alerts[0].severity, Severity::High);
        assert_eq!(report.allocations.len(), 1);
        assert!(report.pacing.is_some());
        assert_eq!(report.attribution.len(), 5);

        let alerts = store.open_alerts(&"spring".into()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let history = store
            .allocation_history(&"spring".into(), 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cycle_id, report.cycle_id);
    }

    #[tokio::test]
    async fn rerun_updates_alert_and_does_not_reconvert() {
        let store = seeded_store(300.0).await;
        let runner = runner(store.clone());

        let first = runner.run_cycle(&"spring".into(), now()).await.unwrap();
        for i in 60..70 {
            store.append_click(&click(i, "198.51.100.4", 1)).await.unwrap();
        }
        let second = runner.run_cycle(&"spring".into(), now()).await.unwrap();

        assert_eq!(second.converted_clicks, 0);
        assert_eq!(first.fraud.alerts[0].id, second.fraud.alerts[0].id);
        let alerts = store.open_alerts(&"spring".into()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].click_count, 70);
        assert!((alerts[0].estimated_loss - 35.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_rejected_without_side_effects() {
        let store = seeded_store(300.0).await;
        let runner = runner(store.clone());
        let _held = runner.acquire(&"spring".into()).unwrap();

        let err = runner
            .run_cycle(&"spring".into(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ConcurrentModification(_)));
        assert!(store.open_alerts(&"spring".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slot_is_released_after_cycle() {
        let store = seeded_store(300.0).await;
        let runner = runner(store);

        runner.run_cycle(&"spring".into(), now()).await.unwrap();

        assert!(!runner.is_in_flight(&"spring".into()));
        assert!(runner.run_cycle(&"spring".into(), now()).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_cycle_releases_slot() {
        let store = seeded_store(300.0).await;
        let runner = runner(store);
        let token = CancellationToken::new();
        token.cancel();

        let err = runner
            .run_cycle_until(&"spring".into(), now(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(!runner.is_in_flight(&"spring".into()));
    }

    #[tokio::test]
    async fn unknown_campaign_is_reported() {
        let runner = runner(Arc::new(MemoryEventStore::new()));

        let err = runner
            .run_cycle(&"missing".into(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::CampaignNotFound(_)));
    }

    #[tokio::test]
    async fn zero_budget_fails_the_cycle_without_writing_allocations() {
        let store = seeded_store(0.0).await;
        let runner = runner(store.clone());

        let err = runner
            .run_cycle(&"spring".into(), now())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(store.open_alerts(&"spring".into()).await.unwrap().is_empty());
        assert!(
            store
                .allocation_history(&"spring".into(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn budget_override_replaces_stored_budget() {
        let store = seeded_store(0.0).await;
        let mut config = EngineConfig::default();
        config.campaigns.insert(
            "spring".to_string(),
            crate::config::CampaignOverride {
                total_budget: Some(120.0),
                ..Default::default()
            },
        );
        let runner = CycleRunner::new(store, config);

        let report = runner.run_cycle(&"spring".into(), now()).await.unwrap();

        let total: Money = report.allocations.iter().map(|a| a.recommended_budget).sum();
        assert!(total <= 120.0 + 1e-9);
    }

    #[tokio::test]
    async fn winner_is_auto_completed_when_enabled() {
        let store = seeded_store(300.0).await;
        store
            .upsert_test(&ExperimentTest::new("t1", "spring", "Headline", now()))
            .await
            .unwrap();
        for (id, is_control, conversions) in [("a", true, 50), ("b", false, 70)] {
            store
                .upsert_variant(&ExperimentVariant {
                    id: id.into(),
                    test_id: "t1".into(),
                    name: id.to_string(),
                    is_control,
                    visitors: 1000,
                    conversions,
                })
                .await
                .unwrap();
        }
        let mut config = EngineConfig::default();
        config.experiment.auto_complete_on_winner = true;
        let runner = CycleRunner::new(store.clone(), config);

        let first = runner.run_cycle(&"spring".into(), now()).await.unwrap();
        let second = runner.run_cycle(&"spring".into(), now()).await.unwrap();

        assert_eq!(first.stopped_tests, vec![TestId::from("t1")]);
        assert!(second.experiments.is_empty());
        let test = store.get_test(&"t1".into()).await.unwrap().unwrap();
        assert!(!test.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_call_times_out() {
        let runner = runner(Arc::new(MemoryEventStore::new()));

        let err = runner
            .call("stalled_write", std::future::pending::<storage::Result<()>>())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::DataUnavailable(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reads_are_retried() {
        let runner = runner(Arc::new(MemoryEventStore::new()));
        let calls = AtomicU32::new(0);

        let value = runner
            .read("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(storage::Error::InvalidData("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_give_up_after_configured_attempts() {
        let runner = runner(Arc::new(MemoryEventStore::new()));
        let calls = AtomicU32::new(0);

        let result: Result<()> = runner
            .read("down", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(storage::Error::InvalidData("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::DataUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
