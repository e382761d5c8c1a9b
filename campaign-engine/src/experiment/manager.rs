//! A/B test lifecycle against the event store.
//!
//! [`ExperimentManager`] pairs writes (counters, completion) with reads
//! (tests, variants, evaluation). Every write is conditional on the test
//! still running, so a completed test stays frozen even under concurrent
//! writers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    ExperimentEvaluator, ExperimentResult, ExperimentTest, ExperimentVariant, StoppedTest,
};
use crate::config::ExperimentConfig;
use crate::error::{EngineError, Result};
use crate::storage::{self, EventStore};
use crate::types::{CampaignId, TestId, VariantId};

/// Manages A/B tests stored in an [`EventStore`].
pub struct ExperimentManager {
    store: Arc<dyn EventStore>,
    evaluator: ExperimentEvaluator,
}

impl ExperimentManager {
    /// Create a new experiment manager.
    pub fn new(store: Arc<dyn EventStore>, config: &ExperimentConfig) -> Self {
        Self {
            store,
            evaluator: ExperimentEvaluator::new(config),
        }
    }

    // === Commands ===

    /// Register a test and its variants.
    pub async fn create_test(
        &self,
        test: &ExperimentTest,
        variants: &[ExperimentVariant],
    ) -> Result<()> {
        if variants.iter().filter(|v| v.is_control).count() != 1 {
            return Err(EngineError::Configuration(format!(
                "test {} needs exactly one control variant",
                test.id
            )));
        }
        self.store.upsert_test(test).await?;
        for variant in variants {
            self.store.upsert_variant(variant).await?;
        }
        debug!(test_id = %test.id, variants = variants.len(), "test registered");
        Ok(())
    }

    /// Count one visitor on a variant.
    ///
    /// Fails with `TestNotRunning` once the test is completed.
    pub async fn record_visit(&self, test_id: &TestId, variant_id: &VariantId) -> Result<()> {
        self.increment(test_id, variant_id, 1, 0).await
    }

    /// Count one conversion on a variant.
    ///
    /// Fails with `TestNotRunning` once the test is completed.
    pub async fn record_conversion(&self, test_id: &TestId, variant_id: &VariantId) -> Result<()> {
        self.increment(test_id, variant_id, 0, 1).await
    }

    async fn increment(
        &self,
        test_id: &TestId,
        variant_id: &VariantId,
        visitors: u64,
        conversions: u64,
    ) -> Result<()> {
        let test = self.require_test(test_id).await?;
        if !test.is_running() {
            return Err(EngineError::TestNotRunning(test.id));
        }

        if self
            .store
            .increment_variant(test_id, variant_id, visitors, conversions)
            .await?
        {
            return Ok(());
        }

        // The variant is unknown, belongs to another test, or the test
        // completed in between.
        let test = self.require_test(test_id).await?;
        if !test.is_running() {
            return Err(EngineError::TestNotRunning(test.id));
        }
        Err(storage::Error::NotFound(format!("variant {variant_id} in test {test_id}")).into())
    }

    /// Evaluate and complete a running test.
    ///
    /// Fails with `TestNotRunning` if the test is already completed, and with
    /// `ConcurrentModification` if another writer completed it first.
    pub async fn stop_test(&self, test_id: &TestId, now: DateTime<Utc>) -> Result<StoppedTest> {
        let test = self.require_test(test_id).await?;
        let variants = self.store.variants_for_test(test_id).await?;

        let stopped = self.evaluator.stop(&test, &variants, now)?;
        if !self.store.complete_test(&stopped.test).await? {
            return Err(EngineError::ConcurrentModification(format!(
                "test {test_id} was completed by another writer"
            )));
        }

        info!(
            test_id = %test_id,
            winner = ?stopped.result.winner,
            confidence = stopped.result.confidence,
            "test stopped"
        );
        Ok(stopped)
    }

    // === Queries ===

    /// Get a test by ID.
    pub async fn get_test(&self, test_id: &TestId) -> Result<Option<ExperimentTest>> {
        Ok(self.store.get_test(test_id).await?)
    }

    /// Tests of a campaign.
    pub async fn tests_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<ExperimentTest>> {
        Ok(self.store.tests_for_campaign(campaign_id).await?)
    }

    /// Current significance of a test without changing it.
    pub async fn evaluate(&self, test_id: &TestId) -> Result<ExperimentResult> {
        let test = self.require_test(test_id).await?;
        let variants = self.store.variants_for_test(test_id).await?;
        Ok(self.evaluator.evaluate(&test, &variants))
    }

    async fn require_test(&self, test_id: &TestId) -> Result<ExperimentTest> {
        self.store
            .get_test(test_id)
            .await?
            .ok_or_else(|| storage::Error::NotFound(format!("test {test_id}")).into())
    }
}
