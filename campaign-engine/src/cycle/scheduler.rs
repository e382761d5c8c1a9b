//! Polling loop that runs a cycle per campaign on each interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{CycleReport, CycleRunner};
use crate::error::{EngineError, Result};
use crate::types::CampaignId;

/// Floor for every polling interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// How one scheduled cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The cycle ran to completion
    Completed(Box<CycleReport>),
    /// A cycle for the campaign was still in flight
    Skipped,
    /// The cycle did not finish within one interval
    TimedOut,
    /// Shutdown was requested mid-cycle
    Cancelled,
    /// The cycle failed; other campaigns are unaffected
    Failed(EngineError),
}

impl CycleOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

impl From<Result<CycleReport>> for CycleOutcome {
    fn from(result: Result<CycleReport>) -> Self {
        match result {
            Ok(report) => Self::Completed(Box::new(report)),
            Err(EngineError::ConcurrentModification(_)) => Self::Skipped,
            Err(EngineError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Runs cycles for every campaign in the store on its polling interval.
pub struct Scheduler {
    runner: Arc<CycleRunner>,
}

impl Scheduler {
    pub fn new(runner: Arc<CycleRunner>) -> Self {
        Self { runner }
    }

    /// Polling interval of a campaign, after overrides.
    pub fn interval_for(&self, campaign_id: &CampaignId) -> Duration {
        let config = self.runner.config();
        config
            .override_for(campaign_id)
            .and_then(|o| o.poll_interval_secs)
            .filter(|secs| *secs > 0)
            .map_or_else(|| config.scheduler.poll_interval(), Duration::from_secs)
            .max(MIN_INTERVAL)
    }

    /// Shortest configured interval; the loop ticks at this period.
    fn tick_period(&self) -> Duration {
        let config = self.runner.config();
        config
            .campaigns
            .values()
            .filter_map(|o| o.poll_interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .fold(config.scheduler.poll_interval(), Duration::min)
            .max(MIN_INTERVAL)
    }

    /// Run one cycle for every campaign that is due and wait for all of them.
    ///
    /// Cycles run in parallel. Each is bounded by its campaign's interval and
    /// cancelled with `shutdown`. Outcomes are ordered by campaign id.
    pub async fn tick(
        &self,
        next_due: &mut HashMap<CampaignId, Instant>,
        shutdown: &CancellationToken,
    ) -> Vec<(CampaignId, CycleOutcome)> {
        let campaigns = match self.runner.list_campaigns().await {
            Ok(campaigns) => campaigns,
            Err(e) => {
                warn!(error = %e, "could not list campaigns, skipping tick");
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut tasks = JoinSet::new();
        for campaign in campaigns {
            if next_due.get(&campaign.id).is_some_and(|due| *due > now) {
                continue;
            }
            let interval = self.interval_for(&campaign.id);
            next_due.insert(campaign.id.clone(), now + interval);

            let runner = Arc::clone(&self.runner);
            let token = shutdown.child_token();
            tasks.spawn(async move {
                let cycle = runner.run_cycle_until(&campaign.id, Utc::now(), &token);
                let outcome = match tokio::time::timeout(interval, cycle).await {
                    Ok(result) => CycleOutcome::from(result),
                    Err(_) => CycleOutcome::TimedOut,
                };
                (campaign.id, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "cycle task failed to join"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Poll until `shutdown` is cancelled, handing every outcome to `observe`.
    pub async fn run<F>(&self, shutdown: CancellationToken, mut observe: F)
    where
        F: FnMut(&CampaignId, &CycleOutcome),
    {
        let period = self.tick_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut next_due = HashMap::new();

        info!(period_secs = period.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("scheduler received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    for (campaign_id, outcome) in self.tick(&mut next_due, &shutdown).await {
                        log_outcome(&campaign_id, &outcome);
                        observe(&campaign_id, &outcome);
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}

fn log_outcome(campaign_id: &CampaignId, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Completed(report) if report.is_degraded() => warn!(
            campaign_id = %campaign_id,
            warnings = report.warnings.len(),
            "cycle completed degraded"
        ),
        CycleOutcome::Completed(_) => info!(campaign_id = %campaign_id, "cycle completed"),
        CycleOutcome::Skipped => {
            warn!(campaign_id = %campaign_id, "previous cycle still running, skipped")
        }
        CycleOutcome::TimedOut => {
            warn!(campaign_id = %campaign_id, "cycle exceeded its interval, retrying next tick")
        }
        CycleOutcome::Cancelled => info!(campaign_id = %campaign_id, "cycle cancelled"),
        CycleOutcome::Failed(e) => error!(campaign_id = %campaign_id, error = %e, "cycle failed"),
    }
}
