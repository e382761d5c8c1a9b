//! Campaign performance and optimization engine.
//!
//! Turns raw click and conversion events into per-channel aggregates, flags
//! fraudulent traffic, attributes conversion credit, reallocates budget and
//! evaluates A/B tests.
//!
//! # Architecture
//!
//! - **Components** are pure functions over a snapshot: [`Aggregator`],
//!   [`FraudDetector`], [`attribute`], [`BudgetOptimizer`], [`pace`],
//!   [`ExperimentEvaluator`] and [`InsightSynthesizer`]
//! - **Storage** ([`EventStore`]) holds events, campaign metadata and the
//!   derived records, written with upsert and compare-and-set semantics
//! - **Cycles** ([`CycleRunner`], [`Scheduler`]) read a snapshot, run the
//!   components in order and persist the results, at most one cycle per
//!   campaign at a time

mod aggregator;
mod attribution;
mod budget;
mod campaign;
mod config;
mod cycle;
mod error;
mod events;
mod experiment;
mod fraud;
mod insights;
pub mod storage;
mod types;

// Aggregation
pub use aggregator::{
    Aggregation, Aggregator, ChannelAggregate, ChannelTotals, commission_for, match_conversions,
    rollup,
};

// Attribution
pub use attribution::{
    AttributionModel, AttributionReport, AttributionResult, attribute, attribute_all, renormalize,
};

// Budget
pub use budget::{
    AllocationSnapshot, AllocationStatus, BudgetAllocation, BudgetOptimizer, PacingReport,
    PacingStatus, pace, pace_campaign, roi,
};

// Campaign metadata
pub use campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};

// Configuration
pub use config::{
    AttributionConfig, BudgetConfig, CampaignOverride, DEFAULT_BOT_SIGNATURES, EngineConfig,
    ExperimentConfig, FraudConfig, InsightConfig, SchedulerConfig,
};

// Cycles
pub use cycle::{
    CycleOutcome, CycleReport, CycleRunner, CycleSnapshot, CycleWarning, Scheduler, WarningKind,
};

// Errors
pub use error::{EngineError, Result};

// Events
pub use events::{ClickEvent, CommissionRecord, CommissionStatus, ConversionEvent, IngestRecord};

// Experiments
pub use experiment::{
    ConfidenceMethod, ExperimentEvaluator, ExperimentManager, ExperimentResult, ExperimentTest,
    ExperimentVariant, StoppedTest, TestStatus, VariantStats,
};

// Fraud
pub use fraud::{AlertUpsert, BotTraffic, FraudAlert, FraudDetector, FraudReport, Severity, reconcile};

// Insights
pub use insights::{Insight, InsightAction, InsightInputs, InsightSynthesizer};

// ID and shared types
pub use types::{
    AlertId, CampaignId, ChannelId, ClickId, ConversionId, CycleId, LinkId, Money, TestId,
    TimeRange, VariantId, day_bounds,
};

// Storage traits (re-export from storage module)
pub use storage::{EventStore, MemoryEventStore, TursoEventStore};
