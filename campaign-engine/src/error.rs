//! Error types for campaign-engine

use thiserror::Error;

use crate::types::{CampaignId, TestId};

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store unreachable or timed out after retries
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// Not enough data to produce a meaningful result
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Missing budget, invalid threshold, etc.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another cycle or writer already holds this campaign or record
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Variant counters or completion were attempted on a completed test
    #[error("Test {0} is not running")]
    TestNotRunning(TestId),

    /// Campaign not known to the store
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// The cycle was cancelled before completion
    #[error("Cycle cancelled")]
    Cancelled,

    /// Underlying storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::Error),
}

impl EngineError {
    /// Whether the error may clear up on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DataUnavailable(_) | Self::Storage(_))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
