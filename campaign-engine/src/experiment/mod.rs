//! A/B test records and significance evaluation.

mod evaluator;
mod manager;
mod types;

pub use evaluator::{
    ConfidenceMethod, ExperimentEvaluator, ExperimentResult, StoppedTest, VariantStats,
};
pub use manager::ExperimentManager;
pub use types::{ExperimentTest, ExperimentVariant, TestStatus};
