//! Statistical significance of A/B tests.
//!
//! Each non-control variant is compared to the control with a two-proportion
//! z-test on the pooled conversion rate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{ExperimentTest, ExperimentVariant};
use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::types::{TestId, VariantId};

/// Upper bound on any reported confidence percentage.
const MAX_CONFIDENCE: f64 = 99.0;

/// How a z-score is turned into a confidence percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMethod {
    /// Two-sided normal confidence, `1 - 2(1 - Phi(|z|))`
    #[default]
    NormalCdf,
    /// `1 - 1 / (1 + |z|)`
    Reciprocal,
}

impl ConfidenceMethod {
    /// Confidence percentage for `z`, clamped to `[0, 99]`.
    #[must_use]
    pub fn confidence(&self, z: f64) -> f64 {
        let z = z.abs();
        let raw = match self {
            Self::NormalCdf => 1.0 - 2.0 * (1.0 - normal_cdf(z)),
            Self::Reciprocal => 1.0 - 1.0 / (1.0 + z),
        };
        (raw * 100.0).clamp(0.0, MAX_CONFIDENCE)
    }
}

/// Standard normal CDF (Abramowitz & Stegun 26.2.17).
fn normal_cdf(x: f64) -> f64 {
    if x < 0.0 {
        return 1.0 - normal_cdf(-x);
    }
    let t = 1.0 / (1.0 + 0.2316419 * x);
    let d = 0.3989423 * (-x * x / 2.0).exp();
    let tail = d
        * t
        * (0.3193815
            + t * (-0.3565638 + t * (1.781478 + t * (-1.821256 + t * 1.330274))));
    1.0 - tail
}

/// Comparison of one variant against the control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant_id: VariantId,
    pub is_control: bool,
    pub visitors: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    /// Relative improvement over the control's conversion rate.
    pub lift: f64,
    pub z_score: f64,
    pub confidence: f64,
    /// Confidence above the threshold.
    pub significant: bool,
}

/// Evaluation of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub test_id: TestId,
    pub winner: Option<VariantId>,
    /// Winner's confidence, or the best variant confidence without a winner.
    pub confidence: f64,
    pub variants: Vec<VariantStats>,
    pub message: String,
    /// No control, or a control without visitors.
    pub insufficient_data: bool,
}

impl ExperimentResult {
    /// Stats of the declared winner.
    pub fn winner_stats(&self) -> Option<&VariantStats> {
        let winner = self.winner.as_ref()?;
        self.variants.iter().find(|v| &v.variant_id == winner)
    }
}

/// A test after it was stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppedTest {
    pub test: ExperimentTest,
    pub result: ExperimentResult,
    pub recommendations: Vec<String>,
}

/// Evaluates A/B tests against a confidence threshold.
#[derive(Debug, Clone)]
pub struct ExperimentEvaluator {
    threshold: f64,
    method: ConfidenceMethod,
}

impl ExperimentEvaluator {
    pub fn new(config: &ExperimentConfig) -> Self {
        Self {
            threshold: config.confidence_threshold,
            method: config.confidence_method,
        }
    }

    /// Compare every variant with visitors against the control.
    ///
    /// Without a control that has visitors the result has confidence 0 and no
    /// winner. A winner needs positive lift and confidence above the
    /// threshold; among those the highest lift wins.
    pub fn evaluate(
        &self,
        test: &ExperimentTest,
        variants: &[ExperimentVariant],
    ) -> ExperimentResult {
        let Some(control) = variants
            .iter()
            .find(|v| v.is_control && v.test_id == test.id)
            .filter(|c| c.visitors > 0)
        else {
            return ExperimentResult {
                test_id: test.id.clone(),
                winner: None,
                confidence: 0.0,
                variants: Vec::new(),
                message: "Control variant has no visitors yet".to_string(),
                insufficient_data: true,
            };
        };

        let p1 = control.conversion_rate();
        let mut stats = vec![VariantStats {
            variant_id: control.id.clone(),
            is_control: true,
            visitors: control.visitors,
            conversions: control.conversions,
            conversion_rate: p1,
            lift: 0.0,
            z_score: 0.0,
            confidence: 0.0,
            significant: false,
        }];

        for variant in variants
            .iter()
            .filter(|v| !v.is_control && v.test_id == test.id && v.visitors > 0)
        {
            let p2 = variant.conversion_rate();
            let n1 = control.visitors as f64;
            let n2 = variant.visitors as f64;
            let pooled = (control.conversions + variant.conversions) as f64 / (n1 + n2);
            let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
            let (z_score, confidence) = if se > 0.0 {
                let z = (p2 - p1) / se;
                (z, self.method.confidence(z))
            } else {
                (0.0, 0.0)
            };
            let lift = if p1 > 0.0 { (p2 - p1) / p1 } else { p2 - p1 };

            stats.push(VariantStats {
                variant_id: variant.id.clone(),
                is_control: false,
                visitors: variant.visitors,
                conversions: variant.conversions,
                conversion_rate: p2,
                lift,
                z_score,
                confidence,
                significant: confidence > self.threshold,
            });
        }

        let winner = stats
            .iter()
            .filter(|s| !s.is_control && s.lift > 0.0 && s.significant)
            .fold(None::<&VariantStats>, |best, s| match best {
                Some(b) if b.lift >= s.lift => Some(b),
                _ => Some(s),
            });

        let (winner, confidence, message) = match winner {
            Some(w) => (
                Some(w.variant_id.clone()),
                w.confidence,
                format!(
                    "Variant {} wins with {:.1}% lift at {:.1}% confidence",
                    w.variant_id,
                    w.lift * 100.0,
                    w.confidence
                ),
            ),
            None => (
                None,
                stats
                    .iter()
                    .filter(|s| !s.is_control)
                    .map(|s| s.confidence)
                    .fold(0.0, f64::max),
                "No significant winner".to_string(),
            ),
        };

        debug!(
            test_id = %test.id,
            variants = stats.len(),
            winner = winner.as_ref().map(VariantId::as_str),
            confidence,
            "experiment evaluated"
        );

        ExperimentResult {
            test_id: test.id.clone(),
            winner,
            confidence,
            variants: stats,
            message,
            insufficient_data: false,
        }
    }

    /// Evaluate and complete a running test.
    ///
    /// Fails with `TestNotRunning` if the test was already completed.
    pub fn stop(
        &self,
        test: &ExperimentTest,
        variants: &[ExperimentVariant],
        now: DateTime<Utc>,
    ) -> Result<StoppedTest> {
        let result = self.evaluate(test, variants);
        let mut completed = test.clone();
        completed.complete(result.winner.clone(), now)?;

        let recommendations = match &result.winner {
            Some(winner) => vec![
                format!("Roll out variant {winner} to all traffic"),
                "Retire the control experience".to_string(),
                format!("Plan a follow-up test that builds on variant {winner}"),
            ],
            None => vec![
                result.message.clone(),
                "Keep the control experience".to_string(),
                "Test a bolder change or run longer to gather more visitors".to_string(),
            ],
        };

        Ok(StoppedTest {
            test: completed,
            result,
            recommendations,
        })
    }
}
