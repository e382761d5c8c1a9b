//! Table-driven checks of the component invariants

use chrono::{DateTime, Duration, TimeZone, Utc};

use campaign_engine::{
    AllocationStatus, AttributionModel, BudgetConfig, BudgetOptimizer, ChannelAggregate,
    ClickEvent, ExperimentConfig, ExperimentEvaluator, ExperimentTest, ExperimentVariant,
    FraudConfig, FraudDetector, Money, Severity, attribute,
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 2, 12, 0, 0).unwrap()
}

fn row(channel: &str, clicks: u64, revenue: Money, spend: Money) -> ChannelAggregate {
    ChannelAggregate {
        channel_id: channel.into(),
        campaign_id: "spring".into(),
        period_start: now() - Duration::hours(12),
        period_end: now() + Duration::hours(12),
        clicks,
        conversions: 0,
        revenue,
        spend,
    }
}

fn clicks_from(ip: &str, n: u64) -> Vec<ClickEvent> {
    (0..n)
        .map(|i| ClickEvent {
            id: format!("{ip}-{i}").into(),
            link_id: "l1".into(),
            timestamp: now(),
            ip_address: ip.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            referrer_source: None,
            device_type: None,
            country: None,
            converted: false,
        })
        .collect()
}

#[test]
fn one_alert_per_flagged_ip_with_critical_above_one_hundred() {
    let detector = FraudDetector::new(&FraudConfig::default());

    for count in [49, 50, 51, 99, 100, 101, 150] {
        let report = detector.detect(&"spring".into(), &clicks_from("192.0.2.1", count), now());

        if count < 50 {
            assert!(report.alerts.is_empty(), "{count} clicks should not be flagged");
            continue;
        }
        assert_eq!(report.alerts.len(), 1, "{count} clicks");
        let expected = if count > 100 {
            Severity::Critical
        } else {
            Severity::High
        };
        assert_eq!(report.alerts[0].severity, expected, "{count} clicks");
        assert!((report.alerts[0].estimated_loss - count as f64 * 0.5).abs() < 1e-9);
    }
}

#[test]
fn attribution_weights_follow_click_and_revenue_shares() {
    let rows = vec![row("a", 60, 40.0, 10.0), row("b", 40, 60.0, 10.0)];

    let cases = [
        (AttributionModel::Linear, 0.6),
        (AttributionModel::LastTouch, 0.4),
        (AttributionModel::FirstTouch, 0.48),
    ];
    for (model, expected) in cases {
        let report = attribute(&rows, model);
        let a = report
            .results
            .iter()
            .find(|r| r.channel_id.as_str() == "a")
            .unwrap();
        assert!(
            (a.credit_share - expected).abs() < 1e-9,
            "{}: {} != {expected}",
            model.as_str(),
            a.credit_share
        );
    }
}

#[test]
fn weighted_split_sums_to_total_with_positive_weights() {
    let optimizer = BudgetOptimizer::new(&BudgetConfig::default());

    for n in 1..=8 {
        let rows: Vec<ChannelAggregate> = (0..n)
            .map(|i| row(&format!("ch{i}"), 10, 10.0 * f64::from(i + 1), 5.0))
            .collect();

        let split = optimizer.weighted_split(&rows, &[], 1000.0);

        assert_eq!(split.len(), n as usize);
        assert!(split.iter().all(|a| a.weight >= 1));
        let total: Money = split.iter().map(|a| a.recommended_budget).sum();
        assert!((total - 1000.0).abs() < 1e-6, "n = {n}: total {total}");
        assert!(
            split
                .windows(2)
                .all(|w| w[0].recommended_budget >= w[1].recommended_budget)
        );
    }
}

#[test]
fn losing_channel_with_spend_is_paused() {
    let optimizer = BudgetOptimizer::new(&BudgetConfig::default());

    for (spend, revenue) in [(60.0, 20.0), (51.0, 0.0), (500.0, 100.0)] {
        let rows = vec![row("loser", 10, revenue, spend), row("winner", 10, 300.0, 100.0)];

        let allocations = optimizer.optimize(&rows, &[], 400.0).unwrap();

        let loser = allocations
            .iter()
            .find(|a| a.channel_id.as_str() == "loser")
            .unwrap();
        assert_eq!(loser.status, AllocationStatus::Paused);
        assert_eq!(loser.recommended_budget, 0.0);
        let total: Money = allocations.iter().map(|a| a.recommended_budget).sum();
        assert!(total <= 400.0 + 1e-9);
    }
}

#[test]
fn significance_decides_winner() {
    let evaluator = ExperimentEvaluator::new(&ExperimentConfig::default());
    let test = ExperimentTest::new("t1", "spring", "Headline", now());

    let cases = [(70, true), (52, false)];
    for (variant_conversions, has_winner) in cases {
        let variants = vec![
            ExperimentVariant {
                id: "control".into(),
                test_id: "t1".into(),
                name: "Control".to_string(),
                is_control: true,
                visitors: 1000,
                conversions: 50,
            },
            ExperimentVariant {
                id: "variant".into(),
                test_id: "t1".into(),
                name: "Variant".to_string(),
                is_control: false,
                visitors: 1000,
                conversions: variant_conversions,
            },
        ];

        let result = evaluator.evaluate(&test, &variants);

        assert_eq!(result.winner.is_some(), has_winner, "1000/{variant_conversions}");
        if has_winner {
            assert!(result.confidence > 90.0);
            assert_eq!(result.winner.as_ref().map(|w| w.as_str()), Some("variant"));
        } else {
            assert!(result.confidence < 90.0);
        }
    }
}

#[test]
fn aggregation_is_deterministic() {
    use campaign_engine::{Aggregator, TimeRange, TrackedLink};

    let links = vec![TrackedLink {
        id: "l1".into(),
        campaign_id: "spring".into(),
        channel_id: "search".into(),
    }];
    let aggregator = Aggregator::new("spring".into(), &links, &[]);
    let clicks = clicks_from("192.0.2.9", 25);
    let window = TimeRange::trailing_days(now() + Duration::hours(1), 7);

    let first = aggregator.aggregate(&clicks, &[], window);
    let second = aggregator.aggregate(&clicks, &[], window);

    assert_eq!(first, second);
    assert_eq!(first.aggregates[0].clicks, 25);
}
