//! End-to-end cycle over a libSQL store
//!
//! Two channels, one noisy IP and a $200 budget: the cycle should produce one
//! aggregate row per channel, a single high-severity alert, and rank the
//! better channel first with the larger share.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use campaign_engine::{
    AllocationStatus, Campaign, ChannelBudget, ClickEvent, ConversionEvent, CycleRunner,
    EngineConfig, EventStore, IngestRecord, Money, Severity, SpendRecord, TrackedLink,
    TursoEventStore,
};

const SUSPICIOUS_IP: &str = "203.0.113.66";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap()
}

fn day_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap()
}

fn click(i: usize, link: &str, ip: String) -> ClickEvent {
    ClickEvent {
        id: format!("click-{i}").into(),
        link_id: link.into(),
        timestamp: day_start() + Duration::minutes(i as i64 * 2),
        ip_address: ip,
        user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
        referrer_source: Some("newsletter".to_string()),
        device_type: Some("desktop".to_string()),
        country: Some("US".to_string()),
        converted: false,
    }
}

fn conversion(i: usize, link: &str, channel: &str) -> ConversionEvent {
    ConversionEvent {
        id: format!("conv-{i}").into(),
        link_id: link.into(),
        channel_id: channel.into(),
        timestamp: Utc.with_ymd_and_hms(2025, 6, 10, 11, 0, 0).unwrap() + Duration::minutes(i as i64),
        sale_amount: 50.0,
        commission_amount: 5.0,
    }
}

/// Metadata, spend, 200 clicks and 10 conversions as an ingestion feed.
fn feed() -> Vec<IngestRecord> {
    let mut records = vec![IngestRecord::Campaign(Campaign {
        id: "launch".into(),
        name: "Product launch".to_string(),
        total_budget: 200.0,
        starts_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ends_at: Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap(),
    })];

    for (link, channel) in [("l-search", "search"), ("l-social", "social")] {
        records.push(IngestRecord::Link(TrackedLink {
            id: link.into(),
            campaign_id: "launch".into(),
            channel_id: channel.into(),
        }));
        records.push(IngestRecord::ChannelBudget(ChannelBudget {
            campaign_id: "launch".into(),
            channel_id: channel.into(),
            daily_budget: 20.0,
        }));
        records.push(IngestRecord::Spend(SpendRecord {
            campaign_id: "launch".into(),
            channel_id: channel.into(),
            day: NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
            amount: 50.0,
        }));
    }

    // 150 ordinary clicks, one per IP
    for i in 0..150 {
        let link = if i < 100 { "l-search" } else { "l-social" };
        records.push(IngestRecord::Click(click(
            i,
            link,
            format!("10.0.{}.{}", i / 200, i % 200 + 1),
        )));
    }
    // 50 clicks from a single IP
    for i in 150..200 {
        records.push(IngestRecord::Click(click(i, "l-social", SUSPICIOUS_IP.to_string())));
    }

    // $400 on search, $100 on social
    for i in 0..10 {
        let (link, channel) = if i < 8 {
            ("l-search", "search")
        } else {
            ("l-social", "social")
        };
        records.push(IngestRecord::Conversion(conversion(i, link, channel)));
    }
    records
}

async fn seeded_store() -> Arc<TursoEventStore> {
    let store = Arc::new(TursoEventStore::new_memory().await.unwrap());
    for record in feed() {
        store.ingest(&record).await.unwrap();
    }
    store
}

#[tokio::test]
async fn cycle_ranks_channels_and_flags_noisy_ip() {
    let store = seeded_store().await;
    let runner = CycleRunner::new(store.clone(), EngineConfig::default());

    let report = runner.run_cycle(&"launch".into(), now()).await.unwrap();

    // One row per channel for the single active day
    assert_eq!(report.aggregates.len(), 2);
    let clicks: u64 = report.aggregates.iter().map(|a| a.clicks).sum();
    let revenue: Money = report.aggregates.iter().map(|a| a.revenue).sum();
    let spend: Money = report.aggregates.iter().map(|a| a.spend).sum();
    assert_eq!(clicks, 200);
    assert!((revenue - 500.0).abs() < 1e-9);
    assert!((spend - 100.0).abs() < 1e-9);
    assert_eq!(report.skipped, 0);

    // Exactly the noisy IP is flagged
    assert_eq!(report.fraud.alerts.len(), 1);
    let alert = &report.fraud.alerts[0];
    assert_eq!(alert.source_key, SUSPICIOUS_IP);
    assert_eq!(alert.severity, Severity::High);
    assert_eq!(alert.click_count, 50);
    assert!((alert.estimated_loss - 25.0).abs() < 1e-9);

    // Search (ROI 7.0) outranks social (ROI 1.0)
    assert_eq!(report.allocations.len(), 2);
    let first = &report.allocations[0];
    let second = &report.allocations[1];
    assert_eq!(first.channel_id.as_str(), "search");
    assert_eq!(first.rank, 1);
    assert!(first.recommended_budget > second.recommended_budget);
    assert!(report.allocations.iter().all(|a| a.status != AllocationStatus::Paused));
    let total: Money = report.allocations.iter().map(|a| a.recommended_budget).sum();
    assert!(total <= 200.0 + 1e-9);

    // Each conversion converts one click
    assert_eq!(report.converted_clicks, 10);
    let history = store.allocation_history(&"launch".into(), 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].allocations, report.allocations);
}

#[tokio::test]
async fn reingest_and_rerun_are_idempotent() {
    let store = seeded_store().await;
    for record in feed() {
        store.ingest(&record).await.unwrap();
    }
    let runner = CycleRunner::new(store.clone(), EngineConfig::default());

    let first = runner.run_cycle(&"launch".into(), now()).await.unwrap();
    let second = runner.run_cycle(&"launch".into(), now()).await.unwrap();

    assert_eq!(first.aggregates, second.aggregates);
    assert_eq!(second.converted_clicks, 0);
    assert_eq!(first.fraud.alerts[0].id, second.fraud.alerts[0].id);

    let alerts = store.list_alerts(&"launch".into()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    let history = store.allocation_history(&"launch".into(), 5).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].created_at >= history[1].created_at);
}

#[tokio::test]
async fn resolved_alert_is_reopened_by_new_detection() {
    let store = seeded_store().await;
    let runner = CycleRunner::new(store.clone(), EngineConfig::default());

    let first = runner.run_cycle(&"launch".into(), now()).await.unwrap();
    assert!(store.resolve_alert(first.fraud.alerts[0].id).await.unwrap());
    let second = runner.run_cycle(&"launch".into(), now()).await.unwrap();

    assert_ne!(first.fraud.alerts[0].id, second.fraud.alerts[0].id);
    assert_eq!(store.list_alerts(&"launch".into()).await.unwrap().len(), 2);
    assert_eq!(store.open_alerts(&"launch".into()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn insights_lead_with_highest_impact() {
    let store = seeded_store().await;
    let runner = CycleRunner::new(store, EngineConfig::default());

    let report = runner.run_cycle(&"launch".into(), now()).await.unwrap();

    assert!(!report.insights.is_empty());
    assert!(report.insights.len() <= 5);
    assert!(
        report
            .insights
            .windows(2)
            .all(|w| w[0].impact_score >= w[1].impact_score)
    );
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"block_source\""));
}
