//! Rolls raw events into per-channel, per-day counters.
//!
//! Aggregation is a full recomputation over a window, so re-running it after
//! late events arrive simply yields the corrected rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::campaign::{SpendRecord, TrackedLink};
use crate::events::{ClickEvent, CommissionRecord, ConversionEvent};
use crate::types::{CampaignId, ChannelId, ClickId, LinkId, Money, TimeRange, day_bounds};

/// Counters for one channel over one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAggregate {
    pub channel_id: ChannelId,
    pub campaign_id: CampaignId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: Money,
    pub spend: Money,
}

/// Aggregates plus the number of events that could not be placed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub aggregates: Vec<ChannelAggregate>,
    /// Events skipped for missing channel metadata.
    pub skipped: u64,
}

/// Per-channel sums across all periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelTotals {
    pub channel_id: ChannelId,
    pub clicks: u64,
    pub conversions: u64,
    pub revenue: Money,
    pub spend: Money,
}

#[derive(Debug, Default)]
struct Counters {
    clicks: u64,
    conversions: u64,
    revenue: Money,
    spend: Money,
}

/// Aggregates events for a single campaign.
///
/// Links and spend records are the metadata the events are joined against.
pub struct Aggregator<'a> {
    campaign_id: CampaignId,
    links: HashMap<&'a LinkId, &'a ChannelId>,
    spend: Vec<&'a SpendRecord>,
}

impl<'a> Aggregator<'a> {
    /// Build an aggregator from the campaign's link and spend metadata.
    ///
    /// Links and spend belonging to other campaigns are ignored.
    pub fn new(campaign_id: CampaignId, links: &'a [TrackedLink], spend: &'a [SpendRecord]) -> Self {
        let links = links
            .iter()
            .filter(|l| l.campaign_id == campaign_id)
            .map(|l| (&l.id, &l.channel_id))
            .collect();
        let spend = spend
            .iter()
            .filter(|s| s.campaign_id == campaign_id)
            .collect();
        Self {
            campaign_id,
            links,
            spend,
        }
    }

    /// Channel of a link, if the link belongs to this campaign.
    pub fn channel_for(&self, link_id: &LinkId) -> Option<&ChannelId> {
        self.links.get(link_id).copied()
    }

    /// Group clicks, conversions and spend into `(channel, day)` rows.
    ///
    /// Events outside `window` are ignored. Events whose link is unknown are
    /// skipped with a warning and counted. Rows are ordered by channel, then day.
    pub fn aggregate(
        &self,
        clicks: &[ClickEvent],
        conversions: &[ConversionEvent],
        window: TimeRange,
    ) -> Aggregation {
        let mut rows: BTreeMap<(ChannelId, NaiveDate), Counters> = BTreeMap::new();
        let mut skipped = 0u64;

        for click in clicks.iter().filter(|c| window.contains(c.timestamp)) {
            let Some(channel) = self.channel_for(&click.link_id) else {
                warn!(
                    campaign_id = %self.campaign_id,
                    click_id = %click.id,
                    link_id = %click.link_id,
                    "click has no channel metadata, skipping"
                );
                skipped += 1;
                continue;
            };
            rows.entry((channel.clone(), click.timestamp.date_naive()))
                .or_default()
                .clicks += 1;
        }

        for conversion in conversions.iter().filter(|c| window.contains(c.timestamp)) {
            let Some(channel) = self.channel_for(&conversion.link_id) else {
                warn!(
                    campaign_id = %self.campaign_id,
                    conversion_id = %conversion.id,
                    link_id = %conversion.link_id,
                    "conversion has no channel metadata, skipping"
                );
                skipped += 1;
                continue;
            };
            let row = rows
                .entry((channel.clone(), conversion.timestamp.date_naive()))
                .or_default();
            row.conversions += 1;
            row.revenue += conversion.sale_amount;
        }

        for record in self.spend.iter().filter(|s| window.overlaps_day(s.day)) {
            rows.entry((record.channel_id.clone(), record.day))
                .or_default()
                .spend += record.amount;
        }

        let aggregates: Vec<ChannelAggregate> = rows
            .into_iter()
            .map(|((channel_id, day), c)| {
                let (period_start, period_end) = day_bounds(day);
                ChannelAggregate {
                    channel_id,
                    campaign_id: self.campaign_id.clone(),
                    period_start,
                    period_end,
                    clicks: c.clicks,
                    conversions: c.conversions,
                    revenue: c.revenue,
                    spend: c.spend,
                }
            })
            .collect();

        debug!(
            campaign_id = %self.campaign_id,
            rows = aggregates.len(),
            skipped,
            "aggregation complete"
        );

        Aggregation {
            aggregates,
            skipped,
        }
    }
}

/// Sum aggregate rows per channel, ordered by channel id.
pub fn rollup(aggregates: &[ChannelAggregate]) -> Vec<ChannelTotals> {
    let mut totals: BTreeMap<&ChannelId, ChannelTotals> = BTreeMap::new();
    for row in aggregates {
        let entry = totals
            .entry(&row.channel_id)
            .or_insert_with(|| ChannelTotals {
                channel_id: row.channel_id.clone(),
                clicks: 0,
                conversions: 0,
                revenue: 0.0,
                spend: 0.0,
            });
        entry.clicks += row.clicks;
        entry.conversions += row.conversions;
        entry.revenue += row.revenue;
        entry.spend += row.spend;
    }
    totals.into_values().collect()
}

/// Pick the clicks that each conversion converts.
///
/// Conversions are taken in timestamp order. On each link, the oldest
/// conversions are treated as already matched by the link's converted clicks,
/// so re-running over the same events claims nothing new. Each remaining
/// conversion claims the most recent unconverted click on the same link at or
/// before it and no older than `attribution_window`. A click is claimed at
/// most once.
pub fn match_conversions(
    clicks: &[ClickEvent],
    conversions: &[ConversionEvent],
    attribution_window: Duration,
) -> Vec<ClickId> {
    let mut by_link: HashMap<&LinkId, Vec<&ClickEvent>> = HashMap::new();
    let mut already_matched: HashMap<&LinkId, usize> = HashMap::new();
    for click in clicks {
        if click.converted {
            *already_matched.entry(&click.link_id).or_default() += 1;
        } else {
            by_link.entry(&click.link_id).or_default().push(click);
        }
    }
    for candidates in by_link.values_mut() {
        candidates.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    }

    let mut ordered: Vec<&ConversionEvent> = conversions.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut claimed: HashSet<&ClickId> = HashSet::new();
    let mut matched = Vec::new();
    for conversion in ordered {
        if let Some(remaining) = already_matched.get_mut(&conversion.link_id)
            && *remaining > 0
        {
            *remaining -= 1;
            continue;
        }
        let Some(candidates) = by_link.get(&conversion.link_id) else {
            continue;
        };
        let earliest = conversion.timestamp - attribution_window;
        let hit = candidates
            .iter()
            .rev()
            .filter(|c| c.timestamp <= conversion.timestamp && c.timestamp >= earliest)
            .find(|c| !claimed.contains(&c.id));
        if let Some(click) = hit {
            claimed.insert(&click.id);
            matched.push(click.id.clone());
        }
    }
    matched
}

/// Pending commission owed for a conversion.
pub fn commission_for(conversion: &ConversionEvent) -> CommissionRecord {
    CommissionRecord::for_conversion(conversion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn links() -> Vec<TrackedLink> {
        vec![
            TrackedLink {
                id: LinkId::from("l-search"),
                campaign_id: CampaignId::from("spring"),
                channel_id: ChannelId::from("search"),
            },
            TrackedLink {
                id: LinkId::from("l-social"),
                campaign_id: CampaignId::from("spring"),
                channel_id: ChannelId::from("social"),
            },
        ]
    }

    fn click(id: &str, link: &str, at: DateTime<Utc>) -> ClickEvent {
        ClickEvent {
            id: ClickId::from(id),
            link_id: LinkId::from(link),
            timestamp: at,
            ip_address: "10.0.0.1".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            referrer_source: None,
            device_type: None,
            country: None,
            converted: false,
        }
    }

    fn conversion(id: &str, link: &str, at: DateTime<Utc>, sale: Money) -> ConversionEvent {
        ConversionEvent {
            id: crate::types::ConversionId::from(id),
            link_id: LinkId::from(link),
            channel_id: ChannelId::from("ignored"),
            timestamp: at,
            sale_amount: sale,
            commission_amount: sale * 0.1,
        }
    }

    fn spend(channel: &str, day: u32, amount: Money) -> SpendRecord {
        SpendRecord {
            campaign_id: CampaignId::from("spring"),
            channel_id: ChannelId::from(channel),
            day: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            amount,
        }
    }

    fn window() -> TimeRange {
        TimeRange::new(ts(1, 0), ts(10, 0))
    }

    // ==================== aggregate ====================

    #[test]
    fn aggregate_groups_by_channel_and_day() {
        let links = links();
        let spend = vec![spend("search", 1, 20.0)];
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &spend);

        let clicks = vec![
            click("c1", "l-search", ts(1, 9)),
            click("c2", "l-search", ts(1, 10)),
            click("c3", "l-search", ts(2, 9)),
            click("c4", "l-social", ts(1, 9)),
        ];
        let conversions = vec![conversion("v1", "l-search", ts(1, 11), 50.0)];

        let result = aggregator.aggregate(&clicks, &conversions, window());

        assert_eq!(result.skipped, 0);
        assert_eq!(result.aggregates.len(), 3);
        let first = &result.aggregates[0];
        assert_eq!(first.channel_id.as_str(), "search");
        assert_eq!(first.period_start, ts(1, 0));
        assert_eq!(first.period_end, ts(2, 0));
        assert_eq!(first.clicks, 2);
        assert_eq!(first.conversions, 1);
        assert_eq!(first.revenue, 50.0);
        assert_eq!(first.spend, 20.0);
        assert_eq!(result.aggregates[2].channel_id.as_str(), "social");
    }

    #[test]
    fn aggregate_skips_events_with_unknown_link() {
        let links = links();
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &[]);

        let clicks = vec![
            click("c1", "l-search", ts(1, 9)),
            click("c2", "l-missing", ts(1, 9)),
        ];
        let conversions = vec![conversion("v1", "l-missing", ts(1, 11), 50.0)];

        let result = aggregator.aggregate(&clicks, &conversions, window());

        assert_eq!(result.skipped, 2);
        assert_eq!(result.aggregates.len(), 1);
        assert_eq!(result.aggregates[0].clicks, 1);
    }

    #[test]
    fn aggregate_ignores_events_outside_window() {
        let links = links();
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &[]);

        let clicks = vec![click("c1", "l-search", ts(12, 9))];

        let result = aggregator.aggregate(&clicks, &[], window());

        assert!(result.aggregates.is_empty());
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn aggregate_emits_spend_only_rows() {
        let links = links();
        let spend = vec![spend("display", 3, 15.0)];
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &spend);

        let result = aggregator.aggregate(&[], &[], window());

        assert_eq!(result.aggregates.len(), 1);
        assert_eq!(result.aggregates[0].channel_id.as_str(), "display");
        assert_eq!(result.aggregates[0].clicks, 0);
        assert_eq!(result.aggregates[0].spend, 15.0);
    }

    #[test]
    fn aggregate_is_idempotent() {
        let links = links();
        let spend = vec![spend("search", 1, 20.0), spend("social", 2, 7.5)];
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &spend);
        let clicks: Vec<ClickEvent> = (0..40)
            .map(|i| {
                let link = if i % 3 == 0 { "l-social" } else { "l-search" };
                click(&format!("c{i}"), link, ts(1 + i % 4, 8))
            })
            .collect();
        let conversions = vec![
            conversion("v1", "l-search", ts(1, 12), 19.99),
            conversion("v2", "l-social", ts(2, 12), 0.1),
        ];

        let first = aggregator.aggregate(&clicks, &conversions, window());
        let second = aggregator.aggregate(&clicks, &conversions, window());

        assert_eq!(first, second);
    }

    #[test]
    fn rollup_sums_days_per_channel() {
        let links = links();
        let spend = vec![spend("search", 1, 20.0), spend("search", 2, 30.0)];
        let aggregator = Aggregator::new(CampaignId::from("spring"), &links, &spend);
        let clicks = vec![
            click("c1", "l-search", ts(1, 9)),
            click("c2", "l-search", ts(2, 9)),
        ];

        let aggregation = aggregator.aggregate(&clicks, &[], window());
        let totals = rollup(&aggregation.aggregates);

        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].clicks, 2);
        assert_eq!(totals[0].spend, 50.0);
    }

    // ==================== match_conversions ====================

    #[test]
    fn match_conversions_picks_latest_click_in_window() {
        let clicks = vec![
            click("early", "l-search", ts(1, 8)),
            click("late", "l-search", ts(1, 10)),
            click("after", "l-search", ts(1, 13)),
        ];
        let conversions = vec![conversion("v1", "l-search", ts(1, 12), 10.0)];

        let matched = match_conversions(&clicks, &conversions, Duration::hours(24));

        assert_eq!(matched, vec![ClickId::from("late")]);
    }

    #[test]
    fn match_conversions_converts_each_click_once() {
        let clicks = vec![click("only", "l-search", ts(1, 8))];
        let conversions = vec![
            conversion("v1", "l-search", ts(1, 9), 10.0),
            conversion("v2", "l-search", ts(1, 10), 10.0),
        ];

        let matched = match_conversions(&clicks, &conversions, Duration::hours(24));

        assert_eq!(matched, vec![ClickId::from("only")]);
    }

    #[test]
    fn match_conversions_skips_already_converted_and_stale_clicks() {
        let mut converted = click("done", "l-search", ts(3, 8));
        converted.converted = true;
        let clicks = vec![converted, click("stale", "l-search", ts(1, 8))];
        let conversions = vec![conversion("v1", "l-search", ts(3, 9), 10.0)];

        let matched = match_conversions(&clicks, &conversions, Duration::hours(24));

        assert!(matched.is_empty());
    }

    #[test]
    fn match_conversions_counts_converted_clicks_as_matched() {
        let mut converted = click("done", "l-search", ts(1, 8));
        converted.converted = true;
        let clicks = vec![converted, click("fresh", "l-search", ts(1, 9))];
        let first = vec![conversion("v1", "l-search", ts(1, 10), 10.0)];
        let both = vec![
            conversion("v1", "l-search", ts(1, 10), 10.0),
            conversion("v2", "l-search", ts(1, 11), 10.0),
        ];

        assert!(match_conversions(&clicks, &first, Duration::hours(24)).is_empty());
        assert_eq!(
            match_conversions(&clicks, &both, Duration::hours(24)),
            vec![ClickId::from("fresh")]
        );
    }

    #[test]
    fn commission_for_is_pending() {
        let record = commission_for(&conversion("v1", "l-search", ts(1, 9), 80.0));
        assert!((record.amount - 8.0).abs() < 1e-9);
        assert_eq!(record.status, crate::events::CommissionStatus::Pending);
    }
}
