//! Turso/libSQL implementation of the event store.
//!
//! Connects to a local embedded SQLite file or an in-memory database.
//! Timestamps are stored as fixed-width RFC 3339 strings so range queries can
//! compare them as text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database};
use tracing::{debug, instrument};

use super::{Error, EventStore, Result};
use crate::budget::{AllocationSnapshot, BudgetAllocation};
use crate::campaign::{Campaign, ChannelBudget, SpendRecord, TrackedLink};
use crate::events::{ClickEvent, CommissionRecord, CommissionStatus, ConversionEvent};
use crate::experiment::{ExperimentTest, ExperimentVariant, TestStatus};
use crate::fraud::{FraudAlert, Severity};
use crate::types::{
    AlertId, CampaignId, ClickId, ConversionId, CycleId, TestId, TimeRange, VariantId,
};

/// Schema statements, applied in order on open.
const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    total_budget REAL NOT NULL,
    starts_at TEXT NOT NULL,
    ends_at TEXT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS links (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    channel_id TEXT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS channel_budgets (
    campaign_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    daily_budget REAL NOT NULL,
    PRIMARY KEY (campaign_id, channel_id)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS spend (
    campaign_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    day TEXT NOT NULL,
    amount REAL NOT NULL,
    PRIMARY KEY (campaign_id, channel_id, day)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS clicks (
    id TEXT PRIMARY KEY,
    link_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    referrer_source TEXT,
    device_type TEXT,
    country TEXT,
    converted INTEGER NOT NULL DEFAULT 0
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_clicks_link_time ON clicks(link_id, timestamp)",
    r#"
CREATE TABLE IF NOT EXISTS conversions (
    id TEXT PRIMARY KEY,
    link_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    sale_amount REAL NOT NULL,
    commission_amount REAL NOT NULL
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_conversions_link_time ON conversions(link_id, timestamp)",
    r#"
CREATE TABLE IF NOT EXISTS commissions (
    id TEXT PRIMARY KEY,
    conversion_id TEXT NOT NULL UNIQUE,
    link_id TEXT NOT NULL,
    amount REAL NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS fraud_alerts (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    source_key TEXT NOT NULL,
    severity TEXT NOT NULL,
    click_count INTEGER NOT NULL,
    estimated_loss REAL NOT NULL,
    created_at TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
)
"#,
    r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_fraud_alerts_open_source
ON fraud_alerts(campaign_id, source_key) WHERE resolved = 0
"#,
    r#"
CREATE TABLE IF NOT EXISTS allocation_snapshots (
    cycle_id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    allocations TEXT NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS experiment_tests (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    winner_variant_id TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS experiment_variants (
    id TEXT PRIMARY KEY,
    test_id TEXT NOT NULL,
    name TEXT NOT NULL,
    is_control INTEGER NOT NULL,
    visitors INTEGER NOT NULL,
    conversions INTEGER NOT NULL
)
"#,
];

const CLICK_COLUMNS: &str = "c.id, c.link_id, c.timestamp, c.ip_address, c.user_agent, \
     c.referrer_source, c.device_type, c.country, c.converted";

const CONVERSION_COLUMNS: &str =
    "c.id, c.link_id, c.channel_id, c.timestamp, c.sale_amount, c.commission_amount";

const ALERT_COLUMNS: &str =
    "id, campaign_id, source_key, severity, click_count, estimated_loss, created_at, resolved";

const TEST_COLUMNS: &str =
    "id, campaign_id, name, status, winner_variant_id, created_at, completed_at";

/// libSQL-backed event store.
#[derive(Clone)]
pub struct TursoEventStore {
    db: Arc<Database>,
    /// Connection reused by every call; set for in-memory databases.
    shared: Option<Connection>,
}

impl TursoEventStore {
    /// Open (or create) a local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self> {
        let db = Builder::new_local(path).build().await?;
        let store = Self {
            db: Arc::new(db),
            shared: None,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create a new in-memory store (for testing).
    ///
    /// Every connection to `:memory:` sees its own database, so the store
    /// keeps a single connection open for its lifetime.
    pub async fn new_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let shared = db.connect()?;
        let store = Self {
            db: Arc::new(db),
            shared: Some(shared),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Get a database connection.
    async fn conn(&self) -> Result<Connection> {
        match &self.shared {
            Some(conn) => Ok(conn.clone()),
            None => Ok(self.db.connect()?),
        }
    }

    /// Ensure the database schema exists.
    async fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn().await?;
        for statement in SCHEMA {
            conn.execute(statement, ()).await?;
        }
        Ok(())
    }

    fn parse_campaign(row: &libsql::Row) -> Result<Campaign> {
        Ok(Campaign {
            id: CampaignId::new(row.get::<String>(0)?),
            name: row.get(1)?,
            total_budget: row.get(2)?,
            starts_at: parse_datetime(&row.get::<String>(3)?)?,
            ends_at: parse_datetime(&row.get::<String>(4)?)?,
        })
    }

    fn parse_click(row: &libsql::Row) -> Result<ClickEvent> {
        Ok(ClickEvent {
            id: ClickId::new(row.get::<String>(0)?),
            link_id: row.get::<String>(1)?.into(),
            timestamp: parse_datetime(&row.get::<String>(2)?)?,
            ip_address: row.get(3)?,
            user_agent: row.get(4)?,
            referrer_source: row.get(5)?,
            device_type: row.get(6)?,
            country: row.get(7)?,
            converted: row.get::<i64>(8)? != 0,
        })
    }

    fn parse_conversion(row: &libsql::Row) -> Result<ConversionEvent> {
        Ok(ConversionEvent {
            id: ConversionId::new(row.get::<String>(0)?),
            link_id: row.get::<String>(1)?.into(),
            channel_id: row.get::<String>(2)?.into(),
            timestamp: parse_datetime(&row.get::<String>(3)?)?,
            sale_amount: row.get(4)?,
            commission_amount: row.get(5)?,
        })
    }

    fn parse_alert(row: &libsql::Row) -> Result<FraudAlert> {
        let id_str: String = row.get(0)?;
        let severity_str: String = row.get(3)?;

        let id = AlertId(
            id_str
                .parse()
                .map_err(|_| Error::InvalidData(format!("invalid alert id: {}", id_str)))?,
        );
        let severity = Severity::parse(&severity_str)
            .ok_or_else(|| Error::InvalidData(format!("invalid severity: {}", severity_str)))?;

        Ok(FraudAlert {
            id,
            campaign_id: row.get::<String>(1)?.into(),
            source_key: row.get(2)?,
            severity,
            click_count: to_u64(row.get::<i64>(4)?)?,
            estimated_loss: row.get(5)?,
            created_at: parse_datetime(&row.get::<String>(6)?)?,
            resolved: row.get::<i64>(7)? != 0,
        })
    }

    fn parse_test(row: &libsql::Row) -> Result<ExperimentTest> {
        let status_str: String = row.get(3)?;
        let status = TestStatus::parse(&status_str)
            .ok_or_else(|| Error::InvalidData(format!("invalid test status: {}", status_str)))?;
        let completed_at: Option<String> = row.get(6)?;

        Ok(ExperimentTest {
            id: TestId::new(row.get::<String>(0)?),
            campaign_id: row.get::<String>(1)?.into(),
            name: row.get(2)?,
            status,
            winner_variant_id: row.get::<Option<String>>(4)?.map(VariantId::from),
            created_at: parse_datetime(&row.get::<String>(5)?)?,
            completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }

    fn parse_variant(row: &libsql::Row) -> Result<ExperimentVariant> {
        Ok(ExperimentVariant {
            id: VariantId::new(row.get::<String>(0)?),
            test_id: row.get::<String>(1)?.into(),
            name: row.get(2)?,
            is_control: row.get::<i64>(3)? != 0,
            visitors: to_u64(row.get::<i64>(4)?)?,
            conversions: to_u64(row.get::<i64>(5)?)?,
        })
    }
}

#[async_trait]
impl EventStore for TursoEventStore {
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id), level = "debug")]
    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO campaigns (id, name, total_budget, starts_at, ends_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, total_budget = excluded.total_budget, \
             starts_at = excluded.starts_at, ends_at = excluded.ends_at",
            libsql::params![
                campaign.id.as_str(),
                campaign.name.as_str(),
                campaign.total_budget,
                format_datetime(campaign.starts_at),
                format_datetime(campaign.ends_at)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, total_budget, starts_at, ends_at FROM campaigns WHERE id = ?",
                [id.as_str()],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::parse_campaign(&row)?))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, total_budget, starts_at, ends_at FROM campaigns ORDER BY id",
                (),
            )
            .await?;

        let mut campaigns = Vec::new();
        while let Some(row) = rows.next().await? {
            campaigns.push(Self::parse_campaign(&row)?);
        }
        Ok(campaigns)
    }

    async fn upsert_link(&self, link: &TrackedLink) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO links (id, campaign_id, channel_id) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET campaign_id = excluded.campaign_id, channel_id = excluded.channel_id",
            libsql::params![link.id.as_str(), link.campaign_id.as_str(), link.channel_id.as_str()],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn links_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<TrackedLink>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, campaign_id, channel_id FROM links WHERE campaign_id = ? ORDER BY id",
                [campaign_id.as_str()],
            )
            .await?;

        let mut links = Vec::new();
        while let Some(row) = rows.next().await? {
            links.push(TrackedLink {
                id: row.get::<String>(0)?.into(),
                campaign_id: row.get::<String>(1)?.into(),
                channel_id: row.get::<String>(2)?.into(),
            });
        }
        Ok(links)
    }

    async fn upsert_channel_budget(&self, budget: &ChannelBudget) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO channel_budgets (campaign_id, channel_id, daily_budget) VALUES (?, ?, ?) \
             ON CONFLICT(campaign_id, channel_id) DO UPDATE SET daily_budget = excluded.daily_budget",
            libsql::params![
                budget.campaign_id.as_str(),
                budget.channel_id.as_str(),
                budget.daily_budget
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn channel_budgets(&self, campaign_id: &CampaignId) -> Result<Vec<ChannelBudget>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT campaign_id, channel_id, daily_budget FROM channel_budgets WHERE campaign_id = ? ORDER BY channel_id",
                [campaign_id.as_str()],
            )
            .await?;

        let mut budgets = Vec::new();
        while let Some(row) = rows.next().await? {
            budgets.push(ChannelBudget {
                campaign_id: row.get::<String>(0)?.into(),
                channel_id: row.get::<String>(1)?.into(),
                daily_budget: row.get(2)?,
            });
        }
        Ok(budgets)
    }

    async fn record_spend(&self, spend: &SpendRecord) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO spend (campaign_id, channel_id, day, amount) VALUES (?, ?, ?, ?) \
             ON CONFLICT(campaign_id, channel_id, day) DO UPDATE SET amount = excluded.amount",
            libsql::params![
                spend.campaign_id.as_str(),
                spend.channel_id.as_str(),
                spend.day.to_string(),
                spend.amount
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn spend_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<SpendRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT campaign_id, channel_id, day, amount FROM spend WHERE campaign_id = ? ORDER BY day, channel_id",
                [campaign_id.as_str()],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let day_str: String = row.get(2)?;
            let day = NaiveDate::parse_from_str(&day_str, "%Y-%m-%d")
                .map_err(|_| Error::InvalidData(format!("invalid day: {}", day_str)))?;
            records.push(SpendRecord {
                campaign_id: row.get::<String>(0)?.into(),
                channel_id: row.get::<String>(1)?.into(),
                day,
                amount: row.get(3)?,
            });
        }
        Ok(records)
    }

    #[instrument(skip(self, click), fields(click_id = %click.id), level = "debug")]
    async fn append_click(&self, click: &ClickEvent) -> Result<bool> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO clicks (id, link_id, timestamp, ip_address, user_agent, referrer_source, device_type, country, converted) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    click.id.as_str(),
                    click.link_id.as_str(),
                    format_datetime(click.timestamp),
                    click.ip_address.as_str(),
                    click.user_agent.as_str(),
                    click.referrer_source.clone(),
                    click.device_type.clone(),
                    click.country.clone(),
                    i64::from(click.converted)
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    #[instrument(skip(self, conversion), fields(conversion_id = %conversion.id), level = "debug")]
    async fn append_conversion(&self, conversion: &ConversionEvent) -> Result<bool> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO conversions (id, link_id, channel_id, timestamp, sale_amount, commission_amount) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    conversion.id.as_str(),
                    conversion.link_id.as_str(),
                    conversion.channel_id.as_str(),
                    format_datetime(conversion.timestamp),
                    conversion.sale_amount,
                    conversion.commission_amount
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    #[instrument(skip(self), level = "debug")]
    async fn clicks_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ClickEvent>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {CLICK_COLUMNS} FROM clicks c LEFT JOIN links l ON l.id = c.link_id \
             WHERE (l.campaign_id = ? OR l.id IS NULL) AND c.timestamp >= ? AND c.timestamp < ? \
             ORDER BY c.timestamp, c.id"
        );
        let mut rows = conn
            .query(
                &sql,
                libsql::params![
                    campaign_id.as_str(),
                    format_datetime(range.start),
                    format_datetime(range.end)
                ],
            )
            .await?;

        let mut clicks = Vec::new();
        while let Some(row) = rows.next().await? {
            clicks.push(Self::parse_click(&row)?);
        }
        debug!(count = clicks.len(), "loaded clicks");
        Ok(clicks)
    }

    #[instrument(skip(self), level = "debug")]
    async fn conversions_for_campaign(
        &self,
        campaign_id: &CampaignId,
        range: TimeRange,
    ) -> Result<Vec<ConversionEvent>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {CONVERSION_COLUMNS} FROM conversions c LEFT JOIN links l ON l.id = c.link_id \
             WHERE (l.campaign_id = ? OR l.id IS NULL) AND c.timestamp >= ? AND c.timestamp < ? \
             ORDER BY c.timestamp, c.id"
        );
        let mut rows = conn
            .query(
                &sql,
                libsql::params![
                    campaign_id.as_str(),
                    format_datetime(range.start),
                    format_datetime(range.end)
                ],
            )
            .await?;

        let mut conversions = Vec::new();
        while let Some(row) = rows.next().await? {
            conversions.push(Self::parse_conversion(&row)?);
        }
        Ok(conversions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn mark_click_converted(&self, click_id: &ClickId) -> Result<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE clicks SET converted = 1 WHERE id = ? AND converted = 0",
                [click_id.as_str()],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn record_commission(&self, commission: &CommissionRecord) -> Result<bool> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO commissions (id, conversion_id, link_id, amount, status, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                libsql::params![
                    commission.id.to_string(),
                    commission.conversion_id.as_str(),
                    commission.link_id.as_str(),
                    commission.amount,
                    commission.status.as_str(),
                    format_datetime(commission.created_at)
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn commission_for_conversion(
        &self,
        conversion_id: &ConversionId,
    ) -> Result<Option<CommissionRecord>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, conversion_id, link_id, amount, status, created_at FROM commissions WHERE conversion_id = ?",
                [conversion_id.as_str()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let id_str: String = row.get(0)?;
        let status_str: String = row.get(4)?;
        Ok(Some(CommissionRecord {
            id: id_str
                .parse()
                .map_err(|_| Error::InvalidData(format!("invalid commission id: {}", id_str)))?,
            conversion_id: row.get::<String>(1)?.into(),
            link_id: row.get::<String>(2)?.into(),
            amount: row.get(3)?,
            status: CommissionStatus::parse(&status_str).ok_or_else(|| {
                Error::InvalidData(format!("invalid commission status: {}", status_str))
            })?,
            created_at: parse_datetime(&row.get::<String>(5)?)?,
        }))
    }

    #[instrument(skip(self, alert), fields(source_key = %alert.source_key), level = "debug")]
    async fn upsert_alert(&self, alert: &FraudAlert) -> Result<AlertId> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO fraud_alerts (id, campaign_id, source_key, severity, click_count, estimated_loss, created_at, resolved) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0) \
             ON CONFLICT(campaign_id, source_key) WHERE resolved = 0 DO UPDATE SET \
             severity = excluded.severity, click_count = excluded.click_count, estimated_loss = excluded.estimated_loss",
            libsql::params![
                alert.id.to_string(),
                alert.campaign_id.as_str(),
                alert.source_key.as_str(),
                alert.severity.as_str(),
                to_i64(alert.click_count),
                alert.estimated_loss,
                format_datetime(alert.created_at)
            ],
        )
        .await?;

        let mut rows = conn
            .query(
                "SELECT id FROM fraud_alerts WHERE campaign_id = ? AND source_key = ? AND resolved = 0",
                libsql::params![alert.campaign_id.as_str(), alert.source_key.as_str()],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| Error::NotFound(format!("alert for {}", alert.source_key)))?;
        let id_str: String = row.get(0)?;
        Ok(AlertId(id_str.parse().map_err(|_| {
            Error::InvalidData(format!("invalid alert id: {}", id_str))
        })?))
    }

    #[instrument(skip(self), level = "debug")]
    async fn open_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM fraud_alerts WHERE campaign_id = ? AND resolved = 0 ORDER BY created_at, id"
        );
        let mut rows = conn.query(&sql, [campaign_id.as_str()]).await?;

        let mut alerts = Vec::new();
        while let Some(row) = rows.next().await? {
            alerts.push(Self::parse_alert(&row)?);
        }
        Ok(alerts)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_alerts(&self, campaign_id: &CampaignId) -> Result<Vec<FraudAlert>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM fraud_alerts WHERE campaign_id = ? ORDER BY created_at DESC, id DESC"
        );
        let mut rows = conn.query(&sql, [campaign_id.as_str()]).await?;

        let mut alerts = Vec::new();
        while let Some(row) = rows.next().await? {
            alerts.push(Self::parse_alert(&row)?);
        }
        Ok(alerts)
    }

    #[instrument(skip(self), level = "debug")]
    async fn resolve_alert(&self, id: AlertId) -> Result<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE fraud_alerts SET resolved = 1 WHERE id = ? AND resolved = 0",
                [id.to_string()],
            )
            .await?;
        Ok(updated > 0)
    }

    #[instrument(skip(self, snapshot), fields(cycle_id = %snapshot.cycle_id), level = "debug")]
    async fn save_allocations(&self, snapshot: &AllocationSnapshot) -> Result<()> {
        let conn = self.conn().await?;
        let allocations_json = serde_json::to_string(&snapshot.allocations)?;
        conn.execute(
            "INSERT OR IGNORE INTO allocation_snapshots (cycle_id, campaign_id, created_at, allocations) VALUES (?, ?, ?, ?)",
            libsql::params![
                snapshot.cycle_id.to_string(),
                snapshot.campaign_id.as_str(),
                format_datetime(snapshot.created_at),
                allocations_json
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn allocation_history(
        &self,
        campaign_id: &CampaignId,
        limit: usize,
    ) -> Result<Vec<AllocationSnapshot>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT cycle_id, campaign_id, created_at, allocations FROM allocation_snapshots \
                 WHERE campaign_id = ? ORDER BY created_at DESC, cycle_id DESC LIMIT ?",
                libsql::params![campaign_id.as_str(), to_i64(limit as u64)],
            )
            .await?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await? {
            let cycle_str: String = row.get(0)?;
            let allocations_json: String = row.get(3)?;
            let allocations: Vec<BudgetAllocation> = serde_json::from_str(&allocations_json)?;
            snapshots.push(AllocationSnapshot {
                cycle_id: CycleId(cycle_str.parse().map_err(|_| {
                    Error::InvalidData(format!("invalid cycle id: {}", cycle_str))
                })?),
                campaign_id: row.get::<String>(1)?.into(),
                created_at: parse_datetime(&row.get::<String>(2)?)?,
                allocations,
            });
        }
        Ok(snapshots)
    }

    async fn upsert_test(&self, test: &ExperimentTest) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO experiment_tests (id, campaign_id, name, status, winner_variant_id, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            libsql::params![
                test.id.as_str(),
                test.campaign_id.as_str(),
                test.name.as_str(),
                test.status.as_str(),
                test.winner_variant_id.as_ref().map(|v| v.as_str().to_string()),
                format_datetime(test.created_at),
                test.completed_at.map(format_datetime)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_test(&self, id: &TestId) -> Result<Option<ExperimentTest>> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {TEST_COLUMNS} FROM experiment_tests WHERE id = ?");
        let mut rows = conn.query(&sql, [id.as_str()]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::parse_test(&row)?))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn tests_for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<ExperimentTest>> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {TEST_COLUMNS} FROM experiment_tests WHERE campaign_id = ? ORDER BY created_at, id"
        );
        let mut rows = conn.query(&sql, [campaign_id.as_str()]).await?;

        let mut tests = Vec::new();
        while let Some(row) = rows.next().await? {
            tests.push(Self::parse_test(&row)?);
        }
        Ok(tests)
    }

    async fn upsert_variant(&self, variant: &ExperimentVariant) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO experiment_variants (id, test_id, name, is_control, visitors, conversions) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO UPDATE SET \
             visitors = MAX(visitors, excluded.visitors), conversions = MAX(conversions, excluded.conversions)",
            libsql::params![
                variant.id.as_str(),
                variant.test_id.as_str(),
                variant.name.as_str(),
                i64::from(variant.is_control),
                to_i64(variant.visitors),
                to_i64(variant.conversions)
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn variants_for_test(&self, test_id: &TestId) -> Result<Vec<ExperimentVariant>> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, test_id, name, is_control, visitors, conversions FROM experiment_variants \
                 WHERE test_id = ? ORDER BY is_control DESC, id",
                [test_id.as_str()],
            )
            .await?;

        let mut variants = Vec::new();
        while let Some(row) = rows.next().await? {
            variants.push(Self::parse_variant(&row)?);
        }
        Ok(variants)
    }

    #[instrument(skip(self), level = "debug")]
    async fn increment_variant(
        &self,
        test_id: &TestId,
        variant_id: &VariantId,
        visitors: u64,
        conversions: u64,
    ) -> Result<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE experiment_variants SET visitors = visitors + ?, conversions = conversions + ? \
                 WHERE id = ? AND test_id = ? \
                 AND test_id IN (SELECT id FROM experiment_tests WHERE status = 'running')",
                libsql::params![
                    to_i64(visitors),
                    to_i64(conversions),
                    variant_id.as_str(),
                    test_id.as_str()
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    #[instrument(skip(self, test), fields(test_id = %test.id), level = "debug")]
    async fn complete_test(&self, test: &ExperimentTest) -> Result<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE experiment_tests SET status = ?, winner_variant_id = ?, completed_at = ? \
                 WHERE id = ? AND status = ?",
                libsql::params![
                    TestStatus::Completed.as_str(),
                    test.winner_variant_id.as_ref().map(|v| v.as_str().to_string()),
                    format_datetime(test.completed_at.unwrap_or_else(Utc::now)),
                    test.id.as_str(),
                    TestStatus::Running.as_str()
                ],
            )
            .await?;
        Ok(updated > 0)
    }
}

/// Format a datetime for storage.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime from storage.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidData(format!("invalid datetime: {}", s)))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::InvalidData(format!("negative counter: {}", v)))
}
