//! Ingest JSON Lines feeds into the event store.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use campaign_engine::{EventStore, IngestRecord};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tracing::{debug, info};

use super::Context;

/// Ingest arguments.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON Lines files, one tagged record per line
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

/// Per-kind counts of applied and duplicate records.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    counts: BTreeMap<&'static str, (u64, u64)>,
}

impl IngestSummary {
    fn record(&mut self, kind: &'static str, applied: bool) {
        let entry = self.counts.entry(kind).or_default();
        if applied {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    pub fn applied(&self) -> u64 {
        self.counts.values().map(|(a, _)| a).sum()
    }

    pub fn duplicates(&self) -> u64 {
        self.counts.values().map(|(_, d)| d).sum()
    }
}

/// Run ingest command.
pub async fn run(ctx: &Context, args: IngestArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let mut summary = IngestSummary::default();

    for path in &args.files {
        ingest_file(store.as_ref(), path, &mut summary).await?;
    }

    info!(
        applied = summary.applied(),
        duplicates = summary.duplicates(),
        "ingestion finished"
    );
    print_summary(&summary);
    Ok(())
}

/// Apply every record of one file, stopping at the first bad line.
pub async fn ingest_file(
    store: &dyn EventStore,
    path: &Path,
    summary: &mut IngestSummary,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("{}:{}: read failed", path.display(), line_no))?;
        let Some(record) = parse_line(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), line_no))?
        else {
            continue;
        };

        let applied = store
            .ingest(&record)
            .await
            .with_context(|| format!("{}:{}: store rejected record", path.display(), line_no))?;
        if !applied {
            debug!(kind = record.kind(), line = line_no, "duplicate record skipped");
        }
        summary.record(record.kind(), applied);
    }
    Ok(())
}

/// Parse one feed line; blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<IngestRecord>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

fn print_summary(summary: &IngestSummary) {
    if summary.counts.is_empty() {
        println!("No records ingested.");
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Record").fg(Color::Cyan),
        Cell::new("Applied").fg(Color::Cyan),
        Cell::new("Duplicates").fg(Color::Cyan),
    ]);
    for (kind, (applied, duplicates)) in &summary.counts {
        table.add_row(vec![
            Cell::new(kind),
            Cell::new(applied),
            Cell::new(duplicates),
        ]);
    }
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_engine::{CampaignId, MemoryEventStore, TimeRange};
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CLICK: &str = r#"{"type":"click","id":"c1","link_id":"l1","timestamp":"2025-03-01T10:00:00Z","ip_address":"198.51.100.7","user_agent":"Mozilla/5.0"}"#;
    const LINK: &str = r#"{"type":"link","id":"l1","campaign_id":"spring","channel_id":"search"}"#;

    #[test]
    fn parse_line_skips_blank_and_comment_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# clicks exported 2025-03-01").unwrap().is_none());
    }

    #[test]
    fn parse_line_reads_tagged_records() {
        let record = parse_line(CLICK).unwrap().unwrap();

        assert_eq!(record.kind(), "click");
        assert!(matches!(record, IngestRecord::Click(ref c) if c.ip_address == "198.51.100.7"));
    }

    #[test]
    fn parse_line_rejects_unknown_type() {
        assert!(parse_line(r#"{"type":"impression","id":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn ingest_file_counts_duplicates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{LINK}").unwrap();
        writeln!(file, "{CLICK}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{CLICK}").unwrap();
        let store = MemoryEventStore::new();
        let mut summary = IngestSummary::default();

        ingest_file(&store, file.path(), &mut summary).await.unwrap();

        assert_eq!(summary.applied(), 2);
        assert_eq!(summary.duplicates(), 1);
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
        );
        let clicks = store
            .clicks_for_campaign(&CampaignId::from("spring"), range)
            .await
            .unwrap();
        assert_eq!(clicks.len(), 1);
    }

    #[tokio::test]
    async fn ingest_file_reports_line_of_bad_record() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{LINK}").unwrap();
        writeln!(file, "not json").unwrap();
        let store = MemoryEventStore::new();
        let mut summary = IngestSummary::default();

        let err = ingest_file(&store, file.path(), &mut summary)
            .await
            .unwrap_err();

        assert!(err.to_string().ends_with(":2: invalid record"));
        assert_eq!(summary.applied(), 1);
    }
}
