//! Run optimization cycles on demand.

use anyhow::{Result, bail};
use campaign_engine::{CampaignId, CycleReport, CycleRunner};
use chrono::{DateTime, Utc};
use clap::Args;
use tracing::{error, info};

use super::Context;
use crate::render;

/// Cycle arguments.
#[derive(Args, Debug)]
pub struct CycleArgs {
    /// Campaign to run; every stored campaign when omitted
    pub campaign: Option<String>,

    /// Evaluate as of this instant (RFC 3339) instead of now
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run cycle command.
pub async fn run(ctx: &Context, args: CycleArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store().await?;
    let runner = CycleRunner::new(store, config);
    let now = args.at.unwrap_or_else(Utc::now);

    if let Some(campaign) = args.campaign {
        let report = runner.run_cycle(&CampaignId::from(campaign), now).await?;
        return print_reports(&[report], args.json);
    }

    let campaigns = runner.list_campaigns().await?;
    if campaigns.is_empty() {
        println!("No campaigns in store.");
        return Ok(());
    }

    let mut reports = Vec::with_capacity(campaigns.len());
    let mut failed = 0usize;
    for campaign in campaigns {
        match runner.run_cycle(&campaign.id, now).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!(campaign_id = %campaign.id, error = %e, "cycle failed");
                failed += 1;
            }
        }
    }
    info!(completed = reports.len(), failed, "cycles finished");

    print_reports(&reports, args.json)?;
    if failed > 0 {
        bail!("{failed} cycle(s) failed");
    }
    Ok(())
}

fn print_reports(reports: &[CycleReport], json: bool) -> Result<()> {
    if json {
        let out = match reports {
            [single] => serde_json::to_string_pretty(single)?,
            many => serde_json::to_string_pretty(many)?,
        };
        println!("{out}");
        return Ok(());
    }

    for report in reports {
        render::print_cycle_report(report);
    }
    Ok(())
}
