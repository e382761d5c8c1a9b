//! Stored results for one campaign.

use anyhow::{Result, bail};
use campaign_engine::{CampaignId, EventStore};
use clap::Args;

use super::Context;
use crate::render;

/// Report arguments.
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Campaign to report on
    pub campaign: String,

    /// Number of allocation snapshots to show
    #[arg(short, long, default_value_t = 5)]
    pub limit: usize,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run report command.
pub async fn run(ctx: &Context, args: ReportArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let id = CampaignId::from(args.campaign);

    let Some(campaign) = store.get_campaign(&id).await? else {
        bail!("Campaign '{}' not found", id);
    };
    let history = store.allocation_history(&id, args.limit).await?;
    let alerts = store.open_alerts(&id).await?;
    let tests = store.tests_for_campaign(&id).await?;

    if args.json {
        let out = serde_json::json!({
            "campaign": campaign,
            "allocation_history": history,
            "open_alerts": alerts,
            "tests": tests,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Campaign: {} ({})", campaign.name, campaign.id);
    println!(
        "Budget: ${:.2} | {} .. {}",
        campaign.total_budget,
        campaign.starts_at.format("%Y-%m-%d"),
        campaign.ends_at.format("%Y-%m-%d"),
    );
    println!();

    render::print_history(&history);
    render::print_alerts(&alerts);
    render::print_tests(&tests);
    Ok(())
}
