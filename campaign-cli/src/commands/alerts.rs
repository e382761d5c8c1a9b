//! Fraud alert commands.

use anyhow::{Context as _, Result, bail};
use campaign_engine::{AlertId, CampaignId, EventStore};
use clap::{Args, Subcommand};
use tracing::info;
use uuid::Uuid;

use super::Context;
use crate::render;

/// Alert management arguments.
#[derive(Args, Debug)]
pub struct AlertsArgs {
    #[command(subcommand)]
    pub command: AlertsCommands,
}

/// Alert subcommands.
#[derive(Subcommand, Debug)]
pub enum AlertsCommands {
    /// List alerts for a campaign
    List {
        /// Campaign id
        campaign: String,

        /// Include resolved alerts
        #[arg(long)]
        all: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark an alert resolved
    Resolve {
        /// Alert id
        id: String,
    },
}

/// Run alerts command.
pub async fn run(ctx: &Context, args: AlertsArgs) -> Result<()> {
    match args.command {
        AlertsCommands::List {
            campaign,
            all,
            json,
        } => list_alerts(ctx, &CampaignId::from(campaign), all, json).await,
        AlertsCommands::Resolve { id } => resolve_alert(ctx, &id).await,
    }
}

async fn list_alerts(ctx: &Context, campaign: &CampaignId, all: bool, json: bool) -> Result<()> {
    let store = ctx.open_store().await?;
    let alerts = if all {
        store.list_alerts(campaign).await?
    } else {
        store.open_alerts(campaign).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&alerts)?);
    } else {
        render::print_alerts(&alerts);
    }
    Ok(())
}

async fn resolve_alert(ctx: &Context, id: &str) -> Result<()> {
    let id = parse_alert_id(id)?;
    let store = ctx.open_store().await?;

    if !store.resolve_alert(id).await? {
        bail!("No open alert with id {id}");
    }
    info!(alert_id = %id, "alert resolved");
    println!("Resolved alert {id}");
    Ok(())
}

fn parse_alert_id(id: &str) -> Result<AlertId> {
    let uuid = Uuid::parse_str(id.trim()).with_context(|| format!("Invalid alert id '{id}'"))?;
    Ok(AlertId(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_alert_id_accepts_uuid() {
        let id = AlertId::new();

        assert_eq!(parse_alert_id(&id.to_string()).unwrap(), id);
        assert_eq!(parse_alert_id(&format!(" {id}\n")).unwrap(), id);
    }

    #[test]
    fn parse_alert_id_rejects_garbage() {
        let err = parse_alert_id("203.0.113.66").unwrap_err();

        assert!(err.to_string().contains("Invalid alert id"));
    }
}
