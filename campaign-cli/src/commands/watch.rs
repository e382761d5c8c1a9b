//! Long-running polling loop.

use std::sync::Arc;

use anyhow::Result;
use campaign_engine::{CycleOutcome, CycleRunner, Scheduler};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Context;
use crate::render;

/// Watch arguments.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Print each completed report as one JSON line
    #[arg(long)]
    pub json: bool,
}

/// Run watch command until interrupted.
pub async fn run(ctx: &Context, args: WatchArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store().await?;
    let scheduler = Scheduler::new(Arc::new(CycleRunner::new(store, config)));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, finishing"),
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
        signal.cancel();
    });

    scheduler
        .run(shutdown, |_, outcome| {
            let CycleOutcome::Completed(report) = outcome else {
                return;
            };
            if args.json {
                match serde_json::to_string(report.as_ref()) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "could not serialize report"),
                }
            } else {
                render::print_cycle_report(report);
            }
        })
        .await;

    Ok(())
}
