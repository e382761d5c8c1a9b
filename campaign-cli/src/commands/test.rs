//! A/B test commands.

use anyhow::Result;
use campaign_engine::{
    CampaignId, ExperimentManager, ExperimentTest, ExperimentVariant, TestId, VariantId,
};
use chrono::Utc;
use clap::{Args, Subcommand};

use super::Context;
use crate::render;

/// Test management arguments.
#[derive(Args, Debug)]
pub struct TestArgs {
    #[command(subcommand)]
    pub command: TestCommands,
}

/// Test subcommands.
#[derive(Subcommand, Debug)]
pub enum TestCommands {
    /// Register a running test with one control and any number of variants
    Create {
        /// Campaign the test belongs to
        campaign: String,

        /// Test id
        id: String,

        /// Human-readable name
        #[arg(short, long)]
        name: Option<String>,

        /// Control variant id
        #[arg(long)]
        control: String,

        /// Challenger variant ids
        #[arg(long = "variant", required = true)]
        variants: Vec<String>,
    },
    /// List tests of a campaign
    List {
        /// Campaign id
        campaign: String,
    },
    /// Show the current significance of a test
    Show {
        /// Test id
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count one visitor on a variant
    Visit {
        /// Test id
        test: String,

        /// Variant id
        variant: String,
    },
    /// Count one conversion on a variant
    Convert {
        /// Test id
        test: String,

        /// Variant id
        variant: String,
    },
    /// Evaluate and complete a running test
    Stop {
        /// Test id
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run test command.
pub async fn run(ctx: &Context, args: TestArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.open_store().await?;
    let manager = ExperimentManager::new(store, &config.experiment);

    match args.command {
        TestCommands::Create {
            campaign,
            id,
            name,
            control,
            variants,
        } => {
            let name = name.unwrap_or_else(|| id.clone());
            let test = ExperimentTest::new(id, campaign, name, Utc::now());
            let variants = build_variants(&test.id, &control, &variants);
            manager.create_test(&test, &variants).await?;
            println!("Created test {} with {} variants", test.id, variants.len());
        }
        TestCommands::List { campaign } => {
            let tests = manager
                .tests_for_campaign(&CampaignId::from(campaign))
                .await?;
            render::print_tests(&tests);
        }
        TestCommands::Show { id, json } => {
            let result = manager.evaluate(&TestId::from(id)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                render::print_experiments(std::slice::from_ref(&result));
            }
        }
        TestCommands::Visit { test, variant } => {
            manager
                .record_visit(&TestId::from(test), &VariantId::from(variant))
                .await?;
        }
        TestCommands::Convert { test, variant } => {
            manager
                .record_conversion(&TestId::from(test), &VariantId::from(variant))
                .await?;
        }
        TestCommands::Stop { id, json } => {
            let stopped = manager.stop_test(&TestId::from(id), Utc::now()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stopped)?);
                return Ok(());
            }
            println!("Stopped test {}", stopped.test.id);
            render::print_experiments(std::slice::from_ref(&stopped.result));
            for recommendation in &stopped.recommendations {
                println!("  - {recommendation}");
            }
        }
    }
    Ok(())
}

/// Control first, then challengers in the order given.
fn build_variants(test_id: &TestId, control: &str, challengers: &[String]) -> Vec<ExperimentVariant> {
    std::iter::once((control, true))
        .chain(challengers.iter().map(|v| (v.as_str(), false)))
        .map(|(id, is_control)| ExperimentVariant {
            id: VariantId::from(id),
            test_id: test_id.clone(),
            name: id.to_string(),
            is_control,
            visitors: 0,
            conversions: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_variants_puts_single_control_first() {
        let variants = build_variants(
            &TestId::from("headline"),
            "original",
            &["bold".to_string(), "short".to_string()],
        );

        assert_eq!(variants.len(), 3);
        assert!(variants[0].is_control);
        assert_eq!(variants[0].id.as_str(), "original");
        assert_eq!(variants.iter().filter(|v| v.is_control).count(), 1);
        assert!(variants.iter().all(|v| v.test_id.as_str() == "headline"));
    }
}
