use anyhow::Result;
use clap::{Args, Subcommand};

use super::Context;
use crate::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show current configuration (merged)
    Show,
    /// Show configuration and database paths
    Path,
}

pub fn run(ctx: &Context, args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show => show_config(ctx),
        ConfigCommands::Path => show_paths(ctx),
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{}", toml_str);
    Ok(())
}

fn show_paths(ctx: &Context) -> Result<()> {
    println!("User config:    {:?}", ConfigLoader::user_config_path());
    println!("Project config: {:?}", ConfigLoader::project_config_path());
    if let Some(path) = ctx.config_path() {
        println!("Extra config:   {:?}", path);
    }
    println!("Database:       {:?}", ctx.db_path().ok());
    Ok(())
}
