//! Version command - show version information

use anyhow::Result;
use clap::Args;
use colored::*;

use super::App;

#[derive(Args)]
pub struct VersionCommand;

impl VersionCommand {
    pub fn execute(&self, app: &App) -> Result<()> {
        println!("{} {}", "fleetops".bold(), env!("CARGO_PKG_VERSION").green());
        println!();
        println!("  {} {}", "State dir:".cyan(), app.settings.state_dir().display());
        println!("  {} {}", "Platform:".cyan(), std::env::consts::OS);

        Ok(())
    }
}
