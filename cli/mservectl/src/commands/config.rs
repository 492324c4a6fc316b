//! Saved CLI settings.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::output::{print_single, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    /// Print the effective settings.
    Show,

    /// Save settings for later invocations.
    Set(SetArgs),
}

#[derive(Debug, Args)]
struct SetArgs {
    /// Control plane URL to save.
    #[arg(long = "url")]
    url: Option<String>,

    /// Actor to save.
    #[arg(long = "as")]
    actor: Option<String>,
}

impl ConfigCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ConfigSubcommand::Show => {
                print_single(&ctx.config);
                Ok(())
            }
            ConfigSubcommand::Set(args) => {
                if args.url.is_none() && args.actor.is_none() {
                    anyhow::bail!("Nothing to set. Pass --url and/or --as.");
                }
                let saved = Config::load()?.with_overrides(args.url, args.actor);
                let path = saved.save()?;
                print_success(&format!("Saved settings to {}", path.display()));
                Ok(())
            }
        }
    }
}
