//! CLI commands.

mod config;
mod endpoints;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::config::Config;
use crate::output::OutputFormat;

/// mserve CLI - Deploy and manage model serving endpoints.
#[derive(Debug, Parser)]
#[command(name = "mserve")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Control plane URL.
    #[arg(long, global = true, env = "MSERVE_API_URL")]
    api_url: Option<String>,

    /// Actor recorded for write operations.
    #[arg(long, global = true, env = "MSERVE_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new serving endpoint.
    Deploy(endpoints::DeployArgs),

    /// Re-apply an endpoint, optionally with changed settings.
    Redeploy(endpoints::RedeployArgs),

    /// Delete an endpoint and its cluster resources.
    Delete(endpoints::IdArgs),

    /// Show an endpoint's live status.
    Status(endpoints::IdArgs),

    /// List endpoints.
    List,

    /// Release a lock left behind by a crashed operation.
    Unlock(endpoints::IdArgs),

    /// Show or change saved CLI settings.
    Config(config::ConfigCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = Config::load()?.with_overrides(self.api_url, self.actor);
        let ctx = CommandContext {
            config,
            format: self.format,
        };

        match self.command {
            Commands::Deploy(args) => endpoints::deploy(ctx, args).await,
            Commands::Redeploy(args) => endpoints::redeploy(ctx, args).await,
            Commands::Delete(args) => endpoints::delete(ctx, args).await,
            Commands::Status(args) => endpoints::status(ctx, args).await,
            Commands::List => endpoints::list(ctx).await,
            Commands::Unlock(args) => endpoints::unlock(ctx, args).await,
            Commands::Config(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("mserve {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_redeploy_overrides() {
        let cli = Cli::try_parse_from([
            "mserve",
            "redeploy",
            "ep_01hzx",
            "--max-concurrent-requests",
            "64",
            "--framework",
            "managed",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Redeploy(_)));
    }
}
