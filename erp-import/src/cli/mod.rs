//! Command-line interface

pub mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{Config, ConfigLayer};
use commands::mapping::ValidateMappingArgs;
use commands::headers::HeadersArgs;
use commands::run::RunCommands;

#[derive(Parser)]
#[command(name = "erp-import")]
#[command(about = "Import spreadsheets into an ERP over XML-RPC")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ./erp-import.toml, then the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Server URL, e.g. https://erp.example.com
    #[arg(long, global = true)]
    pub server_url: Option<String>,

    /// Database name
    #[arg(long, global = true)]
    pub database: Option<String>,

    /// Login
    #[arg(long, global = true)]
    pub username: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import a source file with a mapping
    Run(RunCommands),
    /// Print the canonical column names of a source file
    Headers(HeadersArgs),
    /// Authenticate and print server identification
    Check,
    /// Load a mapping file and report problems
    ValidateMapping(ValidateMappingArgs),
}

impl Cli {
    /// Configuration values given as global flags
    fn flags(&self) -> ConfigLayer {
        ConfigLayer {
            server_url: self.server_url.clone(),
            database: self.database.clone(),
            username: self.username.clone(),
            ..ConfigLayer::default()
        }
    }

    pub async fn execute(self) -> Result<()> {
        let flags = self.flags();
        match self.command {
            Commands::Run(args) => {
                let config = Config::load(self.config.as_deref(), flags)?;
                commands::run::handle_run_command(args, config).await
            }
            Commands::Headers(args) => commands::headers::handle_headers_command(args),
            Commands::Check => {
                let config = Config::load(self.config.as_deref(), flags)?;
                commands::check::handle_check_command(config).await
            }
            Commands::ValidateMapping(args) => {
                commands::mapping::handle_validate_mapping_command(args)
            }
        }
    }
}
