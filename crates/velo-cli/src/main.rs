//! velo CLI - monthly Citi Bike pipeline runner.
//!
//! The main entry point for the `velo` CLI binary.

use anyhow::Result;
use clap::Parser;

use velo_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    velo_core::init_logging(cli.log_format);
    let config = cli.config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run(args) => velo_cli::commands::run::execute(args, &config).await,
            Commands::Check(args) => velo_cli::commands::check::execute(args, &config).await,
            Commands::Status(args) => velo_cli::commands::status::execute(args, &config).await,
        }
    })
}
