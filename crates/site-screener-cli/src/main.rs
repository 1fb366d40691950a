use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<ExitCode> {
    let cli = site_screener_cli::Cli::parse();
    site_screener_cli::init_tracing(cli.log_level(), cli.log_json())?;
    site_screener_cli::run_cli(cli)
}
