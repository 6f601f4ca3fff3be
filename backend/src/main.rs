use clap::Parser;

use surveillance::cli::{Cli, dispatch};
use surveillance::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = AppConfig::from_env()?;
    cli.apply(&mut cfg);

    common::logger::init_logger("surveillance", cfg.json_logs);

    dispatch(cli.command, &cfg).await
}
