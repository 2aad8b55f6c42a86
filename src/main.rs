use anyhow::Result;
use clap::Parser;
use market_data_ingestor::cli::{execute_command, Cli};
use market_data_ingestor::config::{init_logging, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::load()?;
    init_logging(&settings.log_level);

    execute_command(cli.command, settings).await
}
