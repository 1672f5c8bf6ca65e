use anyhow::Result;
use clap::Parser;

use layerproxy::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log, settings.verbose)?;
    run(settings).await
}
