use anyhow::Result;
use clap::Parser;
use retry_dlq::{cli::Cli, run};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
