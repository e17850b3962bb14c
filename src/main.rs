use clap::Parser;
use tributary::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File and environment first, then command-line overrides
    let config = cli.load_config()?;
    cli.init_logging(&config)?;

    cli.execute(config).await?;

    Ok(())
}
