use clap::Parser;
use tracing_subscriber::EnvFilter;

use scene_fit::cli::Cli;
use scene_fit::commands::run_fit;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    run_fit(&cli.param_file)?;
    Ok(())
}
