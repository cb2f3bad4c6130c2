//! beamcastd — real-time ingestion daemon for a correlator's quantized
//! intensity stream. Run `beamcastd --help` for usage.

use anyhow::Result;
use beam_ingest::StreamConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod run;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Commands::Init) {
        let example = StreamConfig::default_example();
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }

    if !cli.config.exists() {
        anyhow::bail!(
            "config file '{}' not found — run `beamcastd init > {}` to create one",
            cli.config.display(),
            cli.config.display()
        );
    }
    let config = StreamConfig::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter)?)
        .init();

    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Run { stats_interval } => run::run(&config, stats_interval)?,
    }

    Ok(())
}
