//! CLI definitions for beamcastd.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "beamcastd",
    version,
    about = "Real-time ingestion engine for a correlator's quantized intensity stream",
    long_about = None
)]
pub struct Cli {
    /// Path to the stream config file
    #[clap(long, short, default_value = "beamcast.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bind the socket and ingest until end-of-stream or Ctrl-C
    Run {
        /// How often to log aggregate event counts, in seconds
        #[clap(long, default_value = "10")]
        stats_interval: u64,
    },

    /// Print an example beamcast.toml to stdout
    Init,
}
