//! syncap CLI: record synchronized captures and check the result.
//!
//! Usage:
//!   syncap record [OPTIONS] <OUTPUT>   Record until Ctrl+C or `syncap stop`
//!   syncap stop [--pid-file <PATH>]    Stop the running recorder
//!   syncap verify <OUTPUT>             Check the artifacts of a recording

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use syncap_common::config::RecorderConfig;

mod commands;

use commands::record::RecordArgs;

#[derive(Parser)]
#[command(
    name = "syncap",
    about = "Synchronized multi-source screen, audio and input recorder",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/syncap/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record until interrupted
    Record(RecordArgs),

    /// Stop the recorder named by the pid file
    Stop {
        /// Pid file of the recorder (defaults to the configured location)
        #[arg(long)]
        pid_file: Option<PathBuf>,

        /// Seconds to wait for the recorder to close
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Check a recording's artifacts for order, completeness and markers
    Verify {
        /// Output stem used when recording (e.g. out/run1)
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load_from(path)?,
        None => RecorderConfig::load(),
    };

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.logging.json |= cli.json_logs;
    syncap_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Record(args) => commands::record::run(config, args).await,
        Commands::Stop {
            pid_file,
            timeout_secs,
        } => commands::stop::run(&config, pid_file, timeout_secs).await,
        Commands::Verify { output } => commands::verify::run(output),
    }
}
