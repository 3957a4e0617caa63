use clap::{Parser, Subcommand};

use crate::protocol::commands::RealTimeReading;

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(about = "Talks to a COLMI R02 smart ring over Bluetooth LE.\n\nExample: halo-ring stream --reading heart-rate --seconds 30", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Print the session timeline as JSON once the command is done.
    #[arg(long, global = true)]
    pub timeline: bool,

    /// Log level for stderr and LOG_FILE.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: log::LevelFilter,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scan for a ring and remember it.
    Pair,

    /// Forget the remembered ring.
    Forget,

    /// Print the battery level and charging state.
    Battery,

    /// Stream real-time readings.
    Stream {
        #[arg(long, value_enum, default_value = "heart-rate")]
        reading: RealTimeReading,

        /// How long to stream for.
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}
