//! Command-line interface for boxworld.

use clap::{Parser, Subcommand};

/// Boxworld - virtual-actor checkbox pages and games
#[derive(Parser, Debug)]
#[command(name = "boxworld")]
#[command(about = "Checkbox world actor engine", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine until interrupted
    Run {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,
    },

    /// Decode a hex-encoded compressed page and print it as a grid
    Decode {
        /// Compressed page bytes in hex
        hex: String,

        /// Boxes per printed row
        #[arg(long, default_value = "64")]
        width: usize,
    },

    /// Print the layout a page or game address derives for a stream
    Layout {
        /// RNG stream: "minesweeper" or "golddigger"
        #[arg(long, default_value = "minesweeper")]
        stream: String,

        /// Page or game address in hex
        #[arg(long)]
        address: String,

        /// Board width (minesweeper only)
        #[arg(long, default_value = "8")]
        width: usize,

        /// Mine count (minesweeper only)
        #[arg(long, default_value = "10")]
        count: usize,

        /// Path to a TOML config file holding the RNG secret
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,
    },
}
