use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tcode",
    version,
    about = "Run a transcoder under supervision and stream its buffered output",
    long_about = None
)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "TCODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a transcoder and stream what it writes to stdout
    Run {
        /// Write the stream here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Start streaming at this byte of the output
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Data (MB) buffered before the first read returns
        #[arg(long, default_value_t = 1.0)]
        min_buffer_mb: f64,

        /// Ring buffer capacity (MB)
        #[arg(long, default_value_t = 100.0)]
        max_buffer_mb: f64,

        /// Position (seconds) the transcoder was started at, shifts timestamps
        #[arg(long, default_value_t = 0.0)]
        seek: f64,

        /// Also shift SCR fields when seeking
        #[arg(long)]
        shift_scr: bool,

        /// Stop the transcoder after this many milliseconds
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Run a short-lived command and print its output lines
    Capture {
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Print the effective configuration
    Config,
}
