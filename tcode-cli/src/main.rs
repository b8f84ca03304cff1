mod cli;
mod commands;

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use transcode_io::TranscodeConfig;

use crate::cli::{Args, Commands};
use crate::commands::StreamOptions;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet);

    let config = match &args.config {
        Some(path) => TranscodeConfig::load(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?,
        None => TranscodeConfig::default(),
    };

    match args.command {
        Commands::Run {
            output,
            offset,
            min_buffer_mb,
            max_buffer_mb,
            seek,
            shift_scr,
            timeout_ms,
            command,
        } => {
            let options = StreamOptions {
                output: output.as_deref(),
                offset,
                min_buffer_mb,
                max_buffer_mb,
                seek,
                shift_scr,
                timeout_ms,
            };
            commands::stream(config, &command, options).await
        }
        Commands::Capture {
            timeout_ms,
            command,
        } => commands::capture(&config, &command, timeout_ms).await,
        Commands::Config => commands::show_config(&config),
    }
}

/// Logs go to stderr: stdout may be carrying the media stream.
fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();
}
