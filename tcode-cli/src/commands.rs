use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use transcode_io::process::run_process_lines;
use transcode_io::{CommandLine, OutputParams, TranscodeConfig, TranscodeSupervisor};

pub struct StreamOptions<'a> {
    pub output: Option<&'a Path>,
    pub offset: u64,
    pub min_buffer_mb: f64,
    pub max_buffer_mb: f64,
    pub seek: f64,
    pub shift_scr: bool,
    pub timeout_ms: u64,
}

fn command_line(parts: &[String]) -> Result<CommandLine> {
    let (program, args) = parts.split_first().ok_or_else(|| anyhow!("no command given"))?;
    Ok(CommandLine::new(program).args(args))
}

/// Launch the command and copy its buffered output until it ends or the
/// user interrupts.
pub async fn stream(config: TranscodeConfig, command: &[String], options: StreamOptions<'_>) -> Result<()> {
    let command = command_line(command)?;
    let supervisor = TranscodeSupervisor::native(config);
    let default_terminate = supervisor.config().default_terminate_timeout_ms;
    let params = OutputParams::new()
        .with_buffer_size(options.min_buffer_mb, options.max_buffer_mb)
        .with_time_range(options.seek, 0.0)
        .with_shift_scr(options.shift_scr)
        .with_timeout(options.timeout_ms, default_terminate);

    let handle = supervisor.launch(command, params).await;
    let Some(reader) = handle.get_input_stream(options.offset) else {
        bail!(
            "{} produced no stream: {}",
            handle.name(),
            handle.error().unwrap_or_else(|| "output refused".to_string())
        );
    };

    let mut sink: Box<dyn AsyncWrite + Send + Unpin> = match options.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut source = Box::pin(reader.into_async_read());
    let copied = tokio::select! {
        copied = tokio::io::copy(&mut source, &mut sink) => copied,
        _ = tokio::signal::ctrl_c() => {
            info!(process = handle.name(), "Interrupted, stopping transcoder");
            handle.stop_process();
            Ok(0)
        }
    };
    sink.flush().await?;
    drop(source);

    let exit_code = handle.wait().await;
    match copied {
        Ok(bytes) => debug!(process = handle.name(), bytes, "Stream finished"),
        Err(e) => warn!(process = handle.name(), error = %e, "Stream ended early"),
    }
    for line in handle.results().iter().rev().take(5).rev() {
        debug!(process = handle.name(), "{line}");
    }

    match exit_code {
        Some(0) => Ok(()),
        _ if handle.is_destroyed() => Ok(()),
        Some(code) => bail!("{} exited with code {code}", handle.name()),
        None => bail!(
            "{} did not exit normally{}",
            handle.name(),
            handle.error().map(|e| format!(": {e}")).unwrap_or_default()
        ),
    }
}

/// Run a short-lived command and print each output line.
pub async fn capture(config: &TranscodeConfig, command: &[String], timeout_ms: u64) -> Result<()> {
    let command = command_line(command)?;
    let supervisor = TranscodeSupervisor::native(config.clone());
    let result = run_process_lines(
        supervisor.registry(),
        &command,
        timeout_ms,
        config.default_terminate_timeout_ms,
    )
    .await;

    if let Some(e) = result.error {
        return Err(e.into());
    }
    for line in result.output.unwrap_or_default() {
        println!("{line}");
    }
    if result.exit_code != 0 {
        bail!("{command} exited with code {}", result.exit_code);
    }
    Ok(())
}

pub fn show_config(config: &TranscodeConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
