use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::ProcessHandle;

/// Stop `handle` if it is still running after `limit`, marking it failed.
///
/// Runs independently of the supervisor's wait, so a process that hangs
/// without producing output still gets stopped.
pub(super) fn spawn_watchdog(handle: &Arc<ProcessHandle>, limit: Duration) {
    let weak = Arc::downgrade(handle);
    let finished = handle.finished_token().clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = finished.cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                let Some(handle) = weak.upgrade() else {
                    return;
                };
                if handle.has_exited() {
                    return;
                }
                warn!(
                    process = handle.name(),
                    limit_ms = limit.as_millis() as u64,
                    "Process still running when the watchdog fired, stopping it"
                );
                handle.record_error(format!("stopped by watchdog after {} ms", limit.as_millis()));
                handle.stop_process();
            }
        }
    });
}
