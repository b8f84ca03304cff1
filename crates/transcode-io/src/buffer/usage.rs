use std::sync::Arc;

use tracing::trace;

use super::RingBuffer;
use crate::params::MEGABYTE;

/// Report buffered megabytes to the observer until the buffer is reset or dropped.
pub(super) fn spawn_reporter(buffer: &Arc<RingBuffer>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak = Arc::downgrade(buffer);
    let cancel = buffer.usage_cancel.clone();
    let period = buffer.settings.usage_interval;

    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(buffer) = weak.upgrade() else {
                break;
            };
            let buffered = buffer.buffered_bytes();
            trace!(buffered, readers = buffer.reader_count(), "Buffer usage");
            if let Some(observer) = &buffer.settings.observer {
                observer.on_buffered((buffered as f64 / MEGABYTE) as u64);
            }
        }
    });
}
