//! Shared deadline table for external processes.
//!
//! Every process registered here gets a watchdog task. When its deadline
//! passes (or [`ProcessRegistry::shutdown_process`] is called) the watchdog
//! asks the process to terminate, waits up to the terminate timeout, and
//! then kills it. Removing the process cancels the watchdog.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a terminating process is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest wait after a hard kill.
const MIN_KILL_WAIT: Duration = Duration::from_millis(500);

/// A process the registry can stop.
pub trait ManagedChild: Send + Sync {
    fn label(&self) -> &str;

    fn pid(&self) -> Option<u32>;

    /// Ask the process to exit.
    fn terminate(&self);

    /// Kill the process outright.
    fn kill(&self);

    fn is_alive(&self) -> bool;
}

/// Where a registered process is on its way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    Terminating,
    Killing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    label: String,
    state: Arc<Mutex<TerminationState>>,
    /// Stop watching
    cancel: CancellationToken,
    /// Start the termination ladder now
    shutdown: CancellationToken,
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Arc<DashMap<RegistrationId, Entry>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `child`, terminating it once `timeout` has passed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_process(
        &self,
        child: Arc<dyn ManagedChild>,
        timeout: Duration,
        terminate_timeout: Duration,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(Mutex::new(TerminationState::Running));
        let cancel = CancellationToken::new();
        let shutdown = CancellationToken::new();

        debug!(
            registration = %id,
            process = child.label(),
            timeout_ms = timeout.as_millis() as u64,
            "Registered process"
        );
        self.entries.insert(
            id,
            Entry {
                label: child.label().to_string(),
                state: state.clone(),
                cancel: cancel.clone(),
                shutdown: shutdown.clone(),
            },
        );

        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(
                        process = child.label(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Process timed out, terminating"
                    );
                }
            }
            run_ladder(child.as_ref(), &state, terminate_timeout).await;
            *state.lock() = TerminationState::Finished;
            entries.remove(&id);
        });
        id
    }

    /// Stop watching a process. Returns whether it was registered.
    pub fn remove_process(&self, id: RegistrationId) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(registration = %id, process = %entry.label, "Unregistered process");
                true
            }
            None => false,
        }
    }

    /// Start terminating a registered process now.
    pub fn shutdown_process(&self, id: RegistrationId) -> bool {
        match self.entries.get(&id) {
            Some(entry) => {
                entry.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Start terminating every registered process.
    pub fn shutdown_all(&self) {
        let count = self.entries.len();
        if count > 0 {
            info!(count, "Shutting down registered processes");
        }
        for entry in self.entries.iter() {
            entry.shutdown.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: RegistrationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn state(&self, id: RegistrationId) -> Option<TerminationState> {
        self.entries.get(&id).map(|entry| *entry.state.lock())
    }
}

/// Terminate, wait, kill, wait. Once started the ladder runs to the end,
/// even if the process is unregistered meanwhile.
async fn run_ladder(child: &dyn ManagedChild, state: &Mutex<TerminationState>, terminate_timeout: Duration) {
    *state.lock() = TerminationState::Terminating;
    child.terminate();
    if wait_for_exit(child, terminate_timeout).await {
        return;
    }

    warn!(
        process = child.label(),
        pid = child.pid(),
        "Process ignored termination, killing"
    );
    *state.lock() = TerminationState::Killing;
    child.kill();
    if !wait_for_exit(child, terminate_timeout.max(MIN_KILL_WAIT)).await {
        warn!(process = child.label(), pid = child.pid(), "Process still alive after kill");
    }
}

/// Whether the process exited within `limit`.
async fn wait_for_exit(child: &dyn ManagedChild, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !child.is_alive() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
