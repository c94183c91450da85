//! Launcher side cleanup of dispatches: termination, waiting for the terminal state and
//! removal of the dispatch environment together with its stored record.

use std::sync::Arc;
use std::time::Duration;

use crate::launcher::LauncherClient;
use crate::rm::watcher::DispatchWatcher;
use crate::store::DispatchStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The launcher refused the termination. The stored dispatch is kept for a later attempt.
    Failed,
    /// The watcher still tracks the dispatch and will clean it up when it finishes.
    LeftToWatcher,
    /// The dispatch finished (or the wait expired) and its environment removal was attempted.
    Cleaned,
}

#[derive(Clone)]
pub struct DispatchCleanup {
    launcher: Arc<dyn LauncherClient>,
    store: Arc<dyn DispatchStore>,
    watcher: Arc<DispatchWatcher>,
    wait_interval: Duration,
    wait_attempts: u32,
}

impl DispatchCleanup {
    pub fn new(
        launcher: Arc<dyn LauncherClient>,
        store: Arc<dyn DispatchStore>,
        watcher: Arc<DispatchWatcher>,
        wait_interval: Duration,
        wait_attempts: u32,
    ) -> Self {
        Self {
            launcher,
            store,
            watcher,
            wait_interval,
            wait_attempts,
        }
    }

    /// Terminates the dispatch. Returns `true` if its environment may be removed now.
    /// A dispatch the launcher no longer knows counts as terminated.
    pub async fn terminate(&self, user: &str, dispatch_id: &str) -> bool {
        if dispatch_id.is_empty() {
            log::warn!("Missing dispatch id, skipping environment cleanup");
            return false;
        }
        match self.launcher.terminate(user, dispatch_id).await {
            Ok(()) => log::info!("Terminated dispatch {dispatch_id}"),
            Err(error) if error.is_not_found() => {
                log::debug!("Dispatch {dispatch_id} is already gone from the launcher")
            }
            Err(error) => {
                log::error!("Could not terminate dispatch {dispatch_id}: {error}");
                return false;
            }
        }
        self.watcher.mark_terminated(dispatch_id);
        true
    }

    /// Removes the launcher environment of the dispatch and, on success, its stored record.
    pub async fn remove_environment(&self, user: &str, dispatch_id: &str) -> bool {
        match self.launcher.delete_environment(user, dispatch_id).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                log::debug!("Environment of dispatch {dispatch_id} is already gone")
            }
            Err(error) => {
                log::error!("Could not delete environment of dispatch {dispatch_id}: {error}");
                return false;
            }
        }
        match self.store.delete_dispatch(dispatch_id).await {
            Ok(count) => {
                log::trace!("Deleted dispatch {dispatch_id} from the store, count {count}");
                true
            }
            Err(error) => {
                log::error!("Could not delete dispatch {dispatch_id} from the store: {error}");
                false
            }
        }
    }

    /// Waits a bounded time for the launcher to report the dispatch as finished.
    pub async fn wait_for_terminal_state(&self, user: &str, dispatch_id: &str) {
        for _ in 0..self.wait_attempts {
            if !self.watcher.is_in_progress(user, dispatch_id).await {
                return;
            }
            log::debug!("Dispatch {dispatch_id} still active, waiting for termination");
            tokio::time::sleep(self.wait_interval).await;
        }
        log::warn!("Dispatch {dispatch_id} still active, but wait time exceeded. Continuing...");
    }

    /// Terminates the dispatch and removes its environment unless the watcher
    /// will do that once it observes the final state.
    pub async fn terminate_and_delete(&self, user: &str, dispatch_id: &str) -> TerminateOutcome {
        if !self.terminate(user, dispatch_id).await {
            return TerminateOutcome::Failed;
        }
        if self.watcher.is_monitored(dispatch_id) {
            log::debug!(
                "Not removing environment of dispatch {dispatch_id} because it is being monitored"
            );
            return TerminateOutcome::LeftToWatcher;
        }
        self.wait_for_terminal_state(user, dispatch_id).await;
        self.remove_environment(user, dispatch_id).await;
        TerminateOutcome::Cleaned
    }

    /// Cleanup after a synchronous resource query, whose dispatch is never monitored
    /// nor stored.
    pub async fn resource_query_post_actions(&self, user: &str, dispatch_id: &str) {
        if self.terminate(user, dispatch_id).await {
            self.remove_environment(user, dispatch_id).await;
        }
    }
}
