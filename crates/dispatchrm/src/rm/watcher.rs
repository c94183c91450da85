use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;

use crate::common::rpc::RpcSender;
use crate::launcher::{DispatchState, DispatchStatus, LauncherClient, LauncherResult};
use crate::rm::messages::RmMessage;
use crate::{DispatchId, Map, Set};

#[derive(Debug)]
struct WatchedDispatch {
    user: String,
    payload_name: String,
    last_state: Option<DispatchState>,
    is_pulling_image: bool,
    hpc_job_id: Option<String>,
    /// Terminated on request; a missing dispatch is then an expected outcome.
    terminated: bool,
    running_ranks: Set<u32>,
    running_reported: bool,
}

/// Polls the launcher for every dispatch that is submitted but not finished yet and
/// reports state transitions into the resource manager mailbox.
pub struct DispatchWatcher {
    launcher: Arc<dyn LauncherClient>,
    sender: RpcSender<RmMessage>,
    interval: Duration,
    dispatches: Mutex<Map<DispatchId, WatchedDispatch>>,
}

impl DispatchWatcher {
    pub fn new(
        launcher: Arc<dyn LauncherClient>,
        sender: RpcSender<RmMessage>,
        interval: Duration,
    ) -> Self {
        Self {
            launcher,
            sender,
            interval,
            dispatches: Default::default(),
        }
    }

    /// Starts tracking a dispatch. Returns `false` if it was already tracked.
    pub fn monitor(&self, user: &str, dispatch_id: &str, payload_name: &str) -> bool {
        let Ok(mut dispatches) = self.dispatches.lock() else {
            return false;
        };
        if dispatches.contains_key(dispatch_id) {
            log::debug!("Dispatch {dispatch_id} is already monitored");
            return false;
        }
        log::debug!("Monitoring dispatch {dispatch_id} of user {user}");
        dispatches.insert(
            dispatch_id.to_string(),
            WatchedDispatch {
                user: user.to_string(),
                payload_name: payload_name.to_string(),
                last_state: None,
                is_pulling_image: false,
                hpc_job_id: None,
                terminated: false,
                running_ranks: Set::new(),
                running_reported: false,
            },
        );
        true
    }

    /// Records that the dispatch was terminated on request. It keeps being polled until
    /// the launcher reports it finished or no longer knows it.
    pub fn mark_terminated(&self, dispatch_id: &str) {
        if let Ok(mut dispatches) = self.dispatches.lock() {
            if let Some(dispatch) = dispatches.get_mut(dispatch_id) {
                dispatch.terminated = true;
            }
        }
    }

    pub fn unmonitor(&self, dispatch_id: &str) {
        if let Ok(mut dispatches) = self.dispatches.lock() {
            dispatches.remove(dispatch_id);
        }
    }

    pub fn is_monitored(&self, dispatch_id: &str) -> bool {
        self.dispatches
            .lock()
            .map(|d| d.contains_key(dispatch_id))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn monitored_count(&self) -> usize {
        self.dispatches.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Asks the launcher directly whether the dispatch is still active.
    /// An unreachable launcher counts as active.
    pub async fn is_in_progress(&self, user: &str, dispatch_id: &str) -> bool {
        match self.launcher.query_status(user, dispatch_id).await {
            Ok(status) => !status.state.is_terminal(),
            Err(error) if error.is_not_found() => false,
            Err(error) => {
                log::debug!("Could not query status of dispatch {dispatch_id}: {error}");
                true
            }
        }
    }

    /// Records that container `rank` of the dispatch runs on `node_name`. Once all
    /// `num_peers` containers reported, the dispatch is reported as running without
    /// waiting for the next poll. Returns `false` for dispatches that are not monitored.
    pub fn notify_container_running(
        &self,
        dispatch_id: &str,
        rank: u32,
        num_peers: u32,
        node_name: &str,
    ) -> bool {
        let message = {
            let Ok(mut dispatches) = self.dispatches.lock() else {
                return false;
            };
            let Some(dispatch) = dispatches.get_mut(dispatch_id) else {
                return false;
            };
            log::debug!(
                "Container {rank}/{num_peers} of dispatch {dispatch_id} ({}) runs on {node_name}",
                dispatch.payload_name
            );
            dispatch.running_ranks.insert(rank);
            if dispatch.running_reported || (dispatch.running_ranks.len() as u32) < num_peers {
                None
            } else {
                dispatch.running_reported = true;
                dispatch.last_state = Some(DispatchState::Running);
                dispatch.is_pulling_image = false;
                Some(RmMessage::DispatchStateChange {
                    dispatch_id: dispatch_id.to_string(),
                    state: DispatchState::Running,
                    is_pulling_image: false,
                    hpc_job_id: dispatch.hpc_job_id.clone(),
                })
            }
        };
        if let Some(message) = message {
            self.send(message);
        }
        true
    }

    /// Polls the launcher until the resource manager mailbox is closed.
    pub async fn watch(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.sender.is_closed() {
                break;
            }
            self.poll_once().await;
        }
        log::debug!("Dispatch watcher stopped");
    }

    /// Queries all monitored dispatches concurrently and reports changes.
    pub async fn poll_once(&self) {
        let targets: Vec<(DispatchId, String)> = match self.dispatches.lock() {
            Ok(dispatches) => dispatches
                .iter()
                .map(|(id, d)| (id.clone(), d.user.clone()))
                .collect(),
            Err(_) => return,
        };
        if targets.is_empty() {
            return;
        }
        let results = join_all(targets.into_iter().map(|(dispatch_id, user)| {
            let query = self.launcher.query_status(&user, &dispatch_id);
            async move { (dispatch_id, query.await) }
        }))
        .await;

        let messages: Vec<RmMessage> = results
            .into_iter()
            .filter_map(|(dispatch_id, result)| self.process_status(dispatch_id, result))
            .collect();
        for message in messages {
            self.send(message);
        }
    }

    fn process_status(
        &self,
        dispatch_id: DispatchId,
        result: LauncherResult<DispatchStatus>,
    ) -> Option<RmMessage> {
        let mut dispatches = self.dispatches.lock().ok()?;
        match result {
            Ok(status) if status.state.is_terminal() => {
                let dispatch = dispatches.remove(&dispatch_id)?;
                let exit_code = status.exit_code.unwrap_or(match status.state {
                    DispatchState::Completed => 0,
                    DispatchState::Terminated if dispatch.terminated => -1,
                    _ => 1,
                });
                log::debug!(
                    "Dispatch {dispatch_id} finished in state {:?} with exit code {exit_code}",
                    status.state
                );
                Some(RmMessage::DispatchExited {
                    dispatch_id,
                    exit_code,
                    message: status.message,
                })
            }
            Ok(status) => {
                let dispatch = dispatches.get_mut(&dispatch_id)?;
                let new_job_id = dispatch.hpc_job_id.is_none() && status.hpc_job_id.is_some();
                let changed = dispatch.last_state != Some(status.state)
                    || dispatch.is_pulling_image != status.is_pulling_image
                    || new_job_id;
                if !changed {
                    return None;
                }
                dispatch.last_state = Some(status.state);
                dispatch.is_pulling_image = status.is_pulling_image;
                if new_job_id {
                    dispatch.hpc_job_id = status.hpc_job_id.clone();
                }
                Some(RmMessage::DispatchStateChange {
                    dispatch_id,
                    state: status.state,
                    is_pulling_image: status.is_pulling_image,
                    hpc_job_id: dispatch.hpc_job_id.clone(),
                })
            }
            Err(error) if error.is_not_found() => {
                let dispatch = dispatches.remove(&dispatch_id)?;
                if dispatch.terminated {
                    Some(RmMessage::DispatchExited {
                        dispatch_id,
                        exit_code: -1,
                        message: String::new(),
                    })
                } else {
                    log::warn!("Dispatch {dispatch_id} is no longer known to the launcher");
                    Some(RmMessage::DispatchExited {
                        message: format!(
                            "Dispatch {dispatch_id} was lost by the launcher, the job status is unknown"
                        ),
                        dispatch_id,
                        exit_code: 1,
                    })
                }
            }
            Err(error) => {
                log::warn!("Could not query status of dispatch {dispatch_id}: {error}");
                None
            }
        }
    }

    fn send(&self, message: RmMessage) {
        if self.sender.send(message).is_err() {
            log::debug!("Resource manager stopped, dropping dispatch watcher event");
        }
    }
}
