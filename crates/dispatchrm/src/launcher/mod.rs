//! Interface of the launcher service that submits and tracks jobs on the HPC cluster.

pub mod directives;
pub mod manifest;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DispatchId;
use crate::launcher::manifest::Manifest;

#[derive(Debug, Clone, Error)]
pub enum LauncherError {
    #[error("Launcher is unreachable: {0}")]
    Transport(String),
    #[error("Dispatch {0} not found")]
    NotFound(DispatchId),
    #[error("Launcher responded with status {status}: {message}")]
    Api { status: u16, message: String },
}

impl LauncherError {
    pub fn is_not_found(&self) -> bool {
        match self {
            LauncherError::NotFound(_) => true,
            LauncherError::Api { status, .. } => *status == 404,
            LauncherError::Transport(_) => false,
        }
    }
}

pub type LauncherResult<T> = Result<T, LauncherError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchState {
    Unknown,
    Pending,
    Running,
    Terminating,
    Terminated,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchState::Terminated | DispatchState::Completed | DispatchState::Failed
        )
    }
}

/// Status of a dispatch as reported by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchStatus {
    pub state: DispatchState,
    pub is_pulling_image: bool,
    /// Job id assigned by the workload manager once the job was queued.
    pub hpc_job_id: Option<String>,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl DispatchStatus {
    pub fn new(state: DispatchState) -> Self {
        Self {
            state,
            is_pulling_image: false,
            hpc_job_id: None,
            exit_code: None,
            message: String::new(),
        }
    }
}

/// Client of the launcher service.
///
/// The returned futures own everything they need, so they can be moved into
/// background tasks.
pub trait LauncherClient: Send + Sync {
    /// Submits the manifest asynchronously and returns the new dispatch id.
    fn launch(&self, manifest: Manifest, user: &str) -> BoxFuture<'static, LauncherResult<DispatchId>>;

    /// Submits the manifest and returns once the dispatch has finished.
    fn run(&self, manifest: Manifest, user: &str) -> BoxFuture<'static, LauncherResult<DispatchId>>;

    fn terminate(&self, user: &str, dispatch_id: &str) -> BoxFuture<'static, LauncherResult<()>>;

    /// Removes the environment the launcher keeps for a dispatch (logs, scripts, status).
    fn delete_environment(
        &self,
        user: &str,
        dispatch_id: &str,
    ) -> BoxFuture<'static, LauncherResult<()>>;

    fn load_log(
        &self,
        user: &str,
        dispatch_id: &str,
        file_name: &str,
    ) -> BoxFuture<'static, LauncherResult<Vec<u8>>>;

    fn query_status(
        &self,
        user: &str,
        dispatch_id: &str,
    ) -> BoxFuture<'static, LauncherResult<DispatchStatus>>;
}
