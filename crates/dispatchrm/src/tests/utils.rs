use std::sync::{Arc, Mutex};
use std::time::Duration;

use derive_builder::Builder;
use futures::FutureExt;
use futures::future::BoxFuture;
use log::LevelFilter;

use crate::common::config::RmConfig;
use crate::common::rpc::{RpcReceiver, make_rpc_queue};
use crate::launcher::manifest::{Manifest, RESOURCES_LOG_FILE, TaskSpec};
use crate::launcher::{
    DispatchState, DispatchStatus, LauncherClient, LauncherError, LauncherResult,
};
use crate::rm::cache::ResourceCache;
use crate::rm::cleanup::DispatchCleanup;
use crate::rm::config::RmTimings;
use crate::rm::messages::{AllocateRequest, AllocationEvent, AllocationOwner, RmMessage};
use crate::rm::watcher::DispatchWatcher;
use crate::common::error::RmError;
use crate::store::{AllocationRecord, Dispatch, DispatchStore, MemoryStore};
use crate::{DispatchId, GroupId, Map};

/// Inventory with a default CPU partition `debug` (node `n1`) and a GPU partition
/// `gpu` (node `g1`).
pub const INVENTORY: &str = r#"
partitions:
  - partitionName: debug
    isDefault: true
    totalNodes: 1
    totalCpuSlots: 32
    totalAvailableCpuSlots: 28
  - partitionName: gpu
    totalNodes: 1
    totalGpuSlots: 4
    totalAvailableGpuSlots: 2
nodes:
  - nodeName: n1
    partitions: [debug]
    cpuCount: 32
    cpuInUseCount: 4
  - nodeName: g1
    partitions: [gpu]
    gpuCount: 4
    gpuInUseCount: 2
"#;

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub fn fast_timings() -> RmTimings {
    RmTimings {
        schedule_cooldown: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        terminate_wait_interval: Duration::from_millis(1),
        terminate_wait_attempts: 3,
        resource_details_max_age: Duration::from_secs(60),
    }
}

pub fn task_spec() -> TaskSpec {
    TaskSpec {
        description: "train".to_string(),
        owner_username: "alice".to_string(),
        agent_user: Some("alice".to_string()),
        command: vec!["python".to_string(), "train.py".to_string()],
        ..Default::default()
    }
}

pub fn dispatch(dispatch_id: &str, allocation_id: &str) -> Dispatch {
    Dispatch {
        dispatch_id: dispatch_id.to_string(),
        resource_id: format!("r-{dispatch_id}"),
        allocation_id: allocation_id.to_string(),
        impersonated_user: "alice".to_string(),
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Request {
    #[builder(setter(into), default)]
    allocation_id: String,
    #[builder(setter(into), default = "\"t1\".to_string()")]
    task_id: String,
    #[builder(setter(into), default = "\"j1\".to_string()")]
    job_id: String,
    #[builder(setter(into), default)]
    name: String,
    #[builder(setter(into), default)]
    pool: String,
    #[builder(default = "1")]
    slots: u32,
    #[builder(default = "1")]
    owner: GroupId,
    #[builder(setter(strip_option), default)]
    group: Option<GroupId>,
    #[builder(default)]
    restore: bool,
}

impl RequestBuilder {
    /// Builds the request together with the event queue of its owner.
    pub fn build(self) -> (AllocateRequest, RpcReceiver<AllocationEvent>) {
        let Request {
            allocation_id,
            task_id,
            job_id,
            name,
            pool,
            slots,
            owner,
            group,
            restore,
        } = self.finish().unwrap();
        let (owner, events) = AllocationOwner::new(owner);
        (
            AllocateRequest {
                allocation_id,
                task_id,
                job_id,
                name,
                slots_needed: slots,
                resource_pool: pool,
                group,
                owner,
                restore,
            },
            events,
        )
    }
}

#[derive(Default)]
struct LauncherState {
    statuses: Map<DispatchId, LauncherResult<DispatchStatus>>,
    status_queries: Map<DispatchId, usize>,
    launched: Vec<(Manifest, String)>,
    launch_error: Option<LauncherError>,
    inventory: Vec<u8>,
    run_count: usize,
    run_error: Option<LauncherError>,
    terminate_error: Option<LauncherError>,
    terminated: Vec<DispatchId>,
    deleted: Vec<DispatchId>,
}

/// Launcher that keeps dispatches in memory. Launched dispatches are `d0`, `d1`, ...
/// and start as pending; unknown dispatches are reported as not found.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl MockLauncher {
    fn with<R>(&self, f: impl FnOnce(&mut LauncherState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_status(&self, dispatch_id: &str, status: DispatchStatus) {
        self.with(|s| s.statuses.insert(dispatch_id.to_string(), Ok(status)));
    }

    pub fn set_status_error(&self, dispatch_id: &str, error: LauncherError) {
        self.with(|s| s.statuses.insert(dispatch_id.to_string(), Err(error)));
    }

    pub fn status_queries(&self, dispatch_id: &str) -> usize {
        self.with(|s| s.status_queries.get(dispatch_id).copied().unwrap_or(0))
    }

    pub fn set_inventory(&self, inventory: &str) {
        self.with(|s| s.inventory = inventory.as_bytes().to_vec());
    }

    pub fn run_count(&self) -> usize {
        self.with(|s| s.run_count)
    }

    pub fn fail_run(&self, error: LauncherError) {
        self.with(|s| s.run_error = Some(error));
    }

    pub fn fail_launch(&self, error: LauncherError) {
        self.with(|s| s.launch_error = Some(error));
    }

    pub fn fail_terminate(&self, error: LauncherError) {
        self.with(|s| s.terminate_error = Some(error));
    }

    pub fn launched(&self) -> Vec<(Manifest, String)> {
        self.with(|s| s.launched.clone())
    }

    pub fn terminated(&self) -> Vec<DispatchId> {
        self.with(|s| s.terminated.clone())
    }

    pub fn deleted(&self) -> Vec<DispatchId> {
        self.with(|s| s.deleted.clone())
    }

    /// Forgets the recorded terminations and deletions, e.g. those of an inventory query.
    pub fn clear_calls(&self) {
        self.with(|s| {
            s.terminated.clear();
            s.deleted.clear();
        });
    }
}

impl LauncherClient for MockLauncher {
    fn launch(&self, manifest: Manifest, user: &str) -> BoxFuture<'static, LauncherResult<DispatchId>> {
        let result = self.with(|s| {
            if let Some(error) = &s.launch_error {
                return Err(error.clone());
            }
            let dispatch_id = format!("d{}", s.launched.len());
            s.launched.push((manifest, user.to_string()));
            s.statuses.insert(
                dispatch_id.clone(),
                Ok(DispatchStatus::new(DispatchState::Pending)),
            );
            Ok(dispatch_id)
        });
        async move { result }.boxed()
    }

    fn run(&self, _manifest: Manifest, _user: &str) -> BoxFuture<'static, LauncherResult<DispatchId>> {
        let result = self.with(|s| {
            s.run_count += 1;
            match &s.run_error {
                Some(error) => Err(error.clone()),
                None => Ok(format!("query{}", s.run_count)),
            }
        });
        async move { result }.boxed()
    }

    fn terminate(&self, _user: &str, dispatch_id: &str) -> BoxFuture<'static, LauncherResult<()>> {
        let result = self.with(|s| {
            if let Some(error) = &s.terminate_error {
                return Err(error.clone());
            }
            s.terminated.push(dispatch_id.to_string());
            if let Some(Ok(status)) = s.statuses.get_mut(dispatch_id) {
                status.state = DispatchState::Terminated;
            }
            Ok(())
        });
        async move { result }.boxed()
    }

    fn delete_environment(
        &self,
        _user: &str,
        dispatch_id: &str,
    ) -> BoxFuture<'static, LauncherResult<()>> {
        self.with(|s| s.deleted.push(dispatch_id.to_string()));
        async move { Ok(()) }.boxed()
    }

    fn load_log(
        &self,
        _user: &str,
        dispatch_id: &str,
        file_name: &str,
    ) -> BoxFuture<'static, LauncherResult<Vec<u8>>> {
        let result = if file_name == RESOURCES_LOG_FILE {
            Ok(self.with(|s| s.inventory.clone()))
        } else {
            Err(LauncherError::NotFound(dispatch_id.to_string()))
        };
        async move { result }.boxed()
    }

    fn query_status(
        &self,
        _user: &str,
        dispatch_id: &str,
    ) -> BoxFuture<'static, LauncherResult<DispatchStatus>> {
        let result = self.with(|s| {
            *s.status_queries.entry(dispatch_id.to_string()).or_default() += 1;
            s.statuses
                .get(dispatch_id)
                .cloned()
                .unwrap_or_else(|| Err(LauncherError::NotFound(dispatch_id.to_string())))
        });
        async move { result }.boxed()
    }
}

/// Store that refuses to record dispatches and otherwise behaves like [`MemoryStore`].
#[derive(Clone, Default)]
pub struct InsertFailingStore {
    inner: MemoryStore,
}

impl DispatchStore for InsertFailingStore {
    fn insert_dispatch(&self, dispatch: Dispatch) -> BoxFuture<'static, crate::Result<()>> {
        let message = format!("cannot insert dispatch {}", dispatch.dispatch_id);
        async move { Err(RmError::StoreError(message)) }.boxed()
    }

    fn delete_dispatch(&self, dispatch_id: &str) -> BoxFuture<'static, crate::Result<usize>> {
        self.inner.delete_dispatch(dispatch_id)
    }

    fn list_dispatches_by_allocation(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        self.inner.list_dispatches_by_allocation(allocation_id)
    }

    fn list_dispatches_by_job(&self, job_id: &str) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        self.inner.list_dispatches_by_job(job_id)
    }

    fn list_all_dispatches(&self) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        self.inner.list_all_dispatches()
    }

    fn allocation_by_id(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Option<AllocationRecord>>> {
        self.inner.allocation_by_id(allocation_id)
    }

    fn upsert_allocation(&self, record: AllocationRecord) -> BoxFuture<'static, crate::Result<()>> {
        self.inner.upsert_allocation(record)
    }

    fn disabled_agents(&self) -> BoxFuture<'static, crate::Result<Vec<String>>> {
        self.inner.disabled_agents()
    }

    fn set_agent_enabled(&self, agent: &str, enabled: bool) -> BoxFuture<'static, crate::Result<()>> {
        self.inner.set_agent_enabled(agent, enabled)
    }
}

/// Cleanup with the production wait bounds (6 s, 20 attempts) and a watcher that is
/// never started.
pub fn create_cleanup(
    launcher: &MockLauncher,
    store: &MemoryStore,
) -> (DispatchCleanup, Arc<DispatchWatcher>, RpcReceiver<RmMessage>) {
    let (tx, rx) = make_rpc_queue();
    let launcher: Arc<dyn LauncherClient> = Arc::new(launcher.clone());
    let watcher = Arc::new(DispatchWatcher::new(
        launcher.clone(),
        tx,
        Duration::from_millis(10),
    ));
    let cleanup = DispatchCleanup::new(
        launcher,
        Arc::new(store.clone()),
        watcher.clone(),
        Duration::from_secs(6),
        20,
    );
    (cleanup, watcher, rx)
}

pub fn create_cache(
    launcher: &MockLauncher,
    store: &MemoryStore,
    config: RmConfig,
) -> Arc<ResourceCache> {
    let (cleanup, _watcher, _rx) = create_cleanup(launcher, store);
    Arc::new(ResourceCache::new(
        Arc::new(launcher.clone()),
        cleanup,
        Arc::new(config),
        Duration::from_secs(60),
    ))
}
