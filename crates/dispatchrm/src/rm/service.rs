use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::common::config::RmConfig;
use crate::common::error::RmError;
use crate::common::rpc::{RpcSender, initiate_request, make_rpc_queue, notify_after};
use crate::launcher::LauncherClient;
use crate::rm::config::RmTimings;
use crate::rm::messages::{AllocateRequest, RmMessage};
use crate::rm::pools::{Agent, PoolValidation, ResourcePoolSummary};
use crate::rm::process::{RmContext, RmState, rm_process};
use crate::rm::reconcile::{find_orphaned_dispatches, terminate_orphaned_dispatches};
use crate::rm::tasklist::{AllocationSummary, JobQueueInfo, JobStats, PoolQueueStats};
use crate::store::DispatchStore;
use crate::{AllocationId, GroupId, JobId, Map};

/// Handle of a running resource manager.
#[derive(Clone)]
pub struct RmService {
    sender: RpcSender<RmMessage>,
}

fn response<T>(receiver: oneshot::Receiver<T>) -> impl Future<Output = crate::Result<T>> {
    async move { receiver.await.map_err(|_| RmError::ManagerStopped) }
}

impl RmService {
    pub fn allocate(&self, request: AllocateRequest) {
        self.send(RmMessage::AllocateRequest(request));
    }

    pub fn resources_released(&self, allocation_id: AllocationId) {
        self.send(RmMessage::ResourcesReleased { allocation_id });
    }

    pub fn set_allocation_name(&self, allocation_id: AllocationId, name: String) {
        self.send(RmMessage::SetAllocationName {
            allocation_id,
            name,
        });
    }

    pub fn pending_preemption(&self, allocation_id: AllocationId) {
        self.send(RmMessage::PendingPreemption { allocation_id });
    }

    pub fn notify_container_running(
        &self,
        allocation_id: AllocationId,
        rank: u32,
        num_peers: u32,
        node_name: String,
    ) {
        self.send(RmMessage::NotifyContainerRunning {
            allocation_id,
            rank,
            num_peers,
            node_name,
        });
    }

    pub fn set_group_max_slots(&self, group: GroupId, max_slots: Option<u32>) {
        self.send(RmMessage::SetGroupMaxSlots { group, max_slots });
    }

    pub fn group_stopped(&self, group: GroupId) {
        self.send(RmMessage::GroupStopped { group });
    }

    pub fn set_group_weight(
        &self,
        group: GroupId,
        weight: f64,
    ) -> impl Future<Output = crate::Result<()>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::SetGroupWeight {
                group,
                weight,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn set_group_priority(
        &self,
        group: GroupId,
        priority: i32,
    ) -> impl Future<Output = crate::Result<()>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::SetGroupPriority {
                group,
                priority,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn move_job(&self, job_id: JobId, ahead_of: JobId) -> impl Future<Output = crate::Result<()>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::MoveJob {
                job_id,
                ahead_of,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn delete_job(&self, job_id: JobId) -> impl Future<Output = crate::Result<()>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::DeleteJob {
                job_id,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    /// Queue statistics of the given pools, or of all pools when `pools` is empty.
    pub fn job_queue_stats(
        &self,
        pools: Vec<String>,
    ) -> impl Future<Output = crate::Result<Vec<PoolQueueStats>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetJobQueueStats {
                pools,
                response: token,
            })
        }))
    }

    pub fn job_stats(&self, pool: String) -> impl Future<Output = crate::Result<JobStats>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetJobQStats {
                pool,
                response: token,
            })
        }))
    }

    pub fn job_queue(
        &self,
        pool: String,
    ) -> impl Future<Output = crate::Result<Map<JobId, JobQueueInfo>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetJobQ {
                pool,
                response: token,
            })
        }))
    }

    pub fn allocation_summary(
        &self,
        allocation_id: AllocationId,
    ) -> impl Future<Output = crate::Result<Option<AllocationSummary>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetAllocationSummary {
                allocation_id,
                response: token,
            })
        }))
    }

    pub fn allocation_summaries(
        &self,
    ) -> impl Future<Output = crate::Result<Map<AllocationId, AllocationSummary>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetAllocationSummaries(token))
        }))
    }

    pub fn resource_pools(&self) -> impl Future<Output = crate::Result<Vec<ResourcePoolSummary>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetResourcePools(token))
        }))
    }

    pub fn default_compute_pool(&self) -> impl Future<Output = crate::Result<String>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetDefaultComputePool(token))
        }))
    }

    pub fn default_aux_pool(&self) -> impl Future<Output = crate::Result<String>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetDefaultAuxPool(token))
        }))
    }

    pub fn has_resource_pool(&self, pool: String) -> impl Future<Output = crate::Result<PoolValidation>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::HasResourcePool {
                pool,
                response: token,
            })
        }))
    }

    /// Partition behind `pool`, following configured virtual pools. An empty name
    /// selects a default pool by `slots`.
    pub fn resolve_resource_pool(
        &self,
        pool: String,
        slots: u32,
    ) -> impl Future<Output = crate::Result<String>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::ResolveResourcePool {
                pool,
                slots,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn validate_command_resources(&self, slots: u32) -> impl Future<Output = crate::Result<bool>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::ValidateCommandResources {
                slots,
                response: token,
            })
        }))
    }

    pub fn agents(&self) -> impl Future<Output = crate::Result<Vec<Agent>>> {
        response(initiate_request(|token| {
            self.sender.send(RmMessage::GetAgents(token))
        }))
    }

    pub fn enable_agent(&self, agent_id: String) -> impl Future<Output = crate::Result<Option<Agent>>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::EnableAgent {
                agent_id,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn disable_agent(&self, agent_id: String) -> impl Future<Output = crate::Result<Agent>> {
        let fut = response(initiate_request(|token| {
            self.sender.send(RmMessage::DisableAgent {
                agent_id,
                response: token,
            })
        }));
        async move { fut.await? }
    }

    pub fn quit(&self) {
        self.send(RmMessage::Quit);
    }

    fn send(&self, msg: RmMessage) {
        if let Err(error) = self.sender.send(msg) {
            log::error!("Cannot send resource manager message: {error:?}");
        }
    }
}

/// Starts the resource manager with timings taken from the `DISPATCHRM_*` environment
/// variables.
pub async fn start_resource_manager(
    config: RmConfig,
    launcher: Arc<dyn LauncherClient>,
    store: Arc<dyn DispatchStore>,
) -> crate::Result<(RmService, JoinHandle<()>)> {
    start_resource_manager_with(config, RmTimings::from_env(), launcher, store).await
}

/// Starts the resource manager and its dispatch watcher.
///
/// Before the loop starts, dispatches of finished allocations are collected from the
/// store; their termination runs in the background. The resource cache gets its
/// initial value here, a failed query is logged and retried on the next read.
pub async fn start_resource_manager_with(
    config: RmConfig,
    timings: RmTimings,
    launcher: Arc<dyn LauncherClient>,
    store: Arc<dyn DispatchStore>,
) -> crate::Result<(RmService, JoinHandle<()>)> {
    config.check_or_fail()?;
    log::info!("Starting dispatcher resource manager for {}", config.wlm);

    let config = Arc::new(config);
    let (sender, receiver) = make_rpc_queue();
    let ctx = RmContext::new(launcher, store.clone(), config.clone(), &timings, sender.clone());

    match find_orphaned_dispatches(&store).await {
        Ok(orphaned) => {
            if !orphaned.is_empty() {
                log::info!("Found {} dispatch(es) of inactive allocations", orphaned.len());
            }
            tokio::spawn(terminate_orphaned_dispatches(ctx.cleanup.clone(), orphaned));
        }
        Err(error) => log::error!("Could not list stored dispatches: {error}"),
    }

    tokio::spawn(ctx.watcher.clone().watch());
    if let Err(error) = ctx.cache.refresh_now().await {
        log::error!("Could not load the initial HPC resource details: {error}");
    }
    notify_after(sender.clone(), timings.schedule_cooldown, RmMessage::SchedulerTick);

    let handle = tokio::spawn(rm_process(RmState::new(config), ctx, receiver));
    Ok((RmService { sender }, handle))
}
