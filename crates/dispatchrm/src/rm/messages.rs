use serde::Serialize;

use crate::common::rpc::{ResponseToken, RpcReceiver, RpcSender, make_rpc_queue};
use crate::launcher::DispatchState;
use crate::launcher::manifest::TaskSpec;
use crate::rm::pools::{Agent, PoolValidation, ResourcePoolSummary};
use crate::rm::tasklist::{AllocationSummary, JobQueueInfo, JobStats, PoolQueueStats};
use crate::store::Dispatch;
use crate::{AllocationId, DispatchId, GroupId, JobId, Map, ResourcesId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourcesState {
    Queued,
    Assigned,
    Pulling,
    Running,
    Terminated,
    Unknown,
}

impl ResourcesState {
    /// Translates a launcher state. An image pull in progress overrides the reported state.
    pub fn from_dispatch(is_pulling_image: bool, state: DispatchState) -> Self {
        if is_pulling_image {
            return ResourcesState::Pulling;
        }
        match state {
            DispatchState::Pending => ResourcesState::Assigned,
            DispatchState::Running | DispatchState::Terminating => ResourcesState::Running,
            DispatchState::Completed | DispatchState::Failed | DispatchState::Terminated => {
                ResourcesState::Terminated
            }
            DispatchState::Unknown => ResourcesState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulingState {
    Queued,
    Scheduled,
}

impl SchedulingState {
    pub fn from_dispatch(state: DispatchState) -> Self {
        match state {
            DispatchState::Pending => SchedulingState::Queued,
            _ => SchedulingState::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    ResourcesFailed,
    ResourcesAborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcesFailure {
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ResourcesFailure {
    pub fn failed(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            kind: FailureKind::ResourcesFailed,
            message: message.into(),
            exit_code,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ResourcesAborted,
            message: message.into(),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Resources assigned to an allocation. Starting and killing them goes through
/// the resource manager mailbox.
#[derive(Debug, Clone)]
pub struct DispatcherResources {
    pub resources_id: ResourcesId,
    pub allocation_id: AllocationId,
    pub group: GroupId,
    pub rendezvous_interface: Option<String>,
    pub proxy_interface: Option<String>,
    rm: RpcSender<RmMessage>,
}

impl DispatcherResources {
    pub(crate) fn new(
        resources_id: ResourcesId,
        allocation_id: AllocationId,
        group: GroupId,
        rendezvous_interface: Option<String>,
        proxy_interface: Option<String>,
        rm: RpcSender<RmMessage>,
    ) -> Self {
        Self {
            resources_id,
            allocation_id,
            group,
            rendezvous_interface,
            proxy_interface,
            rm,
        }
    }

    /// Asks the resource manager to launch `spec` on these resources.
    pub fn start(&self, mut spec: TaskSpec) {
        if let Some(iface) = &self.rendezvous_interface {
            spec.environment
                .insert("DISPATCHRM_RENDEZVOUS_IFACE".to_string(), iface.clone());
        }
        if let Some(iface) = &self.proxy_interface {
            spec.environment
                .insert("DISPATCHRM_PROXY_IFACE".to_string(), iface.clone());
        }
        spec.environment
            .insert("DISPATCHRM_RESOURCES_ID".to_string(), self.resources_id.clone());
        self.send(RmMessage::StartResources {
            allocation_id: self.allocation_id.clone(),
            resources_id: self.resources_id.clone(),
            spec,
        });
    }

    pub fn kill(&self) {
        self.send(RmMessage::KillResources {
            allocation_id: self.allocation_id.clone(),
            resources_id: self.resources_id.clone(),
        });
    }

    fn send(&self, message: RmMessage) {
        if self.rm.send(message).is_err() {
            log::warn!(
                "Resource manager stopped, cannot handle resources {}",
                self.resources_id
            );
        }
    }
}

/// Events sent to the owner of an allocation.
#[derive(Debug, Clone)]
pub enum AllocationEvent {
    ResourcesAllocated {
        allocation_id: AllocationId,
        resources: DispatcherResources,
    },
    ResourcesStateChanged {
        resources_id: ResourcesId,
        state: ResourcesState,
        /// Set only for terminal states that were not a success.
        failure: Option<ResourcesFailure>,
    },
    ContainerLog {
        message: String,
        level: LogLevel,
    },
    ReleaseResources {
        force_preemption: bool,
    },
}

/// Receiving side of an allocation. The id also identifies the owner's default group.
#[derive(Debug, Clone)]
pub struct AllocationOwner {
    pub id: GroupId,
    sender: RpcSender<AllocationEvent>,
}

impl AllocationOwner {
    pub fn new(id: GroupId) -> (Self, RpcReceiver<AllocationEvent>) {
        let (sender, receiver) = make_rpc_queue();
        (Self { id, sender }, receiver)
    }

    pub fn send(&self, event: AllocationEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Owner {} of an allocation is gone, dropping event", self.id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocateRequest {
    /// A random id is assigned when empty.
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub slots_needed: u32,
    pub resource_pool: String,
    /// Defaults to the group of the owner.
    pub group: Option<GroupId>,
    pub owner: AllocationOwner,
    /// The allocation existed before a restart and its dispatch should be reattached.
    pub restore: bool,
}

#[derive(Debug)]
pub enum RmMessage {
    // Allocation lifecycle
    AllocateRequest(AllocateRequest),
    StartResources {
        allocation_id: AllocationId,
        resources_id: ResourcesId,
        spec: TaskSpec,
    },
    KillResources {
        allocation_id: AllocationId,
        resources_id: ResourcesId,
    },
    SetAllocationName {
        allocation_id: AllocationId,
        name: String,
    },
    PendingPreemption {
        allocation_id: AllocationId,
    },
    NotifyContainerRunning {
        allocation_id: AllocationId,
        rank: u32,
        num_peers: u32,
        node_name: String,
    },
    ResourcesReleased {
        allocation_id: AllocationId,
    },

    // Internal events
    DispatchStateChange {
        dispatch_id: DispatchId,
        state: DispatchState,
        is_pulling_image: bool,
        hpc_job_id: Option<String>,
    },
    DispatchExited {
        dispatch_id: DispatchId,
        exit_code: i32,
        message: String,
    },
    SchedulerTick,
    /// Result of looking up the stored dispatch of a restored allocation.
    RestoreLookup {
        allocation_id: AllocationId,
        dispatch: crate::Result<Option<Dispatch>>,
    },
    /// A launch could not be submitted, the resources are terminated with `reason`.
    LaunchFailed {
        allocation_id: AllocationId,
        resources_id: ResourcesId,
        reason: String,
    },

    // Groups
    SetGroupMaxSlots {
        group: GroupId,
        max_slots: Option<u32>,
    },
    SetGroupWeight {
        group: GroupId,
        weight: f64,
        response: ResponseToken<crate::Result<()>>,
    },
    SetGroupPriority {
        group: GroupId,
        priority: i32,
        response: ResponseToken<crate::Result<()>>,
    },
    GroupStopped {
        group: GroupId,
    },

    // Job queue
    MoveJob {
        job_id: JobId,
        ahead_of: JobId,
        response: ResponseToken<crate::Result<()>>,
    },
    DeleteJob {
        job_id: JobId,
        response: ResponseToken<crate::Result<()>>,
    },
    GetJobQueueStats {
        pools: Vec<String>,
        response: ResponseToken<Vec<PoolQueueStats>>,
    },
    GetJobQStats {
        pool: String,
        response: ResponseToken<JobStats>,
    },
    GetJobQ {
        pool: String,
        response: ResponseToken<Map<JobId, JobQueueInfo>>,
    },
    GetAllocationSummary {
        allocation_id: AllocationId,
        response: ResponseToken<Option<AllocationSummary>>,
    },
    GetAllocationSummaries(ResponseToken<Map<AllocationId, AllocationSummary>>),

    // Pools and agents
    GetResourcePools(ResponseToken<Vec<ResourcePoolSummary>>),
    GetDefaultComputePool(ResponseToken<String>),
    GetDefaultAuxPool(ResponseToken<String>),
    HasResourcePool {
        pool: String,
        response: ResponseToken<PoolValidation>,
    },
    /// Partition that a task asking for `slots` from `pool` is launched into.
    ResolveResourcePool {
        pool: String,
        slots: u32,
        response: ResponseToken<crate::Result<String>>,
    },
    ValidateCommandResources {
        slots: u32,
        response: ResponseToken<bool>,
    },
    GetAgents(ResponseToken<Vec<Agent>>),
    EnableAgent {
        agent_id: String,
        response: ResponseToken<crate::Result<Option<Agent>>>,
    },
    DisableAgent {
        agent_id: String,
        response: ResponseToken<crate::Result<Agent>>,
    },

    Quit,
}
