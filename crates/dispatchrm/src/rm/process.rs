use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use crate::common::config::{RmConfig, SlotType, WlmType};
use crate::common::error::RmError;
use crate::common::rpc::{RpcReceiver, RpcSender, notify_after};
use crate::launcher::manifest::{ManifestParams, ROOT_USER, TaskSpec, build_task_manifest};
use crate::launcher::{DispatchState, LauncherClient};
use crate::rm::cache::ResourceCache;
use crate::rm::cleanup::{DispatchCleanup, TerminateOutcome};
use crate::rm::config::RmTimings;
use crate::rm::messages::{
    AllocateRequest, AllocationEvent, AllocationOwner, DispatcherResources, LogLevel,
    ResourcesFailure, ResourcesState, RmMessage, SchedulingState,
};
use crate::rm::pools::{
    Agent, agents, find_agent, resolve_resource_pool, resolve_slot_type, summarize_pools,
    validate_pool,
};
use crate::rm::registry::DispatchRegistry;
use crate::rm::tasklist::{Group, PoolQueueStats, TaskEntry, TaskList};
use crate::rm::watcher::DispatchWatcher;
use crate::store::{Dispatch, DispatchStore};
use crate::{
    AllocationId, DispatchId, GroupId, JobId, Map, ResourcesId, Set, get_or_return, get_or_warn,
};

const UNNAMED_JOB_NAME: &str = "Unnamed-Launcher-Job";
const RESTORE_FAILED_MESSAGE: &str = "Unable to locate HPC job on restart.";
const CANCELED_MESSAGE: &str = "Job was canceled";

/// State owned by the resource manager loop. Nothing else mutates it.
pub(crate) struct RmState {
    config: Arc<RmConfig>,
    tasks: TaskList,
    groups: Map<GroupId, Group>,
}

impl RmState {
    pub(crate) fn new(config: Arc<RmConfig>) -> Self {
        Self {
            config,
            tasks: Default::default(),
            groups: Default::default(),
        }
    }

    fn group_mut(&mut self, group: GroupId) -> &mut Group {
        self.groups.entry(group).or_default()
    }
}

/// Shared collaborators of the loop. Background work gets a clone and reports back
/// through `mailbox`.
#[derive(Clone)]
pub(crate) struct RmContext {
    pub launcher: Arc<dyn LauncherClient>,
    pub store: Arc<dyn DispatchStore>,
    pub registry: Arc<DispatchRegistry>,
    pub cache: Arc<ResourceCache>,
    pub watcher: Arc<DispatchWatcher>,
    pub cleanup: DispatchCleanup,
    pub mailbox: RpcSender<RmMessage>,
    pub schedule_cooldown: Duration,
}

impl RmContext {
    pub(crate) fn new(
        launcher: Arc<dyn LauncherClient>,
        store: Arc<dyn DispatchStore>,
        config: Arc<RmConfig>,
        timings: &RmTimings,
        mailbox: RpcSender<RmMessage>,
    ) -> Self {
        let watcher = Arc::new(DispatchWatcher::new(
            launcher.clone(),
            mailbox.clone(),
            timings.poll_interval,
        ));
        let cleanup = DispatchCleanup::new(
            launcher.clone(),
            store.clone(),
            watcher.clone(),
            timings.terminate_wait_interval,
            timings.terminate_wait_attempts,
        );
        let cache = Arc::new(ResourceCache::new(
            launcher.clone(),
            cleanup.clone(),
            config,
            timings.resource_details_max_age,
        ));
        Self {
            launcher,
            store,
            registry: Arc::new(DispatchRegistry::new()),
            cache,
            watcher,
            cleanup,
            mailbox,
            schedule_cooldown: timings.schedule_cooldown,
        }
    }
}

/// Main loop of the resource manager. Messages are handled one at a time and the
/// handlers never wait for the launcher or the store; such work is spawned and its
/// outcome comes back as another message.
pub(crate) async fn rm_process(
    mut state: RmState,
    ctx: RmContext,
    mut receiver: RpcReceiver<RmMessage>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            RmMessage::Quit => break,
            RmMessage::SchedulerTick => {
                handle_message(&mut state, &ctx, RmMessage::SchedulerTick);
                notify_after(
                    ctx.mailbox.clone(),
                    ctx.schedule_cooldown,
                    RmMessage::SchedulerTick,
                );
            }
            message => handle_message(&mut state, &ctx, message),
        }
    }
    log::debug!("Ending dispatcher resource manager");
}

pub(crate) fn handle_message(state: &mut RmState, ctx: &RmContext, message: RmMessage) {
    log::trace!("Handling message {message:?}");
    match message {
        RmMessage::AllocateRequest(request) => add_task(state, request),
        RmMessage::StartResources {
            allocation_id,
            resources_id,
            spec,
        } => start_resources(state, ctx, allocation_id, resources_id, spec),
        RmMessage::KillResources {
            allocation_id,
            resources_id,
        } => {
            log::info!("Killing resources {resources_id} of allocation {allocation_id}");
            tokio::spawn(stop_launcher_job(ctx.clone(), allocation_id));
        }
        RmMessage::SetAllocationName {
            allocation_id,
            name,
        } => {
            if let Some(task) = state.tasks.get_mut(&allocation_id) {
                task.request.name = name;
            }
        }
        RmMessage::PendingPreemption { allocation_id } => {
            log::info!("Pending preemption of allocation {allocation_id}, terminating");
            match state.tasks.get(&allocation_id) {
                Some(task) => task.request.owner.send(AllocationEvent::ReleaseResources {
                    force_preemption: true,
                }),
                None => log::error!("Cannot preempt unknown allocation {allocation_id}"),
            }
        }
        RmMessage::NotifyContainerRunning {
            allocation_id,
            rank,
            num_peers,
            node_name,
        } => {
            let mut notified = false;
            for dispatch_id in ctx.registry.dispatches_of(&allocation_id) {
                notified |=
                    ctx.watcher
                        .notify_container_running(&dispatch_id, rank, num_peers, &node_name);
            }
            if !notified {
                log::warn!(
                    "Container of allocation {allocation_id} is running on {node_name}, but none of its dispatches is monitored"
                );
            }
        }
        RmMessage::ResourcesReleased { allocation_id } => {
            log::info!("Resources of allocation {allocation_id} were released");
            state.tasks.remove_task(&allocation_id);
        }
        RmMessage::DispatchStateChange {
            dispatch_id,
            state: dispatch_state,
            is_pulling_image,
            hpc_job_id,
        } => dispatch_state_change(
            state,
            ctx,
            dispatch_id,
            dispatch_state,
            is_pulling_image,
            hpc_job_id,
        ),
        RmMessage::DispatchExited {
            dispatch_id,
            exit_code,
            message,
        } => dispatch_exited(state, ctx, dispatch_id, exit_code, message),
        RmMessage::SchedulerTick => schedule_pending_tasks(state, ctx),
        RmMessage::RestoreLookup {
            allocation_id,
            dispatch,
        } => restore_lookup(state, ctx, allocation_id, dispatch),
        RmMessage::LaunchFailed {
            allocation_id,
            resources_id,
            reason,
        } => {
            let task = get_or_warn!(
                state.tasks.get_mut(&allocation_id),
                "Launch of released allocation {allocation_id} failed: {reason}"
            );
            if task.resources_id() != Some(&resources_id) {
                log::debug!("Ignoring launch failure of stale resources {resources_id}");
                return;
            }
            terminate_resources(task, Some(ResourcesFailure::failed(reason, None)));
        }
        RmMessage::SetGroupMaxSlots { group, max_slots } => {
            state.group_mut(group).max_slots = max_slots;
        }
        RmMessage::SetGroupWeight { response, .. } => {
            response.respond(Err(RmError::Unsupported("Setting group weight".to_string())));
        }
        RmMessage::SetGroupPriority { response, .. } => {
            response.respond(Err(RmError::Unsupported(
                "Setting group priority".to_string(),
            )));
        }
        RmMessage::GroupStopped { group } => {
            state.groups.remove(&group);
        }
        RmMessage::MoveJob { response, .. } => {
            response.respond(Err(RmError::Unsupported("Moving jobs".to_string())));
        }
        RmMessage::DeleteJob { job_id, response } => {
            log::info!("Deleting launcher environments of job {job_id}");
            tokio::spawn(delete_job(ctx.clone(), job_id));
            response.respond(Ok(()));
        }
        RmMessage::GetJobQueueStats { pools, response } => {
            let pools = if pools.is_empty() {
                summarize_pools(&ctx.cache.get().0, &state.config)
                    .into_iter()
                    .map(|pool| pool.name)
                    .collect()
            } else {
                pools
            };
            response.respond(
                pools
                    .into_iter()
                    .map(|pool| PoolQueueStats {
                        stats: state.tasks.job_stats_by_pool(&pool),
                        resource_pool: pool,
                    })
                    .collect(),
            );
        }
        RmMessage::GetJobQStats { pool, response } => {
            if pool.is_empty() {
                response.respond(state.tasks.job_stats());
            } else {
                response.respond(state.tasks.job_stats_by_pool(&pool));
            }
        }
        RmMessage::GetJobQ { pool, response } => {
            let pool = if pool.is_empty() {
                ctx.cache.get().0.default_pool(false).to_string()
            } else {
                pool
            };
            response.respond(state.tasks.job_queue(&pool));
        }
        RmMessage::GetAllocationSummary {
            allocation_id,
            response,
        } => {
            response.respond(
                state
                    .tasks
                    .summary(&allocation_id, &state.groups, state.config.wlm),
            );
        }
        RmMessage::GetAllocationSummaries(response) => {
            response.respond(state.tasks.summaries(&state.groups, state.config.wlm));
        }
        RmMessage::GetResourcePools(response) => {
            response.respond(summarize_pools(&ctx.cache.get().0, &state.config));
        }
        RmMessage::GetDefaultComputePool(response) => {
            response.respond(ctx.cache.get().0.default_pool(false).to_string());
        }
        RmMessage::GetDefaultAuxPool(response) => {
            response.respond(ctx.cache.get().0.default_pool(true).to_string());
        }
        RmMessage::HasResourcePool { pool, response } => {
            response.respond(validate_pool(&ctx.cache.get().0, &state.config, &pool));
        }
        RmMessage::ResolveResourcePool {
            pool,
            slots,
            response,
        } => {
            response.respond(resolve_resource_pool(
                &ctx.cache.get().0,
                &state.config,
                &pool,
                slots,
            ));
        }
        RmMessage::ValidateCommandResources { response, .. } => response.respond(true),
        RmMessage::GetAgents(response) => {
            let ctx = ctx.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                let disabled = disabled_agent_set(&ctx).await.unwrap_or_else(|error| {
                    log::error!("Could not load disabled agents: {error}");
                    Set::new()
                });
                response.respond(agents(&ctx.cache.get().0, &config, &disabled));
            });
        }
        RmMessage::EnableAgent { agent_id, response } => {
            let ctx = ctx.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                response.respond(enable_agent(&ctx, &config, &agent_id).await);
            });
        }
        RmMessage::DisableAgent { agent_id, response } => {
            let ctx = ctx.clone();
            let config = state.config.clone();
            tokio::spawn(async move {
                response.respond(disable_agent(&ctx, &config, &agent_id).await);
            });
        }
        RmMessage::Quit => {}
    }
}

fn add_task(state: &mut RmState, mut request: AllocateRequest) {
    if request.allocation_id.is_empty() {
        request.allocation_id = Uuid::new_v4().to_string();
    }
    if request.name.is_empty() {
        request.name = UNNAMED_JOB_NAME.to_string();
    }
    let group = *request.group.get_or_insert(request.owner.id);
    state.group_mut(group);

    log::info!(
        "Allocation {} requests {} slot(s) from pool '{}'",
        request.allocation_id,
        request.slots_needed,
        request.resource_pool
    );
    let allocation_id = request.allocation_id.clone();
    if !state.tasks.add_task(request) {
        log::warn!("Allocation {allocation_id} is already known, ignoring the request");
    }
}

/// Assigns resources to every allocation that is still waiting for them.
pub(crate) fn schedule_pending_tasks(state: &mut RmState, ctx: &RmContext) {
    for allocation_id in state.tasks.unassigned() {
        assign_resources(state, ctx, &allocation_id);
    }
}

fn assign_resources(state: &mut RmState, ctx: &RmContext, allocation_id: &str) {
    let task = get_or_return!(state.tasks.get_mut(allocation_id));
    if task.request.restore {
        task.restoring = true;
        let store = ctx.store.clone();
        let mailbox = ctx.mailbox.clone();
        let allocation_id = allocation_id.to_string();
        tokio::spawn(async move {
            let dispatch = store
                .list_dispatches_by_allocation(&allocation_id)
                .await
                .map(|dispatches| dispatches.into_iter().next());
            let _ = mailbox.send(RmMessage::RestoreLookup {
                allocation_id,
                dispatch,
            });
        });
        return;
    }
    grant_resources(state, ctx, allocation_id, Uuid::new_v4().to_string());
}

fn grant_resources(
    state: &mut RmState,
    ctx: &RmContext,
    allocation_id: &str,
    resources_id: ResourcesId,
) {
    let task = get_or_return!(state.tasks.get_mut(allocation_id));
    let pool = &task.request.resource_pool;
    let resources = DispatcherResources::new(
        resources_id,
        allocation_id.to_string(),
        task.group(),
        state.config.rendezvous_interface(pool),
        state.config.proxy_interface(pool),
        ctx.mailbox.clone(),
    );
    log::info!(
        "Resources {} assigned to allocation {allocation_id}",
        resources.resources_id
    );
    task.resources = Some(resources.clone());
    task.request.owner.send(AllocationEvent::ResourcesAllocated {
        allocation_id: allocation_id.to_string(),
        resources,
    });
}

fn restore_lookup(
    state: &mut RmState,
    ctx: &RmContext,
    allocation_id: AllocationId,
    dispatch: crate::Result<Option<Dispatch>>,
) {
    let task = get_or_warn!(
        state.tasks.get_mut(&allocation_id),
        "Allocation {allocation_id} was released before its dispatch was restored"
    );
    task.restoring = false;
    match dispatch {
        Err(error) => {
            log::error!("Could not look up the dispatch of allocation {allocation_id}: {error}");
        }
        Ok(None) => {
            log::warn!("No dispatch found for restored allocation {allocation_id}");
            grant_resources(state, ctx, &allocation_id, Uuid::new_v4().to_string());
            if let Some(task) = state.tasks.get_mut(&allocation_id) {
                terminate_resources(task, Some(ResourcesFailure::aborted(RESTORE_FAILED_MESSAGE)));
            }
        }
        Ok(Some(dispatch)) => {
            log::info!(
                "Reattaching allocation {allocation_id} to dispatch {}",
                dispatch.dispatch_id
            );
            grant_resources(state, ctx, &allocation_id, dispatch.resource_id.clone());
            ctx.registry
                .put(dispatch.dispatch_id.clone(), allocation_id.clone());
            ctx.watcher
                .monitor(&dispatch.impersonated_user, &dispatch.dispatch_id, "");
        }
    }
}

/// Moves the resources of the task to the terminal state and notifies the owner.
/// Returns `false` if there was nothing to terminate.
fn terminate_resources(task: &mut TaskEntry, failure: Option<ResourcesFailure>) -> bool {
    if task.resources_state == ResourcesState::Terminated {
        return false;
    }
    let Some(resources_id) = task.resources_id().cloned() else {
        return false;
    };
    task.resources_state = ResourcesState::Terminated;
    task.request
        .owner
        .send(AllocationEvent::ResourcesStateChanged {
            resources_id,
            state: ResourcesState::Terminated,
            failure,
        });
    true
}

struct LaunchJob {
    allocation_id: AllocationId,
    resources_id: ResourcesId,
    slots: u32,
    resource_pool: String,
    owner: AllocationOwner,
    spec: TaskSpec,
}

fn start_resources(
    state: &mut RmState,
    ctx: &RmContext,
    allocation_id: AllocationId,
    resources_id: ResourcesId,
    spec: TaskSpec,
) {
    let task = get_or_warn!(
        state.tasks.get(&allocation_id),
        "Cannot start resources {resources_id} of unknown allocation {allocation_id}"
    );
    if task.resources_state == ResourcesState::Terminated {
        log::warn!("Resources {resources_id} of allocation {allocation_id} are already terminated");
        return;
    }
    let job = LaunchJob {
        allocation_id,
        resources_id,
        slots: task.request.slots_needed,
        resource_pool: task.request.resource_pool.clone(),
        owner: task.request.owner.clone(),
        spec,
    };
    // Launches may take a while and must not block other messages.
    tokio::spawn(start_launcher_job(ctx.clone(), state.config.clone(), job));
}

async fn start_launcher_job(ctx: RmContext, config: Arc<RmConfig>, job: LaunchJob) {
    log::info!(
        "Received request to launch job '{}' of allocation {}",
        job.spec.description,
        job.allocation_id
    );
    if let Err(error) = launch(&ctx, &config, &job).await {
        log::error!("Launch of allocation {} failed: {error:?}", job.allocation_id);
        let _ = ctx.mailbox.send(RmMessage::LaunchFailed {
            allocation_id: job.allocation_id,
            resources_id: job.resources_id,
            reason: format!("{error:#}"),
        });
    }
}

async fn launch(ctx: &RmContext, config: &RmConfig, job: &LaunchJob) -> anyhow::Result<()> {
    let resources = ctx.cache.get().0;
    let partition = resolve_resource_pool(&resources, config, &job.resource_pool, job.slots)
        .context("unable to resolve the resource pool")?;
    let slot_type = if job.slots == 0 {
        SlotType::Cpu
    } else {
        resolve_slot_type(&resources, config, &partition)
    };

    let mut tres_supported = config.tres_supported;
    if tres_supported && !config.gres_supported {
        log::warn!("tres_supported is ignored because gres_supported is disabled");
        tres_supported = false;
    }

    let disabled_agents = ctx.store.disabled_agents().await.unwrap_or_else(|error| {
        log::warn!("Could not load disabled agents, no node is excluded: {error}");
        Vec::new()
    });

    let built = build_task_manifest(
        &job.spec,
        &ManifestParams {
            allocation_id: &job.allocation_id,
            master_host: &config.master_host,
            master_port: config.master_port,
            slots: job.slots,
            slot_type,
            partition: &partition,
            tres_supported,
            gres_supported: config.gres_supported,
            wlm: config.wlm,
            disabled_agents: &disabled_agents,
        },
    )
    .context("unable to launch job")?;

    if built.impersonated_user == ROOT_USER && config.user_name != ROOT_USER {
        anyhow::bail!(
            "the job of user '{}' would run as root on the cluster, which the launcher running as '{}' refuses; link the user with an agent user",
            job.spec.owner_username,
            config.user_name
        );
    }
    if let Some(warning) = &built.warning {
        job.owner.send(AllocationEvent::ContainerLog {
            message: warning.clone(),
            level: LogLevel::Warning,
        });
    }

    let dispatch_id = ctx
        .launcher
        .launch(built.manifest, &built.impersonated_user)
        .await
        .context("unable to create the launcher job")?;
    log::info!(
        "Launched dispatch {dispatch_id} for allocation {} as user {}",
        job.allocation_id,
        built.impersonated_user
    );

    let record = Dispatch {
        dispatch_id: dispatch_id.clone(),
        resource_id: job.resources_id.clone(),
        allocation_id: job.allocation_id.clone(),
        impersonated_user: built.impersonated_user.clone(),
    };
    if let Err(error) = ctx.store.insert_dispatch(record).await {
        // Without a stored record the dispatch can be neither stopped nor swept.
        log::error!("Could not persist dispatch {dispatch_id}, terminating it");
        if ctx
            .cleanup
            .terminate(&built.impersonated_user, &dispatch_id)
            .await
        {
            ctx.cleanup
                .remove_environment(&built.impersonated_user, &dispatch_id)
                .await;
        }
        return Err(error).context("unable to persist the dispatch");
    }
    ctx.registry
        .put(dispatch_id.clone(), job.allocation_id.clone());
    ctx.watcher
        .monitor(&built.impersonated_user, &dispatch_id, &built.payload_name);
    Ok(())
}

async fn stop_launcher_job(ctx: RmContext, allocation_id: AllocationId) {
    log::info!("Received request to terminate the job of allocation {allocation_id}");
    let dispatches = match ctx.store.list_dispatches_by_allocation(&allocation_id).await {
        Ok(dispatches) => dispatches,
        Err(error) => {
            log::error!("Could not list dispatches of allocation {allocation_id}: {error}");
            return;
        }
    };
    if dispatches.is_empty() {
        log::info!(
            "Allocation {allocation_id} has no dispatch, the job was either never launched or already finished"
        );
        return;
    }
    for dispatch in dispatches {
        log::info!(
            "Terminating dispatch {} (HPC job {}) of allocation {allocation_id} as user {}",
            dispatch.dispatch_id,
            ctx.registry
                .get_job(&dispatch.dispatch_id)
                .unwrap_or_else(|| "unknown".to_string()),
            dispatch.impersonated_user
        );
        let outcome = ctx
            .cleanup
            .terminate_and_delete(&dispatch.impersonated_user, &dispatch.dispatch_id)
            .await;
        if outcome == TerminateOutcome::Cleaned {
            // Nobody watches this dispatch, so its exit has to be reported here.
            let _ = ctx.mailbox.send(RmMessage::DispatchExited {
                dispatch_id: dispatch.dispatch_id,
                exit_code: -1,
                message: CANCELED_MESSAGE.to_string(),
            });
        }
    }
}

fn dispatch_state_change(
    state: &mut RmState,
    ctx: &RmContext,
    dispatch_id: DispatchId,
    dispatch_state: DispatchState,
    is_pulling_image: bool,
    hpc_job_id: Option<String>,
) {
    let allocation_id = get_or_warn!(
        ctx.registry.get(&dispatch_id),
        "State change of unknown dispatch {dispatch_id}, ignoring"
    );
    let task = get_or_warn!(
        state.tasks.get_mut(&allocation_id),
        "State change of dispatch {dispatch_id} for unknown allocation {allocation_id}, ignoring"
    );
    let resources_id = get_or_warn!(
        task.resources_id().cloned(),
        "Allocation {allocation_id} of dispatch {dispatch_id} has no resources, ignoring"
    );

    if let Some(job_id) = hpc_job_id {
        if ctx.registry.get_job(&dispatch_id).is_none() {
            log::info!("Dispatch {dispatch_id} became HPC job {job_id}");
            task.request.owner.send(AllocationEvent::ContainerLog {
                message: format!("HPC Job ID: {job_id}"),
                level: LogLevel::Info,
            });
            ctx.registry.put_job(dispatch_id.clone(), job_id);
        }
    }

    task.scheduling_state = SchedulingState::from_dispatch(dispatch_state);
    if task.resources_state == ResourcesState::Terminated {
        log::debug!("Resources {resources_id} are terminated, ignoring state {dispatch_state:?}");
        return;
    }
    let new_state = ResourcesState::from_dispatch(is_pulling_image, dispatch_state);
    log::debug!("Dispatch {dispatch_id} is {dispatch_state:?}, resources {resources_id} are {new_state:?}");
    task.resources_state = new_state;
    task.request
        .owner
        .send(AllocationEvent::ResourcesStateChanged {
            resources_id,
            state: new_state,
            failure: None,
        });
}

fn dispatch_exited(
    state: &mut RmState,
    ctx: &RmContext,
    dispatch_id: DispatchId,
    exit_code: i32,
    message: String,
) {
    let allocation_id = get_or_warn!(
        ctx.registry.get(&dispatch_id),
        "Exit of unknown dispatch {dispatch_id}, ignoring"
    );
    log::info!("Dispatch {dispatch_id} of allocation {allocation_id} exited with code {exit_code}");

    match state.tasks.get_mut(&allocation_id) {
        Some(task) if task.resources_state != ResourcesState::Terminated => {
            if !message.trim().is_empty() {
                task.request.owner.send(AllocationEvent::ContainerLog {
                    message: message.clone(),
                    level: LogLevel::Error,
                });
            }
            let failure = match exit_code {
                code if code > 0 => Some(ResourcesFailure::failed(message, Some(code))),
                -1 => Some(ResourcesFailure::failed(message, None)),
                _ => None,
            };
            terminate_resources(task, failure);
        }
        Some(_) => log::debug!("Resources of allocation {allocation_id} are already terminated"),
        None => log::warn!("Dispatch {dispatch_id} exited, but allocation {allocation_id} is unknown"),
    }

    tokio::spawn(cleanup_exited_dispatch(
        ctx.clone(),
        state.config.keep_dispatch_environments,
        allocation_id,
        dispatch_id,
    ));
}

async fn cleanup_exited_dispatch(
    ctx: RmContext,
    keep_environments: bool,
    allocation_id: AllocationId,
    dispatch_id: DispatchId,
) {
    if keep_environments {
        log::debug!("Keeping launcher environments of allocation {allocation_id}");
    } else {
        match ctx.store.list_dispatches_by_allocation(&allocation_id).await {
            Ok(dispatches) => {
                for dispatch in dispatches {
                    log::debug!(
                        "Removing environment of dispatch {} of allocation {allocation_id}",
                        dispatch.dispatch_id
                    );
                    ctx.cleanup
                        .remove_environment(&dispatch.impersonated_user, &dispatch.dispatch_id)
                        .await;
                }
            }
            Err(error) => {
                log::error!("Could not list dispatches of allocation {allocation_id}: {error}")
            }
        }
    }
    ctx.registry.remove(&dispatch_id);
    ctx.registry.remove_job(&dispatch_id);
}

async fn delete_job(ctx: RmContext, job_id: JobId) {
    let dispatches = match ctx.store.list_dispatches_by_job(&job_id).await {
        Ok(dispatches) => dispatches,
        Err(error) => {
            log::error!("Could not list dispatches of job {job_id}: {error}");
            return;
        }
    };
    for dispatch in dispatches {
        let cleanup = ctx.cleanup.clone();
        tokio::spawn(async move {
            cleanup
                .remove_environment(&dispatch.impersonated_user, &dispatch.dispatch_id)
                .await
        });
    }
}

async fn disabled_agent_set(ctx: &RmContext) -> crate::Result<Set<String>> {
    Ok(ctx.store.disabled_agents().await?.into_iter().collect())
}

async fn enable_agent(
    ctx: &RmContext,
    config: &RmConfig,
    agent_id: &str,
) -> crate::Result<Option<Agent>> {
    ctx.store.set_agent_enabled(agent_id, true).await?;
    let disabled = disabled_agent_set(ctx).await?;
    Ok(find_agent(&ctx.cache.get().0, config, &disabled, agent_id))
}

async fn disable_agent(ctx: &RmContext, config: &RmConfig, agent_id: &str) -> crate::Result<Agent> {
    if config.wlm == WlmType::Pbs {
        return Err(RmError::Unsupported("Disabling agents on PBS".to_string()));
    }
    let resources = ctx.cache.get().0;
    if find_agent(&resources, config, &Set::new(), agent_id).is_none() {
        return Err(RmError::AgentNotFound(agent_id.to_string()));
    }
    ctx.store.set_agent_enabled(agent_id, false).await?;
    let disabled = disabled_agent_set(ctx).await?;
    find_agent(&resources, config, &disabled, agent_id)
        .ok_or_else(|| RmError::AgentNotFound(agent_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::rpc::{ResponseToken, make_rpc_queue};
    use crate::launcher::{DispatchStatus, LauncherError};
    use crate::rm::messages::FailureKind;
    use crate::store::MemoryStore;
    use crate::common::config::ResourcePoolConfig;
    use crate::tests::utils::{
        INVENTORY, InsertFailingStore, MockLauncher, RequestBuilder, dispatch, fast_timings,
        init_test_logging, task_spec,
    };

    struct TestCtx {
        state: RmState,
        ctx: RmContext,
        receiver: RpcReceiver<RmMessage>,
        launcher: MockLauncher,
        store: Arc<dyn DispatchStore>,
    }

    impl TestCtx {
        async fn new() -> Self {
            Self::with_config(RmConfig::default()).await
        }

        async fn with_config(config: RmConfig) -> Self {
            Self::with_store(config, Arc::new(MemoryStore::new())).await
        }

        async fn with_store(config: RmConfig, store: Arc<dyn DispatchStore>) -> Self {
            init_test_logging();
            let launcher = MockLauncher::default();
            launcher.set_inventory(INVENTORY);
            let config = Arc::new(config);
            let (tx, rx) = make_rpc_queue();
            let ctx = RmContext::new(
                Arc::new(launcher.clone()),
                store.clone(),
                config.clone(),
                &fast_timings(),
                tx,
            );
            ctx.cache.refresh_now().await.unwrap();
            launcher.clear_calls();
            Self {
                state: RmState::new(config),
                ctx,
                receiver: rx,
                launcher,
                store,
            }
        }

        fn handle(&mut self, message: RmMessage) {
            handle_message(&mut self.state, &self.ctx, message);
        }

        fn tick(&mut self) {
            self.handle(RmMessage::SchedulerTick);
        }

        /// Handles messages posted by background work until the mailbox stays quiet.
        async fn settle(&mut self) {
            while let Ok(Some(message)) =
                tokio::time::timeout(Duration::from_millis(50), self.receiver.recv()).await
            {
                self.handle(message);
            }
        }

        /// Requests, assigns and launches an allocation. Returns its dispatch and
        /// the owner's event queue with the allocation event already consumed.
        async fn launch(
            &mut self,
            allocation_id: &str,
        ) -> (DispatchId, RpcReceiver<AllocationEvent>) {
            let (request, mut events) = RequestBuilder::default()
                .allocation_id(allocation_id)
                .build();
            self.handle(RmMessage::AllocateRequest(request));
            self.tick();
            let resources = expect_allocated(&mut events);
            resources.start(task_spec());
            self.settle().await;
            let dispatch_id = self
                .ctx
                .registry
                .dispatches_of(allocation_id)
                .pop()
                .expect("dispatch was not launched");
            (dispatch_id, events)
        }
    }

    fn expect_allocated(events: &mut RpcReceiver<AllocationEvent>) -> DispatcherResources {
        match events.try_recv() {
            Ok(AllocationEvent::ResourcesAllocated { resources, .. }) => resources,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn expect_state(
        events: &mut RpcReceiver<AllocationEvent>,
    ) -> (ResourcesState, Option<ResourcesFailure>) {
        loop {
            match events.try_recv() {
                Ok(AllocationEvent::ResourcesStateChanged { state, failure, .. }) => {
                    return (state, failure);
                }
                Ok(AllocationEvent::ContainerLog { .. }) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn tick_assigns_each_request_once() {
        let mut rt = TestCtx::new().await;
        let (r1, mut e1) = RequestBuilder::default()
            .allocation_id("a1")
            .owner(7)
            .build();
        let (r2, mut e2) = RequestBuilder::default().build();
        rt.handle(RmMessage::AllocateRequest(r1));
        rt.handle(RmMessage::AllocateRequest(r2));

        rt.tick();
        rt.tick();

        let resources = expect_allocated(&mut e1);
        assert_eq!(resources.group, 7);
        assert_eq!(resources.allocation_id, "a1");
        assert!(e1.try_recv().is_err());
        let resources = expect_allocated(&mut e2);
        assert!(!resources.allocation_id.is_empty());
        assert!(e2.try_recv().is_err());

        let summary = rt.state.tasks.summary("a1", &rt.state.groups, WlmType::Slurm);
        assert_eq!(summary.unwrap().name, UNNAMED_JOB_NAME);
    }

    #[tokio::test]
    async fn launch_registers_and_monitors_dispatch() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, _events) = rt.launch("a1").await;

        assert_eq!(rt.ctx.registry.get(&dispatch_id).as_deref(), Some("a1"));
        assert!(rt.ctx.watcher.is_monitored(&dispatch_id));
        let stored = rt.store.list_dispatches_by_allocation("a1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].impersonated_user, "alice");

        let launched = rt.launcher.launched();
        assert_eq!(launched.len(), 1);
        let (manifest, user) = &launched[0];
        assert_eq!(user, "alice");
        // One slot in the default pool, whose partition has GPUs.
        assert_eq!(manifest.partition.as_deref(), Some("gpu"));
        assert_eq!(manifest.slot_type, SlotType::Cuda);
    }

    #[tokio::test]
    async fn exit_codes_map_to_failures() {
        let mut rt = TestCtx::new().await;
        for (allocation_id, exit_code, expected) in [
            ("a1", 0, None),
            ("a2", 137, Some(Some(137))),
            ("a3", -1, Some(None)),
        ] {
            let (dispatch_id, mut events) = rt.launch(allocation_id).await;
            rt.handle(RmMessage::DispatchExited {
                dispatch_id,
                exit_code,
                message: String::new(),
            });
            let (state, failure) = expect_state(&mut events);
            assert_eq!(state, ResourcesState::Terminated);
            assert_eq!(
                failure.map(|f| {
                    assert_eq!(f.kind, FailureKind::ResourcesFailed);
                    f.exit_code
                }),
                expected
            );
        }
    }

    #[tokio::test]
    async fn exit_message_is_forwarded_and_environment_removed() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, mut events) = rt.launch("a1").await;
        rt.handle(RmMessage::DispatchExited {
            dispatch_id: dispatch_id.clone(),
            exit_code: 1,
            message: "out of memory".to_string(),
        });
        match events.try_recv() {
            Ok(AllocationEvent::ContainerLog { message, level }) => {
                assert_eq!(message, "out of memory");
                assert_eq!(level, LogLevel::Error);
            }
            other => panic!("unexpected {other:?}"),
        }
        let (_, failure) = expect_state(&mut events);
        assert_eq!(failure.unwrap().exit_code, Some(1));

        rt.settle().await;
        assert_eq!(rt.launcher.deleted(), vec![dispatch_id.clone()]);
        assert!(rt.ctx.registry.get(&dispatch_id).is_none());
        assert!(rt.store.list_all_dispatches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn environments_can_be_kept() {
        let mut rt = TestCtx::with_config(RmConfig {
            keep_dispatch_environments: true,
            ..Default::default()
        })
        .await;
        let (dispatch_id, _events) = rt.launch("a1").await;
        rt.handle(RmMessage::DispatchExited {
            dispatch_id: dispatch_id.clone(),
            exit_code: 0,
            message: String::new(),
        });
        rt.settle().await;
        assert!(rt.launcher.deleted().is_empty());
        assert!(rt.ctx.registry.get(&dispatch_id).is_none());
    }

    #[tokio::test]
    async fn terminated_state_is_final() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, mut events) = rt.launch("a1").await;
        rt.handle(RmMessage::DispatchExited {
            dispatch_id: dispatch_id.clone(),
            exit_code: 0,
            message: String::new(),
        });
        assert_eq!(expect_state(&mut events).0, ResourcesState::Terminated);

        rt.handle(RmMessage::DispatchStateChange {
            dispatch_id: dispatch_id.clone(),
            state: DispatchState::Running,
            is_pulling_image: false,
            hpc_job_id: None,
        });
        rt.handle(RmMessage::DispatchExited {
            dispatch_id,
            exit_code: 3,
            message: "late".to_string(),
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn state_changes_are_translated() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, mut events) = rt.launch("a1").await;
        for _ in 0..2 {
            rt.handle(RmMessage::DispatchStateChange {
                dispatch_id: dispatch_id.clone(),
                state: DispatchState::Pending,
                is_pulling_image: false,
                hpc_job_id: Some("4242".to_string()),
            });
        }
        match events.try_recv() {
            Ok(AllocationEvent::ContainerLog { message, .. }) => {
                assert_eq!(message, "HPC Job ID: 4242")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(expect_state(&mut events).0, ResourcesState::Assigned);
        assert_eq!(expect_state(&mut events).0, ResourcesState::Assigned);
        assert_eq!(rt.ctx.registry.get_job(&dispatch_id).as_deref(), Some("4242"));
        assert_eq!(rt.state.tasks.job_stats().queued_count, 1);

        rt.handle(RmMessage::DispatchStateChange {
            dispatch_id,
            state: DispatchState::Running,
            is_pulling_image: true,
            hpc_job_id: None,
        });
        assert_eq!(expect_state(&mut events).0, ResourcesState::Pulling);
        assert_eq!(rt.state.tasks.job_stats().scheduled_count, 1);

        rt.handle(RmMessage::DispatchStateChange {
            dispatch_id: "unknown".to_string(),
            state: DispatchState::Running,
            is_pulling_image: false,
            hpc_job_id: None,
        });
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_before_launch_does_not_call_launcher() {
        let mut rt = TestCtx::new().await;
        let (request, mut events) = RequestBuilder::default().allocation_id("a1").build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        expect_allocated(&mut events).kill();
        rt.settle().await;
        assert!(rt.launcher.terminated().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn kill_of_monitored_dispatch_is_reported_by_watcher() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, mut events) = rt.launch("a1").await;
        rt.handle(RmMessage::KillResources {
            allocation_id: "a1".to_string(),
            resources_id: String::new(),
        });
        rt.settle().await;
        assert_eq!(rt.launcher.terminated(), vec![dispatch_id.clone()]);
        // The watcher owns the cleanup of monitored dispatches.
        assert!(rt.launcher.deleted().is_empty());

        rt.ctx.watcher.poll_once().await;
        rt.settle().await;
        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        assert_eq!(failure.unwrap().exit_code, None);
        assert_eq!(rt.launcher.deleted(), vec![dispatch_id]);
    }

    #[tokio::test]
    async fn kill_of_unmonitored_dispatch_reports_exit() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, mut events) = rt.launch("a1").await;
        rt.ctx.watcher.unmonitor(&dispatch_id);
        rt.handle(RmMessage::KillResources {
            allocation_id: "a1".to_string(),
            resources_id: String::new(),
        });
        rt.settle().await;
        match events.try_recv() {
            Ok(AllocationEvent::ContainerLog { message, .. }) => {
                assert_eq!(message, CANCELED_MESSAGE)
            }
            other => panic!("unexpected {other:?}"),
        }
        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        assert_eq!(failure.unwrap().exit_code, None);
    }

    #[tokio::test]
    async fn restore_reattaches_stored_dispatch() {
        let mut rt = TestCtx::new().await;
        rt.store.insert_dispatch(dispatch("d9", "a1")).await.unwrap();
        let (request, mut events) = RequestBuilder::default()
            .allocation_id("a1")
            .restore(true)
            .build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        assert!(events.try_recv().is_err());
        rt.settle().await;

        let resources = expect_allocated(&mut events);
        assert_eq!(resources.resources_id, "r-d9");
        assert_eq!(rt.ctx.registry.get("d9").as_deref(), Some("a1"));
        assert!(rt.ctx.watcher.is_monitored("d9"));
        rt.tick();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_without_dispatch_is_aborted() {
        let mut rt = TestCtx::new().await;
        let (request, mut events) = RequestBuilder::default()
            .allocation_id("a1")
            .restore(true)
            .build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        rt.settle().await;

        expect_allocated(&mut events);
        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        assert_eq!(
            failure,
            Some(ResourcesFailure::aborted("Unable to locate HPC job on restart."))
        );
    }

    #[tokio::test]
    async fn root_user_is_refused() {
        let mut rt = TestCtx::new().await;
        let (request, mut events) = RequestBuilder::default().allocation_id("a1").build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        let spec = TaskSpec {
            agent_user: None,
            ..task_spec()
        };
        expect_allocated(&mut events).start(spec);
        rt.settle().await;

        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        let failure = failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ResourcesFailed);
        assert!(failure.message.contains("root"));
        assert!(rt.launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn launcher_failure_terminates_resources() {
        let mut rt = TestCtx::new().await;
        rt.launcher
            .fail_launch(LauncherError::Transport("connection refused".to_string()));
        let (request, mut events) = RequestBuilder::default().allocation_id("a1").build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        expect_allocated(&mut events).start(task_spec());
        rt.settle().await;

        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        let message = failure.unwrap().message;
        assert!(message.starts_with("unable to create the launcher job: "));
        assert!(message.contains("connection refused"));
        assert!(rt.store.list_all_dispatches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrecorded_dispatch_is_terminated() {
        let mut rt =
            TestCtx::with_store(RmConfig::default(), Arc::new(InsertFailingStore::default())).await;
        let (request, mut events) = RequestBuilder::default().allocation_id("a1").build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        expect_allocated(&mut events).start(task_spec());
        rt.settle().await;

        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        let failure = failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ResourcesFailed);
        assert!(failure.message.starts_with("unable to persist the dispatch: "));
        assert_eq!(rt.launcher.launched().len(), 1);
        assert_eq!(rt.launcher.terminated(), vec!["d0".to_string()]);
        assert_eq!(rt.launcher.deleted(), vec!["d0".to_string()]);
        assert!(rt.ctx.registry.get("d0").is_none());
        assert!(!rt.ctx.watcher.is_monitored("d0"));
    }

    fn provided_pool_config() -> RmConfig {
        RmConfig {
            resource_pools: vec![ResourcePoolConfig {
                pool_name: "cpu-short".to_string(),
                provider_partition: Some("debug".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn provided_pool_launches_into_its_partition() {
        let mut rt = TestCtx::with_config(provided_pool_config()).await;
        let (request, mut events) = RequestBuilder::default()
            .allocation_id("a1")
            .pool("cpu-short")
            .build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        expect_allocated(&mut events).start(task_spec());
        rt.settle().await;

        let launched = rt.launcher.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].0.partition.as_deref(), Some("debug"));
        assert_eq!(launched[0].0.slot_type, SlotType::Cpu);

        let (token, partition) = ResponseToken::new();
        rt.handle(RmMessage::ResolveResourcePool {
            pool: "cpu-short".to_string(),
            slots: 1,
            response: token,
        });
        assert_eq!(partition.await.unwrap().unwrap(), "debug");
        let (token, partition) = ResponseToken::new();
        rt.handle(RmMessage::ResolveResourcePool {
            pool: String::new(),
            slots: 0,
            response: token,
        });
        assert_eq!(partition.await.unwrap().unwrap(), "debug");
    }

    #[tokio::test]
    async fn unknown_pool_fails_the_launch() {
        let mut rt = TestCtx::new().await;
        let (request, mut events) = RequestBuilder::default()
            .allocation_id("a1")
            .pool("missing")
            .build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.tick();
        expect_allocated(&mut events).start(task_spec());
        rt.settle().await;

        let (state, failure) = expect_state(&mut events);
        assert_eq!(state, ResourcesState::Terminated);
        let message = failure.unwrap().message;
        assert!(message.starts_with("unable to resolve the resource pool: "));
        assert!(message.contains("missing"));
        assert!(rt.launcher.launched().is_empty());

        let (token, partition) = ResponseToken::new();
        rt.handle(RmMessage::ResolveResourcePool {
            pool: "missing".to_string(),
            slots: 1,
            response: token,
        });
        assert!(matches!(
            partition.await.unwrap(),
            Err(RmError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_requests_fail() {
        let mut rt = TestCtx::new().await;
        let (token, weight) = ResponseToken::new();
        rt.handle(RmMessage::SetGroupWeight {
            group: 1,
            weight: 2.0,
            response: token,
        });
        let (token, priority) = ResponseToken::new();
        rt.handle(RmMessage::SetGroupPriority {
            group: 1,
            priority: 10,
            response: token,
        });
        let (token, moved) = ResponseToken::new();
        rt.handle(RmMessage::MoveJob {
            job_id: "j1".to_string(),
            ahead_of: "j2".to_string(),
            response: token,
        });
        assert!(matches!(weight.await, Ok(Err(RmError::Unsupported(_)))));
        assert!(matches!(priority.await, Ok(Err(RmError::Unsupported(_)))));
        assert!(matches!(moved.await, Ok(Err(RmError::Unsupported(_)))));

        let (token, valid) = ResponseToken::new();
        rt.handle(RmMessage::ValidateCommandResources {
            slots: 1000,
            response: token,
        });
        assert!(valid.await.unwrap());
    }

    #[tokio::test]
    async fn preemption_releases_resources() {
        let mut rt = TestCtx::new().await;
        let (request, mut events) = RequestBuilder::default().allocation_id("a1").build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.handle(RmMessage::PendingPreemption {
            allocation_id: "a1".to_string(),
        });
        assert!(matches!(
            events.try_recv(),
            Ok(AllocationEvent::ReleaseResources {
                force_preemption: true
            })
        ));

        rt.handle(RmMessage::ResourcesReleased {
            allocation_id: "a1".to_string(),
        });
        assert!(rt.state.tasks.is_empty());
    }

    #[tokio::test]
    async fn groups_follow_requests() {
        let mut rt = TestCtx::new().await;
        let (request, _events) = RequestBuilder::default().owner(3).group(9).build();
        rt.handle(RmMessage::AllocateRequest(request));
        rt.handle(RmMessage::SetGroupMaxSlots {
            group: 9,
            max_slots: Some(4),
        });
        assert_eq!(rt.state.groups[&9].max_slots, Some(4));
        assert!(!rt.state.groups.contains_key(&3));
        rt.handle(RmMessage::GroupStopped { group: 9 });
        assert!(rt.state.groups.is_empty());
    }

    #[tokio::test]
    async fn pool_queries() {
        let mut rt = TestCtx::new().await;
        let (token, pools) = ResponseToken::new();
        rt.handle(RmMessage::GetResourcePools(token));
        let pools = pools.await.unwrap();
        assert_eq!(pools.len(), 2);

        let (token, aux) = ResponseToken::new();
        rt.handle(RmMessage::GetDefaultAuxPool(token));
        assert_eq!(aux.await.unwrap(), "debug");
        let (token, compute) = ResponseToken::new();
        rt.handle(RmMessage::GetDefaultComputePool(token));
        assert_eq!(compute.await.unwrap(), "gpu");

        let (token, validation) = ResponseToken::new();
        rt.handle(RmMessage::HasResourcePool {
            pool: "missing".to_string(),
            response: token,
        });
        assert!(!validation.await.unwrap().has_resource_pool);

        let (request, _events) = RequestBuilder::default().pool("gpu").build();
        rt.handle(RmMessage::AllocateRequest(request));
        let (token, stats) = ResponseToken::new();
        rt.handle(RmMessage::GetJobQueueStats {
            pools: Vec::new(),
            response: token,
        });
        let stats = stats.await.unwrap();
        assert_eq!(stats.len(), 2);
        let gpu = stats.iter().find(|s| s.resource_pool == "gpu").unwrap();
        assert_eq!(gpu.stats.queued_count, 1);

        let (token, queue) = ResponseToken::new();
        rt.handle(RmMessage::GetJobQ {
            pool: String::new(),
            response: token,
        });
        assert_eq!(queue.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn agents_can_be_disabled() {
        let mut rt = TestCtx::new().await;
        let (token, agent) = ResponseToken::new();
        rt.handle(RmMessage::DisableAgent {
            agent_id: "n1".to_string(),
            response: token,
        });
        assert!(!agent.await.unwrap().unwrap().enabled);

        let (token, all) = ResponseToken::new();
        rt.handle(RmMessage::GetAgents(token));
        let all = all.await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|a| a.id == "n1" && !a.enabled));
        assert!(all.iter().any(|a| a.id == "g1" && a.enabled));

        let (token, agent) = ResponseToken::new();
        rt.handle(RmMessage::EnableAgent {
            agent_id: "n1".to_string(),
            response: token,
        });
        assert!(agent.await.unwrap().unwrap().unwrap().enabled);

        let (token, agent) = ResponseToken::new();
        rt.handle(RmMessage::DisableAgent {
            agent_id: "nope".to_string(),
            response: token,
        });
        assert!(matches!(
            agent.await.unwrap(),
            Err(RmError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn agents_cannot_be_disabled_on_pbs() {
        let mut rt = TestCtx::with_config(RmConfig {
            wlm: WlmType::Pbs,
            ..Default::default()
        })
        .await;
        let (token, agent) = ResponseToken::new();
        rt.handle(RmMessage::DisableAgent {
            agent_id: "n1".to_string(),
            response: token,
        });
        assert!(matches!(
            agent.await.unwrap(),
            Err(RmError::Unsupported(_))
        ));
        assert!(rt.store.disabled_agents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_job_removes_environments() {
        let mut rt = TestCtx::new().await;
        rt.store
            .upsert_allocation(crate::store::AllocationRecord {
                allocation_id: "a1".to_string(),
                task_id: "t1".to_string(),
                job_id: "j1".to_string(),
                end_time: None,
            })
            .await
            .unwrap();
        rt.store.insert_dispatch(dispatch("d1", "a1")).await.unwrap();

        let (token, response) = ResponseToken::new();
        rt.handle(RmMessage::DeleteJob {
            job_id: "j1".to_string(),
            response: token,
        });
        assert!(response.await.unwrap().is_ok());
        rt.settle().await;
        assert_eq!(rt.launcher.deleted(), vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn container_running_is_forwarded_to_watcher() {
        let mut rt = TestCtx::new().await;
        let (dispatch_id, _events) = rt.launch("a1").await;
        rt.launcher
            .set_status(&dispatch_id, DispatchStatus::new(DispatchState::Pending));
        rt.handle(RmMessage::NotifyContainerRunning {
            allocation_id: "a1".to_string(),
            rank: 0,
            num_peers: 1,
            node_name: "g1".to_string(),
        });
        assert!(matches!(
            rt.receiver.try_recv(),
            Ok(RmMessage::DispatchStateChange {
                state: DispatchState::Running,
                ..
            })
        ));
    }
}
