//! Pending and assigned allocation requests, kept in arrival order.

use serde::Serialize;

use crate::common::config::WlmType;
use crate::rm::config::DEFAULT_GROUP_PRIORITY;
use crate::rm::messages::{AllocateRequest, DispatcherResources, ResourcesState, SchedulingState};
use crate::{AllocationId, GroupId, JobId, Map, ResourcesId, TaskId};

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub weight: f64,
    pub priority: i32,
    pub max_slots: Option<u32>,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            weight: 1.0,
            priority: DEFAULT_GROUP_PRIORITY,
            max_slots: None,
        }
    }
}

#[derive(Debug)]
pub struct TaskEntry {
    pub request: AllocateRequest,
    pub resources: Option<DispatcherResources>,
    pub scheduling_state: SchedulingState,
    pub resources_state: ResourcesState,
    /// A restore lookup is in flight, the task must not be assigned again.
    pub restoring: bool,
}

impl TaskEntry {
    pub fn group(&self) -> GroupId {
        self.request.group.unwrap_or(self.request.owner.id)
    }

    pub fn resources_id(&self) -> Option<&ResourcesId> {
        self.resources.as_ref().map(|r| &r.resources_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued_count: u32,
    pub scheduled_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolQueueStats {
    pub resource_pool: String,
    pub stats: JobStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobQueueInfo {
    /// Number of jobs in front of this one in the same pool.
    pub jobs_ahead: usize,
    pub state: SchedulingState,
    pub requested_slots: u32,
    pub allocated_slots: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationSummary {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    pub name: String,
    pub resource_pool: String,
    pub slots_needed: u32,
    pub scheduling_state: SchedulingState,
    pub resources_id: Option<ResourcesId>,
    pub group: GroupId,
    pub priority: Option<i32>,
    pub resources_type: String,
}

#[derive(Debug, Default)]
pub struct TaskList {
    tasks: Map<AllocationId, TaskEntry>,
    order: Vec<AllocationId>,
}

impl TaskList {
    /// Returns `false` if a task with the same allocation id is already present.
    pub fn add_task(&mut self, request: AllocateRequest) -> bool {
        if self.tasks.contains_key(&request.allocation_id) {
            return false;
        }
        let allocation_id = request.allocation_id.clone();
        self.tasks.insert(
            allocation_id.clone(),
            TaskEntry {
                request,
                resources: None,
                scheduling_state: SchedulingState::Queued,
                resources_state: ResourcesState::Queued,
                restoring: false,
            },
        );
        self.order.push(allocation_id);
        true
    }

    pub fn remove_task(&mut self, allocation_id: &str) -> Option<TaskEntry> {
        let entry = self.tasks.remove(allocation_id)?;
        self.order.retain(|id| id != allocation_id);
        Some(entry)
    }

    pub fn get(&self, allocation_id: &str) -> Option<&TaskEntry> {
        self.tasks.get(allocation_id)
    }

    pub fn get_mut(&mut self, allocation_id: &str) -> Option<&mut TaskEntry> {
        self.tasks.get_mut(allocation_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskEntry> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Tasks that have neither resources nor an outstanding restore lookup, in arrival order.
    pub fn unassigned(&self) -> Vec<AllocationId> {
        self.iter()
            .filter(|t| t.resources.is_none() && !t.restoring)
            .map(|t| t.request.allocation_id.clone())
            .collect()
    }

    pub fn job_stats(&self) -> JobStats {
        Self::stats(self.iter())
    }

    pub fn job_stats_by_pool(&self, pool: &str) -> JobStats {
        Self::stats(self.iter().filter(|t| t.request.resource_pool == pool))
    }

    fn stats<'a>(tasks: impl Iterator<Item = &'a TaskEntry>) -> JobStats {
        let mut stats = JobStats::default();
        for task in tasks {
            match task.scheduling_state {
                SchedulingState::Queued => stats.queued_count += 1,
                SchedulingState::Scheduled => stats.scheduled_count += 1,
            }
        }
        stats
    }

    /// Aggregates the tasks of `pool` per job.
    pub fn job_queue(&self, pool: &str) -> Map<JobId, JobQueueInfo> {
        let mut jobs: Map<JobId, JobQueueInfo> = Map::new();
        for task in self.iter().filter(|t| t.request.resource_pool == pool) {
            let ahead = jobs.len();
            let info = jobs
                .entry(task.request.job_id.clone())
                .or_insert_with(|| JobQueueInfo {
                    jobs_ahead: ahead,
                    state: SchedulingState::Queued,
                    requested_slots: 0,
                    allocated_slots: 0,
                });
            info.requested_slots += task.request.slots_needed;
            if task.resources.is_some() {
                info.allocated_slots += task.request.slots_needed;
            }
            if task.scheduling_state == SchedulingState::Scheduled {
                info.state = SchedulingState::Scheduled;
            }
        }
        jobs
    }

    pub fn summary(
        &self,
        allocation_id: &str,
        groups: &Map<GroupId, Group>,
        wlm: WlmType,
    ) -> Option<AllocationSummary> {
        let task = self.tasks.get(allocation_id)?;
        let group = task.group();
        Some(AllocationSummary {
            allocation_id: task.request.allocation_id.clone(),
            task_id: task.request.task_id.clone(),
            job_id: task.request.job_id.clone(),
            name: task.request.name.clone(),
            resource_pool: task.request.resource_pool.clone(),
            slots_needed: task.request.slots_needed,
            scheduling_state: task.scheduling_state,
            resources_id: task.resources_id().cloned(),
            group,
            priority: groups.get(&group).map(|g| g.priority),
            resources_type: wlm.to_string(),
        })
    }

    pub fn summaries(
        &self,
        groups: &Map<GroupId, Group>,
        wlm: WlmType,
    ) -> Map<AllocationId, AllocationSummary> {
        self.order
            .iter()
            .filter_map(|id| Some((id.clone(), self.summary(id, groups, wlm)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::RequestBuilder;

    #[test]
    fn duplicate_allocation_is_rejected() {
        let mut list = TaskList::default();
        assert!(list.add_task(RequestBuilder::default().allocation_id("a1").build().0));
        assert!(!list.add_task(RequestBuilder::default().allocation_id("a1").build().0));
        assert_eq!(list.len(), 1);
        assert!(list.remove_task("a1").is_some());
        assert!(list.is_empty());
        assert!(list.unassigned().is_empty());
    }

    #[test]
    fn job_queue_per_pool() {
        let mut list = TaskList::default();
        for (allocation, job, pool, slots) in [
            ("a1", "j1", "gpu", 2),
            ("a2", "j2", "gpu", 4),
            ("a3", "j1", "gpu", 2),
            ("a4", "j3", "cpu", 1),
        ] {
            list.add_task(
                RequestBuilder::default()
                    .allocation_id(allocation)
                    .job_id(job)
                    .pool(pool)
                    .slots(slots)
                    .build()
                    .0,
            );
        }
        list.get_mut("a2").unwrap().scheduling_state = SchedulingState::Scheduled;

        let queue = list.job_queue("gpu");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue["j1"].jobs_ahead, 0);
        assert_eq!(queue["j1"].requested_slots, 4);
        assert_eq!(queue["j1"].state, SchedulingState::Queued);
        assert_eq!(queue["j2"].jobs_ahead, 1);
        assert_eq!(queue["j2"].state, SchedulingState::Scheduled);

        assert_eq!(
            list.job_stats_by_pool("gpu"),
            JobStats {
                queued_count: 2,
                scheduled_count: 1
            }
        );
        assert_eq!(list.job_stats().queued_count, 3);
    }

    #[test]
    fn summary_uses_owner_group() {
        let mut list = TaskList::default();
        let (request, _rx) = RequestBuilder::default().allocation_id("a1").owner(7).build();
        list.add_task(request);
        let mut groups = Map::new();
        groups.insert(7, Group::default());
        let summary = list.summary("a1", &groups, WlmType::Pbs).unwrap();
        assert_eq!(summary.group, 7);
        assert_eq!(summary.priority, Some(DEFAULT_GROUP_PRIORITY));
        assert_eq!(summary.resources_type, "PBS");
        assert!(list.summary("missing", &groups, WlmType::Pbs).is_none());
        assert_eq!(list.summaries(&groups, WlmType::Pbs).len(), 1);
    }
}
