//! Durable state of the resource manager: dispatch records, the allocations they
//! belong to and the set of disabled agents.

pub mod file;
pub mod memory;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{AllocationId, DispatchId, JobId, Map, ResourcesId, TaskId};

pub use file::FileStore;
pub use memory::MemoryStore;

/// One submission to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub dispatch_id: DispatchId,
    pub resource_id: ResourcesId,
    pub allocation_id: AllocationId,
    pub impersonated_user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation_id: AllocationId,
    pub task_id: TaskId,
    pub job_id: JobId,
    /// Set once the allocation has finished.
    pub end_time: Option<DateTime<Utc>>,
}

impl AllocationRecord {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

pub trait DispatchStore: Send + Sync {
    fn insert_dispatch(&self, dispatch: Dispatch) -> BoxFuture<'static, crate::Result<()>>;

    /// Returns the number of removed records.
    fn delete_dispatch(&self, dispatch_id: &str) -> BoxFuture<'static, crate::Result<usize>>;

    fn list_dispatches_by_allocation(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>>;

    fn list_dispatches_by_job(&self, job_id: &str) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>>;

    fn list_all_dispatches(&self) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>>;

    fn allocation_by_id(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Option<AllocationRecord>>>;

    fn upsert_allocation(&self, record: AllocationRecord) -> BoxFuture<'static, crate::Result<()>>;

    fn disabled_agents(&self) -> BoxFuture<'static, crate::Result<Vec<String>>>;

    fn set_agent_enabled(&self, agent: &str, enabled: bool) -> BoxFuture<'static, crate::Result<()>>;
}

/// State shared by the store implementations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    dispatches: Map<DispatchId, Dispatch>,
    #[serde(default)]
    allocations: Map<AllocationId, AllocationRecord>,
    #[serde(default)]
    disabled_agents: BTreeSet<String>,
}

impl StoreData {
    fn sorted(mut dispatches: Vec<Dispatch>) -> Vec<Dispatch> {
        dispatches.sort_by(|a, b| a.dispatch_id.cmp(&b.dispatch_id));
        dispatches
    }

    pub(crate) fn insert_dispatch(&mut self, dispatch: Dispatch) {
        self.dispatches.insert(dispatch.dispatch_id.clone(), dispatch);
    }

    pub(crate) fn delete_dispatch(&mut self, dispatch_id: &str) -> usize {
        usize::from(self.dispatches.remove(dispatch_id).is_some())
    }

    pub(crate) fn by_allocation(&self, allocation_id: &str) -> Vec<Dispatch> {
        Self::sorted(
            self.dispatches
                .values()
                .filter(|d| d.allocation_id == allocation_id)
                .cloned()
                .collect(),
        )
    }

    pub(crate) fn by_job(&self, job_id: &str) -> Vec<Dispatch> {
        Self::sorted(
            self.dispatches
                .values()
                .filter(|d| {
                    self.allocations
                        .get(&d.allocation_id)
                        .is_some_and(|a| a.job_id == job_id)
                })
                .cloned()
                .collect(),
        )
    }

    pub(crate) fn all(&self) -> Vec<Dispatch> {
        Self::sorted(self.dispatches.values().cloned().collect())
    }

    pub(crate) fn allocation(&self, allocation_id: &str) -> Option<AllocationRecord> {
        self.allocations.get(allocation_id).cloned()
    }

    pub(crate) fn upsert_allocation(&mut self, record: AllocationRecord) {
        self.allocations.insert(record.allocation_id.clone(), record);
    }

    pub(crate) fn disabled_agents(&self) -> Vec<String> {
        self.disabled_agents.iter().cloned().collect()
    }

    /// Returns `true` if the set changed.
    pub(crate) fn set_agent_enabled(&mut self, agent: &str, enabled: bool) -> bool {
        if enabled {
            self.disabled_agents.remove(agent)
        } else {
            self.disabled_agents.insert(agent.to_string())
        }
    }
}
