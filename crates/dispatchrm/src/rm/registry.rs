use std::sync::RwLock;

use crate::{AllocationId, DispatchId, Map};

/// In-memory index of live dispatches: which allocation a dispatch belongs to and
/// which workload manager job it became. Both tables are guarded independently and
/// no method holds one lock while taking the other.
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    allocations: RwLock<Map<DispatchId, AllocationId>>,
    hpc_jobs: RwLock<Map<DispatchId, String>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, dispatch_id: DispatchId, allocation_id: AllocationId) {
        if let Ok(mut map) = self.allocations.write() {
            map.insert(dispatch_id, allocation_id);
        }
    }

    pub fn get(&self, dispatch_id: &str) -> Option<AllocationId> {
        self.allocations.read().ok()?.get(dispatch_id).cloned()
    }

    pub fn remove(&self, dispatch_id: &str) {
        if let Ok(mut map) = self.allocations.write() {
            map.remove(dispatch_id);
        }
    }

    /// All dispatches currently registered for `allocation_id`.
    pub fn dispatches_of(&self, allocation_id: &str) -> Vec<DispatchId> {
        let Ok(map) = self.allocations.read() else {
            return Vec::new();
        };
        let mut dispatches: Vec<_> = map
            .iter()
            .filter(|(_, allocation)| allocation.as_str() == allocation_id)
            .map(|(dispatch, _)| dispatch.clone())
            .collect();
        dispatches.sort();
        dispatches
    }

    pub fn put_job(&self, dispatch_id: DispatchId, hpc_job_id: String) {
        if let Ok(mut map) = self.hpc_jobs.write() {
            map.insert(dispatch_id, hpc_job_id);
        }
    }

    pub fn get_job(&self, dispatch_id: &str) -> Option<String> {
        self.hpc_jobs.read().ok()?.get(dispatch_id).cloned()
    }

    pub fn remove_job(&self, dispatch_id: &str) {
        if let Ok(mut map) = self.hpc_jobs.write() {
            map.remove(dispatch_id);
        }
    }
}
