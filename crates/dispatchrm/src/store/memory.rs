use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::common::error::RmError;
use crate::store::{AllocationRecord, Dispatch, DispatchStore, StoreData};

/// Store that keeps everything in memory. Used when embedding the resource manager
/// without persistence and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut StoreData) -> R + Send + 'static,
    ) -> BoxFuture<'static, crate::Result<R>> {
        let data = self.data.clone();
        Box::pin(async move {
            let mut data = data
                .lock()
                .map_err(|_| RmError::StoreError("memory store lock poisoned".to_string()))?;
            Ok(f(&mut data))
        })
    }
}

impl DispatchStore for MemoryStore {
    fn insert_dispatch(&self, dispatch: Dispatch) -> BoxFuture<'static, crate::Result<()>> {
        self.with(move |data| data.insert_dispatch(dispatch))
    }

    fn delete_dispatch(&self, dispatch_id: &str) -> BoxFuture<'static, crate::Result<usize>> {
        let dispatch_id = dispatch_id.to_string();
        self.with(move |data| data.delete_dispatch(&dispatch_id))
    }

    fn list_dispatches_by_allocation(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        let allocation_id = allocation_id.to_string();
        self.with(move |data| data.by_allocation(&allocation_id))
    }

    fn list_dispatches_by_job(&self, job_id: &str) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        let job_id = job_id.to_string();
        self.with(move |data| data.by_job(&job_id))
    }

    fn list_all_dispatches(&self) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        self.with(|data| data.all())
    }

    fn allocation_by_id(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Option<AllocationRecord>>> {
        let allocation_id = allocation_id.to_string();
        self.with(move |data| data.allocation(&allocation_id))
    }

    fn upsert_allocation(&self, record: AllocationRecord) -> BoxFuture<'static, crate::Result<()>> {
        self.with(move |data| data.upsert_allocation(record))
    }

    fn disabled_agents(&self) -> BoxFuture<'static, crate::Result<Vec<String>>> {
        self.with(|data| data.disabled_agents())
    }

    fn set_agent_enabled(&self, agent: &str, enabled: bool) -> BoxFuture<'static, crate::Result<()>> {
        let agent = agent.to_string();
        self.with(move |data| {
            data.set_agent_enabled(&agent, enabled);
        })
    }
}
