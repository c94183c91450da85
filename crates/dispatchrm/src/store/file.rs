use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::common::error::RmError;
use crate::store::{AllocationRecord, Dispatch, DispatchStore, StoreData};

/// Store persisted as a single JSON document. Every mutation rewrites the
/// document through a temporary file in the same directory, so a crash never
/// leaves a truncated file behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Arc<PathBuf>,
    data: Arc<Mutex<StoreData>>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: &Path) -> crate::Result<Self> {
        let data = if path.exists() {
            let content = std::fs::read(path)?;
            serde_json::from_slice(&content)
                .map_err(|e| RmError::DeserializationError(format!("{}: {e}", path.display())))?
        } else {
            StoreData::default()
        };
        log::debug!("Opened dispatch store {}", path.display());
        Ok(Self {
            path: Arc::new(path.to_path_buf()),
            data: Arc::new(Mutex::new(data)),
        })
    }

    fn write(path: &Path, data: &StoreData) -> crate::Result<()> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        serde_json::to_writer_pretty(&mut file, data)?;
        file.flush()?;
        file.persist(path).map_err(|e| RmError::IoError(e.error))?;
        Ok(())
    }

    fn with<R: Send + 'static>(
        &self,
        mutates: bool,
        f: impl FnOnce(&mut StoreData) -> R + Send + 'static,
    ) -> BoxFuture<'static, crate::Result<R>> {
        let path = self.path.clone();
        let data = self.data.clone();
        Box::pin(async move {
            let mut data = data.lock().await;
            if !mutates {
                return Ok(f(&mut data));
            }
            let mut updated = data.clone();
            let result = f(&mut updated);
            let updated = tokio::task::spawn_blocking(move || {
                Self::write(&path, &updated)?;
                Ok::<_, RmError>(updated)
            })
            .await
            .map_err(|e| RmError::StoreError(format!("store write did not finish: {e}")))??;
            *data = updated;
            Ok(result)
        })
    }
}

impl DispatchStore for FileStore {
    fn insert_dispatch(&self, dispatch: Dispatch) -> BoxFuture<'static, crate::Result<()>> {
        self.with(true, move |data| data.insert_dispatch(dispatch))
    }

    fn delete_dispatch(&self, dispatch_id: &str) -> BoxFuture<'static, crate::Result<usize>> {
        let dispatch_id = dispatch_id.to_string();
        self.with(true, move |data| data.delete_dispatch(&dispatch_id))
    }

    fn list_dispatches_by_allocation(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        let allocation_id = allocation_id.to_string();
        self.with(false, move |data| data.by_allocation(&allocation_id))
    }

    fn list_dispatches_by_job(&self, job_id: &str) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        let job_id = job_id.to_string();
        self.with(false, move |data| data.by_job(&job_id))
    }

    fn list_all_dispatches(&self) -> BoxFuture<'static, crate::Result<Vec<Dispatch>>> {
        self.with(false, |data| data.all())
    }

    fn allocation_by_id(
        &self,
        allocation_id: &str,
    ) -> BoxFuture<'static, crate::Result<Option<AllocationRecord>>> {
        let allocation_id = allocation_id.to_string();
        self.with(false, move |data| data.allocation(&allocation_id))
    }

    fn upsert_allocation(&self, record: AllocationRecord) -> BoxFuture<'static, crate::Result<()>> {
        self.with(true, move |data| data.upsert_allocation(record))
    }

    fn disabled_agents(&self) -> BoxFuture<'static, crate::Result<Vec<String>>> {
        self.with(false, |data| data.disabled_agents())
    }

    fn set_agent_enabled(&self, agent: &str, enabled: bool) -> BoxFuture<'static, crate::Result<()>> {
        let agent = agent.to_string();
        self.with(true, move |data| {
            data.set_agent_enabled(&agent, enabled);
        })
    }
}
