use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::common::config::RmConfig;
use crate::launcher::LauncherClient;
use crate::launcher::manifest::{Manifest, RESOURCES_LOG_FILE};
use crate::rm::cleanup::DispatchCleanup;
use crate::rm::config::RESOURCE_QUERY_OWNER;
use crate::rm::resources::HpcResources;

#[derive(Default)]
struct CacheState {
    sample: Arc<HpcResources>,
    sample_time: Option<Instant>,
    is_updating: bool,
}

/// Single entry cache of the cluster inventory. Readers never wait for a refresh; at most
/// one refresh runs at a time and it replaces the whole snapshot or nothing.
pub struct ResourceCache {
    launcher: Arc<dyn LauncherClient>,
    cleanup: DispatchCleanup,
    config: Arc<RmConfig>,
    max_age: Duration,
    state: RwLock<CacheState>,
}

/// Clears the in-flight flag however the refresh ends.
struct UpdateGuard<'a>(&'a ResourceCache);

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.state.write() {
            state.is_updating = false;
        }
    }
}

impl ResourceCache {
    pub fn new(
        launcher: Arc<dyn LauncherClient>,
        cleanup: DispatchCleanup,
        config: Arc<RmConfig>,
        max_age: Duration,
    ) -> Self {
        Self {
            launcher,
            cleanup,
            config,
            max_age,
            state: Default::default(),
        }
    }

    /// Returns the current snapshot. If it is stale and no refresh is running, a refresh
    /// is started in the background. The flag is `true` when no refresh was started.
    pub fn get(self: &Arc<Self>) -> (Arc<HpcResources>, bool) {
        {
            let Ok(state) = self.state.read() else {
                return (Arc::default(), true);
            };
            if !self.needs_refresh(&state) {
                return (state.sample.clone(), true);
            }
        }
        let Ok(mut state) = self.state.write() else {
            return (Arc::default(), true);
        };
        // Another reader may have started the refresh in between.
        if self.needs_refresh(&state) {
            state.is_updating = true;
            let cache = self.clone();
            tokio::spawn(async move { cache.refresh().await });
            (state.sample.clone(), false)
        } else {
            (state.sample.clone(), true)
        }
    }

    fn needs_refresh(&self, state: &CacheState) -> bool {
        let stale = state
            .sample_time
            .is_none_or(|time| time.elapsed() > self.max_age);
        stale && !state.is_updating
    }

    /// Current snapshot without any refresh side effects.
    #[cfg(test)]
    pub fn snapshot(&self) -> Arc<HpcResources> {
        self.state
            .read()
            .map(|s| s.sample.clone())
            .unwrap_or_default()
    }

    /// Refreshes the snapshot and waits for the result.
    pub async fn refresh_now(&self) -> crate::Result<()> {
        let resources = self.fetch().await?;
        self.store(resources);
        Ok(())
    }

    async fn refresh(&self) {
        let _guard = UpdateGuard(self);
        match self.fetch().await {
            Ok(resources) => self.store(resources),
            Err(error) => log::error!("Could not refresh HPC resource details: {error:?}"),
        }
    }

    fn store(&self, resources: HpcResources) {
        log::debug!(
            "Default resource pools are '{}', '{}'",
            resources.default_compute_pool_partition,
            resources.default_aux_pool_partition
        );
        if let Ok(mut state) = self.state.write() {
            state.sample = Arc::new(resources);
            state.sample_time = Some(Instant::now());
        }
    }

    async fn fetch(&self) -> anyhow::Result<HpcResources> {
        let dispatch_id = self
            .launcher
            .run(Manifest::resources_query(), RESOURCE_QUERY_OWNER)
            .await
            .context("Could not launch the HPC resource query")?;
        log::debug!("Launched HPC resource query with dispatch {dispatch_id}");

        let result = self.load_resources(&dispatch_id).await;
        self.cleanup
            .resource_query_post_actions(RESOURCE_QUERY_OWNER, &dispatch_id)
            .await;
        let resources = result?;
        resources.log_summary();
        Ok(resources)
    }

    async fn load_resources(&self, dispatch_id: &str) -> anyhow::Result<HpcResources> {
        let content = self
            .launcher
            .load_log(RESOURCE_QUERY_OWNER, dispatch_id, RESOURCES_LOG_FILE)
            .await
            .context("Could not load the HPC resource details")?;
        HpcResources::parse(&content, &self.config)
            .context("Could not parse the HPC resource details")
    }
}
