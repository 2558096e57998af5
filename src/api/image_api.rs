use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{EngineConfig, IMAGES_GROUP_TITLE};
use crate::engine::cache::DiskCache;
use crate::engine::fetcher::{FetchCoordinator, FetchOrigin, ImageStream};
use crate::engine::stats::{StatsCollector, StatsSnapshot};
use crate::engine::sweeper::spawn_sweeper;
use crate::net::{NetManager, TaskId, TaskSnapshot};
use crate::source::{HttpSource, ImageSource};

/// The assembled image pipeline: cache, coordinator, task tree and sweeper.
pub struct ImageService {
    coordinator: FetchCoordinator,
    group: TaskId,
    sweeper_token: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl ImageService {
    /// Start the service with a custom source. Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, source: Arc<dyn ImageSource>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(DiskCache::open(
            Path::new(&config.cache_dir),
            config.max_cache_bytes,
            config.max_entry_bytes,
        )?);
        let net = Arc::new(NetManager::new());
        let stats = Arc::new(StatsCollector::new());
        let group = net.create_group(None, IMAGES_GROUP_TITLE)?;

        let coordinator = FetchCoordinator::new(
            source,
            Arc::clone(&cache),
            Arc::clone(&net),
            Arc::clone(&stats),
            config.max_concurrency,
        )
        .with_group(group)
        .with_retries(config.max_retries, config.retry_backoff());

        let sweeper_token = CancellationToken::new();
        let sweeper = spawn_sweeper(
            cache,
            net,
            stats,
            config.sweep_interval(),
            config.task_retention(),
            sweeper_token.clone(),
        );

        info!(
            "image service started cache_dir={} budget={} concurrency={}",
            config.cache_dir, config.max_cache_bytes, config.max_concurrency
        );

        Ok(Self {
            coordinator,
            group,
            sweeper_token,
            sweeper: Some(sweeper),
        })
    }

    /// Start the service fetching over HTTP.
    pub fn start_http(config: EngineConfig) -> Result<Self> {
        let source = Arc::new(HttpSource::from_config(&config)?);
        Self::start(config, source)
    }

    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.coordinator.fetch(url).await
    }

    pub fn fetch_stream(&self, url: &str) -> Result<ImageStream> {
        self.coordinator.fetch_stream(url)
    }

    pub fn prefetch(&self, url: &str) -> Result<FetchOrigin> {
        self.coordinator.prefetch(url)
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        self.coordinator.cache()
    }

    pub fn net(&self) -> &Arc<NetManager> {
        self.coordinator.net()
    }

    /// Group every download is registered under.
    pub fn images_group(&self) -> TaskId {
        self.group
    }

    /// Rows for a network activity table.
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.net().tree()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.coordinator
            .stats()
            .snapshot(self.coordinator.cache().total_bytes())
    }

    /// Cancel downloads, stop the sweeper and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.coordinator.shutdown();
        self.sweeper_token.cancel();
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.await;
        }
        info!("image service shut down");
    }
}

impl Drop for ImageService {
    fn drop(&mut self) {
        self.sweeper_token.cancel();
        self.coordinator.shutdown();
    }
}
