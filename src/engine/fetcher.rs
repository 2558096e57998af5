// Fetch coordinator: one download per URL, fanned out to every consumer and written
// through to the disk cache as it arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::{CacheKey, CacheWriter, DiskCache};
use super::stats::StatsCollector;
use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS, SNIFF_BYTES};
use crate::detect::detect_image_format;
use crate::error::{CacheWriteError, FetchError};
use crate::net::{NetManager, NetTask, TaskId};
use crate::source::ImageSource;

/// How a request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// Served from the disk cache.
    Cache,
    /// This request started the download.
    Network,
    /// Attached to a download another request had already started.
    Joined,
}

/// Consumer end of a fetch. Pull chunks with `next` or gather everything with `collect`.
pub struct ImageStream {
    origin: FetchOrigin,
    task_id: Option<TaskId>,
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    stats: Arc<StatsCollector>,
}

impl ImageStream {
    fn ready(data: Bytes, stats: Arc<StatsCollector>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(data));
        Self {
            origin: FetchOrigin::Cache,
            task_id: None,
            rx,
            stats,
        }
    }

    pub fn origin(&self) -> FetchOrigin {
        self.origin
    }

    /// Task tracking the underlying download, if one was involved.
    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        let item = self.rx.recv().await;
        if let Some(Ok(chunk)) = &item {
            self.stats.record_served(chunk.len() as u64);
        }
        item
    }

    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

struct InFlightState {
    task_id: Option<TaskId>,
    /// Everything received so far, replayed to late joiners. Only kept while the body can
    /// still end up in the cache, so it never exceeds the per-entry limit.
    received: Vec<Bytes>,
    replay: bool,
    delivered: bool,
    subscribers: Vec<mpsc::UnboundedSender<Result<Bytes>>>,
}

struct InFlight {
    url: String,
    state: Mutex<InFlightState>,
}

impl InFlight {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(InFlightState {
                task_id: None,
                received: Vec::new(),
                replay: true,
                delivered: false,
                subscribers: Vec::new(),
            }),
        }
    }

    fn task_id(&self) -> Option<TaskId> {
        self.state.lock().task_id
    }

    fn set_task_id(&self, id: TaskId) {
        self.state.lock().task_id = Some(id);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Result<Bytes>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for chunk in &state.received {
            let _ = tx.send(Ok(chunk.clone()));
        }
        state.subscribers.push(tx);
        rx
    }

    fn publish(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.delivered = true;
        if state.replay {
            state.received.push(chunk.clone());
        }
        // Consumers that went away are dropped; the download carries on for the cache.
        state
            .subscribers
            .retain(|tx| tx.send(Ok(chunk.clone())).is_ok());
    }

    fn has_delivered(&self) -> bool {
        self.state.lock().delivered
    }

    /// Drop the replay buffer for good. Returns false if it was already gone.
    fn stop_replay(&self) -> bool {
        let mut state = self.state.lock();
        if !state.replay {
            return false;
        }
        state.replay = false;
        state.received = Vec::new();
        true
    }

    fn finish(&self, outcome: Result<(), FetchError>) {
        let subscribers = {
            let mut state = self.state.lock();
            state.received.clear();
            std::mem::take(&mut state.subscribers)
        };
        if let Err(e) = outcome {
            for tx in subscribers {
                let _ = tx.send(Err(anyhow::Error::new(e.clone())));
            }
        }
    }
}

type InFlightMap = Arc<Mutex<HashMap<CacheKey, Arc<InFlight>>>>;

pub struct FetchCoordinator {
    source: Arc<dyn ImageSource>,
    cache: Arc<DiskCache>,
    net: Arc<NetManager>,
    stats: Arc<StatsCollector>,
    semaphore: Arc<Semaphore>,
    in_flight: InFlightMap,
    shutdown_token: CancellationToken,
    group: Option<TaskId>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl FetchCoordinator {
    pub fn new(
        source: Arc<dyn ImageSource>,
        cache: Arc<DiskCache>,
        net: Arc<NetManager>,
        stats: Arc<StatsCollector>,
        max_concurrency: u32,
    ) -> Self {
        Self {
            source,
            cache,
            net,
            stats,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1) as usize)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown_token: CancellationToken::new(),
            group: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    /// Register downloads under this task group.
    pub fn with_group(mut self, group: TaskId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Stream the image at `url` from the cache, an in-flight download, or a new one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn fetch_stream(&self, url: &str) -> Result<ImageStream> {
        let key = CacheKey::for_url(url);
        loop {
            if self.shutdown_token.is_cancelled() {
                return Err(FetchError::Shutdown.into());
            }

            if let Some(data) = self.cache.get_key(&key)? {
                self.stats.record_hit();
                debug!("fetch {} served from cache ({} bytes)", url, data.len());
                return Ok(ImageStream::ready(data, Arc::clone(&self.stats)));
            }

            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                let rx = existing.subscribe();
                self.stats.record_join();
                debug!("fetch {} joined in-flight download", url);
                return Ok(ImageStream {
                    origin: FetchOrigin::Joined,
                    task_id: existing.task_id(),
                    rx,
                    stats: Arc::clone(&self.stats),
                });
            }
            if self.cache.contains_key(&key) {
                // Committed between the lookup above and taking the lock.
                continue;
            }

            let inflight = Arc::new(InFlight::new(url));
            let rx = inflight.subscribe();
            in_flight.insert(key, Arc::clone(&inflight));
            drop(in_flight);

            self.stats.record_miss();
            let task_id = self.start_download(key, inflight)?;
            return Ok(ImageStream {
                origin: FetchOrigin::Network,
                task_id: Some(task_id),
                rx,
                stats: Arc::clone(&self.stats),
            });
        }
    }

    /// Fetch the complete image.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.fetch_stream(url)?.collect().await
    }

    /// Make sure `url` is cached or being downloaded, without consuming it.
    pub fn prefetch(&self, url: &str) -> Result<FetchOrigin> {
        let key = CacheKey::for_url(url);
        if self.shutdown_token.is_cancelled() {
            return Err(FetchError::Shutdown.into());
        }
        if self.cache.contains_key(&key) {
            return Ok(FetchOrigin::Cache);
        }

        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&key) {
            self.stats.record_join();
            return Ok(FetchOrigin::Joined);
        }
        let inflight = Arc::new(InFlight::new(url));
        in_flight.insert(key, Arc::clone(&inflight));
        drop(in_flight);

        self.stats.record_miss();
        self.start_download(key, inflight)?;
        Ok(FetchOrigin::Network)
    }

    fn start_download(&self, key: CacheKey, inflight: Arc<InFlight>) -> Result<TaskId> {
        let url = inflight.url.clone();
        let task = match self.net.register(self.group, &task_title(&url), &url) {
            Ok(task) => task,
            Err(e) => {
                // Nobody can join an entry that is not in the map.
                self.remove_in_flight(&key, &inflight);
                inflight.finish(Err(FetchError::Other(format!("{:#}", e))));
                return Err(e);
            }
        };
        let task_id = task.id();
        inflight.set_task_id(task_id);

        let job = DownloadJob {
            key,
            url,
            source: Arc::clone(&self.source),
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
            semaphore: Arc::clone(&self.semaphore),
            in_flight: Arc::clone(&self.in_flight),
            shutdown_token: self.shutdown_token.clone(),
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
            inflight,
            task,
        };
        tokio::spawn(job.run());
        Ok(task_id)
    }

    fn remove_in_flight(&self, key: &CacheKey, inflight: &Arc<InFlight>) {
        let mut map = self.in_flight.lock();
        if map.get(key).map_or(false, |e| Arc::ptr_eq(e, inflight)) {
            map.remove(key);
        }
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight.lock().contains_key(&CacheKey::for_url(url))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Cancel every download and refuse new requests.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        let task_ids: Vec<TaskId> = {
            let map = self.in_flight.lock();
            map.values().filter_map(|e| e.task_id()).collect()
        };
        for id in task_ids {
            self.net.abort(id);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn cache(&self) -> &Arc<DiskCache> {
        &self.cache
    }

    pub fn net(&self) -> &Arc<NetManager> {
        &self.net
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn group(&self) -> Option<TaskId> {
        self.group
    }
}

impl Drop for FetchCoordinator {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn task_title(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => url.to_string(),
    }
}

/// Everything one spawned download needs.
struct DownloadJob {
    key: CacheKey,
    url: String,
    source: Arc<dyn ImageSource>,
    cache: Arc<DiskCache>,
    stats: Arc<StatsCollector>,
    semaphore: Arc<Semaphore>,
    in_flight: InFlightMap,
    shutdown_token: CancellationToken,
    max_retries: u32,
    retry_backoff: Duration,
    inflight: Arc<InFlight>,
    task: NetTask,
}

impl DownloadJob {
    async fn run(self) {
        let outcome = self.download().await;

        // Commit happened inside `download`; only now may the entry leave the map.
        self.leave_map();

        match outcome {
            Ok(committed) => {
                self.task.complete();
                self.inflight.finish(Ok(()));
                debug!("fetch {} complete, cached {} bytes", self.url, committed);
                if committed > 0 {
                    match self.cache.evict_to_budget() {
                        Ok(report) => {
                            self.stats
                                .record_eviction(report.removed, report.freed_bytes)
                        }
                        Err(e) => warn!("cache eviction failed: {:#}", e),
                    }
                }
            }
            Err(e) => {
                let cause = FetchError::classify(&e);
                match cause {
                    FetchError::Aborted | FetchError::Shutdown => {
                        debug!("fetch {} stopped: {}", self.url, cause);
                        self.task.abort();
                    }
                    _ => {
                        warn!("fetch {} failed: {:#}", self.url, e);
                        self.task.fail(format!("{:#}", e));
                    }
                }
                self.inflight.finish(Err(cause));
            }
        }
    }

    fn leave_map(&self) {
        let mut map = self.in_flight.lock();
        if map
            .get(&self.key)
            .map_or(false, |e| Arc::ptr_eq(e, &self.inflight))
        {
            map.remove(&self.key);
        }
    }

    /// The body will not be cached: stop buffering it and let later requests start afresh
    /// instead of joining a partial replay.
    fn detach_uncacheable(&self) {
        // Leave the map first so nobody subscribes after the buffer is gone.
        self.leave_map();
        if self.inflight.stop_replay() {
            debug!("fetch {} is not cacheable, no longer joinable", self.url);
        }
    }

    async fn download(&self) -> Result<u64> {
        if self.shutdown_token.is_cancelled() {
            return Err(FetchError::Shutdown.into());
        }
        self.task.wait_while_paused().await?;

        let mut permit = Some(self.acquire_slot().await?);
        self.stats.increment_workers();
        let result = self.fetch_with_retry(&mut permit).await;
        if permit.is_some() {
            self.stats.decrement_workers();
        }
        result
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                Ok(permit.map_err(|e| anyhow!("{}", e))?)
            }
            _ = self.shutdown_token.cancelled() => Err(FetchError::Shutdown.into()),
            _ = self.task.cancelled() => Err(FetchError::Aborted.into()),
        }
    }

    /// Sit out a pause. Paused tasks do not hold a connection slot.
    async fn pause_point(&self, permit: &mut Option<OwnedSemaphorePermit>) -> Result<()> {
        if !self.task.is_paused() {
            return Ok(());
        }
        if permit.take().is_some() {
            self.stats.decrement_workers();
        }
        self.task.wait_while_paused().await?;
        *permit = Some(self.acquire_slot().await?);
        self.stats.increment_workers();
        Ok(())
    }

    async fn fetch_with_retry(&self, permit: &mut Option<OwnedSemaphorePermit>) -> Result<u64> {
        for attempt in 0..=self.max_retries {
            let e = match self.attempt(permit).await {
                Ok(committed) => return Ok(committed),
                Err(e) => e,
            };

            let cause = FetchError::classify(&e);
            let retry = cause.is_retryable()
                && attempt < self.max_retries
                && !self.inflight.has_delivered()
                && !self.task.is_aborted()
                && !self.shutdown_token.is_cancelled();
            if !retry {
                return Err(e);
            }

            warn!(
                "fetch {} failed (attempt {}): {:#}",
                self.url, attempt, e
            );
            let delay = self.retry_backoff * (attempt + 1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_token.cancelled() => return Err(FetchError::Shutdown.into()),
                _ = self.task.cancelled() => return Err(FetchError::Aborted.into()),
            }
        }

        Err(anyhow!("fetch {} retries exhausted", self.url))
    }

    /// One attempt: open the source and pump the body to subscribers and the cache.
    /// Returns the number of bytes committed to the cache (zero if not cached).
    async fn attempt(&self, permit: &mut Option<OwnedSemaphorePermit>) -> Result<u64> {
        self.pause_point(permit).await?;

        let mut body = tokio::select! {
            body = self.source.open(&self.url) => body?,
            _ = self.task.cancelled() => return Err(FetchError::Aborted.into()),
            _ = self.shutdown_token.cancelled() => return Err(FetchError::Shutdown.into()),
        };

        let content_length = body.info().content_length;
        self.task.set_total(content_length);
        self.task.set_running();

        let mut writer = self.open_writer(content_length);
        if writer.is_none() {
            self.detach_uncacheable();
        }
        let mut sniff: Vec<u8> = Vec::with_capacity(SNIFF_BYTES);
        let mut sniffed = false;
        let mut received = 0u64;

        loop {
            self.pause_point(permit).await?;

            let chunk = tokio::select! {
                chunk = body.next_chunk() => chunk?,
                _ = self.task.cancelled() => return Err(FetchError::Aborted.into()),
                _ = self.shutdown_token.cancelled() => return Err(FetchError::Shutdown.into()),
                _ = self.task.paused() => continue,
            };
            let Some(chunk) = chunk else {
                break;
            };
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            received += len;

            if !sniffed {
                let need = SNIFF_BYTES - sniff.len();
                sniff.extend_from_slice(&chunk[..need.min(chunk.len())]);
                if sniff.len() >= SNIFF_BYTES {
                    sniffed = true;
                    if !self.accept_format(&sniff) {
                        writer = None;
                    }
                }
            }

            let failed = match writer.as_mut() {
                Some(w) => w.write(&chunk).err(),
                None => None,
            };
            if let Some(e) = failed {
                match e {
                    CacheWriteError::EntryTooLarge { limit } => {
                        debug!("fetch {} exceeds {} bytes, not caching", self.url, limit)
                    }
                    e => warn!("cache write for {} failed: {}", self.url, e),
                }
                writer = None;
            }
            if writer.is_none() {
                self.detach_uncacheable();
            }

            self.stats.record_downloaded(len);
            self.inflight.publish(chunk);
            self.task.add_progress(len);
        }

        if received == 0 {
            return Err(FetchError::EmptyBody.into());
        }
        if !sniffed && !self.accept_format(&sniff) {
            writer = None;
        }

        let committed = match writer {
            Some(w) => match w.commit() {
                Ok(size) => size,
                Err(e) => {
                    warn!("cache commit for {} failed: {}", self.url, e);
                    0
                }
            },
            None => 0,
        };
        Ok(committed)
    }

    fn open_writer(&self, content_length: Option<u64>) -> Option<CacheWriter> {
        if let Some(len) = content_length {
            if len > self.cache.max_entry_bytes() {
                debug!(
                    "fetch {} declares {} bytes, streaming without caching",
                    self.url, len
                );
                return None;
            }
        }
        match self.cache.begin_write(&self.url) {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!("cannot cache {}: {:#}", self.url, e);
                None
            }
        }
    }

    fn accept_format(&self, header: &[u8]) -> bool {
        let format = detect_image_format(header);
        if !format.is_known() {
            debug!("fetch {} is not a recognised image, not caching", self.url);
        }
        format.is_known()
    }
}
