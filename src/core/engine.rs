use crate::config::{ConfigOverrides, EngineConfig};
use crate::core::adaptive::AdaptiveConcurrencyController;
use crate::core::assembler::FileAssembler;
use crate::core::chunk_store::ChunkStore;
use crate::core::control::{
    DownloadControl, DownloadManager, SIGNAL_CANCEL, SIGNAL_PAUSE,
};
use crate::core::error::{EngineError, TransientKind};
use crate::core::events::EventBus;
use crate::core::metrics::DownloadMetrics;
use crate::core::scheduler::{Candidate, Scheduler};
use crate::core::semaphores::ConcurrencyController;
use crate::core::session::SessionManager;
use crate::core::speed::SpeedTracker;
use crate::core::state::{
    Attempt, Chunk, Download, DownloadState, DownloadUpdate, HistoryEntry, NewDownload,
};
use crate::core::store::StateStore;
use crate::network::chunked::ChunkedDownloader;
use crate::network::simple::{part_path_for, SimpleDownloader};
use crate::network::{breaker::CircuitBreaker, client, TransferDeps, TransferOutcome};
use crate::providers::{CatalogProvider, SavePathResolver};
use crate::utils::filesystem;
/// Download engine orchestrator
///
/// Owns every component, runs the periodic queue processing, and implements
/// the public operations. Transfers execute in spawned tasks; commands
/// reach them through the `DownloadManager` signal table and the session
/// tokens.
use chrono::Utc;
use galleon_shared::{ConflictInfo, EngineEvent, SessionMetrics, Snapshot};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Sentinel stored in `last_error` while a download waits for overwrite
/// confirmation.
pub const NEEDS_CONFIRMATION_SENTINEL: &str = "needs_confirmation";

const SETTINGS_KEY_OVERRIDES: &str = "config_overrides";

const EVENT_DEBOUNCE: Duration = Duration::from_millis(50);

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Everything `get_download_debug` exposes about one download.
#[derive(Debug, Serialize)]
pub struct DownloadDebug {
    pub download: Download,
    pub chunks: Vec<Chunk>,
    pub attempts: Vec<Attempt>,
    pub history: Vec<HistoryEntry>,
    pub has_live_transport: bool,
}

pub struct EngineOptions {
    /// Root for the database, temp chunks and logs
    pub data_dir: PathBuf,
    /// Declared download folder; save paths must stay inside it
    pub download_dir: PathBuf,
    pub config: EngineConfig,
    pub catalog: Arc<dyn CatalogProvider>,
    pub resolver: Arc<dyn SavePathResolver>,
}

struct EngineInner {
    deps: Arc<TransferDeps>,
    scheduler: Arc<Mutex<Scheduler>>,
    adaptive: Arc<AdaptiveConcurrencyController>,
    manager: Arc<DownloadManager>,
    catalog: Arc<dyn CatalogProvider>,
    resolver: Arc<dyn SavePathResolver>,
    download_dir: PathBuf,
    queue_running: AtomicBool,
    shutdown: AtomicBool,
}

pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    pub async fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let mut config = options.config;
        config.normalize();

        std::fs::create_dir_all(&options.data_dir)?;
        let store = Arc::new(StateStore::open(&options.data_dir.join("downloads.db"))?);

        // persisted overrides win over the constructor config
        if let Some(raw) = store.get_setting(SETTINGS_KEY_OVERRIDES)? {
            match serde_json::from_str::<ConfigOverrides>(&raw) {
                Ok(overrides) => overrides.apply(&mut config),
                Err(e) => warn!(error = %e, "ignoring malformed persisted overrides"),
            }
        }

        let scheduler = Arc::new(Mutex::new(Scheduler::new(
            config.ordering.clone(),
            config.downloads.max_concurrent,
            config.downloads.max_concurrent_per_host,
        )));
        let semaphores = Arc::new(ConcurrencyController::new(
            config.downloads.max_concurrent,
            config.chunked.max_concurrent_chunks,
        ));

        let adaptive = {
            let scheduler = scheduler.clone();
            let semaphores = semaphores.clone();
            Arc::new(AdaptiveConcurrencyController::new(
                config.chunked.adaptive_concurrency_config.clone(),
                config.downloads.max_concurrent,
                Box::new(move |global, per_host| {
                    let mut sched = scheduler.lock().unwrap();
                    sched.set_max_concurrent(global);
                    sched.set_max_concurrent_per_host(per_host);
                    semaphores.set_max_global(global);
                }),
            ))
        };

        let chunk_store = Arc::new(ChunkStore::new(&options.data_dir));
        chunk_store.initialize()?;

        let config = Arc::new(RwLock::new(config));
        let network_cfg = config.read().unwrap().network.clone();
        let assembler = Arc::new(FileAssembler::new(&config.read().unwrap().buffer_pool));
        let deps = Arc::new(TransferDeps {
            store: store.clone(),
            chunk_store: chunk_store.clone(),
            assembler,
            sessions: Arc::new(SessionManager::new()),
            speed: Arc::new(SpeedTracker::default()),
            metrics: Arc::new(DownloadMetrics::new()),
            breaker: Arc::new(CircuitBreaker::default()),
            semaphores,
            events: EventBus::new(EVENT_DEBOUNCE),
            transfer_client: client::create_transfer_client(&network_cfg)
                .map_err(|e| EngineError::Logic(format!("http client: {e}")))?,
            metadata_client: client::create_metadata_client(&network_cfg)
                .map_err(|e| EngineError::Logic(format!("http client: {e}")))?,
            config,
        });

        let inner = Arc::new(EngineInner {
            deps,
            scheduler,
            adaptive,
            manager: Arc::new(DownloadManager::new()),
            catalog: options.catalog,
            resolver: options.resolver,
            download_dir: options.download_dir,
            queue_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        inner.install_transition_hooks(&store);
        inner.recover_interrupted()?;
        inner.cleanup_orphan_chunk_dirs()?;
        inner.spawn_periodic_tasks();

        info!("download engine initialized");
        Ok(Self { inner })
    }

    /// Stop the periodic tasks. In-flight transfers keep running until they
    /// observe their signals.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.deps.events.subscribe()
    }

    pub fn add_download(&self, input: NewDownload) -> Result<Download, EngineError> {
        self.inner.add_download(input)
    }

    pub async fn pause_download(&self, id: i64) -> Result<bool, EngineError> {
        self.inner.pause_download(id)
    }

    pub async fn resume_download(&self, id: i64) -> Result<bool, EngineError> {
        self.inner.resume_download(id).await
    }

    pub async fn cancel_download(&self, id: i64) -> Result<bool, EngineError> {
        self.inner.cancel_download(id).await
    }

    pub async fn pause_all(&self) -> Result<usize, EngineError> {
        let mut paused = 0;
        for download in self.inner.deps.store.get_all_downloads()? {
            if !download.state.is_terminal()
                && download.state != DownloadState::Paused
                && self.inner.pause_download(download.id)?
            {
                paused += 1;
            }
        }
        Ok(paused)
    }

    pub async fn resume_all(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for download in self.inner.deps.store.get_downloads_by_state(DownloadState::Paused)? {
            if self.inner.resume_download(download.id).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn cancel_all(&self) -> Result<usize, EngineError> {
        let mut cancelled = 0;
        for download in self.inner.deps.store.get_all_downloads()? {
            if !download.state.is_terminal() && self.inner.cancel_download(download.id).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub async fn confirm_overwrite(&self, id: i64) -> Result<bool, EngineError> {
        self.inner.confirm_overwrite(id).await
    }

    pub async fn restart_stopped_with_overwrite(
        &self,
        ids: Option<Vec<i64>>,
    ) -> Result<usize, EngineError> {
        self.inner.restart_stopped_with_overwrite(ids).await
    }

    pub fn get_snapshot(&self, min_version: Option<u64>) -> Result<Snapshot, EngineError> {
        self.inner.deps.store.get_snapshot(min_version)
    }

    pub fn get_download_debug(&self, id: i64) -> Result<Option<DownloadDebug>, EngineError> {
        let store = &self.inner.deps.store;
        let Some(download) = store.get_download(id)? else {
            return Ok(None);
        };
        Ok(Some(DownloadDebug {
            chunks: store.get_chunks(id)?,
            attempts: store.get_attempts(id)?,
            history: store.get_history(id)?,
            has_live_transport: self.inner.manager.get(id).is_some(),
            download,
        }))
    }

    pub fn get_session_metrics(&self) -> SessionMetrics {
        self.inner.deps.metrics.get_global_metrics()
    }

    pub fn set_download_config_overrides(
        &self,
        overrides: ConfigOverrides,
    ) -> Result<(), EngineError> {
        self.inner.apply_overrides(overrides)
    }

    pub fn update_adaptive_concurrency_max(&self, ceiling: usize) {
        self.inner.adaptive.set_user_ceiling(ceiling.clamp(1, 3));
    }

    /// Kick the queue outside the periodic cadence.
    pub fn nudge_queue(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.process_queue().await;
        });
    }
}

impl EngineInner {
    // ---- boot ---------------------------------------------------------

    fn install_transition_hooks(&self, store: &Arc<StateStore>) {
        let scheduler = self.scheduler.clone();
        let weak_store: Weak<StateStore> = Arc::downgrade(store);
        let on_enter = Arc::new(move |id: i64, state: DownloadState| {
            if state != DownloadState::Starting {
                return;
            }
            let Some(store) = weak_store.upgrade() else {
                return;
            };
            if let Ok(Some(download)) = store.get_download(id) {
                if let Some(host) = download.host() {
                    scheduler.lock().unwrap().register_download(id, &host);
                }
            }
        });

        let scheduler = self.scheduler.clone();
        let semaphores = self.deps.semaphores.clone();
        let speed = self.deps.speed.clone();
        let weak_store: Weak<StateStore> = Arc::downgrade(store);
        let on_exit = Arc::new(move |id: i64, old: DownloadState, new: DownloadState| {
            if !(old.is_active() && !new.is_active()) {
                return;
            }
            // leaving the active set frees the slot and the host budget
            semaphores.release_global();
            speed.remove(id);
            let Some(store) = weak_store.upgrade() else {
                return;
            };
            if let Ok(Some(download)) = store.get_download(id) {
                if let Some(host) = download.host() {
                    scheduler.lock().unwrap().unregister_download(id, &host);
                }
            }
        });

        store.set_transition_hooks(on_enter, on_exit);
    }

    /// Re-queue downloads a previous process left mid-transfer.
    fn recover_interrupted(&self) -> Result<(), EngineError> {
        for state in [
            DownloadState::Starting,
            DownloadState::Downloading,
            DownloadState::Merging,
            DownloadState::Verifying,
        ] {
            for download in self.deps.store.get_downloads_by_state(state)? {
                info!(id = download.id, from = %state, "re-queueing interrupted download");
                // no transport exists yet, so route through paused
                self.deps
                    .store
                    .transition_state(download.id, DownloadState::Paused, Some(state))?;
                self.deps
                    .store
                    .transition_state(download.id, DownloadState::Queued, None)?;
            }
        }
        Ok(())
    }

    fn cleanup_orphan_chunk_dirs(&self) -> Result<(), EngineError> {
        let mut active: HashSet<i64> = HashSet::new();
        for download in self.deps.store.get_all_downloads()? {
            if !download.state.is_terminal() {
                active.insert(download.id);
            }
        }
        let removed = self.deps.chunk_store.cleanup_orphaned_dirs(&active);
        if removed > 0 {
            info!(removed, "cleaned orphan chunk directories");
        }
        Ok(())
    }

    fn spawn_periodic_tasks(self: &Arc<Self>) {
        let queue_delay = Duration::from_millis(
            self.deps.config.read().unwrap().downloads.queue_process_delay_ms,
        );
        let evaluate_interval = Duration::from_millis(
            self.deps
                .config
                .read()
                .unwrap()
                .chunked
                .adaptive_concurrency_config
                .evaluate_interval_ms,
        );
        let adaptive_enabled = self.deps.config.read().unwrap().chunked.adaptive_concurrency;

        let inner = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(queue_delay);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                inner.process_queue().await;
            }
        });

        let inner = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(METRICS_LOG_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let metrics = inner.deps.metrics.get_global_metrics();
                info!(
                    started = metrics.started,
                    completed = metrics.completed,
                    failed = metrics.failed,
                    active = metrics.active,
                    total_mb = metrics.total_bytes / 1_048_576,
                    error_rate = metrics.error_rate,
                    "session metrics"
                );
            }
        });

        if adaptive_enabled {
            let inner = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(evaluate_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tick.tick().await;
                    if inner.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.adaptive.evaluate();
                }
            });
        }
    }

    // ---- queue --------------------------------------------------------

    async fn process_queue(self: &Arc<Self>) {
        if self.queue_running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.process_queue_inner().await {
            warn!(error = %e, "queue processing failed");
        }
        self.queue_running.store(false, Ordering::SeqCst);
    }

    async fn process_queue_inner(self: &Arc<Self>) -> Result<(), EngineError> {
        let batch_size = self.deps.config.read().unwrap().downloads.max_queue_batch_size;
        let queued = self.deps.store.get_downloads_by_state(DownloadState::Queued)?;
        if queued.is_empty() {
            return Ok(());
        }

        let slots = self.deps.semaphores.available_global_slots();
        if slots == 0 {
            return Ok(());
        }
        let active = self.deps.semaphores.global_active();

        let candidates: Vec<Candidate> = queued
            .iter()
            .take(batch_size)
            .map(Candidate::from_download)
            .collect();
        let picks = self
            .scheduler
            .lock()
            .unwrap()
            .select_to_start(&candidates, slots, active);

        for pick in picks {
            // confirm the row is still queued before committing a slot
            let Some(current) = self.deps.store.get_download(pick.id)? else {
                continue;
            };
            if current.state != DownloadState::Queued {
                continue;
            }
            if !self.deps.semaphores.acquire_global() {
                break;
            }
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_transfer(pick.id).await;
            });
        }
        Ok(())
    }

    // ---- transfer lifecycle -------------------------------------------

    /// Full lifecycle of one start attempt: metadata, strategy, transfer,
    /// outcome handling. Runs in its own task; the global slot is held on
    /// entry and released by the exit hook (or explicitly on pre-start
    /// failures).
    async fn run_transfer(self: &Arc<Self>, id: i64) {
        match self.start_download(id).await {
            Ok(()) => {}
            Err(e) => {
                // failures before the starting transition still hold the slot
                if let Ok(Some(d)) = self.deps.store.get_download(id) {
                    if d.state == DownloadState::Queued {
                        self.deps.semaphores.release_global();
                    }
                }
                if !matches!(e, EngineError::Cancelled) {
                    self.handle_transfer_error(id, e).await;
                }
            }
        }
    }

    async fn start_download(self: &Arc<Self>, id: i64) -> Result<(), EngineError> {
        let Some(mut download) = self.deps.store.get_download(id)? else {
            return Err(EngineError::Logic(format!("download {id} not found")));
        };
        if download.state != DownloadState::Queued {
            debug!(id, state = %download.state, "start skipped, not queued");
            self.deps.semaphores.release_global();
            return Ok(());
        }

        if !self
            .deps
            .store
            .transition_state(id, DownloadState::Starting, Some(DownloadState::Queued))?
        {
            self.deps.semaphores.release_global();
            return Ok(());
        }
        self.deps.store.update_download(
            id,
            &DownloadUpdate {
                started_at: Some(Some(Utc::now())),
                ..Default::default()
            },
        )?;
        self.deps.events.emit_state_changed(self.deps.store.get_state_version());

        download = self.ensure_metadata(download).await?;
        let host = download
            .host()
            .ok_or_else(|| EngineError::Logic(format!("download {id} has no resolvable host")))?;
        // the enter hook could not register before the URL was resolved
        self.scheduler.lock().unwrap().register_download(id, &host);

        let target = download
            .save_path
            .clone()
            .ok_or_else(|| EngineError::Logic(format!("download {id} has no save path")))?;

        // overwrite conflicts park the download instead of failing it
        if !download.force_overwrite {
            if let Ok(meta) = std::fs::metadata(&target) {
                if meta.len() > 0 {
                    self.park_for_confirmation(&download, &target, meta.len())?;
                    return Ok(());
                }
            }
        }

        if download.total_bytes > 0 {
            filesystem::validate_disk_space(&target, download.total_bytes)?;
        }

        let use_chunked = self.should_use_chunked(&download, &host).await;
        let token = self.deps.sessions.create_session(id);
        let control = Arc::new(DownloadControl::new(token));
        self.manager.register(id, control.clone());
        self.deps.metrics.record_start(id, Some(&host));

        info!(
            id,
            title = %download.title,
            host = %host,
            size_mb = download.total_bytes / 1_048_576,
            strategy = if use_chunked { "chunked" } else { "simple" },
            "starting transfer"
        );

        let transfer_started = std::time::Instant::now();
        let baseline_bytes = control.downloaded_bytes.load(Ordering::SeqCst);
        let outcome = if use_chunked {
            ChunkedDownloader::run(self.deps.clone(), &download, control.clone()).await
        } else {
            SimpleDownloader::run(&self.deps, &download, control.clone()).await
        };

        self.manager.remove(id);

        match outcome {
            Ok(TransferOutcome::Completed) => {
                let session_bytes = control
                    .downloaded_bytes
                    .load(Ordering::SeqCst)
                    .saturating_sub(baseline_bytes);
                let elapsed = transfer_started.elapsed().as_secs_f64().max(0.001);
                self.adaptive.record_success(session_bytes as f64 / elapsed);
                self.nudge_after(Duration::from_millis(0));
            }
            Ok(TransferOutcome::Paused) | Ok(TransferOutcome::Cancelled) => {
                self.deps.metrics.record_cancelled_or_paused(id);
            }
            Ok(TransferOutcome::RetryAfter(delay)) => {
                self.deps.metrics.record_transient_retry(Some(&host));
                self.adaptive.record_transient_retry();
                self.deps.store.transition_state(id, DownloadState::Queued, None)?;
                self.deps.events.emit_state_changed(self.deps.store.get_state_version());
                info!(id, delay_secs = delay.as_secs(), "re-queued after rate limit");
                self.nudge_after(delay);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Resolve URL (catalog), size (HEAD) and save path (resolver), and
    /// persist whatever was learned.
    async fn ensure_metadata(&self, mut download: Download) -> Result<Download, EngineError> {
        let id = download.id;
        let mut update = DownloadUpdate::default();

        if download.url.is_none() {
            let catalog_id = download.catalog_id.ok_or_else(|| {
                EngineError::Logic(format!("download {id} has neither url nor catalog id"))
            })?;
            let info = self.catalog.get_file_info(catalog_id).await.ok_or_else(|| {
                EngineError::Logic(format!("catalog has no entry for item {catalog_id}"))
            })?;
            let url = info.url.ok_or_else(|| {
                EngineError::Logic(format!("catalog item {catalog_id} has no url"))
            })?;
            if let Some(title) = info.title {
                if !title.is_empty() && download.title.is_empty() {
                    download.title = title;
                }
            }
            download.url = Some(url.clone());
            update.url = Some(url);
        }

        if download.total_bytes == 0 {
            let url = download.url.as_deref().unwrap();
            let host = download
                .host()
                .ok_or_else(|| EngineError::Logic(format!("unparsable url {url}")))?;
            if let Some(size) = self.probe_size(url, &host).await? {
                download.total_bytes = size;
                update.total_bytes = Some(size);
            }
        }

        if download.save_path.is_none() {
            let relative = match download.catalog_id {
                Some(catalog_id) if download.preserve_structure => {
                    self.catalog.get_ancestor_path(catalog_id).await
                }
                _ => Vec::new(),
            };
            let path = self
                .resolver
                .build_save_path(
                    &self.download_dir,
                    &download.title,
                    download.preserve_structure,
                    &relative,
                )
                .map_err(EngineError::Logic)?;
            if !filesystem::path_is_within(&self.download_dir, &path) {
                return Err(EngineError::Disk(format!(
                    "save path {} escapes the download folder",
                    path.display()
                )));
            }
            download.save_path = Some(path.clone());
            update.save_path = Some(path);
        }

        self.deps.store.update_download(id, &update)?;
        Ok(download)
    }

    /// HEAD for the size, falling back to a ranged GET for servers that
    /// reject HEAD.
    async fn probe_size(&self, url: &str, host: &str) -> Result<Option<u64>, EngineError> {
        self.deps.breaker.check(host)?;

        let head = self.deps.metadata_client.head(url).send().await;
        let response = match head {
            Ok(r) if r.status().is_success() => r,
            _ => {
                debug!(url, "HEAD failed, falling back to ranged GET");
                match self
                    .deps
                    .metadata_client
                    .get(url)
                    .header(reqwest::header::RANGE, "bytes=0-0")
                    .send()
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        self.deps.breaker.record_failure(host);
                        return Err(e.into());
                    }
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.deps.breaker.record_failure(host);
            return Err(EngineError::from_status(status.as_u16(), None));
        }
        self.deps.breaker.record_success(host);

        // a 206 reports the range length; Content-Range carries the total
        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.parse::<u64>().ok());
            return Ok(total);
        }
        Ok(response.content_length().filter(|len| *len > 0))
    }

    async fn should_use_chunked(&self, download: &Download, host: &str) -> bool {
        let cfg = self.deps.config_snapshot();
        let chunked = &cfg.chunked;
        if !chunked.enabled || chunked.force_simple_download {
            return false;
        }
        if download.total_bytes == 0 || download.total_bytes < chunked.size_threshold_bytes {
            return false;
        }
        if !chunked.check_range_support {
            return true;
        }
        match ChunkedDownloader::probe_range_support(
            &self.deps,
            download.url.as_deref().unwrap_or_default(),
            host,
        )
        .await
        {
            Ok(supported) => supported,
            Err(e) => {
                debug!(id = download.id, error = %e, "range probe failed, using simple");
                false
            }
        }
    }

    fn park_for_confirmation(
        &self,
        download: &Download,
        target: &Path,
        existing_size: u64,
    ) -> Result<(), EngineError> {
        warn!(id = download.id, path = %target.display(), "target exists, awaiting confirmation");
        self.deps.store.update_download(
            download.id,
            &DownloadUpdate {
                last_error: Some(Some(NEEDS_CONFIRMATION_SENTINEL.to_string())),
                ..Default::default()
            },
        )?;
        self.deps
            .store
            .transition_state(download.id, DownloadState::Paused, None)?;
        self.deps.events.emit_needs_confirmation(ConflictInfo {
            id: download.id,
            title: download.title.clone(),
            path: target.to_string_lossy().to_string(),
            existing_size,
            total_bytes: download.total_bytes,
        });
        self.deps.events.emit_state_changed(self.deps.store.get_state_version());
        Ok(())
    }

    /// Classify a transfer error: transient with remaining budget re-queues
    /// with backoff, everything else fails the download.
    async fn handle_transfer_error(self: &Arc<Self>, id: i64, error: EngineError) {
        let download = match self.deps.store.get_download(id) {
            Ok(Some(d)) => d,
            _ => return,
        };
        // a user command raced the failure; their state wins
        if matches!(
            download.state,
            DownloadState::Paused | DownloadState::Cancelled | DownloadState::Completed
        ) {
            debug!(id, state = %download.state, "transfer error ignored after user action");
            return;
        }
        let was_merging = download.state == DownloadState::Merging;
        let host = download.host();
        let max_retries = self.deps.config.read().unwrap().downloads.max_retries;

        let _ = self.deps.store.record_attempt(&Attempt {
            download_id: id,
            chunk_index: None,
            attempt_number: download.retry_count + 1,
            timestamp: Utc::now(),
            error: Some(error.to_string()),
            error_code: Some(error.error_code().to_string()),
            bytes_transferred: download.downloaded_bytes,
            duration_ms: 0,
            speed_bps: 0.0,
        });

        if error.is_transient() && download.retry_count < max_retries {
            let retry_count = download.retry_count + 1;
            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.backoff_for(&error, retry_count));
            warn!(
                id,
                retry = retry_count,
                delay_secs = delay.as_secs(),
                error = %error,
                "transient failure, re-queueing"
            );
            let _ = self.deps.store.update_download(
                id,
                &DownloadUpdate {
                    retry_count: Some(retry_count),
                    last_error: Some(Some(error.to_string())),
                    ..Default::default()
                },
            );
            self.deps.metrics.record_transient_retry(host.as_deref());
            self.adaptive.record_transient_retry();
            let requeued = self
                .deps
                .store
                .transition_state(id, DownloadState::Queued, None)
                .unwrap_or(false);
            if requeued {
                self.deps.events.emit_state_changed(self.deps.store.get_state_version());
                self.nudge_after(delay);
                return;
            }
            // fell out of the machine (e.g. cancelled underneath); done
            return;
        }

        error!(id, error = %error, "download failed");
        let _ = self.deps.store.update_download(
            id,
            &DownloadUpdate {
                last_error: Some(Some(error.to_string())),
                ..Default::default()
            },
        );
        let _ = self
            .deps
            .store
            .transition_state(id, DownloadState::Failed, None);
        self.deps.metrics.record_failed(id);
        self.adaptive.record_permanent_error();
        self.deps
            .events
            .emit_download_failed(id, error.to_string(), was_merging);
        self.deps.events.emit_state_changed(self.deps.store.get_state_version());
    }

    fn backoff_for(&self, error: &EngineError, retry_count: u32) -> Duration {
        let cfg = self.deps.config.read().unwrap();
        let base = match error {
            EngineError::TransientNetwork {
                kind: TransientKind::Timeout,
                ..
            } => cfg.network.retry_delay_ms * 2,
            _ => cfg.network.retry_delay_ms,
        };
        Duration::from_millis(base << retry_count.min(8)).min(MAX_BACKOFF)
    }

    fn nudge_after(self: &Arc<Self>, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !inner.shutdown.load(Ordering::SeqCst) {
                inner.process_queue().await;
            }
        });
    }

    // ---- public operations --------------------------------------------

    fn add_download(self: &Arc<Self>, input: NewDownload) -> Result<Download, EngineError> {
        let max_queue = self.deps.config.read().unwrap().downloads.max_queue_size;
        let snapshot = self.deps.store.get_snapshot(None)?;
        let waiting = snapshot
            .summary
            .counts
            .get("queued")
            .copied()
            .unwrap_or(0) as usize;
        if waiting >= max_queue {
            return Err(EngineError::Logic(format!(
                "queue is full ({waiting}/{max_queue})"
            )));
        }

        let download = self.deps.store.add_download(input)?;
        self.deps.events.emit_state_changed(self.deps.store.get_state_version());

        // a known target that already holds data needs explicit confirmation
        if download.state == DownloadState::Queued && !download.force_overwrite {
            if let Some(target) = download.save_path.as_deref() {
                if let Ok(meta) = std::fs::metadata(target) {
                    if meta.len() > 0 {
                        self.park_for_confirmation(&download, target, meta.len())?;
                        return self
                            .deps
                            .store
                            .get_download(download.id)?
                            .ok_or_else(|| EngineError::Logic("download vanished".into()));
                    }
                }
            }
        }

        if download.state == DownloadState::Queued {
            self.nudge_after(Duration::from_millis(0));
        }
        Ok(download)
    }

    fn pause_download(&self, id: i64) -> Result<bool, EngineError> {
        let Some(download) = self.deps.store.get_download(id)? else {
            return Ok(false);
        };
        if download.state.is_terminal() || download.state == DownloadState::Paused {
            return Ok(false);
        }

        // checkpointing happens in the downloader as it observes the signal
        self.manager.raise(id, SIGNAL_PAUSE);
        self.deps.sessions.invalidate(id);
        self.deps.metrics.record_cancelled_or_paused(id);

        let paused = self
            .deps
            .store
            .transition_state(id, DownloadState::Paused, None)?;
        if paused {
            info!(id, from = %download.state, "download paused");
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
        }
        Ok(paused)
    }

    async fn resume_download(self: &Arc<Self>, id: i64) -> Result<bool, EngineError> {
        let Some(download) = self.deps.store.get_download(id)? else {
            return Ok(false);
        };

        let resumed = match download.state {
            DownloadState::Paused => {
                if download.last_error.as_deref() == Some(NEEDS_CONFIRMATION_SENTINEL) {
                    // overwrite conflicts resume through confirm_overwrite
                    return Ok(false);
                }
                self.deps.store.clear_last_error(id)?;
                self.deps
                    .store
                    .transition_state(id, DownloadState::Queued, Some(DownloadState::Paused))?
            }
            DownloadState::Cancelled | DownloadState::Failed => {
                self.reset_download_data(&download).await?;
                self.deps.store.update_download(
                    id,
                    &DownloadUpdate {
                        downloaded_bytes: Some(0),
                        progress: Some(0.0),
                        retry_count: Some(0),
                        last_error: Some(None),
                        partial_tail_hash: Some(None),
                        partial_tail_size: Some(0),
                        actual_hash: Some(None),
                        size_verified: Some(false),
                        hash_verified: Some(false),
                        ..Default::default()
                    },
                )?;
                self.deps
                    .store
                    .transition_state(id, DownloadState::Queued, None)?
            }
            _ => false,
        };

        if resumed {
            info!(id, "download resumed");
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
            self.nudge_after(Duration::from_millis(0));
        }
        Ok(resumed)
    }

    async fn cancel_download(self: &Arc<Self>, id: i64) -> Result<bool, EngineError> {
        let Some(download) = self.deps.store.get_download(id)? else {
            return Ok(false);
        };
        if download.state.is_terminal() {
            return Ok(false);
        }

        if download.state == DownloadState::Merging {
            // let the merge worker finish; it cleans up when it sees the
            // cancelled row
            info!(id, "cancel during merge, deferring cleanup");
            self.deps.sessions.invalidate(id);
            let cancelled = self
                .deps
                .store
                .transition_state(id, DownloadState::Cancelled, None)?;
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
            return Ok(cancelled);
        }

        self.manager.raise(id, SIGNAL_CANCEL);
        self.deps.sessions.invalidate(id);
        self.deps.metrics.record_cancelled_or_paused(id);

        let cancelled = self
            .deps
            .store
            .transition_state(id, DownloadState::Cancelled, None)?;
        if cancelled {
            info!(id, from = %download.state, "download cancelled");
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
            // fire-and-forget file cleanup
            let inner = self.deps.clone();
            let target = download.save_path.clone();
            tokio::spawn(async move {
                let _ = inner.chunk_store.delete_all_chunks(id);
                let _ = inner.store.delete_chunks(id);
                if let Some(target) = target {
                    let _ = tokio::fs::remove_file(part_path_for(&target)).await;
                }
            });
        }
        Ok(cancelled)
    }

    async fn confirm_overwrite(self: &Arc<Self>, id: i64) -> Result<bool, EngineError> {
        let Some(download) = self.deps.store.get_download(id)? else {
            return Ok(false);
        };
        if download.state != DownloadState::Paused {
            return Ok(false);
        }

        if let Some(target) = download.save_path.as_deref() {
            if tokio::fs::try_exists(target).await? {
                tokio::fs::remove_file(target).await?;
            }
        }
        self.reset_download_data(&download).await?;
        self.deps.store.update_download(
            id,
            &DownloadUpdate {
                force_overwrite: Some(true),
                downloaded_bytes: Some(0),
                progress: Some(0.0),
                last_error: Some(None),
                partial_tail_hash: Some(None),
                partial_tail_size: Some(0),
                ..Default::default()
            },
        )?;
        let requeued = self
            .deps
            .store
            .transition_state(id, DownloadState::Queued, Some(DownloadState::Paused))?;
        if requeued {
            info!(id, "overwrite confirmed, re-queued");
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
            self.nudge_after(Duration::from_millis(0));
        }
        Ok(requeued)
    }

    async fn restart_stopped_with_overwrite(
        self: &Arc<Self>,
        ids: Option<Vec<i64>>,
    ) -> Result<usize, EngineError> {
        let wanted: Option<HashSet<i64>> = ids.map(|v| v.into_iter().collect());
        let mut restarted = 0;
        for state in [DownloadState::Cancelled, DownloadState::Failed] {
            for download in self.deps.store.get_downloads_by_state(state)? {
                if let Some(wanted) = &wanted {
                    if !wanted.contains(&download.id) {
                        continue;
                    }
                }
                self.reset_download_data(&download).await?;
                // retry budget resets; the attempts history stays on record
                self.deps.store.update_download(
                    download.id,
                    &DownloadUpdate {
                        force_overwrite: Some(true),
                        downloaded_bytes: Some(0),
                        progress: Some(0.0),
                        retry_count: Some(0),
                        last_error: Some(None),
                        partial_tail_hash: Some(None),
                        partial_tail_size: Some(0),
                        ..Default::default()
                    },
                )?;
                if self
                    .deps
                    .store
                    .transition_state(download.id, DownloadState::Queued, Some(state))?
                {
                    restarted += 1;
                }
            }
        }
        if restarted > 0 {
            self.deps.events.emit_state_changed(self.deps.store.get_state_version());
            self.nudge_after(Duration::from_millis(0));
        }
        Ok(restarted)
    }

    /// Drop chunk rows, chunk files and the partial for a fresh start.
    async fn reset_download_data(&self, download: &Download) -> Result<(), EngineError> {
        self.deps.chunk_store.delete_all_chunks(download.id)?;
        self.deps.store.delete_chunks(download.id)?;
        if let Some(target) = download.save_path.as_deref() {
            let _ = tokio::fs::remove_file(part_path_for(target)).await;
        }
        Ok(())
    }

    fn apply_overrides(&self, overrides: ConfigOverrides) -> Result<(), EngineError> {
        let applied = {
            let mut cfg = self.deps.config.write().unwrap();
            overrides.apply(&mut cfg);
            cfg.clone()
        };

        {
            let mut scheduler = self.scheduler.lock().unwrap();
            scheduler.set_max_concurrent(applied.downloads.max_concurrent);
            scheduler.set_max_concurrent_per_host(applied.downloads.max_concurrent_per_host);
            scheduler.set_turbo(applied.ordering.turbo);
        }
        self.deps
            .semaphores
            .set_max_global(applied.downloads.max_concurrent);
        self.deps
            .semaphores
            .set_max_chunk_slots(applied.chunked.max_concurrent_chunks);
        self.adaptive
            .set_user_ceiling(applied.downloads.max_concurrent);

        let raw = serde_json::to_string(&overrides)
            .map_err(|e| EngineError::Logic(format!("serialize overrides: {e}")))?;
        self.deps.store.set_setting(SETTINGS_KEY_OVERRIDES, &raw)?;
        info!("configuration overrides applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CatalogFileInfo, SanitizingPathResolver};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubCatalog;

    #[async_trait]
    impl CatalogProvider for StubCatalog {
        async fn get_file_info(&self, _catalog_id: i64) -> Option<CatalogFileInfo> {
            None
        }
        async fn get_ancestor_path(&self, _catalog_id: i64) -> Vec<String> {
            Vec::new()
        }
    }

    fn quiet_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        // keep the periodic tasks out of the way during tests
        cfg.downloads.queue_process_delay_ms = 3_600_000;
        cfg.chunked.adaptive_concurrency = false;
        cfg
    }

    async fn engine(dir: &Path) -> DownloadEngine {
        DownloadEngine::new(EngineOptions {
            data_dir: dir.join("data"),
            download_dir: dir.join("downloads"),
            config: quiet_config(),
            catalog: Arc::new(StubCatalog),
            resolver: Arc::new(SanitizingPathResolver),
        })
        .await
        .unwrap()
    }

    fn paused_input(title: &str) -> NewDownload {
        NewDownload {
            title: title.to_string(),
            url: Some(format!("https://host.example/{title}")),
            total_bytes: 1_000_000,
            start_paused: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_download_round_trip() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;

        let added = engine
            .add_download(NewDownload {
                title: "game.zip".into(),
                url: Some("https://host.example/game.zip".into()),
                total_bytes: 1_000_000,
                start_paused: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(added.state, DownloadState::Paused);

        let snapshot = engine.get_snapshot(None).unwrap();
        assert_eq!(snapshot.summary.total, 1);
        let row = &snapshot.downloads[0];
        assert_eq!(row.title, "game.zip");
        assert_eq!(row.total_bytes, 1_000_000);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_add_queued_starts_in_queued() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let added = engine
            .add_download(NewDownload {
                title: "game.zip".into(),
                url: Some("https://host.invalid/game.zip".into()),
                total_bytes: 1_000_000,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(added.state, DownloadState::Queued);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();

        // paused -> queued on resume
        assert!(engine.resume_download(d.id).await.unwrap());
        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);

        // queued -> paused on pause
        assert!(engine.pause_download(d.id).await.unwrap());
        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Paused);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_then_resume_resets_progress() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();

        engine
            .inner
            .deps
            .store
            .update_download(
                d.id,
                &DownloadUpdate {
                    downloaded_bytes: Some(500),
                    progress: Some(0.5),
                    retry_count: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(engine.cancel_download(d.id).await.unwrap());
        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Cancelled);

        assert!(engine.resume_download(d.id).await.unwrap());
        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);
        assert_eq!(row.downloaded_bytes, 0);
        assert_eq!(row.retry_count, 0);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_needs_confirmation_on_existing_target() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let mut rx = engine.subscribe();

        let target = dir.path().join("downloads").join("exists.zip");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"already here").unwrap();

        let d = engine
            .add_download(NewDownload {
                title: "exists.zip".into(),
                url: Some("https://host.example/exists.zip".into()),
                save_path: Some(target.clone()),
                total_bytes: 1_000,
                ..Default::default()
            })
            .unwrap();

        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Paused);
        assert_eq!(
            row.last_error.as_deref(),
            Some(NEEDS_CONFIRMATION_SENTINEL)
        );

        // the conflict event is observable
        let mut saw_conflict = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::NeedsConfirmation { .. }) {
                saw_conflict = true;
            }
        }
        assert!(saw_conflict);

        // plain resume refuses; confirm_overwrite re-queues and clears the file
        assert!(!engine.resume_download(d.id).await.unwrap());
        assert!(engine.confirm_overwrite(d.id).await.unwrap());
        let row = engine.inner.deps.store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);
        assert!(row.force_overwrite);
        assert!(!target.exists());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_restart_stopped_with_overwrite_keeps_attempts() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();
        let store = &engine.inner.deps.store;

        store
            .record_attempt(&Attempt {
                download_id: d.id,
                chunk_index: None,
                attempt_number: 1,
                timestamp: Utc::now(),
                error: Some("ECONNRESET".into()),
                error_code: Some("NETWORK".into()),
                bytes_transferred: 10,
                duration_ms: 5,
                speed_bps: 2000.0,
            })
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Failed, None)
            .unwrap();

        let restarted = engine
            .restart_stopped_with_overwrite(Some(vec![d.id]))
            .await
            .unwrap();
        assert_eq!(restarted, 1);

        let row = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);
        assert!(row.force_overwrite);
        assert_eq!(row.retry_count, 0);
        assert_eq!(store.get_attempts(d.id).unwrap().len(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_boot_recovery_requeues_interrupted() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = engine(dir.path()).await;
            let d = engine.add_download(paused_input("a.zip")).unwrap();
            let store = &engine.inner.deps.store;
            store
                .transition_state(d.id, DownloadState::Queued, None)
                .unwrap();
            store
                .transition_state(d.id, DownloadState::Starting, None)
                .unwrap();
            store
                .transition_state(d.id, DownloadState::Downloading, None)
                .unwrap();
            engine.shutdown();
            d.id
        };

        let engine = engine(dir.path()).await;
        let row = engine.inner.deps.store.get_download(id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_overrides_persist_across_boot() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path()).await;
            engine
                .set_download_config_overrides(ConfigOverrides {
                    max_parallel: Some(3),
                    disable_chunked: Some(true),
                    turbo: Some(true),
                    ..Default::default()
                })
                .unwrap();
            engine.shutdown();
        }

        let engine = engine(dir.path()).await;
        let cfg = engine.inner.deps.config.read().unwrap().clone();
        assert_eq!(cfg.downloads.max_concurrent, 3);
        assert!(!cfg.chunked.enabled);
        assert!(cfg.ordering.turbo);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_pause_all_and_resume_all() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let a = engine.add_download(paused_input("a.zip")).unwrap();
        let b = engine.add_download(paused_input("b.zip")).unwrap();

        let resumed = engine.resume_all().await.unwrap();
        assert_eq!(resumed, 2);
        let paused = engine.pause_all().await.unwrap();
        assert_eq!(paused, 2);
        for id in [a.id, b.id] {
            let row = engine.inner.deps.store.get_download(id).unwrap().unwrap();
            assert_eq!(row.state, DownloadState::Paused);
        }
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_transient_error_requeues_with_attempt() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();
        let store = &engine.inner.deps.store;
        store
            .transition_state(d.id, DownloadState::Queued, None)
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Starting, None)
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Downloading, None)
            .unwrap();

        engine
            .inner
            .handle_transfer_error(
                d.id,
                EngineError::TransientNetwork {
                    kind: TransientKind::Network,
                    message: "ECONNRESET".into(),
                    retry_after: None,
                },
            )
            .await;

        let row = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Queued);
        assert_eq!(row.retry_count, 1);
        assert!(row.last_error.as_deref().unwrap().contains("ECONNRESET"));
        let attempts = store.get_attempts(d.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error_code.as_deref(), Some("NETWORK"));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_permanent_error_fails_download() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let mut rx = engine.subscribe();
        let d = engine.add_download(paused_input("a.zip")).unwrap();
        let store = &engine.inner.deps.store;
        store
            .transition_state(d.id, DownloadState::Queued, None)
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Starting, None)
            .unwrap();

        engine
            .inner
            .handle_transfer_error(d.id, EngineError::Permanent4xx { status: 404 })
            .await;

        let row = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Failed);

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::DownloadFailed {
                id,
                failed_during_merge,
                ..
            } = event
            {
                assert_eq!(id, d.id);
                assert!(!failed_during_merge);
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        let metrics = engine.get_session_metrics();
        assert_eq!(metrics.failed, 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();
        let store = &engine.inner.deps.store;
        let max = engine.inner.deps.config.read().unwrap().downloads.max_retries;
        store
            .transition_state(d.id, DownloadState::Queued, None)
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Starting, None)
            .unwrap();
        store
            .update_download(
                d.id,
                &DownloadUpdate {
                    retry_count: Some(max),
                    ..Default::default()
                },
            )
            .unwrap();

        engine
            .inner
            .handle_transfer_error(
                d.id,
                EngineError::TransientNetwork {
                    kind: TransientKind::Timeout,
                    message: "idle watchdog".into(),
                    retry_after: None,
                },
            )
            .await;

        let row = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(row.state, DownloadState::Failed);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_debug_report() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path()).await;
        let d = engine.add_download(paused_input("a.zip")).unwrap();

        let report = engine.get_download_debug(d.id).unwrap().unwrap();
        assert_eq!(report.download.id, d.id);
        assert!(!report.has_live_transport);
        assert!(engine.get_download_debug(9999).unwrap().is_none());
        engine.shutdown();
    }
}
