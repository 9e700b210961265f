use crate::config::{ChunkedConfig, EngineConfig};
use crate::core::control::{DownloadControl, SIGNAL_ABORT, SIGNAL_PAUSE, SIGNAL_RUN};
use crate::core::error::{EngineError, IntegrityError, TransientKind};
use crate::core::integrity::Verifier;
use crate::core::state::{
    Attempt, Chunk, ChunkState, ChunkUpdate, Download, DownloadState, DownloadUpdate,
};
use crate::core::store::ChunkSpec;
use crate::network::{headers, TransferDeps, TransferOutcome};
use crate::network::simple::TAIL_CHECKPOINT_WINDOW;
/// Parallel byte-range downloader
///
/// Splits a file of known size into contiguous ranges, runs up to the
/// per-download slot cap of ranged GETs concurrently, writes each range to
/// its own temp file, and feeds completions into an incremental merge
/// session that assembles the staging file in strict index order.
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONNECTION, RANGE, REFERER};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const WRITE_BUFFER_CAPACITY: usize = 128 * 1024;

/// Wait between slot-acquisition probes while all chunk slots are busy.
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const MAX_CHUNK_BACKOFF: Duration = Duration::from_secs(60);

/// Compute the chunk ranges for a file of `total` bytes. Ranges are
/// inclusive, contiguous and non-overlapping; the last chunk absorbs the
/// remainder.
pub fn plan_chunks(total: u64, cfg: &ChunkedConfig) -> Vec<(u64, u64)> {
    assert!(total > 0, "chunk plan requires a known size");

    let count = if cfg.use_band_strategy {
        let band = &cfg.band;
        if total < band.medium_range_max {
            let wanted = total.div_ceil(band.size_medium_target) as u32;
            wanted.clamp(band.count_medium_min, band.count_medium_max)
        } else {
            let wanted = total.div_ceil(band.size_large_base) as u32;
            wanted.clamp(band.count_large_min, band.count_large_max)
        }
    } else {
        let chunk_size = cfg
            .range_table
            .iter()
            .find(|(max_total, _)| total <= *max_total)
            .map(|(_, size)| *size)
            .unwrap_or(64 * 1024 * 1024);
        total.div_ceil(chunk_size) as u32
    };
    let count = count
        .clamp(1, cfg.max_chunks)
        .min(total.min(u64::from(u32::MAX)) as u32)
        .max(1);

    let chunk_size = total.div_ceil(count as u64);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for _ in 0..count {
        let end = (start + chunk_size - 1).min(total - 1);
        ranges.push((start, end));
        start = end + 1;
        if start >= total {
            break;
        }
    }
    ranges
}

/// Interval gate shared across chunk tasks so aggregated progress is
/// published at most once per window regardless of task count.
struct ProgressGate {
    last: Mutex<Instant>,
    interval: Duration,
}

impl ProgressGate {
    fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            interval,
        }
    }

    fn open(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// How one chunk task ended without a hard error.
enum ChunkRun {
    Completed,
    /// Pause/cancel/abort observed; the task checkpointed and stopped
    Interrupted,
}

type SharedMerge = Arc<tokio::sync::Mutex<crate::core::assembler::MergeSession>>;

pub struct ChunkedDownloader;

impl ChunkedDownloader {
    /// HEAD with `Range: bytes=0-0`: 206, or 200 with `Accept-Ranges:
    /// bytes`, means the server can serve ranged GETs.
    pub async fn probe_range_support(
        deps: &TransferDeps,
        url: &str,
        host: &str,
    ) -> Result<bool, EngineError> {
        deps.breaker.check(host)?;
        let response = deps
            .metadata_client
            .head(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await;
        match response {
            Ok(r) => {
                deps.breaker.record_success(host);
                Ok(headers::supports_ranges(r.status(), r.headers()))
            }
            Err(e) => {
                deps.breaker.record_failure(host);
                Err(e.into())
            }
        }
    }

    pub async fn run(
        deps: Arc<TransferDeps>,
        download: &Download,
        control: Arc<DownloadControl>,
    ) -> Result<TransferOutcome, EngineError> {
        let cfg = deps.config_snapshot();
        let id = download.id;
        let url = download
            .url
            .clone()
            .ok_or_else(|| EngineError::Logic(format!("download {id} has no url")))?;
        let host = download
            .host()
            .ok_or_else(|| EngineError::Logic(format!("unparsable url {url}")))?;
        let target = download
            .save_path
            .clone()
            .ok_or_else(|| EngineError::Logic(format!("download {id} has no save path")))?;
        let total = download.total_bytes;
        if total == 0 {
            return Err(EngineError::Logic(format!(
                "chunked transfer of {id} requires a known size"
            )));
        }

        deps.chunk_store.create_chunk_dir(id)?;
        let chunks = Self::prepare_chunks(&deps, id, total, &cfg).await?;

        let preloaded: u64 = chunks
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.size())
            .sum();
        control
            .downloaded_bytes
            .store(preloaded, std::sync::atomic::Ordering::SeqCst);
        deps.speed.ensure_tracking(id, preloaded);

        deps.store
            .transition_state(id, DownloadState::Downloading, Some(DownloadState::Starting))?;

        let staging = deps.chunk_store.staging_path(id, &target);
        let merge: SharedMerge = Arc::new(tokio::sync::Mutex::new(
            deps.assembler
                .start_incremental_merge(id, &staging, &target, total, chunks.len() as u32)
                .await?,
        ));

        // replay chunks completed in an earlier session
        {
            let mut session = merge.lock().await;
            for chunk in chunks.iter().filter(|c| c.is_complete()) {
                session
                    .append_chunk(chunk.index, &chunk.temp_path, chunk.size())
                    .await?;
            }
        }

        let gates = Arc::new((
            ProgressGate::new(Duration::from_millis(cfg.downloads.progress_update_interval_ms)),
            ProgressGate::new(Duration::from_millis(cfg.downloads.persist_interval_ms)),
        ));

        let mut tasks: JoinSet<Result<ChunkRun, EngineError>> = JoinSet::new();
        'spawn: for chunk in chunks.iter().filter(|c| !c.is_complete()).cloned() {
            loop {
                if control.signal() != SIGNAL_RUN {
                    break 'spawn;
                }
                if deps.semaphores.acquire_chunk_slot(id) {
                    break;
                }
                tokio::time::sleep(SLOT_POLL_INTERVAL).await;
            }
            let task_deps = deps.clone();
            let task_control = control.clone();
            let task_cfg = cfg.clone();
            let task_url = url.clone();
            let task_host = host.clone();
            let task_merge = merge.clone();
            let task_gates = gates.clone();
            tasks.spawn(async move {
                let result = Self::run_chunk(
                    &task_deps,
                    &task_control,
                    &task_cfg,
                    &task_url,
                    &task_host,
                    chunk,
                    task_merge,
                    task_gates,
                    total,
                )
                .await;
                task_deps.semaphores.release_chunk_slot(id);
                result
            });
        }

        let mut first_error: Option<EngineError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(EngineError::Logic(format!("chunk task panicked: {e}"))));
            if let Err(e) = result {
                if first_error.is_none() {
                    // stop the siblings, then keep draining
                    if control.signal() == SIGNAL_RUN {
                        control.raise(SIGNAL_ABORT);
                    }
                    first_error = Some(e);
                }
            }
        }

        match control.signal() {
            SIGNAL_PAUSE => {
                Self::mark_unfinished_chunks(&deps, id, ChunkState::Paused)?;
                return Ok(TransferOutcome::Paused);
            }
            SIGNAL_RUN | SIGNAL_ABORT => {}
            _ => return Ok(TransferOutcome::Cancelled),
        }
        if let Some(e) = first_error {
            Self::mark_unfinished_chunks(&deps, id, ChunkState::Failed)?;
            return Err(e);
        }

        Self::finish(&deps, download, &cfg, &target, merge, total).await
    }

    /// Load chunk rows, creating or re-creating them when the stored plan
    /// does not cover the file, then reconcile against the filesystem.
    async fn prepare_chunks(
        deps: &TransferDeps,
        id: i64,
        total: u64,
        cfg: &EngineConfig,
    ) -> Result<Vec<Chunk>, EngineError> {
        let mut chunks = deps.store.get_chunks(id)?;
        let covers_file = !chunks.is_empty()
            && chunks.iter().map(Chunk::size).sum::<u64>() == total;
        if !covers_file {
            let specs: Vec<ChunkSpec> = plan_chunks(total, &cfg.chunked)
                .into_iter()
                .enumerate()
                .map(|(index, (start_byte, end_byte))| ChunkSpec {
                    start_byte,
                    end_byte,
                    temp_path: deps.chunk_store.chunk_path(id, index as u32),
                })
                .collect();
            chunks = deps.store.create_chunks(id, &specs)?;
            info!(id, chunks = chunks.len(), total, "chunk plan created");
        }

        let recon = deps.chunk_store.reconcile_chunks(id, &chunks);
        for orphan in &recon.orphaned {
            let _ = std::fs::remove_file(orphan);
        }
        for index in &recon.missing {
            deps.store.update_chunk_progress(
                id,
                *index,
                &ChunkUpdate {
                    state: Some(ChunkState::Pending),
                    downloaded_bytes: Some(0),
                    ..Default::default()
                },
            )?;
        }
        for index in &recon.mismatched {
            deps.chunk_store.delete_chunk(id, *index)?;
            deps.store.update_chunk_progress(
                id,
                *index,
                &ChunkUpdate {
                    state: Some(ChunkState::Failed),
                    downloaded_bytes: Some(0),
                    ..Default::default()
                },
            )?;
        }
        if !recon.missing.is_empty() || !recon.mismatched.is_empty() {
            chunks = deps.store.get_chunks(id)?;
        }
        Ok(chunks)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_chunk(
        deps: &TransferDeps,
        control: &Arc<DownloadControl>,
        cfg: &EngineConfig,
        url: &str,
        host: &str,
        chunk: Chunk,
        merge: SharedMerge,
        gates: Arc<(ProgressGate, ProgressGate)>,
        total_bytes: u64,
    ) -> Result<ChunkRun, EngineError> {
        let id = chunk.download_id;
        let operation_timeout =
            Duration::from_secs(cfg.chunked.chunk_operation_timeout_minutes * 60);
        let mut attempt_number = chunk.retry_count;
        let mut last_error: Option<EngineError> = None;

        while attempt_number < cfg.chunked.max_chunk_retries {
            if control.signal() != SIGNAL_RUN {
                Self::checkpoint_chunk(deps, &chunk).await;
                return Ok(ChunkRun::Interrupted);
            }
            attempt_number += 1;

            let started = Instant::now();
            let attempt = tokio::time::timeout(
                operation_timeout,
                Self::chunk_attempt(deps, control, cfg, url, host, &chunk, &gates, total_bytes),
            )
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::TransientNetwork {
                    kind: TransientKind::Timeout,
                    message: format!("chunk {} operation timed out", chunk.index),
                    retry_after: None,
                })
            });

            match attempt {
                Ok(ChunkRun::Interrupted) => {
                    Self::checkpoint_chunk(deps, &chunk).await;
                    return Ok(ChunkRun::Interrupted);
                }
                Ok(ChunkRun::Completed) => {
                    let size = chunk.size();
                    deps.store.update_chunk_progress(
                        id,
                        chunk.index,
                        &ChunkUpdate {
                            state: Some(ChunkState::Completed),
                            downloaded_bytes: Some(size),
                            tail_hash: Some(None),
                            tail_size: Some(0),
                            ..Default::default()
                        },
                    )?;
                    deps.events.emit_chunk_completed(id, chunk.index);

                    let mut session = merge.lock().await;
                    let outcome = session
                        .append_chunk(chunk.index, &chunk.temp_path, size)
                        .await?;
                    if outcome.complete {
                        drop(session);
                        // every range is on disk; the parent moves to merging
                        deps.store.transition_state(
                            id,
                            DownloadState::Merging,
                            Some(DownloadState::Downloading),
                        )?;
                        deps.events.emit_merge_started(id);
                    }
                    return Ok(ChunkRun::Completed);
                }
                Err(e) => {
                    let elapsed = started.elapsed();
                    warn!(
                        id,
                        chunk = chunk.index,
                        attempt = attempt_number,
                        error = %e,
                        "chunk attempt failed"
                    );
                    deps.store.record_attempt(&Attempt {
                        download_id: id,
                        chunk_index: Some(chunk.index),
                        attempt_number,
                        timestamp: Utc::now(),
                        error: Some(e.to_string()),
                        error_code: Some(e.error_code().to_string()),
                        bytes_transferred: deps
                            .chunk_store
                            .get_chunk_size(id, chunk.index)
                            .unwrap_or(0),
                        duration_ms: elapsed.as_millis() as u64,
                        speed_bps: 0.0,
                    })?;
                    deps.store.update_chunk_progress(
                        id,
                        chunk.index,
                        &ChunkUpdate {
                            retry_count: Some(attempt_number),
                            state: Some(ChunkState::Failed),
                            ..Default::default()
                        },
                    )?;

                    // integrity failures retry at chunk granularity (the
                    // damaged file was dropped); everything else that is
                    // not transient fails the whole download
                    let chunk_retryable =
                        e.is_transient() || matches!(e, EngineError::Integrity(_));
                    if !chunk_retryable {
                        deps.events.emit_chunk_failed(id, chunk.index, e.to_string());
                        return Err(e);
                    }
                    if e.is_transient() {
                        deps.metrics.record_transient_retry(Some(host));
                    }
                    last_error = Some(e);

                    if attempt_number < cfg.chunked.max_chunk_retries {
                        let backoff = Duration::from_millis(
                            cfg.network.retry_delay_ms << (attempt_number - 1).min(6),
                        )
                        .min(MAX_CHUNK_BACKOFF);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            EngineError::Logic(format!("chunk {} retries exhausted", chunk.index))
        });
        deps.events
            .emit_chunk_failed(id, chunk.index, error.to_string());
        Err(error)
    }

    /// One ranged GET streaming into the chunk temp file, resuming from the
    /// bytes already on disk.
    #[allow(clippy::too_many_arguments)]
    async fn chunk_attempt(
        deps: &TransferDeps,
        control: &Arc<DownloadControl>,
        cfg: &EngineConfig,
        url: &str,
        host: &str,
        chunk: &Chunk,
        gates: &Arc<(ProgressGate, ProgressGate)>,
        total_bytes: u64,
    ) -> Result<ChunkRun, EngineError> {
        let id = chunk.download_id;
        let size = chunk.size();

        let mut existing = deps
            .chunk_store
            .get_chunk_size(id, chunk.index)
            .unwrap_or(0);
        if existing > size {
            // damaged beyond the range; start the chunk over
            deps.chunk_store.delete_chunk(id, chunk.index)?;
            existing = 0;
        }
        if existing == size {
            return match Verifier::verify_chunk(
                &chunk.temp_path,
                chunk.index,
                size,
                chunk.hash.as_deref(),
            ) {
                Ok(_) => Ok(ChunkRun::Completed),
                Err(e) => {
                    // damaged on disk; drop it so the retry starts clean
                    deps.chunk_store.delete_chunk(id, chunk.index)?;
                    Err(e)
                }
            };
        }

        deps.store.update_chunk_progress(
            id,
            chunk.index,
            &ChunkUpdate {
                state: Some(ChunkState::Downloading),
                ..Default::default()
            },
        )?;

        deps.breaker.check(host)?;
        let range_start = chunk.start_byte + existing;
        let mut request = deps
            .transfer_client
            .get(url)
            .header(ACCEPT, "*/*")
            .header(CONNECTION, "keep-alive")
            .header(RANGE, format!("bytes={range_start}-{}", chunk.end_byte));
        if let Some(origin) = headers::origin_of(url) {
            request = request.header(REFERER, origin);
        }

        let response = match request.send().await {
            Ok(r) => {
                deps.breaker.record_success(host);
                r
            }
            Err(e) => {
                deps.breaker.record_failure(host);
                return Err(e.into());
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let default = if status == StatusCode::TOO_MANY_REQUESTS {
                Duration::from_millis(cfg.network.retry_after_429_default_ms)
            } else {
                Duration::from_millis(cfg.network.retry_after_503_default_ms)
            };
            let delay = headers::parse_retry_after(response.headers(), default);
            return Err(EngineError::TransientNetwork {
                kind: TransientKind::RateLimit,
                message: format!("{} for chunk {}", status.as_u16(), chunk.index),
                retry_after: Some(delay),
            });
        }
        if status != StatusCode::PARTIAL_CONTENT {
            if !status.is_success() {
                deps.breaker.record_failure(host);
                return Err(EngineError::from_status(status.as_u16(), None));
            }
            // a 200 here would be the whole file; the range was ignored
            return Err(EngineError::TransientNetwork {
                kind: TransientKind::Network,
                message: format!("server ignored range for chunk {}", chunk.index),
                retry_after: None,
            });
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&chunk.temp_path)
            .await?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file);
        let mut stream = response.bytes_stream();

        let idle_timeout = Duration::from_millis(cfg.network.idle_timeout_ms);
        let mut watchdog =
            tokio::time::interval(Duration::from_millis(cfg.network.idle_check_interval_ms));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut written = existing;
        let mut last_data = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(bytes)) => {
                        if control.signal() != SIGNAL_RUN {
                            writer.flush().await?;
                            return Ok(ChunkRun::Interrupted);
                        }
                        writer.write_all(&bytes).await?;
                        written += bytes.len() as u64;
                        if written > size {
                            return Err(IntegrityError::ChunkSizeMismatch {
                                index: chunk.index,
                                expected: size,
                                actual: written,
                            }
                            .into());
                        }
                        let cumulative = control.add_bytes(bytes.len() as u64);
                        deps.metrics.record_bytes(id, bytes.len() as u64);
                        last_data = Instant::now();

                        if gates.0.open() {
                            Self::publish_progress(deps, id, control, cumulative, total_bytes);
                        }
                        if gates.1.open() {
                            Self::persist_progress(deps, id, control, chunk.index, written, cumulative, total_bytes);
                        }
                    }
                    Some(Err(e)) => {
                        deps.breaker.record_failure(host);
                        return Err(e.into());
                    }
                    None => break,
                },
                _ = watchdog.tick() => {
                    if control.signal() != SIGNAL_RUN {
                        writer.flush().await?;
                        return Ok(ChunkRun::Interrupted);
                    }
                    if last_data.elapsed() >= idle_timeout {
                        return Err(EngineError::TransientNetwork {
                            kind: TransientKind::Timeout,
                            message: format!("chunk {} stalled", chunk.index),
                            retry_after: None,
                        });
                    }
                }
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if written < size {
            // early EOF; the partial stays on disk for the next attempt
            return Err(EngineError::TransientNetwork {
                kind: TransientKind::Network,
                message: format!(
                    "chunk {} closed early at {written}/{size} bytes",
                    chunk.index
                ),
                retry_after: None,
            });
        }
        if let Err(e) =
            Verifier::verify_chunk(&chunk.temp_path, chunk.index, size, chunk.hash.as_deref())
        {
            deps.chunk_store.delete_chunk(id, chunk.index)?;
            return Err(e);
        }
        debug!(id, chunk = chunk.index, bytes = size, "chunk complete");
        Ok(ChunkRun::Completed)
    }

    fn publish_progress(
        deps: &TransferDeps,
        id: i64,
        control: &Arc<DownloadControl>,
        cumulative: u64,
        total_bytes: u64,
    ) {
        if !deps.sessions.is_current(id, Some(control.token)) {
            return;
        }
        let sample = deps.speed.update(id, cumulative, total_bytes);
        let progress = cumulative as f64 / total_bytes as f64;
        deps.events.emit_download_progress(
            id,
            cumulative,
            total_bytes,
            progress,
            sample.speed_bps,
            sample.eta_seconds,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_progress(
        deps: &TransferDeps,
        id: i64,
        control: &Arc<DownloadControl>,
        chunk_index: u32,
        chunk_written: u64,
        cumulative: u64,
        total_bytes: u64,
    ) {
        if !deps.sessions.is_current(id, Some(control.token)) {
            return;
        }
        let _ = deps.store.update_chunk_progress(
            id,
            chunk_index,
            &ChunkUpdate {
                downloaded_bytes: Some(chunk_written),
                ..Default::default()
            },
        );
        let _ = deps.store.update_download(
            id,
            &DownloadUpdate {
                downloaded_bytes: Some(cumulative),
                progress: Some(cumulative as f64 / total_bytes as f64),
                ..Default::default()
            },
        );
        deps.events.emit_state_changed(deps.store.get_state_version());
    }

    /// Hash the tail of the chunk temp file so a later resume can detect
    /// corruption, and persist the chunk's on-disk progress.
    async fn checkpoint_chunk(deps: &TransferDeps, chunk: &Chunk) {
        let id = chunk.download_id;
        let on_disk = deps
            .chunk_store
            .get_chunk_size(id, chunk.index)
            .unwrap_or(0);
        let mut update = ChunkUpdate {
            downloaded_bytes: Some(on_disk),
            ..Default::default()
        };
        if on_disk > 0 {
            let path = chunk.temp_path.clone();
            if let Ok(Ok((hash, window))) = tokio::task::spawn_blocking(move || {
                Verifier::hash_tail(&path, TAIL_CHECKPOINT_WINDOW)
            })
            .await
            {
                update.tail_hash = Some(Some(hash));
                update.tail_size = Some(window);
            }
        }
        let _ = deps.store.update_chunk_progress(id, chunk.index, &update);
    }

    /// Move every chunk still marked active into `state` (pause/fail paths).
    fn mark_unfinished_chunks(
        deps: &TransferDeps,
        id: i64,
        state: ChunkState,
    ) -> Result<(), EngineError> {
        for chunk in deps.store.get_chunks(id)? {
            if matches!(chunk.state, ChunkState::Downloading | ChunkState::Pending) {
                deps.store.update_chunk_progress(
                    id,
                    chunk.index,
                    &ChunkUpdate {
                        state: Some(state),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    /// All chunks are merged; finalize the staging file, verify and close
    /// out the download.
    async fn finish(
        deps: &TransferDeps,
        download: &Download,
        cfg: &EngineConfig,
        target: &Path,
        merge: SharedMerge,
        total: u64,
    ) -> Result<TransferOutcome, EngineError> {
        let id = download.id;
        let mut session = merge.lock().await;
        if !session.is_complete() {
            return Err(EngineError::Logic(format!(
                "download {id} drained with an incomplete merge"
            )));
        }

        // the last chunk task normally moves the row to merging; a resume
        // whose chunks were all replayed never ran one
        if deps
            .store
            .transition_state(id, DownloadState::Merging, Some(DownloadState::Downloading))?
        {
            deps.events.emit_merge_started(id);
        }

        // a pause that landed during the merge keeps the chunk files and
        // drops only the staging output
        let state_now = deps.store.get_download(id)?.map(|d| d.state);
        if state_now == Some(DownloadState::Paused) {
            session.abandon().await;
            return Ok(TransferOutcome::Paused);
        }

        session
            .finalize(download.force_overwrite || !tokio::fs::try_exists(target).await?)
            .await?;
        drop(session);

        if !deps
            .store
            .transition_state(id, DownloadState::Verifying, Some(DownloadState::Merging))?
        {
            // cancelled while merging: cleanup was deferred until the merge
            // worker finished, and happens here
            info!(id, "cancelled during merge, cleaning up");
            deps.store.delete_chunks(id)?;
            let _ = tokio::fs::remove_file(target).await;
            return Ok(TransferOutcome::Cancelled);
        }

        deps.store.delete_chunks(id)?;
        deps.store.update_download(
            id,
            &DownloadUpdate {
                downloaded_bytes: Some(total),
                progress: Some(1.0),
                ..Default::default()
            },
        )?;
        deps.events.emit_verification_started(id);

        if !cfg.skip_verification {
            let target_owned = target.to_path_buf();
            let expected_hash = download.expected_hash.clone();
            let verification = tokio::task::spawn_blocking(move || {
                Verifier::verify_file(&target_owned, total, expected_hash.as_deref(), None)
            })
            .await
            .map_err(|e| EngineError::Logic(format!("verify task panicked: {e}")))??;

            deps.store.update_download(
                id,
                &DownloadUpdate {
                    actual_hash: Some(verification.hash.clone()),
                    size_verified: Some(true),
                    hash_verified: Some(verification.hash_checked),
                    ..Default::default()
                },
            )?;
        }

        deps.store
            .transition_state(id, DownloadState::Completed, Some(DownloadState::Verifying))?;
        deps.store.update_download(
            id,
            &DownloadUpdate {
                completed_at: Some(Some(Utc::now())),
                ..Default::default()
            },
        )?;
        deps.events
            .emit_download_completed(id, target.to_string_lossy().to_string());
        deps.events.emit_state_changed(deps.store.get_state_version());
        deps.metrics.record_completed(id, Some(total));
        info!(id, bytes = total, path = %target.display(), "chunked download completed");

        Ok(TransferOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkedConfig;

    fn ranges_are_contiguous(ranges: &[(u64, u64)], total: u64) {
        assert_eq!(ranges[0].0, 0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1);
        }
        assert_eq!(ranges.last().unwrap().1, total - 1);
        let sum: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn test_medium_band_counts() {
        let cfg = ChunkedConfig::default();
        // 60 MiB at an 8 MiB target wants 8 chunks, inside 4..=8
        let total = 60 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        assert_eq!(ranges.len(), 8);
        ranges_are_contiguous(&ranges, total);

        // tiny file clamps up to the band minimum
        let total = 10 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        assert_eq!(ranges.len(), 4);
        ranges_are_contiguous(&ranges, total);
    }

    #[test]
    fn test_large_band_counts() {
        let cfg = ChunkedConfig::default();
        // 1 GiB at a 32 MiB base wants 32, clamped to 16
        let total = 1024 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        assert_eq!(ranges.len(), 16);
        ranges_are_contiguous(&ranges, total);

        // 600 MiB wants 19, clamped to 16
        let total = 600 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        assert_eq!(ranges.len(), 16);
        ranges_are_contiguous(&ranges, total);
    }

    #[test]
    fn test_max_chunks_clamp() {
        let cfg = ChunkedConfig {
            max_chunks: 4,
            ..ChunkedConfig::default()
        };
        let total = 2 * 1024 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        assert_eq!(ranges.len(), 4);
        ranges_are_contiguous(&ranges, total);
    }

    #[test]
    fn test_range_table_strategy() {
        let cfg = ChunkedConfig {
            use_band_strategy: false,
            range_table: vec![(100 * 1024 * 1024, 10 * 1024 * 1024), (u64::MAX, 50 * 1024 * 1024)],
            ..ChunkedConfig::default()
        };
        let total = 95 * 1024 * 1024;
        let ranges = plan_chunks(total, &cfg);
        // ceil(95/10) = 10 chunks
        assert_eq!(ranges.len(), 10);
        ranges_are_contiguous(&ranges, total);
    }

    #[test]
    fn test_last_chunk_absorbs_remainder() {
        let cfg = ChunkedConfig::default();
        let total = 10_000;
        let ranges = plan_chunks(total, &cfg);
        ranges_are_contiguous(&ranges, total);
        // ranges never overlap even with an uneven tail
        let (last_start, last_end) = *ranges.last().unwrap();
        assert!(last_start <= last_end);
    }

    #[test]
    fn test_file_smaller_than_chunk_count() {
        let cfg = ChunkedConfig::default();
        let ranges = plan_chunks(3, &cfg);
        ranges_are_contiguous(&ranges, 3);
        assert!(ranges.len() <= 3);
    }

    #[test]
    fn test_spec_scenario_two_ranges() {
        // 10_000 bytes split as [(0,4999),(5000,9999)]
        let cfg = ChunkedConfig {
            use_band_strategy: false,
            range_table: vec![(u64::MAX, 5_000)],
            ..ChunkedConfig::default()
        };
        let ranges = plan_chunks(10_000, &cfg);
        assert_eq!(ranges, vec![(0, 4999), (5000, 9999)]);
    }
}
