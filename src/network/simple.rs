use crate::core::control::{DownloadControl, SIGNAL_PAUSE, SIGNAL_RUN};
use crate::core::error::{EngineError, IntegrityError, TransientKind};
use crate::core::integrity::Verifier;
use crate::core::state::{Download, DownloadState, DownloadUpdate};
use crate::network::{headers, TransferDeps, TransferOutcome};
use crate::utils::filesystem;
/// Single-stream downloader
///
/// Used for files below the chunked threshold and for servers without range
/// support. Streams the body into a `.part` file next to the target,
/// resumes from its size (optionally validated against the stored tail
/// checkpoint), and renames into place on completion. An idle watchdog
/// races the body stream so a hung read cannot wedge the task.
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONNECTION, RANGE, REFERER};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Bytes hashed for the pause/resume tail checkpoint.
pub const TAIL_CHECKPOINT_WINDOW: u64 = 256 * 1024;

const WRITE_BUFFER_CAPACITY: usize = 128 * 1024;

/// `.part` sibling of the final target.
pub fn part_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    name.push_str(".part");
    target.with_file_name(name)
}

/// How one transfer attempt ended.
enum AttemptEnd {
    Done(TransferOutcome),
    Failed(EngineError),
    /// 416: the stored prefix no longer matches the resource
    RangeRejected,
}

pub struct SimpleDownloader;

impl SimpleDownloader {
    pub async fn run(
        deps: &TransferDeps,
        download: &Download,
        control: Arc<DownloadControl>,
    ) -> Result<TransferOutcome, EngineError> {
        let url = download
            .url
            .clone()
            .ok_or_else(|| EngineError::Logic(format!("download {} has no url", download.id)))?;
        let host = download
            .host()
            .ok_or_else(|| EngineError::Logic(format!("unparsable url {url}")))?;
        let target = download.save_path.clone().ok_or_else(|| {
            EngineError::Logic(format!("download {} has no save path", download.id))
        })?;
        let part = part_path_for(&target);

        let mut resume_from = Self::resume_point(download, &part).await?;
        loop {
            match Self::transfer(deps, download, &control, &url, &host, &target, &part, resume_from)
                .await
            {
                AttemptEnd::Done(outcome) => return Ok(outcome),
                AttemptEnd::Failed(e) => return Err(e),
                AttemptEnd::RangeRejected => {
                    warn!(id = download.id, "resume range rejected, restarting from zero");
                    let _ = tokio::fs::remove_file(&part).await;
                    resume_from = 0;
                }
            }
        }
    }

    /// Seed the resume offset from the `.part` file, discarding it when the
    /// tail checkpoint no longer matches.
    async fn resume_point(download: &Download, part: &Path) -> Result<u64, EngineError> {
        let Ok(meta) = tokio::fs::metadata(part).await else {
            return Ok(0);
        };
        let on_disk = meta.len();
        if on_disk == 0 {
            return Ok(0);
        }
        if download.total_bytes > 0 && on_disk > download.total_bytes {
            warn!(id = download.id, on_disk, "partial larger than total, discarding");
            tokio::fs::remove_file(part).await?;
            return Ok(0);
        }

        if let Some(expected_tail) = download.partial_tail_hash.as_deref() {
            let window = download.partial_tail_size;
            if window > 0 && window <= on_disk {
                let part_owned = part.to_path_buf();
                let (actual, _) =
                    tokio::task::spawn_blocking(move || Verifier::hash_tail(&part_owned, window))
                        .await
                        .map_err(|e| EngineError::Logic(format!("hash task panicked: {e}")))??;
                if actual != expected_tail {
                    warn!(id = download.id, "tail checkpoint mismatch, discarding partial");
                    tokio::fs::remove_file(part).await?;
                    return Ok(0);
                }
            }
        }
        debug!(id = download.id, resume_from = on_disk, "resuming from partial");
        Ok(on_disk)
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        deps: &TransferDeps,
        download: &Download,
        control: &Arc<DownloadControl>,
        url: &str,
        host: &str,
        target: &Path,
        part: &Path,
        mut resume_from: u64,
    ) -> AttemptEnd {
        let cfg = deps.config_snapshot();
        let id = download.id;

        if download.total_bytes > 0 {
            if let Err(e) = filesystem::validate_disk_space(
                part,
                download.total_bytes.saturating_sub(resume_from),
            ) {
                return AttemptEnd::Failed(e);
            }
        }

        if let Err(e) = deps.breaker.check(host) {
            return AttemptEnd::Failed(e);
        }

        let mut request = deps
            .transfer_client
            .get(url)
            .header(ACCEPT, "*/*")
            .header(CONNECTION, "keep-alive");
        if let Some(origin) = headers::origin_of(url) {
            request = request.header(REFERER, origin);
        }
        if resume_from > 0 {
            request = request.header(RANGE, format!("bytes={resume_from}-"));
        }

        let response = match request.send().await {
            Ok(r) => {
                deps.breaker.record_success(host);
                r
            }
            Err(e) => {
                deps.breaker.record_failure(host);
                return AttemptEnd::Failed(e.into());
            }
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return AttemptEnd::RangeRejected;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let default = if status == StatusCode::TOO_MANY_REQUESTS {
                Duration::from_millis(cfg.network.retry_after_429_default_ms)
            } else {
                Duration::from_millis(cfg.network.retry_after_503_default_ms)
            };
            let delay = headers::parse_retry_after(response.headers(), default);
            Self::save_tail_checkpoint(deps, id, part).await;
            info!(id, status = status.as_u16(), delay_secs = delay.as_secs(), "rate limited");
            return AttemptEnd::Done(TransferOutcome::RetryAfter(delay));
        }
        if !status.is_success() {
            deps.breaker.record_failure(host);
            return AttemptEnd::Failed(EngineError::from_status(status.as_u16(), None));
        }
        if resume_from > 0 && status != StatusCode::PARTIAL_CONTENT {
            // server ignored the range and is sending the full body
            debug!(id, "server ignored resume range, restarting");
            if let Err(e) = tokio::fs::remove_file(part).await {
                return AttemptEnd::Failed(e.into());
            }
            resume_from = 0;
        }

        // when the total was unknown up front, the response may reveal it
        let mut total_bytes = download.total_bytes;
        if total_bytes == 0 && status != StatusCode::PARTIAL_CONTENT {
            if let Some(len) = response.content_length() {
                if len > 0 {
                    total_bytes = len;
                    let _ = deps.store.update_download(
                        id,
                        &DownloadUpdate {
                            total_bytes: Some(len),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        control
            .downloaded_bytes
            .store(resume_from, Ordering::SeqCst);
        deps.speed.ensure_tracking(id, resume_from);

        if let Err(e) =
            deps.store
                .transition_state(id, DownloadState::Downloading, Some(DownloadState::Starting))
        {
            return AttemptEnd::Failed(e);
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(part)
            .await
        {
            Ok(f) => f,
            Err(e) => return AttemptEnd::Failed(e.into()),
        };
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file);

        match Self::stream_body(deps, id, control, response, &mut writer, &cfg, total_bytes, host)
            .await
        {
            StreamEnd::Finished => {}
            StreamEnd::Paused => {
                let _ = writer.flush().await;
                Self::save_tail_checkpoint(deps, id, part).await;
                return AttemptEnd::Done(TransferOutcome::Paused);
            }
            StreamEnd::Cancelled => {
                let _ = writer.flush().await;
                return AttemptEnd::Done(TransferOutcome::Cancelled);
            }
            StreamEnd::Failed(e) => {
                // keep the partial for a future resume, checkpoint included
                let _ = writer.flush().await;
                Self::save_tail_checkpoint(deps, id, part).await;
                return AttemptEnd::Failed(e);
            }
        }

        if let Err(e) = writer.flush().await {
            return AttemptEnd::Failed(e.into());
        }
        if let Err(e) = writer.into_inner().sync_all().await {
            return AttemptEnd::Failed(e.into());
        }

        match Self::complete(deps, download, &cfg, target, part, total_bytes).await {
            Ok(outcome) => AttemptEnd::Done(outcome),
            Err(e) => AttemptEnd::Failed(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        deps: &TransferDeps,
        id: i64,
        control: &Arc<DownloadControl>,
        response: reqwest::Response,
        writer: &mut BufWriter<tokio::fs::File>,
        cfg: &crate::config::EngineConfig,
        total_bytes: u64,
        host: &str,
    ) -> StreamEnd {
        let mut stream = response.bytes_stream();

        let idle_timeout = Duration::from_millis(cfg.network.idle_timeout_ms);
        let mut watchdog =
            tokio::time::interval(Duration::from_millis(cfg.network.idle_check_interval_ms));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let progress_interval = Duration::from_millis(cfg.downloads.progress_update_interval_ms);
        let persist_interval = Duration::from_millis(cfg.downloads.persist_interval_ms);

        let mut last_progress_data = Instant::now();
        let mut last_progress_event = Instant::now();
        let mut last_persist = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(bytes)) => {
                        match control.signal() {
                            SIGNAL_RUN => {}
                            SIGNAL_PAUSE => return StreamEnd::Paused,
                            _ => return StreamEnd::Cancelled,
                        }
                        if let Err(e) = writer.write_all(&bytes).await {
                            return StreamEnd::Failed(e.into());
                        }
                        let cumulative = control.add_bytes(bytes.len() as u64);
                        deps.metrics.record_bytes(id, bytes.len() as u64);
                        last_progress_data = Instant::now();

                        if last_progress_event.elapsed() >= progress_interval {
                            last_progress_event = Instant::now();
                            Self::publish_progress(deps, id, control, cumulative, total_bytes);
                        }
                        if last_persist.elapsed() >= persist_interval {
                            last_persist = Instant::now();
                            Self::persist_progress(deps, id, control, cumulative, total_bytes);
                        }
                    }
                    Some(Err(e)) => {
                        deps.breaker.record_failure(host);
                        return StreamEnd::Failed(e.into());
                    }
                    None => return StreamEnd::Finished,
                },
                _ = watchdog.tick() => {
                    match control.signal() {
                        SIGNAL_RUN => {}
                        SIGNAL_PAUSE => return StreamEnd::Paused,
                        _ => return StreamEnd::Cancelled,
                    }
                    if last_progress_data.elapsed() >= idle_timeout {
                        return StreamEnd::Failed(EngineError::TransientNetwork {
                            kind: TransientKind::Timeout,
                            message: format!(
                                "no data for {}s (idle watchdog)",
                                idle_timeout.as_secs()
                            ),
                            retry_after: None,
                        });
                    }
                }
            }
        }
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
        let progress = if total_bytes > 0 {
            cumulative as f64 / total_bytes as f64
        } else {
            0.0
        };
        deps.events.emit_download_progress(
            id,
            cumulative,
            total_bytes,
            progress,
            sample.speed_bps,
            sample.eta_seconds,
        );
    }

    fn persist_progress(
        deps: &TransferDeps,
        id: i64,
        control: &Arc<DownloadControl>,
        cumulative: u64,
        total_bytes: u64,
    ) {
        if !deps.sessions.is_current(id, Some(control.token)) {
            return;
        }
        let progress = if total_bytes > 0 {
            cumulative as f64 / total_bytes as f64
        } else {
            0.0
        };
        let _ = deps.store.update_download(
            id,
            &DownloadUpdate {
                downloaded_bytes: Some(cumulative),
                progress: Some(progress),
                ..Default::default()
            },
        );
        deps.events.emit_state_changed(deps.store.get_state_version());
    }

    /// Persist a hash of the partial's tail so the next resume can detect a
    /// file that changed underneath us.
    async fn save_tail_checkpoint(deps: &TransferDeps, id: i64, part: &Path) {
        let part_owned = part.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            Verifier::hash_tail(&part_owned, TAIL_CHECKPOINT_WINDOW)
        })
        .await;
        let Ok(Ok((hash, window))) = result else {
            return;
        };
        let cumulative = tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0);
        let _ = deps.store.update_download(
            id,
            &DownloadUpdate {
                downloaded_bytes: Some(cumulative),
                partial_tail_hash: Some(Some(hash)),
                partial_tail_size: Some(window),
                ..Default::default()
            },
        );
    }

    async fn complete(
        deps: &TransferDeps,
        download: &Download,
        cfg: &crate::config::EngineConfig,
        target: &Path,
        part: &Path,
        total_bytes: u64,
    ) -> Result<TransferOutcome, EngineError> {
        let id = download.id;
        let actual = tokio::fs::metadata(part).await?.len();
        if total_bytes > 0 && actual != total_bytes {
            Self::save_tail_checkpoint(deps, id, part).await;
            return Err(IntegrityError::SizeMismatch {
                expected: total_bytes,
                actual,
            }
            .into());
        }
        let final_size = if total_bytes > 0 { total_bytes } else { actual };

        if tokio::fs::try_exists(target).await? {
            tokio::fs::remove_file(target).await?;
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(part, target).await?;

        deps.store.update_download(
            id,
            &DownloadUpdate {
                downloaded_bytes: Some(final_size),
                total_bytes: Some(final_size),
                progress: Some(1.0),
                partial_tail_hash: Some(None),
                partial_tail_size: Some(0),
                ..Default::default()
            },
        )?;

        deps.store
            .transition_state(id, DownloadState::Verifying, Some(DownloadState::Downloading))?;
        deps.events.emit_verification_started(id);

        if !cfg.skip_verification {
            let target_owned = target.to_path_buf();
            let expected_hash = download.expected_hash.clone();
            let verification = tokio::task::spawn_blocking(move || {
                Verifier::verify_file(&target_owned, final_size, expected_hash.as_deref(), None)
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
                completed_at: Some(Some(chrono::Utc::now())),
                ..Default::default()
            },
        )?;
        deps.events
            .emit_download_completed(id, target.to_string_lossy().to_string());
        deps.events.emit_state_changed(deps.store.get_state_version());
        deps.metrics.record_completed(id, Some(final_size));
        info!(id, bytes = final_size, path = %target.display(), "download completed");

        Ok(TransferOutcome::Completed)
    }
}

/// How the body stream ended.
enum StreamEnd {
    Finished,
    Paused,
    Cancelled,
    Failed(EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_sits_next_to_target() {
        assert_eq!(
            part_path_for(Path::new("/downloads/game.zip")),
            PathBuf::from("/downloads/game.zip.part")
        );
        assert_eq!(
            part_path_for(Path::new("/downloads/sub/data")),
            PathBuf::from("/downloads/sub/data.part")
        );
    }
}
