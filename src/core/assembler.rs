use crate::config::BufferPoolConfig;
use crate::core::error::{EngineError, IntegrityError};
use crate::utils::filesystem;
/// Concatenates chunk files into the final file atomically
///
/// Two modes: batch (all chunks present up front) and an incremental merge
/// session fed by the chunked downloader as chunks complete. Both write to a
/// staging file in the chunk directory and rename onto the final path, so
/// the visible file is either absent or complete.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Disk headroom required before assembly: 110% of the expected size.
const DISK_HEADROOM_NUM: u64 = 11;
const DISK_HEADROOM_DEN: u64 = 10;

/// Process-wide pool of fixed-size copy buffers. Acquire allocates up to
/// the pooled cap; release returns the buffer or frees it when full.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(cfg: &BufferPoolConfig) -> Self {
        let mut buffers = Vec::new();
        if cfg.pre_allocate {
            for _ in 0..cfg.max_pooled {
                buffers.push(vec![0u8; cfg.buffer_size]);
            }
        }
        Self {
            buffers: Mutex::new(buffers),
            buffer_size: cfg.buffer_size,
            max_pooled: cfg.max_pooled,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn acquire(&self) -> Vec<u8> {
        let mut pooled = self.buffers.lock().unwrap();
        pooled
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    pub fn release(&self, buffer: Vec<u8>) {
        let mut pooled = self.buffers.lock().unwrap();
        if pooled.len() < self.max_pooled {
            pooled.push(buffer);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// Copy one source file onto the end of `staging` with double buffering:
/// the next block is read while the previous one is written.
async fn append_file(
    staging: &mut File,
    source: &Path,
    pool: &BufferPool,
) -> Result<u64, EngineError> {
    let mut src = File::open(source).await?;
    let mut front = pool.acquire();
    let mut back = pool.acquire();
    front.resize(pool.buffer_size(), 0);
    back.resize(pool.buffer_size(), 0);

    let mut total = 0u64;
    let mut filled = src.read(&mut front).await?;
    while filled > 0 {
        let (write_res, read_res) =
            tokio::join!(staging.write_all(&front[..filled]), src.read(&mut back));
        write_res?;
        total += filled as u64;
        filled = read_res?;
        std::mem::swap(&mut front, &mut back);
    }

    pool.release(front);
    pool.release(back);
    Ok(total)
}

async fn rename_onto(
    staging: &Path,
    final_path: &Path,
    force_overwrite: bool,
) -> Result<(), EngineError> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if force_overwrite && tokio::fs::try_exists(final_path).await? {
        tokio::fs::remove_file(final_path).await?;
    }
    tokio::fs::rename(staging, final_path).await?;
    Ok(())
}

async fn check_staging_size(staging: &Path, expected: u64) -> Result<(), EngineError> {
    let actual = tokio::fs::metadata(staging).await?.len();
    if actual != expected {
        return Err(IntegrityError::SizeMismatch {
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

/// Result of feeding one chunk into an incremental merge session.
#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Indices written to staging by this call (in order)
    pub appended: Vec<u32>,
    /// True when every chunk of the session has been written
    pub complete: bool,
}

/// Incremental merge session: chunks arrive in any order, the staging file
/// is written in strict index order. Out-of-order arrivals are buffered as
/// paths, not bytes.
pub struct MergeSession {
    download_id: i64,
    final_path: PathBuf,
    staging_path: PathBuf,
    expected_size: u64,
    chunk_count: u32,
    staging: Option<File>,
    next_expected: u32,
    appended_count: u32,
    pending: BTreeMap<u32, (PathBuf, u64)>,
    written_paths: Vec<PathBuf>,
    finalized: bool,
    pool: Arc<BufferPool>,
}

impl MergeSession {
    pub fn download_id(&self) -> i64 {
        self.download_id
    }

    pub fn is_complete(&self) -> bool {
        self.appended_count == self.chunk_count
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Feed one completed chunk. Appends immediately when `index` is the
    /// next expected, then drains any buffered successors; otherwise the
    /// arrival is parked. After `finalize` this is a no-op reporting
    /// `complete = false`.
    pub async fn append_chunk(
        &mut self,
        index: u32,
        chunk_path: &Path,
        chunk_size: u64,
    ) -> Result<AppendOutcome, EngineError> {
        if self.finalized {
            return Ok(AppendOutcome::default());
        }
        let mut outcome = AppendOutcome::default();

        if index != self.next_expected {
            self.pending
                .insert(index, (chunk_path.to_path_buf(), chunk_size));
            outcome.complete = self.is_complete();
            return Ok(outcome);
        }

        self.write_chunk(index, chunk_path, chunk_size).await?;
        outcome.appended.push(index);

        while let Some((path, size)) = self.pending.remove(&self.next_expected) {
            let drained = self.next_expected;
            self.write_chunk(drained, &path, size).await?;
            outcome.appended.push(drained);
        }

        outcome.complete = self.is_complete();
        Ok(outcome)
    }

    async fn write_chunk(
        &mut self,
        index: u32,
        path: &Path,
        expected: u64,
    ) -> Result<(), EngineError> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| EngineError::Logic("merge staging file not open".into()))?;
        let written = append_file(staging, path, &self.pool).await?;
        if written != expected {
            return Err(IntegrityError::ChunkSizeMismatch {
                index,
                expected,
                actual: written,
            }
            .into());
        }
        self.next_expected = index + 1;
        self.appended_count += 1;
        self.written_paths.push(path.to_path_buf());
        debug!(
            download_id = self.download_id,
            chunk = index,
            bytes = written,
            "chunk merged into staging"
        );
        Ok(())
    }

    /// Close staging, validate its size, rename onto the final path and
    /// remove the consumed chunk files. Idempotent after the first call.
    pub async fn finalize(&mut self, force_overwrite: bool) -> Result<(), EngineError> {
        if self.finalized {
            return Ok(());
        }
        if !self.is_complete() {
            return Err(EngineError::Logic(format!(
                "merge finalize with {}/{} chunks appended",
                self.appended_count, self.chunk_count
            )));
        }
        if let Some(mut staging) = self.staging.take() {
            staging.flush().await?;
            staging.sync_all().await?;
        }

        if let Err(e) = check_staging_size(&self.staging_path, self.expected_size).await {
            let _ = tokio::fs::remove_file(&self.staging_path).await;
            return Err(e);
        }
        if let Err(e) = rename_onto(&self.staging_path, &self.final_path, force_overwrite).await {
            let _ = tokio::fs::remove_file(&self.staging_path).await;
            return Err(e);
        }

        for path in &self.written_paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove merged chunk");
            }
        }
        if let Some(dir) = self.staging_path.parent() {
            // only succeeds once every chunk temp is gone
            let _ = tokio::fs::remove_dir(dir).await;
        }

        self.finalized = true;
        info!(
            download_id = self.download_id,
            path = %self.final_path.display(),
            bytes = self.expected_size,
            "incremental merge finalized"
        );
        Ok(())
    }

    /// Drop the staging file without finalizing (cancel path).
    pub async fn abandon(&mut self) {
        self.staging.take();
        let _ = tokio::fs::remove_file(&self.staging_path).await;
        self.finalized = true;
    }
}

pub struct FileAssembler {
    pool: Arc<BufferPool>,
}

impl FileAssembler {
    pub fn new(cfg: &BufferPoolConfig) -> Self {
        Self {
            pool: Arc::new(BufferPool::new(cfg)),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    /// Batch mode: all chunk files already on disk, concatenated in index
    /// order. `chunk_paths` must be ordered by index.
    pub async fn assemble(
        &self,
        download_id: i64,
        chunk_paths: &[PathBuf],
        staging_path: &Path,
        final_path: &Path,
        expected_size: u64,
        force_overwrite: bool,
    ) -> Result<(), EngineError> {
        filesystem::validate_disk_space(
            staging_path,
            expected_size.saturating_mul(DISK_HEADROOM_NUM) / DISK_HEADROOM_DEN,
        )?;

        let result = self
            .assemble_inner(chunk_paths, staging_path, final_path, expected_size, force_overwrite)
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(staging_path).await;
            return result;
        }

        for path in chunk_paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove assembled chunk");
            }
        }
        if let Some(dir) = staging_path.parent() {
            let _ = tokio::fs::remove_dir(dir).await;
        }
        info!(
            download_id,
            path = %final_path.display(),
            bytes = expected_size,
            "batch assembly complete"
        );
        Ok(())
    }

    async fn assemble_inner(
        &self,
        chunk_paths: &[PathBuf],
        staging_path: &Path,
        final_path: &Path,
        expected_size: u64,
        force_overwrite: bool,
    ) -> Result<(), EngineError> {
        let mut staging = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(staging_path)
            .await?;
        for path in chunk_paths {
            append_file(&mut staging, path, &self.pool).await?;
        }
        staging.flush().await?;
        staging.sync_all().await?;
        drop(staging);

        check_staging_size(staging_path, expected_size).await?;
        rename_onto(staging_path, final_path, force_overwrite).await
    }

    /// Open an incremental merge session writing to the staging path.
    pub async fn start_incremental_merge(
        &self,
        download_id: i64,
        staging_path: &Path,
        final_path: &Path,
        expected_size: u64,
        chunk_count: u32,
    ) -> Result<MergeSession, EngineError> {
        filesystem::validate_disk_space(
            staging_path,
            expected_size.saturating_mul(DISK_HEADROOM_NUM) / DISK_HEADROOM_DEN,
        )?;
        if let Some(parent) = staging_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(staging_path)
            .await?;
        Ok(MergeSession {
            download_id,
            final_path: final_path.to_path_buf(),
            staging_path: staging_path.to_path_buf(),
            expected_size,
            chunk_count,
            staging: Some(staging),
            next_expected: 0,
            appended_count: 0,
            pending: BTreeMap::new(),
            written_paths: Vec::new(),
            finalized: false,
            pool: self.pool.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn assembler() -> FileAssembler {
        FileAssembler::new(&BufferPoolConfig {
            buffer_size: 16,
            max_pooled: 2,
            pre_allocate: false,
        })
    }

    async fn write_chunk(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_batch_assembly_in_order() {
        let dir = tempdir().unwrap();
        let c0 = write_chunk(dir.path(), ".chunk.0", b"hello ").await;
        let c1 = write_chunk(dir.path(), ".chunk.1", b"world").await;
        let staging = dir.path().join("out.bin.staging");
        let final_path = dir.path().join("final").join("out.bin");

        assembler()
            .assemble(1, &[c0.clone(), c1.clone()], &staging, &final_path, 11, false)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!staging.exists());
        assert!(!c0.exists() && !c1.exists());
    }

    #[tokio::test]
    async fn test_batch_assembly_size_mismatch_cleans_staging() {
        let dir = tempdir().unwrap();
        let c0 = write_chunk(dir.path(), ".chunk.0", b"short").await;
        let staging = dir.path().join("out.bin.staging");
        let final_path = dir.path().join("out.bin");

        let err = assembler()
            .assemble(1, &[c0.clone()], &staging, &final_path, 999, false)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SIZE_MISMATCH");
        assert!(!staging.exists());
        assert!(!final_path.exists());
        // chunk files stay for a retry
        assert!(c0.exists());
    }

    #[tokio::test]
    async fn test_incremental_merge_out_of_order() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        tokio::fs::create_dir_all(&chunk_dir).await.unwrap();
        let c0 = write_chunk(&chunk_dir, ".chunk.0", &vec![b'a'; 5000]).await;
        let c1 = write_chunk(&chunk_dir, ".chunk.1", &vec![b'b'; 5000]).await;
        let staging = chunk_dir.join("out.bin.staging");
        let final_path = dir.path().join("out.bin");

        let mut session = assembler()
            .start_incremental_merge(1, &staging, &final_path, 10_000, 2)
            .await
            .unwrap();

        // index 1 completes first and is parked
        let outcome = session.append_chunk(1, &c1, 5000).await.unwrap();
        assert!(outcome.appended.is_empty());
        assert!(!outcome.complete);

        // index 0 lands, draining the parked chunk in order
        let outcome = session.append_chunk(0, &c0, 5000).await.unwrap();
        assert_eq!(outcome.appended, vec![0, 1]);
        assert!(outcome.complete);

        session.finalize(false).await.unwrap();
        let data = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(data.len(), 10_000);
        assert!(data[..5000].iter().all(|&b| b == b'a'));
        assert!(data[5000..].iter().all(|&b| b == b'b'));
        assert!(!c0.exists() && !c1.exists());
        assert!(!chunk_dir.exists());
    }

    #[tokio::test]
    async fn test_finalize_idempotent_and_append_after_finalize() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        tokio::fs::create_dir_all(&chunk_dir).await.unwrap();
        let c0 = write_chunk(&chunk_dir, ".chunk.0", b"data").await;
        let staging = chunk_dir.join("f.staging");
        let final_path = dir.path().join("f.bin");

        let mut session = assembler()
            .start_incremental_merge(1, &staging, &final_path, 4, 1)
            .await
            .unwrap();
        session.append_chunk(0, &c0, 4).await.unwrap();
        session.finalize(false).await.unwrap();
        session.finalize(false).await.unwrap();

        let late = session.append_chunk(0, &c0, 4).await.unwrap();
        assert!(late.appended.is_empty());
        assert!(!late.complete);
    }

    #[tokio::test]
    async fn test_finalize_overwrites_when_forced() {
        let dir = tempdir().unwrap();
        let chunk_dir = dir.path().join("chunks");
        tokio::fs::create_dir_all(&chunk_dir).await.unwrap();
        let c0 = write_chunk(&chunk_dir, ".chunk.0", b"new!").await;
        let staging = chunk_dir.join("f.staging");
        let final_path = dir.path().join("f.bin");
        tokio::fs::write(&final_path, b"old contents").await.unwrap();

        let mut session = assembler()
            .start_incremental_merge(1, &staging, &final_path, 4, 1)
            .await
            .unwrap();
        session.append_chunk(0, &c0, 4).await.unwrap();
        session.finalize(true).await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"new!");
    }

    #[test]
    fn test_buffer_pool_bounds() {
        let pool = BufferPool::new(&BufferPoolConfig {
            buffer_size: 8,
            max_pooled: 2,
            pre_allocate: true,
        });
        assert_eq!(pool.pooled_count(), 2);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // pool empty, freshly allocated
        assert_eq!(pool.pooled_count(), 0);

        pool.release(a);
        pool.release(b);
        pool.release(c); // beyond the cap, dropped
        assert_eq!(pool.pooled_count(), 2);
    }
}
