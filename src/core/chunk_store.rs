use crate::core::error::EngineError;
use crate::core::state::Chunk;
/// Filesystem layout for temporary chunk files and staging files
///
/// Each download gets a dedicated subdirectory under the base temp dir;
/// staging files live in the same subdirectory so the final rename stays on
/// one filesystem. The store here is advisory - the StateStore remains
/// authoritative; `reconcile_chunks` reports where the two disagree.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of comparing on-disk chunk files against the database rows.
#[derive(Debug, Default)]
pub struct ChunkReconciliation {
    /// Files on disk with no matching row
    pub orphaned: Vec<PathBuf>,
    /// Completed rows whose file is gone
    pub missing: Vec<u32>,
    /// Completed rows whose file size differs from the declared range
    pub mismatched: Vec<u32>,
    /// Chunk files found on disk
    pub total: usize,
    /// Rows in the database
    pub in_db: usize,
}

pub struct ChunkStore {
    base: PathBuf,
}

impl ChunkStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            base: data_dir.join("temp").join("chunks"),
        }
    }

    /// Create the base directory and probe writability.
    pub fn initialize(&self) -> Result<(), EngineError> {
        fs::create_dir_all(&self.base)?;
        let probe = self.base.join(".probe");
        fs::write(&probe, b"ok")
            .map_err(|e| EngineError::Disk(format!("chunk dir not writable: {e}")))?;
        fs::remove_file(&probe)?;
        debug!(base = %self.base.display(), "chunk store initialized");
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn chunk_dir(&self, download_id: i64) -> PathBuf {
        self.base.join(download_id.to_string())
    }

    pub fn chunk_path(&self, download_id: i64, index: u32) -> PathBuf {
        self.chunk_dir(download_id).join(format!(".chunk.{index}"))
    }

    /// Staging file for `final_path`, placed inside the chunk dir so the
    /// final rename is atomic on the same filesystem.
    pub fn staging_path(&self, download_id: i64, final_path: &Path) -> PathBuf {
        let basename = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "download".to_string());
        self.chunk_dir(download_id).join(format!("{basename}.staging"))
    }

    pub fn create_chunk_dir(&self, download_id: i64) -> Result<PathBuf, EngineError> {
        let dir = self.chunk_dir(download_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Chunk files present on disk for a download, by index.
    pub fn list_chunks(&self, download_id: i64) -> Vec<(u32, PathBuf)> {
        let dir = self.chunk_dir(download_id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut chunks: Vec<(u32, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let index = name.strip_prefix(".chunk.")?.parse().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        chunks.sort_by_key(|(index, _)| *index);
        chunks
    }

    pub fn chunk_exists(&self, download_id: i64, index: u32) -> bool {
        self.chunk_path(download_id, index).exists()
    }

    pub fn get_chunk_size(&self, download_id: i64, index: u32) -> Option<u64> {
        fs::metadata(self.chunk_path(download_id, index))
            .ok()
            .map(|m| m.len())
    }

    pub fn delete_chunk(&self, download_id: i64, index: u32) -> Result<(), EngineError> {
        let path = self.chunk_path(download_id, index);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove the whole chunk directory for a download, staging included.
    pub fn delete_all_chunks(&self, download_id: i64) -> Result<(), EngineError> {
        let dir = self.chunk_dir(download_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(download_id, "chunk directory removed");
        }
        Ok(())
    }

    /// Compare the filesystem against the database rows for one download.
    pub fn reconcile_chunks(&self, download_id: i64, db_chunks: &[Chunk]) -> ChunkReconciliation {
        let on_disk = self.list_chunks(download_id);
        let mut result = ChunkReconciliation {
            total: on_disk.len(),
            in_db: db_chunks.len(),
            ..Default::default()
        };

        let known: HashSet<u32> = db_chunks.iter().map(|c| c.index).collect();
        for (index, path) in &on_disk {
            if !known.contains(index) {
                result.orphaned.push(path.clone());
            }
        }

        for chunk in db_chunks {
            if !chunk.is_complete() {
                continue;
            }
            match self.get_chunk_size(download_id, chunk.index) {
                None => result.missing.push(chunk.index),
                Some(size) if size != chunk.size() => result.mismatched.push(chunk.index),
                Some(_) => {}
            }
        }

        if !result.orphaned.is_empty() || !result.missing.is_empty() || !result.mismatched.is_empty()
        {
            warn!(
                download_id,
                orphaned = result.orphaned.len(),
                missing = result.missing.len(),
                mismatched = result.mismatched.len(),
                "chunk reconciliation found discrepancies"
            );
        }
        result
    }

    /// Drop chunk directories for downloads no longer active.
    pub fn cleanup_orphaned_dirs(&self, active_ids: &HashSet<i64>) -> usize {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(id) = name.parse::<i64>() else {
                continue;
            };
            if active_ids.contains(&id) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    debug!(download_id = id, "removed orphaned chunk directory");
                }
                Err(e) => warn!(download_id = id, error = %e, "failed to remove orphan dir"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::ChunkState;
    use tempfile::tempdir;

    fn chunk(id: i64, index: u32, start: u64, end: u64, state: ChunkState, store: &ChunkStore) -> Chunk {
        Chunk {
            download_id: id,
            index,
            start_byte: start,
            end_byte: end,
            state,
            downloaded_bytes: 0,
            temp_path: store.chunk_path(id, index),
            hash: None,
            hash_verified: false,
            tail_hash: None,
            tail_size: 0,
            retry_count: 0,
        }
    }

    #[test]
    fn test_initialize_and_paths() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        store.initialize().unwrap();

        assert!(store.base_dir().exists());
        assert_eq!(
            store.chunk_path(7, 3),
            store.base_dir().join("7").join(".chunk.3")
        );
        let staging = store.staging_path(7, Path::new("/downloads/game.zip"));
        assert_eq!(staging, store.base_dir().join("7").join("game.zip.staging"));
    }

    #[test]
    fn test_list_and_sizes() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        store.initialize().unwrap();
        store.create_chunk_dir(1).unwrap();

        fs::write(store.chunk_path(1, 1), b"bb").unwrap();
        fs::write(store.chunk_path(1, 0), b"aaa").unwrap();
        fs::write(store.chunk_dir(1).join("noise.txt"), b"x").unwrap();

        let listed = store.list_chunks(1);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, 0);
        assert_eq!(store.get_chunk_size(1, 0), Some(3));
        assert!(store.chunk_exists(1, 1));
        assert!(!store.chunk_exists(1, 2));

        store.delete_chunk(1, 0).unwrap();
        assert!(!store.chunk_exists(1, 0));
        store.delete_all_chunks(1).unwrap();
        assert!(!store.chunk_dir(1).exists());
    }

    #[test]
    fn test_reconcile_partitions() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        store.initialize().unwrap();
        store.create_chunk_dir(1).unwrap();

        // index 0: completed and correct (5 bytes for range 0..=4)
        fs::write(store.chunk_path(1, 0), b"01234").unwrap();
        // index 1: completed but wrong size
        fs::write(store.chunk_path(1, 1), b"x").unwrap();
        // index 9: on disk but unknown to the db
        fs::write(store.chunk_path(1, 9), b"zz").unwrap();

        let db = vec![
            chunk(1, 0, 0, 4, ChunkState::Completed, &store),
            chunk(1, 1, 5, 9, ChunkState::Completed, &store),
            // index 2: completed in db, file missing
            chunk(1, 2, 10, 14, ChunkState::Completed, &store),
            // index 3: pending, missing file is fine
            chunk(1, 3, 15, 19, ChunkState::Pending, &store),
        ];

        let recon = store.reconcile_chunks(1, &db);
        assert_eq!(recon.total, 3);
        assert_eq!(recon.in_db, 4);
        assert_eq!(recon.orphaned.len(), 1);
        assert_eq!(recon.missing, vec![2]);
        assert_eq!(recon.mismatched, vec![1]);
    }

    #[test]
    fn test_cleanup_orphaned_dirs() {
        let dir = tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        store.initialize().unwrap();
        store.create_chunk_dir(1).unwrap();
        store.create_chunk_dir(2).unwrap();

        let mut active = HashSet::new();
        active.insert(1i64);
        let removed = store.cleanup_orphaned_dirs(&active);
        assert_eq!(removed, 1);
        assert!(store.chunk_dir(1).exists());
        assert!(!store.chunk_dir(2).exists());
    }
}
