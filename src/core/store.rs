use crate::core::error::EngineError;
use crate::core::state::{
    Attempt, Chunk, ChunkState, ChunkUpdate, Download, DownloadState, DownloadUpdate,
    HistoryEntry, NewDownload, Priority,
};
/// Durable state store - authoritative table of downloads, chunks, attempts
/// and history, plus the transition machine.
///
/// Every mutating call commits before returning and bumps the monotonic
/// state-version. Recovery after restart reads the last persisted states.
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Fired after a successful transition, with the new state.
pub type EnterHook = Arc<dyn Fn(i64, DownloadState) + Send + Sync>;
/// Fired during a successful transition, with old and new states.
pub type ExitHook = Arc<dyn Fn(i64, DownloadState, DownloadState) + Send + Sync>;

#[derive(Default)]
struct TransitionHooks {
    on_enter: Option<EnterHook>,
    on_exit: Option<ExitHook>,
}

/// Seed for one chunk row.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub start_byte: u64,
    pub end_byte: u64,
    pub temp_path: PathBuf,
}

pub struct StateStore {
    conn: Mutex<Connection>,
    version: AtomicU64,
    hooks: Mutex<TransitionHooks>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS downloads (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    catalog_id         INTEGER,
    title              TEXT NOT NULL,
    url                TEXT,
    save_path          TEXT,
    state              TEXT NOT NULL,
    progress           REAL NOT NULL DEFAULT 0,
    downloaded_bytes   INTEGER NOT NULL DEFAULT 0,
    total_bytes        INTEGER NOT NULL DEFAULT 0,
    priority           INTEGER NOT NULL DEFAULT 1,
    retry_count        INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL,
    started_at         TEXT,
    completed_at       TEXT,
    preserve_structure INTEGER NOT NULL DEFAULT 0,
    force_overwrite    INTEGER NOT NULL DEFAULT 0,
    last_error         TEXT,
    expected_hash      TEXT,
    actual_hash        TEXT,
    size_verified      INTEGER NOT NULL DEFAULT 0,
    hash_verified      INTEGER NOT NULL DEFAULT 0,
    partial_tail_hash  TEXT,
    partial_tail_size  INTEGER NOT NULL DEFAULT 0,
    version            INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
CREATE INDEX IF NOT EXISTS idx_downloads_version ON downloads(version);
CREATE TABLE IF NOT EXISTS chunks (
    download_id      INTEGER NOT NULL,
    chunk_index      INTEGER NOT NULL,
    start_byte       INTEGER NOT NULL,
    end_byte         INTEGER NOT NULL,
    state            TEXT NOT NULL DEFAULT 'pending',
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
    temp_path        TEXT NOT NULL,
    hash             TEXT,
    hash_verified    INTEGER NOT NULL DEFAULT 0,
    tail_hash        TEXT,
    tail_size        INTEGER NOT NULL DEFAULT 0,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (download_id, chunk_index)
);
CREATE TABLE IF NOT EXISTS attempts (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    download_id       INTEGER NOT NULL,
    chunk_index       INTEGER,
    attempt_number    INTEGER NOT NULL,
    timestamp         TEXT NOT NULL,
    error             TEXT,
    error_code        TEXT,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    duration_ms       INTEGER NOT NULL DEFAULT 0,
    speed_bps         REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_attempts_download ON attempts(download_id);
CREATE TABLE IF NOT EXISTS history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    download_id INTEGER NOT NULL,
    old_state   TEXT NOT NULL,
    new_state   TEXT NOT NULL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_download ON history(download_id);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Snapshot row cap; larger tables set `truncated` and expect observers to
/// page via incremental versions.
const SNAPSHOT_ROW_CAP: usize = 500;

const DOWNLOAD_COLUMNS: &str = "id, catalog_id, title, url, save_path, state, progress, \
     downloaded_bytes, total_bytes, priority, retry_count, created_at, started_at, \
     completed_at, preserve_structure, force_overwrite, last_error, expected_hash, \
     actual_hash, size_verified, hash_verified, partial_tail_hash, partial_tail_size, version";

impl StateStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, EngineError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, EngineError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;

        let version: u64 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'state_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            conn: Mutex::new(conn),
            version: AtomicU64::new(version),
            hooks: Mutex::new(TransitionHooks::default()),
        })
    }

    pub fn set_transition_hooks(&self, on_enter: EnterHook, on_exit: ExitHook) {
        let mut hooks = self.hooks.lock().unwrap();
        hooks.on_enter = Some(on_enter);
        hooks.on_exit = Some(on_exit);
    }

    pub fn get_state_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Increment the monotonic version and persist it. Must be called with
    /// the connection lock held, inside the mutating statement's scope.
    fn bump_version(&self, conn: &Connection) -> Result<u64, EngineError> {
        let next = self.version.load(Ordering::SeqCst) + 1;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('state_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = ?1",
            params![next.to_string()],
        )?;
        self.version.store(next, Ordering::SeqCst);
        Ok(next)
    }

    // ---- downloads ----------------------------------------------------

    pub fn add_download(&self, input: NewDownload) -> Result<Download, EngineError> {
        if input.title.is_empty() {
            return Err(EngineError::Logic("download title must not be empty".into()));
        }
        let state = if input.start_paused {
            DownloadState::Paused
        } else {
            DownloadState::Queued
        };
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        let version = self.bump_version(&conn)?;
        conn.execute(
            "INSERT INTO downloads (catalog_id, title, url, save_path, state, total_bytes, \
             priority, created_at, preserve_structure, force_overwrite, expected_hash, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                input.catalog_id,
                input.title,
                input.url,
                input.save_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                state.as_str(),
                input.total_bytes as i64,
                input.priority.unwrap_or(Priority::Normal) as i64,
                now.to_rfc3339(),
                input.preserve_structure,
                input.force_overwrite,
                input.expected_hash,
                version as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, title = %input.title, state = %state, "download row created");
        self.fetch_download(&conn, id)?
            .ok_or_else(|| EngineError::Logic(format!("download {id} vanished after insert")))
    }

    pub fn get_download(&self, id: i64) -> Result<Option<Download>, EngineError> {
        let conn = self.conn.lock().unwrap();
        self.fetch_download(&conn, id)
    }

    pub fn get_downloads_by_state(
        &self,
        state: DownloadState,
    ) -> Result<Vec<Download>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE state = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![state.as_str()], row_to_download)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_all_downloads(&self) -> Result<Vec<Download>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([], row_to_download)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Apply a partial update. Returns false when the id does not exist.
    pub fn update_download(&self, id: i64, update: &DownloadUpdate) -> Result<bool, EngineError> {
        let conn = self.conn.lock().unwrap();
        let version = self.bump_version(&conn)?;

        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        macro_rules! set {
            ($field:expr, $col:literal) => {
                if let Some(v) = $field {
                    sets.push(concat!($col, " = ?"));
                    values.push(Box::new(v));
                }
            };
        }

        set!(update.url.clone(), "url");
        set!(
            update
                .save_path
                .clone()
                .map(|p| p.to_string_lossy().to_string()),
            "save_path"
        );
        set!(update.progress, "progress");
        set!(update.downloaded_bytes.map(|v| v as i64), "downloaded_bytes");
        set!(update.total_bytes.map(|v| v as i64), "total_bytes");
        set!(update.retry_count.map(|v| v as i64), "retry_count");
        set!(
            update.started_at.map(|v| v.map(|t| t.to_rfc3339())),
            "started_at"
        );
        set!(
            update.completed_at.map(|v| v.map(|t| t.to_rfc3339())),
            "completed_at"
        );
        set!(update.force_overwrite, "force_overwrite");
        set!(update.last_error.clone(), "last_error");
        set!(update.expected_hash.clone(), "expected_hash");
        set!(update.actual_hash.clone(), "actual_hash");
        set!(update.size_verified, "size_verified");
        set!(update.hash_verified, "hash_verified");
        set!(update.partial_tail_hash.clone(), "partial_tail_hash");
        set!(update.partial_tail_size.map(|v| v as i64), "partial_tail_size");

        sets.push("version = ?");
        values.push(Box::new(version as i64));
        values.push(Box::new(id));

        let sql = format!("UPDATE downloads SET {} WHERE id = ?", sets.join(", "));
        let changed = conn.execute(
            &sql,
            params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed > 0)
    }

    /// Attempt a state transition. Returns false without mutation when the
    /// target is unreachable from the current state, or `expected_prev` is
    /// supplied and does not match. Fires the transition hooks on success.
    pub fn transition_state(
        &self,
        id: i64,
        new_state: DownloadState,
        expected_prev: Option<DownloadState>,
    ) -> Result<bool, EngineError> {
        let old_state = {
            let conn = self.conn.lock().unwrap();
            let Some(current) = self.fetch_state(&conn, id)? else {
                return Ok(false);
            };
            if let Some(expected) = expected_prev {
                if current != expected {
                    debug!(id, %current, expected = %expected, "transition rejected: precondition");
                    return Ok(false);
                }
            }
            if !current.can_transition_to(new_state) {
                warn!(id, from = %current, to = %new_state, "transition rejected: invalid edge");
                return Ok(false);
            }

            let version = self.bump_version(&conn)?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE downloads SET state = ?1, version = ?2 WHERE id = ?3",
                params![new_state.as_str(), version as i64, id],
            )?;
            conn.execute(
                "INSERT INTO history (download_id, old_state, new_state, timestamp) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, current.as_str(), new_state.as_str(), now],
            )?;
            current
        };

        debug!(id, from = %old_state, to = %new_state, "state transition");
        let (on_exit, on_enter) = {
            let hooks = self.hooks.lock().unwrap();
            (hooks.on_exit.clone(), hooks.on_enter.clone())
        };
        if let Some(hook) = on_exit {
            hook(id, old_state, new_state);
        }
        if let Some(hook) = on_enter {
            hook(id, new_state);
        }
        Ok(true)
    }

    pub fn clear_last_error(&self, id: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        let version = self.bump_version(&conn)?;
        conn.execute(
            "UPDATE downloads SET last_error = NULL, version = ?1 WHERE id = ?2",
            params![version as i64, id],
        )?;
        Ok(())
    }

    // ---- chunks -------------------------------------------------------

    pub fn create_chunks(
        &self,
        download_id: i64,
        specs: &[ChunkSpec],
    ) -> Result<Vec<Chunk>, EngineError> {
        let mut conn = self.conn.lock().unwrap();
        self.bump_version(&conn)?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM chunks WHERE download_id = ?1",
            params![download_id],
        )?;
        for (index, spec) in specs.iter().enumerate() {
            tx.execute(
                "INSERT INTO chunks (download_id, chunk_index, start_byte, end_byte, temp_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    download_id,
                    index as i64,
                    spec.start_byte as i64,
                    spec.end_byte as i64,
                    spec.temp_path.to_string_lossy().to_string(),
                ],
            )?;
        }
        tx.commit()?;
        drop(conn);
        self.get_chunks(download_id)
    }

    pub fn get_chunks(&self, download_id: i64) -> Result<Vec<Chunk>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, start_byte, end_byte, state, downloaded_bytes, \
             temp_path, hash, hash_verified, tail_hash, tail_size, retry_count \
             FROM chunks WHERE download_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![download_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_chunk_progress(
        &self,
        download_id: i64,
        index: u32,
        update: &ChunkUpdate,
    ) -> Result<bool, EngineError> {
        let conn = self.conn.lock().unwrap();
        self.bump_version(&conn)?;

        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(v) = update.state {
            sets.push("state = ?");
            values.push(Box::new(v.as_str()));
        }
        if let Some(v) = update.downloaded_bytes {
            sets.push("downloaded_bytes = ?");
            values.push(Box::new(v as i64));
        }
        if let Some(v) = update.hash.clone() {
            sets.push("hash = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.hash_verified {
            sets.push("hash_verified = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.tail_hash.clone() {
            sets.push("tail_hash = ?");
            values.push(Box::new(v));
        }
        if let Some(v) = update.tail_size {
            sets.push("tail_size = ?");
            values.push(Box::new(v as i64));
        }
        if let Some(v) = update.retry_count {
            sets.push("retry_count = ?");
            values.push(Box::new(v as i64));
        }
        if sets.is_empty() {
            return Ok(false);
        }

        values.push(Box::new(download_id));
        values.push(Box::new(index as i64));
        let sql = format!(
            "UPDATE chunks SET {} WHERE download_id = ? AND chunk_index = ?",
            sets.join(", ")
        );
        let changed = conn.execute(
            &sql,
            params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed > 0)
    }

    pub fn delete_chunks(&self, download_id: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        self.bump_version(&conn)?;
        conn.execute(
            "DELETE FROM chunks WHERE download_id = ?1",
            params![download_id],
        )?;
        Ok(())
    }

    // ---- attempts & history -------------------------------------------

    pub fn record_attempt(&self, attempt: &Attempt) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        self.bump_version(&conn)?;
        conn.execute(
            "INSERT INTO attempts (download_id, chunk_index, attempt_number, timestamp, error, \
             error_code, bytes_transferred, duration_ms, speed_bps) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt.download_id,
                attempt.chunk_index.map(|v| v as i64),
                attempt.attempt_number as i64,
                attempt.timestamp.to_rfc3339(),
                attempt.error,
                attempt.error_code,
                attempt.bytes_transferred as i64,
                attempt.duration_ms as i64,
                attempt.speed_bps,
            ],
        )?;
        Ok(())
    }

    pub fn get_attempts(&self, download_id: i64) -> Result<Vec<Attempt>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, chunk_index, attempt_number, timestamp, error, error_code, \
             bytes_transferred, duration_ms, speed_bps \
             FROM attempts WHERE download_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![download_id], |row| {
                Ok(Attempt {
                    download_id: row.get(0)?,
                    chunk_index: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                    attempt_number: row.get::<_, i64>(2)? as u32,
                    timestamp: parse_ts(&row.get::<_, String>(3)?),
                    error: row.get(4)?,
                    error_code: row.get(5)?,
                    bytes_transferred: row.get::<_, i64>(6)? as u64,
                    duration_ms: row.get::<_, i64>(7)? as u64,
                    speed_bps: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_history(&self, download_id: i64) -> Result<Vec<HistoryEntry>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT download_id, old_state, new_state, timestamp \
             FROM history WHERE download_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![download_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, old, new, ts)| {
                Some(HistoryEntry {
                    download_id: id,
                    old_state: DownloadState::parse(&old)?,
                    new_state: DownloadState::parse(&new)?,
                    timestamp: parse_ts(&ts),
                })
            })
            .collect())
    }

    // ---- snapshots ----------------------------------------------------

    pub fn get_snapshot(
        &self,
        min_version: Option<u64>,
    ) -> Result<galleon_shared::Snapshot, EngineError> {
        let conn = self.conn.lock().unwrap();

        let mut summary = galleon_shared::StateSummary::default();
        {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM downloads GROUP BY state")?;
            let counts = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for (state, count) in counts {
                summary.total += count;
                summary.counts.insert(state, count);
            }
        }

        let (sql, version_floor) = match min_version {
            Some(v) => (
                format!(
                    "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE version > ?1 \
                     ORDER BY version LIMIT {}",
                    SNAPSHOT_ROW_CAP + 1
                ),
                v as i64,
            ),
            None => (
                format!(
                    "SELECT {DOWNLOAD_COLUMNS} FROM downloads ORDER BY created_at DESC \
                     LIMIT {}",
                    SNAPSHOT_ROW_CAP + 1
                ),
                0,
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let mut downloads = if min_version.is_some() {
            stmt.query_map(params![version_floor], row_to_download)?
                .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], row_to_download)?
                .collect::<Result<Vec<_>, _>>()?
        };

        let truncated = downloads.len() > SNAPSHOT_ROW_CAP;
        downloads.truncate(SNAPSHOT_ROW_CAP);

        let all_ids = if min_version.is_some() {
            let mut stmt = conn.prepare("SELECT id FROM downloads ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Some(ids)
        } else {
            None
        };

        Ok(galleon_shared::Snapshot {
            state_version: self.get_state_version(),
            summary,
            downloads: downloads.iter().map(download_to_row).collect(),
            all_ids,
            truncated,
        })
    }

    // ---- settings -----------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, EngineError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        self.bump_version(&conn)?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // ---- internals ----------------------------------------------------

    fn fetch_download(
        &self,
        conn: &Connection,
        id: i64,
    ) -> Result<Option<Download>, EngineError> {
        Ok(conn
            .query_row(
                &format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE id = ?1"),
                params![id],
                row_to_download,
            )
            .optional()?)
    }

    fn fetch_state(
        &self,
        conn: &Connection,
        id: i64,
    ) -> Result<Option<DownloadState>, EngineError> {
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM downloads WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state.as_deref().and_then(DownloadState::parse))
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<Download> {
    let state_raw: String = row.get(5)?;
    Ok(Download {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
        save_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        state: DownloadState::parse(&state_raw).unwrap_or(DownloadState::Failed),
        progress: row.get(6)?,
        downloaded_bytes: row.get::<_, i64>(7)? as u64,
        total_bytes: row.get::<_, i64>(8)? as u64,
        priority: Priority::from_i64(row.get(9)?),
        retry_count: row.get::<_, i64>(10)? as u32,
        created_at: parse_ts(&row.get::<_, String>(11)?),
        started_at: row.get::<_, Option<String>>(12)?.map(|s| parse_ts(&s)),
        completed_at: row.get::<_, Option<String>>(13)?.map(|s| parse_ts(&s)),
        preserve_structure: row.get(14)?,
        force_overwrite: row.get(15)?,
        last_error: row.get(16)?,
        expected_hash: row.get(17)?,
        actual_hash: row.get(18)?,
        size_verified: row.get(19)?,
        hash_verified: row.get(20)?,
        partial_tail_hash: row.get(21)?,
        partial_tail_size: row.get::<_, i64>(22)? as u64,
        version: row.get::<_, i64>(23)? as u64,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let state_raw: String = row.get(4)?;
    Ok(Chunk {
        download_id: row.get(0)?,
        index: row.get::<_, i64>(1)? as u32,
        start_byte: row.get::<_, i64>(2)? as u64,
        end_byte: row.get::<_, i64>(3)? as u64,
        state: ChunkState::parse(&state_raw).unwrap_or(ChunkState::Failed),
        downloaded_bytes: row.get::<_, i64>(5)? as u64,
        temp_path: PathBuf::from(row.get::<_, String>(6)?),
        hash: row.get(7)?,
        hash_verified: row.get(8)?,
        tail_hash: row.get(9)?,
        tail_size: row.get::<_, i64>(10)? as u64,
        retry_count: row.get::<_, i64>(11)? as u32,
    })
}

fn download_to_row(d: &Download) -> galleon_shared::DownloadRow {
    galleon_shared::DownloadRow {
        id: d.id,
        title: d.title.clone(),
        url: d.url.clone(),
        save_path: d
            .save_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        state: d.state.as_str().to_string(),
        progress: d.progress,
        downloaded_bytes: d.downloaded_bytes,
        total_bytes: d.total_bytes,
        priority: d.priority as u8,
        retry_count: d.retry_count,
        created_at: d.created_at.timestamp_millis(),
        started_at: d.started_at.map(|t| t.timestamp_millis()),
        completed_at: d.completed_at.map(|t| t.timestamp_millis()),
        last_error: d.last_error.clone(),
        version: d.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn store() -> StateStore {
        StateStore::in_memory().unwrap()
    }

    fn add(store: &StateStore, title: &str) -> Download {
        store
            .add_download(NewDownload {
                title: title.to_string(),
                url: Some(format!("https://host.example/{title}")),
                total_bytes: 1_000_000,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let store = store();
        let d = add(&store, "game.zip");
        assert_eq!(d.state, DownloadState::Queued);
        assert_eq!(d.total_bytes, 1_000_000);

        let fetched = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(fetched.title, "game.zip");
        assert!(store.get_download(9999).unwrap().is_none());
    }

    #[test]
    fn test_version_monotonic() {
        let store = store();
        let v0 = store.get_state_version();
        let d = add(&store, "a.zip");
        let v1 = store.get_state_version();
        assert!(v1 > v0);

        store
            .update_download(
                d.id,
                &DownloadUpdate {
                    downloaded_bytes: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.get_state_version() > v1);
    }

    #[test]
    fn test_transition_machine_enforced() {
        let store = store();
        let d = add(&store, "a.zip");
        assert!(store
            .transition_state(d.id, DownloadState::Starting, None)
            .unwrap());
        // completed is not reachable from starting
        assert!(!store
            .transition_state(d.id, DownloadState::Completed, None)
            .unwrap());
        // the rejected transition did not mutate the row
        let current = store.get_download(d.id).unwrap().unwrap();
        assert_eq!(current.state, DownloadState::Starting);
    }

    #[test]
    fn test_transition_expected_prev() {
        let store = store();
        let d = add(&store, "a.zip");
        assert!(!store
            .transition_state(d.id, DownloadState::Starting, Some(DownloadState::Paused))
            .unwrap());
        assert!(store
            .transition_state(d.id, DownloadState::Starting, Some(DownloadState::Queued))
            .unwrap());
    }

    #[test]
    fn test_transition_fires_hooks_and_history() {
        let store = store();
        let d = add(&store, "a.zip");
        let entered = Arc::new(AtomicUsize::new(0));
        let exited = Arc::new(AtomicUsize::new(0));
        let e = entered.clone();
        let x = exited.clone();
        store.set_transition_hooks(
            Arc::new(move |_, _| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_, _, _| {
                x.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store
            .transition_state(d.id, DownloadState::Starting, None)
            .unwrap();
        store
            .transition_state(d.id, DownloadState::Downloading, None)
            .unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        assert_eq!(exited.load(Ordering::SeqCst), 2);

        let history = store.get_history(d.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_state, DownloadState::Queued);
        assert_eq!(history[1].new_state, DownloadState::Downloading);
    }

    #[test]
    fn test_chunks_round_trip() {
        let store = store();
        let d = add(&store, "a.zip");
        let chunks = store
            .create_chunks(
                d.id,
                &[
                    ChunkSpec {
                        start_byte: 0,
                        end_byte: 4999,
                        temp_path: PathBuf::from("/tmp/.chunk.0"),
                    },
                    ChunkSpec {
                        start_byte: 5000,
                        end_byte: 9999,
                        temp_path: PathBuf::from("/tmp/.chunk.1"),
                    },
                ],
            )
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].start_byte, 5000);
        assert_eq!(chunks[0].state, ChunkState::Pending);

        store
            .update_chunk_progress(
                d.id,
                0,
                &ChunkUpdate {
                    state: Some(ChunkState::Completed),
                    downloaded_bytes: Some(5000),
                    ..Default::default()
                },
            )
            .unwrap();
        let chunks = store.get_chunks(d.id).unwrap();
        assert!(chunks[0].is_complete());
        assert_eq!(chunks[0].downloaded_bytes, 5000);

        store.delete_chunks(d.id).unwrap();
        assert!(store.get_chunks(d.id).unwrap().is_empty());
    }

    #[test]
    fn test_attempts_append_only() {
        let store = store();
        let d = add(&store, "a.zip");
        store
            .record_attempt(&Attempt {
                download_id: d.id,
                chunk_index: None,
                attempt_number: 1,
                timestamp: Utc::now(),
                error: Some("ECONNRESET".into()),
                error_code: Some("NETWORK".into()),
                bytes_transferred: 1234,
                duration_ms: 800,
                speed_bps: 1542.5,
            })
            .unwrap();
        let attempts = store.get_attempts(d.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].error.as_deref(), Some("ECONNRESET"));
    }

    #[test]
    fn test_snapshot_full_and_incremental() {
        let store = store();
        let a = add(&store, "a.zip");
        let snap = store.get_snapshot(None).unwrap();
        assert_eq!(snap.summary.total, 1);
        assert_eq!(snap.downloads.len(), 1);
        assert!(snap.all_ids.is_none());
        assert!(!snap.truncated);

        let floor = snap.state_version;
        let b = add(&store, "b.zip");
        let incr = store.get_snapshot(Some(floor)).unwrap();
        assert_eq!(incr.downloads.len(), 1);
        assert_eq!(incr.downloads[0].id, b.id);
        let ids = incr.all_ids.unwrap();
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
    }

    #[test]
    fn test_snapshot_after_add_is_queued() {
        let store = store();
        let d = add(&store, "game.zip");
        let snap = store.get_snapshot(None).unwrap();
        let row = snap.downloads.iter().find(|r| r.id == d.id).unwrap();
        assert_eq!(row.state, "queued");
    }

    #[test]
    fn test_settings_persist() {
        let store = store();
        assert!(store.get_setting("turbo").unwrap().is_none());
        store.set_setting("turbo", "true").unwrap();
        assert_eq!(store.get_setting("turbo").unwrap().as_deref(), Some("true"));
        store.set_setting("turbo", "false").unwrap();
        assert_eq!(
            store.get_setting("turbo").unwrap().as_deref(),
            Some("false")
        );
    }

    #[test]
    fn test_clear_last_error() {
        let store = store();
        let d = add(&store, "a.zip");
        store
            .update_download(
                d.id,
                &DownloadUpdate {
                    last_error: Some(Some("boom".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        store.clear_last_error(d.id).unwrap();
        assert!(store
            .get_download(d.id)
            .unwrap()
            .unwrap()
            .last_error
            .is_none());
    }
}
