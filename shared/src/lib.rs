use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Events emitted by the engine to external observers.
///
/// `StateChanged` is debounced and coalesced: observers are expected to call
/// `get_snapshot(last_seen_version)` to reconcile rather than relying on one
/// event per mutation. Progress events may be reordered on the wire; the
/// highest `downloaded_bytes` seen for a given id is authoritative.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        version: u64,
    },
    DownloadProgress {
        id: i64,
        downloaded_bytes: u64,
        total_bytes: u64,
        progress: f64,
        speed_bps: f64,
        eta_seconds: Option<u64>,
    },
    DownloadCompleted {
        id: i64,
        path: String,
    },
    DownloadFailed {
        id: i64,
        error: String,
        failed_during_merge: bool,
    },
    ChunkCompleted {
        id: i64,
        chunk_index: u32,
    },
    ChunkFailed {
        id: i64,
        chunk_index: u32,
        error: String,
    },
    MergeStarted {
        id: i64,
    },
    VerificationStarted {
        id: i64,
    },
    NeedsConfirmation {
        info: ConflictInfo,
    },
}

/// Details of an overwrite conflict awaiting user confirmation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConflictInfo {
    pub id: i64,
    pub title: String,
    pub path: String,
    pub existing_size: u64,
    pub total_bytes: u64,
}

/// One download row as seen by observers. Timestamps are unix millis.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DownloadRow {
    pub id: i64,
    pub title: String,
    pub url: Option<String>,
    pub save_path: Option<String>,
    pub state: String,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub priority: u8,
    pub retry_count: u32,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub version: u64,
}

/// Per-state counts included with every snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StateSummary {
    pub counts: HashMap<String, u64>,
    pub total: u64,
}

/// A point-in-time view of the download table.
///
/// Incremental snapshots (`min_version` supplied) carry only rows whose
/// version exceeds the floor, plus the complete id set so observers can
/// detect deletions.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Snapshot {
    pub state_version: u64,
    pub summary: StateSummary,
    pub downloads: Vec<DownloadRow>,
    pub all_ids: Option<Vec<i64>>,
    pub truncated: bool,
}

/// Aggregated session metrics reported by `get_session_metrics`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SessionMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub transient_retries: u64,
    pub total_bytes: u64,
    pub active: u64,
    pub error_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub duration_histogram: HashMap<String, u64>,
    pub hosts: HashMap<String, HostMetricsRow>,
}

/// Per-origin transfer statistics.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HostMetricsRow {
    pub completed: u64,
    pub errors: u64,
    pub total_bytes: u64,
    pub total_transfer_ms: u64,
    pub avg_speed_bps: f64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}
