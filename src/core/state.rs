use chrono::{DateTime, Utc};
/// Download state management
///
/// This module defines the state machine for downloads and chunks and the
/// row models persisted by the state store.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Download state enum - represents all possible states a download can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Waiting for a scheduler slot
    Queued,
    /// Metadata resolution and strategy selection in progress
    Starting,
    /// Bytes are flowing
    Downloading,
    /// Chunk files are being concatenated into the staging file
    Merging,
    /// Size/hash verification of the assembled file
    Verifying,
    /// Paused by user (can resume)
    Paused,
    /// Completed successfully
    Completed,
    /// Failed permanently or beyond the retry budget
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl DownloadState {
    /// Check if download is in a terminal state (no further action possible)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }

    /// States that hold a scheduler slot and a host registration
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Starting
                | DownloadState::Downloading
                | DownloadState::Merging
                | DownloadState::Verifying
        )
    }

    /// Check if download can be resumed from this state
    pub fn can_resume(&self) -> bool {
        matches!(
            self,
            DownloadState::Paused | DownloadState::Failed | DownloadState::Cancelled
        )
    }

    /// Validates a transition against the state machine.
    ///
    /// Happy path: queued -> starting -> downloading -> (merging ->)
    /// verifying -> completed. Paused is reachable from every non-terminal
    /// working state; failed and cancelled from any non-terminal. Queued is
    /// re-entered from paused/failed/cancelled on resume or retry, and from
    /// starting/downloading on a transient re-queue.
    pub fn can_transition_to(&self, next: DownloadState) -> bool {
        use DownloadState::*;
        if *self == next {
            return false;
        }
        match (*self, next) {
            (Queued, Starting) => true,
            (Starting, Downloading) => true,
            (Downloading, Merging) => true,
            (Downloading, Verifying) => true,
            (Merging, Verifying) => true,
            (Verifying, Completed) => true,

            // transient re-queue while acquiring metadata or mid-transfer
            (Starting, Queued) => true,
            (Downloading, Queued) => true,

            // pause from any non-terminal working state
            (Queued | Starting | Downloading | Merging | Verifying, Paused) => true,

            // resume / retry re-entry
            (Paused | Failed | Cancelled, Queued) => true,

            // failure and cancellation from any non-terminal state
            (from, Failed) if !from.is_terminal() => true,
            (from, Cancelled) if !from.is_terminal() => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Starting => "starting",
            DownloadState::Downloading => "downloading",
            DownloadState::Merging => "merging",
            DownloadState::Verifying => "verifying",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<DownloadState> {
        Some(match s {
            "queued" => DownloadState::Queued,
            "starting" => DownloadState::Starting,
            "downloading" => DownloadState::Downloading,
            "merging" => DownloadState::Merging,
            "verifying" => DownloadState::Verifying,
            "paused" => DownloadState::Paused,
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" => DownloadState::Cancelled,
            _ => return None,
        })
    }

    /// All states, for summary aggregation.
    pub fn all() -> [DownloadState; 9] {
        use DownloadState::*;
        [
            Queued,
            Starting,
            Downloading,
            Merging,
            Verifying,
            Paused,
            Completed,
            Failed,
            Cancelled,
        ]
    }
}

impl std::fmt::Display for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base priority of a download. Higher starts sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Priority {
    pub fn from_i64(v: i64) -> Priority {
        match v {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

/// A download row. Mutated only through the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub id: i64,
    /// Catalog item backing this download, when it came from the catalog
    pub catalog_id: Option<i64>,
    pub title: String,
    /// May be unresolved until `start_download` asks the catalog
    pub url: Option<String>,
    pub save_path: Option<PathBuf>,
    pub state: DownloadState,
    /// 0..1; equals downloaded/total when total is known
    pub progress: f64,
    pub downloaded_bytes: u64,
    /// 0 = unknown
    pub total_bytes: u64,
    pub priority: Priority,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub preserve_structure: bool,
    pub force_overwrite: bool,
    pub last_error: Option<String>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
    pub size_verified: bool,
    pub hash_verified: bool,
    /// Checkpoint for safe resume: hash of the stored tail window
    pub partial_tail_hash: Option<String>,
    pub partial_tail_size: u64,
    /// Last mutating state-version that touched this row
    pub version: u64,
}

impl Download {
    /// Origin hostname of the source URL, when resolved.
    pub fn host(&self) -> Option<String> {
        self.url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

/// Input accepted by `add_download`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDownload {
    pub catalog_id: Option<i64>,
    pub title: String,
    pub url: Option<String>,
    pub save_path: Option<PathBuf>,
    pub total_bytes: u64,
    pub priority: Option<Priority>,
    pub preserve_structure: bool,
    pub force_overwrite: bool,
    pub expected_hash: Option<String>,
    pub start_paused: bool,
}

/// Partial update applied to a download row. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct DownloadUpdate {
    pub url: Option<String>,
    pub save_path: Option<PathBuf>,
    pub progress: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub force_overwrite: Option<bool>,
    pub last_error: Option<Option<String>>,
    pub expected_hash: Option<Option<String>>,
    pub actual_hash: Option<Option<String>>,
    pub size_verified: Option<bool>,
    pub hash_verified: Option<bool>,
    pub partial_tail_hash: Option<Option<String>>,
    pub partial_tail_size: Option<u64>,
}

/// Per-chunk state for the ranged transfer path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Downloading,
    Completed,
    Failed,
    Paused,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Downloading => "downloading",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
            ChunkState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<ChunkState> {
        Some(match s {
            "pending" => ChunkState::Pending,
            "downloading" => ChunkState::Downloading,
            "completed" => ChunkState::Completed,
            "failed" => ChunkState::Failed,
            "paused" => ChunkState::Paused,
            _ => return None,
        })
    }
}

/// One byte range of a chunked download. Ranges are inclusive, contiguous
/// and non-overlapping across the chunks of one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub download_id: i64,
    pub index: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub state: ChunkState,
    pub downloaded_bytes: u64,
    pub temp_path: PathBuf,
    pub hash: Option<String>,
    pub hash_verified: bool,
    pub tail_hash: Option<String>,
    pub tail_size: u64,
    pub retry_count: u32,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Completed
    }
}

/// Partial update applied to a chunk row.
#[derive(Debug, Clone, Default)]
pub struct ChunkUpdate {
    pub state: Option<ChunkState>,
    pub downloaded_bytes: Option<u64>,
    pub hash: Option<Option<String>>,
    pub hash_verified: Option<bool>,
    pub tail_hash: Option<Option<String>>,
    pub tail_size: Option<u64>,
    pub retry_count: Option<u32>,
}

/// One transfer attempt, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub download_id: i64,
    pub chunk_index: Option<u32>,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub speed_bps: f64,
}

/// One recorded state transition, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub download_id: i64,
    pub old_state: DownloadState,
    pub new_state: DownloadState,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use DownloadState::*;
        assert!(Queued.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Merging));
        assert!(Downloading.can_transition_to(Verifying));
        assert!(Merging.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        use DownloadState::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Downloading));
            assert!(!terminal.can_transition_to(Paused));
        }
        // except explicit resume re-entry
        assert!(Failed.can_transition_to(Queued));
        assert!(Cancelled.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Queued));
    }

    #[test]
    fn test_pause_reachability() {
        use DownloadState::*;
        for from in [Queued, Starting, Downloading, Merging, Verifying] {
            assert!(from.can_transition_to(Paused), "{from} -> paused");
        }
        assert!(Paused.can_transition_to(Queued));
        assert!(!Paused.can_transition_to(Downloading));
    }

    #[test]
    fn test_transient_requeue() {
        use DownloadState::*;
        assert!(Downloading.can_transition_to(Queued));
        assert!(Starting.can_transition_to(Queued));
        assert!(!Merging.can_transition_to(Queued));
    }

    #[test]
    fn test_self_transition_rejected() {
        for s in DownloadState::all() {
            assert!(!s.can_transition_to(s));
        }
    }

    #[test]
    fn test_state_round_trip() {
        for s in DownloadState::all() {
            assert_eq!(DownloadState::parse(s.as_str()), Some(s));
        }
        assert_eq!(DownloadState::parse("bogus"), None);
    }

    #[test]
    fn test_chunk_size() {
        let chunk = Chunk {
            download_id: 1,
            index: 0,
            start_byte: 0,
            end_byte: 4999,
            state: ChunkState::Pending,
            downloaded_bytes: 0,
            temp_path: PathBuf::from("/tmp/.chunk.0"),
            hash: None,
            hash_verified: false,
            tail_hash: None,
            tail_size: 0,
            retry_count: 0,
        };
        assert_eq!(chunk.size(), 5000);
        assert!(!chunk.is_complete());
    }

    #[test]
    fn test_host_extraction() {
        let mut d = sample_download();
        d.url = Some("https://host.example/game.zip".to_string());
        assert_eq!(d.host().as_deref(), Some("host.example"));
        d.url = None;
        assert_eq!(d.host(), None);
    }

    fn sample_download() -> Download {
        Download {
            id: 1,
            catalog_id: None,
            title: "game.zip".into(),
            url: None,
            save_path: None,
            state: DownloadState::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            priority: Priority::Normal,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            preserve_structure: false,
            force_overwrite: false,
            last_error: None,
            expected_hash: None,
            actual_hash: None,
            size_verified: false,
            hash_verified: false,
            partial_tail_hash: None,
            partial_tail_size: 0,
            version: 0,
        }
    }
}
