pub mod breaker;
pub mod chunked;
pub mod client;
pub mod headers;
pub mod simple;

use crate::config::EngineConfig;
use crate::core::assembler::FileAssembler;
use crate::core::chunk_store::ChunkStore;
use crate::core::events::EventBus;
use crate::core::metrics::DownloadMetrics;
use crate::core::semaphores::ConcurrencyController;
use crate::core::session::SessionManager;
use crate::core::speed::SpeedTracker;
use crate::core::store::StateStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Shared collaborators a downloader needs while a transfer is in flight.
/// Owned by the engine; downloaders borrow it for the duration of a run.
pub struct TransferDeps {
    pub store: Arc<StateStore>,
    pub chunk_store: Arc<ChunkStore>,
    pub assembler: Arc<FileAssembler>,
    pub sessions: Arc<SessionManager>,
    pub speed: Arc<SpeedTracker>,
    pub metrics: Arc<DownloadMetrics>,
    pub breaker: Arc<breaker::CircuitBreaker>,
    pub semaphores: Arc<ConcurrencyController>,
    pub events: EventBus,
    pub transfer_client: reqwest::Client,
    pub metadata_client: reqwest::Client,
    pub config: Arc<RwLock<EngineConfig>>,
}

impl TransferDeps {
    pub fn config_snapshot(&self) -> EngineConfig {
        self.config.read().unwrap().clone()
    }
}

/// How a downloader run ended when it did not error.
#[derive(Debug)]
pub enum TransferOutcome {
    Completed,
    Paused,
    Cancelled,
    /// Server asked us to back off; re-queue and reprocess after the delay.
    RetryAfter(Duration),
}
