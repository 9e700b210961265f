/// Engine configuration surface
///
/// Every knob recognized by the engine, grouped the way the subsystems
/// consume them. All groups have serde round-trip support so the host can
/// persist overrides; `EngineConfig::default()` is the documented baseline.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level download limits and cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Global concurrent download ceiling, clamped to 1..=3
    pub max_concurrent: usize,
    /// Per-origin ceiling, clamped to 1..=max_concurrent
    pub max_concurrent_per_host: usize,
    pub max_retries: u32,
    pub progress_update_interval_ms: u64,
    /// Store persistence cadence for progress counters
    pub persist_interval_ms: u64,
    pub max_queue_batch_size: usize,
    pub max_queue_size: usize,
    pub queue_process_delay_ms: u64,
    pub max_files_per_folder: usize,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_concurrent_per_host: 1,
            max_retries: 3,
            progress_update_interval_ms: 500,
            persist_interval_ms: 1000,
            max_queue_batch_size: 20,
            max_queue_size: 1000,
            queue_process_delay_ms: 2000,
            max_files_per_folder: 1000,
        }
    }
}

/// Chunk-count band: files under `medium_range_max` get medium counts,
/// larger files get large counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConfig {
    pub medium_range_max: u64,
    pub count_medium_min: u32,
    pub count_medium_max: u32,
    pub size_medium_target: u64,
    pub count_large_min: u32,
    pub count_large_max: u32,
    pub size_large_base: u64,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            medium_range_max: 500 * 1024 * 1024,
            count_medium_min: 4,
            count_medium_max: 8,
            size_medium_target: 8 * 1024 * 1024,
            count_large_min: 8,
            count_large_max: 16,
            size_large_base: 32 * 1024 * 1024,
        }
    }
}

/// Chunked-transfer strategy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedConfig {
    pub enabled: bool,
    pub force_simple_download: bool,
    /// Files at or above this size are eligible for chunking
    pub size_threshold_bytes: u64,
    pub max_chunks: u32,
    pub use_band_strategy: bool,
    pub band: BandConfig,
    /// Fallback size->chunk-size table when the band strategy is off:
    /// (max_total_bytes, chunk_size) rows, scanned in order
    pub range_table: Vec<(u64, u64)>,
    /// In-flight chunks per download, clamped to 1..=16
    pub max_concurrent_chunks: usize,
    pub max_chunk_retries: u32,
    pub chunk_operation_timeout_minutes: u64,
    pub check_range_support: bool,
    pub range_support_timeout_ms: u64,
    pub adaptive_concurrency: bool,
    pub adaptive_concurrency_config: AdaptiveConfig,
}

impl Default for ChunkedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_simple_download: false,
            size_threshold_bytes: 50 * 1024 * 1024,
            max_chunks: 16,
            use_band_strategy: true,
            band: BandConfig::default(),
            range_table: vec![
                (100 * 1024 * 1024, 8 * 1024 * 1024),
                (1024 * 1024 * 1024, 16 * 1024 * 1024),
                (u64::MAX, 64 * 1024 * 1024),
            ],
            max_concurrent_chunks: 4,
            max_chunk_retries: 5,
            chunk_operation_timeout_minutes: 30,
            check_range_support: true,
            range_support_timeout_ms: 15_000,
            adaptive_concurrency: true,
            adaptive_concurrency_config: AdaptiveConfig::default(),
        }
    }
}

/// Network timeouts and retry pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// Idle watchdog trip: no bytes for this long aborts the transfer
    pub idle_timeout_ms: u64,
    /// Watchdog poll cadence
    pub idle_check_interval_ms: u64,
    pub head_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub retry_after_429_default_ms: u64,
    pub retry_after_503_default_ms: u64,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            response_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            idle_check_interval_ms: 5_000,
            head_timeout_ms: 15_000,
            retry_delay_ms: 1_000,
            max_retries: 3,
            retry_after_429_default_ms: 60_000,
            retry_after_503_default_ms: 30_000,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

/// Queue-ordering knobs: aging, SJF tiebreak and retry penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderingConfig {
    pub aging_interval_secs: u64,
    pub max_aging_bonus: f64,
    pub low_priority_multiplier: f64,
    pub sjf_enabled: bool,
    /// 0..1; >= 0.5 makes size the sole tiebreak at equal priority
    pub sjf_weight: f64,
    /// Sizes within this percentage are treated as equal
    pub sjf_tolerance_percent: f64,
    /// Assumed size for downloads without a known total
    pub sjf_default_size: u64,
    pub retry_penalty_enabled: bool,
    pub penalty_per_retry: f64,
    pub max_retry_penalty: f64,
    pub free_retries: u32,
    /// Per-host token bucket: requests per window; turbo disables it
    pub host_rate_limit: u32,
    pub host_rate_window_ms: u64,
    pub turbo: bool,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            aging_interval_secs: 60,
            max_aging_bonus: 2.0,
            low_priority_multiplier: 1.5,
            sjf_enabled: true,
            sjf_weight: 0.5,
            sjf_tolerance_percent: 10.0,
            sjf_default_size: 100 * 1024 * 1024,
            retry_penalty_enabled: true,
            penalty_per_retry: 0.5,
            max_retry_penalty: 2.0,
            free_retries: 1,
            host_rate_limit: 10,
            host_rate_window_ms: 60_000,
            turbo: false,
        }
    }
}

/// Adaptive concurrency controller thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub window_ms: u64,
    pub evaluate_interval_ms: u64,
    pub cooldown_ms: u64,
    pub scale_down_error_rate_min: f64,
    pub scale_down_transient_retry_threshold: u64,
    /// Fraction of observed peak throughput below which we scale down
    pub throughput_drop_threshold: f64,
    pub scale_up_min_samples: u64,
    pub scale_up_error_rate_max: f64,
    pub scale_up_min_throughput_bps: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_ms: 90_000,
            evaluate_interval_ms: 15_000,
            cooldown_ms: 30_000,
            scale_down_error_rate_min: 0.2,
            scale_down_transient_retry_threshold: 4,
            throughput_drop_threshold: 0.4,
            scale_up_min_samples: 2,
            scale_up_error_rate_max: 0.05,
            scale_up_min_throughput_bps: 256.0 * 1024.0,
        }
    }
}

/// Assembler buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    pub buffer_size: usize,
    pub max_pooled: usize,
    pub pre_allocate: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024 * 1024,
            max_pooled: 4,
            pre_allocate: false,
        }
    }
}

/// Everything the engine recognizes, in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub downloads: DownloadsConfig,
    pub chunked: ChunkedConfig,
    pub network: NetworkConfig,
    pub ordering: OrderingConfig,
    pub buffer_pool: BufferPoolConfig,
    /// Skip post-transfer verification entirely
    pub skip_verification: bool,
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network.idle_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.downloads.progress_update_interval_ms)
    }

    /// Clamp interdependent limits into their documented ranges.
    pub fn normalize(&mut self) {
        self.downloads.max_concurrent = self.downloads.max_concurrent.clamp(1, 3);
        self.downloads.max_concurrent_per_host = self
            .downloads
            .max_concurrent_per_host
            .clamp(1, self.downloads.max_concurrent);
        self.chunked.max_concurrent_chunks = self.chunked.max_concurrent_chunks.clamp(1, 16);
        if self.chunked.max_chunks == 0 {
            self.chunked.max_chunks = 1;
        }
    }
}

/// Runtime overrides accepted by `set_download_config_overrides`; `None`
/// leaves the current value in place. Persisted to the store's settings
/// table so they survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub max_parallel: Option<usize>,
    pub max_chunks_per_download: Option<usize>,
    pub retry_count: Option<u32>,
    pub chunk_operation_timeout_minutes: Option<u64>,
    pub skip_verification: Option<bool>,
    pub disable_chunked: Option<bool>,
    pub turbo: Option<bool>,
}

impl ConfigOverrides {
    /// Apply onto a config, clamping as `normalize` would.
    pub fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(n) = self.max_parallel {
            cfg.downloads.max_concurrent = n;
        }
        if let Some(n) = self.max_chunks_per_download {
            cfg.chunked.max_concurrent_chunks = n;
        }
        if let Some(n) = self.retry_count {
            cfg.downloads.max_retries = n;
        }
        if let Some(n) = self.chunk_operation_timeout_minutes {
            cfg.chunked.chunk_operation_timeout_minutes = n;
        }
        if let Some(v) = self.skip_verification {
            cfg.skip_verification = v;
        }
        if let Some(v) = self.disable_chunked {
            cfg.chunked.enabled = !v;
        }
        if let Some(v) = self.turbo {
            cfg.ordering.turbo = v;
        }
        cfg.normalize();
    }
}
