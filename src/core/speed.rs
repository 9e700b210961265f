/// Per-download throughput tracking
///
/// Exponential moving average of bytes/s plus an ETA derived from it.
/// `ensure_tracking` seeds the baseline on resume so the first delta covers
/// only the resumed session, not the whole history.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SpeedSample {
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
}

struct Entry {
    session_start: Instant,
    session_downloaded: u64,
    last_update: Instant,
    last_downloaded: u64,
    ema_bps: f64,
}

pub struct SpeedTracker {
    entries: Mutex<HashMap<i64, Entry>>,
    /// EMA smoothing factor
    alpha: f64,
    /// Updates closer together than this are folded into the next one
    min_delta_secs: f64,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(0.3, 0.1)
    }
}

impl SpeedTracker {
    pub fn new(alpha: f64, min_delta_secs: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            alpha,
            min_delta_secs,
        }
    }

    /// Seed tracking for a (possibly resumed) transfer. Existing state for
    /// the id is kept, so repeated calls are harmless.
    pub fn ensure_tracking(&self, id: i64, initial_downloaded: u64) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(id).or_insert_with(|| Entry {
            session_start: Instant::now(),
            session_downloaded: 0,
            last_update: Instant::now(),
            last_downloaded: initial_downloaded,
            ema_bps: 0.0,
        });
    }

    /// Record a new cumulative byte count and return the smoothed speed.
    pub fn update(&self, id: i64, downloaded_bytes: u64, total_bytes: u64) -> SpeedSample {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(id).or_insert_with(|| Entry {
            session_start: Instant::now(),
            session_downloaded: 0,
            last_update: Instant::now(),
            last_downloaded: downloaded_bytes,
            ema_bps: 0.0,
        });

        let elapsed = entry.last_update.elapsed().as_secs_f64();
        if elapsed >= self.min_delta_secs {
            let delta = downloaded_bytes.saturating_sub(entry.last_downloaded) as f64;
            let instant_bps = delta / elapsed;
            entry.ema_bps = if entry.ema_bps == 0.0 {
                instant_bps
            } else {
                self.alpha * instant_bps + (1.0 - self.alpha) * entry.ema_bps
            };
            entry.session_downloaded += delta as u64;
            entry.last_update = Instant::now();
            entry.last_downloaded = downloaded_bytes;
        }

        let speed = entry.ema_bps.max(0.0);
        let eta_seconds = if speed > 0.0 && total_bytes > downloaded_bytes {
            Some(((total_bytes - downloaded_bytes) as f64 / speed).ceil() as u64)
        } else {
            None
        };
        SpeedSample {
            speed_bps: speed,
            eta_seconds,
        }
    }

    pub fn session_elapsed_secs(&self, id: i64) -> Option<f64> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .map(|e| e.session_start.elapsed().as_secs_f64())
    }

    pub fn remove(&self, id: i64) {
        self.entries.lock().unwrap().remove(&id);
    }
}
