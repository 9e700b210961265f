/// In-flight transport control
///
/// One `DownloadControl` per active transfer, shared between the engine and
/// the downloader tasks. Commands travel through an atomic signal the tasks
/// poll at every suspension point; progress flows back through an atomic
/// byte counter. The `DownloadManager` table owns the entries; cleanup is
/// idempotent and tolerates races with natural completion.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const SIGNAL_RUN: u8 = 0;
pub const SIGNAL_PAUSE: u8 = 1;
pub const SIGNAL_CANCEL: u8 = 2;
/// Internal abort (watchdog trip, sibling chunk failure); not user-visible.
pub const SIGNAL_ABORT: u8 = 3;

pub struct DownloadControl {
    /// 0=run, 1=pause, 2=cancel, 3=abort
    signal: AtomicU8,
    /// Cumulative bytes for the whole download
    pub downloaded_bytes: AtomicU64,
    /// Session token the transfer was spawned with
    pub token: Uuid,
}

impl DownloadControl {
    pub fn new(token: Uuid) -> Self {
        Self {
            signal: AtomicU8::new(SIGNAL_RUN),
            downloaded_bytes: AtomicU64::new(0),
            token,
        }
    }

    pub fn should_continue(&self) -> bool {
        self.signal.load(Ordering::Relaxed) == SIGNAL_RUN
    }

    pub fn signal(&self) -> u8 {
        self.signal.load(Ordering::Relaxed)
    }

    pub fn raise(&self, signal: u8) {
        self.signal.store(signal, Ordering::SeqCst);
    }

    pub fn add_bytes(&self, delta: u64) -> u64 {
        self.downloaded_bytes.fetch_add(delta, Ordering::Relaxed) + delta
    }
}

/// Table of live transfers keyed by download id.
#[derive(Default)]
pub struct DownloadManager {
    controls: Mutex<HashMap<i64, Arc<DownloadControl>>>,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: i64, control: Arc<DownloadControl>) {
        self.controls.lock().unwrap().insert(id, control);
    }

    pub fn get(&self, id: i64) -> Option<Arc<DownloadControl>> {
        self.controls.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: i64) {
        self.controls.lock().unwrap().remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.controls.lock().unwrap().len()
    }

    /// Raise a signal on a live transfer; true when one was present.
    pub fn raise(&self, id: i64, signal: u8) -> bool {
        match self.get(id) {
            Some(control) => {
                control.raise(signal);
                true
            }
            None => false,
        }
    }
}
