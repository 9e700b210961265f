/// Explicit counters for global active downloads and in-flight chunks
///
/// Modeled as countable permits rather than `tokio::sync::Semaphore` so the
/// caps can shrink at runtime: holders beyond a lowered cap drain naturally
/// on release, and releases never drive a counter below zero.
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner {
    global_active: usize,
    global_cap: usize,
    chunk_cap: usize,
    chunk_slots: HashMap<i64, usize>,
}

pub struct ConcurrencyController {
    inner: Mutex<Inner>,
}

impl ConcurrencyController {
    pub fn new(global_cap: usize, chunk_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global_active: 0,
                global_cap: global_cap.clamp(1, 3),
                chunk_cap: chunk_cap.clamp(1, 16),
                chunk_slots: HashMap::new(),
            }),
        }
    }

    pub fn acquire_global(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.global_active < inner.global_cap {
            inner.global_active += 1;
            true
        } else {
            false
        }
    }

    pub fn release_global(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.global_active = inner.global_active.saturating_sub(1);
    }

    pub fn global_active(&self) -> usize {
        self.inner.lock().unwrap().global_active
    }

    pub fn available_global_slots(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.global_cap.saturating_sub(inner.global_active)
    }

    pub fn acquire_chunk_slot(&self, download_id: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let cap = inner.chunk_cap;
        let held = inner.chunk_slots.entry(download_id).or_insert(0);
        if *held < cap {
            *held += 1;
            true
        } else {
            false
        }
    }

    pub fn release_chunk_slot(&self, download_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(held) = inner.chunk_slots.get_mut(&download_id) {
            *held = held.saturating_sub(1);
            if *held == 0 {
                inner.chunk_slots.remove(&download_id);
            }
        }
    }

    pub fn chunk_slots_held(&self, download_id: i64) -> usize {
        self.inner
            .lock()
            .unwrap()
            .chunk_slots
            .get(&download_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_max_global(&self, cap: usize) {
        self.inner.lock().unwrap().global_cap = cap.clamp(1, 3);
    }

    pub fn set_max_chunk_slots(&self, cap: usize) {
        self.inner.lock().unwrap().chunk_cap = cap.clamp(1, 16);
    }
}
