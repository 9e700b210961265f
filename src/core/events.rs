use galleon_shared::{ConflictInfo, EngineEvent};
/// Debounced notification channel to external observers
///
/// Observers subscribe to a broadcast channel; the engine never holds
/// references to them. `state_changed` is coalesced over a small window and
/// flushed once with the latest version; everything else is emitted
/// immediately. Send errors (no receivers) are ignored.
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    debounce_window: Duration,
    /// Latest version awaiting flush; `Some` means a flusher is scheduled.
    pending_version: Arc<Mutex<Option<u64>>>,
}

impl EventBus {
    pub fn new(debounce_window: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            debounce_window,
            pending_version: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: EngineEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    /// Coalesce state-change notifications: the first call in a window
    /// schedules a flush, later calls only raise the pending version.
    pub fn emit_state_changed(&self, version: u64) {
        {
            let mut pending = self.pending_version.lock().unwrap();
            if let Some(v) = pending.as_mut() {
                *v = (*v).max(version);
                return;
            }
            *pending = Some(version);
        }

        let tx = self.tx.clone();
        let pending = self.pending_version.clone();
        let window = self.debounce_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let version = pending.lock().unwrap().take();
            if let Some(version) = version {
                let _ = tx.send(EngineEvent::StateChanged { version });
            }
        });
    }

    pub fn emit_download_progress(
        &self,
        id: i64,
        downloaded_bytes: u64,
        total_bytes: u64,
        progress: f64,
        speed_bps: f64,
        eta_seconds: Option<u64>,
    ) {
        self.send(EngineEvent::DownloadProgress {
            id,
            downloaded_bytes,
            total_bytes,
            progress,
            speed_bps,
            eta_seconds,
        });
    }

    pub fn emit_download_completed(&self, id: i64, path: String) {
        self.send(EngineEvent::DownloadCompleted { id, path });
    }

    pub fn emit_download_failed(&self, id: i64, error: String, failed_during_merge: bool) {
        self.send(EngineEvent::DownloadFailed {
            id,
            error,
            failed_during_merge,
        });
    }

    pub fn emit_chunk_completed(&self, id: i64, chunk_index: u32) {
        self.send(EngineEvent::ChunkCompleted { id, chunk_index });
    }

    pub fn emit_chunk_failed(&self, id: i64, chunk_index: u32, error: String) {
        self.send(EngineEvent::ChunkFailed {
            id,
            chunk_index,
            error,
        });
    }

    pub fn emit_merge_started(&self, id: i64) {
        self.send(EngineEvent::MergeStarted { id });
    }

    pub fn emit_verification_started(&self, id: i64) {
        self.send(EngineEvent::VerificationStarted { id });
    }

    pub fn emit_needs_confirmation(&self, info: ConflictInfo) {
        self.send(EngineEvent::NeedsConfirmation { info });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_state_changed_coalesces_to_latest() {
        let bus = EventBus::new(Duration::from_millis(20));
        let mut rx = bus.subscribe();

        bus.emit_state_changed(1);
        bus.emit_state_changed(2);
        bus.emit_state_changed(5);

        let event = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::StateChanged { version } => assert_eq!(version, 5),
            other => panic!("unexpected event {other:?}"),
        }

        // nothing else queued
        assert!(timeout(Duration::from_millis(60), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_windows_flush_independently() {
        let bus = EventBus::new(Duration::from_millis(10));
        let mut rx = bus.subscribe();

        bus.emit_state_changed(1);
        let first = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        bus.emit_state_changed(2);
        let second = timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(first, EngineEvent::StateChanged { version: 1 }));
        assert!(matches!(second, EngineEvent::StateChanged { version: 2 }));
    }

    #[tokio::test]
    async fn test_immediate_events_pass_through_in_order() {
        let bus = EventBus::new(Duration::from_millis(50));
        let mut rx = bus.subscribe();

        bus.emit_merge_started(7);
        bus.emit_verification_started(7);
        bus.emit_download_completed(7, "/downloads/game.zip".into());

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::MergeStarted { id: 7 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::VerificationStarted { id: 7 }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::DownloadCompleted { id: 7, .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new(Duration::from_millis(10));
        bus.emit_download_failed(1, "boom".into(), false);
        bus.emit_state_changed(3);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
