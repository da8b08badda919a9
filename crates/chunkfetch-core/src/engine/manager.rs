//! Download Manager - supervises all downloads
//!
//! This is the top-level coordinator that:
//! - Starts/pauses/resumes/cancels downloads by id
//! - Caps the number of active downloads, queueing the rest in arrival order
//! - Applies speed limits to live downloads
//! - Sends completion and failure notifications

use crate::engine::{
    DownloadTask, HttpTransport, LogNotifier, Notifications, Notifier, SlotPool, TaskOptions, Transport,
};
use crate::error::EngineError;
use bytes::Bytes;
use chunkfetch_types::{
    CoreEvent, DownloadId, DownloadInfo, DownloadSnapshot, DownloadState, EngineConfig, DEFAULT_CHUNK_SIZE,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Registry = Arc<RwLock<HashMap<DownloadId, Arc<DownloadTask>>>>;

/// Download manager that coordinates all downloads
pub struct DownloadManager {
    /// Registered downloads
    tasks: Registry,
    transport: Arc<dyn Transport>,
    /// Ceiling on active downloads
    slots: SlotPool,
    /// Defaults for downloads started from now on
    config: parking_lot::RwLock<EngineConfig>,
    notifications: Notifications,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
}

/// Handle to a started download
pub struct DownloadHandle {
    id: DownloadId,
    join: JoinHandle<Result<Bytes, EngineError>>,
}

impl DownloadHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the download to finish and take its payload
    pub async fn wait(self) -> Result<Bytes, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("download {} driver failed: {}", self.id, e)))?
    }
}

/// State a download's background driver needs
struct Driver {
    tasks: Registry,
    slots: SlotPool,
    notifications: Notifications,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl Driver {
    async fn drive(self, task: Arc<DownloadTask>) -> Result<Bytes, EngineError> {
        let id = task.id().to_string();

        let slot = match self.slots.try_acquire() {
            Some(slot) => Some(slot),
            None => {
                info!("Download {} queued, all {} slots busy", id, self.slots.max_slots());
                let _ = self.event_tx.send(CoreEvent::Queued { id: id.clone() });
                tokio::select! {
                    slot = self.slots.acquire() => Some(slot?),
                    _ = task.wait_for_state(|s| s == DownloadState::Cancelled) => None,
                }
            }
        };

        let result = match slot {
            Some(slot) => task.run(Some(slot)).await,
            None => Err(EngineError::Cancelled(id.clone())),
        };

        let title = &task.info().name;
        match &result {
            Ok(payload) => {
                info!("Download {} finished with {} bytes", id, payload.len());
                self.notifications.completed(title);
            }
            Err(e) if e.is_transfer_failure() => {
                error!("Download {} failed: {}", id, e);
                self.notifications.failed(title);
            }
            Err(e) => debug!("Download {} stopped: {}", id, e),
        }

        self.unregister(&task).await;
        result
    }

    async fn unregister(&self, task: &Arc<DownloadTask>) {
        let mut tasks = self.tasks.write().await;
        // A cancelled entry may already be gone, or replaced by a new start
        let registered = tasks.get(task.id()).is_some_and(|t| Arc::ptr_eq(t, task));
        if registered {
            tasks.remove(task.id());
            drop(tasks);
            let _ = self.event_tx.send(CoreEvent::Removed {
                id: task.id().to_string(),
            });
        }
    }
}

impl DownloadManager {
    /// Create a manager using HTTP and log notifications
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_parts(config, transport, Arc::new(LogNotifier)))
    }

    /// Create a manager from explicit parts.
    ///
    /// Notification permission is requested here, once.
    pub fn with_parts(mut config: EngineConfig, transport: Arc<dyn Transport>, notifier: Arc<dyn Notifier>) -> Self {
        if config.chunk_size == 0 {
            warn!("Chunk size 0 is not usable, falling back to {}", DEFAULT_CHUNK_SIZE);
            config.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        let (event_tx, _) = broadcast::channel(1000);
        let notifications = Notifications::negotiate(notifier);

        info!(
            "Download manager ready: {} concurrent, chunk size {}, speed limit {}",
            config.max_concurrent, config.chunk_size, config.speed_limit
        );

        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            transport,
            slots: SlotPool::new(config.max_concurrent),
            config: parking_lot::RwLock::new(config),
            notifications,
            event_tx,
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Current defaults
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Register and start a download.
    ///
    /// Returns as soon as the download is registered; it runs in the
    /// background once a slot is free.
    pub async fn start_download(&self, info: DownloadInfo) -> Result<DownloadHandle, EngineError> {
        url::Url::parse(&info.source_url)
            .map_err(|e| EngineError::InvalidUrl(format!("{}: {}", info.source_url, e)))?;

        let options = TaskOptions::from_config(&self.config.read());
        let id = info.id.clone();
        let task = Arc::new(DownloadTask::new(
            info,
            self.transport.clone(),
            self.event_tx.clone(),
            options,
        ));

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&id) {
                warn!("Download {} is already registered", id);
                return Err(EngineError::DuplicateId(id));
            }
            tasks.insert(id.clone(), task.clone());
        }
        info!("Registered download {}: {}", id, task.info().source_url);

        let driver = Driver {
            tasks: self.tasks.clone(),
            slots: self.slots.clone(),
            notifications: self.notifications.clone(),
            event_tx: self.event_tx.clone(),
        };
        let join = tokio::spawn(driver.drive(task));

        Ok(DownloadHandle { id, join })
    }

    async fn get(&self, id: &str) -> Result<Arc<DownloadTask>, EngineError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn registered(&self) -> Vec<Arc<DownloadTask>> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Pause a download and free its slot
    pub async fn pause_download(&self, id: &str) -> Result<(), EngineError> {
        let task = self.get(id).await?;
        task.pause()
    }

    /// Resume a paused download, queueing it if no slot is free
    pub async fn resume_download(&self, id: &str) -> Result<(), EngineError> {
        let task = self.get(id).await?;
        if task.state() != DownloadState::Paused {
            return task.resume();
        }

        if let Some(slot) = self.slots.try_acquire() {
            return task.resume_with(Some(slot));
        }

        info!("Download {} queued for resume", id);
        let _ = self.event_tx.send(CoreEvent::Queued { id: id.to_string() });
        let slots = self.slots.clone();
        tokio::spawn(async move {
            tokio::select! {
                slot = slots.acquire() => match slot {
                    Ok(slot) => {
                        if let Err(e) = task.resume_with(Some(slot)) {
                            debug!("Queued resume of {} dropped: {}", task.id(), e);
                        }
                    }
                    Err(e) => warn!("Queued resume of {} failed: {}", task.id(), e),
                },
                // Cancelled, or resumed by another call
                _ = task.wait_for_state(|s| s != DownloadState::Paused) => {}
            }
        });
        Ok(())
    }

    /// Cancel a download and remove it from the registry
    pub async fn cancel_download(&self, id: &str) -> Result<(), EngineError> {
        let task = self
            .tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if let Err(e) = task.cancel() {
            // Finished between lookup and cancel; still drop it from the registry
            debug!("Cancel of {} had no effect: {}", id, e);
        }
        let _ = self.event_tx.send(CoreEvent::Removed { id: id.to_string() });
        info!("Cancelled download {}", id);
        Ok(())
    }

    /// Change the ceiling on active downloads (at least 1)
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        self.config.write().max_concurrent = max_concurrent;
        self.slots.resize(max_concurrent);
    }

    /// Set the default speed limit and apply it to every registered download
    pub async fn set_speed_limit(&self, bytes_per_second: u64) {
        self.config.write().speed_limit = bytes_per_second;
        for task in self.registered().await {
            task.limiter().set_limit(bytes_per_second).await;
        }
        info!("Speed limit set to {} B/s", bytes_per_second);
    }

    /// Set the speed limit of one download
    pub async fn set_download_speed_limit(&self, id: &str, bytes_per_second: u64) -> Result<(), EngineError> {
        let task = self.get(id).await?;
        task.limiter().set_limit(bytes_per_second).await;
        info!("Speed limit of {} set to {} B/s", id, bytes_per_second);
        Ok(())
    }

    /// Pause every active download, returns how many were paused
    pub async fn pause_all(&self) -> usize {
        let mut paused = 0;
        for task in self.registered().await {
            if task.state() == DownloadState::Active && task.pause().is_ok() {
                paused += 1;
            }
        }
        paused
    }

    /// Resume every paused download, returns how many were resumed or queued
    pub async fn resume_all(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for task in self.registered().await {
            if task.state() == DownloadState::Paused {
                self.resume_download(task.id()).await?;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn snapshot(&self, id: &str) -> Result<DownloadSnapshot, EngineError> {
        let task = self.get(id).await?;
        Ok(task.snapshot().await)
    }

    /// Snapshots of all registered downloads, oldest first
    pub async fn list(&self) -> Vec<DownloadSnapshot> {
        let mut snapshots = Vec::new();
        for task in self.registered().await {
            snapshots.push(task.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Downloads currently transferring
    pub async fn active_count(&self) -> usize {
        self.registered()
            .await
            .iter()
            .filter(|t| t.state() == DownloadState::Active)
            .count()
    }

    /// Starts and resumes waiting for a slot
    pub fn queued_count(&self) -> usize {
        self.slots.waiting()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::notifier::recording::RecordingNotifier;
    use crate::engine::transport::mock::MockTransport;
    use crate::engine::{COMPLETE_BODY, FAILED_BODY};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn manager(transport: &Arc<MockTransport>, notifier: &Arc<RecordingNotifier>, max_concurrent: usize) -> DownloadManager {
        let config = EngineConfig {
            chunk_size: 1000,
            max_concurrent,
            progress_interval_ms: 50,
            ..EngineConfig::default()
        };
        DownloadManager::with_parts(config, transport.clone(), notifier.clone())
    }

    fn info(id: &str, transport: &MockTransport) -> DownloadInfo {
        DownloadInfo::new(id, format!("http://mock.local/{}.bin", id), transport.data().len() as u64)
            .with_name(format!("File {}", id))
    }

    fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_until_active(manager: &DownloadManager, active: usize, queued: usize) {
        for _ in 0..2000 {
            if manager.active_count().await == active && manager.queued_count() == queued {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "expected {} active / {} queued, got {} / {}",
            active,
            queued,
            manager.active_count().await,
            manager.queued_count()
        );
    }

    #[tokio::test]
    async fn test_completion_notifies_and_unregisters() {
        let transport = Arc::new(MockTransport::sequential(5_000));
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 3);
        let mut rx = manager.subscribe();

        let handle = assert_ok!(manager.start_download(info("a", &transport)).await);
        assert_eq!(handle.id(), "a");
        let payload = assert_ok!(handle.wait().await);

        assert_eq!(payload, transport.data());
        assert!(!manager.is_registered("a").await);
        assert_eq!(notifier.sent(), vec![("File a".to_string(), COMPLETE_BODY.to_string())]);

        let events = drain(&mut rx);
        assert!(events.contains(&CoreEvent::Completed {
            id: "a".into(),
            size: 5_000
        }));
        assert_eq!(events.last(), Some(&CoreEvent::Removed { id: "a".into() }));
    }

    #[tokio::test]
    async fn test_ceiling_queues_extra_starts() {
        let transport = Arc::new(MockTransport::sequential(3_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 3);
        let mut rx = manager.subscribe();

        let mut handles = Vec::new();
        for id in ["d1", "d2", "d3", "d4", "d5"] {
            handles.push(assert_ok!(manager.start_download(info(id, &transport)).await));
        }

        wait_until_active(&manager, 3, 2).await;
        let queued = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::Queued { .. }))
            .count();
        assert_eq!(queued, 2);

        transport.release();
        for handle in handles {
            assert_ok!(handle.wait().await);
        }
        assert!(manager.list().await.is_empty());
        assert_eq!(notifier.sent().len(), 5);
    }

    #[tokio::test]
    async fn test_range_failure_notifies_once() {
        let transport = Arc::new(MockTransport::sequential(5_000));
        transport.fail_range_at(2_000);
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 3);
        let mut rx = manager.subscribe();

        let handle = assert_ok!(manager.start_download(info("bad", &transport)).await);
        let error = assert_err!(handle.wait().await);

        assert!(matches!(error, EngineError::RangeFetchFailed { .. }));
        assert_eq!(notifier.sent(), vec![("File bad".to_string(), FAILED_BODY.to_string())]);
        assert!(!manager.is_registered("bad").await);

        let failures = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::Failed { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_invalid() {
        let transport = Arc::new(MockTransport::sequential(1_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 3);

        assert_ok!(manager.start_download(info("dup", &transport)).await);
        let duplicate = manager.start_download(info("dup", &transport)).await;
        assert!(matches!(duplicate, Err(EngineError::DuplicateId(id)) if id == "dup"));

        let invalid = DownloadInfo::new("bad-url", "not a url", 10);
        assert!(matches!(
            manager.start_download(invalid).await,
            Err(EngineError::InvalidUrl(_))
        ));
        assert_ok!(manager.cancel_download("dup").await);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let transport = Arc::new(MockTransport::sequential(10));
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 1);

        assert!(matches!(manager.pause_download("nope").await, Err(EngineError::NotFound(_))));
        assert!(matches!(manager.resume_download("nope").await, Err(EngineError::NotFound(_))));
        assert!(matches!(manager.cancel_download("nope").await, Err(EngineError::NotFound(_))));
        assert!(matches!(manager.snapshot("nope").await, Err(EngineError::NotFound(_))));
        assert!(matches!(
            manager.set_download_speed_limit("nope", 1).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_download() {
        let transport = Arc::new(MockTransport::sequential(2_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 1);

        let first = assert_ok!(manager.start_download(info("first", &transport)).await);
        let second = assert_ok!(manager.start_download(info("second", &transport)).await);
        wait_until_active(&manager, 1, 1).await;

        assert_ok!(manager.cancel_download("second").await);
        assert!(!manager.is_registered("second").await);
        assert!(matches!(second.wait().await, Err(EngineError::Cancelled(_))));
        assert_eq!(manager.queued_count(), 0);

        transport.release();
        assert_ok!(first.wait().await);
        // Cancel is not a failure
        assert_eq!(notifier.sent(), vec![("File first".to_string(), COMPLETE_BODY.to_string())]);
    }

    #[tokio::test]
    async fn test_pause_frees_slot_and_resume_queues() {
        let transport = Arc::new(MockTransport::sequential(2_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 1);

        let a = assert_ok!(manager.start_download(info("a", &transport)).await);
        wait_until_active(&manager, 1, 0).await;
        let b = assert_ok!(manager.start_download(info("b", &transport)).await);
        wait_until_active(&manager, 1, 1).await;

        assert_ok!(manager.pause_download("a").await);
        wait_until_active(&manager, 1, 0).await;
        assert_eq!(assert_ok!(manager.snapshot("b").await).state, DownloadState::Active);

        assert_ok!(manager.resume_download("a").await);
        wait_until_active(&manager, 1, 1).await;
        assert_eq!(assert_ok!(manager.snapshot("a").await).state, DownloadState::Paused);

        transport.release();
        assert_ok!(b.wait().await);
        assert_eq!(assert_ok!(a.wait().await), transport.data());
    }

    #[tokio::test]
    async fn test_growing_ceiling_admits_queued() {
        let transport = Arc::new(MockTransport::sequential(1_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 1);

        assert_ok!(manager.start_download(info("a", &transport)).await);
        assert_ok!(manager.start_download(info("b", &transport)).await);
        wait_until_active(&manager, 1, 1).await;

        manager.set_max_concurrent(2);
        wait_until_active(&manager, 2, 0).await;
        assert_eq!(manager.config().max_concurrent, 2);

        assert_eq!(manager.pause_all().await, 2);
        assert_eq!(assert_ok!(manager.resume_all().await), 2);
        wait_until_active(&manager, 2, 0).await;
    }

    #[tokio::test]
    async fn test_speed_limit_reaches_registered_downloads() {
        let transport = Arc::new(MockTransport::sequential(1_000));
        transport.hold_all();
        let notifier = Arc::new(RecordingNotifier::permitted());
        let manager = manager(&transport, &notifier, 2);

        assert_ok!(manager.start_download(info("a", &transport)).await);
        manager.set_speed_limit(5_000).await;
        assert_eq!(assert_ok!(manager.snapshot("a").await).speed_limit, 5_000);

        assert_ok!(manager.start_download(info("b", &transport)).await);
        assert_eq!(assert_ok!(manager.snapshot("b").await).speed_limit, 5_000);

        assert_ok!(manager.set_download_speed_limit("b", 0).await);
        assert_eq!(assert_ok!(manager.snapshot("b").await).speed_limit, 0);
        assert_eq!(manager.config().speed_limit, 5_000);
    }

    #[tokio::test]
    async fn test_denied_permission_sends_nothing() {
        let transport = Arc::new(MockTransport::sequential(1_000));
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = manager(&transport, &notifier, 1);

        let handle = assert_ok!(manager.start_download(info("quiet", &transport)).await);
        assert_ok!(handle.wait().await);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_falls_back_to_default() {
        let transport = Arc::new(MockTransport::sequential(3_000));
        let notifier = Arc::new(RecordingNotifier::default());
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        let manager = DownloadManager::with_parts(config, transport.clone(), notifier);
        assert_eq!(manager.config().chunk_size, DEFAULT_CHUNK_SIZE);

        let handle = assert_ok!(manager.start_download(info("z", &transport)).await);
        let payload = assert_ok!(tokio::time::timeout(Duration::from_secs(5), handle.wait()).await);
        assert_eq!(assert_ok!(payload), transport.data());
    }
}
