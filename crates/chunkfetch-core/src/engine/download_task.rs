//! Download task - one file transfer and its state machine
//!
//! A task probes the remote size, plans byte ranges and fetches all of them
//! concurrently. Arrivals land in a [`ChunkBuffer`] in any order; once every
//! byte is present the buffer is assembled into the final payload.
//!
//! Pause cancels the in-flight fetches and keeps the buffer. Resume issues
//! fetches only for the gaps. Cancel throws everything away, after which
//! `start()` runs a fresh transfer.

use crate::engine::{ChunkBuffer, ChunkScheduler, ProgressReporter, SlotGuard, SpeedLimiter, Transport};
use crate::error::{EngineError, FetchFailure};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use chunkfetch_types::{
    percent, ByteRange, CoreEvent, DownloadInfo, DownloadSnapshot, DownloadState, EngineConfig, ProgressEvent,
    DEFAULT_CHUNK_SIZE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-task settings taken from the engine configuration
#[derive(Debug, Clone, Copy)]
pub struct TaskOptions {
    pub chunk_size: u64,
    /// Bytes per second, 0 = unlimited
    pub speed_limit: u64,
    pub progress_interval: Duration,
}

impl TaskOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            speed_limit: config.speed_limit,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        }
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// A single download
pub struct DownloadTask {
    info: DownloadInfo,
    transport: Arc<dyn Transport>,
    scheduler: ChunkScheduler,
    limiter: SpeedLimiter,
    reporter: ProgressReporter,
    event_tx: broadcast::Sender<CoreEvent>,
    inner: Mutex<TaskInner>,
    /// Mirrors `inner.state` for async waiters
    state_tx: watch::Sender<DownloadState>,
    created_at: DateTime<Utc>,
}

struct TaskInner {
    state: DownloadState,
    /// Probed size of the current run, 0 until the probe succeeds
    total_size: u64,
    buffer: ChunkBuffer,
    downloaded: u64,
    /// Cancellation handle per in-flight range, keyed by range start
    in_flight: HashMap<u64, CancellationToken>,
    run_token: CancellationToken,
    /// Bumped by every `start()`; results from older runs are dropped
    generation: u64,
    /// A `start()` call is in progress
    running: bool,
    started_at: Option<Instant>,
    slot: Option<SlotGuard>,
    error: Option<EngineError>,
    completed_at: Option<DateTime<Utc>>,
    payload: Option<Bytes>,
}

impl TaskInner {
    fn new() -> Self {
        Self {
            state: DownloadState::Planning,
            total_size: 0,
            buffer: ChunkBuffer::new(),
            downloaded: 0,
            in_flight: HashMap::new(),
            run_token: CancellationToken::new(),
            generation: 0,
            running: false,
            started_at: None,
            slot: None,
            error: None,
            completed_at: None,
            payload: None,
        }
    }

    fn cancel_in_flight(&mut self) -> usize {
        let count = self.in_flight.len();
        for (_, token) in self.in_flight.drain() {
            token.cancel();
        }
        count
    }
}

/// Clears `running` when a run returns or is dropped
struct RunGuard<'a>(&'a Mutex<TaskInner>);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().running = false;
    }
}

/// How a single range fetch ended
enum FetchOutcome {
    Fetched(Bytes),
    Aborted,
    Failed(FetchFailure),
}

impl DownloadTask {
    pub fn new(
        info: DownloadInfo,
        transport: Arc<dyn Transport>,
        event_tx: broadcast::Sender<CoreEvent>,
        options: TaskOptions,
    ) -> Self {
        let chunk_size = if options.chunk_size == 0 {
            warn!("Download {}: chunk size 0 is not usable, using {}", info.id, DEFAULT_CHUNK_SIZE);
            DEFAULT_CHUNK_SIZE
        } else {
            options.chunk_size
        };
        let limiter = if options.speed_limit > 0 {
            SpeedLimiter::new(options.speed_limit)
        } else {
            SpeedLimiter::unlimited()
        };

        Self {
            info,
            transport,
            scheduler: ChunkScheduler::new(chunk_size),
            limiter,
            reporter: ProgressReporter::new(event_tx.clone(), options.progress_interval),
            event_tx,
            inner: Mutex::new(TaskInner::new()),
            state_tx: watch::channel(DownloadState::Planning).0,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &DownloadInfo {
        &self.info
    }

    pub fn state(&self) -> DownloadState {
        self.inner.lock().state
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.inner.lock().downloaded
    }

    /// Bytes currently held in the chunk buffer
    pub fn buffered_bytes(&self) -> u64 {
        self.inner.lock().buffer.stored_bytes()
    }

    /// Probed size, or the declared size before the probe
    pub fn total_size(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.total_size > 0 {
            inner.total_size
        } else {
            self.info.declared_size
        }
    }

    /// Live speed-limit hook
    pub fn limiter(&self) -> &SpeedLimiter {
        &self.limiter
    }

    pub async fn snapshot(&self) -> DownloadSnapshot {
        let speed_limit = self.limiter.limit().await;
        let total = self.total_size();
        let inner = self.inner.lock();

        DownloadSnapshot {
            id: self.info.id.clone(),
            name: self.info.name.clone(),
            version: self.info.version.clone(),
            state: inner.state,
            downloaded: inner.downloaded,
            total,
            speed_limit,
            created_at: self.created_at,
            completed_at: inner.completed_at,
            error: inner.error.as_ref().map(ToString::to_string),
        }
    }

    /// Wait until the state satisfies `predicate` and return it
    pub async fn wait_for_state(&self, mut predicate: impl FnMut(DownloadState) -> bool) -> DownloadState {
        let mut rx = self.state_tx.subscribe();
        let result = rx.wait_for(|state| predicate(*state)).await.map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Run the transfer to the end and return the assembled payload.
    ///
    /// Allowed on a fresh, cancelled or failed task that is not already
    /// running. A paused run stays inside this call until it is resumed or
    /// cancelled.
    pub async fn start(&self) -> Result<Bytes, EngineError> {
        self.run(None).await
    }

    /// `start()` holding a concurrency slot, released when the task leaves `Active`
    pub(crate) async fn run(&self, slot: Option<SlotGuard>) -> Result<Bytes, EngineError> {
        let (generation, run_token) = self.begin_run(slot)?;
        let _running = RunGuard(&self.inner);
        info!("Starting download {}: {}", self.info.id, self.info.source_url);

        let probed = tokio::select! {
            biased;
            _ = run_token.cancelled() => return Err(self.cancelled_error()),
            result = self.transport.probe_size(&self.info.source_url) => result,
        };
        let total_size = match probed {
            Ok(0) => Err(FetchFailure::MissingLength),
            other => other,
        };
        let total_size = match total_size {
            Ok(size) => size,
            Err(reason) => {
                let error = EngineError::ProbeFailed {
                    url: self.info.source_url.clone(),
                    reason,
                };
                self.fail(generation, error.clone());
                return Err(self.outcome_error(generation, error));
            }
        };

        self.activate(generation, total_size)?;

        loop {
            self.run_wave(generation, &run_token).await;

            let state = {
                let inner = self.inner.lock();
                if inner.generation != generation {
                    return Err(self.cancelled_error());
                }
                match inner.state {
                    DownloadState::Completed => return Ok(inner.payload.clone().unwrap_or_default()),
                    DownloadState::Failed => {
                        return Err(inner
                            .error
                            .clone()
                            .unwrap_or_else(|| EngineError::Internal("failed without an error".to_string())))
                    }
                    DownloadState::Cancelled | DownloadState::Planning => return Err(self.cancelled_error()),
                    state => state,
                }
            };

            if state == DownloadState::Paused {
                debug!("Download {} paused, waiting for resume", self.info.id);
                self.wait_for_state(|s| s != DownloadState::Paused).await;
            }
        }
    }

    /// Pause an active download, keeping what has been buffered
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            DownloadState::Active => {}
            DownloadState::Paused => return Ok(()),
            state => {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot pause download {} while {}",
                    self.info.id, state
                )))
            }
        }

        let aborted = inner.cancel_in_flight();
        inner.slot = None;
        self.transition(&mut inner, DownloadState::Paused);
        info!(
            "Paused download {} ({} fetches aborted, {} bytes kept)",
            self.info.id,
            aborted,
            inner.buffer.stored_bytes()
        );
        Ok(())
    }

    /// Resume a paused download; only the missing ranges are fetched again
    pub fn resume(&self) -> Result<(), EngineError> {
        self.resume_with(None)
    }

    pub(crate) fn resume_with(&self, slot: Option<SlotGuard>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            DownloadState::Paused => {}
            DownloadState::Active => return Ok(()),
            state => {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot resume download {} while {}",
                    self.info.id, state
                )))
            }
        }

        inner.slot = slot;
        self.transition(&mut inner, DownloadState::Active);
        info!("Resumed download {}", self.info.id);
        Ok(())
    }

    /// Abort the download and drop every buffered byte
    pub fn cancel(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        match inner.state {
            DownloadState::Cancelled => return Ok(()),
            DownloadState::Completed => {
                return Err(EngineError::InvalidOperation(format!(
                    "download {} already completed",
                    self.info.id
                )))
            }
            _ => {}
        }

        inner.run_token.cancel();
        let aborted = inner.cancel_in_flight();
        inner.buffer.clear();
        inner.downloaded = 0;
        inner.slot = None;
        inner.error = None;
        self.reporter.discard_pending();
        self.reporter.finish([]);
        self.transition(&mut inner, DownloadState::Cancelled);
        info!("Cancelled download {} ({} fetches aborted)", self.info.id, aborted);
        Ok(())
    }

    fn begin_run(&self, slot: Option<SlotGuard>) -> Result<(u64, CancellationToken), EngineError> {
        let mut inner = self.inner.lock();
        if inner.running {
            return Err(EngineError::InvalidOperation(format!(
                "download {} is already running",
                self.info.id
            )));
        }
        match inner.state {
            DownloadState::Planning => {}
            DownloadState::Cancelled | DownloadState::Failed => {
                debug!("Restarting download {} from scratch", self.info.id);
                inner.buffer.clear();
                inner.downloaded = 0;
                inner.total_size = 0;
                inner.error = None;
                inner.payload = None;
                inner.completed_at = None;
                inner.started_at = None;
                inner.in_flight.clear();
                self.transition(&mut inner, DownloadState::Planning);
            }
            state => {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot start download {} while {}",
                    self.info.id, state
                )))
            }
        }

        inner.generation += 1;
        inner.running = true;
        inner.run_token = CancellationToken::new();
        inner.slot = slot;
        self.reporter.reset();
        Ok((inner.generation, inner.run_token.clone()))
    }

    fn activate(&self, generation: u64, total_size: u64) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != DownloadState::Planning {
            return Err(self.cancelled_error());
        }

        if self.info.declared_size > 0 && total_size != self.info.declared_size {
            warn!(
                "Download {}: probed size {} differs from declared {}, using probed size",
                self.info.id, total_size, self.info.declared_size
            );
        }
        inner.total_size = total_size;
        inner.started_at = Some(Instant::now());
        self.transition(&mut inner, DownloadState::Active);
        info!(
            "Download {} active: {} bytes in chunks of {}",
            self.info.id,
            total_size,
            self.scheduler.chunk_size()
        );
        Ok(())
    }

    /// Issue every missing range and wait for all of them to settle
    async fn run_wave(&self, generation: u64, run_token: &CancellationToken) {
        let work = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != DownloadState::Active {
                return;
            }

            let total = inner.total_size;
            let ranges = self.scheduler.work_list(total, &inner.buffer.retrieved());
            if ranges.is_empty() && inner.buffer.is_complete(total) {
                let event = self.progress_event(&inner);
                self.complete(&mut inner, event);
                return;
            }

            ranges
                .into_iter()
                .map(|range| {
                    let token = run_token.child_token();
                    inner.in_flight.insert(range.start, token.clone());
                    (range, token)
                })
                .collect::<Vec<_>>()
        };
        if work.is_empty() {
            // Bytes missing but nothing left to fetch
            self.fail(
                generation,
                EngineError::Internal(format!("no ranges planned for incomplete download {}", self.info.id)),
            );
            return;
        }
        debug!("Download {}: issuing {} ranges", self.info.id, work.len());

        let mut fetches = JoinSet::new();
        for (range, token) in work {
            let transport = self.transport.clone();
            let limiter = self.limiter.clone();
            let url = self.info.source_url.clone();
            fetches.spawn(async move {
                let outcome = fetch_range(transport, limiter, url, range, token).await;
                (range, outcome)
            });
        }

        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok((range, FetchOutcome::Fetched(payload))) => self.accept(generation, range, payload),
                Ok((range, FetchOutcome::Aborted)) => {
                    debug!("Download {}: fetch of {} aborted", self.info.id, range);
                }
                Ok((range, FetchOutcome::Failed(reason))) => {
                    self.fail(generation, EngineError::RangeFetchFailed { range, reason });
                }
                Err(e) => {
                    self.fail(generation, EngineError::Internal(format!("range fetch task failed: {}", e)));
                }
            }
        }
    }

    /// Store an arrival and report progress; completes the task on full coverage
    fn accept(&self, generation: u64, range: ByteRange, payload: Bytes) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(&range.start);
        if inner.generation != generation || inner.state != DownloadState::Active {
            debug!(
                "Download {}: discarding {} received while {}",
                self.info.id, range, inner.state
            );
            return;
        }

        let total = inner.total_size;
        match inner.buffer.insert(range.start, payload, total) {
            Ok(len) => inner.downloaded += len,
            Err(rejection) => {
                debug!("Download {}: ignoring {} ({:?})", self.info.id, range, rejection);
                return;
            }
        }

        let event = self.progress_event(&inner);
        if inner.buffer.is_complete(total) {
            self.complete(&mut inner, event);
        } else {
            self.reporter.report(event);
        }
    }

    fn complete(&self, inner: &mut TaskInner, last_progress: ProgressEvent) {
        let payload = inner.buffer.assemble();
        inner.buffer.clear();
        inner.in_flight.clear();
        inner.payload = Some(payload);
        inner.completed_at = Some(Utc::now());
        inner.slot = None;

        self.reporter.finish([CoreEvent::Progress(last_progress)]);
        self.transition(inner, DownloadState::Completed);
        let _ = self.event_tx.send(CoreEvent::Completed {
            id: self.info.id.clone(),
            size: inner.total_size,
        });
        info!("Download {} completed: {} bytes", self.info.id, inner.total_size);
    }

    fn fail(&self, generation: u64, error: EngineError) {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || !matches!(inner.state, DownloadState::Planning | DownloadState::Active)
        {
            debug!("Download {}: ignoring late error: {}", self.info.id, error);
            return;
        }

        inner.run_token.cancel();
        inner.cancel_in_flight();
        inner.buffer.clear();
        inner.slot = None;
        inner.error = Some(error.clone());

        self.reporter.finish([]);
        self.transition(&mut inner, DownloadState::Failed);
        let _ = self.event_tx.send(CoreEvent::Failed {
            id: self.info.id.clone(),
            error: error.to_string(),
        });
        warn!("Download {} failed: {}", self.info.id, error);
    }

    fn progress_event(&self, inner: &TaskInner) -> ProgressEvent {
        let elapsed = inner
            .started_at
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or_default();
        let speed = if elapsed > 0.0 {
            inner.downloaded as f64 / elapsed
        } else {
            0.0
        };

        ProgressEvent {
            id: self.info.id.clone(),
            progress: percent(inner.downloaded, inner.total_size),
            speed,
            downloaded: inner.downloaded,
        }
    }

    fn transition(&self, inner: &mut TaskInner, state: DownloadState) {
        inner.state = state;
        self.state_tx.send_replace(state);
        let _ = self.event_tx.send(CoreEvent::StateChanged {
            id: self.info.id.clone(),
            state,
            error: inner.error.as_ref().map(ToString::to_string),
        });
    }

    fn cancelled_error(&self) -> EngineError {
        EngineError::Cancelled(self.info.id.clone())
    }

    /// The error a run reports: its own, unless a cancel or restart overtook it
    fn outcome_error(&self, generation: u64, error: EngineError) -> EngineError {
        let inner = self.inner.lock();
        if inner.generation == generation && inner.state == DownloadState::Failed {
            error
        } else {
            self.cancelled_error()
        }
    }
}

/// Wait for the limiter, then fetch; the token aborts either step
async fn fetch_range(
    transport: Arc<dyn Transport>,
    limiter: SpeedLimiter,
    url: String,
    range: ByteRange,
    token: CancellationToken,
) -> FetchOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => FetchOutcome::Aborted,
        result = async {
            limiter.acquire(range.len()).await;
            transport.fetch_range(&url, range).await
        } => match result {
            Ok(payload) => FetchOutcome::Fetched(payload),
            Err(reason) => FetchOutcome::Failed(reason),
        },
    }
}
