//! Progress event throttling
//!
//! At most one progress event per interval leaves a reporter. Reports that
//! arrive inside the window are coalesced: the latest one is flushed when the
//! window closes. Terminal events go out immediately.

use chunkfetch_types::{CoreEvent, ProgressEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

/// Default spacing between progress events of one download
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Per-download progress throttle
#[derive(Clone)]
pub struct ProgressReporter {
    event_tx: broadcast::Sender<CoreEvent>,
    interval: Duration,
    state: Arc<Mutex<ReporterState>>,
}

#[derive(Default)]
struct ReporterState {
    last_emit: Option<Instant>,
    pending: Option<ProgressEvent>,
    flush_scheduled: bool,
    /// Set after a terminal event; later reports are ignored
    closed: bool,
    /// Bumped on reset so stale flush timers do nothing
    epoch: u64,
}

impl ProgressReporter {
    pub fn new(event_tx: broadcast::Sender<CoreEvent>, interval: Duration) -> Self {
        Self {
            event_tx,
            interval,
            state: Arc::new(Mutex::new(ReporterState::default())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Offer the latest progress; emitted now or at the end of the window
    pub fn report(&self, event: ProgressEvent) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let now = Instant::now();
        match state.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                state.pending = Some(event);
                if !state.flush_scheduled {
                    state.flush_scheduled = true;
                    self.schedule_flush(last + self.interval, state.epoch);
                }
            }
            _ => {
                state.last_emit = Some(now);
                state.pending = None;
                let _ = self.event_tx.send(CoreEvent::Progress(event));
            }
        }
    }

    fn schedule_flush(&self, deadline: Instant, epoch: u64) {
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let mut state = state.lock();
            if state.epoch != epoch {
                return;
            }
            state.flush_scheduled = false;
            if state.closed {
                return;
            }
            if let Some(event) = state.pending.take() {
                trace!("Flushing coalesced progress for {}", event.id);
                state.last_emit = Some(Instant::now());
                let _ = event_tx.send(CoreEvent::Progress(event));
            }
        });
    }

    /// Emit terminal events right away and stop further progress
    pub fn finish(&self, events: impl IntoIterator<Item = CoreEvent>) {
        let mut state = self.state.lock();
        state.pending = None;
        state.closed = true;
        state.epoch += 1;
        state.flush_scheduled = false;
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    /// Drop any pending progress without emitting it
    pub fn discard_pending(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.epoch += 1;
        state.flush_scheduled = false;
    }

    /// Start over for a fresh run
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let epoch = state.epoch + 1;
        *state = ReporterState {
            epoch,
            ..ReporterState::default()
        };
    }
}
