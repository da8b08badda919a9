//! Concurrency ceiling for active downloads
//!
//! A resizable FIFO slot pool on top of a fair semaphore. A download holds a
//! [`SlotGuard`] while it is active; waiters are served in arrival order.

use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Slot pool shared by the manager and its drivers
#[derive(Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    shared: Arc<PoolState>,
}

struct PoolState {
    max_slots: AtomicUsize,
    /// Slots to withdraw as soon as they are released (after a shrink)
    debt: Mutex<usize>,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
}

/// Occupied slot; released on drop
pub struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<PoolState>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").finish_non_exhaustive()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.in_use.fetch_sub(1, Ordering::SeqCst);
        let Some(permit) = self.permit.take() else {
            return;
        };

        let mut debt = self.shared.debt.lock();
        if *debt > 0 {
            *debt -= 1;
            permit.forget();
        }
    }
}

/// Decrements the waiting count when an acquire finishes or is dropped
struct Waiting<'a>(&'a AtomicUsize);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SlotPool {
    pub fn new(max_slots: usize) -> Self {
        let max_slots = max_slots.max(1);
        info!("Created slot pool with {} slots", max_slots);

        Self {
            semaphore: Arc::new(Semaphore::new(max_slots)),
            shared: Arc::new(PoolState {
                max_slots: AtomicUsize::new(max_slots),
                debt: Mutex::new(0),
                in_use: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.shared.max_slots.load(Ordering::SeqCst)
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::SeqCst)
    }

    /// Callers queued for a slot
    pub fn waiting(&self) -> usize {
        self.shared.waiting.load(Ordering::SeqCst)
    }

    fn guard(&self, permit: OwnedSemaphorePermit) -> SlotGuard {
        self.shared.in_use.fetch_add(1, Ordering::SeqCst);
        SlotGuard {
            permit: Some(permit),
            shared: self.shared.clone(),
        }
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.guard(permit))
    }

    /// Wait in line for a slot
    pub async fn acquire(&self) -> Result<SlotGuard, EngineError> {
        self.shared.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = Waiting(&self.shared.waiting);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::InvalidOperation("slot pool closed".to_string()))?;
        Ok(self.guard(permit))
    }

    /// Change the ceiling.
    ///
    /// Growing frees slots immediately. Shrinking never interrupts holders:
    /// free slots are withdrawn now and busy ones as they are released.
    pub fn resize(&self, new_max: usize) {
        let new_max = if new_max == 0 {
            warn!("Refusing a ceiling of 0 slots, using 1");
            1
        } else {
            new_max
        };

        let mut debt = self.shared.debt.lock();
        let old_max = self.shared.max_slots.swap(new_max, Ordering::SeqCst);

        if new_max > old_max {
            let grow = new_max - old_max;
            let forgiven = grow.min(*debt);
            *debt -= forgiven;
            self.semaphore.add_permits(grow - forgiven);
            info!("Slot pool grown: {} -> {}", old_max, new_max);
        } else if new_max < old_max {
            *debt += old_max - new_max;
            while *debt > 0 {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        *debt -= 1;
                    }
                    Err(_) => break,
                }
            }
            if *debt > 0 {
                debug!("Slot pool shrinking: {} busy slots will be withdrawn on release", *debt);
            }
            info!("Slot pool shrunk: {} -> {}", old_max, new_max);
        }
    }
}
