//! Warm pool of remote conversation handles.
//!
//! Creating a remote conversation is the slowest call on a session's first
//! turn, so a few handles are created ahead of time. A handle leaves the pool
//! exactly once through [`HandlePool::take`] and is never returned; each take
//! schedules one background replacement so the pool drifts back to its target.
//!
//! # Locking
//!
//! [`PoolState`] sits behind one mutex that is held only while the in-memory
//! set is mutated. Remote calls always happen outside of it; a finished
//! creation re-enters the lock just to insert its handle.
//!
//! Creations in flight are counted in the state so that `maintain()` never
//! requests handles that a pending replacement is already going to supply.

mod maintenance;

pub use maintenance::spawn_maintenance;

use crate::Result;
use crate::remote::{Handle, RemoteConversationService};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Read-only snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub available: usize,
    pub target: usize,
}

/// Outcome of [`HandlePool::initialize`].
#[derive(Debug, Default)]
pub struct InitReport {
    pub requested: usize,
    pub created: usize,
    pub errors: Vec<crate::SolaceError>,
}

/// Outcome of a [`HandlePool::maintain`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainOutcome {
    /// Nothing to do: available plus pending creations already meet the target.
    Satisfied,
    /// Another pass was running; this call did nothing.
    AlreadyRunning,
    Replenished { created: usize, failed: usize },
}

#[derive(Debug, Default)]
struct PoolState {
    available: HashSet<Handle>,
    in_flight: usize,
    target: usize,
}

impl PoolState {
    /// Reserve creation slots for whatever the pool is short of.
    fn reserve_deficit(&mut self) -> usize {
        let deficit = self
            .target
            .saturating_sub(self.available.len() + self.in_flight);
        self.in_flight += deficit;
        deficit
    }
}

/// Sink for failures of background creations, which have no caller to
/// report to.
#[derive(Debug, Default)]
struct FailureSink {
    count: AtomicU64,
}

impl FailureSink {
    fn record(&self, origin: &str, error: &dyn std::fmt::Display) {
        let total = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            "Background handle creation ({}) failed: {} [{} failures so far]",
            origin,
            error,
            total
        );
    }
}

struct PoolInner {
    remote: Arc<dyn RemoteConversationService>,
    state: Mutex<PoolState>,
    maintaining: AtomicBool,
    settled: Notify,
    failures: FailureSink,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Every critical section is a handful of field updates, so a panic
        // elsewhere cannot leave the state half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn fill(&self, mut slot: CreationSlot) -> Result<()> {
        let handle = self.remote.create_handle().await?;
        slot.handle = Some(handle);
        Ok(())
    }
}

/// A reserved creation. Dropping it releases the reservation and inserts the
/// created handle, if any, so cancelled or panicking creations never leak a
/// reservation.
struct CreationSlot {
    pool: Arc<PoolInner>,
    handle: Option<Handle>,
}

impl CreationSlot {
    fn reserved(pool: &Arc<PoolInner>) -> Self {
        Self {
            pool: pool.clone(),
            handle: None,
        }
    }
}

impl Drop for CreationSlot {
    fn drop(&mut self) {
        let mut state = self.pool.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(handle) = self.handle.take() {
            if state.available.len() < state.target {
                tracing::debug!("Handle {} added to pool", handle);
                state.available.insert(handle);
            } else {
                tracing::debug!("Pool already at target, discarding handle {}", handle);
            }
        }
        drop(state);
        self.pool.settled.notify_waiters();
    }
}

/// Clears the maintenance flag when a pass ends, however it ends.
struct MaintenancePass<'a>(&'a AtomicBool);

impl Drop for MaintenancePass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pool of pre-created conversation handles. Cloning shares the pool.
#[derive(Clone)]
pub struct HandlePool {
    inner: Arc<PoolInner>,
}

impl HandlePool {
    /// An empty pool with a target of zero; call [`initialize`](Self::initialize).
    pub fn new(remote: Arc<dyn RemoteConversationService>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                remote,
                state: Mutex::new(PoolState::default()),
                maintaining: AtomicBool::new(false),
                settled: Notify::new(),
                failures: FailureSink::default(),
            }),
        }
    }

    /// Set the target and create the missing handles concurrently.
    ///
    /// Returns once every creation has settled. Failures are reported in the
    /// returned [`InitReport`] and are not retried here.
    pub async fn initialize(&self, target: usize) -> InitReport {
        let requested = {
            let mut state = self.inner.lock_state();
            state.target = target;
            state.reserve_deficit()
        };
        tracing::info!("Initializing handle pool: creating {} of {}", requested, target);

        let results = join_all(
            (0..requested).map(|_| self.inner.fill(CreationSlot::reserved(&self.inner))),
        )
        .await;

        let mut report = InitReport {
            requested,
            ..InitReport::default()
        };
        for result in results {
            match result {
                Ok(()) => report.created += 1,
                Err(e) => {
                    tracing::warn!("Initial handle creation failed: {}", e);
                    report.errors.push(e);
                }
            }
        }
        report
    }

    /// Remove and return an arbitrary available handle.
    ///
    /// `None` means the pool is empty and the caller should create a handle
    /// itself. A successful take spawns one background replacement, so this
    /// must be called from within a tokio runtime.
    pub fn take(&self) -> Option<Handle> {
        let (handle, slot) = {
            let mut state = self.inner.lock_state();
            let handle = state.available.iter().next().cloned()?;
            state.available.remove(&handle);
            state.in_flight += 1;
            (handle, CreationSlot::reserved(&self.inner))
        };
        tracing::debug!("Dispensed pooled handle {}", handle);
        self.spawn_creation(slot, "replacement");
        Some(handle)
    }

    /// Synchronous fallback for a pool miss. The handle never enters the pool.
    pub async fn create_on_demand(&self) -> Result<Handle> {
        let handle = self.inner.remote.create_handle().await?;
        tracing::debug!("Created handle {} on demand", handle);
        Ok(handle)
    }

    /// Top the pool back up to its target.
    ///
    /// Only one pass runs at a time; overlapping calls return
    /// [`MaintainOutcome::AlreadyRunning`]. Creation failures are logged and
    /// counted, never returned.
    pub async fn maintain(&self) -> MaintainOutcome {
        if self
            .inner
            .maintaining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return MaintainOutcome::AlreadyRunning;
        }
        let _pass = MaintenancePass(&self.inner.maintaining);

        let deficit = self.inner.lock_state().reserve_deficit();
        if deficit == 0 {
            return MaintainOutcome::Satisfied;
        }
        tracing::debug!("Pool maintenance creating {} handles", deficit);

        let results = join_all(
            (0..deficit).map(|_| self.inner.fill(CreationSlot::reserved(&self.inner))),
        )
        .await;

        let mut created = 0;
        let mut failed = 0;
        for result in results {
            match result {
                Ok(()) => created += 1,
                Err(e) => {
                    failed += 1;
                    self.inner.failures.record("maintenance", &e);
                }
            }
        }
        MaintainOutcome::Replenished { created, failed }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock_state();
        PoolStatus {
            available: state.available.len(),
            target: state.target,
        }
    }

    /// Number of background creations that have failed so far.
    pub fn failure_count(&self) -> u64 {
        self.inner.failures.count.load(Ordering::Relaxed)
    }

    /// Wait until no creation is in flight.
    pub async fn settle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock_state().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_creation(&self, slot: CreationSlot, origin: &'static str) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(inner.fill(slot)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => inner.failures.record(origin, &e),
                Err(_) => inner.failures.record(origin, &"creation task panicked"),
            }
        });
    }
}
