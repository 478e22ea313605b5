//! Per-server admission gate with in-flight call tracking.
//!
//! Uses `ArcSwap` for lock-free state reads, an atomic counter with RAII
//! guards for in-flight calls, and a `Notify` fired on every state change
//! and whenever the last in-flight call finishes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// Server admission state.
///
/// State machine: Starting -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Constructed, listener not yet serving.
    Starting,
    /// Admitting calls.
    Serving,
    /// Rejecting new calls while in-flight calls finish.
    Draining,
    /// Every in-flight call has finished after draining began.
    Stopped,
}

/// Admits calls while serving and counts them for draining.
///
/// 1. The serve loop calls `set_serving()`
/// 2. Each call holds a guard from `try_enter()` until its response is produced
/// 3. `begin_drain()` makes `try_enter()` fail and wakes `shutdown_signal()`
/// 4. `wait_for_drain()` resolves once the in-flight count reaches zero
#[derive(Debug)]
pub struct ServeGate {
    state: ArcSwap<GateState>,
    in_flight: AtomicU64,
    changed: Notify,
}

impl ServeGate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: ArcSwap::from_pointee(GateState::Starting),
            in_flight: AtomicU64::new(0),
            changed: Notify::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        **self.state.load()
    }

    pub fn set_serving(&self) {
        if self.state() == GateState::Starting {
            self.transition(GateState::Serving);
        }
    }

    /// Admits a call unless the gate is draining or stopped.
    ///
    /// The counter is bumped before the state check so a concurrent
    /// `begin_drain()` never misses an admitted call.
    #[must_use]
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            gate: Arc::clone(self),
        };
        match self.state() {
            GateState::Draining | GateState::Stopped => None,
            GateState::Starting | GateState::Serving => Some(guard),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops admitting calls and wakes everything waiting on `shutdown_signal()`.
    pub fn begin_drain(&self) {
        if matches!(self.state(), GateState::Starting | GateState::Serving) {
            self.transition(GateState::Draining);
        }
    }

    /// Waits until no call is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on success; on timeout the
    /// state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.in_flight_count() == 0 {
                self.transition(GateState::Stopped);
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight_count() == 0;
            }
        }
    }

    /// Resolves once draining has begun.
    pub fn shutdown_signal(self: &Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        let gate = Arc::clone(self);
        async move {
            loop {
                let notified = gate.changed.notified();
                if matches!(gate.state(), GateState::Draining | GateState::Stopped) {
                    return;
                }
                notified.await;
            }
        }
    }

    /// Resolves once the gate has fully stopped.
    pub fn stopped_signal(self: &Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        let gate = Arc::clone(self);
        async move {
            loop {
                let notified = gate.changed.notified();
                if gate.state() == GateState::Stopped {
                    return;
                }
                notified.await;
            }
        }
    }

    fn transition(&self, next: GateState) {
        self.state.store(Arc::new(next));
        self.changed.notify_waiters();
    }
}

/// RAII guard for one admitted call.
///
/// Decrements the in-flight counter on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    gate: Arc<ServeGate>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.gate.changed.notify_waiters();
        }
    }
}
