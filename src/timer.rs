//! A narrow timer/clock service (§4.3), injected into both `admission` and
//! `ddf` instead of relying on a process-global timer (§9 design note: "this
//! avoids hidden lifecycle coupling and makes tests deterministic").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A handle returned by [`TimerService::schedule`], usable with
/// [`TimerService::cancel`]. Opaque and cheap to copy/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A one-shot, injectable scheduler plus a monotonic millisecond clock.
///
/// Handlers run on the timer's own worker and must not block (§5): any real
/// I/O they need to perform (sending a RST, re-dispatching a packet) is
/// delegated to a `ConnectionManager`/`PacketCodec` collaborator, never done
/// inline.
pub trait TimerService: Send + Sync + 'static {
    fn now_ms(&self) -> i64;

    /// Schedules `handler` to run once, `delay_ms` from now. A non-positive
    /// `delay_ms` fires as soon as the worker gets to it.
    fn schedule(&self, delay_ms: i64, handler: Box<dyn FnOnce() + Send>) -> TimerHandle;

    /// Best-effort cancellation. Cancelling a handle that already fired, or
    /// was already cancelled, is a no-op (§7: "Timer firing after removal:
    /// no-op").
    fn cancel(&self, handle: TimerHandle);
}

/// A `TimerService` backed by the Tokio runtime: `schedule` spawns a task
/// that sleeps for the requested duration and then runs the handler, unless
/// cancelled first. Mirrors the way the teacher's TCP protocol spawns its
/// own periodic retransmission loop in `tcp.rs`.
pub struct TokioTimer {
    epoch: Instant,
    next_id: AtomicU64,
    pending: Arc<dashmap::DashMap<TimerHandle, tokio::sync::oneshot::Sender<()>>>,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(dashmap::DashMap::new()),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for TokioTimer {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn schedule(&self, delay_ms: i64, handler: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = TimerHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        self.pending.insert(handle, cancel_tx);
        let pending = self.pending.clone();
        let duration = Duration::from_millis(delay_ms.max(0) as u64);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if pending.remove(&handle).is_some() {
                        handler();
                    }
                }
                _ = cancel_rx => {}
            }
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some((_, sender)) = self.pending.remove(&handle) {
            let _ = sender.send(());
        }
    }
}

/// A deterministic `TimerService` for tests. Time only moves when
/// [`VirtualTimer::advance`] is called; due handlers run synchronously, in
/// fire-time order, with the lock released before any handler runs so that a
/// handler may itself call `schedule` (as `ddf`'s rotation does to re-arm).
pub struct VirtualTimer {
    state: std::sync::Mutex<VirtualState>,
}

struct VirtualState {
    now_ms: i64,
    next_id: u64,
    pending: Vec<PendingEvent>,
}

struct PendingEvent {
    handle: TimerHandle,
    fire_at_ms: i64,
    handler: Option<Box<dyn FnOnce() + Send>>,
}

impl VirtualTimer {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(VirtualState {
                now_ms: 0,
                next_id: 1,
                pending: Vec::new(),
            }),
        }
    }

    /// Advances the virtual clock to `now + delta_ms`, running every handler
    /// whose deadline falls at or before that point — as a proper
    /// discrete-event sweep, not a single batched pass. Each due event is
    /// processed in ascending deadline order (ties broken by scheduling
    /// order) with the clock set to *that event's own deadline* before its
    /// handler runs, then the pending set is re-scanned. This matters
    /// because a handler (e.g. `DecayingDuplicateFilter::rotate`) typically
    /// reschedules itself relative to "now": if we jumped the clock straight
    /// to the target first, every such reschedule would land safely in the
    /// future and a `delta_ms` spanning several periods would only ever fire
    /// one of them. Advancing the clock one deadline at a time lets a
    /// handler's own reschedule become due again within the same call,
    /// exactly as it would firing one period at a time in real time.
    pub fn advance(&self, delta_ms: i64) {
        let target = {
            let state = self.state.lock().unwrap();
            state.now_ms + delta_ms
        };
        loop {
            let Some(mut event) = self.pop_earliest_due(target) else {
                break;
            };
            if let Some(handler) = event.handler.take() {
                handler();
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.now_ms < target {
            state.now_ms = target;
        }
    }

    /// Removes and returns the earliest pending event due at or before
    /// `target`, advancing `now_ms` to that event's own deadline. Returns
    /// `None` (leaving `now_ms` untouched) once nothing pending is due.
    fn pop_earliest_due(&self, target: i64) -> Option<PendingEvent> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, ev)| ev.fire_at_ms <= target)
            .min_by_key(|(_, ev)| (ev.fire_at_ms, ev.handle.0))
            .map(|(i, _)| i)?;
        let event = state.pending.remove(idx);
        if event.fire_at_ms > state.now_ms {
            state.now_ms = event.fire_at_ms;
        }
        Some(event)
    }
}

impl Default for VirtualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for VirtualTimer {
    fn now_ms(&self) -> i64 {
        self.state.lock().unwrap().now_ms
    }

    fn schedule(&self, delay_ms: i64, handler: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let handle = TimerHandle(state.next_id);
        state.next_id += 1;
        let fire_at_ms = state.now_ms + delay_ms.max(0);
        state.pending.push(PendingEvent {
            handle,
            fire_at_ms,
            handler: Some(handler),
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = self.state.lock().unwrap();
        state.pending.retain(|ev| ev.handle != handle);
    }
}
