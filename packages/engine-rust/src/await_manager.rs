//! Blocking bridge between synchronous callers and asynchronous processing.
//!
//! A caller that needs a result hands its processor and exchange to
//! [`AwaitManager::process`]. If the processor does not finish inline, the
//! calling thread first drains its own scheduler queue, then parks on a
//! per-exchange signal until the completion callback fires or an
//! administrator interrupts it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_core::{AsyncCallback, AsyncProcessor, Exchange, ExchangeError, ExchangeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::AwaitManagerConfig;
use crate::inflight::InFlightRegistry;
use crate::registry::{ManagedService, ServiceContext};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Waiting,
    Completed,
    Interrupted,
}

/// One-shot latch. Only the first `complete` or `interrupt` has any effect.
#[derive(Debug)]
struct AwaitSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl AwaitSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Waiting),
            cond: Condvar::new(),
        }
    }

    fn is_signalled(&self) -> bool {
        *self.state.lock() != SignalState::Waiting
    }

    fn complete(&self) -> bool {
        self.fire(SignalState::Completed, || {})
    }

    /// Runs `on_win` under the signal lock if this call is the first signal,
    /// so the waiter never observes the latch open before `on_win` is done.
    fn fire(&self, next: SignalState, on_win: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if *state != SignalState::Waiting {
            return false;
        }
        on_win();
        *state = next;
        self.cond.notify_all();
        true
    }

    fn wait(&self) -> SignalState {
        let mut state = self.state.lock();
        while *state == SignalState::Waiting {
            self.cond.wait(&mut state);
        }
        *state
    }
}

struct AwaitEntry {
    thread: Thread,
    exchange: Weak<Exchange>,
    exchange_id: ExchangeId,
    started_at: Instant,
    route_id: Option<String>,
    node_id: Mutex<Option<String>>,
    signal: Arc<AwaitSignal>,
    /// Entry this one replaced when another thread was already waiting on
    /// the same exchange.
    shadowed: Option<Arc<AwaitEntry>>,
}

impl AwaitEntry {
    /// Nearest shadowed entry whose caller is still waiting.
    fn live_shadowed(&self) -> Option<Arc<AwaitEntry>> {
        let mut next = self.shadowed.as_ref();
        while let Some(entry) = next {
            if !entry.signal.is_signalled() {
                return Some(Arc::clone(entry));
            }
            next = entry.shadowed.as_ref();
        }
        None
    }
}

/// Point-in-time view of one blocked caller.
#[derive(Debug, Clone)]
pub struct AwaitThread {
    pub exchange_id: ExchangeId,
    pub thread_id: thread::ThreadId,
    pub thread_name: Option<String>,
    pub route_id: Option<String>,
    pub node_id: Option<String>,
    pub started_at: Instant,
}

impl AwaitThread {
    #[must_use]
    pub fn wait_duration(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AwaitStatisticsSnapshot {
    pub threads_blocked: u64,
    pub threads_interrupted: u64,
    pub total_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub mean_duration_ms: u64,
}

/// Wait counters. All updates are relaxed atomics and are skipped when
/// statistics are disabled.
#[derive(Debug)]
pub struct AwaitStatistics {
    enabled: AtomicBool,
    blocked: AtomicU64,
    interrupted: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl AwaitStatistics {
    fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            blocked: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn threads_blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn threads_interrupted(&self) -> u64 {
        self.interrupted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> AwaitStatisticsSnapshot {
        let blocked = self.threads_blocked();
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);
        AwaitStatisticsSnapshot {
            threads_blocked: blocked,
            threads_interrupted: self.threads_interrupted(),
            total_duration_ms: total,
            min_duration_ms: if min == u64::MAX { 0 } else { min },
            max_duration_ms: self.max_ms.load(Ordering::Relaxed),
            mean_duration_ms: if blocked == 0 { 0 } else { total / blocked },
        }
    }

    pub fn reset(&self) {
        self.blocked.store(0, Ordering::Relaxed);
        self.interrupted.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
        self.min_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }

    fn record_wait(&self, waited: Duration) {
        if !self.is_enabled() {
            return;
        }
        let ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        self.blocked.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn record_interrupt(&self) {
        if self.is_enabled() {
            self.interrupted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Tracks and releases threads blocked on asynchronous exchanges.
pub struct AwaitManager {
    scheduler: Arc<Scheduler>,
    blocked: DashMap<ExchangeId, Arc<AwaitEntry>>,
    inflight: Option<Arc<InFlightRegistry>>,
    interrupt_threads_while_stopping: AtomicBool,
    statistics: AwaitStatistics,
}

impl AwaitManager {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self::with_config(scheduler, &AwaitManagerConfig::default())
    }

    #[must_use]
    pub fn with_config(scheduler: Arc<Scheduler>, config: &AwaitManagerConfig) -> Self {
        Self {
            scheduler,
            blocked: DashMap::new(),
            inflight: None,
            interrupt_threads_while_stopping: AtomicBool::new(
                config.interrupt_threads_while_stopping,
            ),
            statistics: AwaitStatistics::new(config.statistics_enabled),
        }
    }

    /// Seeds the node of newly blocked callers from the exchange's last
    /// reported location.
    #[must_use]
    pub fn with_inflight_registry(mut self, inflight: Arc<InFlightRegistry>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    /// Runs `processor` and blocks until `exchange` completes or is interrupted.
    ///
    /// On return the exchange may still carry an error from processing. An
    /// interrupted exchange carries [`ExchangeError::Interrupted`].
    pub fn process(&self, processor: &dyn AsyncProcessor, exchange: &Arc<Exchange>) {
        let signal = Arc::new(AwaitSignal::new());
        let on_done = Arc::clone(&signal);
        let callback = AsyncCallback::new(move |_done_sync| {
            on_done.complete();
        });

        if processor.process(Arc::clone(exchange), callback) {
            trace!(exchange_id = %exchange.id(), "processed synchronously");
            return;
        }

        // Continuations queued on this thread may be the ones that complete us.
        while !signal.is_signalled() && self.scheduler.execute_from_queue() {}
        if signal.is_signalled() {
            return;
        }

        self.await_signal(exchange, &signal);
    }

    fn await_signal(&self, exchange: &Arc<Exchange>, signal: &Arc<AwaitSignal>) {
        let uow = exchange.unit_of_work();
        let exchange_id = exchange.id().clone();
        let route_id = uow
            .as_ref()
            .and_then(|u| u.route())
            .or_else(|| exchange.from_route_id().map(str::to_string));
        // The processor reported its node before this entry existed.
        let node_id = self
            .inflight
            .as_ref()
            .and_then(|inflight| inflight.last_node_id(&exchange_id));

        let key = exchange_id.clone();
        let new_entry = |shadowed: Option<Arc<AwaitEntry>>| {
            Arc::new(AwaitEntry {
                thread: thread::current(),
                exchange: Arc::downgrade(exchange),
                exchange_id,
                started_at: Instant::now(),
                route_id,
                node_id: Mutex::new(node_id),
                signal: Arc::clone(signal),
                shadowed,
            })
        };
        // A second thread waiting on the same exchange shadows the first.
        let entry = match self.blocked.entry(key) {
            Entry::Occupied(mut slot) => {
                let entry = new_entry(Some(Arc::clone(slot.get())));
                slot.insert(Arc::clone(&entry));
                entry
            }
            Entry::Vacant(slot) => {
                let entry = new_entry(None);
                slot.insert(Arc::clone(&entry));
                entry
            }
        };
        trace!(exchange_id = %entry.exchange_id, "waiting for asynchronous completion");

        let outcome = signal.wait();
        self.release(&entry);

        let waited = entry.started_at.elapsed();
        self.statistics.record_wait(waited);
        match outcome {
            SignalState::Interrupted => {
                debug!(exchange_id = %entry.exchange_id, waited_ms = waited.as_millis(), "released by interrupt");
            }
            _ => trace!(exchange_id = %entry.exchange_id, waited_ms = waited.as_millis(), "asynchronous processing done"),
        }
    }

    /// Drops `entry` from the table once its wait is over. If it is the
    /// visible entry, the nearest caller it shadowed that is still waiting
    /// becomes visible again. An entry shadowed by a later waiter is left in
    /// place; that waiter skips it on release.
    fn release(&self, entry: &Arc<AwaitEntry>) {
        if let Entry::Occupied(mut slot) = self.blocked.entry(entry.exchange_id.clone()) {
            if Arc::ptr_eq(slot.get(), entry) {
                match entry.live_shadowed() {
                    Some(outer) => {
                        slot.insert(outer);
                    }
                    None => {
                        slot.remove();
                    }
                }
            }
        }
    }

    /// Releases the thread blocked on `exchange_id`.
    ///
    /// Returns `false` if nothing is blocked on that id or the wait was
    /// already signalled; neither case is an error.
    pub fn interrupt(&self, exchange_id: &ExchangeId) -> bool {
        let Some(entry) = self.blocked.get(exchange_id).map(|e| Arc::clone(e.value())) else {
            trace!(exchange_id = %exchange_id, "interrupt ignored, exchange not blocked");
            return false;
        };
        self.interrupt_entry(&entry)
    }

    pub fn interrupt_exchange(&self, exchange: &Exchange) -> bool {
        self.interrupt(exchange.id())
    }

    /// Interrupts every blocked thread. Returns how many were released.
    pub fn interrupt_all(&self) -> usize {
        let entries: Vec<Arc<AwaitEntry>> = self.blocked.iter().map(|e| Arc::clone(e.value())).collect();
        entries.iter().filter(|e| self.interrupt_entry(e)).count()
    }

    fn interrupt_entry(&self, entry: &AwaitEntry) -> bool {
        let exchange = entry.exchange.upgrade();
        let won = entry.signal.fire(SignalState::Interrupted, || {
            if let Some(exchange) = &exchange {
                exchange.set_error(Some(ExchangeError::Interrupted {
                    exchange_id: entry.exchange_id.clone(),
                }));
                exchange.mark_interrupted();
            }
        });
        if won {
            self.statistics.record_interrupt();
            warn!(
                exchange_id = %entry.exchange_id,
                thread = entry.thread.name().unwrap_or("<unnamed>"),
                waited_ms = entry.started_at.elapsed().as_millis(),
                "interrupted blocked thread"
            );
        }
        won
    }

    /// Records the processor node an exchange's blocked caller is waiting on.
    pub fn update_node(&self, exchange_id: &ExchangeId, node_id: &str) {
        if let Some(entry) = self.blocked.get(exchange_id) {
            *entry.node_id.lock() = Some(node_id.to_string());
        }
    }

    /// Number of threads currently blocked.
    #[must_use]
    pub fn size(&self) -> usize {
        self.blocked.len()
    }

    #[must_use]
    pub fn browse(&self) -> Vec<AwaitThread> {
        self.blocked
            .iter()
            .map(|e| {
                let entry = e.value();
                AwaitThread {
                    exchange_id: entry.exchange_id.clone(),
                    thread_id: entry.thread.id(),
                    thread_name: entry.thread.name().map(str::to_string),
                    route_id: entry.route_id.clone(),
                    node_id: entry.node_id.lock().clone(),
                    started_at: entry.started_at,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn is_interrupt_threads_while_stopping(&self) -> bool {
        self.interrupt_threads_while_stopping.load(Ordering::Relaxed)
    }

    pub fn set_interrupt_threads_while_stopping(&self, interrupt: bool) {
        self.interrupt_threads_while_stopping
            .store(interrupt, Ordering::Relaxed);
    }

    #[must_use]
    pub fn statistics(&self) -> &AwaitStatistics {
        &self.statistics
    }
}

#[async_trait]
impl ManagedService for AwaitManager {
    fn name(&self) -> &'static str {
        "await-manager"
    }

    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _terminate: bool) -> anyhow::Result<()> {
        let threads = self.browse();
        if threads.is_empty() {
            debug!("await manager stopped");
            return Ok(());
        }

        let interrupt = self.is_interrupt_threads_while_stopping();
        info!(
            blocked = threads.len(),
            interrupt,
            "shutting down with blocked threads"
        );
        for t in &threads {
            warn!(
                exchange_id = %t.exchange_id,
                thread = t.thread_name.as_deref().unwrap_or("<unnamed>"),
                route_id = t.route_id.as_deref().unwrap_or(""),
                node_id = t.node_id.as_deref().unwrap_or(""),
                waited_ms = t.wait_duration().as_millis(),
                "thread still blocked"
            );
        }
        if interrupt {
            let released = self.interrupt_all();
            info!(released, "interrupted blocked threads during stop");
        }
        Ok(())
    }
}
