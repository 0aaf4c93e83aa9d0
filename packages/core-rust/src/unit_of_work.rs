//! Per-exchange completion and lifecycle tracking.
//!
//! A `UnitOfWork` collects [`Synchronization`] hooks while an exchange is
//! routed and completes each of them exactly once in [`UnitOfWork::done`].
//! Hooks can be handed over to the unit of work of another exchange when
//! routing continues elsewhere.
//!
//! # Handover ordering
//!
//! Hooks the source keeps (vetoed or filtered out) always complete before the
//! hooks that were moved away from it. If the target finishes first, the
//! moved hooks are parked on a handover barrier and run in the source's
//! `done()` right after the source's own hooks.

use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::panic_message;
use crate::exchange::{Exchange, ExchangeId};
use crate::synchronization::Synchronization;

/// Optional predicate restricting which hooks are considered for handover.
pub type HandoverFilter = dyn Fn(&dyn Synchronization) -> bool + Send + Sync;

/// A registered hook plus the barriers it must wait for before completing.
struct Registered {
    hook: Arc<dyn Synchronization>,
    barriers: Vec<Arc<HandoverBarrier>>,
}

impl Registered {
    fn new(hook: Arc<dyn Synchronization>) -> Self {
        Self {
            hook,
            barriers: Vec::new(),
        }
    }

    fn first_pending_barrier(&self) -> Option<&Arc<HandoverBarrier>> {
        self.barriers.iter().find(|b| !b.is_released())
    }
}

/// Hooks parked until their source unit of work is done.
struct Deferred {
    exchange: Arc<Exchange>,
    failed: bool,
    entries: Vec<Registered>,
}

enum BarrierState {
    Pending(Vec<Deferred>),
    Released,
}

/// Orders moved hooks after the hooks their source retained.
struct HandoverBarrier {
    state: Mutex<BarrierState>,
}

impl HandoverBarrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::Pending(Vec::new())),
        }
    }

    fn is_released(&self) -> bool {
        matches!(*self.state.lock(), BarrierState::Released)
    }

    /// Parks `deferred` until release. Returns it back if already released.
    fn park(&self, deferred: Deferred) -> Option<Deferred> {
        match &mut *self.state.lock() {
            BarrierState::Pending(parked) => {
                parked.push(deferred);
                None
            }
            BarrierState::Released => Some(deferred),
        }
    }

    fn release(&self) -> Vec<Deferred> {
        match mem::replace(&mut *self.state.lock(), BarrierState::Released) {
            BarrierState::Pending(parked) => parked,
            BarrierState::Released => Vec::new(),
        }
    }
}

#[derive(Default)]
struct State {
    done: bool,
    synchronizations: Vec<Registered>,
    /// Barriers guarding hooks this unit of work handed over to others.
    outgoing: Vec<Arc<HandoverBarrier>>,
    routes: Vec<String>,
    transacted_by: Vec<String>,
}

/// Lifecycle object attached to a single exchange.
pub struct UnitOfWork {
    exchange_id: ExchangeId,
    parent: Option<Arc<UnitOfWork>>,
    state: Mutex<State>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new(exchange_id: ExchangeId) -> Self {
        Self {
            exchange_id,
            parent: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Creates a unit of work for `exchange` and attaches it, replacing any previous one.
    pub fn attach(exchange: &Exchange) -> Arc<Self> {
        let uow = Arc::new(Self::new(exchange.id().clone()));
        exchange.set_unit_of_work(Some(Arc::clone(&uow)));
        uow
    }

    /// Creates a child unit of work for `child` with `self` as its parent.
    ///
    /// Completing the child does not complete the parent; that policy belongs
    /// to the caller.
    pub fn create_child_unit_of_work(self: &Arc<Self>, child: &Exchange) -> Arc<Self> {
        let uow = Arc::new(Self {
            exchange_id: child.id().clone(),
            parent: Some(Arc::clone(self)),
            state: Mutex::new(State::default()),
        });
        child.set_unit_of_work(Some(Arc::clone(&uow)));
        uow
    }

    #[must_use]
    pub fn exchange_id(&self) -> &ExchangeId {
        &self.exchange_id
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<UnitOfWork>> {
        self.parent.as_ref()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    // -- synchronizations ---------------------------------------------------

    /// Registers a hook. Returns `false` (and drops the hook) if the unit of
    /// work is already done.
    pub fn add_synchronization(&self, hook: Arc<dyn Synchronization>) -> bool {
        let mut state = self.state.lock();
        if state.done {
            warn!(
                exchange_id = %self.exchange_id,
                "unit of work already done, synchronization not registered"
            );
            return false;
        }
        state.synchronizations.push(Registered::new(hook));
        true
    }

    /// Removes a previously registered hook. Returns `true` if it was present.
    pub fn remove_synchronization(&self, hook: &Arc<dyn Synchronization>) -> bool {
        let mut state = self.state.lock();
        let before = state.synchronizations.len();
        state
            .synchronizations
            .retain(|r| !Arc::ptr_eq(&r.hook, hook));
        state.synchronizations.len() != before
    }

    #[must_use]
    pub fn contains_synchronization(&self, hook: &Arc<dyn Synchronization>) -> bool {
        self.state
            .lock()
            .synchronizations
            .iter()
            .any(|r| Arc::ptr_eq(&r.hook, hook))
    }

    #[must_use]
    pub fn synchronization_count(&self) -> usize {
        self.state.lock().synchronizations.len()
    }

    /// Moves hooks to the unit of work of `target`, creating one if it has none.
    ///
    /// A hook moves only if it passes `filter` (when given) and, if it is
    /// vetoable, its `allow_handover()` returns `true`. Refused hooks stay
    /// here and complete in this unit of work's `done()`. Returns the number
    /// of hooks moved.
    pub fn handover_synchronization(
        &self,
        target: &Arc<Exchange>,
        filter: Option<&HandoverFilter>,
    ) -> usize {
        let target_uow = target
            .unit_of_work()
            .unwrap_or_else(|| UnitOfWork::attach(target));
        if std::ptr::eq(Arc::as_ptr(&target_uow), self) {
            return 0;
        }

        let barrier = Arc::new(HandoverBarrier::new());
        let mut moved = {
            let mut state = self.state.lock();
            if state.done {
                return 0;
            }
            let (accepted, kept): (Vec<_>, Vec<_>) =
                mem::take(&mut state.synchronizations)
                    .into_iter()
                    .partition(|r| {
                        let considered = filter.map_or(true, |f| f(r.hook.as_ref()));
                        let allowed = r.hook.as_vetoable().map_or(true, |v| v.allow_handover());
                        considered && allowed
                    });
            state.synchronizations = kept;
            if !accepted.is_empty() {
                state.outgoing.push(Arc::clone(&barrier));
            }
            accepted
        };

        for entry in &mut moved {
            if let Some(v) = entry.hook.as_vetoable() {
                v.before_handover(target);
            }
            entry.barriers.push(Arc::clone(&barrier));
        }

        let count = moved.len();
        if count > 0 {
            debug!(
                from = %self.exchange_id,
                to = %target.id(),
                count,
                "handed over synchronizations"
            );
            target_uow.receive(moved, target);
        }
        count
    }

    fn receive(&self, entries: Vec<Registered>, exchange: &Arc<Exchange>) {
        let mut state = self.state.lock();
        if state.done {
            drop(state);
            complete_entries(entries, exchange, exchange.is_failed());
            return;
        }
        state.synchronizations.extend(entries);
    }

    /// Completes the unit of work, invoking every remaining hook exactly once.
    ///
    /// Hooks get `on_failure` if the exchange carries an error, otherwise
    /// `on_complete`. They run in reverse registration order, then stably
    /// sorted by their optional `order()`. A second call is a no-op.
    pub fn done(&self, exchange: &Arc<Exchange>) {
        let (entries, outgoing) = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.done = true;
            (
                mem::take(&mut state.synchronizations),
                mem::take(&mut state.outgoing),
            )
        };

        let failed = exchange.is_failed();
        debug!(
            exchange_id = %exchange.id(),
            failed,
            hooks = entries.len(),
            "unit of work done"
        );
        complete_entries(entries, exchange, failed);

        for barrier in outgoing {
            for deferred in barrier.release() {
                complete_entries(deferred.entries, &deferred.exchange, deferred.failed);
            }
        }
    }

    // -- routes -------------------------------------------------------------

    /// Invokes route-aware hooks before the exchange enters `route_id`.
    pub fn before_route(&self, exchange: &Exchange, route_id: &str) {
        for hook in self.hooks_snapshot() {
            if let Some(aware) = hook.as_route_aware() {
                aware.on_before_route(route_id, exchange);
            }
        }
    }

    /// Invokes route-aware hooks after the exchange leaves `route_id`.
    pub fn after_route(&self, exchange: &Exchange, route_id: &str) {
        for hook in self.hooks_snapshot() {
            if let Some(aware) = hook.as_route_aware() {
                aware.on_after_route(route_id, exchange);
            }
        }
    }

    pub fn push_route(&self, route_id: impl Into<String>) {
        self.state.lock().routes.push(route_id.into());
    }

    pub fn pop_route(&self) -> Option<String> {
        self.state.lock().routes.pop()
    }

    /// Returns the route currently executing (top of the stack).
    #[must_use]
    pub fn route(&self) -> Option<String> {
        self.state.lock().routes.last().cloned()
    }

    #[must_use]
    pub fn route_stack_level(&self) -> usize {
        self.state.lock().routes.len()
    }

    // -- transactions -------------------------------------------------------

    pub fn begin_transacted_by(&self, key: impl Into<String>) {
        self.state.lock().transacted_by.push(key.into());
    }

    pub fn end_transacted_by(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.transacted_by.iter().rposition(|k| k == key) {
            state.transacted_by.remove(pos);
        }
    }

    #[must_use]
    pub fn is_transacted_by(&self, key: &str) -> bool {
        self.state.lock().transacted_by.iter().any(|k| k == key)
    }

    #[must_use]
    pub fn is_transacted(&self) -> bool {
        !self.state.lock().transacted_by.is_empty()
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn Synchronization>> {
        self.state
            .lock()
            .synchronizations
            .iter()
            .map(|r| Arc::clone(&r.hook))
            .collect()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UnitOfWork")
            .field("exchange_id", &self.exchange_id)
            .field("done", &state.done)
            .field("synchronizations", &state.synchronizations.len())
            .field("routes", &state.routes)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// Runs ready hooks in completion order and parks the ones still waiting on a barrier.
fn complete_entries(mut entries: Vec<Registered>, exchange: &Arc<Exchange>, failed: bool) {
    entries.reverse();
    entries.sort_by_key(|r| r.hook.order().unwrap_or(0));

    let mut waiting: Vec<(Arc<HandoverBarrier>, Registered)> = Vec::new();
    for entry in entries {
        match entry.first_pending_barrier().cloned() {
            None => invoke(entry.hook.as_ref(), exchange, failed),
            Some(barrier) => waiting.push((barrier, entry)),
        }
    }

    for (barrier, entry) in waiting {
        let deferred = Deferred {
            exchange: Arc::clone(exchange),
            failed,
            entries: vec![entry],
        };
        // Released between the check and the park: complete now.
        if let Some(deferred) = barrier.park(deferred) {
            complete_entries(deferred.entries, &deferred.exchange, deferred.failed);
        }
    }
}

fn invoke(hook: &dyn Synchronization, exchange: &Exchange, failed: bool) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if failed {
            hook.on_failure(exchange)
        } else {
            hook.on_complete(exchange)
        }
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            exchange_id = %exchange.id(),
            error = %e,
            "synchronization hook failed, this error is ignored"
        ),
        Err(payload) => warn!(
            exchange_id = %exchange.id(),
            panic = %panic_message(payload.as_ref()),
            "synchronization hook panicked, this error is ignored"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    use super::*;
    use crate::error::ExchangeError;
    use crate::synchronization::{OnCompletion, SynchronizationRouteAware};

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_hook(log: &Log, name: &'static str) -> OnCompletion {
        let (c, f) = (log.clone(), log.clone());
        OnCompletion::new()
            .on_complete(move |_| {
                c.lock().push(format!("complete:{name}"));
                Ok(())
            })
            .on_failure(move |_| {
                f.lock().push(format!("failure:{name}"));
                Ok(())
            })
    }

    fn setup() -> (Arc<Exchange>, Arc<UnitOfWork>, Log) {
        let ex = Arc::new(Exchange::new());
        let uow = UnitOfWork::attach(&ex);
        (ex, uow, Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn done_is_idempotent() {
        let (ex, uow, log) = setup();
        uow.add_synchronization(Arc::new(logging_hook(&log, "a")));

        uow.done(&ex);
        uow.done(&ex);

        assert_eq!(*log.lock(), vec!["complete:a"]);
        assert!(uow.is_done());
    }

    #[test]
    fn failed_exchange_invokes_on_failure() {
        let (ex, uow, log) = setup();
        uow.add_synchronization(Arc::new(logging_hook(&log, "a")));
        ex.set_error(Some(ExchangeError::processing("boom")));

        uow.done(&ex);

        assert_eq!(*log.lock(), vec!["failure:a"]);
    }

    #[test]
    fn reverse_registration_order_then_explicit_order() {
        let (ex, uow, log) = setup();
        uow.add_synchronization(Arc::new(logging_hook(&log, "first")));
        uow.add_synchronization(Arc::new(logging_hook(&log, "second")));
        uow.add_synchronization(Arc::new(logging_hook(&log, "early").ordered(-10)));

        uow.done(&ex);

        assert_eq!(
            *log.lock(),
            vec!["complete:early", "complete:second", "complete:first"]
        );
    }

    #[test]
    fn failing_hooks_do_not_stop_others() {
        let (ex, uow, log) = setup();
        uow.add_synchronization(Arc::new(logging_hook(&log, "a")));
        uow.add_synchronization(Arc::new(
            OnCompletion::new().on_complete(|_| Err(anyhow::anyhow!("hook error"))),
        ));
        uow.add_synchronization(Arc::new(
            OnCompletion::new().on_complete(|_| panic!("hook panic")),
        ));
        uow.add_synchronization(Arc::new(logging_hook(&log, "b")));

        uow.done(&ex);

        assert_eq!(*log.lock(), vec!["complete:b", "complete:a"]);
    }

    #[test]
    fn add_after_done_is_refused() {
        let (ex, uow, log) = setup();
        uow.done(&ex);
        assert!(!uow.add_synchronization(Arc::new(logging_hook(&log, "late"))));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn remove_and_contains() {
        let (ex, uow, log) = setup();
        let hook: Arc<dyn Synchronization> = Arc::new(logging_hook(&log, "a"));
        uow.add_synchronization(hook.clone());
        assert!(uow.contains_synchronization(&hook));

        assert!(uow.remove_synchronization(&hook));
        assert!(!uow.contains_synchronization(&hook));
        assert!(!uow.remove_synchronization(&hook));

        uow.done(&ex);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn handover_respects_veto_and_filter() {
        let (source_ex, source, log) = setup();
        let target_ex = Arc::new(Exchange::new());

        uow_add(&source, logging_hook(&log, "plain"));
        uow_add(&source, logging_hook(&log, "refuses").allow_handover(false));
        uow_add(&source, logging_hook(&log, "accepts").allow_handover(true));
        uow_add(&source, logging_hook(&log, "filtered").ordered(5));

        let filter = |h: &dyn Synchronization| h.order().is_none();
        let moved = source.handover_synchronization(&target_ex, Some(&filter));

        assert_eq!(moved, 2);
        assert_eq!(source.synchronization_count(), 2);
        let target = target_ex.unit_of_work().expect("target gets a unit of work");
        assert_eq!(target.synchronization_count(), 2);

        source.done(&source_ex);
        target.done(&target_ex);

        let entries = log.lock().clone();
        assert_eq!(entries.len(), 4);
        assert_eq!(&entries[..2], ["complete:refuses", "complete:filtered"]);
    }

    #[test]
    fn moved_hooks_wait_for_source_completion() {
        let (source_ex, source, log) = setup();
        let target_ex = Arc::new(Exchange::new());
        let target = UnitOfWork::attach(&target_ex);

        uow_add(&source, logging_hook(&log, "kept").allow_handover(false));
        uow_add(&source, logging_hook(&log, "moved"));
        assert_eq!(source.handover_synchronization(&target_ex, None), 1);

        // Target finishes first: the moved hook is parked.
        target.done(&target_ex);
        assert!(log.lock().is_empty());

        source.done(&source_ex);
        assert_eq!(*log.lock(), vec!["complete:kept", "complete:moved"]);
    }

    #[test]
    fn moved_hooks_see_target_outcome() {
        let (source_ex, source, log) = setup();
        let target_ex = Arc::new(Exchange::new());
        uow_add(&source, logging_hook(&log, "moved"));
        source.handover_synchronization(&target_ex, None);

        source.done(&source_ex);
        target_ex.set_error(Some(ExchangeError::processing("downstream failed")));
        target_ex.unit_of_work().unwrap().done(&target_ex);

        assert_eq!(*log.lock(), vec!["failure:moved"]);
    }

    #[test]
    fn before_handover_called_for_accepted_vetoable() {
        struct Counting(Arc<AtomicU32>);
        impl Synchronization for Counting {
            fn on_complete(&self, _: &Exchange) -> anyhow::Result<()> {
                Ok(())
            }
            fn on_failure(&self, _: &Exchange) -> anyhow::Result<()> {
                Ok(())
            }
            fn as_vetoable(&self) -> Option<&dyn crate::SynchronizationVetoable> {
                Some(self)
            }
        }
        impl crate::SynchronizationVetoable for Counting {
            fn allow_handover(&self) -> bool {
                true
            }
            fn before_handover(&self, _target: &Exchange) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_ex, source, _log) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        source.add_synchronization(Arc::new(Counting(calls.clone())));
        source.handover_synchronization(&Arc::new(Exchange::new()), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handover_after_done_moves_nothing() {
        let (ex, source, log) = setup();
        uow_add(&source, logging_hook(&log, "a"));
        source.done(&ex);
        assert_eq!(source.handover_synchronization(&Arc::new(Exchange::new()), None), 0);
        assert_eq!(*log.lock(), vec!["complete:a"]);
    }

    #[test]
    fn route_stack_push_pop() {
        let (_ex, uow, _log) = setup();
        assert!(uow.route().is_none());

        uow.push_route("outer");
        uow.push_route("inner");
        assert_eq!(uow.route().as_deref(), Some("inner"));
        assert_eq!(uow.route_stack_level(), 2);

        assert_eq!(uow.pop_route().as_deref(), Some("inner"));
        assert_eq!(uow.route().as_deref(), Some("outer"));
        uow.pop_route();
        assert!(uow.route().is_none());
        assert!(uow.pop_route().is_none());
    }

    #[test]
    fn route_aware_hooks_observe_transitions() {
        struct Aware(Log);
        impl Synchronization for Aware {
            fn on_complete(&self, _: &Exchange) -> anyhow::Result<()> {
                Ok(())
            }
            fn on_failure(&self, _: &Exchange) -> anyhow::Result<()> {
                Ok(())
            }
            fn as_route_aware(&self) -> Option<&dyn SynchronizationRouteAware> {
                Some(self)
            }
        }
        impl SynchronizationRouteAware for Aware {
            fn on_before_route(&self, route_id: &str, _: &Exchange) {
                self.0.lock().push(format!("before:{route_id}"));
            }
            fn on_after_route(&self, route_id: &str, _: &Exchange) {
                self.0.lock().push(format!("after:{route_id}"));
            }
        }

        let (ex, uow, log) = setup();
        uow.add_synchronization(Arc::new(Aware(log.clone())));
        uow.before_route(&ex, "orders");
        uow.after_route(&ex, "orders");
        assert_eq!(*log.lock(), vec!["before:orders", "after:orders"]);
    }

    #[test]
    fn child_unit_of_work_has_parent_and_is_independent() {
        let (parent_ex, parent, log) = setup();
        let child_ex = Arc::new(parent_ex.create_child());
        let child = parent.create_child_unit_of_work(&child_ex);

        assert!(Arc::ptr_eq(child.parent().unwrap(), &parent));
        assert!(Arc::ptr_eq(&child_ex.unit_of_work().unwrap(), &child));

        uow_add(&parent, logging_hook(&log, "parent"));
        child.done(&child_ex);
        assert!(!parent.is_done());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn transaction_markers() {
        let (_ex, uow, _log) = setup();
        assert!(!uow.is_transacted());
        uow.begin_transacted_by("tx-1");
        assert!(uow.is_transacted_by("tx-1"));
        assert!(uow.is_transacted());
        uow.end_transacted_by("tx-1");
        assert!(!uow.is_transacted());
    }

    #[test]
    fn concurrent_done_and_add_runs_each_hook_at_most_once() {
        for _ in 0..50 {
            let (ex, uow, _log) = setup();
            let calls = Arc::new(AtomicU32::new(0));
            let accepted = Arc::new(AtomicU32::new(0));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let (uow, calls, accepted) = (uow.clone(), calls.clone(), accepted.clone());
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let c = calls.clone();
                            let hook = OnCompletion::new().on_complete(move |_| {
                                c.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            });
                            if uow.add_synchronization(Arc::new(hook)) {
                                accepted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    })
                })
                .collect();
            let doner = {
                let (uow, ex) = (uow.clone(), ex.clone());
                thread::spawn(move || uow.done(&ex))
            };
            for h in handles {
                h.join().unwrap();
            }
            doner.join().unwrap();
            uow.done(&ex);

            assert_eq!(calls.load(Ordering::SeqCst), accepted.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn concurrent_done_and_handover_complete_every_hook_once() {
        for target_done_first in [true, false] {
            for _ in 0..50 {
                let (source_ex, source, _log) = setup();
                let target_ex = Arc::new(Exchange::new());
                let target = UnitOfWork::attach(&target_ex);
                if target_done_first {
                    target.done(&target_ex);
                }

                let counters: Vec<Arc<AtomicU32>> =
                    (0..8).map(|_| Arc::new(AtomicU32::new(0))).collect();
                for (i, counter) in counters.iter().enumerate() {
                    let c = counter.clone();
                    let hook = OnCompletion::new()
                        .on_complete(move |_| {
                            c.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .allow_handover(i % 3 != 0);
                    uow_add(&source, hook);
                }

                let doner = {
                    let (source, ex) = (source.clone(), source_ex.clone());
                    thread::spawn(move || source.done(&ex))
                };
                let mover = {
                    let (source, ex) = (source.clone(), target_ex.clone());
                    thread::spawn(move || source.handover_synchronization(&ex, None))
                };
                doner.join().unwrap();
                mover.join().unwrap();
                if !target_done_first {
                    target.done(&target_ex);
                }

                for (i, counter) in counters.iter().enumerate() {
                    assert_eq!(counter.load(Ordering::SeqCst), 1, "hook {i}");
                }
            }
        }
    }

    #[test]
    fn nested_routes_unwind_under_concurrency() {
        let handles: Vec<_> = (0..10)
            .map(|i| {
                thread::spawn(move || {
                    let ex = Arc::new(Exchange::new());
                    let uow = UnitOfWork::attach(&ex);
                    for depth in 0..3 {
                        uow.push_route(format!("route-{i}-{depth}"));
                    }
                    for _ in 0..3 {
                        uow.pop_route();
                    }
                    uow.done(&ex);
                    uow
                })
            })
            .collect();

        for h in handles {
            let uow = h.join().unwrap();
            assert_eq!(uow.route_stack_level(), 0);
            assert!(uow.route().is_none());
        }
    }

    fn uow_add(uow: &UnitOfWork, hook: OnCompletion) {
        uow.add_synchronization(Arc::new(hook));
    }

    proptest::proptest! {
        #[test]
        fn repeated_done_matches_single_done(hooks in 0usize..16, failed: bool, calls_to_done in 1usize..4) {
            let (ex, uow, log) = setup();
            for _ in 0..hooks {
                uow_add(&uow, logging_hook(&log, "h"));
            }
            if failed {
                ex.set_error(Some(ExchangeError::processing("x")));
            }
            for _ in 0..calls_to_done {
                uow.done(&ex);
            }
            let expected = if failed { "failure:h" } else { "complete:h" };
            let entries = log.lock().clone();
            proptest::prop_assert_eq!(entries.len(), hooks);
            proptest::prop_assert!(entries.iter().all(|e| e == expected));
        }
    }
}
