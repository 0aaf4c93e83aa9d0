//! In-flight exchange registry.
//!
//! Purely observational: it never blocks or rejects work. A `DashMap` keyed
//! by exchange id holds per-exchange records, and a second map holds
//! per-route counters, so `add`/`remove` on the hot path only touch one shard
//! of each.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conduit_core::{Exchange, ExchangeId};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::registry::{ManagedService, ServiceContext};

/// Point-in-time snapshot of one in-flight exchange.
#[derive(Debug, Clone)]
pub struct InFlightExchange {
    pub exchange_id: ExchangeId,
    /// Route that created the exchange.
    pub from_route_id: Option<String>,
    /// Route currently processing the exchange.
    pub at_route_id: Option<String>,
    /// Last processor node that reported the exchange.
    pub last_node_id: Option<String>,
    pub started_at: Instant,
    /// Time of the last location update.
    pub last_seen_at: Instant,
}

impl InFlightExchange {
    /// Total time the exchange has been in flight.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since the exchange last moved to a new node.
    #[must_use]
    pub fn elapsed_at_node(&self) -> Duration {
        self.last_seen_at.elapsed()
    }
}

struct Record {
    /// Lookup-only; the registry never extends an exchange's lifetime.
    exchange: Weak<Exchange>,
    from_route_id: Option<String>,
    at_route_id: Option<String>,
    last_node_id: Option<String>,
    started_at: Instant,
    last_seen_at: Instant,
}

impl Record {
    fn snapshot(&self, exchange_id: &ExchangeId) -> InFlightExchange {
        // A live unit of work knows the route better than the last update.
        let at_route_id = self
            .exchange
            .upgrade()
            .and_then(|ex| ex.unit_of_work())
            .and_then(|uow| uow.route())
            .or_else(|| self.at_route_id.clone());
        InFlightExchange {
            exchange_id: exchange_id.clone(),
            from_route_id: self.from_route_id.clone(),
            at_route_id,
            last_node_id: self.last_node_id.clone(),
            started_at: self.started_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Concurrent index of the exchanges currently being processed.
pub struct InFlightRegistry {
    exchanges: DashMap<ExchangeId, Record>,
    route_counts: DashMap<String, AtomicUsize>,
    browse_enabled: bool,
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_browse_enabled(true)
    }

    /// When `browse_enabled` is false, `browse` and `oldest` return nothing.
    #[must_use]
    pub fn with_browse_enabled(browse_enabled: bool) -> Self {
        Self {
            exchanges: DashMap::new(),
            route_counts: DashMap::new(),
            browse_enabled,
        }
    }

    /// Records that `exchange` entered processing.
    pub fn add(&self, exchange: &Arc<Exchange>) {
        let now = Instant::now();
        self.exchanges.insert(
            exchange.id().clone(),
            Record {
                exchange: Arc::downgrade(exchange),
                from_route_id: exchange.from_route_id().map(str::to_string),
                at_route_id: exchange.from_route_id().map(str::to_string),
                last_node_id: None,
                started_at: now,
                last_seen_at: now,
            },
        );
    }

    /// Records that `exchange` entered `route_id`. Must be balanced by
    /// [`InFlightRegistry::remove_from_route`].
    pub fn add_to_route(&self, exchange: &Exchange, route_id: &str) {
        self.route_counts
            .entry(route_id.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        if let Some(mut record) = self.exchanges.get_mut(exchange.id()) {
            record.at_route_id = Some(route_id.to_string());
        }
    }

    /// Records that `exchange` finished processing. Unknown exchanges are ignored.
    pub fn remove(&self, exchange: &Exchange) {
        self.exchanges.remove(exchange.id());
    }

    /// Records that `exchange` left `route_id`. The counter never goes below zero.
    pub fn remove_from_route(&self, exchange: &Exchange, route_id: &str) {
        let Some(count) = self.route_counts.get(route_id) else {
            warn!(exchange_id = %exchange.id(), route_id, "unbalanced in-flight removal");
            return;
        };
        let result = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if result.is_err() {
            warn!(exchange_id = %exchange.id(), route_id, "unbalanced in-flight removal");
        }
    }

    /// Tracks `exchange` (and optionally its route) until the guard is dropped.
    #[must_use]
    pub fn track(self: &Arc<Self>, exchange: &Arc<Exchange>, route_id: Option<&str>) -> InFlightGuard {
        self.add(exchange);
        if let Some(route_id) = route_id {
            self.add_to_route(exchange, route_id);
        }
        InFlightGuard {
            registry: Arc::clone(self),
            exchange: Arc::clone(exchange),
            route_id: route_id.map(str::to_string),
        }
    }

    /// Updates the reported location of an in-flight exchange.
    pub fn update_location(&self, exchange_id: &ExchangeId, route_id: Option<&str>, node_id: &str) {
        if let Some(mut record) = self.exchanges.get_mut(exchange_id) {
            if let Some(route_id) = route_id {
                record.at_route_id = Some(route_id.to_string());
            }
            record.last_node_id = Some(node_id.to_string());
            record.last_seen_at = Instant::now();
        }
    }

    /// Last node reported for `exchange_id`, if it is in flight.
    #[must_use]
    pub fn last_node_id(&self, exchange_id: &ExchangeId) -> Option<String> {
        self.exchanges
            .get(exchange_id)
            .and_then(|record| record.last_node_id.clone())
    }

    /// Number of exchanges in flight.
    #[must_use]
    pub fn size(&self) -> usize {
        self.exchanges.len()
    }

    /// Number of exchanges currently inside `route_id`.
    #[must_use]
    pub fn size_of_route(&self, route_id: &str) -> usize {
        self.route_counts
            .get(route_id)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Snapshot of in-flight exchanges.
    ///
    /// With `route_id`, only exchanges created by or currently at that route
    /// are included. `sort_by_longest_duration` puts the oldest first; `limit`
    /// truncates after sorting.
    #[must_use]
    pub fn browse(
        &self,
        route_id: Option<&str>,
        limit: Option<usize>,
        sort_by_longest_duration: bool,
    ) -> Vec<InFlightExchange> {
        if !self.browse_enabled {
            return Vec::new();
        }
        let mut snapshot: Vec<InFlightExchange> = self
            .exchanges
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .filter(|ex| {
                route_id.map_or(true, |r| {
                    ex.from_route_id.as_deref() == Some(r) || ex.at_route_id.as_deref() == Some(r)
                })
            })
            .collect();

        if sort_by_longest_duration {
            snapshot.sort_by_key(|ex| ex.started_at);
        }
        if let Some(limit) = limit {
            snapshot.truncate(limit);
        }
        snapshot
    }

    /// The exchange with the earliest start among those matching `route_id`.
    #[must_use]
    pub fn oldest(&self, route_id: Option<&str>) -> Option<InFlightExchange> {
        self.browse(route_id, None, false)
            .into_iter()
            .min_by_key(|ex| ex.started_at)
    }

    /// Forgets every record and counter.
    pub fn clear(&self) {
        self.exchanges.clear();
        self.route_counts.clear();
    }
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedService for InFlightRegistry {
    fn name(&self) -> &'static str {
        "inflight"
    }

    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _terminate: bool) -> anyhow::Result<()> {
        let size = self.size();
        if size > 0 {
            warn!(size, "in-flight registry stopping with exchanges still in flight");
        } else {
            debug!("in-flight registry stopped");
        }
        self.clear();
        Ok(())
    }
}

/// RAII guard that removes an exchange from the registry when dropped.
///
/// Removal happens even if processing panics, since `Drop` runs during
/// unwinding.
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    exchange: Arc<Exchange>,
    route_id: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(route_id) = &self.route_id {
            self.registry.remove_from_route(&self.exchange, route_id);
        }
        self.registry.remove(&self.exchange);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use conduit_core::UnitOfWork;
    use proptest::prelude::*;

    use super::*;

    fn exchange(route: &str) -> Arc<Exchange> {
        Arc::new(Exchange::new().from_route(route))
    }

    #[test]
    fn add_and_remove_balance() {
        let registry = InFlightRegistry::new();
        let ex = exchange("orders");

        registry.add(&ex);
        registry.add_to_route(&ex, "orders");
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.size_of_route("orders"), 1);

        registry.remove_from_route(&ex, "orders");
        registry.remove(&ex);
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.size_of_route("orders"), 0);
    }

    #[test]
    fn unbalanced_remove_never_goes_negative() {
        let registry = InFlightRegistry::new();
        let ex = exchange("orders");
        registry.remove(&ex);
        registry.remove_from_route(&ex, "orders");
        registry.add_to_route(&ex, "orders");
        registry.remove_from_route(&ex, "orders");
        registry.remove_from_route(&ex, "orders");
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.size_of_route("orders"), 0);
    }

    #[test]
    fn guard_removes_on_drop() {
        let registry = Arc::new(InFlightRegistry::new());
        let ex = exchange("orders");
        let guard = registry.track(&ex, Some("orders"));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.size_of_route("orders"), 1);
        drop(guard);
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.size_of_route("orders"), 0);
    }

    #[test]
    fn browse_filters_sorts_and_limits() {
        let registry = InFlightRegistry::new();
        let first = exchange("a");
        registry.add(&first);
        thread::sleep(Duration::from_millis(2));
        let second = exchange("b");
        registry.add(&second);
        thread::sleep(Duration::from_millis(2));
        let third = exchange("a");
        registry.add(&third);

        let only_a = registry.browse(Some("a"), None, true);
        assert_eq!(only_a.len(), 2);
        assert_eq!(&only_a[0].exchange_id, first.id());

        let limited = registry.browse(None, Some(1), true);
        assert_eq!(limited.len(), 1);
        assert_eq!(&limited[0].exchange_id, first.id());

        assert_eq!(&registry.oldest(Some("b")).unwrap().exchange_id, second.id());
        assert!(registry.oldest(Some("missing")).is_none());
    }

    #[test]
    fn snapshot_reflects_live_route_and_node() {
        let registry = InFlightRegistry::new();
        let ex = exchange("entry");
        let uow = UnitOfWork::attach(&ex);
        registry.add(&ex);

        uow.push_route("sub");
        registry.update_location(ex.id(), None, "log-1");

        let snap = registry.browse(None, None, false).remove(0);
        assert_eq!(snap.from_route_id.as_deref(), Some("entry"));
        assert_eq!(snap.at_route_id.as_deref(), Some("sub"));
        assert_eq!(snap.last_node_id.as_deref(), Some("log-1"));
    }

    #[test]
    fn registry_does_not_extend_exchange_lifetime() {
        let registry = InFlightRegistry::new();
        let ex = exchange("orders");
        let weak = Arc::downgrade(&ex);
        registry.add(&ex);
        drop(ex);
        assert!(weak.upgrade().is_none());
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn browse_disabled_returns_nothing() {
        let registry = InFlightRegistry::with_browse_enabled(false);
        registry.add(&exchange("orders"));
        assert_eq!(registry.size(), 1);
        assert!(registry.browse(None, None, false).is_empty());
        assert!(registry.oldest(None).is_none());
    }

    #[test]
    fn concurrent_add_remove_returns_to_zero() {
        let registry = Arc::new(InFlightRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let ex = exchange("hot");
                        let _guard = registry.track(&ex, Some("hot"));
                        let _ = registry.browse(Some("hot"), Some(4), true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.size(), 0);
        assert_eq!(registry.size_of_route("hot"), 0);
    }

    proptest! {
        #[test]
        fn matched_add_remove_sequences_balance(ops in proptest::collection::vec((0usize..6, 0usize..3), 0..64)) {
            let registry = InFlightRegistry::new();
            let routes = ["r0", "r1", "r2"];
            let exchanges: Vec<_> = (0..6).map(|_| exchange("r0")).collect();
            let mut outstanding = Vec::new();

            for (ex_idx, route_idx) in ops {
                let ex = &exchanges[ex_idx];
                registry.add(ex);
                registry.add_to_route(ex, routes[route_idx]);
                outstanding.push((ex_idx, route_idx));
            }
            for (ex_idx, route_idx) in outstanding.into_iter().rev() {
                let ex = &exchanges[ex_idx];
                registry.remove_from_route(ex, routes[route_idx]);
                registry.remove(ex);
            }

            prop_assert_eq!(registry.size(), 0);
            for r in routes {
                prop_assert_eq!(registry.size_of_route(r), 0);
            }
        }
    }
}
