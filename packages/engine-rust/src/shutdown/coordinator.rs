use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{RouteFailure, ShutdownReport, ShutdownState, StopMode};
use crate::await_manager::AwaitManager;
use crate::config::{ShutdownConfig, TimeUnit};
use crate::error::ShutdownError;
use crate::inflight::{InFlightExchange, InFlightRegistry};
use crate::route::{Route, RouteStatus, ShutdownRoute};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
struct RunOptions {
    suspend_only: bool,
    abort_after_timeout: bool,
    force: bool,
    /// Drives the coordinator's own state machine (whole-engine shutdown).
    global: bool,
}

/// Stops route intake, drains in-flight exchanges and forces the rest.
///
/// Every run is bounded by its timeout plus `forced_stop_timeout_ms`. The
/// graceful phase runs inside `tokio::time::timeout`, so a consumer whose
/// `stop` never returns cannot hold up the shutdown.
pub struct ShutdownCoordinator {
    inflight: Arc<InFlightRegistry>,
    await_manager: Option<Arc<AwaitManager>>,
    config: ArcSwap<ShutdownConfig>,
    state: Arc<ArcSwap<ShutdownState>>,
    signal: watch::Sender<ShutdownState>,
    in_progress: AtomicBool,
    timeout_occurred: AtomicBool,
    force_shutdown: AtomicBool,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(inflight: Arc<InFlightRegistry>, config: ShutdownConfig) -> Self {
        let (tx, _rx) = watch::channel(ShutdownState::Running);
        Self {
            inflight,
            await_manager: None,
            config: ArcSwap::from_pointee(config),
            state: Arc::new(ArcSwap::from_pointee(ShutdownState::Running)),
            signal: tx,
            in_progress: AtomicBool::new(false),
            timeout_occurred: AtomicBool::new(false),
            force_shutdown: AtomicBool::new(false),
        }
    }

    /// Blocked callers of `await_manager` are interrupted on forced shutdown
    /// when its `interrupt_threads_while_stopping` is set.
    #[must_use]
    pub fn with_await_manager(mut self, await_manager: Arc<AwaitManager>) -> Self {
        self.await_manager = Some(await_manager);
        self
    }

    #[must_use]
    pub fn config(&self) -> Arc<ShutdownConfig> {
        self.config.load_full()
    }

    pub fn set_timeout(&self, timeout: u64) {
        self.update_config(|c| c.timeout = timeout);
    }

    pub fn set_time_unit(&self, unit: TimeUnit) {
        self.update_config(|c| c.time_unit = unit);
    }

    pub fn set_shutdown_now_on_timeout(&self, enabled: bool) {
        self.update_config(|c| c.shutdown_now_on_timeout = enabled);
    }

    pub fn set_shutdown_routes_in_reverse_order(&self, enabled: bool) {
        self.update_config(|c| c.shutdown_routes_in_reverse_order = enabled);
    }

    pub fn set_suppress_logging_on_timeout(&self, enabled: bool) {
        self.update_config(|c| c.suppress_logging_on_timeout = enabled);
    }

    pub fn set_log_inflight_exchanges_on_timeout(&self, enabled: bool) {
        self.update_config(|c| c.log_inflight_exchanges_on_timeout = enabled);
    }

    fn update_config(&self, mut update: impl FnMut(&mut ShutdownConfig)) {
        self.config.rcu(|current| {
            let mut next = ShutdownConfig::clone(current);
            update(&mut next);
            next
        });
    }

    #[must_use]
    pub fn state(&self) -> ShutdownState {
        **self.state.load()
    }

    /// Shared handle to the state for intake checks on hot paths.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<ShutdownState>> {
        Arc::clone(&self.state)
    }

    /// Returns a receiver notified on every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.signal.subscribe()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Whether the last run hit its timeout.
    #[must_use]
    pub fn has_timeout_occurred(&self) -> bool {
        self.timeout_occurred.load(Ordering::SeqCst)
    }

    /// Whether the last run forced routes to stop after a timeout.
    #[must_use]
    pub fn is_force_shutdown(&self) -> bool {
        self.force_shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ShutdownState) {
        self.state.store(Arc::new(state));
        self.signal.send_replace(state);
    }

    /// Shuts down `routes` using the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`ShutdownCoordinator::shutdown_with_timeout`].
    pub async fn shutdown(&self, routes: &[Arc<Route>]) -> Result<ShutdownReport, ShutdownError> {
        let timeout = self.config().timeout_duration();
        self.shutdown_with_timeout(routes, timeout).await
    }

    /// Shuts down `routes`, moving the coordinator to `Stopped`.
    ///
    /// # Errors
    ///
    /// `NonPositiveTimeout` for a zero timeout, `AlreadyInProgress` or
    /// `AlreadyStopped` if an engine shutdown already started.
    pub async fn shutdown_with_timeout(
        &self,
        routes: &[Arc<Route>],
        timeout: Duration,
    ) -> Result<ShutdownReport, ShutdownError> {
        let opts = RunOptions {
            global: true,
            ..RunOptions::default()
        };
        self.run(routes, timeout, opts).await
    }

    /// Like [`ShutdownCoordinator::shutdown`], but forces the remaining
    /// routes on timeout even if `shutdown_now_on_timeout` is off.
    ///
    /// # Errors
    ///
    /// See [`ShutdownCoordinator::shutdown_with_timeout`].
    pub async fn shutdown_forced(&self, routes: &[Arc<Route>]) -> Result<ShutdownReport, ShutdownError> {
        let timeout = self.config().timeout_duration();
        let opts = RunOptions {
            global: true,
            force: true,
            ..RunOptions::default()
        };
        self.run(routes, timeout, opts).await
    }

    /// Suspends intake of `routes` and drains them without stopping them.
    ///
    /// # Errors
    ///
    /// `NonPositiveTimeout` if the configured timeout is zero.
    pub async fn suspend(&self, routes: &[Arc<Route>]) -> Result<ShutdownReport, ShutdownError> {
        let timeout = self.config().timeout_duration();
        let opts = RunOptions {
            suspend_only: true,
            ..RunOptions::default()
        };
        self.run(routes, timeout, opts).await
    }

    /// Shuts down a single route.
    ///
    /// Returns `false` if the timeout elapsed and `abort_after_timeout` left
    /// the route running.
    ///
    /// # Errors
    ///
    /// `NonPositiveTimeout` for a zero timeout.
    pub async fn shutdown_route(
        &self,
        route: &Arc<Route>,
        timeout: Duration,
        abort_after_timeout: bool,
    ) -> Result<bool, ShutdownError> {
        let opts = RunOptions {
            abort_after_timeout,
            ..RunOptions::default()
        };
        let report = self.run(std::slice::from_ref(route), timeout, opts).await?;
        Ok(!report.aborted)
    }

    async fn run(
        &self,
        routes: &[Arc<Route>],
        timeout: Duration,
        opts: RunOptions,
    ) -> Result<ShutdownReport, ShutdownError> {
        if timeout.is_zero() {
            return Err(ShutdownError::NonPositiveTimeout);
        }
        if opts.global {
            if self.state() == ShutdownState::Stopped {
                return Err(ShutdownError::AlreadyStopped);
            }
            if self.in_progress.swap(true, Ordering::SeqCst) {
                return Err(ShutdownError::AlreadyInProgress);
            }
        }

        let config = self.config();
        let started = Instant::now();
        self.timeout_occurred.store(false, Ordering::SeqCst);
        self.force_shutdown.store(false, Ordering::SeqCst);

        let ordered = order_routes(routes, config.shutdown_routes_in_reverse_order);
        let mut report = ShutdownReport {
            routes: ordered.iter().map(|r| r.id().to_string()).collect(),
            ..ShutdownReport::default()
        };
        let action = if opts.suspend_only { "suspend" } else { "shutdown" };

        if ordered.is_empty() {
            debug!(action, "no routes to stop");
        } else {
            if opts.global {
                self.set_state(ShutdownState::Stopping(StopMode::Graceful));
            }
            info!(
                action,
                routes = ordered.len(),
                timeout_ms = timeout.as_millis(),
                "starting graceful {action} of routes"
            );

            let failures = Mutex::new(Vec::new());
            let drained = tokio::time::timeout(
                timeout,
                self.graceful(&ordered, &config, opts.suspend_only, &failures),
            )
            .await
            .is_ok();

            if !drained {
                self.timeout_occurred.store(true, Ordering::SeqCst);
                report.timed_out = true;
                if config.log_inflight_exchanges_on_timeout {
                    report.pending_at_timeout = self.inflight.browse(None, None, true);
                    log_inflight(&report.pending_at_timeout, &config);
                }

                if opts.abort_after_timeout {
                    log_timeout(&config, "timeout occurred during graceful shutdown, aborting");
                    report.aborted = true;
                } else if opts.force || config.shutdown_now_on_timeout {
                    self.force(&ordered, &config, opts).await;
                    report.forced = true;
                } else {
                    log_timeout(
                        &config,
                        "timeout occurred during graceful shutdown, remaining routes left running",
                    );
                }
            }
            report.failures = failures.into_inner();
        }

        report.elapsed = started.elapsed();
        if opts.global {
            self.set_state(ShutdownState::Stopped);
            self.in_progress.store(false, Ordering::SeqCst);
        }
        info!(
            action,
            routes = report.routes.len(),
            timed_out = report.timed_out,
            forced = report.forced,
            failures = report.failures.len(),
            elapsed_ms = report.elapsed.as_millis(),
            "graceful {action} finished"
        );
        Ok(report)
    }

    async fn graceful(
        &self,
        routes: &[Arc<Route>],
        config: &ShutdownConfig,
        suspend_only: bool,
        failures: &Mutex<Vec<RouteFailure>>,
    ) {
        // (route, already suspended) pairs still to be handled after the drain.
        let mut deferred: Vec<(&Arc<Route>, bool)> = Vec::new();

        for route in routes {
            let consumer = route.consumer();
            let aware_defers = consumer
                .and_then(|c| c.shutdown_aware())
                .is_some_and(|a| a.defer_shutdown(route.shutdown_running_task()));

            if route.shutdown_route() == ShutdownRoute::Defer || aware_defers {
                debug!(route_id = route.id(), "route deferred until in-flight exchanges complete");
                deferred.push((route, false));
            } else if suspend_only || consumer.is_some_and(|c| c.is_suspendable()) {
                suspend_route(route, failures).await;
                deferred.push((route, true));
            } else {
                stop_route(route, failures).await;
            }
        }

        for route in routes {
            if let Some(consumer) = route.consumer() {
                consumer.prepare_shutdown(suspend_only, false);
            }
        }

        self.wait_for_drain(routes, config).await;

        for (route, suspended) in deferred {
            if !suspend_only {
                stop_route(route, failures).await;
            } else if !suspended {
                suspend_route(route, failures).await;
            }
        }
    }

    async fn wait_for_drain(&self, routes: &[Arc<Route>], config: &ShutdownConfig) {
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let mut last_log: Option<Instant> = None;

        loop {
            let pending = self.pending(routes);
            if pending == 0 {
                return;
            }
            if last_log.map_or(true, |t| t.elapsed() >= PROGRESS_LOG_INTERVAL) {
                info!(pending, "waiting for in-flight and pending exchanges to complete");
                for route in routes {
                    let inflight = self.inflight.size_of_route(route.id());
                    if inflight > 0 {
                        debug!(route_id = route.id(), inflight, "route still has in-flight exchanges");
                    }
                }
                last_log = Some(Instant::now());
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn pending(&self, routes: &[Arc<Route>]) -> usize {
        routes
            .iter()
            .map(|route| {
                let held = route
                    .consumer()
                    .and_then(|c| c.shutdown_aware())
                    .map_or(0, |a| a.pending_exchanges_size());
                self.inflight.size_of_route(route.id()) + held
            })
            .sum()
    }

    async fn force(&self, routes: &[Arc<Route>], config: &ShutdownConfig, opts: RunOptions) {
        if opts.global {
            self.set_state(ShutdownState::Stopping(StopMode::Forced));
        }
        self.force_shutdown.store(true, Ordering::SeqCst);
        log_timeout(
            config,
            "timeout occurred during graceful shutdown, forcing the routes to be shut down now",
        );

        let final_status = if opts.suspend_only {
            RouteStatus::Suspended
        } else {
            RouteStatus::Stopped
        };
        for route in routes {
            if route.status() == final_status {
                continue;
            }
            if let Some(consumer) = route.consumer() {
                consumer.stop_now();
                consumer.prepare_shutdown(opts.suspend_only, true);
            }
            route.set_status(final_status);
        }

        if let Some(await_manager) = &self.await_manager {
            if await_manager.is_interrupt_threads_while_stopping() {
                let released = await_manager.interrupt_all();
                if released > 0 {
                    warn!(released, "interrupted blocked threads during forced shutdown");
                }
            }
        }

        // Give forced consumers a bounded moment to let go of their exchanges.
        let grace = Duration::from_millis(config.forced_stop_timeout_ms);
        if tokio::time::timeout(grace, self.wait_for_drain(routes, config))
            .await
            .is_err()
        {
            log_timeout(config, "exchanges still in flight after forced shutdown");
        }
    }
}

fn order_routes(routes: &[Arc<Route>], reverse: bool) -> Vec<Arc<Route>> {
    let mut ordered = routes.to_vec();
    // Stable, so equal startup orders keep registration order.
    ordered.sort_by_key(|r| r.startup_order());
    if reverse {
        ordered.reverse();
    }
    ordered
}

async fn stop_route(route: &Route, failures: &Mutex<Vec<RouteFailure>>) {
    if let Some(consumer) = route.consumer() {
        if let Err(e) = consumer.stop().await {
            warn!(route_id = route.id(), error = %e, "route failed to stop cleanly");
            failures.lock().push(RouteFailure {
                route_id: route.id().to_string(),
                error: e.to_string(),
            });
        }
    }
    route.set_status(RouteStatus::Stopped);
    debug!(route_id = route.id(), "route stopped");
}

async fn suspend_route(route: &Route, failures: &Mutex<Vec<RouteFailure>>) {
    if let Some(consumer) = route.consumer() {
        if let Err(e) = consumer.suspend().await {
            warn!(route_id = route.id(), error = %e, "route failed to suspend cleanly");
            failures.lock().push(RouteFailure {
                route_id: route.id().to_string(),
                error: e.to_string(),
            });
        }
    }
    route.set_status(RouteStatus::Suspended);
    debug!(route_id = route.id(), "route suspended");
}

fn log_timeout(config: &ShutdownConfig, message: &str) {
    if config.suppress_logging_on_timeout {
        trace!("{message}");
    } else {
        warn!("{message}");
    }
}

fn log_inflight(exchanges: &[InFlightExchange], config: &ShutdownConfig) {
    if config.suppress_logging_on_timeout || exchanges.is_empty() {
        return;
    }
    warn!(count = exchanges.len(), "exchanges still in flight at shutdown timeout");
    for ex in exchanges {
        warn!(
            exchange_id = %ex.exchange_id,
            from_route_id = ex.from_route_id.as_deref().unwrap_or(""),
            at_route_id = ex.at_route_id.as_deref().unwrap_or(""),
            node_id = ex.last_node_id.as_deref().unwrap_or(""),
            duration_ms = ex.duration().as_millis(),
            "in-flight exchange"
        );
    }
}
