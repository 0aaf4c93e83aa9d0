//! The engine: owns every service and routes exchanges through them.

use std::sync::Arc;

use conduit_core::{AsyncCallback, AsyncProcessor, Exchange, ExchangeError, UnitOfWork};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::await_manager::AwaitManager;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::inflight::InFlightRegistry;
use crate::intercept::{InstrumentLayer, InterceptorChain, LocationLayer, ProcessorLayer};
use crate::registry::{ManagedService, ServiceContext, ServiceRegistry};
use crate::route::Route;
use crate::scheduler::{ScheduledTask, Scheduler, TaskKind};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownState};
use crate::watchdog::WatchdogHandle;

/// Message-routing engine.
///
/// Lifecycle: [`Engine::new`], [`Engine::add_route`] for each route,
/// [`Engine::start`], then [`Engine::submit`] / [`Engine::request`] until
/// [`Engine::stop`]. Once a stop has begun, intake is rejected with
/// [`ExchangeError::Rejected`].
pub struct Engine {
    config: Arc<EngineConfig>,
    scheduler: Arc<Scheduler>,
    inflight: Arc<InFlightRegistry>,
    await_manager: Arc<AwaitManager>,
    shutdown: Arc<ShutdownCoordinator>,
    services: ServiceRegistry,
    interceptors: InterceptorChain,
    routes: RwLock<Vec<Arc<Route>>>,
    watchdog: tokio::sync::Mutex<Option<WatchdogHandle>>,
}

impl Engine {
    /// Builds an engine with the default interceptors (instrumentation and
    /// location tracking).
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if `config` fails validation.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);

        let scheduler = Arc::new(Scheduler::new());
        let inflight = Arc::new(InFlightRegistry::with_browse_enabled(
            config.inflight.browse_enabled,
        ));
        let await_manager = Arc::new(
            AwaitManager::with_config(Arc::clone(&scheduler), &config.await_manager)
                .with_inflight_registry(Arc::clone(&inflight)),
        );
        let shutdown = Arc::new(
            ShutdownCoordinator::new(Arc::clone(&inflight), config.shutdown.clone())
                .with_await_manager(Arc::clone(&await_manager)),
        );

        let services = ServiceRegistry::new();
        services.register(Arc::clone(&scheduler) as Arc<dyn ManagedService>);
        services.register(Arc::clone(&inflight) as Arc<dyn ManagedService>);
        services.register(Arc::clone(&await_manager) as Arc<dyn ManagedService>);

        let interceptors = InterceptorChain::new()
            .layer(Arc::new(InstrumentLayer))
            .layer(Arc::new(
                LocationLayer::new(Arc::clone(&inflight))
                    .with_await_manager(Arc::clone(&await_manager)),
            ));

        Ok(Self {
            config,
            scheduler,
            inflight,
            await_manager,
            shutdown,
            services,
            interceptors,
            routes: RwLock::new(Vec::new()),
            watchdog: tokio::sync::Mutex::new(None),
        })
    }

    /// Appends an interceptor applied to routes added afterwards.
    #[must_use]
    pub fn with_interceptor(mut self, layer: Arc<dyn ProcessorLayer>) -> Self {
        self.interceptors.push(layer);
        self
    }

    /// Registers a route, wrapping its processor in the interceptor chain
    /// and in unit-of-work and in-flight tracking.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateRoute` if the id is taken.
    pub fn add_route(&self, mut route: Route) -> Result<Arc<Route>, EngineError> {
        let mut routes = self.routes.write();
        if routes.iter().any(|r| r.id() == route.id()) {
            return Err(EngineError::DuplicateRoute {
                route_id: route.id().to_string(),
            });
        }

        let intercepted = self
            .interceptors
            .apply(route.id(), Arc::clone(route.processor()));
        route.set_processor(Arc::new(RouteProcessor {
            route_id: route.id().to_string(),
            inner: intercepted,
            inflight: Arc::clone(&self.inflight),
        }));

        let route = Arc::new(route);
        routes.push(Arc::clone(&route));
        debug!(route_id = route.id(), startup_order = route.startup_order(), "route added");
        Ok(route)
    }

    /// Starts every service and, if enabled, the stuck-thread watchdog.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Service` if a service fails to start.
    pub async fn start(&self) -> Result<(), EngineError> {
        let ctx = ServiceContext {
            config: Arc::clone(&self.config),
        };
        self.services.start_all(&ctx).await?;

        if self.config.watchdog.enabled {
            *self.watchdog.lock().await = Some(WatchdogHandle::spawn(
                Arc::clone(&self.await_manager),
                &self.config.watchdog,
            ));
        }
        info!(
            engine = %self.config.name,
            routes = self.routes.read().len(),
            watchdog = self.config.watchdog.enabled,
            "engine started"
        );
        Ok(())
    }

    /// Creates an exchange originating from `route_id`.
    #[must_use]
    pub fn create_exchange(&self, route_id: &str) -> Arc<Exchange> {
        Arc::new(Exchange::new().from_route(route_id))
    }

    /// Submits `exchange` to `route_id` without blocking.
    ///
    /// `callback` fires once processing is done. A rejected exchange carries
    /// [`ExchangeError::Rejected`] and its callback fires immediately.
    ///
    /// # Errors
    ///
    /// `UnknownRoute`, or `NotAccepting` once shutdown has begun or the
    /// route's intake is suspended or stopped.
    pub fn submit(
        &self,
        route_id: &str,
        exchange: Arc<Exchange>,
        callback: AsyncCallback,
    ) -> Result<(), EngineError> {
        let route = match self.accepting_route(route_id) {
            Ok(route) => route,
            Err(e) => {
                reject(&exchange, &e);
                callback.done(true);
                return Err(e);
            }
        };

        let processor = Arc::clone(route.processor());
        let ex = Arc::clone(&exchange);
        self.scheduler.submit(
            ScheduledTask::new(TaskKind::Main, "route-entry", move || {
                processor.process(ex, callback);
            })
            .for_exchange(exchange),
        );
        Ok(())
    }

    /// Routes `exchange` through `route_id` and blocks until it completes.
    ///
    /// Blocks the calling thread; call it from `spawn_blocking` or a plain
    /// thread, never from an async task.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::submit`]. Processing failures are not errors; they
    /// are carried on the exchange.
    pub fn request(&self, route_id: &str, exchange: &Arc<Exchange>) -> Result<(), EngineError> {
        let route = self.accepting_route(route_id).map_err(|e| {
            reject(exchange, &e);
            e
        })?;
        self.await_manager.process(route.processor().as_ref(), exchange);
        Ok(())
    }

    fn accepting_route(&self, route_id: &str) -> Result<Arc<Route>, EngineError> {
        let state = self.shutdown.state();
        if state != ShutdownState::Running {
            return Err(EngineError::NotAccepting {
                state: format!("{state:?}"),
            });
        }
        let route = self.route(route_id).ok_or_else(|| EngineError::UnknownRoute {
            route_id: route_id.to_string(),
        })?;
        if !route.is_accepting() {
            return Err(EngineError::NotAccepting {
                state: route.status().to_string(),
            });
        }
        Ok(route)
    }

    /// Gracefully shuts every route down, then stops the services.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Shutdown` if a shutdown already ran or is running.
    pub async fn stop(&self) -> Result<ShutdownReport, EngineError> {
        let routes = self.routes();
        info!(engine = %self.config.name, routes = routes.len(), "engine stopping");

        let report = self.shutdown.shutdown(&routes).await?;

        if let Some(mut watchdog) = self.watchdog.lock().await.take() {
            watchdog.stop().await;
        }
        let failed = self.services.stop_all(false).await;
        if !failed.is_empty() {
            warn!(services = ?failed, "services failed to stop");
        }

        info!(
            engine = %self.config.name,
            timed_out = report.timed_out,
            forced = report.forced,
            elapsed_ms = report.elapsed.as_millis(),
            "engine stopped"
        );
        Ok(report)
    }

    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.read().iter().find(|r| r.id() == route_id).cloned()
    }

    /// Routes in registration order.
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn inflight(&self) -> &Arc<InFlightRegistry> {
        &self.inflight
    }

    #[must_use]
    pub fn await_manager(&self) -> &Arc<AwaitManager> {
        &self.await_manager
    }

    #[must_use]
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }
}

fn reject(exchange: &Exchange, error: &EngineError) {
    exchange.set_error(Some(ExchangeError::Rejected {
        reason: error.to_string(),
    }));
}

/// Outermost processor of every route.
///
/// Attaches a unit of work if the exchange has none (and then owns its
/// completion), keeps the in-flight registry and the route stack balanced,
/// and fires the route hooks.
struct RouteProcessor {
    route_id: String,
    inner: Arc<dyn AsyncProcessor>,
    inflight: Arc<InFlightRegistry>,
}

impl AsyncProcessor for RouteProcessor {
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        let (uow, owned) = match exchange.unit_of_work() {
            Some(uow) => (uow, false),
            None => (UnitOfWork::attach(&exchange), true),
        };
        if owned {
            self.inflight.add(&exchange);
        }
        self.inflight.add_to_route(&exchange, &self.route_id);
        uow.push_route(self.route_id.clone());
        uow.before_route(&exchange, &self.route_id);

        let route_id = self.route_id.clone();
        let inflight = Arc::clone(&self.inflight);
        let ex = Arc::clone(&exchange);
        let done = AsyncCallback::new(move |done_sync| {
            uow.after_route(&ex, &route_id);
            uow.pop_route();
            inflight.remove_from_route(&ex, &route_id);
            if owned {
                uow.done(&ex);
                ex.set_unit_of_work(None);
                inflight.remove(&ex);
            }
            callback.done(done_sync);
        });

        self.inner.process(exchange, done)
    }

    fn id(&self) -> Option<&str> {
        Some(&self.route_id)
    }
}
