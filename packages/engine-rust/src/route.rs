//! Routes and the consumer contract the shutdown coordinator drives.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::AsyncProcessor;
use parking_lot::Mutex;

/// Whether a route is stopped with the others or after the drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownRoute {
    #[default]
    Default,
    /// Keep the consumer running until every other route has drained.
    Defer,
}

/// How much pending work a consumer finishes before it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownRunningTask {
    #[default]
    CompleteCurrentTaskOnly,
    CompleteAllTasks,
}

/// Lifecycle of a route's intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Started,
    Suspended,
    Stopped,
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Suspended => "suspended",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Capability of a consumer that holds work of its own (batches, buffers).
pub trait ShutdownAware: Send + Sync {
    /// Returns `true` to keep running until its pending work reaches zero.
    fn defer_shutdown(&self, mode: ShutdownRunningTask) -> bool;

    /// Exchanges held by the consumer that are not yet in flight.
    fn pending_exchanges_size(&self) -> usize;
}

/// Source of exchanges for a route.
#[async_trait]
pub trait RouteConsumer: Send + Sync {
    /// Stops intake for good.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Pauses intake. Only called when [`RouteConsumer::is_suspendable`].
    async fn suspend(&self) -> anyhow::Result<()> {
        self.stop().await
    }

    fn is_suspendable(&self) -> bool {
        false
    }

    /// Non-blocking forced-stop signal sent when a graceful stop timed out.
    fn stop_now(&self) {}

    /// Notified before the drain (`forced == false`) and again if the drain
    /// is abandoned (`forced == true`).
    fn prepare_shutdown(&self, _suspend_only: bool, _forced: bool) {}

    fn shutdown_aware(&self) -> Option<&dyn ShutdownAware> {
        None
    }
}

/// A processor chain plus the consumer feeding it.
pub struct Route {
    id: String,
    startup_order: i32,
    processor: Arc<dyn AsyncProcessor>,
    consumer: Option<Arc<dyn RouteConsumer>>,
    shutdown_route: ShutdownRoute,
    shutdown_running_task: ShutdownRunningTask,
    status: Mutex<RouteStatus>,
}

impl Route {
    pub fn new(id: impl Into<String>, processor: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            id: id.into(),
            startup_order: 0,
            processor,
            consumer: None,
            shutdown_route: ShutdownRoute::Default,
            shutdown_running_task: ShutdownRunningTask::CompleteCurrentTaskOnly,
            status: Mutex::new(RouteStatus::Started),
        }
    }

    #[must_use]
    pub fn with_startup_order(mut self, order: i32) -> Self {
        self.startup_order = order;
        self
    }

    #[must_use]
    pub fn with_consumer(mut self, consumer: Arc<dyn RouteConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    #[must_use]
    pub fn with_shutdown_route(mut self, mode: ShutdownRoute) -> Self {
        self.shutdown_route = mode;
        self
    }

    #[must_use]
    pub fn with_shutdown_running_task(mut self, mode: ShutdownRunningTask) -> Self {
        self.shutdown_running_task = mode;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn startup_order(&self) -> i32 {
        self.startup_order
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<dyn AsyncProcessor> {
        &self.processor
    }

    /// Replaces the processor, typically with an intercepted wrapper.
    pub(crate) fn set_processor(&mut self, processor: Arc<dyn AsyncProcessor>) {
        self.processor = processor;
    }

    #[must_use]
    pub fn consumer(&self) -> Option<&Arc<dyn RouteConsumer>> {
        self.consumer.as_ref()
    }

    #[must_use]
    pub fn shutdown_route(&self) -> ShutdownRoute {
        self.shutdown_route
    }

    #[must_use]
    pub fn shutdown_running_task(&self) -> ShutdownRunningTask {
        self.shutdown_running_task
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RouteStatus) {
        *self.status.lock() = status;
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.status() == RouteStatus::Started
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("startup_order", &self.startup_order)
            .field("shutdown_route", &self.shutdown_route)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
