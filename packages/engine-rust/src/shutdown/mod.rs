//! Graceful and forced shutdown of routes.
//!
//! State machine: Running -> Stopping(Graceful) -> Stopping(Forced) -> Stopped

mod coordinator;

use std::time::Duration;

pub use coordinator::ShutdownCoordinator;

use crate::inflight::InFlightExchange;

/// How the coordinator is currently stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Intake stopped, waiting for in-flight exchanges to drain.
    Graceful,
    /// Timeout elapsed; remaining consumers have been told to stop now.
    Forced,
}

/// Coordinator lifecycle, observable through [`ShutdownCoordinator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping(StopMode),
    Stopped,
}

/// A route that did not stop cleanly.
#[derive(Debug, Clone)]
pub struct RouteFailure {
    pub route_id: String,
    pub error: String,
}

/// Outcome of one shutdown or suspend run.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Route ids in the order they were shut down.
    pub routes: Vec<String>,
    pub timed_out: bool,
    /// Remaining routes were forced to stop after the timeout.
    pub forced: bool,
    /// The run gave up after the timeout and left routes as they were.
    pub aborted: bool,
    pub failures: Vec<RouteFailure>,
    /// In-flight exchanges captured when the timeout elapsed.
    pub pending_at_timeout: Vec<InFlightExchange>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// True if every route drained and stopped without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.timed_out && self.failures.is_empty()
    }
}
