//! Conduit engine: trampoline scheduler, blocking await bridge, in-flight
//! tracking and graceful shutdown for message routes.

pub mod await_manager;
pub mod config;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod intercept;
pub mod pipeline;
pub mod registry;
pub mod route;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use await_manager::{AwaitManager, AwaitStatistics, AwaitStatisticsSnapshot, AwaitThread};
pub use config::{
    AwaitManagerConfig, EngineConfig, InFlightConfig, ShutdownConfig, TimeUnit, WatchdogConfig,
};
pub use engine::Engine;
pub use error::{ConfigError, EngineError, ShutdownError};
pub use inflight::{InFlightExchange, InFlightGuard, InFlightRegistry};
pub use intercept::{InterceptorChain, ProcessorLayer};
pub use pipeline::Pipeline;
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use route::{
    Route, RouteConsumer, RouteStatus, ShutdownAware, ShutdownRoute, ShutdownRunningTask,
};
pub use scheduler::{ScheduledTask, Scheduler, TaskKind};
pub use shutdown::{RouteFailure, ShutdownCoordinator, ShutdownReport, ShutdownState, StopMode};
pub use telemetry::{init_tracing, LogFormat};
pub use watchdog::{StuckThreadWatchdog, WatchdogHandle, WatchdogScan};
