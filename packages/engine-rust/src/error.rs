//! Engine-level error types.

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("timeout must be a positive value")]
    NonPositiveTimeout,
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by [`Engine`](crate::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown route: {route_id}")]
    UnknownRoute { route_id: String },
    #[error("route already registered: {route_id}")]
    DuplicateRoute { route_id: String },
    #[error("engine is not accepting new exchanges ({state})")]
    NotAccepting { state: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    /// A service failed to start.
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

/// Errors returned by the [`ShutdownCoordinator`](crate::ShutdownCoordinator).
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("timeout must be a positive value")]
    NonPositiveTimeout,
    #[error("a shutdown is already in progress")]
    AlreadyInProgress,
    #[error("already shut down")]
    AlreadyStopped,
}
