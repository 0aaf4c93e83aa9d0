//! Engine services with an explicit start/stop lifecycle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::EngineConfig;

/// Handed to every service when the engine starts.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<EngineConfig>,
}

/// A component the engine starts before intake opens and stops after the
/// routes have shut down.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Unique name, used in logs and for lookup (e.g. `"inflight"`).
    fn name(&self) -> &'static str;

    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// If `terminate` is true, skip graceful cleanup.
    async fn stop(&self, terminate: bool) -> anyhow::Result<()>;
}

/// Ordered set of services. Starts in registration order and stops in
/// reverse.
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn ManagedService>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: RwLock::new(Vec::new()),
        }
    }

    /// Adds `service` after the ones already registered. Returns `false`
    /// and keeps the existing service if the name is taken.
    pub fn register(&self, service: Arc<dyn ManagedService>) -> bool {
        let mut services = self.services.write();
        if services.iter().any(|s| s.name() == service.name()) {
            warn!(service = service.name(), "service already registered, ignoring");
            return false;
        }
        services.push(service);
        true
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.services
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    /// Service names in start order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.services.read().iter().map(|s| s.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Starts every service in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `start()` failure. Services started before it are
    /// stopped again in reverse order, and later services are not started.
    pub async fn start_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let services = self.services.read().clone();
        for (started, service) in services.iter().enumerate() {
            if let Err(e) = service.start(ctx).await {
                warn!(service = service.name(), error = %e, "service failed to start, rolling back");
                for earlier in services[..started].iter().rev() {
                    if let Err(stop_err) = earlier.stop(true).await {
                        warn!(service = earlier.name(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(e.context(format!("starting service {}", service.name())));
            }
            debug!(service = service.name(), "service started");
        }
        Ok(())
    }

    /// Stops every service in reverse registration order.
    ///
    /// A failing service does not prevent the others from stopping; the
    /// names of the services that failed are returned.
    pub async fn stop_all(&self, terminate: bool) -> Vec<&'static str> {
        let services = self.services.read().clone();
        let mut failed = Vec::new();
        for service in services.iter().rev() {
            if let Err(e) = service.stop(terminate).await {
                warn!(service = service.name(), error = %e, "service failed to stop, continuing");
                failed.push(service.name());
            }
        }
        failed
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        fail_start: bool,
        fail_stop: bool,
        log: Log,
    }

    impl Recording {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                fail_start: false,
                fail_stop: false,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl ManagedService for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.log.lock().push(format!("start:{}", self.name));
            if self.fail_start {
                anyhow::bail!("{} refused to start", self.name);
            }
            Ok(())
        }

        async fn stop(&self, terminate: bool) -> anyhow::Result<()> {
            self.log.lock().push(format!("stop:{}:{terminate}", self.name));
            if self.fail_stop {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    fn ctx() -> ServiceContext {
        ServiceContext {
            config: Arc::new(EngineConfig::default()),
        }
    }

    #[test]
    fn duplicate_name_keeps_first_service() {
        let log = Log::default();
        let registry = ServiceRegistry::new();
        assert!(registry.register(Arc::new(Recording::new("inflight", &log))));
        assert!(registry.register(Arc::new(Recording::new("scheduler", &log))));
        assert!(!registry.register(Arc::new(Recording::new("inflight", &log))));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["inflight", "scheduler"]);
        assert!(registry.get_by_name("scheduler").is_some());
        assert!(registry.get_by_name("nonexistent").is_none());
    }

    #[tokio::test]
    async fn start_in_order_stop_in_reverse() {
        let log = Log::default();
        let registry = ServiceRegistry::new();
        for name in ["first", "second", "third"] {
            registry.register(Arc::new(Recording::new(name, &log)));
        }

        registry.start_all(&ctx()).await.unwrap();
        assert!(registry.stop_all(false).await.is_empty());

        assert_eq!(
            *log.lock(),
            vec![
                "start:first",
                "start:second",
                "start:third",
                "stop:third:false",
                "stop:second:false",
                "stop:first:false"
            ]
        );
    }

    #[tokio::test]
    async fn failed_start_rolls_back_started_services() {
        let log = Log::default();
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(Recording::new("first", &log)));
        registry.register(Arc::new(Recording::new("second", &log)));
        let mut broken = Recording::new("broken", &log);
        broken.fail_start = true;
        registry.register(Arc::new(broken));
        registry.register(Arc::new(Recording::new("never", &log)));

        let err = registry.start_all(&ctx()).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert_eq!(
            *log.lock(),
            vec![
                "start:first",
                "start:second",
                "start:broken",
                "stop:second:true",
                "stop:first:true"
            ]
        );
    }

    #[tokio::test]
    async fn stop_continues_past_failure() {
        let log = Log::default();
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(Recording::new("first", &log)));
        let mut broken = Recording::new("broken", &log);
        broken.fail_stop = true;
        registry.register(Arc::new(broken));

        let failed = registry.stop_all(true).await;
        assert_eq!(failed, vec!["broken"]);
        assert_eq!(*log.lock(), vec!["stop:broken:true", "stop:first:true"]);
    }
}
