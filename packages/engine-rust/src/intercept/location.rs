//! Reports each processor an exchange enters to the in-flight registry and
//! the await manager, so snapshots show where an exchange is stuck.

use std::sync::Arc;

use conduit_core::{AsyncCallback, AsyncProcessor, Exchange};

use super::ProcessorLayer;
use crate::await_manager::AwaitManager;
use crate::inflight::InFlightRegistry;

pub struct LocationLayer {
    inflight: Arc<InFlightRegistry>,
    await_manager: Option<Arc<AwaitManager>>,
}

impl LocationLayer {
    #[must_use]
    pub fn new(inflight: Arc<InFlightRegistry>) -> Self {
        Self {
            inflight,
            await_manager: None,
        }
    }

    #[must_use]
    pub fn with_await_manager(mut self, await_manager: Arc<AwaitManager>) -> Self {
        self.await_manager = Some(await_manager);
        self
    }
}

impl ProcessorLayer for LocationLayer {
    fn wrap(&self, route_id: &str, processor: Arc<dyn AsyncProcessor>) -> Arc<dyn AsyncProcessor> {
        // Unnamed processors are reported under their route.
        let node_id = processor.id().unwrap_or(route_id).to_string();
        Arc::new(LocatedProcessor {
            route_id: route_id.to_string(),
            node_id,
            inflight: Arc::clone(&self.inflight),
            await_manager: self.await_manager.clone(),
            inner: processor,
        })
    }
}

pub struct LocatedProcessor {
    route_id: String,
    node_id: String,
    inflight: Arc<InFlightRegistry>,
    await_manager: Option<Arc<AwaitManager>>,
    inner: Arc<dyn AsyncProcessor>,
}

impl AsyncProcessor for LocatedProcessor {
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        self.inflight
            .update_location(exchange.id(), Some(&self.route_id), &self.node_id);
        if let Some(await_manager) = &self.await_manager {
            await_manager.update_node(exchange.id(), &self.node_id);
        }
        self.inner.process(exchange, callback)
    }

    fn id(&self) -> Option<&str> {
        self.inner.id()
    }
}
