//! Processor interceptors applied to every route at registration.
//!
//! Layer order follows registration: the first layer added is the outermost
//! wrapper and sees an exchange first.

pub mod instrument;
pub mod location;

use std::sync::Arc;

use conduit_core::AsyncProcessor;

pub use instrument::InstrumentLayer;
pub use location::LocationLayer;

/// Wraps a route's processor with cross-cutting behaviour.
pub trait ProcessorLayer: Send + Sync {
    fn wrap(&self, route_id: &str, processor: Arc<dyn AsyncProcessor>) -> Arc<dyn AsyncProcessor>;
}

/// Ordered list of [`ProcessorLayer`]s.
#[derive(Default, Clone)]
pub struct InterceptorChain {
    layers: Vec<Arc<dyn ProcessorLayer>>,
}

impl InterceptorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer inside the ones already registered.
    #[must_use]
    pub fn layer(mut self, layer: Arc<dyn ProcessorLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn push(&mut self, layer: Arc<dyn ProcessorLayer>) {
        self.layers.push(layer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `processor` in every layer, innermost last-added.
    #[must_use]
    pub fn apply(&self, route_id: &str, processor: Arc<dyn AsyncProcessor>) -> Arc<dyn AsyncProcessor> {
        self.layers
            .iter()
            .rev()
            .fold(processor, |inner, layer| layer.wrap(route_id, inner))
    }
}
