//! Timing and counting of route processors.
//!
//! Each invocation runs inside a `processor` tracing span and feeds the
//! `conduit_processor_invocations_total` counter and the
//! `conduit_processor_duration_ms` histogram, labelled by route and outcome.

use std::sync::Arc;
use std::time::Instant;

use conduit_core::{AsyncCallback, AsyncProcessor, Exchange};
use tracing::{debug, info_span};

use super::ProcessorLayer;

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentLayer;

impl ProcessorLayer for InstrumentLayer {
    fn wrap(&self, route_id: &str, processor: Arc<dyn AsyncProcessor>) -> Arc<dyn AsyncProcessor> {
        Arc::new(InstrumentedProcessor {
            route_id: route_id.to_string(),
            inner: processor,
        })
    }
}

// ---------------------------------------------------------------------------
// InstrumentedProcessor
// ---------------------------------------------------------------------------

pub struct InstrumentedProcessor {
    route_id: String,
    inner: Arc<dyn AsyncProcessor>,
}

impl AsyncProcessor for InstrumentedProcessor {
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        let node_id = self.inner.id().unwrap_or("").to_string();
        let span = info_span!(
            "processor",
            route_id = %self.route_id,
            node_id = %node_id,
            exchange_id = %exchange.id(),
        );
        let _enter = span.enter();

        metrics::counter!("conduit_processor_invocations_total", "route" => self.route_id.clone())
            .increment(1);

        let start = Instant::now();
        let route_id = self.route_id.clone();
        let ex = Arc::clone(&exchange);
        let timed = AsyncCallback::new(move |done_sync| {
            let outcome = if ex.is_failed() { "error" } else { "ok" };
            #[allow(clippy::cast_precision_loss)]
            let duration_ms = start.elapsed().as_micros() as f64 / 1_000.0;
            metrics::histogram!(
                "conduit_processor_duration_ms",
                "route" => route_id.clone(),
                "outcome" => outcome
            )
            .record(duration_ms);
            debug!(
                route_id = %route_id,
                node_id = %node_id,
                exchange_id = %ex.id(),
                duration_ms,
                done_sync,
                outcome,
                "processor complete"
            );
            callback.done(done_sync);
        });

        self.inner.process(exchange, timed)
    }

    fn id(&self) -> Option<&str> {
        self.inner.id()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use conduit_core::{processor_fn, ExchangeError};

    use super::*;

    #[test]
    fn passes_through_result_and_id() {
        let wrapped = InstrumentLayer.wrap(
            "orders",
            Arc::new(processor_fn(|_: &Exchange| Ok(())).with_id("validate")),
        );
        assert_eq!(wrapped.id(), Some("validate"));

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let sync = wrapped.process(
            Arc::new(Exchange::new()),
            AsyncCallback::new(move |done_sync| flag.store(done_sync, Ordering::SeqCst)),
        );
        assert!(sync);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn failure_is_preserved() {
        let wrapped = InstrumentLayer.wrap(
            "orders",
            Arc::new(processor_fn(|_: &Exchange| Err(ExchangeError::processing("boom")))),
        );
        let exchange = Arc::new(Exchange::new());
        wrapped.process(exchange.clone(), AsyncCallback::noop());
        assert!(exchange.is_failed());
    }
}
