//! Processor abstraction with completion callbacks.
//!
//! A processor either finishes synchronously (returns `true` after invoking
//! its callback inline) or returns `false` and invokes the callback later from
//! whichever thread finishes the work.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::ExchangeError;
use crate::exchange::Exchange;

/// One-shot completion callback handed to [`AsyncProcessor::process`].
///
/// `done(done_sync)` consumes the callback, so it can be invoked at most
/// once. A callback dropped without being invoked fires itself with
/// `done_sync = false`; this keeps the exactly-once contract intact when a
/// processor panics or forgets to complete.
pub struct AsyncCallback {
    inner: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl AsyncCallback {
    pub fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    /// A callback that does nothing when invoked.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Signals completion. `done_sync` is `true` when the work finished on the
    /// thread that started it.
    pub fn done(mut self, done_sync: bool) {
        if let Some(f) = self.inner.take() {
            f(done_sync);
        }
    }
}

impl Drop for AsyncCallback {
    fn drop(&mut self) {
        let Some(f) = self.inner.take() else {
            return;
        };
        tracing::debug!("async callback dropped without being invoked, completing it now");
        if std::thread::panicking() {
            // A second panic while unwinding would abort the process.
            if catch_unwind(AssertUnwindSafe(|| f(false))).is_err() {
                tracing::warn!("async callback panicked while completing during unwind");
            }
        } else {
            f(false);
        }
    }
}

impl fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallback")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

/// A processing step that reports completion through a callback.
pub trait AsyncProcessor: Send + Sync {
    /// Processes `exchange` and invokes `callback` exactly once.
    ///
    /// Returns `true` if processing completed synchronously (the callback has
    /// already been invoked with `done_sync = true`).
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool;

    /// Node id used for diagnostics (blocked-thread and in-flight snapshots).
    fn id(&self) -> Option<&str> {
        None
    }
}

impl<F> AsyncProcessor for F
where
    F: Fn(Arc<Exchange>, AsyncCallback) -> bool + Send + Sync,
{
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        self(exchange, callback)
    }
}

/// A purely synchronous processing step.
pub trait Processor: Send + Sync {
    /// Processes the exchange on the calling thread.
    ///
    /// # Errors
    ///
    /// The returned error is stored on the exchange by [`SyncProcessor`].
    fn process(&self, exchange: &Exchange) -> Result<(), ExchangeError>;
}

/// Adapts a [`Processor`] into an [`AsyncProcessor`] that always completes synchronously.
pub struct SyncProcessor<P> {
    id: Option<String>,
    inner: P,
}

impl<P: Processor> SyncProcessor<P> {
    pub fn new(inner: P) -> Self {
        Self { id: None, inner }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl<P: Processor> AsyncProcessor for SyncProcessor<P> {
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        if let Err(e) = self.inner.process(&exchange) {
            exchange.set_error(Some(e));
        }
        callback.done(true);
        true
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Closure-backed [`Processor`].
pub struct FnProcessor<F>(pub F);

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    fn process(&self, exchange: &Exchange) -> Result<(), ExchangeError> {
        (self.0)(exchange)
    }
}

/// Builds a synchronous processor from a closure.
pub fn processor_fn<F>(f: F) -> SyncProcessor<FnProcessor<F>>
where
    F: Fn(&Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    SyncProcessor::new(FnProcessor(f))
}
