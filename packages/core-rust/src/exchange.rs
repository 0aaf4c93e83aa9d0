//! Exchange identity, error slot, and parent/child correlation.
//!
//! The core never inspects payload. An exchange is shared as `Arc<Exchange>`
//! between the threads that process it; every mutable field sits behind its
//! own lock or atomic so the hot path never takes a global lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::unit_of_work::UnitOfWork;

/// Unique identifier of an exchange.
///
/// Cheap to clone (`Arc<str>`), used as the key of every concurrent index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(Arc<str>);

impl ExchangeId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(format!("ID-{}", uuid::Uuid::new_v4().simple())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for ExchangeId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of routed work as seen by the concurrency core.
pub struct Exchange {
    id: ExchangeId,
    /// Id of the parent exchange for child units of work.
    correlation_id: Option<ExchangeId>,
    /// Route that originally created this exchange.
    from_route_id: Option<String>,
    created_at: Instant,
    error: Mutex<Option<ExchangeError>>,
    interrupted: AtomicBool,
    unit_of_work: Mutex<Option<Arc<UnitOfWork>>>,
}

impl Exchange {
    /// Creates a new exchange with a generated id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ExchangeId::generate())
    }

    /// Creates a new exchange with an explicit id.
    #[must_use]
    pub fn with_id(id: ExchangeId) -> Self {
        Self {
            id,
            correlation_id: None,
            from_route_id: None,
            created_at: Instant::now(),
            error: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            unit_of_work: Mutex::new(None),
        }
    }

    /// Sets the originating route. Builder-style, used before the exchange is shared.
    #[must_use]
    pub fn from_route(mut self, route_id: impl Into<String>) -> Self {
        self.from_route_id = Some(route_id.into());
        self
    }

    /// Creates a child exchange correlated to this one.
    ///
    /// The child inherits the originating route but nothing else: it starts
    /// without an error and without a unit of work.
    #[must_use]
    pub fn create_child(&self) -> Self {
        let mut child = Self::new();
        child.correlation_id = Some(self.id.clone());
        child.from_route_id.clone_from(&self.from_route_id);
        child
    }

    #[must_use]
    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&ExchangeId> {
        self.correlation_id.as_ref()
    }

    #[must_use]
    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Returns a copy of the current error, if any.
    #[must_use]
    pub fn error(&self) -> Option<ExchangeError> {
        self.error.lock().clone()
    }

    /// Replaces the error slot. `None` clears a previous failure.
    pub fn set_error(&self, error: Option<ExchangeError>) {
        *self.error.lock() = error;
    }

    /// Stores `error` only if the slot is empty. Returns `true` if it was stored.
    pub fn set_error_if_absent(&self, error: ExchangeError) -> bool {
        let mut slot = self.error.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        true
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.lock().is_some()
    }

    /// Marks the exchange as released by a forced interrupt.
    pub fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Returns the attached unit of work, if any.
    #[must_use]
    pub fn unit_of_work(&self) -> Option<Arc<UnitOfWork>> {
        self.unit_of_work.lock().clone()
    }

    /// Attaches (or detaches, with `None`) the unit of work, returning the previous one.
    pub fn set_unit_of_work(&self, uow: Option<Arc<UnitOfWork>>) -> Option<Arc<UnitOfWork>> {
        std::mem::replace(&mut *self.unit_of_work.lock(), uow)
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("from_route_id", &self.from_route_id)
            .field("failed", &self.is_failed())
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}
