//! Completion hooks registered on a unit of work.
//!
//! Optional capabilities are exposed through query methods returning
//! `Option<&dyn Capability>` rather than a hook type hierarchy.

use std::fmt;

use crate::exchange::Exchange;

/// Completion hook invoked once when its unit of work is done.
///
/// Errors and panics raised by a hook are logged at WARN and never prevent
/// the remaining hooks from running.
pub trait Synchronization: Send + Sync {
    /// Called when the exchange completed without an error.
    ///
    /// # Errors
    ///
    /// A returned error is logged and otherwise ignored.
    fn on_complete(&self, exchange: &Exchange) -> anyhow::Result<()>;

    /// Called when the exchange completed carrying an error.
    ///
    /// # Errors
    ///
    /// A returned error is logged and otherwise ignored.
    fn on_failure(&self, exchange: &Exchange) -> anyhow::Result<()>;

    /// Capability: may veto being handed over to another unit of work.
    fn as_vetoable(&self) -> Option<&dyn SynchronizationVetoable> {
        None
    }

    /// Capability: observes route entry and exit.
    fn as_route_aware(&self) -> Option<&dyn SynchronizationRouteAware> {
        None
    }

    /// Capability: explicit completion order. Lower values run first; hooks
    /// without an order keep their relative position.
    fn order(&self) -> Option<i32> {
        None
    }
}

/// Hooks that decide whether they may move to a new unit of work.
pub trait SynchronizationVetoable: Send + Sync {
    /// Returns `true` if the hook consents to being moved.
    fn allow_handover(&self) -> bool;

    /// Called just before an accepted hook is moved to the unit of work of `target`.
    fn before_handover(&self, _target: &Exchange) {}
}

/// Hooks notified when the exchange enters or leaves a route.
pub trait SynchronizationRouteAware: Send + Sync {
    fn on_before_route(&self, route_id: &str, exchange: &Exchange);

    fn on_after_route(&self, route_id: &str, exchange: &Exchange);
}

type HookFn = Box<dyn Fn(&Exchange) -> anyhow::Result<()> + Send + Sync>;

/// Closure-backed [`Synchronization`], built fluently.
///
/// ```
/// use conduit_core::OnCompletion;
///
/// let hook = OnCompletion::new()
///     .on_complete(|_ex| Ok(()))
///     .allow_handover(false);
/// ```
pub struct OnCompletion {
    complete: Option<HookFn>,
    failure: Option<HookFn>,
    handover: Option<bool>,
    order: Option<i32>,
}

impl OnCompletion {
    #[must_use]
    pub fn new() -> Self {
        Self {
            complete: None,
            failure: None,
            handover: None,
            order: None,
        }
    }

    #[must_use]
    pub fn on_complete(
        mut self,
        f: impl Fn(&Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_failure(
        mut self,
        f: impl Fn(&Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Box::new(f));
        self
    }

    /// Makes the hook vetoable; `allow` is its answer to handover requests.
    #[must_use]
    pub fn allow_handover(mut self, allow: bool) -> Self {
        self.handover = Some(allow);
        self
    }

    #[must_use]
    pub fn ordered(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }
}

impl Default for OnCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronization for OnCompletion {
    fn on_complete(&self, exchange: &Exchange) -> anyhow::Result<()> {
        self.complete.as_ref().map_or(Ok(()), |f| f(exchange))
    }

    fn on_failure(&self, exchange: &Exchange) -> anyhow::Result<()> {
        self.failure.as_ref().map_or(Ok(()), |f| f(exchange))
    }

    fn as_vetoable(&self) -> Option<&dyn SynchronizationVetoable> {
        self.handover.map(|_| self as &dyn SynchronizationVetoable)
    }

    fn order(&self) -> Option<i32> {
        self.order
    }
}

impl SynchronizationVetoable for OnCompletion {
    fn allow_handover(&self) -> bool {
        self.handover.unwrap_or(true)
    }
}

impl fmt::Debug for OnCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnCompletion")
            .field("complete", &self.complete.is_some())
            .field("failure", &self.failure.is_some())
            .field("handover", &self.handover)
            .field("order", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hook_has_no_capabilities() {
        let hook = OnCompletion::new();
        assert!(hook.as_vetoable().is_none());
        assert!(hook.as_route_aware().is_none());
        assert!(hook.order().is_none());
    }

    #[test]
    fn vetoable_capability_reports_answer() {
        let hook = OnCompletion::new().allow_handover(false);
        assert!(!hook.as_vetoable().unwrap().allow_handover());

        let hook = OnCompletion::new().allow_handover(true);
        assert!(hook.as_vetoable().unwrap().allow_handover());
    }

    #[test]
    fn missing_callbacks_succeed() {
        let hook = OnCompletion::new();
        let ex = Exchange::new();
        assert!(Synchronization::on_complete(&hook, &ex).is_ok());
        assert!(Synchronization::on_failure(&hook, &ex).is_ok());
    }
}
