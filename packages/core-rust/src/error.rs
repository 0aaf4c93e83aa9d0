//! Errors carried in an exchange's error slot.

use crate::exchange::ExchangeId;

/// Failure attached to an [`Exchange`](crate::Exchange).
///
/// Failures belonging to one exchange travel with it and are surfaced once,
/// at `UnitOfWork::done`, to every registered hook. `Clone` lets the same
/// failure be observed by each hook and by a blocked caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// A processing step failed.
    #[error("processing failed: {0}")]
    Processing(String),
    /// A blocked synchronous caller was released by an administrative interrupt.
    #[error("interrupted while waiting for asynchronous callback for exchange {exchange_id}")]
    Interrupted { exchange_id: ExchangeId },
    /// A scheduled task panicked while working on this exchange.
    #[error("task '{task}' panicked: {message}")]
    Panicked { task: String, message: String },
    /// The exchange was refused before processing started.
    #[error("exchange rejected: {reason}")]
    Rejected { reason: String },
}

impl ExchangeError {
    /// Convenience constructor for [`ExchangeError::Processing`].
    pub fn processing(message: impl std::fmt::Display) -> Self {
        Self::Processing(message.to_string())
    }

    /// Returns `true` if this error was injected by a forced interrupt.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Renders a caught panic payload as text.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
