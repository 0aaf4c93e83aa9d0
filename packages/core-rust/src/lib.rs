//! Conduit core: exchanges, processor callbacks, synchronization hooks and the unit of work.

pub mod error;
pub mod exchange;
pub mod processor;
pub mod synchronization;
pub mod unit_of_work;

pub use error::ExchangeError;
pub use exchange::{Exchange, ExchangeId};
pub use processor::{processor_fn, AsyncCallback, AsyncProcessor, FnProcessor, Processor, SyncProcessor};
pub use synchronization::{
    OnCompletion, Synchronization, SynchronizationRouteAware, SynchronizationVetoable,
};
pub use unit_of_work::{HandoverFilter, UnitOfWork};
