//! Sequential processor chain continued through the trampoline scheduler.

use std::sync::Arc;

use conduit_core::{AsyncCallback, AsyncProcessor, Exchange};
use tracing::trace;

use crate::scheduler::{ScheduledTask, Scheduler, TaskKind};

/// Runs its steps one after another, stopping at the first failure.
///
/// Every step's completion schedules the next one instead of calling it, so
/// the stack depth stays constant however long the chain is and whichever
/// thread a step completes on.
pub struct Pipeline {
    id: Option<String>,
    steps: Arc<[Arc<dyn AsyncProcessor>]>,
    scheduler: Arc<Scheduler>,
}

impl Pipeline {
    pub fn new(scheduler: Arc<Scheduler>, steps: Vec<Arc<dyn AsyncProcessor>>) -> Self {
        Self {
            id: None,
            steps: steps.into(),
            scheduler,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl AsyncProcessor for Pipeline {
    fn process(&self, exchange: Arc<Exchange>, callback: AsyncCallback) -> bool {
        let run = Step {
            steps: Arc::clone(&self.steps),
            scheduler: Arc::clone(&self.scheduler),
            index: 0,
        };
        // Transacted work must finish on the calling thread.
        let transacted = exchange
            .unit_of_work()
            .is_some_and(|uow| uow.is_transacted());
        let kind = if transacted { TaskKind::Sync } else { TaskKind::Main };

        let ex = Arc::clone(&exchange);
        self.scheduler.submit(
            ScheduledTask::new(kind, "pipeline", move || run.execute(ex, callback))
                .for_exchange(exchange),
        );
        false
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

struct Step {
    steps: Arc<[Arc<dyn AsyncProcessor>]>,
    scheduler: Arc<Scheduler>,
    index: usize,
}

impl Step {
    fn execute(self, exchange: Arc<Exchange>, callback: AsyncCallback) {
        let Some(processor) = self.steps.get(self.index).cloned() else {
            callback.done(false);
            return;
        };
        if exchange.is_failed() {
            trace!(exchange_id = %exchange.id(), step = self.index, "pipeline stopped on failure");
            callback.done(false);
            return;
        }

        let next = Step {
            index: self.index + 1,
            ..self
        };
        let ex = Arc::clone(&exchange);
        processor.process(
            exchange,
            AsyncCallback::new(move |_done_sync| {
                let scheduler = Arc::clone(&next.scheduler);
                let task_exchange = Arc::clone(&ex);
                scheduler.submit(
                    ScheduledTask::new(TaskKind::Normal, "pipeline-next", move || {
                        next.execute(ex, callback);
                    })
                    .for_exchange(task_exchange),
                );
            }),
        );
    }
}
