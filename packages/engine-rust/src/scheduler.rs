//! Cooperative trampoline scheduler.
//!
//! Each thread owns a task queue per scheduler. The first `schedule` call on
//! an idle thread starts a drain loop; calls made while that loop is running
//! (from inside a task) only append to the queue. A chain of continuations of
//! any length therefore executes at constant stack depth.
//!
//! A continuation fired from a foreign thread (for example an I/O callback)
//! lands in that thread's queue and is drained there. Only one thread ever
//! drains a given queue, so a unit of work's continuations run one at a time
//! and in FIFO order.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::error::panic_message;
use conduit_core::{Exchange, ExchangeError};
use tracing::{debug, warn};

use crate::registry::{ManagedService, ServiceContext};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread queues, keyed by scheduler id.
    static WORKERS: RefCell<HashMap<u64, Rc<Worker>>> = RefCell::new(HashMap::new());
}

/// How a task enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Continuation of work already in progress.
    Normal,
    /// First task of a new unit of work; drains ahead of work already queued.
    Main,
    /// Drained on the calling thread immediately, even inside a drain loop.
    Sync,
}

/// A queued continuation.
pub struct ScheduledTask {
    runnable: Box<dyn FnOnce()>,
    description: Cow<'static, str>,
    kind: TaskKind,
    exchange: Option<Arc<Exchange>>,
}

impl ScheduledTask {
    pub fn new(
        kind: TaskKind,
        description: impl Into<Cow<'static, str>>,
        runnable: impl FnOnce() + 'static,
    ) -> Self {
        Self {
            runnable: Box::new(runnable),
            description: description.into(),
            kind,
            exchange: None,
        }
    }

    /// Attributes failures of this task to `exchange`.
    #[must_use]
    pub fn for_exchange(mut self, exchange: Arc<Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("description", &self.description)
            .field("kind", &self.kind)
            .field("exchange", &self.exchange.as_ref().map(|e| e.id().clone()))
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Worker {
    queue: RefCell<VecDeque<ScheduledTask>>,
    /// Queues parked by `schedule_main`, resumed once the newer work drains.
    back: RefCell<Vec<VecDeque<ScheduledTask>>>,
    running: Cell<bool>,
}

impl Worker {
    fn poll(&self) -> Option<ScheduledTask> {
        let mut queue = self.queue.borrow_mut();
        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            match self.back.borrow_mut().pop() {
                Some(parked) => *queue = parked,
                None => return None,
            }
        }
    }

    fn is_idle(&self) -> bool {
        !self.running.get() && self.queue.borrow().is_empty() && self.back.borrow().is_empty()
    }
}

#[derive(Debug, Default)]
struct SchedulerStats {
    pending: AtomicUsize,
    running_workers: AtomicUsize,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// Trampoline scheduler shared by every processor of an engine.
#[derive(Debug)]
pub struct Scheduler {
    id: u64,
    stats: SchedulerStats,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            stats: SchedulerStats::default(),
        }
    }

    /// Enqueues a continuation. Runs it now if this thread is not draining.
    pub fn schedule(&self, description: impl Into<Cow<'static, str>>, f: impl FnOnce() + 'static) {
        self.submit(ScheduledTask::new(TaskKind::Normal, description, f));
    }

    /// Seeds the first task of a new unit of work.
    pub fn schedule_main(
        &self,
        description: impl Into<Cow<'static, str>>,
        f: impl FnOnce() + 'static,
    ) {
        self.submit(ScheduledTask::new(TaskKind::Main, description, f));
    }

    /// Enqueues and drains on the calling thread before returning.
    pub fn schedule_sync(
        &self,
        description: impl Into<Cow<'static, str>>,
        f: impl FnOnce() + 'static,
    ) {
        self.submit(ScheduledTask::new(TaskKind::Sync, description, f));
    }

    pub fn submit(&self, task: ScheduledTask) {
        let worker = self.worker();
        let kind = task.kind;
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = worker.queue.borrow_mut();
            if kind == TaskKind::Main && !queue.is_empty() {
                let parked = mem::take(&mut *queue);
                worker.back.borrow_mut().push(parked);
            }
            queue.push_back(task);
        }
        if !worker.running.get() || kind == TaskKind::Sync {
            self.drain(&worker);
        }
    }

    /// Runs exactly one pending task of this thread's queue, if any.
    ///
    /// Returns `true` if a task was executed.
    pub fn execute_from_queue(&self) -> bool {
        let Some(worker) = self.existing_worker() else {
            return false;
        };
        let Some(task) = worker.poll() else {
            return false;
        };
        self.run(task);
        true
    }

    /// Tasks queued on any thread and not yet executed.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.stats.pending.load(Ordering::Relaxed)
    }

    /// Threads currently inside a drain loop.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.stats.running_workers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn executed_tasks(&self) -> u64 {
        self.stats.executed.load(Ordering::Relaxed)
    }

    /// Tasks that panicked.
    #[must_use]
    pub fn failed_tasks(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    fn drain(&self, worker: &Rc<Worker>) {
        let was_running = worker.running.replace(true);
        if !was_running {
            self.stats.running_workers.fetch_add(1, Ordering::Relaxed);
        }

        while let Some(task) = worker.poll() {
            self.run(task);
        }

        worker.running.set(was_running);
        if !was_running {
            self.stats.running_workers.fetch_sub(1, Ordering::Relaxed);
            self.release_worker_if_idle();
        }
    }

    fn run(&self, task: ScheduledTask) {
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        let ScheduledTask {
            runnable,
            description,
            exchange,
            ..
        } = task;

        let result = catch_unwind(AssertUnwindSafe(runnable));
        self.stats.executed.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = result {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let message = panic_message(payload.as_ref());
            match exchange {
                Some(exchange) => {
                    warn!(
                        task = %description,
                        exchange_id = %exchange.id(),
                        panic = %message,
                        "scheduled task failed"
                    );
                    exchange.set_error_if_absent(ExchangeError::Panicked {
                        task: description.into_owned(),
                        message,
                    });
                }
                None => warn!(task = %description, panic = %message, "scheduled task failed"),
            }
        }
    }

    fn worker(&self) -> Rc<Worker> {
        WORKERS.with(|workers| Rc::clone(workers.borrow_mut().entry(self.id).or_default()))
    }

    fn existing_worker(&self) -> Option<Rc<Worker>> {
        WORKERS.with(|workers| workers.borrow().get(&self.id).cloned())
    }

    fn release_worker_if_idle(&self) {
        WORKERS.with(|workers| {
            let mut workers = workers.borrow_mut();
            if workers.get(&self.id).is_some_and(|w| w.is_idle()) {
                workers.remove(&self.id);
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedService for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn start(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _terminate: bool) -> anyhow::Result<()> {
        let pending = self.pending_tasks();
        if pending > 0 {
            debug!(pending, "scheduler stopping with tasks still queued on their threads");
        }
        Ok(())
    }
}
