//! Stuck-thread watchdog.
//!
//! Periodically scans the threads blocked in the [`AwaitManager`], warns once
//! per exchange that has waited longer than `warn_after_ms`, and interrupts
//! those past `interrupt_after_ms` when that is configured.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::ExchangeId;
use tokio::sync::oneshot;
use tracing::warn;

use crate::await_manager::AwaitManager;
use crate::config::WatchdogConfig;
use crate::worker::{PeriodicTask, PeriodicWorker};

/// Counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogScan {
    pub blocked: usize,
    pub warned: usize,
    pub interrupted: usize,
}

#[derive(Debug)]
pub enum WatchdogCommand {
    /// Scan immediately and reply with the result.
    ScanNow(oneshot::Sender<WatchdogScan>),
}

pub struct StuckThreadWatchdog {
    await_manager: Arc<AwaitManager>,
    warn_after: Duration,
    interrupt_after: Option<Duration>,
    warned: HashSet<ExchangeId>,
}

impl StuckThreadWatchdog {
    #[must_use]
    pub fn new(await_manager: Arc<AwaitManager>, config: &WatchdogConfig) -> Self {
        Self {
            await_manager,
            warn_after: Duration::from_millis(config.warn_after_ms),
            interrupt_after: config.interrupt_after_ms.map(Duration::from_millis),
            warned: HashSet::new(),
        }
    }

    pub fn scan(&mut self) -> WatchdogScan {
        let threads = self.await_manager.browse();
        let mut scan = WatchdogScan {
            blocked: threads.len(),
            ..WatchdogScan::default()
        };

        // Forget exchanges that are no longer blocked.
        self.warned
            .retain(|id| threads.iter().any(|t| &t.exchange_id == id));

        for thread in &threads {
            let waited = thread.wait_duration();
            if self.interrupt_after.is_some_and(|limit| waited >= limit) {
                if self.await_manager.interrupt(&thread.exchange_id) {
                    scan.interrupted += 1;
                }
                continue;
            }
            if waited >= self.warn_after && self.warned.insert(thread.exchange_id.clone()) {
                warn!(
                    exchange_id = %thread.exchange_id,
                    thread = thread.thread_name.as_deref().unwrap_or("<unnamed>"),
                    route_id = thread.route_id.as_deref().unwrap_or(""),
                    node_id = thread.node_id.as_deref().unwrap_or(""),
                    waited_ms = waited.as_millis(),
                    "thread blocked longer than expected"
                );
                scan.warned += 1;
            }
        }
        scan
    }
}

#[async_trait]
impl PeriodicTask for StuckThreadWatchdog {
    type Command = WatchdogCommand;

    async fn handle(&mut self, command: WatchdogCommand) {
        match command {
            WatchdogCommand::ScanNow(reply) => {
                let _ = reply.send(self.scan());
            }
        }
    }

    async fn tick(&mut self) {
        self.scan();
    }
}

/// Running watchdog.
pub struct WatchdogHandle {
    worker: PeriodicWorker<StuckThreadWatchdog>,
}

impl WatchdogHandle {
    /// Spawns the watchdog on the current tokio runtime.
    #[must_use]
    pub fn spawn(await_manager: Arc<AwaitManager>, config: &WatchdogConfig) -> Self {
        let watchdog = StuckThreadWatchdog::new(await_manager, config);
        let interval = Duration::from_millis(config.scan_interval_ms.max(1));
        Self {
            worker: PeriodicWorker::spawn("stuck-thread-watchdog", watchdog, interval),
        }
    }

    /// # Errors
    ///
    /// Fails if the watchdog has stopped.
    pub async fn scan_now(&self) -> anyhow::Result<WatchdogScan> {
        let (tx, rx) = oneshot::channel();
        self.worker.send(WatchdogCommand::ScanNow(tx)).await?;
        Ok(rx.await?)
    }

    pub async fn stop(&mut self) {
        self.worker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    use conduit_core::{AsyncCallback, Exchange};

    use super::*;
    use crate::scheduler::Scheduler;

    fn block_one(manager: &Arc<AwaitManager>) -> (Arc<Exchange>, AsyncCallback, thread::JoinHandle<()>) {
        let exchange = Arc::new(Exchange::new());
        let (tx, rx) = mpsc::channel();
        let m = manager.clone();
        let ex = exchange.clone();
        let caller = thread::spawn(move || {
            let processor = move |_ex: Arc<Exchange>, cb: AsyncCallback| {
                tx.send(cb).unwrap();
                false
            };
            m.process(&processor, &ex);
        });
        let cb = rx.recv().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.size() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        (exchange, cb, caller)
    }

    fn config(warn_after_ms: u64, interrupt_after_ms: Option<u64>) -> WatchdogConfig {
        WatchdogConfig {
            enabled: true,
            scan_interval_ms: 60_000,
            warn_after_ms,
            interrupt_after_ms,
        }
    }

    #[test]
    fn warns_once_per_exchange() {
        let manager = Arc::new(AwaitManager::new(Arc::new(Scheduler::new())));
        let (_exchange, cb, caller) = block_one(&manager);
        let mut watchdog = StuckThreadWatchdog::new(manager.clone(), &config(0, None));

        assert_eq!(watchdog.scan(), WatchdogScan { blocked: 1, warned: 1, interrupted: 0 });
        assert_eq!(watchdog.scan(), WatchdogScan { blocked: 1, warned: 0, interrupted: 0 });

        cb.done(false);
        caller.join().unwrap();
        assert_eq!(watchdog.scan(), WatchdogScan::default());
        assert!(watchdog.warned.is_empty());
    }

    #[test]
    fn interrupts_past_limit() {
        let manager = Arc::new(AwaitManager::new(Arc::new(Scheduler::new())));
        let (exchange, _cb, caller) = block_one(&manager);
        let mut watchdog = StuckThreadWatchdog::new(manager.clone(), &config(0, Some(0)));

        let scan = watchdog.scan();
        caller.join().unwrap();
        assert_eq!(scan.interrupted, 1);
        assert!(exchange.is_interrupted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_now_through_worker() {
        let manager = Arc::new(AwaitManager::new(Arc::new(Scheduler::new())));
        let mut handle = WatchdogHandle::spawn(manager, &config(1_000, None));
        assert_eq!(handle.scan_now().await.unwrap(), WatchdogScan::default());
        handle.stop().await;
        assert!(handle.scan_now().await.is_err());
    }
}
