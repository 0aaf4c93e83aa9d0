//! Periodic background worker driven by a command channel.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

const COMMAND_CAPACITY: usize = 64;

/// Logic run by a [`PeriodicWorker`].
#[async_trait]
pub trait PeriodicTask: Send + 'static {
    type Command: Send + 'static;

    /// Handles one command sent through [`PeriodicWorker::send`].
    async fn handle(&mut self, command: Self::Command);

    /// Runs once per interval.
    async fn tick(&mut self);

    async fn finish(&mut self) {}
}

/// Owns a tokio task that ticks a [`PeriodicTask`] and feeds it commands.
pub struct PeriodicWorker<T: PeriodicTask> {
    name: &'static str,
    commands: Option<mpsc::Sender<T::Command>>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: PeriodicTask> PeriodicWorker<T> {
    /// Spawns the worker on the current tokio runtime. The first tick fires
    /// one `interval` after start.
    pub fn spawn(name: &'static str, mut task: T, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<T::Command>(COMMAND_CAPACITY);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(c) => task.handle(c).await,
                        None => break,
                    },
                    _ = ticker.tick() => task.tick().await,
                    _ = &mut stop_rx => break,
                }
            }

            task.finish().await;
            debug!(worker = name, "background worker exited");
        });

        Self {
            name,
            commands: Some(tx),
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// # Errors
    ///
    /// Fails once the worker has stopped.
    pub async fn send(&self, command: T::Command) -> anyhow::Result<()> {
        let Some(tx) = &self.commands else {
            anyhow::bail!("worker {} is not running", self.name);
        };
        tx.send(command)
            .await
            .map_err(|_| anyhow::anyhow!("worker {} channel closed", self.name))
    }

    /// Signals the worker to exit and waits for it.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.commands.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
