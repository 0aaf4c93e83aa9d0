//! Soak driver: pushes many concurrent exchanges through an asynchronous
//! pipeline, then shuts the engine down and logs the report.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use conduit_core::{AsyncCallback, AsyncProcessor, Exchange};
use conduit_engine::{
    init_tracing, Engine, EngineConfig, LogFormat, Pipeline, Route, TimeUnit,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "conduit-soak", about = "Drive exchanges through a conduit engine and shut it down")]
struct Args {
    /// Number of exchanges submitted concurrently.
    #[arg(long, default_value_t = 1_000, env = "CONDUIT_SOAK_EXCHANGES")]
    exchanges: usize,

    /// Steps in the route pipeline.
    #[arg(long, default_value_t = 16)]
    steps: usize,

    /// Every n-th step completes on a separate thread.
    #[arg(long, default_value_t = 4)]
    async_every: usize,

    /// Delay of an asynchronous step, in microseconds.
    #[arg(long, default_value_t = 200)]
    step_delay_us: u64,

    /// Blocking requests issued alongside the asynchronous submits.
    #[arg(long, default_value_t = 8)]
    requests: usize,

    #[arg(long, default_value_t = 10_000, env = "CONDUIT_SHUTDOWN_TIMEOUT_MS")]
    shutdown_timeout_ms: u64,

    /// Optional JSON engine configuration; flags override its shutdown timeout.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[arg(long, default_value = "pretty", env = "CONDUIT_LOG_FORMAT")]
    log_format: LogFormat,
}

fn step(index: usize, async_every: usize, delay: Duration) -> Arc<dyn AsyncProcessor> {
    let is_async = async_every > 0 && index % async_every == async_every - 1;
    Arc::new(move |_ex: Arc<Exchange>, cb: AsyncCallback| {
        if is_async {
            thread::spawn(move || {
                thread::sleep(delay);
                cb.done(false);
            });
            false
        } else {
            cb.done(true);
            true
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_json_str(&raw)?
        }
        None => EngineConfig::default(),
    };
    config.shutdown.timeout = args.shutdown_timeout_ms;
    config.shutdown.time_unit = TimeUnit::Milliseconds;

    let engine = Arc::new(Engine::new(config)?);
    let delay = Duration::from_micros(args.step_delay_us);
    let steps = (0..args.steps)
        .map(|i| step(i, args.async_every, delay))
        .collect();
    engine.add_route(Route::new(
        "soak",
        Arc::new(Pipeline::new(Arc::clone(engine.scheduler()), steps).with_id("soak-pipeline")),
    ))?;
    engine.start().await?;

    let started = Instant::now();
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    for _ in 0..args.exchanges {
        let exchange = engine.create_exchange("soak");
        let probe = Arc::clone(&exchange);
        let (completed, failed) = (Arc::clone(&completed), Arc::clone(&failed));
        engine.submit(
            "soak",
            exchange,
            AsyncCallback::new(move |_| {
                if probe.is_failed() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                completed.fetch_add(1, Ordering::Relaxed);
            }),
        )?;
    }

    let mut blocking = Vec::with_capacity(args.requests);
    for _ in 0..args.requests {
        let engine = Arc::clone(&engine);
        blocking.push(tokio::task::spawn_blocking(move || {
            let exchange = engine.create_exchange("soak");
            engine.request("soak", &exchange).map(|()| exchange.is_failed())
        }));
    }
    for handle in blocking {
        if handle.await?? {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    info!(
        submitted = args.exchanges,
        requests = args.requests,
        completed = completed.load(Ordering::Relaxed),
        inflight = engine.inflight().size(),
        elapsed_ms = started.elapsed().as_millis(),
        "intake finished, shutting down"
    );

    let report = engine.stop().await?;
    let stats = engine.await_manager().statistics().snapshot();
    info!(
        completed = completed.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        executed_tasks = engine.scheduler().executed_tasks(),
        failed_tasks = engine.scheduler().failed_tasks(),
        threads_blocked = stats.threads_blocked,
        mean_wait_ms = stats.mean_duration_ms,
        max_wait_ms = stats.max_duration_ms,
        timed_out = report.timed_out,
        forced = report.forced,
        shutdown_ms = report.elapsed.as_millis(),
        "soak finished"
    );
    if !report.is_clean() {
        warn!(failures = report.failures.len(), pending = report.pending_at_timeout.len(), "shutdown was not clean");
    }
    Ok(())
}
