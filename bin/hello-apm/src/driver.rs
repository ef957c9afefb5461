use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    select,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often a new unit of work is dispatched in loop mode.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A unit of simulated work.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Runs the workload to completion.
    async fn run(&self);
}

/// Execution mode of the driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunMode {
    /// Dispatch one workload per tick, forever, until shutdown.
    Loop,

    /// Run exactly one workload and then stop.
    Job {
        /// Time to wait before running the workload.
        start_delay: Duration,

        /// Time to wait after the workload completes, before stopping.
        exit_delay: Duration,
    },
}

/// Outcome of a driver run.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    /// Number of workloads that were started.
    pub dispatched: usize,
}

/// Load driver.
///
/// The driver decides when workloads run. In loop mode, each tick spawns a detached task: spawned workloads are never
/// joined, nor cancelled on shutdown, and there is no bound on how many can be in flight at once. A slow workload has
/// no effect on the dispatch rate. In job mode, the single workload runs on the driver's own task.
pub struct Driver<W> {
    mode: RunMode,
    workload: Arc<W>,
}

impl<W: Workload> Driver<W> {
    /// Creates a new `Driver` that runs `workload` in the given mode.
    pub fn new(mode: RunMode, workload: W) -> Self {
        Self {
            mode,
            workload: Arc::new(workload),
        }
    }

    /// Runs the driver until it completes or `shutdown` is cancelled, whichever comes first.
    ///
    /// Cancellation always wins over a pending wait, but a job workload that is already running is allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) -> RunSummary {
        match self.mode {
            RunMode::Loop => self.run_loop(shutdown).await,
            RunMode::Job {
                start_delay,
                exit_delay,
            } => self.run_job(shutdown, start_delay, exit_delay).await,
        }
    }

    async fn run_loop(self, shutdown: CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();

        // The first tick fires one full interval after starting, rather than immediately.
        let mut ticker = interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Starting request loop...");

        loop {
            select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Stopping request loop...");
                    break;
                },
                _ = ticker.tick() => {
                    let workload = Arc::clone(&self.workload);
                    tokio::spawn(async move { workload.run().await });

                    summary.dispatched += 1;
                    debug!(dispatched = summary.dispatched, "Dispatched request.");
                },
            }
        }

        summary
    }

    async fn run_job(self, shutdown: CancellationToken, start_delay: Duration, exit_delay: Duration) -> RunSummary {
        let mut summary = RunSummary::default();

        if !wait_or_cancelled(&shutdown, start_delay).await {
            info!("Shutdown requested before the job started.");
            return summary;
        }

        info!("Running job...");
        summary.dispatched += 1;
        self.workload.run().await;
        info!("Job complete.");

        if !wait_or_cancelled(&shutdown, exit_delay).await {
            info!("Shutdown requested during the job exit delay.");
        }

        summary
    }
}

/// Waits for `delay` to elapse, returning `false` if `shutdown` was cancelled first.
async fn wait_or_cancelled(shutdown: &CancellationToken, delay: Duration) -> bool {
    select! {
        biased;

        _ = shutdown.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
