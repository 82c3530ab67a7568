//! Background retry sweep and in-flight watchdog.
//!
//! Each pass retries ready `FailedRetrying` records (bounded concurrency),
//! fails attempts stuck `InFlight` past the configured timeout, and finishes
//! escalations that a dead-letter outage interrupted.
//! Workers rely on `begin_attempt` for exclusion, so any number of sweepers
//! may run against the same log.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use marketsync_core::OperationId;

use crate::coordinator::{EarlyRetry, PipelineCoordinator};
use crate::error::PipelineError;
use crate::operation::{OperationRecord, OperationState};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Pause between passes.
    pub interval: Duration,
    /// Maximum records examined per pass.
    pub batch: u32,
    /// Maximum concurrent retries within a pass.
    pub max_concurrent: usize,
    /// How long an attempt may stay in flight before the watchdog fails it.
    pub in_flight_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch: 100,
            max_concurrent: 4,
            in_flight_timeout: Duration::from_secs(300),
            name: "retry-sweeper".to_string(),
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Outcome of a single sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Retries dispatched.
    pub retried: u64,
    pub succeeded: u64,
    /// Retries that failed again (including those that exhausted).
    pub failed: u64,
    /// Records escalated to the dead-letter store during the pass.
    pub quarantined: u64,
    /// Stuck in-flight attempts failed by the watchdog.
    pub reaped: u64,
    /// Candidates taken by another worker between listing and dispatch.
    pub skipped: u64,
    pub errors: u64,
}

impl SweepReport {
    fn record_retry(&mut self, outcome: Result<OperationRecord, PipelineError>, id: OperationId) {
        match outcome {
            Ok(record) => {
                self.retried += 1;
                match record.state {
                    OperationState::Succeeded => self.succeeded += 1,
                    OperationState::FailedExhausted => {
                        self.failed += 1;
                        self.quarantined += 1;
                    }
                    _ => self.failed += 1,
                }
            }
            Err(
                PipelineError::TooEarly { .. }
                | PipelineError::ConcurrentAttempt(_)
                | PipelineError::PreconditionFailed(_),
            ) => self.skipped += 1,
            Err(e) => {
                error!(operation_id = %id, error = %e, "sweep retry failed");
                self.errors += 1;
            }
        }
    }
}

/// Cumulative sweeper statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub sweeps: u64,
    pub retried: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub reaped: u64,
    pub skipped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl SweepStats {
    fn absorb(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.retried += report.retried;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
        self.quarantined += report.quarantined;
        self.reaped += report.reaped;
        self.skipped += report.skipped;
        self.errors += report.errors;
    }
}

impl PipelineCoordinator {
    /// One sweep pass: retry ready records, run the watchdog, then escalate
    /// exhausted records that were never quarantined.
    ///
    /// Failures after the retry phase are counted in `errors` so the report
    /// of work already done survives them.
    pub async fn sweep_once(
        self: &Arc<Self>,
        config: &SweeperConfig,
    ) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();
        let candidates = self.retry_candidates(config.batch).await?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for record in candidates {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let coordinator = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = coordinator.retry_with(record.id, EarlyRetry::Reject).await;
                (record.id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, outcome)) => report.record_retry(outcome, id),
                Err(e) => {
                    error!(error = %e, "sweep retry task panicked");
                    report.errors += 1;
                }
            }
        }

        match self.reap_stuck(config.in_flight_timeout, config.batch).await {
            Ok(reaped) => {
                for record in reaped {
                    report.reaped += 1;
                    if record.state == OperationState::FailedExhausted && record.escalated_at.is_some() {
                        report.quarantined += 1;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "in-flight watchdog failed");
                report.errors += 1;
            }
        }

        match self.unescalated(config.batch).await {
            Ok(owed) => {
                for record in owed {
                    match self.escalate(&record).await {
                        Ok(_) => report.quarantined += 1,
                        Err(e) => {
                            error!(operation_id = %record.id, error = %e, "escalation retry failed");
                            report.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "listing unescalated records failed");
                report.errors += 1;
            }
        }

        Ok(report)
    }
}

/// Spawns the periodic sweep loop.
pub struct RetrySweeper;

impl RetrySweeper {
    pub fn spawn(coordinator: Arc<PipelineCoordinator>, config: SweeperConfig) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweepStats::default()));

        let join = tokio::spawn(sweep_loop(coordinator, config, shutdown_rx, stats.clone()));

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "retry sweeper task panicked");
            }
        }
    }

    pub fn stats(&self) -> SweepStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

async fn sweep_loop(
    coordinator: Arc<PipelineCoordinator>,
    config: SweeperConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<SweepStats>>,
) {
    info!(sweeper = %config.name, interval_ms = config.interval.as_millis() as u64, "retry sweeper started");
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        match coordinator.sweep_once(&config).await {
            Ok(report) => {
                if report != SweepReport::default() {
                    debug!(sweeper = %config.name, ?report, "sweep pass finished");
                }
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.absorb(&report);
                s.uptime_secs = start_time.elapsed().as_secs();
            }
            Err(e) => {
                error!(sweeper = %config.name, error = %e, "sweep pass failed");
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.sweeps += 1;
                s.errors += 1;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(sweeper = %config.name, "retry sweeper stopped");
}
