//! Background reclamation of expired leases.
//!
//! The sweeper is the only writer of `expired` history entries outside the
//! claim path. It wakes on a schedule, reclaims every lease past its
//! deadline one case at a time, and records a summary row per run. Races
//! with live claims and releases are expected and lose cleanly.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::history::{SweepRun, SweepTrigger};

/// When sweeps happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSchedule {
    /// Once a day at a fixed UTC time.
    Daily { at: NaiveTime },
    /// On a fixed period.
    Every { period: Duration },
}

/// Next wakeup strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, schedule: SweepSchedule) -> DateTime<Utc> {
    match schedule {
        SweepSchedule::Daily { at } => {
            let today = now.date_naive().and_time(at).and_utc();
            if today > now { today } else { today + Duration::days(1) }
        }
        SweepSchedule::Every { period } => now + period,
    }
}

pub struct Sweeper {
    engine: Arc<Engine>,
    schedule: SweepSchedule,
    // Serializes sweeps. A manual run during a scheduled one queues behind
    // it rather than walking the same expired set twice in parallel.
    running: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(engine: Arc<Engine>, schedule: SweepSchedule) -> Self {
        Self {
            engine,
            schedule,
            running: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle for stopping the loop from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run scheduled sweeps until shutdown is signalled. A sweep in
    /// progress finishes before the loop exits.
    pub async fn run(&self) -> Result<()> {
        info!(schedule = ?self.schedule, "sweeper started");
        loop {
            let now = self.engine.now();
            let next = next_run_after(now, self.schedule);
            let wait = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweeper stopping");
                    return Ok(());
                }
                _ = sleep(wait) => {
                    if let Err(e) = self.sweep(SweepTrigger::Scheduled).await {
                        warn!(error = %e, "scheduled sweep failed");
                    }
                }
            }
        }
    }

    /// One on-demand sweep, queued behind any sweep already in flight.
    pub async fn run_now(&self) -> Result<SweepRun> {
        self.sweep(SweepTrigger::Manual).await
    }

    async fn sweep(&self, trigger: SweepTrigger) -> Result<SweepRun> {
        let _guard = self.running.lock().await;

        let started_at = self.engine.now();
        let t0 = std::time::Instant::now();
        let candidates = self.engine.expired_cases().await?;

        let mut expired: u64 = 0;
        let mut errors: u64 = 0;
        for case in &candidates {
            match self.engine.expire(case.id).await {
                Ok(true) => expired += 1,
                // Claimed, released or already swept since we listed it.
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    warn!(case = %case.id, error = %e, "expiry failed");
                }
            }
            tokio::task::yield_now().await;
        }

        let run = SweepRun {
            started_at,
            duration_ms: t0.elapsed().as_millis() as u64,
            processed: candidates.len() as u64,
            expired,
            errors,
            trigger,
        };
        self.engine.record_sweep(run.clone()).await?;
        info!(
            processed = run.processed,
            expired = run.expired,
            errors = run.errors,
            trigger = %run.trigger,
            "sweep finished"
        );
        Ok(run)
    }
}
