//! Single tick loop coordinating the engine's periodic jobs.
//!
//! Each tick only decides which jobs are due; the work itself runs in
//! spawned tokio tasks gated by a semaphore. A job never overlaps itself,
//! and a failing job backs off exponentially instead of hammering the
//! platform API every tick.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// Runtime snapshot of one background job, for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatJobSnapshot {
    pub name: String,
    pub interval_secs: u64,
    pub last_run_at: Option<String>,
    pub last_success_at: Option<String>,
    pub last_error_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub is_running: bool,
}

impl HeartbeatJobSnapshot {
    fn new(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval_secs: interval.as_secs(),
            last_run_at: None,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            consecutive_failures: 0,
            is_running: false,
        }
    }
}

/// Shared job telemetry.
#[derive(Default)]
pub struct HeartbeatTelemetry {
    jobs: Mutex<HashMap<String, HeartbeatJobSnapshot>>,
}

impl HeartbeatTelemetry {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_job(&self, name: &str, interval: Duration) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.entry(name.to_string())
            .or_insert_with(|| HeartbeatJobSnapshot::new(name, interval));
    }

    pub fn mark_started(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_run_at = Some(Utc::now().to_rfc3339());
            job.is_running = true;
        }
    }

    pub fn mark_success(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_success_at = Some(Utc::now().to_rfc3339());
            job.last_error = None;
            job.last_error_at = None;
            job.consecutive_failures = 0;
            job.is_running = false;
        }
    }

    pub fn mark_failure(&self, name: &str, consecutive_failures: u32, message: String) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(name) {
            job.last_error_at = Some(Utc::now().to_rfc3339());
            job.last_error = Some(message);
            job.consecutive_failures = consecutive_failures;
            job.is_running = false;
        }
    }

    pub fn snapshots(&self) -> Vec<HeartbeatJobSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<HeartbeatJobSnapshot> = jobs.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }
}

type HeartbeatRunFn =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

struct HeartbeatJob {
    name: String,
    interval: Duration,
    last_run: Option<Instant>,
    /// Guards against overlapping invocations of the same job.
    is_running: Arc<AtomicBool>,
    /// Consecutive failure count drives the backoff.
    consecutive_failures: Arc<AtomicU32>,
    run: HeartbeatRunFn,
}

pub struct HeartbeatCoordinator {
    jobs: Vec<HeartbeatJob>,
    semaphore: Arc<Semaphore>,
    tick_interval: Duration,
    telemetry: Arc<HeartbeatTelemetry>,
}

impl HeartbeatCoordinator {
    pub fn new(
        tick_interval_secs: u64,
        max_concurrent: usize,
        telemetry: Arc<HeartbeatTelemetry>,
    ) -> Self {
        Self {
            jobs: Vec::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tick_interval: Duration::from_secs(tick_interval_secs.max(1)),
            telemetry,
        }
    }

    pub fn register_job<F, Fut>(&mut self, name: &str, interval: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.jobs.push(HeartbeatJob {
            name: name.to_string(),
            interval,
            last_run: None,
            is_running: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            run: Box::new(move || Box::pin(f())),
        });
        self.telemetry.register_job(name, interval);
    }

    /// Consume self and run the tick loop in a spawned tokio task.
    pub fn start(mut self) {
        tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::time::sleep(self.tick_interval).await;
            }
        });
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        for job in &mut self.jobs {
            let due = match job.last_run {
                None => true,
                Some(last) => now.duration_since(last) >= job.interval,
            };
            if !due {
                continue;
            }
            if job.is_running.load(Ordering::Relaxed) {
                tracing::debug!(job = %job.name, "Skipping: previous invocation still running");
                continue;
            }

            // effective_interval = interval * 2^min(failures, 5)
            let failures = job.consecutive_failures.load(Ordering::Relaxed);
            if failures > 0 {
                let effective_interval = job.interval * 2u32.pow(failures.min(5));
                let elapsed = match job.last_run {
                    Some(last) => now.duration_since(last),
                    None => effective_interval,
                };
                if elapsed < effective_interval {
                    tracing::debug!(
                        job = %job.name,
                        failures,
                        backoff_secs = effective_interval.as_secs(),
                        "Skipping: backoff not elapsed"
                    );
                    continue;
                }
            }

            job.last_run = Some(now);
            let sem = self.semaphore.clone();
            let fut = (job.run)();
            let job_name = job.name.clone();
            let is_running = job.is_running.clone();
            let consecutive_failures = job.consecutive_failures.clone();
            let telemetry = self.telemetry.clone();
            is_running.store(true, Ordering::Relaxed);
            telemetry.mark_started(&job_name);
            tokio::spawn(async move {
                let _permit = sem.acquire().await;
                tracing::debug!(job = %job_name, "Job starting");
                // Panics count as failures for backoff purposes.
                let result = AssertUnwindSafe(fut).catch_unwind().await;
                is_running.store(false, Ordering::Relaxed);
                match result {
                    Ok(Ok(())) => {
                        let prev = consecutive_failures.swap(0, Ordering::Relaxed);
                        if prev > 0 {
                            info!(job = %job_name, prev_failures = prev, "Job recovered");
                        }
                        telemetry.mark_success(&job_name);
                        tracing::debug!(job = %job_name, "Job completed");
                    }
                    Ok(Err(e)) => {
                        let count = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        error!(
                            job = %job_name,
                            error = %e,
                            consecutive_failures = count,
                            "Job failed; backing off"
                        );
                        telemetry.mark_failure(&job_name, count, e.to_string());
                    }
                    Err(_) => {
                        let count = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        error!(
                            job = %job_name,
                            consecutive_failures = count,
                            "Job panicked; backing off"
                        );
                        telemetry.mark_failure(&job_name, count, "job panicked".to_string());
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> (HeartbeatCoordinator, Arc<HeartbeatTelemetry>) {
        let telemetry = Arc::new(HeartbeatTelemetry::new());
        (HeartbeatCoordinator::new(1, 3, telemetry.clone()), telemetry)
    }

    #[tokio::test]
    async fn test_job_fires() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let (mut c, _) = coordinator();
        c.register_job("test_job", Duration::from_secs(0), move || {
            let n = counter_clone.clone();
            async move {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        c.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_job_respects_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let (mut c, _) = coordinator();
        c.register_job("test_job", Duration::from_secs(3600), move || {
            let n = counter_clone.clone();
            async move {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        c.tick().await;
        c.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_telemetry_tracks_failure_and_recovery() {
        let (mut c, telemetry) = coordinator();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        c.register_job("test_job", Duration::from_secs(0), move || {
            let a = attempts_clone.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first run fails");
                }
                Ok(())
            }
        });

        c.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = telemetry
            .snapshots()
            .into_iter()
            .find(|j| j.name == "test_job")
            .unwrap();
        assert_eq!(row.consecutive_failures, 1);
        assert!(row.last_error.is_some());
        assert!(row.last_run_at.is_some());

        c.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let row = telemetry
            .snapshots()
            .into_iter()
            .find(|j| j.name == "test_job")
            .unwrap();
        assert_eq!(row.consecutive_failures, 0);
        assert!(row.last_error.is_none());
        assert!(row.last_success_at.is_some());
    }
}
