use crate::metrics::Metrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One periodic responsibility. Errors are logged and counted by the runner.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct JobStats {
    invocations: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    last_run: Mutex<Option<Instant>>,
}

impl JobStats {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mark_started(&self, at: Instant) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        *self.last_run.lock().unwrap_or_else(|p| p.into_inner()) = Some(at);
    }
}

pub struct ScheduledJob {
    name: String,
    cadence: Duration,
    action: Arc<dyn Job>,
    stats: Arc<JobStats>,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, cadence: Duration, action: Arc<dyn Job>) -> Self {
        Self {
            name: name.into(),
            // interval() panics on a zero period
            cadence: cadence.max(Duration::from_millis(1)),
            action,
            stats: Arc::new(JobStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<JobStats> {
        Arc::clone(&self.stats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub clean: bool,
    /// Jobs whose in-flight run outlived the grace period.
    pub aborted: Vec<String>,
}

/// Drives every registered job on its own timer until shutdown.
pub struct JobRunner {
    jobs: Vec<ScheduledJob>,
    grace: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl JobRunner {
    pub fn new(grace: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            grace,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register(&mut self, job: ScheduledJob) -> Arc<JobStats> {
        info!(
            job = %job.name,
            cadence = %humantime::format_duration(job.cadence),
            "job registered"
        );
        let stats = job.stats();
        self.jobs.push(job);
        stats
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> ShutdownReport {
        let mut tasks = JoinSet::new();
        for job in self.jobs {
            tasks.spawn(drive(
                job,
                shutdown.clone(),
                self.grace,
                self.metrics.clone(),
            ));
        }

        let mut clean = true;
        let mut aborted = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((name, false)) => {
                    clean = false;
                    aborted.push(name);
                }
                Err(err) => {
                    error!(error = %err, "job driver task failed");
                    clean = false;
                }
            }
        }
        aborted.sort();

        info!(clean, "scheduler stopped");
        ShutdownReport { clean, aborted }
    }
}

type RunHandle = JoinHandle<anyhow::Result<()>>;

/// Returns the job name and whether it stopped without aborting a run.
async fn drive(
    job: ScheduledJob,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
    metrics: Option<Arc<Metrics>>,
) -> (String, bool) {
    let mut ticker = time::interval_at(Instant::now() + job.cadence, job.cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<RunHandle> = None;

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        job.stats.skipped.fetch_add(1, Ordering::SeqCst);
                        if let Some(m) = &metrics {
                            m.inc_job_skipped(&job.name);
                        }
                        debug!(job = %job.name, "previous run still in flight, tick skipped");
                        continue;
                    }
                    job.stats.mark_started(Instant::now());
                    if let Some(m) = &metrics {
                        m.inc_job_run(&job.name);
                    }
                    let action = Arc::clone(&job.action);
                    in_flight = Some(tokio::spawn(async move { action.run().await }));
                }
                result = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    record(&job, metrics.as_deref(), result);
                }
            }
        }
    }

    let Some(mut handle) = in_flight else {
        debug!(job = %job.name, "job stopped");
        return (job.name, true);
    };

    match time::timeout(grace, &mut handle).await {
        Ok(result) => {
            record(&job, metrics.as_deref(), result);
            debug!(job = %job.name, "in-flight run finished during shutdown");
            (job.name, true)
        }
        Err(_) => {
            handle.abort();
            warn!(
                job = %job.name,
                grace = %humantime::format_duration(grace),
                "in-flight run aborted after grace period"
            );
            (job.name, false)
        }
    }
}

async fn wait_in_flight(handle: &mut Option<RunHandle>) -> Result<anyhow::Result<()>, JoinError> {
    match handle {
        Some(h) => h.await,
        None => std::future::pending().await,
    }
}

fn record(
    job: &ScheduledJob,
    metrics: Option<&Metrics>,
    result: Result<anyhow::Result<()>, JoinError>,
) {
    let failed = match result {
        Ok(Ok(())) => {
            debug!(job = %job.name, "job run finished");
            false
        }
        Ok(Err(err)) => {
            warn!(job = %job.name, error = %format!("{err:#}"), "job run failed");
            true
        }
        Err(err) if err.is_panic() => {
            error!(job = %job.name, "job run panicked");
            true
        }
        Err(err) => {
            debug!(job = %job.name, error = %err, "job run cancelled");
            false
        }
    };

    if failed {
        job.stats.failures.fetch_add(1, Ordering::SeqCst);
        if let Some(m) = metrics {
            m.inc_job_failure(&job.name);
        }
    }
}
