//! Periodic job scheduler
//!
//! A dispatcher task wakes up every [`DISPATCH_RESOLUTION`] and hands due jobs
//! to a fixed pool of workers over a bounded channel. A job is never run twice
//! at the same time: a trigger that finds the previous run still going is
//! dropped, and missed runs collapse into one.

mod charge_jobs;
mod jobs;

pub use charge_jobs::{interval_for_charge, RefreshChargeJob, UpdateChargeJobs};
pub use jobs::{HeightRefreshJob, PriceRefreshJob};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How often the dispatcher looks for due jobs
pub const DISPATCH_RESOLUTION: Duration = Duration::from_millis(100);

/// A unit of periodic background work
///
/// Failures are the job's own business: log them and return.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run once
    async fn run(&self);
}

struct Entry {
    interval: Duration,
    next_run: Instant,
    job: Arc<dyn Job>,
    running: Arc<AtomicBool>,
}

struct Dispatch {
    id: String,
    job: Arc<dyn Job>,
    running: Arc<AtomicBool>,
}

struct Inner {
    workers: usize,
    jobs: Mutex<HashMap<String, Entry>>,
    started: AtomicBool,
    stopping: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the scheduler; clones share the same job table
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    /// Create a stopped scheduler with `workers` worker slots
    pub fn new(workers: usize) -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                workers: workers.max(1),
                jobs: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                stopping,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a job, replacing any job with the same id
    ///
    /// The first run happens after `first_delay`, then every `interval`.
    pub fn add_job(&self, id: &str, interval: Duration, first_delay: Duration, job: Arc<dyn Job>) {
        let entry = Entry {
            interval,
            next_run: Instant::now() + first_delay,
            job,
            running: Arc::new(AtomicBool::new(false)),
        };
        self.jobs().insert(id.to_string(), entry);
        debug!("Added job {} every {:?}", id, interval);
    }

    /// Change a job's interval; the next run is one new interval from now
    ///
    /// Returns false for an unknown id.
    pub fn reschedule(&self, id: &str, interval: Duration) -> bool {
        match self.jobs().get_mut(id) {
            Some(entry) => {
                entry.interval = interval;
                entry.next_run = Instant::now() + interval;
                true
            }
            None => false,
        }
    }

    /// Remove a job; a run already in progress is left to finish
    pub fn remove_job(&self, id: &str) -> bool {
        self.jobs().remove(id).is_some()
    }

    /// Ids of all scheduled jobs
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs().keys().cloned().collect()
    }

    /// Interval of a scheduled job
    pub fn interval_of(&self, id: &str) -> Option<Duration> {
        self.jobs().get(id).map(|entry| entry.interval)
    }

    /// Spawn the dispatcher and the workers
    ///
    /// Must be called from within a tokio runtime. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = self.inner.workers;
        let (tx, rx) = mpsc::channel::<Dispatch>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers + 1);
        for n in 0..workers {
            handles.push(tokio::spawn(worker(n, rx.clone(), self.inner.stopping.subscribe())));
        }
        handles.push(tokio::spawn(dispatcher(self.clone(), tx, self.inner.stopping.subscribe())));

        *self.inner.handles.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        info!("Job scheduler started with {} workers", workers);
    }

    /// Hand every due job to the pool
    fn dispatch_due(&self, tx: &mpsc::Sender<Dispatch>) {
        let now = Instant::now();
        let mut jobs = self.jobs();
        for (id, entry) in jobs.iter_mut() {
            if entry.next_run > now {
                continue;
            }
            // Missed runs collapse into this one
            entry.next_run = now + entry.interval;

            if entry.running.swap(true, Ordering::SeqCst) {
                debug!("Job {} still running, skipping this run", id);
                continue;
            }

            let dispatch = Dispatch {
                id: id.clone(),
                job: entry.job.clone(),
                running: entry.running.clone(),
            };
            match tx.try_send(dispatch) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(d)) => {
                    warn!("All workers busy, skipping run of job {}", d.id);
                    d.running.store(false, Ordering::SeqCst);
                }
                Err(mpsc::error::TrySendError::Closed(d)) => {
                    d.running.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Stop dispatching and wait up to `grace` for running jobs
    ///
    /// Returns whether everything finished in time. Queued runs that have
    /// not started are dropped.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.stopping.send_replace(true);
        let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap_or_else(|e| e.into_inner()));

        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Scheduler task failed: {}", e);
                }
            }
        };
        match tokio::time::timeout(grace, drain).await {
            Ok(()) => {
                info!("Job scheduler stopped");
                true
            }
            Err(_) => false,
        }
    }
}

async fn dispatcher(scheduler: JobScheduler, tx: mpsc::Sender<Dispatch>, mut stopping: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(DISPATCH_RESOLUTION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => scheduler.dispatch_due(&tx),
            _ = stopping.changed() => break,
        }
    }
    debug!("Dispatcher stopped");
}

async fn worker(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Dispatch>>>,
    mut stopping: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                d = rx.recv() => d,
                _ = stopping.changed() => None,
            }
        };
        let Some(Dispatch { id, job, running }) = next else {
            break;
        };
        if *stopping.borrow() {
            running.store(false, Ordering::SeqCst);
            break;
        }

        // A separate task so a panicking job is reported, not fatal to the worker
        let result = tokio::spawn(async move { job.run().await }).await;
        if let Err(e) = result {
            error!("Job {} failed: {}", id, e);
        }
        running.store(false, Ordering::SeqCst);
    }
    debug!("Worker {} stopped", n);
}
