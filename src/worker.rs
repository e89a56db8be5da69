//! Bounded-concurrency email discovery
//!
//! Workers share one task receiver, so at most `concurrency` tasks (and
//! sessions) are in flight. Every task runs in its own spawned future: a panic
//! or a session crash becomes that record's `Error` state and never reaches
//! the scheduler or a sibling task.

use crate::{
    classify_website, format_duration, Config, DiscoveryConfig, EmailDiscovery, EmailStatus,
    ErrorSeverity, HarvestError, Metrics, NormalizedUrl, RecordStore, SessionGuard, SessionSource,
    SkipReason, NOT_AVAILABLE,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// One website to probe, bound to the record it belongs to
///
/// Only built by [`plan_tasks`], which gives every record index at most one
/// task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebsiteTask {
    record_index: usize,
    url: NormalizedUrl,
}

impl WebsiteTask {
    pub fn record_index(&self) -> usize {
        self.record_index
    }

    pub fn url(&self) -> &NormalizedUrl {
        &self.url
    }
}

/// The immutable task list for one discovery run
#[derive(Debug, Default)]
pub struct TaskPlan {
    pub tasks: Vec<WebsiteTask>,
    pub skipped: Vec<(usize, SkipReason)>,
    /// Records that already carried a terminal email value.
    pub already_resolved: usize,
}

pub fn plan_tasks(store: &RecordStore, config: &DiscoveryConfig) -> TaskPlan {
    let mut plan = TaskPlan::default();

    for (index, record) in store.iter() {
        if record.email.is_terminal() {
            plan.already_resolved += 1;
            continue;
        }
        match classify_website(record.website_url.as_deref(), &config.blocklist) {
            Ok(url) => plan.tasks.push(WebsiteTask {
                record_index: index,
                url,
            }),
            Err(reason) => plan.skipped.push((index, reason)),
        }
    }

    plan
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub record_index: usize,
    pub url: NormalizedUrl,
    pub status: EmailStatus,
    /// Set for `Error` outcomes; picks the log level
    pub severity: Option<ErrorSeverity>,
    pub duration: Duration,
}

pub struct DiscoveryWorker {
    id: usize,
    sessions: SessionSource,
    config: Arc<DiscoveryConfig>,
    metrics: Arc<Metrics>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl DiscoveryWorker {
    pub fn new(
        id: usize,
        sessions: SessionSource,
        config: Arc<DiscoveryConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            sessions,
            config,
            metrics,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run_with_shared_receiver(
        &self,
        tasks: Arc<Mutex<mpsc::Receiver<WebsiteTask>>>,
        results: mpsc::Sender<TaskOutcome>,
    ) {
        debug!("Starting discovery worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let task = {
                let mut receiver = tasks.lock().await;
                receiver.recv().await
            };
            let Some(task) = task else { break };

            let outcome = self.process_task(task).await;
            if matches!(outcome.status, EmailStatus::Error(_)) {
                self.error_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
            }

            if let Err(e) = results.send(outcome).await {
                error!("Worker {} failed to send result: {}", self.id, e);
                break;
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Discovery worker {} stopped", self.id);
    }

    async fn process_task(&self, task: WebsiteTask) -> TaskOutcome {
        debug!("Worker {} probing {}", self.id, task.url);
        let started = Instant::now();

        let sessions = self.sessions.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let url = task.url.clone();
        let handle =
            tokio::spawn(async move { discover_website(sessions, config, metrics, url).await });

        let (status, severity) = match handle.await {
            Ok(Ok(Some(email))) => (EmailStatus::Found(email), None),
            Ok(Ok(None)) => (EmailStatus::NotFound, None),
            Ok(Err(e)) => (EmailStatus::Error(e.to_string()), Some(e.severity())),
            Err(join_error) if join_error.is_panic() => (
                EmailStatus::Error("discovery task panicked".to_string()),
                Some(ErrorSeverity::High),
            ),
            Err(join_error) => (
                EmailStatus::Error(join_error.to_string()),
                Some(ErrorSeverity::High),
            ),
        };

        TaskOutcome {
            record_index: task.record_index,
            url: task.url,
            status,
            severity,
            duration: started.elapsed(),
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl Clone for DiscoveryWorker {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sessions: self.sessions.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

// Owns the session for the whole task; the guard closes it if this future
// unwinds.
async fn discover_website(
    sessions: SessionSource,
    config: Arc<DiscoveryConfig>,
    metrics: Arc<Metrics>,
    url: NormalizedUrl,
) -> Result<Option<String>, HarvestError> {
    let session = sessions.acquire().await?;
    let guard = SessionGuard::new(session, url.as_str());

    let result = EmailDiscovery::new(&config, &metrics)
        .discover(guard.session(), &url)
        .await;

    sessions.release(guard, result.is_ok()).await;
    result.map(|found| found.map(|discovered| discovered.email))
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

pub struct WorkerPool {
    workers: Vec<DiscoveryWorker>,
    task_sender: Option<mpsc::Sender<WebsiteTask>>,
    result_receiver: mpsc::Receiver<TaskOutcome>,
}

impl WorkerPool {
    /// `capacity` bounds both queues. Submitting more than `capacity` tasks
    /// before draining outcomes can stall the workers.
    pub fn new(
        width: usize,
        capacity: usize,
        sessions: SessionSource,
        config: Arc<DiscoveryConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let width = width.max(1);
        let capacity = capacity.max(1);
        let (task_sender, task_receiver) = mpsc::channel(capacity);
        let (result_sender, result_receiver) = mpsc::channel(capacity);

        let workers: Vec<DiscoveryWorker> = (0..width)
            .map(|i| DiscoveryWorker::new(i, sessions.clone(), config.clone(), metrics.clone()))
            .collect();

        let shared_receiver = Arc::new(Mutex::new(task_receiver));
        for worker in &workers {
            let worker = worker.clone();
            let rx = shared_receiver.clone();
            let tx = result_sender.clone();
            tokio::spawn(async move {
                worker.run_with_shared_receiver(rx, tx).await;
            });
        }

        Self {
            workers,
            task_sender: Some(task_sender),
            result_receiver,
        }
    }

    pub async fn submit(&self, task: WebsiteTask) -> Result<(), HarvestError> {
        let sender = self
            .task_sender
            .as_ref()
            .ok_or_else(|| HarvestError::TaskFailed("worker pool is closed".to_string()))?;
        sender
            .send(task)
            .await
            .map_err(|e| HarvestError::TaskFailed(e.to_string()))
    }

    /// Stop accepting tasks; workers exit once the queue drains.
    pub fn close(&mut self) {
        self.task_sender = None;
    }

    pub async fn next_outcome(&mut self) -> Option<TaskOutcome> {
        self.result_receiver.recv().await
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn width(&self) -> usize {
        self.workers.len()
    }
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Count one completion and return how many are done so far.
    pub fn record_completion(&self, success: bool) -> usize {
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            elapsed,
            rate,
            eta: (rate > 0.0).then(|| {
                Duration::from_secs_f64(self.total.saturating_sub(completed) as f64 / rate)
            }),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub elapsed: Duration,
    pub rate: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub dispatched: usize,
    pub found: usize,
    pub not_found: usize,
    pub errors: usize,
    pub skipped: Vec<(usize, SkipReason)>,
    pub already_resolved: usize,
    pub elapsed: Duration,
}

/// Discover emails for every unresolved record in `store`.
///
/// Skipped records are marked `NotFound` without any navigation. Each
/// dispatched record ends in exactly one terminal state, merged back by its
/// index, so the store's order is untouched by completion order.
pub async fn run_discovery(
    store: &mut RecordStore,
    sessions: SessionSource,
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<DiscoveryReport, HarvestError> {
    let started = Instant::now();
    let plan = plan_tasks(store, &config.discovery);
    let mut report = DiscoveryReport {
        dispatched: plan.tasks.len(),
        already_resolved: plan.already_resolved,
        ..DiscoveryReport::default()
    };

    for (index, reason) in &plan.skipped {
        debug!("Skipping record {}: {}", index, reason);
        store.resolve_email(*index, EmailStatus::NotFound)?;
    }
    metrics.record_skipped(plan.skipped.len());
    report.skipped = plan.skipped;

    if plan.tasks.is_empty() {
        info!("No websites to probe");
        report.elapsed = started.elapsed();
        return Ok(report);
    }

    let mut pool = WorkerPool::new(
        config.discovery.concurrency,
        plan.tasks.len(),
        sessions.clone(),
        Arc::new(config.discovery.clone()),
        metrics.clone(),
    );
    info!(
        "Probing {} websites with {} workers ({} skipped, {} already resolved)",
        plan.tasks.len(),
        pool.width(),
        report.skipped.len(),
        report.already_resolved
    );
    let mut pending: HashSet<usize> = plan.tasks.iter().map(|t| t.record_index).collect();
    let urls: Vec<(usize, NormalizedUrl)> = plan
        .tasks
        .iter()
        .map(|t| (t.record_index, t.url.clone()))
        .collect();

    for task in plan.tasks {
        pool.submit(task).await?;
    }
    pool.close();

    let progress = ProgressTracker::new(report.dispatched);
    while let Some(outcome) = pool.next_outcome().await {
        if !pending.remove(&outcome.record_index) {
            warn!("Ignoring duplicate outcome for record {}", outcome.record_index);
            continue;
        }
        let done = progress.record_completion(!matches!(outcome.status, EmailStatus::Error(_)));
        log_outcome(done, report.dispatched, &outcome);
        if done % PROGRESS_EVERY == 0 && done < report.dispatched {
            log_progress(&progress.get_progress());
        }
        metrics.record_outcome(&outcome.status, outcome.duration);
        tally(&mut report, &outcome.status);
        store.resolve_email(outcome.record_index, outcome.status)?;
    }

    // Workers only stop early if the result channel broke.
    if !progress.is_complete() {
        for (index, url) in urls.into_iter().filter(|(i, _)| pending.contains(i)) {
            error!("No outcome for {}; marking as failed", url);
            let status = EmailStatus::Error("worker stopped before finishing".to_string());
            tally(&mut report, &status);
            store.resolve_email(index, status)?;
        }
    }

    for stats in pool.get_worker_stats() {
        debug!(
            "Worker {}: {} resolved, {} errors",
            stats.id, stats.processed_count, stats.error_count
        );
    }

    sessions.shutdown().await;
    report.elapsed = started.elapsed();

    let info = progress.get_progress();
    info!(
        "Discovery finished in {:.1}s: {} found, {} not found, {} errors ({:.2} sites/s)",
        report.elapsed.as_secs_f64(),
        report.found,
        report.not_found,
        report.errors,
        info.rate
    );
    Ok(report)
}

fn tally(report: &mut DiscoveryReport, status: &EmailStatus) {
    match status {
        EmailStatus::Found(_) => report.found += 1,
        EmailStatus::NotFound => report.not_found += 1,
        EmailStatus::Error(_) => report.errors += 1,
        EmailStatus::Unset => {}
    }
}

const PROGRESS_EVERY: usize = 25;

fn log_progress(info: &ProgressInfo) {
    info!(
        "Progress: {}/{} done, {} errors, {:.2} sites/s, ETA {}",
        info.completed,
        info.total,
        info.errors,
        info.rate,
        info.eta.map(format_duration).unwrap_or_else(|| "unknown".to_string())
    );
}

fn log_outcome(done: usize, total: usize, outcome: &TaskOutcome) {
    match &outcome.status {
        EmailStatus::Found(email) => {
            info!("[{}/{}] Found email on {}: {}", done, total, outcome.url, email)
        }
        EmailStatus::Error(message)
            if outcome.severity.map_or(true, ErrorSeverity::is_alerting) =>
        {
            error!("[{}/{}] Error on {}: {}", done, total, outcome.url, message)
        }
        EmailStatus::Error(message) => {
            warn!("[{}/{}] Error on {}: {}", done, total, outcome.url, message)
        }
        _ => info!(
            "[{}/{}] No email on {}: {}",
            done, total, outcome.url, NOT_AVAILABLE
        ),
    }
}
