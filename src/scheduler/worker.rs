use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::job::JobProcessor;
use super::queue::JobQueue;

// ============================================================================
// Worker - concurrent job execution with a shared rate limit
// ============================================================================
//
// A pool of tasks pulling due jobs off one queue. Concurrency bounds how many
// jobs run at once; the rate limiter bounds starts per second across the
// whole pool.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_limit_per_sec: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_limit_per_sec: 100,
        }
    }
}

/// Fixed-window limiter shared by all worker tasks.
struct RateLimiter {
    limit: u32,
    window: Mutex<Window>,
}

struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                if now.duration_since(window.started) >= Duration::from_secs(1) {
                    window.started = now;
                    window.count = 0;
                }
                if window.count < self.limit {
                    window.count += 1;
                    None
                } else {
                    Some(window.started + Duration::from_secs(1))
                }
            };

            match wait_until {
                None => return,
                Some(reopens) => tokio::time::sleep_until(reopens).await,
            }
        }
    }
}

struct WorkerShutdown {
    requested: AtomicBool,
    notify: Notify,
}

pub struct Worker {
    queue_name: String,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Arc<WorkerShutdown>,
}

impl Worker {
    pub fn start(queue: JobQueue, processor: Arc<dyn JobProcessor>, config: WorkerConfig) -> Self {
        let shutdown = Arc::new(WorkerShutdown {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_per_sec));

        tracing::info!(
            queue = queue.name(),
            concurrency = config.concurrency,
            rate_limit_per_sec = config.rate_limit_per_sec,
            "Worker pool started"
        );

        let tasks = (0..config.concurrency)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    queue.clone(),
                    processor.clone(),
                    limiter.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            queue_name: queue.name().to_string(),
            tasks,
            shutdown,
        }
    }

    /// Stop pulling new jobs; in-flight jobs get `grace` to finish.
    pub async fn shutdown(mut self, grace: Duration) {
        self.shutdown.requested.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_waiters();

        let drained = join_all(self.tasks.iter_mut());
        match tokio::time::timeout(grace, drained).await {
            Ok(_) => tracing::info!(queue = %self.queue_name, "Worker pool stopped"),
            Err(_) => {
                tracing::warn!(
                    queue = %self.queue_name,
                    grace_secs = grace.as_secs(),
                    "Worker pool did not drain within grace window, aborting"
                );
                for task in &self.tasks {
                    task.abort();
                }
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: JobQueue,
    processor: Arc<dyn JobProcessor>,
    limiter: Arc<RateLimiter>,
    shutdown: Arc<WorkerShutdown>,
) {
    loop {
        if shutdown.requested.load(Ordering::SeqCst) {
            break;
        }

        let job = tokio::select! {
            _ = shutdown.notify.notified() => continue,
            job = queue.take_next() => job,
        };

        limiter.acquire().await;

        tracing::debug!(
            worker_id,
            queue = queue.name(),
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts_made + 1,
            "Processing job"
        );
        let result = processor.process(&job).await;
        queue.record_outcome(job, result).await;
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
