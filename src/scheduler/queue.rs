use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Reverse;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics::Metrics;

use super::job::{Job, JobOptions, Retention};

// ============================================================================
// JobQueue - delayed jobs with id-based dedup
// ============================================================================
//
// A delayed-delivery queue: jobs become visible to workers only once their
// delay elapses. The job id is the dedup key; an add whose id is already
// known anywhere (delayed, active, or retained in the completed/failed sets)
// is a silent no-op, so redelivered events never double-schedule work.
//
// Delayed jobs can be cancelled by id before they run. Finished jobs are
// retained for inspection, bounded by per-job retention (age and count).
//
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Scheduled { job_id: String },
    Deduplicated { job_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct Scheduled {
    due: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct FinishedJob {
    job: Job,
    finished_at: Instant,
}

#[derive(Default)]
struct QueueState {
    delayed: BinaryHeap<Reverse<Scheduled>>,
    /// Live delayed entries: job id -> heap entry seq.
    delayed_ids: HashMap<String, u64>,
    active_ids: HashSet<String>,
    completed: VecDeque<FinishedJob>,
    completed_ids: HashSet<String>,
    failed: VecDeque<FinishedJob>,
    failed_ids: HashSet<String>,
    /// Seqs of heap entries whose job was cancelled; skipped on pop.
    cancelled_seqs: HashSet<u64>,
    next_seq: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    name: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    pub fn new(name: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Schedule a job. Dedup is by job id across every lifecycle stage,
    /// retained history included, so a late redelivery of the triggering
    /// event cannot re-schedule work that already ran.
    pub async fn add(&self, name: &str, payload: Value, opts: JobOptions) -> AddOutcome {
        let job_id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = self.state.lock().await;
        let known = state.delayed_ids.contains_key(&job_id)
            || state.active_ids.contains(&job_id)
            || state.completed_ids.contains(&job_id)
            || state.failed_ids.contains(&job_id);
        if known {
            self.metrics.jobs_deduplicated.inc();
            tracing::debug!(
                queue = %self.name,
                job_id = %job_id,
                job_name = name,
                "Job already known, skipping duplicate add"
            );
            return AddOutcome::Deduplicated { job_id };
        }

        let delay = opts.delay;
        let job = Job {
            id: job_id.clone(),
            name: name.to_string(),
            payload,
            attempts_made: 0,
            opts,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed_ids.insert(job_id.clone(), seq);
        state.delayed.push(Reverse(Scheduled {
            due: Instant::now() + delay,
            seq,
            job,
        }));
        drop(state);

        self.metrics.jobs_scheduled.inc();
        tracing::info!(
            queue = %self.name,
            job_id = %job_id,
            job_name = name,
            delay_ms = delay.as_millis() as u64,
            "Job scheduled"
        );
        self.notify.notify_one();
        AddOutcome::Scheduled { job_id }
    }

    /// Cancel a delayed job by id. Returns false when the job is unknown or
    /// already past the delayed stage.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.delayed_ids.remove(job_id) {
            Some(seq) => {
                state.cancelled_seqs.insert(seq);
                drop(state);
                self.metrics.jobs_cancelled.inc();
                tracing::info!(queue = %self.name, job_id, "Delayed job cancelled");
                true
            }
            None => {
                tracing::debug!(
                    queue = %self.name,
                    job_id,
                    "Cancel requested for unknown or already-started job"
                );
                false
            }
        }
    }

    pub async fn counts(&self) -> JobCounts {
        let state = self.state.lock().await;
        JobCounts {
            delayed: state.delayed_ids.len(),
            active: state.active_ids.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Failed jobs currently retained, oldest first.
    pub async fn failed_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        state.failed.iter().map(|f| f.job.clone()).collect()
    }

    /// Wait for the next due job and mark it active. Cancel-safe: the job is
    /// only removed from the delayed set while the lock is held, with no
    /// await point before returning.
    pub(crate) async fn take_next(&self) -> Job {
        enum Head {
            Empty,
            Stale,
            Due,
            Wait(Instant),
        }

        loop {
            let notified = self.notify.notified();

            let mut taken = None;
            let wait_until = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                loop {
                    let head = match state.delayed.peek() {
                        None => Head::Empty,
                        Some(Reverse(top)) => {
                            if state.cancelled_seqs.contains(&top.seq) {
                                Head::Stale
                            } else if top.due <= Instant::now() {
                                Head::Due
                            } else {
                                Head::Wait(top.due)
                            }
                        }
                    };

                    match head {
                        Head::Empty => break None,
                        Head::Wait(due) => break Some(due),
                        Head::Stale => {
                            if let Some(Reverse(stale)) = state.delayed.pop() {
                                state.cancelled_seqs.remove(&stale.seq);
                            }
                        }
                        Head::Due => {
                            let Some(Reverse(scheduled)) = state.delayed.pop() else {
                                break None;
                            };
                            state.delayed_ids.remove(&scheduled.job.id);
                            state.active_ids.insert(scheduled.job.id.clone());
                            taken = Some(scheduled.job);
                            break None;
                        }
                    }
                }
            };

            if let Some(job) = taken {
                // More jobs may already be due; wake a sibling.
                self.notify.notify_one();
                return job;
            }

            match wait_until {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Record the outcome of an attempt: completion moves the job to the
    /// retained completed set, failure re-schedules it with backoff until the
    /// attempt budget is spent.
    pub(crate) async fn record_outcome(&self, mut job: Job, result: anyhow::Result<()>) {
        let mut rescheduled = false;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.active_ids.remove(&job.id);

            match result {
                Ok(()) => {
                    tracing::debug!(queue = %self.name, job_id = %job.id, "Job completed");
                    self.metrics.jobs_completed.inc();
                    let retention = job.opts.remove_on_complete;
                    state.completed_ids.insert(job.id.clone());
                    state.completed.push_back(FinishedJob {
                        job,
                        finished_at: Instant::now(),
                    });
                    trim_retained(&mut state.completed, &mut state.completed_ids, retention);
                }
                Err(error) => {
                    job.attempts_made += 1;
                    if job.attempts_made < job.opts.attempts {
                        let delay = job.opts.backoff.delay_for_retry(job.attempts_made);
                        tracing::warn!(
                            queue = %self.name,
                            job_id = %job.id,
                            attempt = job.attempts_made,
                            attempts = job.opts.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %error,
                            "Job attempt failed, retrying with backoff"
                        );
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        state.delayed_ids.insert(job.id.clone(), seq);
                        state.delayed.push(Reverse(Scheduled {
                            due: Instant::now() + delay,
                            seq,
                            job,
                        }));
                        rescheduled = true;
                    } else {
                        tracing::error!(
                            queue = %self.name,
                            job_id = %job.id,
                            attempts = job.attempts_made,
                            error = %error,
                            "Job exhausted its attempts, moving to failed set"
                        );
                        self.metrics.jobs_failed.inc();
                        let retention = job.opts.remove_on_fail;
                        state.failed_ids.insert(job.id.clone());
                        state.failed.push_back(FinishedJob {
                            job,
                            finished_at: Instant::now(),
                        });
                        trim_retained(&mut state.failed, &mut state.failed_ids, retention);
                    }
                }
            }
        }

        if rescheduled {
            self.notify.notify_one();
        }
    }
}

fn trim_retained(
    retained: &mut VecDeque<FinishedJob>,
    ids: &mut HashSet<String>,
    retention: Retention,
) {
    while retained.len() > retention.count {
        if let Some(evicted) = retained.pop_front() {
            ids.remove(&evicted.job.id);
        }
    }
    while retained
        .front()
        .is_some_and(|oldest| oldest.finished_at.elapsed() > retention.age)
    {
        if let Some(evicted) = retained.pop_front() {
            ids.remove(&evicted.job.id);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
