use std::{
    collections::HashMap,
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

use super::{
    config::RetryConfig,
    job::{EnqueueRequest, JobHandle, JobId, JobRecord, JobState},
    lease::{DequeueRequest, FailDisposition, JobLease, LeaseId},
};

/// Abstracts the durable job queue consumed by the scan workers.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>>;

    async fn complete(&self, lease_id: LeaseId) -> Result<()>;

    /// Record a failed execution. The queue owns the attempt counter: a
    /// retryable failure goes back to ready until `max_attempts` is spent.
    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<FailDisposition>;

    /// Flag a job as cancelled. Consumers observe the flag before the pipeline starts.
    async fn cancel_job(&self, job_id: JobId) -> Result<()>;

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool>;

    async fn job(&self, job_id: JobId) -> Result<Option<JobRecord>>;

    async fn queue_depth(&self) -> Result<usize>;
}

/// Optional capability supported by durable queue implementations to scan and
/// resurrect expired leases.
#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Returns number of jobs transitioned back to ready.
    async fn scan_expired_leases(&self) -> Result<u64>;
}

/// Exponential backoff with deterministic jitter keyed on job + attempt, so a
/// retry storm spreads out without needing an RNG.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u16 {
        self.config.max_attempts.max(1)
    }

    /// Delay before attempt `attempt + 1` becomes visible.
    pub fn delay_for(&self, job_id: JobId, attempt: u16) -> Duration {
        let anchor = self.anchor_delay_ms(attempt);
        Duration::from_millis(self.jittered_delay_for_anchor(anchor, job_id, attempt))
    }

    fn anchor_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 || self.config.backoff_base_ms == 0 {
            return 0;
        }
        let exponent = u32::from(attempt.saturating_sub(1)).min(16);
        self.config
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_max_ms)
    }

    fn jittered_delay_for_anchor(&self, anchor_ms: u64, job_id: JobId, attempt: u16) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor_ms as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor_ms as f64 - jitter_span);
        let upper = (anchor_ms as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = Self::deterministic_unit(job_id, attempt);
        (lower + (upper - lower) * unit).round() as u64
    }

    fn deterministic_unit(job_id: JobId, attempt: u16) -> f64 {
        let mut hasher = DefaultHasher::default();
        job_id.hash(&mut hasher);
        attempt.hash(&mut hasher);
        (hasher.finish() as f64) / (u64::MAX as f64)
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    leases: HashMap<LeaseId, JobId>,
}

/// Process-local queue used by tests and single-node deployments without Postgres.
pub struct InMemoryQueueService {
    state: Mutex<QueueState>,
    retry: RetryPolicy,
}

impl fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryQueueService");
        debug.field("retry", &self.retry);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("jobs", &state.jobs.len())
                    .field("leases", &state.leases.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl InMemoryQueueService {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retry: RetryPolicy::new(retry),
        }
    }

    fn release_lease(state: &mut QueueState, lease_id: LeaseId) -> Result<JobId> {
        state
            .leases
            .remove(&lease_id)
            .ok_or_else(|| ScanError::NotFound(format!("lease {:?}", lease_id.0)))
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let mut state = self.state.lock().await;
        let dedupe_key = request.dedupe_key();
        let scan_id = request.payload.scan_id;

        if let Some(existing) = state
            .jobs
            .values()
            .find(|job| job.dedupe_key == dedupe_key && job.state.is_active())
        {
            debug!(job_id = %existing.id, %scan_id, "enqueue merged into active job");
            return Ok(JobHandle {
                job_id: existing.id,
                scan_id,
                accepted: false,
            });
        }

        let record = JobRecord::new(request.payload);
        let job_id = record.id;
        state.jobs.insert(job_id, record);
        Ok(JobHandle {
            job_id,
            scan_id,
            accepted: true,
        })
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let next = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Ready && job.available_at <= now)
            .min_by_key(|job| (job.available_at, job.created_at))
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.state = JobState::Leased;
        job.lease_owner = Some(request.worker_id.clone());
        job.lease_expires_at = Some(now + request.lease_ttl);
        job.updated_at = now;

        let lease = JobLease::new(job.clone(), request.worker_id, request.lease_ttl);
        state.leases.insert(lease.lease_id, job_id);
        Ok(Some(lease))
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        let job_id = Self::release_lease(&mut state, lease_id)?;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.state = JobState::Completed;
            job.attempts = job.attempts.saturating_add(1);
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<FailDisposition> {
        let mut state = self.state.lock().await;
        let job_id = Self::release_lease(&mut state, lease_id)?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))?;

        let now = Utc::now();
        job.attempts = job.attempts.saturating_add(1);
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.last_error = error;
        job.updated_at = now;

        let disposition = if !retryable {
            job.state = JobState::Failed;
            FailDisposition::Failed {
                attempts: job.attempts,
            }
        } else if job.attempts >= self.retry.max_attempts() {
            job.state = JobState::DeadLetter;
            FailDisposition::Exhausted {
                attempts: job.attempts,
            }
        } else {
            let delay = self.retry.delay_for(job_id, job.attempts);
            let retry_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            job.state = JobState::Ready;
            job.available_at = retry_at;
            FailDisposition::Retrying {
                attempts: job.attempts,
                retry_at,
            }
        };

        if disposition.is_terminal() {
            warn!(job_id = %job_id, attempts = job.attempts, state = job.state.as_str(), "job finished unsuccessfully");
        }
        Ok(disposition)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))?;
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&job_id)
            .map(|job| job.cancel_requested)
            .unwrap_or(false))
    }

    async fn job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Ready)
            .count())
    }
}

#[async_trait]
impl LeaseExpiryScanner for InMemoryQueueService {
    async fn scan_expired_leases(&self) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let QueueState { jobs, leases } = &mut *guard;
        let now = Utc::now();
        let mut resurrected = 0;

        leases.retain(|_, job_id| {
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            let expired = job.lease_expires_at.is_some_and(|expiry| expiry <= now);
            if expired {
                job.state = JobState::Ready;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.available_at = now;
                job.updated_at = now;
                resurrected += 1;
            }
            !expired
        });

        Ok(resurrected)
    }
}
