use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobRecord;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Lease metadata returned when a worker dequeues a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job: JobRecord,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    pub fn new(job: JobRecord, owner: String, ttl: chrono::Duration) -> Self {
        Self {
            lease_id: LeaseId::new(),
            expires_at: Utc::now() + ttl,
            lease_owner: owner,
            job,
        }
    }

    /// 1-based attempt number of the execution this lease grants.
    pub fn attempt(&self) -> u32 {
        u32::from(self.job.attempts) + 1
    }
}

/// Request object to dequeue work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DequeueRequest {
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
}

/// What the queue did with a failed lease.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FailDisposition {
    /// Job went back to ready and becomes visible again at `retry_at`.
    Retrying {
        attempts: u16,
        retry_at: DateTime<Utc>,
    },
    /// Retryable failure, but the attempt budget is spent.
    Exhausted { attempts: u16 },
    /// Non-retryable failure; the job will never run again.
    Failed { attempts: u16 },
}

impl FailDisposition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FailDisposition::Retrying { .. })
    }
}
