use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::scan::model::{ContractTarget, RepositoryRef};
use crate::types::ids::{ProtocolId, ScanId};

/// Unique identifier for queued scan jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue-visible job states. Ready/Leased map directly to queue presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobState {
    Ready,
    Leased,
    Completed,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLetter => "dead_letter",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Leased)
    }
}

impl FromStr for JobState {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "ready" => Ok(JobState::Ready),
            "leased" => Ok(JobState::Leased),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_letter" => Ok(JobState::DeadLetter),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(ScanError::Queue(format!("unknown job state {other}"))),
        }
    }
}

/// Payload carried by every scan job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanJob {
    pub scan_id: ScanId,
    pub protocol_id: ProtocolId,
    pub repository: RepositoryRef,
    #[serde(default)]
    pub contract: ContractTarget,
    /// Admission deadline is measured from here, not from dequeue time.
    pub enqueued_at: DateTime<Utc>,
}

impl ScanJob {
    pub fn new(scan_id: ScanId, protocol_id: ProtocolId, repository: RepositoryRef) -> Self {
        Self {
            scan_id,
            protocol_id,
            repository,
            contract: ContractTarget::default(),
            enqueued_at: Utc::now(),
        }
    }

    /// One active job per scan.
    pub fn dedupe_key(&self) -> String {
        format!("scan:{}", self.scan_id)
    }
}

/// Envelope stored in persistence for each job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: ScanJob,
    pub state: JobState,
    pub attempts: u16,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub dedupe_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(payload: ScanJob) -> Self {
        let now = Utc::now();
        let dedupe_key = payload.dedupe_key();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Ready,
            attempts: 0,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            cancel_requested: false,
            dedupe_key,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Request payload to enqueue a new job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub payload: ScanJob,
}

impl EnqueueRequest {
    pub fn new(payload: ScanJob) -> Self {
        Self { payload }
    }

    pub fn dedupe_key(&self) -> String {
        self.payload.dedupe_key()
    }
}

/// Handle returned after enqueueing, used by callers to track or cancel the job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub scan_id: ScanId,
    /// False when the request merged into an already active job for the same scan.
    pub accepted: bool,
}
