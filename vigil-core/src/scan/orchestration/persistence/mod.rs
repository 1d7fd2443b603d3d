//! Repository ports for the scan domain.
//!
//! The orchestrator only talks to these traits. Each transition is written at
//! most once per attempt, so implementations do not need to be idempotent
//! beyond rejecting writes that would break an invariant (closing a closed
//! step record, opening a second RUNNING record for the same step).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{ErrorCode, Result},
    scan::model::{
        Agent, AgentRun, AgentStatus, Finding, Proof, Scan, ScanStep, ScanStepRecord,
    },
    types::ids::{AgentId, ProofId, ScanId, StepRecordId},
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresQueueService, PostgresStore};

#[async_trait]
pub trait ScanRepository: Send + Sync {
    async fn create(&self, scan: Scan) -> Result<Scan>;

    async fn get(&self, id: ScanId) -> Result<Option<Scan>>;

    /// QUEUED -> RUNNING on the first attempt; resets the step cursor on later ones.
    async fn begin_attempt(&self, id: ScanId, attempt: u32) -> Result<Scan>;

    /// Move `current_step` forward. Returns false when `step` would regress it.
    async fn advance_step(&self, id: ScanId, step: ScanStep) -> Result<bool>;

    async fn set_findings_count(&self, id: ScanId, count: u32) -> Result<()>;

    async fn mark_succeeded(&self, id: ScanId, findings_count: u32) -> Result<()>;

    async fn mark_failed(&self, id: ScanId, code: ErrorCode, message: &str) -> Result<()>;

    async fn mark_cancelled(&self, id: ScanId) -> Result<()>;
}

#[async_trait]
pub trait StepRecordRepository: Send + Sync {
    /// Open a RUNNING record. Fails if one is already open for (scan, step).
    async fn start(&self, scan_id: ScanId, step: ScanStep) -> Result<ScanStepRecord>;

    async fn complete(&self, id: StepRecordId, metadata: Value) -> Result<ScanStepRecord>;

    async fn fail(
        &self,
        id: StepRecordId,
        code: ErrorCode,
        message: &str,
        metadata: Value,
    ) -> Result<ScanStepRecord>;

    /// Close records left RUNNING by an attempt that died without cleanup.
    async fn abandon_running(&self, scan_id: ScanId, reason: &str) -> Result<u64>;

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<ScanStepRecord>>;
}

#[async_trait]
pub trait FindingRepository: Send + Sync {
    /// Store the finding set of the current attempt. Findings left by an
    /// earlier attempt are dropped with their unsubmitted proofs; findings
    /// whose proofs already went downstream are kept. Upserts by id.
    async fn replace_for_scan(&self, scan_id: ScanId, findings: &[Finding]) -> Result<()>;

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Finding>>;
}

#[async_trait]
pub trait ProofRepository: Send + Sync {
    async fn insert(&self, proof: Proof) -> Result<()>;

    /// Hand the given generated proofs over to the downstream validator.
    async fn mark_submitted(&self, scan_id: ScanId, proof_ids: &[ProofId]) -> Result<u64>;

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Proof>>;
}

#[async_trait]
pub trait AgentRunRepository: Send + Sync {
    async fn start(&self, run: &AgentRun) -> Result<()>;

    async fn close(&self, run: &AgentRun) -> Result<()>;

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<AgentRun>>;
}

/// Bounded pool of worker identities consulted by admission control.
#[async_trait]
pub trait AgentPool: Send + Sync {
    async fn register(&self, agent: Agent) -> Result<()>;

    /// Registered agents with the role, in any status except OFFLINE.
    async fn count_for_role(&self, role: &str) -> Result<usize>;

    /// Zero or one candidate matching the role and status filter. Not a claim.
    async fn find_available(&self, role: &str, statuses: &[AgentStatus])
    -> Result<Option<Agent>>;

    /// Conditional claim: succeeds only if the agent is still idle. Returns
    /// false when another consumer won the race.
    async fn try_claim(&self, agent_id: AgentId, scan_id: ScanId) -> Result<bool>;

    async fn release(&self, agent_id: AgentId) -> Result<()>;
}

/// Bundle of repository handles passed to the orchestrator and consumer.
#[derive(Clone)]
pub struct Repositories {
    pub scans: Arc<dyn ScanRepository>,
    pub steps: Arc<dyn StepRecordRepository>,
    pub findings: Arc<dyn FindingRepository>,
    pub proofs: Arc<dyn ProofRepository>,
    pub agent_runs: Arc<dyn AgentRunRepository>,
    pub agents: Arc<dyn AgentPool>,
}

impl Repositories {
    /// Use one store object for every port.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ScanRepository
            + StepRecordRepository
            + FindingRepository
            + ProofRepository
            + AgentRunRepository
            + AgentPool
            + 'static,
    {
        Self {
            scans: store.clone(),
            steps: store.clone(),
            findings: store.clone(),
            proofs: store.clone(),
            agent_runs: store.clone(),
            agents: store,
        }
    }
}

impl fmt::Debug for Repositories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repositories")
            .field("scans", &"ScanRepository")
            .field("steps", &"StepRecordRepository")
            .field("findings", &"FindingRepository")
            .field("proofs", &"ProofRepository")
            .field("agent_runs", &"AgentRunRepository")
            .field("agents", &"AgentPool")
            .finish()
    }
}
