//! Persisted records of the scan domain.
//!
//! `Scan` is the aggregate root. Its step records, findings and proofs are
//! owned by it; agent runs reference it but are written by the job consumer.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, Result, ScanError};
use crate::types::ids::{
    AgentId, AgentRunId, FindingId, ProofId, ProtocolId, ScanId, StepRecordId,
};

/// Ordered pipeline stages. Declaration order is execution order.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStep {
    Clone,
    Compile,
    Deploy,
    Analyze,
    AiDeepAnalysis,
    ProofGeneration,
    Submit,
}

impl ScanStep {
    pub const ALL: [ScanStep; 7] = [
        ScanStep::Clone,
        ScanStep::Compile,
        ScanStep::Deploy,
        ScanStep::Analyze,
        ScanStep::AiDeepAnalysis,
        ScanStep::ProofGeneration,
        ScanStep::Submit,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ScanStep::Clone => "CLONE",
            ScanStep::Compile => "COMPILE",
            ScanStep::Deploy => "DEPLOY",
            ScanStep::Analyze => "ANALYZE",
            ScanStep::AiDeepAnalysis => "AI_DEEP_ANALYSIS",
            ScanStep::ProofGeneration => "PROOF_GENERATION",
            ScanStep::Submit => "SUBMIT",
        }
    }

    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<ScanStep> {
        Self::ALL.get(self.ordinal() + 1).copied()
    }
}

impl fmt::Display for ScanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStep {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == raw)
            .ok_or_else(|| ScanError::Internal(format!("unknown scan step {raw}")))
    }
}

/// Scan lifecycle. Transitions only move forward: QUEUED -> RUNNING -> terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ScanState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ScanState::Queued => "QUEUED",
            ScanState::Running => "RUNNING",
            ScanState::Succeeded => "SUCCEEDED",
            ScanState::Failed => "FAILED",
            ScanState::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Succeeded | ScanState::Failed | ScanState::Canceled
        )
    }

    pub fn can_transition_to(&self, next: ScanState) -> bool {
        match (self, next) {
            (ScanState::Queued, ScanState::Running) => true,
            // A queued scan may be failed or cancelled before a worker ever picks it up.
            (ScanState::Queued, ScanState::Failed | ScanState::Canceled) => true,
            (ScanState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "QUEUED" => Ok(ScanState::Queued),
            "RUNNING" => Ok(ScanState::Running),
            "SUCCEEDED" => Ok(ScanState::Succeeded),
            "FAILED" => Ok(ScanState::Failed),
            "CANCELED" => Ok(ScanState::Canceled),
            other => Err(ScanError::Internal(format!("unknown scan state {other}"))),
        }
    }
}

/// Where the audited sources live.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl RepositoryRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: None,
            commit: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Optional hint pinning the contract that should be compiled and deployed.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContractTarget {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Aggregate root for one audit of a protocol repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub protocol_id: ProtocolId,
    pub repository: RepositoryRef,
    pub state: ScanState,
    pub current_step: Option<ScanStep>,
    pub findings_count: u32,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scan {
    pub fn new(protocol_id: ProtocolId, repository: RepositoryRef) -> Self {
        let now = Utc::now();
        Self {
            id: ScanId::new(),
            protocol_id,
            repository,
            state: ScanState::Queued,
            current_step: None,
            findings_count: 0,
            error_code: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle transition, rejecting anything that is not forward.
    pub fn transition(&mut self, next: ScanState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScanError::Internal(format!(
                "scan {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        let now = Utc::now();
        if next == ScanState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Start a fresh execution attempt. The step cursor only resets between
    /// attempts; within one attempt it is advanced through [`Scan::advance_step`].
    pub fn begin_attempt(&mut self, attempt: u32) -> Result<()> {
        match self.state {
            ScanState::Queued => self.transition(ScanState::Running)?,
            ScanState::Running => {}
            other => {
                return Err(ScanError::Internal(format!(
                    "scan {} is already {other}",
                    self.id
                )));
            }
        }
        self.retry_count = attempt.saturating_sub(1);
        self.current_step = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Returns false (and leaves the cursor untouched) for a regression.
    pub fn advance_step(&mut self, step: ScanStep) -> bool {
        match self.current_step {
            Some(current) if step <= current => false,
            _ => {
                self.current_step = Some(step);
                self.updated_at = Utc::now();
                true
            }
        }
    }

    pub fn succeed(&mut self, findings_count: u32) -> Result<()> {
        self.transition(ScanState::Succeeded)?;
        self.findings_count = findings_count;
        Ok(())
    }

    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<()> {
        self.transition(ScanState::Failed)?;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for StepStatus {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "RUNNING" => Ok(StepStatus::Running),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(ScanError::Internal(format!("unknown step status {other}"))),
        }
    }
}

/// One execution attempt of one stage for one scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanStepRecord {
    pub id: StepRecordId,
    pub scan_id: ScanId,
    pub step: ScanStep,
    pub status: StepStatus,
    pub metadata: Value,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanStepRecord {
    pub fn running(scan_id: ScanId, step: ScanStep) -> Self {
        Self {
            id: StepRecordId::new(),
            scan_id,
            step,
            status: StepStatus::Running,
            metadata: Value::Null,
            error_code: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status != StepStatus::Running
    }

    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|done| (done - self.started_at).to_std().ok())
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Which analysis engine produced a finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingSource {
    Static,
    Ai,
    Hybrid,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FindingLocation {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub selector: Option<String>,
}

/// A single reported vulnerability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub id: FindingId,
    pub kind: String,
    pub severity: Severity,
    pub location: FindingLocation,
    pub description: String,
    /// Confidence reported by the engine that produced the finding, 0.0..=1.0.
    pub confidence: f32,
    #[serde(default)]
    pub ai_confidence: Option<f32>,
    #[serde(default)]
    pub remediation: Option<String>,
    pub source: FindingSource,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofStatus {
    Generated,
    Submitted,
}

impl ProofStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProofStatus::Generated => "GENERATED",
            ProofStatus::Submitted => "SUBMITTED",
        }
    }
}

/// Structured exploit narrative derived from exactly one finding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proof {
    pub id: ProofId,
    pub scan_id: ScanId,
    pub finding_id: FindingId,
    pub payload: Value,
    /// Filled by the downstream validator; the orchestrator only reserves the slot.
    pub signature: Option<String>,
    pub status: ProofStatus,
    pub created_at: DateTime<Utc>,
}

/// One pipeline execution attempt by one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: AgentRunId,
    pub agent_id: AgentId,
    pub scan_id: ScanId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
}

impl AgentRun {
    pub fn start(agent_id: AgentId, scan_id: ScanId) -> Self {
        Self {
            id: AgentRunId::new(),
            agent_id,
            scan_id,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn close(&mut self, failure: Option<(ErrorCode, String)>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = (now - self.started_at)
            .to_std()
            .ok()
            .map(|elapsed| elapsed.as_millis() as u64);
        if let Some((code, message)) = failure {
            self.error_code = Some(code);
            self.error_message = Some(message);
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
            AgentStatus::Offline => "OFFLINE",
        }
    }
}

/// Poolable worker identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    pub current_scan: Option<ScanId>,
}

impl Agent {
    pub fn idle(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            role: role.into(),
            status: AgentStatus::Idle,
            current_scan: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> Scan {
        Scan::new(ProtocolId::new(), RepositoryRef::new("https://example.com/p.git"))
    }

    #[test]
    fn steps_are_ordered() {
        assert!(ScanStep::Clone < ScanStep::Submit);
        assert_eq!(ScanStep::Deploy.next(), Some(ScanStep::Analyze));
        assert_eq!(ScanStep::Submit.next(), None);
        assert_eq!(
            "AI_DEEP_ANALYSIS".parse::<ScanStep>().unwrap(),
            ScanStep::AiDeepAnalysis
        );
    }

    #[test]
    fn state_only_moves_forward() {
        let mut scan = scan();
        scan.transition(ScanState::Running).unwrap();
        assert!(scan.started_at.is_some());
        scan.succeed(3).unwrap();
        assert_eq!(scan.findings_count, 3);
        assert!(scan.transition(ScanState::Running).is_err());
        assert!(scan.transition(ScanState::Failed).is_err());
    }

    #[test]
    fn current_step_never_regresses() {
        let mut scan = scan();
        scan.begin_attempt(1).unwrap();
        assert!(scan.advance_step(ScanStep::Clone));
        assert!(scan.advance_step(ScanStep::Deploy));
        assert!(!scan.advance_step(ScanStep::Compile));
        assert!(!scan.advance_step(ScanStep::Deploy));
        assert_eq!(scan.current_step, Some(ScanStep::Deploy));
    }

    #[test]
    fn new_attempt_resets_cursor_and_counts_retries() {
        let mut scan = scan();
        scan.begin_attempt(1).unwrap();
        scan.advance_step(ScanStep::Compile);
        scan.begin_attempt(2).unwrap();
        assert_eq!(scan.state, ScanState::Running);
        assert_eq!(scan.current_step, None);
        assert_eq!(scan.retry_count, 1);
    }

    #[test]
    fn failure_populates_error_fields() {
        let mut scan = scan();
        scan.begin_attempt(1).unwrap();
        scan.fail(ErrorCode::InconclusiveScan, "no findings").unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        assert_eq!(scan.error_code, Some(ErrorCode::InconclusiveScan));
        assert!(scan.completed_at.is_some());
    }
}
