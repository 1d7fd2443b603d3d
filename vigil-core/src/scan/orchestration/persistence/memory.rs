use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    error::{ErrorCode, Result, ScanError},
    scan::model::{
        Agent, AgentRun, AgentStatus, Finding, Proof, ProofStatus, Scan, ScanStep,
        ScanStepRecord, StepStatus,
    },
    types::ids::{AgentId, AgentRunId, FindingId, ProofId, ScanId, StepRecordId},
};

use super::{
    AgentPool, AgentRunRepository, FindingRepository, ProofRepository, ScanRepository,
    StepRecordRepository,
};

#[derive(Default)]
struct StoreState {
    scans: HashMap<ScanId, Scan>,
    steps: Vec<ScanStepRecord>,
    findings: HashMap<ScanId, Vec<Finding>>,
    proofs: Vec<Proof>,
    agent_runs: HashMap<AgentRunId, AgentRun>,
    agents: Vec<Agent>,
}

impl StoreState {
    fn scan_mut(&mut self, id: ScanId) -> Result<&mut Scan> {
        self.scans
            .get_mut(&id)
            .ok_or_else(|| ScanError::NotFound(format!("scan {id}")))
    }

    fn step_mut(&mut self, id: StepRecordId) -> Result<&mut ScanStepRecord> {
        let record = self
            .steps
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| ScanError::NotFound(format!("step record {id}")))?;
        if record.is_closed() {
            return Err(ScanError::Persistence(format!(
                "step record {id} for {} is already {}",
                record.step,
                record.status.as_str()
            )));
        }
        Ok(record)
    }
}

/// Process-local implementation of every repository port.
///
/// Enforces the same invariants the Postgres schema does, so pipeline tests
/// exercise the real rules.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("scans", &state.scans.len())
                    .field("steps", &state.steps.len())
                    .field("proofs", &state.proofs.len())
                    .field("agents", &state.agents.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `count` idle agents with the given role.
    pub async fn with_agents(self, role: &str, count: usize) -> Self {
        {
            let mut state = self.state.lock().await;
            for idx in 0..count {
                state.agents.push(Agent::idle(format!("{role}-{idx}"), role));
            }
        }
        self
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.state.lock().await.agents.clone()
    }
}

#[async_trait]
impl ScanRepository for InMemoryStore {
    async fn create(&self, scan: Scan) -> Result<Scan> {
        let mut state = self.state.lock().await;
        if state.scans.contains_key(&scan.id) {
            return Err(ScanError::Persistence(format!("scan {} already exists", scan.id)));
        }
        state.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn get(&self, id: ScanId) -> Result<Option<Scan>> {
        Ok(self.state.lock().await.scans.get(&id).cloned())
    }

    async fn begin_attempt(&self, id: ScanId, attempt: u32) -> Result<Scan> {
        let mut state = self.state.lock().await;
        let scan = state.scan_mut(id)?;
        scan.begin_attempt(attempt)?;
        Ok(scan.clone())
    }

    async fn advance_step(&self, id: ScanId, step: ScanStep) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.scan_mut(id)?.advance_step(step))
    }

    async fn set_findings_count(&self, id: ScanId, count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let scan = state.scan_mut(id)?;
        scan.findings_count = count;
        scan.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_succeeded(&self, id: ScanId, findings_count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scan_mut(id)?.succeed(findings_count)
    }

    async fn mark_failed(&self, id: ScanId, code: ErrorCode, message: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scan_mut(id)?.fail(code, message)
    }

    async fn mark_cancelled(&self, id: ScanId) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .scan_mut(id)?
            .transition(crate::scan::model::ScanState::Canceled)
    }
}

#[async_trait]
impl StepRecordRepository for InMemoryStore {
    async fn start(&self, scan_id: ScanId, step: ScanStep) -> Result<ScanStepRecord> {
        let mut state = self.state.lock().await;
        let already_running = state.steps.iter().any(|record| {
            record.scan_id == scan_id && record.step == step && !record.is_closed()
        });
        if already_running {
            return Err(ScanError::Persistence(format!(
                "scan {scan_id} already has a RUNNING {step} record"
            )));
        }
        let record = ScanStepRecord::running(scan_id, step);
        state.steps.push(record.clone());
        Ok(record)
    }

    async fn complete(&self, id: StepRecordId, metadata: Value) -> Result<ScanStepRecord> {
        let mut state = self.state.lock().await;
        let record = state.step_mut(id)?;
        record.status = StepStatus::Completed;
        record.metadata = metadata;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn fail(
        &self,
        id: StepRecordId,
        code: ErrorCode,
        message: &str,
        metadata: Value,
    ) -> Result<ScanStepRecord> {
        let mut state = self.state.lock().await;
        let record = state.step_mut(id)?;
        record.status = StepStatus::Failed;
        record.error_code = Some(code);
        record.error_message = Some(message.to_string());
        record.metadata = metadata;
        record.completed_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn abandon_running(&self, scan_id: ScanId, reason: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut closed = 0;
        for record in state
            .steps
            .iter_mut()
            .filter(|record| record.scan_id == scan_id && !record.is_closed())
        {
            record.status = StepStatus::Failed;
            record.error_code = Some(ErrorCode::InternalError);
            record.error_message = Some(reason.to_string());
            record.completed_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<ScanStepRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .iter()
            .filter(|record| record.scan_id == scan_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FindingRepository for InMemoryStore {
    async fn replace_for_scan(&self, scan_id: ScanId, findings: &[Finding]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.proofs.retain(|proof| {
            proof.scan_id != scan_id || proof.status != ProofStatus::Generated
        });
        let submitted: HashSet<FindingId> = state
            .proofs
            .iter()
            .filter(|proof| proof.scan_id == scan_id)
            .map(|proof| proof.finding_id)
            .collect();

        let stored = state.findings.entry(scan_id).or_default();
        stored.retain(|finding| submitted.contains(&finding.id));
        for finding in findings {
            match stored.iter_mut().find(|existing| existing.id == finding.id) {
                Some(existing) => *existing = finding.clone(),
                None => stored.push(finding.clone()),
            }
        }
        Ok(())
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Finding>> {
        let state = self.state.lock().await;
        Ok(state.findings.get(&scan_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ProofRepository for InMemoryStore {
    async fn insert(&self, proof: Proof) -> Result<()> {
        self.state.lock().await.proofs.push(proof);
        Ok(())
    }

    async fn mark_submitted(&self, scan_id: ScanId, proof_ids: &[ProofId]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for proof in state.proofs.iter_mut().filter(|proof| {
            proof.scan_id == scan_id
                && proof.status == ProofStatus::Generated
                && proof_ids.contains(&proof.id)
        }) {
            proof.status = ProofStatus::Submitted;
            updated += 1;
        }
        Ok(updated)
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Proof>> {
        let state = self.state.lock().await;
        Ok(state
            .proofs
            .iter()
            .filter(|proof| proof.scan_id == scan_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AgentRunRepository for InMemoryStore {
    async fn start(&self, run: &AgentRun) -> Result<()> {
        self.state.lock().await.agent_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn close(&self, run: &AgentRun) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.agent_runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(ScanError::NotFound(format!("agent run {}", run.id))),
        }
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<AgentRun>> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .agent_runs
            .values()
            .filter(|run| run.scan_id == scan_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.started_at);
        Ok(runs)
    }
}

#[async_trait]
impl AgentPool for InMemoryStore {
    async fn register(&self, agent: Agent) -> Result<()> {
        self.state.lock().await.agents.push(agent);
        Ok(())
    }

    async fn count_for_role(&self, role: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .filter(|agent| agent.role == role && agent.status != AgentStatus::Offline)
            .count())
    }

    async fn find_available(
        &self,
        role: &str,
        statuses: &[AgentStatus],
    ) -> Result<Option<Agent>> {
        let state = self.state.lock().await;
        Ok(state
            .agents
            .iter()
            .find(|agent| agent.role == role && statuses.contains(&agent.status))
            .cloned())
    }

    async fn try_claim(&self, agent_id: AgentId, scan_id: ScanId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(agent) = state.agents.iter_mut().find(|agent| agent.id == agent_id) else {
            return Ok(false);
        };
        if agent.status != AgentStatus::Idle {
            return Ok(false);
        }
        agent.status = AgentStatus::Busy;
        agent.current_scan = Some(scan_id);
        Ok(true)
    }

    async fn release(&self, agent_id: AgentId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.iter_mut().find(|agent| agent.id == agent_id)
            && agent.status == AgentStatus::Busy
        {
            agent.status = AgentStatus::Idle;
            agent.current_scan = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::model::{FindingLocation, FindingSource, RepositoryRef, Severity};
    use crate::types::ids::ProtocolId;

    async fn seeded() -> (InMemoryStore, ScanId) {
        let store = InMemoryStore::new();
        let scan = Scan::new(ProtocolId::new(), RepositoryRef::new("https://example.com/a.git"));
        let id = scan.id;
        ScanRepository::create(&store, scan).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn one_running_record_per_step() {
        let (store, scan_id) = seeded().await;
        let record = StepRecordRepository::start(&store, scan_id, ScanStep::Clone)
            .await
            .unwrap();
        assert!(
            StepRecordRepository::start(&store, scan_id, ScanStep::Clone)
                .await
                .is_err()
        );
        StepRecordRepository::complete(&store, record.id, Value::Null)
            .await
            .unwrap();
        // A closed record does not block the next attempt.
        StepRecordRepository::start(&store, scan_id, ScanStep::Clone)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_records_are_immutable() {
        let (store, scan_id) = seeded().await;
        let record = StepRecordRepository::start(&store, scan_id, ScanStep::Compile)
            .await
            .unwrap();
        StepRecordRepository::fail(&store, record.id, ErrorCode::CompileFailed, "x", Value::Null)
            .await
            .unwrap();
        assert!(
            StepRecordRepository::complete(&store, record.id, Value::Null)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn abandon_closes_stale_running_records() {
        let (store, scan_id) = seeded().await;
        StepRecordRepository::start(&store, scan_id, ScanStep::Analyze)
            .await
            .unwrap();
        let closed = store.abandon_running(scan_id, "lease expired").await.unwrap();
        assert_eq!(closed, 1);
        let records = StepRecordRepository::list_for_scan(&store, scan_id)
            .await
            .unwrap();
        assert_eq!(records[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn claim_is_conditional_on_idle() {
        let store = InMemoryStore::new().with_agents("scanner", 1).await;
        let agent = store
            .find_available("scanner", &[AgentStatus::Idle])
            .await
            .unwrap()
            .unwrap();
        assert!(store.try_claim(agent.id, ScanId::new()).await.unwrap());
        assert!(!store.try_claim(agent.id, ScanId::new()).await.unwrap());
        assert!(
            store
                .find_available("scanner", &[AgentStatus::Idle])
                .await
                .unwrap()
                .is_none()
        );
        store.release(agent.id).await.unwrap();
        assert!(store.try_claim(agent.id, ScanId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn role_count_ignores_offline_agents() {
        let store = InMemoryStore::new().with_agents("scanner", 2).await;
        let mut offline = Agent::idle("scanner-old", "scanner");
        offline.status = AgentStatus::Offline;
        store.register(offline).await.unwrap();
        store.register(Agent::idle("prover-0", "prover")).await.unwrap();

        assert_eq!(store.count_for_role("scanner").await.unwrap(), 2);
        assert_eq!(store.count_for_role("prover").await.unwrap(), 1);
    }

    fn finding(kind: &str) -> Finding {
        Finding {
            id: FindingId::new(),
            kind: kind.to_string(),
            severity: Severity::High,
            location: FindingLocation::default(),
            description: format!("{kind} in Vault.withdraw"),
            confidence: 0.9,
            ai_confidence: None,
            remediation: None,
            source: FindingSource::Static,
        }
    }

    fn proof_for(scan_id: ScanId, finding: &Finding) -> Proof {
        Proof {
            id: ProofId::new(),
            scan_id,
            finding_id: finding.id,
            payload: Value::Null,
            signature: None,
            status: ProofStatus::Generated,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn replacing_findings_drops_unsubmitted_results() {
        let (store, scan_id) = seeded().await;
        let stale = finding("reentrancy");
        let shipped = finding("overflow");
        store
            .replace_for_scan(scan_id, &[stale.clone(), shipped.clone()])
            .await
            .unwrap();
        let stale_proof = proof_for(scan_id, &stale);
        let shipped_proof = proof_for(scan_id, &shipped);
        store.insert(stale_proof).await.unwrap();
        store.insert(shipped_proof.clone()).await.unwrap();
        store.mark_submitted(scan_id, &[shipped_proof.id]).await.unwrap();

        let fresh = finding("access-control");
        store.replace_for_scan(scan_id, &[fresh.clone()]).await.unwrap();

        let kept: Vec<FindingId> = FindingRepository::list_for_scan(&store, scan_id)
            .await
            .unwrap()
            .into_iter()
            .map(|finding| finding.id)
            .collect();
        assert_eq!(kept, vec![shipped.id, fresh.id]);
        let proofs = ProofRepository::list_for_scan(&store, scan_id).await.unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].id, shipped_proof.id);
        assert_eq!(proofs[0].status, ProofStatus::Submitted);
    }

    #[tokio::test]
    async fn replacing_findings_upserts_by_id() {
        let (store, scan_id) = seeded().await;
        let mut original = finding("reentrancy");
        store.replace_for_scan(scan_id, &[original.clone()]).await.unwrap();
        original.remediation = Some("use a reentrancy guard".into());
        store.replace_for_scan(scan_id, &[original.clone()]).await.unwrap();

        let stored = FindingRepository::list_for_scan(&store, scan_id).await.unwrap();
        assert_eq!(stored, vec![original]);
    }

    #[tokio::test]
    async fn mark_submitted_only_touches_named_proofs() {
        let (store, scan_id) = seeded().await;
        let first = finding("reentrancy");
        let second = finding("overflow");
        store
            .replace_for_scan(scan_id, &[first.clone(), second.clone()])
            .await
            .unwrap();
        let named = proof_for(scan_id, &first);
        store.insert(named.clone()).await.unwrap();
        store.insert(proof_for(scan_id, &second)).await.unwrap();

        assert_eq!(store.mark_submitted(scan_id, &[named.id]).await.unwrap(), 1);
        let proofs = ProofRepository::list_for_scan(&store, scan_id).await.unwrap();
        for proof in proofs {
            let expected = if proof.id == named.id {
                ProofStatus::Submitted
            } else {
                ProofStatus::Generated
            };
            assert_eq!(proof.status, expected);
        }
    }
}
