#![allow(dead_code)]

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::broadcast;

use vigil_core::error::{Result, ScanError};
use vigil_core::scan::model::{
    ContractTarget, Finding, FindingLocation, FindingSource, RepositoryRef, ScanStep,
    ScanStepRecord, Severity,
};
use vigil_core::scan::orchestration::{
    admission::AdmissionController,
    cleanup::{ChainProcess, ResourceCleanup},
    config::{OrchestratorConfig, RetryConfig},
    consumer::{JobConsumer, JobSettlement},
    events::{ScanEvent, ScanEventPayload},
    executors::*,
    lease::DequeueRequest,
    persistence::{InMemoryStore, Repositories, StepRecordRepository},
    pipeline::PipelineOrchestrator,
    queue::{InMemoryQueueService, QueueService},
    runtime::InProcScanEventBus,
    submission::{ScanRequest, ScanSubmitter, SubmittedScan},
};
use vigil_core::types::ids::{FindingId, ProtocolId, ScanId};

pub fn finding(kind: &str, source: FindingSource) -> Finding {
    Finding {
        id: FindingId::new(),
        kind: kind.to_string(),
        severity: Severity::High,
        location: FindingLocation {
            file: "src/Vault.sol".to_string(),
            line: Some(42),
            selector: Some("withdraw(uint256)".to_string()),
        },
        description: format!("{kind} in withdraw"),
        confidence: 0.8,
        ai_confidence: None,
        remediation: None,
        source,
    }
}

/// What the AI analyzer fake does.
#[derive(Clone, Debug)]
pub enum AiScript {
    /// Return these findings with the given counters.
    Enhance {
        findings: Vec<Finding>,
        enhanced: u32,
        new: u32,
    },
    /// Echo the static findings back with zero counters.
    NoImprovement,
    Fail(ScanError),
}

/// Scriptable stage executors that record what they were asked to do.
pub struct FakeStages {
    pub clone_error: Option<ScanError>,
    pub clone_delay: Option<Duration>,
    pub compile_error: Option<ScanError>,
    /// Spawn a real placeholder chain process during DEPLOY.
    pub spawn_chain: bool,
    pub deploy_error: Option<ScanError>,
    pub static_findings: Vec<Finding>,
    pub ai: AiScript,
    /// Finding kinds whose proof generation fails.
    pub failing_proofs: HashSet<String>,
    pub submit_error: Option<ScanError>,
    /// Failure returned by the next SUBMIT call only.
    pub submit_error_once: Mutex<Option<ScanError>>,

    pub calls: Mutex<Vec<ScanStep>>,
    pub ai_inputs: Mutex<Vec<AiAnalysisInput>>,
    pub deploy_ports: Mutex<Vec<u16>>,
    pub submissions: Mutex<Vec<SubmissionInput>>,
}

impl Default for FakeStages {
    fn default() -> Self {
        Self {
            clone_error: None,
            clone_delay: None,
            compile_error: None,
            spawn_chain: true,
            deploy_error: None,
            static_findings: vec![finding("reentrancy", FindingSource::Static)],
            ai: AiScript::NoImprovement,
            failing_proofs: HashSet::new(),
            submit_error: None,
            submit_error_once: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            ai_inputs: Mutex::new(Vec::new()),
            deploy_ports: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }
}

impl FakeStages {
    fn record(&self, step: ScanStep) {
        self.calls.lock().unwrap().push(step);
    }

    pub fn calls(&self) -> Vec<ScanStep> {
        self.calls.lock().unwrap().clone()
    }

    pub fn executors(self: &Arc<Self>) -> StepExecutors {
        StepExecutors {
            clone: self.clone(),
            compile: self.clone(),
            deploy: self.clone(),
            analyze: self.clone(),
            ai: self.clone(),
            proof: self.clone(),
            submit: self.clone(),
        }
    }
}

#[async_trait]
impl CloneExecutor for FakeStages {
    async fn clone_repository(&self, input: CloneInput) -> Result<CloneOutput> {
        self.record(ScanStep::Clone);
        if let Some(delay) = self.clone_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.clone_error {
            return Err(err.clone());
        }
        Ok(CloneOutput {
            path: PathBuf::from(format!("/tmp/vigil/{}", input.scan_id)),
            commit: Some("4b825dc".to_string()),
        })
    }
}

#[async_trait]
impl CompileExecutor for FakeStages {
    async fn compile(&self, _input: CompileInput) -> Result<CompileOutput> {
        self.record(ScanStep::Compile);
        if let Some(err) = &self.compile_error {
            return Err(err.clone());
        }
        Ok(CompileOutput {
            contract_name: "Vault".to_string(),
            contract_path: "src/Vault.sol".to_string(),
            abi: json!([]),
            bytecode: "0x6080".to_string(),
        })
    }
}

#[async_trait]
impl DeployExecutor for FakeStages {
    async fn deploy(&self, input: DeployInput) -> Result<DeployOutput> {
        self.record(ScanStep::Deploy);
        self.deploy_ports.lock().unwrap().push(input.chain_port);
        if self.spawn_chain {
            let child = Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .expect("spawn placeholder chain");
            input
                .chain
                .attach(ChainProcess::new(child, input.chain_port))
                .await;
        }
        if let Some(err) = &self.deploy_error {
            return Err(err.clone());
        }
        Ok(DeployOutput {
            address: "0x00000000000000000000000000000000000000aa".to_string(),
            rpc_url: format!("http://127.0.0.1:{}", input.chain_port),
        })
    }
}

#[async_trait]
impl StaticAnalyzer for FakeStages {
    async fn analyze(&self, _input: AnalysisInput) -> Result<AnalysisOutput> {
        self.record(ScanStep::Analyze);
        Ok(AnalysisOutput {
            findings: self.static_findings.clone(),
            tool: Some("fake-slither".to_string()),
        })
    }
}

#[async_trait]
impl AiAnalyzer for FakeStages {
    async fn deep_analyze(&self, input: AiAnalysisInput) -> Result<AiAnalysisOutput> {
        self.record(ScanStep::AiDeepAnalysis);
        self.ai_inputs.lock().unwrap().push(input.clone());
        match &self.ai {
            AiScript::Enhance {
                findings,
                enhanced,
                new,
            } => Ok(AiAnalysisOutput {
                findings: findings.clone(),
                enhanced_count: *enhanced,
                new_count: *new,
                metrics: json!({ "model": "fake" }),
            }),
            AiScript::NoImprovement => Ok(AiAnalysisOutput {
                findings: input.static_findings,
                enhanced_count: 0,
                new_count: 0,
                metrics: json!({}),
            }),
            AiScript::Fail(err) => Err(err.clone()),
        }
    }
}

#[async_trait]
impl ProofGenerator for FakeStages {
    async fn generate(&self, input: ProofInput) -> Result<ProofDraft> {
        self.record(ScanStep::ProofGeneration);
        if self.failing_proofs.contains(&input.finding.kind) {
            return Err(ScanError::step(
                ScanStep::ProofGeneration,
                format!("cannot reproduce {}", input.finding.kind),
            ));
        }
        Ok(ProofDraft {
            payload: json!({
                "finding": input.finding.id,
                "deployment": input.deployment_address,
            }),
        })
    }
}

#[async_trait]
impl ProofSubmitter for FakeStages {
    async fn submit(&self, input: SubmissionInput) -> Result<SubmissionReceipt> {
        self.record(ScanStep::Submit);
        let accepted = input.proofs.len() as u32;
        self.submissions.lock().unwrap().push(input);
        if let Some(err) = &self.submit_error {
            return Err(err.clone());
        }
        if let Some(err) = self.submit_error_once.lock().unwrap().take() {
            return Err(err);
        }
        Ok(SubmissionReceipt {
            reference: Some("validator-batch-1".to_string()),
            accepted,
        })
    }
}

/// Counts cleanup calls and remembers which ones carried a process.
#[derive(Default)]
pub struct RecordingCleanup {
    calls: Mutex<Vec<Option<u16>>>,
}

impl RecordingCleanup {
    pub fn calls(&self) -> Vec<Option<u16>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceCleanup for RecordingCleanup {
    async fn cleanup(&self, process: Option<ChainProcess>) {
        // Dropping the process kills it (kill_on_drop).
        self.calls
            .lock()
            .unwrap()
            .push(process.as_ref().map(ChainProcess::port));
    }
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry = RetryConfig {
        max_attempts: 3,
        backoff_base_ms: 0,
        ..RetryConfig::default()
    };
    config.consumer.idle_poll_ms = 10;
    config
}

/// In-memory wiring of the whole consumer path.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub queue: Arc<InMemoryQueueService>,
    pub stages: Arc<FakeStages>,
    pub cleanup: Arc<RecordingCleanup>,
    pub bus: Arc<InProcScanEventBus>,
    pub consumer: Arc<JobConsumer>,
    pub submitter: ScanSubmitter,
    pub config: OrchestratorConfig,
}

impl Harness {
    pub async fn new(stages: FakeStages) -> Self {
        Self::build(stages, test_config(), 1).await
    }

    pub async fn build(stages: FakeStages, config: OrchestratorConfig, agents: usize) -> Self {
        let store = Arc::new(
            InMemoryStore::new()
                .with_agents(&config.admission.agent_role, agents)
                .await,
        );
        let queue = Arc::new(InMemoryQueueService::new(config.retry));
        let stages = Arc::new(stages);
        let cleanup = Arc::new(RecordingCleanup::default());
        let bus = Arc::new(InProcScanEventBus::new(4096));
        let repos = Repositories::from_store(store.clone());

        let admission =
            AdmissionController::new(store.clone(), bus.clone(), config.admission.clone());
        let orchestrator = PipelineOrchestrator::new(
            config.pipeline.clone(),
            stages.executors(),
            repos.clone(),
            bus.clone(),
            cleanup.clone(),
        );
        let consumer = Arc::new(JobConsumer::new(
            queue.clone(),
            repos,
            admission,
            orchestrator,
            bus.clone(),
            config.consumer.clone(),
        ));
        let submitter = ScanSubmitter::new(store.clone(), queue.clone());

        Self {
            store,
            queue,
            stages,
            cleanup,
            bus,
            consumer,
            submitter,
            config,
        }
    }

    pub async fn submit(&self) -> SubmittedScan {
        self.submitter
            .submit(ScanRequest {
                protocol_id: ProtocolId::new(),
                repository: RepositoryRef::new("https://example.com/vault.git")
                    .with_branch("main"),
                contract: ContractTarget::default(),
            })
            .await
            .expect("submit scan")
    }

    /// Lease the next ready job and run it on slot 0.
    pub async fn run_next(&self) -> JobSettlement {
        let lease = self
            .queue
            .dequeue(DequeueRequest {
                worker_id: "test-w0".to_string(),
                lease_ttl: self.config.consumer.lease_ttl(),
            })
            .await
            .expect("dequeue")
            .expect("a ready job");
        self.consumer
            .process_lease(lease, 0)
            .await
            .expect("lease settles")
    }

    pub async fn steps(&self, scan_id: ScanId) -> Vec<ScanStepRecord> {
        StepRecordRepository::list_for_scan(self.store.as_ref(), scan_id)
            .await
            .expect("list step records")
    }
}

pub fn drain(rx: &mut broadcast::Receiver<ScanEvent>) -> Vec<ScanEventPayload> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event.payload);
    }
    out
}
