use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, path::PathBuf, sync::Arc};

use crate::error::Result;
use crate::scan::model::{ContractTarget, Finding, RepositoryRef};
use crate::types::ids::{FindingId, ProtocolId, ScanId};

use super::cleanup::ChainScope;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneInput {
    pub scan_id: ScanId,
    pub repository: RepositoryRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloneOutput {
    pub path: PathBuf,
    /// Resolved commit hash of the checked out tree.
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileInput {
    pub cloned_path: PathBuf,
    #[serde(default)]
    pub contract: ContractTarget,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileOutput {
    pub contract_name: String,
    pub contract_path: String,
    pub abi: Value,
    pub bytecode: String,
}

/// Input to DEPLOY. The executor spawns the chain process on `chain_port`
/// and attaches it to `chain` so the orchestrator can tear it down.
#[derive(Clone, Debug)]
pub struct DeployInput {
    pub scan_id: ScanId,
    pub abi: Value,
    pub bytecode: String,
    pub chain_port: u16,
    pub chain: ChainScope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployOutput {
    pub address: String,
    pub rpc_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub cloned_path: PathBuf,
    pub contract_name: String,
    pub contract_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub findings: Vec<Finding>,
    /// Name of the analyzer that produced the findings.
    #[serde(default)]
    pub tool: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiAnalysisInput {
    pub cloned_path: PathBuf,
    pub contract_name: String,
    pub contract_path: String,
    pub static_findings: Vec<Finding>,
    /// Absent when DEPLOY failed.
    #[serde(default)]
    pub deployment_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiAnalysisOutput {
    pub findings: Vec<Finding>,
    /// Static findings the AI pass confirmed or refined.
    #[serde(default)]
    pub enhanced_count: u32,
    /// Findings the static baseline did not have.
    #[serde(default)]
    pub new_count: u32,
    #[serde(default)]
    pub metrics: Value,
}

impl AiAnalysisOutput {
    /// Whether the AI pass improved on the static baseline at all.
    pub fn improved(&self) -> bool {
        !self.findings.is_empty() && (self.enhanced_count > 0 || self.new_count > 0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofInput {
    pub scan_id: ScanId,
    pub finding: Finding,
    #[serde(default)]
    pub deployment_address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofDraft {
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmittedProof {
    pub finding_id: FindingId,
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionInput {
    pub scan_id: ScanId,
    pub protocol_id: ProtocolId,
    pub proofs: Vec<SubmittedProof>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub accepted: u32,
}

#[async_trait]
pub trait CloneExecutor: Send + Sync {
    async fn clone_repository(&self, input: CloneInput) -> Result<CloneOutput>;
}

#[async_trait]
pub trait CompileExecutor: Send + Sync {
    async fn compile(&self, input: CompileInput) -> Result<CompileOutput>;
}

#[async_trait]
pub trait DeployExecutor: Send + Sync {
    async fn deploy(&self, input: DeployInput) -> Result<DeployOutput>;
}

#[async_trait]
pub trait StaticAnalyzer: Send + Sync {
    async fn analyze(&self, input: AnalysisInput) -> Result<AnalysisOutput>;
}

#[async_trait]
pub trait AiAnalyzer: Send + Sync {
    async fn deep_analyze(&self, input: AiAnalysisInput) -> Result<AiAnalysisOutput>;
}

#[async_trait]
pub trait ProofGenerator: Send + Sync {
    async fn generate(&self, input: ProofInput) -> Result<ProofDraft>;
}

#[async_trait]
pub trait ProofSubmitter: Send + Sync {
    async fn submit(&self, input: SubmissionInput) -> Result<SubmissionReceipt>;
}

/// The seven stage collaborators the orchestrator sequences.
#[derive(Clone)]
pub struct StepExecutors {
    pub clone: Arc<dyn CloneExecutor>,
    pub compile: Arc<dyn CompileExecutor>,
    pub deploy: Arc<dyn DeployExecutor>,
    pub analyze: Arc<dyn StaticAnalyzer>,
    pub ai: Arc<dyn AiAnalyzer>,
    pub proof: Arc<dyn ProofGenerator>,
    pub submit: Arc<dyn ProofSubmitter>,
}

impl fmt::Debug for StepExecutors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutors")
            .field("clone", &"CloneExecutor")
            .field("compile", &"CompileExecutor")
            .field("deploy", &"DeployExecutor")
            .field("analyze", &"StaticAnalyzer")
            .field("ai", &"AiAnalyzer")
            .field("proof", &"ProofGenerator")
            .field("submit", &"ProofSubmitter")
            .finish()
    }
}
