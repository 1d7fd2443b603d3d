//! Linear state machine over the seven scan stages.
//!
//! Each stage opens a ledger record, runs its executor under the stage budget
//! and closes the record before the next stage starts. What happens on
//! failure depends on the stage:
//!
//! | stage            | on failure                                          |
//! |------------------|-----------------------------------------------------|
//! | CLONE, COMPILE   | abort                                               |
//! | DEPLOY           | tear down the chain, continue without an address    |
//! | ANALYZE          | abort                                               |
//! | AI_DEEP_ANALYSIS | fall back to the static baseline, unless AI is off  |
//! | PROOF_GENERATION | skip the failing finding; abort on stage timeout    |
//! | SUBMIT           | abort                                               |
//!
//! An empty finding set after AI_DEEP_ANALYSIS aborts as inconclusive.

use std::{fmt, future::Future, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    error::{Result, ScanError},
    scan::model::{ContractTarget, Finding, Proof, ProofStatus, RepositoryRef, ScanStep},
    types::ids::{ProofId, ProtocolId, ScanId},
};

use super::{
    cleanup::{ChainScope, ResourceCleanup},
    config::PipelineConfig,
    events::{LogLevel, ScanEvent, ScanEventPayload, ScanEventPublisher, notify},
    executors::{
        AiAnalysisInput, AiAnalysisOutput, AnalysisInput, AnalysisOutput, CloneInput,
        CloneOutput, CompileInput, CompileOutput, DeployInput, ProofInput, StepExecutors,
        SubmissionInput, SubmissionReceipt, SubmittedProof,
    },
    ledger::{OpenStep, StepLedger},
    persistence::Repositories,
};

/// Everything one pipeline execution needs to know about its job.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub scan_id: ScanId,
    pub protocol_id: ProtocolId,
    pub repository: RepositoryRef,
    pub contract: ContractTarget,
    /// Job-scoped port for the ephemeral chain.
    pub chain_port: u16,
    /// Observed once, before CLONE.
    pub cancel: CancellationToken,
}

/// How the AI stage resolved the finding set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiResolution {
    /// AI findings and metrics were adopted.
    Enhanced,
    /// AI ran but did not improve on the static baseline.
    NoEnhancement,
    /// AI failed; the static baseline was kept.
    StaticFallback,
}

impl AiResolution {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AiResolution::Enhanced => "enhanced",
            AiResolution::NoEnhancement => "no_enhancement",
            AiResolution::StaticFallback => "static_fallback",
        }
    }
}

/// Result of a pipeline that reached the end of SUBMIT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub findings_count: u32,
    pub proofs_count: u32,
    pub deployment_address: Option<String>,
    pub ai_resolution: AiResolution,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    executors: StepExecutors,
    repos: Repositories,
    ledger: StepLedger,
    events: Arc<dyn ScanEventPublisher>,
    cleanup: Arc<dyn ResourceCleanup>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("executors", &self.executors)
            .field("repos", &self.repos)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        executors: StepExecutors,
        repos: Repositories,
        events: Arc<dyn ScanEventPublisher>,
        cleanup: Arc<dyn ResourceCleanup>,
    ) -> Self {
        let ledger = StepLedger::new(Arc::clone(&repos.steps), Arc::clone(&events));
        Self {
            config,
            executors,
            repos,
            ledger,
            events,
            cleanup,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage for one attempt.
    ///
    /// The chain scope is released exactly once when this returns, whatever
    /// the exit path.
    pub async fn run(&self, ctx: PipelineContext) -> Result<PipelineOutcome> {
        let chain = ChainScope::new();
        let span = info_span!("scan.pipeline", scan_id = %ctx.scan_id, protocol_id = %ctx.protocol_id);
        let result = self.run_stages(&ctx, &chain).instrument(span).await;
        chain.release(self.cleanup.as_ref()).await;

        match &result {
            Ok(outcome) => info!(
                scan_id = %ctx.scan_id,
                findings = outcome.findings_count,
                proofs = outcome.proofs_count,
                "pipeline succeeded"
            ),
            Err(err) => warn!(
                scan_id = %ctx.scan_id,
                code = %err.code(),
                retryable = err.retryable(),
                error = %err,
                "pipeline failed"
            ),
        }
        result
    }

    async fn run_stages(&self, ctx: &PipelineContext, chain: &ChainScope) -> Result<PipelineOutcome> {
        if ctx.cancel.is_cancelled() {
            info!(scan_id = %ctx.scan_id, "scan cancelled before CLONE");
            return Err(ScanError::Cancelled);
        }

        let cloned = self
            .fatal_stage(
                ctx,
                ScanStep::Clone,
                self.executors.clone.clone_repository(CloneInput {
                    scan_id: ctx.scan_id,
                    repository: ctx.repository.clone(),
                }),
                |out: &CloneOutput| json!({ "path": out.path, "commit": out.commit }),
            )
            .await?;

        let compiled = self
            .fatal_stage(
                ctx,
                ScanStep::Compile,
                self.executors.compile.compile(CompileInput {
                    cloned_path: cloned.path.clone(),
                    contract: ctx.contract.clone(),
                }),
                |out: &CompileOutput| json!({ "contract_name": out.contract_name, "contract_path": out.contract_path }),
            )
            .await?;

        let deployment_address = self.deploy(ctx, chain, &compiled).await?;

        let analysis = self
            .fatal_stage(
                ctx,
                ScanStep::Analyze,
                self.executors.analyze.analyze(AnalysisInput {
                    cloned_path: cloned.path.clone(),
                    contract_name: compiled.contract_name.clone(),
                    contract_path: compiled.contract_path.clone(),
                }),
                |out: &AnalysisOutput| json!({ "findings": out.findings.len(), "tool": out.tool }),
            )
            .await?;

        let (findings, ai_resolution) = self
            .deep_analysis(
                ctx,
                AiAnalysisInput {
                    cloned_path: cloned.path.clone(),
                    contract_name: compiled.contract_name.clone(),
                    contract_path: compiled.contract_path.clone(),
                    static_findings: analysis.findings,
                    deployment_address: deployment_address.clone(),
                },
            )
            .await?;

        if findings.is_empty() {
            warn!(scan_id = %ctx.scan_id, "no findings after AI deep analysis; scan is inconclusive");
            self.log(ctx, LogLevel::Warn, "no findings after AI deep analysis")
                .await;
            return Err(ScanError::Inconclusive);
        }

        let findings_count = findings.len() as u32;
        self.repos.findings.replace_for_scan(ctx.scan_id, &findings).await?;
        self.repos
            .scans
            .set_findings_count(ctx.scan_id, findings_count)
            .await?;

        let proofs = self
            .generate_proofs(ctx, &findings, deployment_address.as_deref())
            .await?;
        let proofs_count = proofs.len() as u32;
        let proof_ids: Vec<ProofId> = proofs.iter().map(|proof| proof.id).collect();

        let submission = SubmissionInput {
            scan_id: ctx.scan_id,
            protocol_id: ctx.protocol_id,
            proofs: proofs
                .into_iter()
                .map(|proof| SubmittedProof {
                    finding_id: proof.finding_id,
                    payload: proof.payload,
                })
                .collect(),
        };
        self.fatal_stage(
            ctx,
            ScanStep::Submit,
            async {
                let receipt = self.executors.submit.submit(submission).await?;
                self.repos
                    .proofs
                    .mark_submitted(ctx.scan_id, &proof_ids)
                    .await?;
                Ok(receipt)
            },
            |receipt: &SubmissionReceipt| {
                json!({
                    "reference": receipt.reference,
                    "accepted": receipt.accepted,
                    "proofs": proofs_count,
                })
            },
        )
        .await?;

        Ok(PipelineOutcome {
            success: true,
            findings_count,
            proofs_count,
            deployment_address,
            ai_resolution,
        })
    }

    /// Cursor advance plus ledger open. Runs before any executor work.
    async fn enter(&self, ctx: &PipelineContext, step: ScanStep) -> Result<OpenStep> {
        if !self.repos.scans.advance_step(ctx.scan_id, step).await? {
            return Err(ScanError::Internal(format!(
                "scan {} cannot move back to {step}",
                ctx.scan_id
            )));
        }
        self.ledger.open(ctx.scan_id, step).await
    }

    async fn timed<T, F>(&self, step: ScanStep, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let budget = self.config.timeout_for(step);
        let span = info_span!("scan.stage", %step);
        match timeout(budget, work.instrument(span)).await {
            Ok(result) => result,
            Err(_) => Err(ScanError::StepTimeout {
                step,
                timeout: budget,
            }),
        }
    }

    /// Close a failed record. The stage error wins over a ledger error.
    async fn close_failed(&self, open: OpenStep, err: &ScanError, fatal: bool) {
        let step = open.step;
        if let Err(ledger_err) = self.ledger.fail(open, err, fatal, Value::Null).await {
            warn!(%step, error = %ledger_err, "failed to record step failure");
        }
    }

    async fn fatal_stage<T, F, M>(
        &self,
        ctx: &PipelineContext,
        step: ScanStep,
        work: F,
        metadata: M,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        M: FnOnce(&T) -> Value,
    {
        let open = self.enter(ctx, step).await?;
        match self.timed(step, work).await {
            Ok(output) => {
                self.ledger.complete(open, metadata(&output)).await?;
                Ok(output)
            }
            Err(err) => {
                warn!(scan_id = %ctx.scan_id, %step, error = %err, "stage failed");
                self.close_failed(open, &err, true).await;
                Err(err)
            }
        }
    }

    /// DEPLOY never aborts the pipeline. Returns the contract address when
    /// deployment worked.
    async fn deploy(
        &self,
        ctx: &PipelineContext,
        chain: &ChainScope,
        compiled: &CompileOutput,
    ) -> Result<Option<String>> {
        let step = ScanStep::Deploy;
        let open = self.enter(ctx, step).await?;
        let input = DeployInput {
            scan_id: ctx.scan_id,
            abi: compiled.abi.clone(),
            bytecode: compiled.bytecode.clone(),
            chain_port: ctx.chain_port,
            chain: chain.clone(),
        };

        match self.timed(step, self.executors.deploy.deploy(input)).await {
            Ok(deployed) => {
                let metadata = json!({
                    "address": deployed.address,
                    "rpc_url": deployed.rpc_url,
                    "chain_port": ctx.chain_port,
                });
                self.ledger.complete(open, metadata).await?;
                Ok(Some(deployed.address))
            }
            Err(err) => {
                warn!(scan_id = %ctx.scan_id, error = %err, "deploy failed; continuing without a deployment");
                self.close_failed(open, &err, false).await;
                chain.release(self.cleanup.as_ref()).await;
                self.log(ctx, LogLevel::Warn, format!("deploy failed: {err}"))
                    .await;
                Ok(None)
            }
        }
    }

    async fn deep_analysis(
        &self,
        ctx: &PipelineContext,
        input: AiAnalysisInput,
    ) -> Result<(Vec<Finding>, AiResolution)> {
        let step = ScanStep::AiDeepAnalysis;
        let open = self.enter(ctx, step).await?;

        if !self.config.ai_mode.is_enabled() {
            let err = ScanError::AiRequiredDisabled;
            warn!(scan_id = %ctx.scan_id, "AI deep analysis is bypassed by configuration");
            self.close_failed(open, &err, true).await;
            return Err(err);
        }

        let baseline = input.static_findings.clone();
        match self.timed(step, self.executors.ai.deep_analyze(input)).await {
            Ok(output) if output.improved() => {
                let metadata = ai_metadata(&output, AiResolution::Enhanced, baseline.len());
                self.ledger.complete(open, metadata).await?;
                Ok((output.findings, AiResolution::Enhanced))
            }
            Ok(output) => {
                let mut metadata =
                    ai_metadata(&output, AiResolution::NoEnhancement, baseline.len());
                metadata["note"] = json!("AI produced no enhancement over the static baseline");
                self.ledger.complete(open, metadata).await?;
                Ok((baseline, AiResolution::NoEnhancement))
            }
            Err(ScanError::AiRequiredDisabled) => {
                let err = ScanError::AiRequiredDisabled;
                warn!(scan_id = %ctx.scan_id, "AI analyzer reports AI as disabled");
                self.close_failed(open, &err, true).await;
                Err(err)
            }
            Err(err) => {
                warn!(scan_id = %ctx.scan_id, error = %err, "AI deep analysis failed; using static findings");
                self.close_failed(open, &err, false).await;
                self.log(ctx, LogLevel::Warn, format!("AI analysis failed: {err}"))
                    .await;
                Ok((baseline, AiResolution::StaticFallback))
            }
        }
    }

    /// One proof per finding, best effort. Only the stage budget or a
    /// persistence error aborts the batch.
    async fn generate_proofs(
        &self,
        ctx: &PipelineContext,
        findings: &[Finding],
        deployment_address: Option<&str>,
    ) -> Result<Vec<Proof>> {
        let total = findings.len();
        let batch = async {
            let mut proofs = Vec::with_capacity(total);
            for (idx, finding) in findings.iter().enumerate() {
                let input = ProofInput {
                    scan_id: ctx.scan_id,
                    finding: finding.clone(),
                    deployment_address: deployment_address.map(str::to_owned),
                };
                match self.executors.proof.generate(input).await {
                    Ok(draft) => {
                        let proof = Proof {
                            id: ProofId::new(),
                            scan_id: ctx.scan_id,
                            finding_id: finding.id,
                            payload: draft.payload,
                            signature: None,
                            status: ProofStatus::Generated,
                            created_at: Utc::now(),
                        };
                        self.repos.proofs.insert(proof.clone()).await?;
                        proofs.push(proof);
                    }
                    Err(err) => {
                        warn!(scan_id = %ctx.scan_id, finding = %finding.id, error = %err, "proof generation failed; skipping finding");
                    }
                }
                notify(
                    self.events.as_ref(),
                    ScanEvent::new(
                        ctx.scan_id,
                        ScanEventPayload::Progress {
                            step: ScanStep::ProofGeneration,
                            percent: (((idx + 1) * 100) / total) as u8,
                            message: format!("{} of {total} findings processed", idx + 1),
                        },
                    ),
                )
                .await;
            }
            Ok(proofs)
        };

        let proofs = self
            .fatal_stage(ctx, ScanStep::ProofGeneration, batch, |proofs: &Vec<Proof>| {
                json!({
                    "findings": total,
                    "generated": proofs.len(),
                    "skipped": total - proofs.len(),
                })
            })
            .await?;
        debug!(scan_id = %ctx.scan_id, generated = proofs.len(), total, "proof generation finished");
        Ok(proofs)
    }

    async fn log(&self, ctx: &PipelineContext, level: LogLevel, message: impl Into<String>) {
        notify(
            self.events.as_ref(),
            ScanEvent::log(ctx.scan_id, level, message),
        )
        .await;
    }
}

fn ai_metadata(output: &AiAnalysisOutput, resolution: AiResolution, baseline: usize) -> Value {
    json!({
        "resolution": resolution.as_str(),
        "static_findings": baseline,
        "ai_findings": output.findings.len(),
        "enhanced": output.enhanced_count,
        "new": output.new_count,
        "metrics": output.metrics,
    })
}
