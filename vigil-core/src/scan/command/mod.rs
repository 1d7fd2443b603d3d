//! Stage executors that run configured external commands.
//!
//! Every stage command receives its typed input as one JSON document on stdin
//! and must print its typed output as one JSON document on stdout. Exit
//! statuses carry the failure class:
//!
//! - `0`: success, stdout is parsed as the stage output
//! - [`EXIT_PERMANENT`]: failure that retrying cannot fix
//! - [`EXIT_AI_DISABLED`]: the AI engine refuses to run (AI stage only)
//! - anything else: retryable failure
//!
//! DEPLOY additionally launches the chain command on the job port; see
//! [`CommandDeployExecutor`].

mod deploy;

pub use deploy::*;

use std::{collections::BTreeMap, fmt, path::PathBuf, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

use crate::{
    error::{Result, ScanError},
    scan::model::ScanStep,
    scan::orchestration::executors::{
        AiAnalysisInput, AiAnalysisOutput, AiAnalyzer, AnalysisInput, AnalysisOutput,
        CloneExecutor, CloneInput, CloneOutput, CompileExecutor, CompileInput, CompileOutput,
        ProofDraft, ProofGenerator, ProofInput, ProofSubmitter, StaticAnalyzer,
        StepExecutors, SubmissionInput, SubmissionReceipt,
    },
};

/// `EX_DATAERR`: the input itself is bad.
pub const EXIT_PERMANENT: i32 = 65;
/// `EX_CONFIG`: the AI engine is switched off on its side.
pub const EXIT_AI_DISABLED: i32 = 78;

/// How much of stderr is kept in error messages.
const STDERR_TAIL: usize = 2_048;

/// One external program invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.program.trim().is_empty()
    }

    /// Build the process with every `{port}` in args and env replaced.
    fn command(&self, port: Option<u16>) -> Command {
        let expand = |raw: &str| match port {
            Some(port) => raw.replace("{port}", &port.to_string()),
            None => raw.to_string(),
        };
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args.iter().map(|arg| expand(arg)));
        for (key, value) in &self.env {
            cmd.env(key, expand(value));
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Commands for every stage plus the chain launcher used by DEPLOY.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandExecutorsConfig {
    pub clone: CommandSpec,
    pub compile: CommandSpec,
    pub chain: ChainCommandConfig,
    pub deploy: CommandSpec,
    pub analyze: CommandSpec,
    pub ai: CommandSpec,
    pub proof: CommandSpec,
    pub submit: CommandSpec,
}

impl CommandExecutorsConfig {
    /// Stages without a program.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            ("clone", &self.clone),
            ("compile", &self.compile),
            ("chain", &self.chain.command),
            ("deploy", &self.deploy),
            ("analyze", &self.analyze),
            ("ai", &self.ai),
            ("proof", &self.proof),
            ("submit", &self.submit),
        ]
        .into_iter()
        .filter(|(_, spec)| !spec.is_configured())
        .map(|(name, _)| name)
        .collect()
    }

    pub fn build(&self) -> Result<StepExecutors> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(ScanError::Internal(format!(
                "no command configured for: {}",
                missing.join(", ")
            )));
        }
        Ok(StepExecutors {
            clone: Arc::new(JsonCommand::new(ScanStep::Clone, self.clone.clone())),
            compile: Arc::new(JsonCommand::new(ScanStep::Compile, self.compile.clone())),
            deploy: Arc::new(CommandDeployExecutor::new(
                self.chain.clone(),
                JsonCommand::new(ScanStep::Deploy, self.deploy.clone()),
            )),
            analyze: Arc::new(JsonCommand::new(ScanStep::Analyze, self.analyze.clone())),
            ai: Arc::new(JsonCommand::new(ScanStep::AiDeepAnalysis, self.ai.clone())),
            proof: Arc::new(JsonCommand::new(
                ScanStep::ProofGeneration,
                self.proof.clone(),
            )),
            submit: Arc::new(JsonCommand::new(ScanStep::Submit, self.submit.clone())),
        })
    }
}

/// A stage command speaking JSON over stdio.
#[derive(Clone)]
pub struct JsonCommand {
    step: ScanStep,
    spec: CommandSpec,
}

impl fmt::Debug for JsonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCommand")
            .field("step", &self.step)
            .field("program", &self.spec.program)
            .finish()
    }
}

impl JsonCommand {
    pub fn new(step: ScanStep, spec: CommandSpec) -> Self {
        Self { step, spec }
    }

    pub fn step(&self) -> ScanStep {
        self.step
    }

    /// Run the command once with `input` on stdin and parse stdout.
    pub async fn call<I, O>(&self, input: &I, port: Option<u16>) -> Result<O>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let step = self.step;
        let body = serde_json::to_vec(input)?;

        let mut child = self
            .spec
            .command(port)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                ScanError::step_permanent(
                    step,
                    format!("failed to spawn {}: {err}", self.spec.program),
                )
            })?;

        // Stdin is written while stdout drains so neither pipe can fill up.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that exits without reading stdin is judged by its status.
                if let Err(err) = stdin.write_all(&body).await {
                    debug!(%step, error = %err, "stage command closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output =
            output.map_err(|err| ScanError::step(step, format!("waiting on command failed: {err}")))?;

        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            warn!(%step, status = %output.status, stderr = %stderr, "stage command failed");
            return Err(match output.status.code() {
                Some(EXIT_AI_DISABLED) if step == ScanStep::AiDeepAnalysis => {
                    ScanError::AiRequiredDisabled
                }
                Some(EXIT_PERMANENT) => ScanError::step_permanent(step, stderr),
                _ => ScanError::step(step, format!("exited with {}: {stderr}", output.status)),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|err| {
            ScanError::step(step, format!("command printed invalid output: {err}"))
        })
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[async_trait]
impl CloneExecutor for JsonCommand {
    async fn clone_repository(&self, input: CloneInput) -> Result<CloneOutput> {
        self.call(&input, None).await
    }
}

#[async_trait]
impl CompileExecutor for JsonCommand {
    async fn compile(&self, input: CompileInput) -> Result<CompileOutput> {
        self.call(&input, None).await
    }
}

#[async_trait]
impl StaticAnalyzer for JsonCommand {
    async fn analyze(&self, input: AnalysisInput) -> Result<AnalysisOutput> {
        self.call(&input, None).await
    }
}

#[async_trait]
impl AiAnalyzer for JsonCommand {
    async fn deep_analyze(&self, input: AiAnalysisInput) -> Result<AiAnalysisOutput> {
        self.call(&input, None).await
    }
}

#[async_trait]
impl ProofGenerator for JsonCommand {
    async fn generate(&self, input: ProofInput) -> Result<ProofDraft> {
        self.call(&input, None).await
    }
}

#[async_trait]
impl ProofSubmitter for JsonCommand {
    async fn submit(&self, input: SubmissionInput) -> Result<SubmissionReceipt> {
        self.call(&input, None).await
    }
}
