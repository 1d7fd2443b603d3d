use std::{fmt, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    time::{Instant, sleep},
};
use tracing::{info, warn};

use crate::{
    error::{Result, ScanError},
    scan::model::ScanStep,
    scan::orchestration::{
        cleanup::ChainProcess,
        executors::{DeployExecutor, DeployInput, DeployOutput},
    },
    types::ids::ScanId,
};

use super::{CommandSpec, JsonCommand};

/// How the ephemeral chain for DEPLOY is started.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainCommandConfig {
    /// `{port}` in args and env is replaced with the job port.
    pub command: CommandSpec,
    /// Host the chain RPC listens on.
    pub host: String,
    /// How long to wait for the RPC port to accept connections. Zero skips the probe.
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
}

impl Default for ChainCommandConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::default(),
            host: "127.0.0.1".to_string(),
            ready_timeout_ms: 10_000,
            ready_poll_ms: 100,
        }
    }
}

impl ChainCommandConfig {
    pub fn rpc_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.host)
    }
}

/// Stdin payload of the deploy command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployRequest {
    pub scan_id: ScanId,
    pub abi: Value,
    pub bytecode: String,
    pub chain_port: u16,
    pub rpc_url: String,
}

/// Launches the chain on the job port, hands it to the job's chain scope,
/// then runs the deploy command against it.
///
/// The process is attached before the readiness probe so that a chain that
/// never comes up is still torn down by the orchestrator.
pub struct CommandDeployExecutor {
    chain: ChainCommandConfig,
    deploy: JsonCommand,
}

impl fmt::Debug for CommandDeployExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDeployExecutor")
            .field("chain", &self.chain.command.program)
            .field("deploy", &self.deploy)
            .finish()
    }
}

impl CommandDeployExecutor {
    pub fn new(chain: ChainCommandConfig, deploy: JsonCommand) -> Self {
        Self { chain, deploy }
    }

    async fn launch(&self, input: &DeployInput) -> Result<()> {
        let child = self
            .chain
            .command
            .command(Some(input.chain_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                ScanError::step(
                    ScanStep::Deploy,
                    format!("failed to start chain {}: {err}", self.chain.command.program),
                )
            })?;
        let process = ChainProcess::new(child, input.chain_port);
        info!(scan_id = %input.scan_id, pid = ?process.pid(), port = input.chain_port, "chain started");

        if let Some(stale) = input.chain.attach(process).await {
            // Dropping the handle kills the process.
            warn!(scan_id = %input.scan_id, pid = ?stale.pid(), "replaced a chain left attached to the scope");
        }
        Ok(())
    }

    async fn wait_ready(&self, port: u16) -> Result<()> {
        if self.chain.ready_timeout_ms == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_millis(self.chain.ready_timeout_ms);
        let poll = Duration::from_millis(self.chain.ready_poll_ms.max(10));
        loop {
            if TcpStream::connect((self.chain.host.as_str(), port)).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScanError::step(
                    ScanStep::Deploy,
                    format!(
                        "chain did not listen on {}:{port} within {}ms",
                        self.chain.host, self.chain.ready_timeout_ms
                    ),
                ));
            }
            sleep(poll).await;
        }
    }
}

#[async_trait]
impl DeployExecutor for CommandDeployExecutor {
    async fn deploy(&self, input: DeployInput) -> Result<DeployOutput> {
        self.launch(&input).await?;
        self.wait_ready(input.chain_port).await?;

        let request = DeployRequest {
            scan_id: input.scan_id,
            abi: input.abi,
            bytecode: input.bytecode,
            chain_port: input.chain_port,
            rpc_url: self.chain.rpc_url(input.chain_port),
        };
        self.deploy.call(&request, Some(input.chain_port)).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scan::orchestration::cleanup::{ChainScope, ProcessCleanupManager};

    fn input(chain: ChainScope) -> DeployInput {
        DeployInput {
            scan_id: ScanId::new(),
            abi: serde_json::json!([]),
            bytecode: "0x6080".to_string(),
            chain_port: 18_577,
            chain,
        }
    }

    fn chain(script: &str, ready_timeout_ms: u64) -> ChainCommandConfig {
        ChainCommandConfig {
            command: CommandSpec::new("sh").arg("-c").arg(script),
            ready_timeout_ms,
            ..ChainCommandConfig::default()
        }
    }

    #[tokio::test]
    async fn chain_is_attached_to_the_job_scope() {
        let deploy = JsonCommand::new(
            ScanStep::Deploy,
            CommandSpec::new("sh").arg("-c").arg(
                r#"cat >/dev/null; echo '{"address":"0xabc","rpc_url":"http://127.0.0.1:18577"}'"#,
            ),
        );
        let executor = CommandDeployExecutor::new(chain("sleep 30", 0), deploy);
        let scope = ChainScope::new();

        let out = executor.deploy(input(scope.clone())).await.unwrap();
        assert_eq!(out.address, "0xabc");
        assert!(scope.is_attached().await);

        scope.release(&ProcessCleanupManager::default()).await;
        assert!(!scope.is_attached().await);
    }

    #[tokio::test]
    async fn chain_that_never_listens_stays_attached_for_cleanup() {
        let deploy = JsonCommand::new(ScanStep::Deploy, CommandSpec::new("true"));
        let executor = CommandDeployExecutor::new(chain("sleep 30", 200), deploy);
        let scope = ChainScope::new();

        let err = executor.deploy(input(scope.clone())).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DeployFailed);
        assert!(scope.is_attached().await);
        scope.release(&ProcessCleanupManager::default()).await;
    }
}
