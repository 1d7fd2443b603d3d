use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vigil_config::{WorkerConfig, WorkerConfigSource};
use vigil_core::{
    scan::{
        model::{Agent, ContractTarget, RepositoryRef},
        orchestration::{
            AdmissionController, InMemoryQueueService, InProcScanEventBus, JobConsumer,
            LeaseExpiryScanner, PipelineOrchestrator, PostgresQueueService,
            ProcessCleanupManager, QueueService, Repositories, ScanEvent, ScanRequest,
            ScanSubmitter, ScanWorkerRuntime,
            job::JobId,
            persistence::{
                AgentPool, AgentRunRepository, FindingRepository, InMemoryStore, PostgresStore,
                ProofRepository, ScanRepository, StepRecordRepository,
            },
        },
    },
    types::ids::{ProtocolId, ScanId},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil-worker")]
#[command(about = "Scan worker for automated smart-contract audits")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(ClapArgs, Debug, Clone)]
struct Overrides {
    /// Config file (TOML or JSON). Replaces the default lookup chain.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL URL (overrides config)
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Consumer slots (overrides config)
    #[arg(long, global = true)]
    concurrency: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume scan jobs until interrupted (default)
    Run(RunArgs),
    /// Create a scan and enqueue its job
    Submit(SubmitArgs),
    /// Print a scan with its step ledger, findings, proofs and agent runs
    Status {
        scan_id: Uuid,
    },
    /// Request cancellation of a queued job
    Cancel {
        job_id: Uuid,
    },
    /// Apply database migrations and exit
    Migrate,
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct RunArgs {
    /// Keep scans and jobs in process memory instead of PostgreSQL
    #[arg(long, default_value_t = false)]
    in_memory: bool,

    /// Repository URLs to submit before the workers start
    #[arg(long = "scan", value_name = "REPO_URL")]
    scans: Vec<String>,
}

#[derive(ClapArgs, Debug, Clone)]
struct SubmitArgs {
    /// Repository URL to audit
    repository: String,

    #[arg(long)]
    branch: Option<String>,

    #[arg(long)]
    commit: Option<String>,

    /// Owning protocol; a fresh id is generated when omitted
    #[arg(long)]
    protocol_id: Option<Uuid>,

    /// Source path of the contract to compile and deploy
    #[arg(long)]
    contract_path: Option<String>,

    /// Contract name inside `contract_path`
    #[arg(long)]
    contract_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vigil_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, source) = load_config(&cli.overrides)?;
    info!(%source, "configuration resolved");

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => run_worker(config, args).await,
        Command::Submit(args) => submit_scan(&config, args).await,
        Command::Status { scan_id } => print_status(&config, ScanId(scan_id)).await,
        Command::Cancel { job_id } => cancel_job(&config, JobId(job_id)).await,
        Command::Migrate => run_migrate(&config).await,
        Command::Config => print_config(&config, &source),
    }
}

fn load_config(overrides: &Overrides) -> anyhow::Result<(WorkerConfig, WorkerConfigSource)> {
    let (mut config, source) = WorkerConfig::load_from(overrides.config.as_deref())
        .context("failed to load configuration")?;

    if let Some(url) = overrides.database_url.clone() {
        config.database.url = Some(url);
    }
    if let Some(concurrency) = overrides.concurrency {
        config.orchestrator.consumer.concurrency = concurrency;
        config.validate()?;
    }
    Ok((config, source))
}

/// Storage and queue handles shared by every subcommand.
struct Backend {
    repos: Repositories,
    queue: Arc<dyn QueueService>,
    expiry: Arc<dyn LeaseExpiryScanner>,
}

impl Backend {
    fn in_memory(config: &WorkerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueueService::new(config.orchestrator.retry));
        Self {
            repos: Repositories::from_store(store),
            queue: queue.clone(),
            expiry: queue,
        }
    }

    async fn postgres(config: &WorkerConfig) -> anyhow::Result<Self> {
        let store = connect_store(config).await?;
        if config.database.auto_migrate {
            store.migrate().await.context("database migration failed")?;
        }
        let queue = Arc::new(PostgresQueueService::new(
            store.pool().clone(),
            config.orchestrator.retry,
        ));
        Ok(Self {
            repos: Repositories::from_store(Arc::new(store)),
            queue: queue.clone(),
            expiry: queue,
        })
    }

    fn submitter(&self) -> ScanSubmitter {
        ScanSubmitter::new(self.repos.scans.clone(), self.queue.clone())
    }
}

async fn connect_store(config: &WorkerConfig) -> anyhow::Result<PostgresStore> {
    let url = config
        .database
        .url
        .as_deref()
        .context("no database configured; set DATABASE_URL or database.url")?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(PostgresStore::new(pool))
}

async fn run_worker(config: WorkerConfig, args: RunArgs) -> anyhow::Result<()> {
    let backend = if args.in_memory || config.database.url.is_none() {
        warn!("running with in-memory storage; scans do not survive a restart");
        Backend::in_memory(&config)
    } else {
        Backend::postgres(&config).await?
    };

    let executors = config
        .executors
        .build()
        .context("every pipeline stage needs a command under [executors]")?;
    ensure_agents(backend.repos.agents.as_ref(), &config).await?;

    let bus = Arc::new(InProcScanEventBus::new(config.event_bus_capacity));
    spawn_event_logger(bus.subscribe());

    let orchestrator_config = &config.orchestrator;
    let cleanup = Arc::new(ProcessCleanupManager::new(
        orchestrator_config.cleanup.grace_period(),
    ));
    let admission = AdmissionController::new(
        backend.repos.agents.clone(),
        bus.clone(),
        orchestrator_config.admission.clone(),
    );
    let orchestrator = PipelineOrchestrator::new(
        orchestrator_config.pipeline.clone(),
        executors,
        backend.repos.clone(),
        bus.clone(),
        cleanup,
    );
    let consumer = Arc::new(JobConsumer::new(
        backend.queue.clone(),
        backend.repos.clone(),
        admission,
        orchestrator,
        bus.clone(),
        orchestrator_config.consumer.clone(),
    ));

    let submitter = backend.submitter();
    for repository in args.scans {
        let submitted = submitter
            .submit(ScanRequest {
                protocol_id: ProtocolId::new(),
                repository: RepositoryRef::new(repository),
                contract: ContractTarget::default(),
            })
            .await?;
        info!(scan_id = %submitted.scan.id, job_id = %submitted.job.job_id, "seeded scan");
    }

    let runtime = ScanWorkerRuntime::new(backend.queue.clone(), consumer)
        .with_lease_expiry(backend.expiry.clone());
    runtime.start().await?;

    shutdown_signal().await;
    runtime
        .shutdown(Duration::from_secs(config.shutdown_drain_secs))
        .await?;
    Ok(())
}

/// Top the pool up to `agent_pool_size` agents for the admission role.
async fn ensure_agents(agents: &dyn AgentPool, config: &WorkerConfig) -> anyhow::Result<()> {
    let role = &config.orchestrator.admission.agent_role;
    let registered = agents.count_for_role(role).await?;
    for idx in registered..config.agent_pool_size {
        agents.register(Agent::idle(format!("{role}-{idx}"), role)).await?;
    }
    info!(
        role = %role,
        agents = registered.max(config.agent_pool_size),
        "agent pool ready"
    );
    Ok(())
}

fn spawn_event_logger(mut events: broadcast::Receiver<ScanEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(target: "scan::events", scan_id = %event.meta.scan_id, payload = ?event.payload);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "scan::events", skipped, "event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn submit_scan(config: &WorkerConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let backend = Backend::postgres(config).await?;

    let mut repository = RepositoryRef::new(args.repository);
    repository.branch = args.branch;
    repository.commit = args.commit;

    let submitted = backend
        .submitter()
        .submit(ScanRequest {
            protocol_id: args.protocol_id.map(ProtocolId).unwrap_or_default(),
            repository,
            contract: ContractTarget {
                path: args.contract_path,
                name: args.contract_name,
            },
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&submitted)?);
    Ok(())
}

async fn print_status(config: &WorkerConfig, scan_id: ScanId) -> anyhow::Result<()> {
    let store = connect_store(config).await?;

    let scan = ScanRepository::get(&store, scan_id)
        .await?
        .with_context(|| format!("scan {scan_id} not found"))?;
    let report = serde_json::json!({
        "scan": scan,
        "steps": StepRecordRepository::list_for_scan(&store, scan_id).await?,
        "findings": FindingRepository::list_for_scan(&store, scan_id).await?,
        "proofs": ProofRepository::list_for_scan(&store, scan_id).await?,
        "agent_runs": AgentRunRepository::list_for_scan(&store, scan_id).await?,
    });

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cancel_job(config: &WorkerConfig, job_id: JobId) -> anyhow::Result<()> {
    let backend = Backend::postgres(config).await?;
    backend.submitter().cancel(job_id).await?;
    info!(%job_id, "cancellation requested");
    Ok(())
}

async fn run_migrate(config: &WorkerConfig) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    store.migrate().await.context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn print_config(config: &WorkerConfig, source: &WorkerConfigSource) -> anyhow::Result<()> {
    let mut redacted = config.clone();
    if redacted.database.url.is_some() {
        redacted.database.url = Some("<redacted>".to_string());
    }
    println!("# source: {source}");
    print!("{}", toml::to_string_pretty(&redacted)?);
    Ok(())
}
