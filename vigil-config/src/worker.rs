use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_core::scan::{
    command::CommandExecutorsConfig,
    orchestration::config::{AiMode, OrchestratorConfig},
};

use crate::{
    error::ConfigLoadError,
    util::{non_empty_var, parse_bool, parse_bool_var},
};

/// Source that produced the worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl std::fmt::Display for WorkerConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerConfigSource::Default => f.write_str("defaults"),
            WorkerConfigSource::EnvPath(path) => {
                write!(f, "VIGIL_CONFIG_PATH ({})", path.display())
            }
            WorkerConfigSource::EnvInline => f.write_str("VIGIL_CONFIG_JSON"),
            WorkerConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. Without one the worker keeps scans and jobs in memory.
    pub url: Option<String>,
    pub max_connections: u32,
    /// Apply embedded migrations before the worker starts.
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

/// Everything the worker binary needs to wire a runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Stage budgets, AI policy, admission, consumer, retry and cleanup tuning.
    pub orchestrator: OrchestratorConfig,
    /// External commands backing each pipeline stage.
    pub executors: CommandExecutorsConfig,
    pub database: DatabaseConfig,
    /// Agents registered for the admission role at startup. Zero keeps
    /// whatever the pool already holds.
    pub agent_pool_size: usize,
    /// Buffered progress events per subscriber before lagging ones drop.
    pub event_bus_capacity: usize,
    /// How long shutdown waits for in-flight pipelines.
    pub shutdown_drain_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            agent_pool_size: orchestrator.consumer.concurrency,
            orchestrator,
            executors: CommandExecutorsConfig::default(),
            database: DatabaseConfig::default(),
            event_bus_capacity: 1024,
            shutdown_drain_secs: 30,
        }
    }
}

impl WorkerConfig {
    /// Full startup resolution: `.env`, then [`Self::load_from_env`], then
    /// env overrides, then validation.
    pub fn load() -> anyhow::Result<(Self, WorkerConfigSource)> {
        Self::load_from(None)
    }

    /// Like [`Self::load`], but an explicit file replaces the lookup chain.
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<(Self, WorkerConfigSource)> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let (mut config, source) = match path {
            Some(path) => (
                Self::load_from_file(path)?,
                WorkerConfigSource::File(path.to_path_buf()),
            ),
            None => Self::load_from_env()?,
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok((config, source))
    }

    /// Evaluation order:
    /// 1) `$VIGIL_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$VIGIL_CONFIG_JSON` (inline JSON),
    /// 3) `vigil.toml` / `config/vigil.toml` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, WorkerConfigSource)> {
        if let Some(path) = non_empty_var("VIGIL_CONFIG_PATH") {
            let path = PathBuf::from(path);
            let config = Self::load_from_file(&path)?;
            return Ok((config, WorkerConfigSource::EnvPath(path)));
        }

        if let Some(raw) = non_empty_var("VIGIL_CONFIG_JSON") {
            let parsed = Self::parse_json(&raw).context("failed to parse VIGIL_CONFIG_JSON")?;
            return Ok((parsed, WorkerConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file(Path::new(".")) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, WorkerConfigSource::File(path)));
        }

        Ok((Self::default(), WorkerConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid worker config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid worker config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse worker config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid worker config json: {err}"))
    }

    fn find_default_file(root: &Path) -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "vigil.toml",
            "vigil.json",
            "config/vigil.toml",
            "config/vigil.json",
        ];

        CANDIDATES
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.exists())
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigLoadError> {
        if let Some(raw) = non_empty_var("VIGIL_AI_MODE") {
            self.orchestrator.pipeline.ai_mode = parse_ai_mode(&raw)?;
        }

        if let Some(raw) = non_empty_var("VIGIL_WORKER_CONCURRENCY") {
            let concurrency: usize =
                raw.parse()
                    .map_err(|err: std::num::ParseIntError| ConfigLoadError::InvalidOverride {
                        var: "VIGIL_WORKER_CONCURRENCY",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
            self.orchestrator.consumer.concurrency = concurrency;
        }

        if let Some(raw) = non_empty_var("VIGIL_CHAIN_PORT_OFFSET") {
            self.orchestrator.consumer.chain_port_offset =
                raw.parse()
                    .map_err(|err: std::num::ParseIntError| ConfigLoadError::InvalidOverride {
                        var: "VIGIL_CHAIN_PORT_OFFSET",
                        value: raw.clone(),
                        reason: err.to_string(),
                    })?;
        }

        if let Some(url) = non_empty_var("DATABASE_URL") {
            self.database.url = Some(url);
        }

        if let Some(auto_migrate) = parse_bool_var("VIGIL_AUTO_MIGRATE") {
            self.database.auto_migrate = auto_migrate;
        }
        Ok(())
    }

    /// Hard errors for values the runtime cannot work with; warnings for
    /// values that only look suspicious.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let consumer = &self.orchestrator.consumer;
        if consumer.concurrency == 0 {
            return Err(ConfigLoadError::Invalid(
                "orchestrator.consumer.concurrency must be at least 1".into(),
            ));
        }
        let (first_port, last_port) = consumer.chain_port_range();
        if last_port > u32::from(u16::MAX) {
            return Err(ConfigLoadError::Invalid(format!(
                "chain ports {first_port}..={last_port} do not fit in the port range"
            )));
        }
        let worst_case = self.orchestrator.worst_case_attempt();
        let needed = worst_case.as_secs() + u64::from(worst_case.subsec_nanos() > 0);
        if consumer.lease_ttl_secs < 0 || (consumer.lease_ttl_secs as u64) < needed {
            return Err(ConfigLoadError::Invalid(format!(
                "orchestrator.consumer.lease_ttl_secs ({}) is shorter than the longest attempt \
                 ({}s: admission deadline, stage timeouts and chain teardown); \
                 another worker could lease the job while it still runs",
                consumer.lease_ttl_secs, needed
            )));
        }
        if self.orchestrator.retry.max_attempts == 0 {
            return Err(ConfigLoadError::Invalid(
                "orchestrator.retry.max_attempts must be at least 1".into(),
            ));
        }

        let admission = &self.orchestrator.admission;
        if admission.poll_interval_secs > admission.deadline_secs {
            warn!(
                poll = admission.poll_interval_secs,
                deadline = admission.deadline_secs,
                "admission poll interval exceeds the deadline; jobs get a single admission attempt"
            );
        }
        if self.agent_pool_size > 0 && self.agent_pool_size < consumer.concurrency {
            warn!(
                agents = self.agent_pool_size,
                concurrency = consumer.concurrency,
                "fewer agents than consumer slots; extra slots will wait in admission"
            );
        }
        if self.orchestrator.pipeline.ai_mode == AiMode::Bypass {
            warn!("AI mode is 'bypass'; every scan will fail at AI_DEEP_ANALYSIS");
        }
        Ok(())
    }
}

fn parse_ai_mode(raw: &str) -> Result<AiMode, ConfigLoadError> {
    match raw.to_ascii_lowercase().as_str() {
        "required" => Ok(AiMode::Required),
        "bypass" => Ok(AiMode::Bypass),
        // `VIGIL_AI_MODE=false` style switches read as "AI off".
        other => match parse_bool(other) {
            Some(true) => Ok(AiMode::Required),
            Some(false) => Ok(AiMode::Bypass),
            None => Err(ConfigLoadError::InvalidOverride {
                var: "VIGIL_AI_MODE",
                value: raw.to_string(),
                reason: "expected 'required' or 'bypass'".into(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ai_mode_spellings() {
        assert_eq!(parse_ai_mode("Required").unwrap(), AiMode::Required);
        assert_eq!(parse_ai_mode("bypass").unwrap(), AiMode::Bypass);
        assert_eq!(parse_ai_mode("off").unwrap(), AiMode::Bypass);
        assert!(parse_ai_mode("sometimes").is_err());
    }

    #[test]
    fn default_file_lookup_prefers_root_then_config_dir() {
        let dir = tempdir().expect("tempdir");
        assert!(WorkerConfig::find_default_file(dir.path()).is_none());

        fs::create_dir(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/vigil.toml"), "").unwrap();
        assert_eq!(
            WorkerConfig::find_default_file(dir.path()),
            Some(dir.path().join("config/vigil.toml"))
        );

        fs::write(dir.path().join("vigil.toml"), "").unwrap();
        assert_eq!(
            WorkerConfig::find_default_file(dir.path()),
            Some(dir.path().join("vigil.toml"))
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = WorkerConfig::default();
        config.orchestrator.consumer.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_shorter_than_an_attempt_is_rejected() {
        let mut config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        config.orchestrator.consumer.lease_ttl_secs = 30 * 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_ttl_secs"));

        // Exactly the worst case is enough; a fractional teardown grace rounds up.
        config.orchestrator.consumer.lease_ttl_secs = 3_310;
        assert!(config.validate().is_ok());
        config.orchestrator.cleanup.grace_period_ms = 5_500;
        assert!(config.validate().is_err());
        config.orchestrator.consumer.lease_ttl_secs = 3_311;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn chain_ports_must_fit() {
        let mut config = WorkerConfig::default();
        config.orchestrator.consumer.chain_base_port = u16::MAX;
        config.orchestrator.consumer.concurrency = 2;
        assert!(config.validate().is_err());

        config.orchestrator.consumer.chain_base_port = u16::MAX - 10;
        assert!(config.validate().is_ok());
        config.orchestrator.consumer.chain_port_offset = 10;
        assert!(config.validate().is_err());
    }
}
