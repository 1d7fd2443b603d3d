use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scan::model::ScanStep;

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can supply a partial payload and
/// pick up the rest. The resolved value is immutable once the runtime starts:
/// the orchestrator never consults the environment mid-pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Stage timeouts and the AI policy switch.
    pub pipeline: PipelineConfig,
    /// Agent pool admission deadline and polling cadence.
    pub admission: AdmissionConfig,
    /// Consumer parallelism, lease and chain port settings.
    pub consumer: ConsumerConfig,
    /// Retry/backoff policy applied by the queue.
    pub retry: RetryConfig,
    /// Ephemeral chain process teardown.
    pub cleanup: CleanupConfig,
}

impl OrchestratorConfig {
    /// Longest a single attempt can hold its lease: the admission wait, every
    /// stage budget, and chain teardown on both the early and the final release.
    pub fn worst_case_attempt(&self) -> Duration {
        let stages: Duration = ScanStep::ALL
            .iter()
            .map(|step| self.pipeline.timeout_for(*step))
            .sum();
        self.admission.deadline() + stages + self.cleanup.grace_period() * 2
    }
}

/// Whether the AI deep-analysis stage may be skipped.
///
/// AI is the primary analysis engine, so `Bypass` never degrades to a
/// static-only scan: it stops the pipeline with a non-retryable error.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    #[default]
    Required,
    Bypass,
}

impl AiMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AiMode::Required)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ai_mode: AiMode,
    pub clone_timeout_secs: u64,
    pub compile_timeout_secs: u64,
    pub deploy_timeout_secs: u64,
    pub analyze_timeout_secs: u64,
    pub ai_timeout_secs: u64,
    pub proof_timeout_secs: u64,
    pub submit_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ai_mode: AiMode::Required,
            clone_timeout_secs: 5 * 60,
            compile_timeout_secs: 10 * 60,
            deploy_timeout_secs: 3 * 60,
            analyze_timeout_secs: 15 * 60,
            ai_timeout_secs: 10 * 60,
            proof_timeout_secs: 5 * 60,
            submit_timeout_secs: 2 * 60,
        }
    }
}

impl PipelineConfig {
    pub fn timeout_for(&self, step: ScanStep) -> Duration {
        let secs = match step {
            ScanStep::Clone => self.clone_timeout_secs,
            ScanStep::Compile => self.compile_timeout_secs,
            ScanStep::Deploy => self.deploy_timeout_secs,
            ScanStep::Analyze => self.analyze_timeout_secs,
            ScanStep::AiDeepAnalysis => self.ai_timeout_secs,
            ScanStep::ProofGeneration => self.proof_timeout_secs,
            ScanStep::Submit => self.submit_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Budget measured from enqueue time, so time spent queued counts against it.
    pub deadline_secs: u64,
    pub poll_interval_secs: u64,
    /// Role filter applied when querying the agent pool.
    pub agent_role: String,
    /// How many lost claim races are retried inside a single poll tick.
    pub max_claim_races: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 5 * 60,
            poll_interval_secs: 15,
            agent_role: "scanner".to_string(),
            max_claim_races: 3,
        }
    }
}

impl AdmissionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of pipelines that may run at once.
    pub concurrency: usize,
    /// Port of the first consumer slot's ephemeral chain; slot N uses
    /// base + offset + N.
    pub chain_base_port: u16,
    /// Shifts this process's chain ports so several workers can share a host.
    /// Give each worker an offset at least as large as the previous worker's
    /// concurrency.
    pub chain_port_offset: u16,
    pub lease_ttl_secs: i64,
    /// Sleep between empty dequeues (ms).
    pub idle_poll_ms: u64,
    /// How often expired leases are returned to the ready set.
    pub lease_scan_interval_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            chain_base_port: 8545,
            chain_port_offset: 0,
            lease_ttl_secs: 60 * 60,
            idle_poll_ms: 500,
            lease_scan_interval_secs: 30,
        }
    }
}

impl ConsumerConfig {
    pub fn chain_port_for_slot(&self, slot: usize) -> u16 {
        self.chain_base_port
            .saturating_add(self.chain_port_offset)
            .saturating_add(slot as u16)
    }

    /// Inclusive port range used by this process's slots.
    pub fn chain_port_range(&self) -> (u32, u32) {
        let first = u32::from(self.chain_base_port) + u32::from(self.chain_port_offset);
        let last = first + self.concurrency.max(1) as u32 - 1;
        (first, last)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn lease_scan_interval(&self) -> Duration {
        Duration::from_secs(self.lease_scan_interval_secs.max(1))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so tiny delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 5_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How long a chain process gets to exit after SIGTERM before it is killed.
    pub grace_period_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

impl CleanupConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
