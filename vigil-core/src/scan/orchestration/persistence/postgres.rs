//! Postgres-backed repositories and durable job queue.
//!
//! Queries are built at runtime so the crate compiles without a live database
//! or offline query cache.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ErrorCode, Result, ScanError},
    scan::model::{
        Agent, AgentRun, AgentStatus, Finding, Proof, ProofStatus, Scan, ScanStep,
        ScanStepRecord,
    },
    scan::orchestration::{
        config::RetryConfig,
        job::{EnqueueRequest, JobHandle, JobId, JobRecord, JobState},
        lease::{DequeueRequest, FailDisposition, JobLease, LeaseId},
        queue::{LeaseExpiryScanner, QueueService, RetryPolicy},
    },
    types::ids::{AgentId, AgentRunId, FindingId, ProofId, ProtocolId, ScanId, StepRecordId},
};

use super::{
    AgentPool, AgentRunRepository, FindingRepository, ProofRepository, ScanRepository,
    StepRecordRepository,
};

/// Text column value of a unit enum, using its serde name.
fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        Value::String(text) => Ok(text),
        other => Err(ScanError::Internal(format!(
            "expected a string enum, got {other}"
        ))),
    }
}

fn enum_from_text<T: DeserializeOwned>(text: String) -> Result<T> {
    Ok(serde_json::from_value(Value::String(text))?)
}

fn opt_code(raw: Option<String>) -> Result<Option<ErrorCode>> {
    raw.map(|code| code.parse()).transpose()
}

fn scan_from_row(row: &PgRow) -> Result<Scan> {
    let current_step: Option<String> = row.try_get("current_step")?;
    Ok(Scan {
        id: ScanId(row.try_get("id")?),
        protocol_id: ProtocolId(row.try_get("protocol_id")?),
        repository: serde_json::from_value(row.try_get("repository")?)?,
        state: row.try_get::<String, _>("state")?.parse()?,
        current_step: current_step.map(|step| step.parse()).transpose()?,
        findings_count: row.try_get::<i32, _>("findings_count")?.max(0) as u32,
        error_code: opt_code(row.try_get("error_code")?)?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn step_record_from_row(row: &PgRow) -> Result<ScanStepRecord> {
    Ok(ScanStepRecord {
        id: StepRecordId(row.try_get("id")?),
        scan_id: ScanId(row.try_get("scan_id")?),
        step: row.try_get::<String, _>("step")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        metadata: row.try_get("metadata")?,
        error_code: opt_code(row.try_get("error_code")?)?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn finding_from_row(row: &PgRow) -> Result<Finding> {
    Ok(Finding {
        id: FindingId(row.try_get("id")?),
        kind: row.try_get("kind")?,
        severity: enum_from_text(row.try_get("severity")?)?,
        location: serde_json::from_value(row.try_get("location")?)?,
        description: row.try_get("description")?,
        confidence: row.try_get("confidence")?,
        ai_confidence: row.try_get("ai_confidence")?,
        remediation: row.try_get("remediation")?,
        source: enum_from_text(row.try_get("source")?)?,
    })
}

fn proof_from_row(row: &PgRow) -> Result<Proof> {
    Ok(Proof {
        id: ProofId(row.try_get("id")?),
        scan_id: ScanId(row.try_get("scan_id")?),
        finding_id: FindingId(row.try_get("finding_id")?),
        payload: row.try_get("payload")?,
        signature: row.try_get("signature")?,
        status: enum_from_text(row.try_get("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn agent_run_from_row(row: &PgRow) -> Result<AgentRun> {
    Ok(AgentRun {
        id: AgentRunId(row.try_get("id")?),
        agent_id: AgentId(row.try_get("agent_id")?),
        scan_id: ScanId(row.try_get("scan_id")?),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row
            .try_get::<Option<i64>, _>("duration_ms")?
            .map(|ms| ms.max(0) as u64),
        error_code: opt_code(row.try_get("error_code")?)?,
        error_message: row.try_get("error_message")?,
    })
}

fn agent_from_row(row: &PgRow) -> Result<Agent> {
    Ok(Agent {
        id: AgentId(row.try_get("id")?),
        name: row.try_get("name")?,
        role: row.try_get("role")?,
        status: enum_from_text(row.try_get("status")?)?,
        current_scan: row.try_get::<Option<Uuid>, _>("current_scan")?.map(ScanId),
    })
}

/// All repository ports on one connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| ScanError::Persistence(format!("migration failed: {err}")))?;
        info!("scan orchestrator migrations applied");
        Ok(())
    }

    /// Load, mutate through the model's transition rules, and store back
    /// under a row lock.
    async fn update_scan<F>(&self, id: ScanId, apply: F) -> Result<Scan>
    where
        F: FnOnce(&mut Scan) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM scans WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan {id}")))?;
        let mut scan = scan_from_row(&row)?;
        apply(&mut scan)?;

        sqlx::query(
            r#"
            UPDATE scans
            SET state = $2,
                current_step = $3,
                current_step_ordinal = $4,
                findings_count = $5,
                error_code = $6,
                error_message = $7,
                started_at = $8,
                completed_at = $9,
                retry_count = $10,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(scan.state.as_str())
        .bind(scan.current_step.map(|step| step.as_str()))
        .bind(scan.current_step.map(|step| step.ordinal() as i16))
        .bind(scan.findings_count as i32)
        .bind(scan.error_code.map(|code| code.as_str()))
        .bind(scan.error_message.as_deref())
        .bind(scan.started_at)
        .bind(scan.completed_at)
        .bind(scan.retry_count as i32)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(scan)
    }

    async fn close_step(
        &self,
        id: StepRecordId,
        status: &str,
        code: Option<ErrorCode>,
        message: Option<&str>,
        metadata: Value,
    ) -> Result<ScanStepRecord> {
        let row = sqlx::query(
            r#"
            UPDATE scan_step_records
            SET status = $2,
                error_code = $3,
                error_message = $4,
                metadata = $5,
                completed_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(status)
        .bind(code.map(|code| code.as_str()))
        .bind(message)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            ScanError::Persistence(format!("step record {id} is missing or already closed"))
        })?;
        step_record_from_row(&row)
    }
}

#[async_trait]
impl ScanRepository for PostgresStore {
    async fn create(&self, scan: Scan) -> Result<Scan> {
        sqlx::query(
            r#"
            INSERT INTO scans (id, protocol_id, repository, state, findings_count,
                               retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(scan.id.as_uuid())
        .bind(scan.protocol_id.as_uuid())
        .bind(serde_json::to_value(&scan.repository)?)
        .bind(scan.state.as_str())
        .bind(scan.findings_count as i32)
        .bind(scan.retry_count as i32)
        .bind(scan.created_at)
        .bind(scan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(scan)
    }

    async fn get(&self, id: ScanId) -> Result<Option<Scan>> {
        sqlx::query("SELECT * FROM scans WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| scan_from_row(&row))
            .transpose()
    }

    async fn begin_attempt(&self, id: ScanId, attempt: u32) -> Result<Scan> {
        self.update_scan(id, |scan| scan.begin_attempt(attempt))
            .await
    }

    async fn advance_step(&self, id: ScanId, step: ScanStep) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scans
            SET current_step = $2, current_step_ordinal = $3, updated_at = NOW()
            WHERE id = $1 AND COALESCE(current_step_ordinal, -1) < $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(step.as_str())
        .bind(step.ordinal() as i16)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_findings_count(&self, id: ScanId, count: u32) -> Result<()> {
        sqlx::query("UPDATE scans SET findings_count = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(count as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_succeeded(&self, id: ScanId, findings_count: u32) -> Result<()> {
        self.update_scan(id, |scan| scan.succeed(findings_count))
            .await
            .map(|_| ())
    }

    async fn mark_failed(&self, id: ScanId, code: ErrorCode, message: &str) -> Result<()> {
        let message = message.to_string();
        self.update_scan(id, move |scan| scan.fail(code, message))
            .await
            .map(|_| ())
    }

    async fn mark_cancelled(&self, id: ScanId) -> Result<()> {
        self.update_scan(id, |scan| {
            scan.transition(crate::scan::model::ScanState::Canceled)
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl StepRecordRepository for PostgresStore {
    async fn start(&self, scan_id: ScanId, step: ScanStep) -> Result<ScanStepRecord> {
        let record = ScanStepRecord::running(scan_id, step);
        let inserted = sqlx::query(
            r#"
            INSERT INTO scan_step_records (id, scan_id, step, status, metadata, started_at)
            VALUES ($1, $2, $3, 'RUNNING', $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(scan_id.as_uuid())
        .bind(step.as_str())
        .bind(&record.metadata)
        .bind(record.started_at)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(ScanError::Persistence(format!(
                "scan {scan_id} already has a RUNNING {step} record"
            )));
        }
        Ok(record)
    }

    async fn complete(&self, id: StepRecordId, metadata: Value) -> Result<ScanStepRecord> {
        self.close_step(id, "COMPLETED", None, None, metadata).await
    }

    async fn fail(
        &self,
        id: StepRecordId,
        code: ErrorCode,
        message: &str,
        metadata: Value,
    ) -> Result<ScanStepRecord> {
        self.close_step(id, "FAILED", Some(code), Some(message), metadata)
            .await
    }

    async fn abandon_running(&self, scan_id: ScanId, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_step_records
            SET status = 'FAILED', error_code = $2, error_message = $3, completed_at = NOW()
            WHERE scan_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(scan_id.as_uuid())
        .bind(ErrorCode::InternalError.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<ScanStepRecord>> {
        sqlx::query("SELECT * FROM scan_step_records WHERE scan_id = $1 ORDER BY started_at")
            .bind(scan_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(step_record_from_row)
            .collect()
    }
}

#[async_trait]
impl FindingRepository for PostgresStore {
    async fn replace_for_scan(&self, scan_id: ScanId, findings: &[Finding]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let discarded_proofs = sqlx::query("DELETE FROM proofs WHERE scan_id = $1 AND status = $2")
            .bind(scan_id.as_uuid())
            .bind(ProofStatus::Generated.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let discarded_findings = sqlx::query(
            r#"
            DELETE FROM findings f
            WHERE f.scan_id = $1
              AND NOT EXISTS (SELECT 1 FROM proofs p WHERE p.finding_id = f.id)
            "#,
        )
        .bind(scan_id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if discarded_proofs > 0 || discarded_findings > 0 {
            debug!(%scan_id, discarded_findings, discarded_proofs, "dropped results of an earlier attempt");
        }

        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO findings (id, scan_id, kind, severity, location, description,
                                      confidence, ai_confidence, remediation, source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE
                SET kind = EXCLUDED.kind,
                    severity = EXCLUDED.severity,
                    location = EXCLUDED.location,
                    description = EXCLUDED.description,
                    confidence = EXCLUDED.confidence,
                    ai_confidence = EXCLUDED.ai_confidence,
                    remediation = EXCLUDED.remediation,
                    source = EXCLUDED.source
                WHERE findings.scan_id = EXCLUDED.scan_id
                "#,
            )
            .bind(finding.id.as_uuid())
            .bind(scan_id.as_uuid())
            .bind(&finding.kind)
            .bind(enum_text(&finding.severity)?)
            .bind(serde_json::to_value(&finding.location)?)
            .bind(&finding.description)
            .bind(finding.confidence)
            .bind(finding.ai_confidence)
            .bind(finding.remediation.as_deref())
            .bind(enum_text(&finding.source)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(%scan_id, count = findings.len(), "findings stored");
        Ok(())
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Finding>> {
        sqlx::query("SELECT * FROM findings WHERE scan_id = $1 ORDER BY created_at, id")
            .bind(scan_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(finding_from_row)
            .collect()
    }
}

#[async_trait]
impl ProofRepository for PostgresStore {
    async fn insert(&self, proof: Proof) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proofs (id, scan_id, finding_id, payload, signature, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(proof.id.as_uuid())
        .bind(proof.scan_id.as_uuid())
        .bind(proof.finding_id.as_uuid())
        .bind(&proof.payload)
        .bind(proof.signature.as_deref())
        .bind(proof.status.as_str())
        .bind(proof.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_submitted(&self, scan_id: ScanId, proof_ids: &[ProofId]) -> Result<u64> {
        let ids: Vec<Uuid> = proof_ids.iter().map(ProofId::as_uuid).collect();
        let result = sqlx::query(
            r#"
            UPDATE proofs SET status = $2, submitted_at = NOW()
            WHERE scan_id = $1 AND status = $3 AND id = ANY($4)
            "#,
        )
        .bind(scan_id.as_uuid())
        .bind(ProofStatus::Submitted.as_str())
        .bind(ProofStatus::Generated.as_str())
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<Proof>> {
        sqlx::query("SELECT * FROM proofs WHERE scan_id = $1 ORDER BY created_at")
            .bind(scan_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(proof_from_row)
            .collect()
    }
}

#[async_trait]
impl AgentRunRepository for PostgresStore {
    async fn start(&self, run: &AgentRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_runs (id, agent_id, scan_id, started_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(run.id.as_uuid())
        .bind(run.agent_id.as_uuid())
        .bind(run.scan_id.as_uuid())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self, run: &AgentRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agent_runs
            SET completed_at = $2, duration_ms = $3, error_code = $4, error_message = $5
            WHERE id = $1
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.completed_at)
        .bind(run.duration_ms.map(|ms| ms as i64))
        .bind(run.error_code.map(|code| code.as_str()))
        .bind(run.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("agent run {}", run.id)));
        }
        Ok(())
    }

    async fn list_for_scan(&self, scan_id: ScanId) -> Result<Vec<AgentRun>> {
        sqlx::query("SELECT * FROM agent_runs WHERE scan_id = $1 ORDER BY started_at")
            .bind(scan_id.as_uuid())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(agent_run_from_row)
            .collect()
    }
}

#[async_trait]
impl AgentPool for PostgresStore {
    async fn register(&self, agent: Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, role, status, current_scan)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, role = EXCLUDED.role, updated_at = NOW()
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(&agent.name)
        .bind(&agent.role)
        .bind(agent.status.as_str())
        .bind(agent.current_scan.map(|scan| scan.as_uuid()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_for_role(&self, role: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agents WHERE role = $1 AND status <> 'OFFLINE'",
        )
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn find_available(
        &self,
        role: &str,
        statuses: &[AgentStatus],
    ) -> Result<Option<Agent>> {
        let statuses: Vec<String> = statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            SELECT * FROM agents
            WHERE role = $1 AND status = ANY($2)
            ORDER BY updated_at
            LIMIT 1
            "#,
        )
        .bind(role)
        .bind(statuses)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| agent_from_row(&row))
        .transpose()
    }

    async fn try_claim(&self, agent_id: AgentId, scan_id: ScanId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET status = 'BUSY', current_scan = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'IDLE'
            "#,
        )
        .bind(agent_id.as_uuid())
        .bind(scan_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, agent_id: AgentId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET status = 'IDLE', current_scan = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'BUSY'
            "#,
        )
        .bind(agent_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const JOB_COLUMNS: &str = "id, payload, state, attempts, available_at, lease_owner, \
     lease_expires_at, last_error, cancel_requested, dedupe_key, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        payload: serde_json::from_value(row.try_get("payload")?)?,
        state: row.try_get::<String, _>("state")?.parse()?,
        attempts: row.try_get::<i32, _>("attempts")?.clamp(0, i32::from(u16::MAX)) as u16,
        available_at: row.try_get("available_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
        cancel_requested: row.try_get("cancel_requested")?,
        dedupe_key: row.try_get("dedupe_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Durable queue on the `scan_jobs` table.
#[derive(Clone)]
pub struct PostgresQueueService {
    pool: PgPool,
    retry: RetryPolicy,
}

impl fmt::Debug for PostgresQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueueService")
            .field("pool_size", &self.pool.size())
            .field("retry", &self.retry)
            .finish()
    }
}

impl PostgresQueueService {
    pub fn new(pool: PgPool, retry: RetryConfig) -> Self {
        Self {
            pool,
            retry: RetryPolicy::new(retry),
        }
    }
}

#[async_trait]
impl QueueService for PostgresQueueService {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let scan_id = request.payload.scan_id;
        let record = JobRecord::new(request.payload);

        let inserted = sqlx::query(
            r#"
            INSERT INTO scan_jobs (id, payload, state, attempts, available_at, dedupe_key,
                                   created_at, updated_at)
            VALUES ($1, $2, 'ready', 0, $3, $4, $5, $5)
            ON CONFLICT (dedupe_key) WHERE state IN ('ready', 'leased') DO NOTHING
            "#,
        )
        .bind(record.id.0)
        .bind(serde_json::to_value(&record.payload)?)
        .bind(record.available_at)
        .bind(&record.dedupe_key)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(JobHandle {
                job_id: record.id,
                scan_id,
                accepted: true,
            });
        }

        let existing: Uuid = sqlx::query_scalar(
            "SELECT id FROM scan_jobs WHERE dedupe_key = $1 AND state IN ('ready', 'leased')",
        )
        .bind(&record.dedupe_key)
        .fetch_one(&self.pool)
        .await?;
        debug!(job_id = %existing, %scan_id, "enqueue merged into active job");
        Ok(JobHandle {
            job_id: JobId(existing),
            scan_id,
            accepted: false,
        })
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM scan_jobs
            WHERE state = 'ready' AND available_at <= NOW()
            ORDER BY available_at, attempts, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;

        let lease_id = LeaseId::new();
        let expires_at: DateTime<Utc> = Utc::now() + request.lease_ttl;
        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'leased', lease_owner = $2, lease_id = $3, lease_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(&request.worker_id)
        .bind(lease_id.0)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        job.state = JobState::Leased;
        job.lease_owner = Some(request.worker_id.clone());
        job.lease_expires_at = Some(expires_at);
        Ok(Some(JobLease {
            lease_id,
            job,
            lease_owner: request.worker_id,
            expires_at,
        }))
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'completed', attempts = attempts + 1, lease_owner = NULL,
                lease_id = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE lease_id = $1
            "#,
        )
        .bind(lease_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("lease {}", lease_id.0)));
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<FailDisposition> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT id, attempts FROM scan_jobs WHERE lease_id = $1 FOR UPDATE")
            .bind(lease_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("lease {}", lease_id.0)))?;
        let job_id = JobId(row.try_get("id")?);
        let attempts = (row.try_get::<i32, _>("attempts")?.max(0) as u16).saturating_add(1);

        let (state, disposition, available_at) = if !retryable {
            (JobState::Failed, FailDisposition::Failed { attempts }, None)
        } else if attempts >= self.retry.max_attempts() {
            (JobState::DeadLetter, FailDisposition::Exhausted { attempts }, None)
        } else {
            let delay = self.retry.delay_for(job_id, attempts);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            (
                JobState::Ready,
                FailDisposition::Retrying { attempts, retry_at },
                Some(retry_at),
            )
        };

        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = $2, attempts = $3, last_error = $4,
                available_at = COALESCE($5, available_at),
                lease_owner = NULL, lease_id = NULL, lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .bind(state.as_str())
        .bind(i32::from(attempts))
        .bind(error)
        .bind(available_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if disposition.is_terminal() {
            warn!(job_id = %job_id, attempts, state = state.as_str(), "job finished unsuccessfully");
        }
        Ok(disposition)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scan_jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM scan_jobs WHERE id = $1")
                .bind(job_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn queue_depth(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_jobs WHERE state = 'ready'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl LeaseExpiryScanner for PostgresQueueService {
    async fn scan_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'ready', lease_owner = NULL, lease_id = NULL,
                lease_expires_at = NULL, available_at = NOW(), updated_at = NOW()
            WHERE state = 'leased' AND lease_expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
