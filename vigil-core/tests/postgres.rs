//! Durable queue and repository tests. They need a reachable PostgreSQL via
//! `DATABASE_URL`; run with `cargo test -- --ignored`.
#![cfg(feature = "postgres")]

use serde_json::json;
use sqlx::{PgPool, Row};
use vigil_core::error::ErrorCode;
use vigil_core::scan::model::{
    Agent, AgentStatus, Finding, FindingLocation, FindingSource, Proof, ProofStatus,
    RepositoryRef, Scan, ScanState, ScanStep, Severity, StepStatus,
};
use vigil_core::scan::orchestration::{
    config::RetryConfig,
    job::{EnqueueRequest, ScanJob},
    lease::{DequeueRequest, FailDisposition},
    persistence::{
        AgentPool, FindingRepository, PostgresQueueService, PostgresStore, ProofRepository,
        ScanRepository, StepRecordRepository,
    },
    queue::{LeaseExpiryScanner, QueueService},
};
use vigil_core::types::ids::{FindingId, ProofId, ProtocolId, ScanId};

fn retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        backoff_base_ms: 0,
        ..RetryConfig::default()
    }
}

fn dequeue(worker: &str) -> DequeueRequest {
    DequeueRequest {
        worker_id: worker.to_string(),
        lease_ttl: chrono::Duration::seconds(30),
    }
}

async fn seed_scan(store: &PostgresStore) -> Scan {
    store
        .create(Scan::new(
            ProtocolId::new(),
            RepositoryRef::new("https://example.com/vault.git"),
        ))
        .await
        .expect("create scan")
}

fn job_for(scan: &Scan) -> EnqueueRequest {
    EnqueueRequest::new(ScanJob::new(
        scan.id,
        scan.protocol_id,
        scan.repository.clone(),
    ))
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn enqueue_dedupes_active_jobs(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let queue = PostgresQueueService::new(pool.clone(), retry());
    let scan = seed_scan(&store).await;

    let first = queue.enqueue(job_for(&scan)).await.expect("enqueue");
    let second = queue.enqueue(job_for(&scan)).await.expect("enqueue again");
    assert!(first.accepted);
    assert!(!second.accepted);
    assert_eq!(first.job_id, second.job_id);

    let row = sqlx::query("SELECT state FROM scan_jobs WHERE id = $1")
        .bind(first.job_id.0)
        .fetch_one(&pool)
        .await
        .expect("fetch job row");
    let state: String = row.get("state");
    assert_eq!(state, "ready");
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn leased_job_is_invisible_to_other_workers(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let queue = PostgresQueueService::new(pool, retry());
    let scan = seed_scan(&store).await;
    queue.enqueue(job_for(&scan)).await.unwrap();

    let lease = queue.dequeue(dequeue("w0")).await.unwrap().expect("lease");
    assert_eq!(lease.job.payload.scan_id, scan.id);
    assert!(queue.dequeue(dequeue("w1")).await.unwrap().is_none());

    queue.complete(lease.lease_id).await.unwrap();
    assert_eq!(queue.queue_depth().await.unwrap(), 0);
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn retryable_failures_stop_at_max_attempts(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let queue = PostgresQueueService::new(pool, retry());
    let scan = seed_scan(&store).await;
    queue.enqueue(job_for(&scan)).await.unwrap();

    let lease = queue.dequeue(dequeue("w0")).await.unwrap().unwrap();
    let first = queue
        .fail(lease.lease_id, true, Some("compile".into()))
        .await
        .unwrap();
    assert!(matches!(first, FailDisposition::Retrying { attempts: 1, .. }));

    let lease = queue.dequeue(dequeue("w0")).await.unwrap().expect("retried");
    let second = queue
        .fail(lease.lease_id, true, Some("compile".into()))
        .await
        .unwrap();
    assert_eq!(second, FailDisposition::Exhausted { attempts: 2 });
    assert!(queue.dequeue(dequeue("w0")).await.unwrap().is_none());
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn expired_leases_return_to_ready(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let queue = PostgresQueueService::new(pool.clone(), retry());
    let scan = seed_scan(&store).await;
    let handle = queue.enqueue(job_for(&scan)).await.unwrap();
    queue.dequeue(dequeue("w0")).await.unwrap().unwrap();

    sqlx::query("UPDATE scan_jobs SET lease_expires_at = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(handle.job_id.0)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(queue.scan_expired_leases().await.unwrap(), 1);
    assert!(queue.dequeue(dequeue("w1")).await.unwrap().is_some());
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn cancel_flag_is_visible_to_consumers(pool: PgPool) {
    let store = PostgresStore::new(pool.clone());
    let queue = PostgresQueueService::new(pool, retry());
    let scan = seed_scan(&store).await;
    let handle = queue.enqueue(job_for(&scan)).await.unwrap();

    assert!(!queue.is_cancelled(handle.job_id).await.unwrap());
    queue.cancel_job(handle.job_id).await.unwrap();
    assert!(queue.is_cancelled(handle.job_id).await.unwrap());
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn scan_lifecycle_and_step_ledger(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let scan = seed_scan(&store).await;

    let running = store.begin_attempt(scan.id, 1).await.unwrap();
    assert_eq!(running.state, ScanState::Running);
    assert!(running.started_at.is_some());

    assert!(store.advance_step(scan.id, ScanStep::Compile).await.unwrap());
    assert!(!store.advance_step(scan.id, ScanStep::Clone).await.unwrap());

    let record = StepRecordRepository::start(&store, scan.id, ScanStep::Compile)
        .await
        .unwrap();
    assert!(
        StepRecordRepository::start(&store, scan.id, ScanStep::Compile)
            .await
            .is_err()
    );
    let failed = store
        .fail(record.id, ErrorCode::CompileFailed, "solc exited 1", json!({}))
        .await
        .unwrap();
    assert_eq!(failed.status, StepStatus::Failed);

    store
        .mark_failed(scan.id, ErrorCode::CompileFailed, "solc exited 1")
        .await
        .unwrap();
    let scan = ScanRepository::get(&store, scan.id).await.unwrap().unwrap();
    assert_eq!(scan.state, ScanState::Failed);
    assert_eq!(scan.current_step, Some(ScanStep::Compile));
    assert_eq!(scan.error_code, Some(ErrorCode::CompileFailed));
    assert!(scan.completed_at.is_some());
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn agent_claim_is_conditional(pool: PgPool) {
    let store = PostgresStore::new(pool);
    store.register(Agent::idle("scanner-0", "scanner")).await.unwrap();
    assert_eq!(store.count_for_role("scanner").await.unwrap(), 1);

    let agent = store
        .find_available("scanner", &[AgentStatus::Idle])
        .await
        .unwrap()
        .expect("idle agent");
    let scan_id = ScanId::new();
    assert!(store.try_claim(agent.id, scan_id).await.unwrap());
    assert!(!store.try_claim(agent.id, ScanId::new()).await.unwrap());

    store.release(agent.id).await.unwrap();
    assert!(
        store
            .find_available("scanner", &[AgentStatus::Idle])
            .await
            .unwrap()
            .is_some()
    );
}

fn finding(kind: &str) -> Finding {
    Finding {
        id: FindingId::new(),
        kind: kind.to_string(),
        severity: Severity::High,
        location: FindingLocation::default(),
        description: kind.to_string(),
        confidence: 0.8,
        ai_confidence: None,
        remediation: None,
        source: FindingSource::Static,
    }
}

fn proof_for(scan: &Scan, finding: &Finding) -> Proof {
    Proof {
        id: ProofId::new(),
        scan_id: scan.id,
        finding_id: finding.id,
        payload: json!({ "steps": [] }),
        signature: None,
        status: ProofStatus::Generated,
        created_at: chrono::Utc::now(),
    }
}

#[sqlx::test(migrator = "vigil_core::MIGRATOR")]
#[ignore = "requires DATABASE_URL"]
async fn retried_attempt_replaces_unsubmitted_results(pool: PgPool) {
    let store = PostgresStore::new(pool);
    let scan = seed_scan(&store).await;
    let stale = finding("reentrancy");
    let shipped = finding("overflow");
    store
        .replace_for_scan(scan.id, &[stale.clone(), shipped.clone()])
        .await
        .unwrap();
    store.insert(proof_for(&scan, &stale)).await.unwrap();
    let sent = proof_for(&scan, &shipped);
    store.insert(sent.clone()).await.unwrap();
    assert_eq!(store.mark_submitted(scan.id, &[sent.id]).await.unwrap(), 1);

    let fresh = finding("access-control");
    store.replace_for_scan(scan.id, &[fresh.clone()]).await.unwrap();

    let mut kept: Vec<FindingId> = FindingRepository::list_for_scan(&store, scan.id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect();
    kept.sort();
    let mut expected = vec![shipped.id, fresh.id];
    expected.sort();
    assert_eq!(kept, expected);

    let proofs = ProofRepository::list_for_scan(&store, scan.id).await.unwrap();
    assert_eq!(proofs.len(), 1);
    assert_eq!(proofs[0].id, sent.id);
    assert_eq!(proofs[0].status, ProofStatus::Submitted);
}
