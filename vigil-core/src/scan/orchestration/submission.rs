use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Result, ScanError},
    scan::model::{ContractTarget, RepositoryRef, Scan},
    types::ids::{ProtocolId, ScanId},
};

use super::{
    job::{EnqueueRequest, JobHandle, JobId, ScanJob},
    persistence::ScanRepository,
    queue::QueueService,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanRequest {
    pub protocol_id: ProtocolId,
    pub repository: RepositoryRef,
    #[serde(default)]
    pub contract: ContractTarget,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmittedScan {
    pub scan: Scan,
    pub job: JobHandle,
}

/// Entry point for new audits: persists a QUEUED scan and enqueues its job.
pub struct ScanSubmitter {
    scans: Arc<dyn ScanRepository>,
    queue: Arc<dyn QueueService>,
}

impl fmt::Debug for ScanSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSubmitter").finish_non_exhaustive()
    }
}

impl ScanSubmitter {
    pub fn new(scans: Arc<dyn ScanRepository>, queue: Arc<dyn QueueService>) -> Self {
        Self { scans, queue }
    }

    pub async fn submit(&self, request: ScanRequest) -> Result<SubmittedScan> {
        let scan = self
            .scans
            .create(Scan::new(request.protocol_id, request.repository))
            .await?;
        let job = self.enqueue(&scan, request.contract).await?;
        info!(scan_id = %scan.id, job_id = %job.job_id, "scan submitted");
        Ok(SubmittedScan { scan, job })
    }

    /// Enqueue an existing, still QUEUED scan. Merges into the active job
    /// when one is already queued or running for it.
    pub async fn resubmit(&self, scan_id: ScanId, contract: ContractTarget) -> Result<JobHandle> {
        let scan = self
            .scans
            .get(scan_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan {scan_id}")))?;
        if scan.state.is_terminal() {
            return Err(ScanError::Queue(format!(
                "scan {scan_id} is already {}",
                scan.state
            )));
        }
        self.enqueue(&scan, contract).await
    }

    /// Request cancellation. Takes effect before the pipeline's first stage.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.queue.cancel_job(job_id).await
    }

    async fn enqueue(&self, scan: &Scan, contract: ContractTarget) -> Result<JobHandle> {
        let mut job = ScanJob::new(scan.id, scan.protocol_id, scan.repository.clone());
        job.contract = contract;
        self.queue.enqueue(EnqueueRequest::new(job)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::model::ScanState;
    use crate::scan::orchestration::persistence::InMemoryStore;
    use crate::scan::orchestration::queue::InMemoryQueueService;

    fn request() -> ScanRequest {
        ScanRequest {
            protocol_id: ProtocolId::new(),
            repository: RepositoryRef::new("https://example.com/lending.git").with_branch("main"),
            contract: ContractTarget::default(),
        }
    }

    #[tokio::test]
    async fn submit_creates_queued_scan_and_job() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueueService::default());
        let submitter = ScanSubmitter::new(store.clone(), queue.clone());

        let submitted = submitter.submit(request()).await.unwrap();
        assert_eq!(submitted.scan.state, ScanState::Queued);
        assert!(submitted.job.accepted);
        assert_eq!(queue.queue_depth().await.unwrap(), 1);
        assert!(store.get(submitted.scan.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resubmitting_an_active_scan_merges() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueueService::default());
        let submitter = ScanSubmitter::new(store, queue.clone());

        let submitted = submitter.submit(request()).await.unwrap();
        let again = submitter
            .resubmit(submitted.scan.id, ContractTarget::default())
            .await
            .unwrap();
        assert!(!again.accepted);
        assert_eq!(again.job_id, submitted.job.job_id);
        assert_eq!(queue.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resubmitting_unknown_scan_fails() {
        let submitter = ScanSubmitter::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryQueueService::default()),
        );
        let err = submitter
            .resubmit(ScanId::new(), ContractTarget::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }
}
