//! Turns one leased job into one pipeline attempt and settles the lease.
//!
//! The consumer is the single place that decides between "retry later" and
//! "fail for good", and it does so from [`ScanError::retryable`] alone.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    error::{ErrorCode, Result, ScanError},
    scan::model::AgentRun,
    types::ids::ScanId,
};

use super::{
    admission::{AdmissionController, WorkerHandle},
    config::ConsumerConfig,
    events::{ScanEvent, ScanEventPayload, ScanEventPublisher, notify},
    job::JobId,
    lease::{FailDisposition, JobLease},
    persistence::Repositories,
    pipeline::{PipelineContext, PipelineOrchestrator, PipelineOutcome},
    queue::QueueService,
};

/// What happened to a lease after [`JobConsumer::process_lease`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobSettlement {
    Succeeded { findings_count: u32 },
    /// Retryable failure; the queue will hand the job out again.
    RetryScheduled { code: ErrorCode, attempts: u16 },
    Failed { code: ErrorCode },
    Cancelled,
    /// The scan was already terminal when the lease arrived.
    Skipped,
}

impl JobSettlement {
    /// False only when the queue will run the job again.
    pub fn is_final(&self) -> bool {
        !matches!(self, JobSettlement::RetryScheduled { .. })
    }
}

pub struct JobConsumer {
    queue: Arc<dyn QueueService>,
    repos: Repositories,
    admission: AdmissionController,
    orchestrator: PipelineOrchestrator,
    events: Arc<dyn ScanEventPublisher>,
    config: ConsumerConfig,
}

impl fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConsumer")
            .field("admission", &self.admission)
            .field("orchestrator", &self.orchestrator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn QueueService>,
        repos: Repositories,
        admission: AdmissionController,
        orchestrator: PipelineOrchestrator,
        events: Arc<dyn ScanEventPublisher>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            repos,
            admission,
            orchestrator,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run one attempt for `lease` on consumer `slot` and settle the lease.
    pub async fn process_lease(&self, lease: JobLease, slot: usize) -> Result<JobSettlement> {
        let scan_id = lease.job.payload.scan_id;
        let attempt = lease.attempt();
        let span = info_span!("scan.job", %scan_id, job_id = %lease.job.id, attempt, slot);
        async move {
            let Some(scan) = self.repos.scans.get(scan_id).await? else {
                let err = ScanError::NotFound(format!("scan {scan_id}"));
                error!(%scan_id, "job references a missing scan");
                self.queue
                    .fail(lease.lease_id, false, Some(err.to_string()))
                    .await?;
                return Ok(JobSettlement::Failed { code: err.code() });
            };
            if scan.state.is_terminal() {
                info!(%scan_id, state = %scan.state, "scan already finished; dropping job");
                self.queue.complete(lease.lease_id).await?;
                return Ok(JobSettlement::Skipped);
            }

            self.repos.scans.begin_attempt(scan_id, attempt).await?;
            let abandoned = self
                .repos
                .steps
                .abandon_running(scan_id, &format!("superseded by attempt {attempt}"))
                .await?;
            if abandoned > 0 {
                warn!(%scan_id, abandoned, "closed step records left open by an earlier attempt");
            }

            let result = self.attempt(&lease, slot).await;
            self.settle(&lease, scan_id, result).await
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, lease: &JobLease, slot: usize) -> Result<PipelineOutcome> {
        let job = &lease.job.payload;
        if self.cancel_requested(lease.job.id).await {
            return Err(ScanError::Cancelled);
        }

        // A retry is re-queued at `available_at`; its admission budget starts there.
        let queued_at = job.enqueued_at.max(lease.job.available_at);
        let worker = self
            .admission
            .acquire_capacity(job.scan_id, job.protocol_id, queued_at)
            .await?;

        let mut run = AgentRun::start(worker.agent.id, job.scan_id);
        if let Err(err) = self.repos.agent_runs.start(&run).await {
            self.release(&worker).await;
            return Err(err);
        }
        notify(
            self.events.as_ref(),
            ScanEvent::new(
                job.scan_id,
                ScanEventPayload::Started {
                    agent_id: worker.agent.id,
                    attempt: lease.attempt(),
                },
            ),
        )
        .await;

        let cancel = CancellationToken::new();
        // Cancellation may have arrived while waiting for capacity.
        if self.cancel_requested(lease.job.id).await {
            cancel.cancel();
        }
        let ctx = PipelineContext {
            scan_id: job.scan_id,
            protocol_id: job.protocol_id,
            repository: job.repository.clone(),
            contract: job.contract.clone(),
            chain_port: self.config.chain_port_for_slot(slot),
            cancel,
        };
        let result = self.orchestrator.run(ctx).await;

        run.close(
            result
                .as_ref()
                .err()
                .map(|err| (err.code(), err.to_string())),
        );
        if let Err(err) = self.repos.agent_runs.close(&run).await {
            warn!(scan_id = %job.scan_id, run = %run.id, error = %err, "failed to close agent run");
        }
        self.release(&worker).await;
        result
    }

    async fn cancel_requested(&self, job_id: JobId) -> bool {
        match self.queue.is_cancelled(job_id).await {
            Ok(cancelled) => cancelled,
            Err(err) => {
                warn!(%job_id, error = %err, "cancellation flag lookup failed");
                false
            }
        }
    }

    async fn release(&self, worker: &WorkerHandle) {
        if let Err(err) = self.admission.release(worker).await {
            warn!(agent = %worker.agent.id, error = %err, "failed to release agent");
        }
    }

    async fn settle(
        &self,
        lease: &JobLease,
        scan_id: ScanId,
        result: Result<PipelineOutcome>,
    ) -> Result<JobSettlement> {
        let err = match result {
            Ok(outcome) => {
                self.queue.complete(lease.lease_id).await?;
                self.repos
                    .scans
                    .mark_succeeded(scan_id, outcome.findings_count)
                    .await?;
                self.announce(
                    scan_id,
                    ScanEventPayload::Completed {
                        findings_count: outcome.findings_count,
                        proofs_count: outcome.proofs_count,
                    },
                )
                .await;
                return Ok(JobSettlement::Succeeded {
                    findings_count: outcome.findings_count,
                });
            }
            Err(err) => err,
        };

        let code = err.code();
        let message = err.to_string();

        if matches!(err, ScanError::Cancelled) {
            self.queue
                .fail(lease.lease_id, false, Some(message))
                .await?;
            self.repos.scans.mark_cancelled(scan_id).await?;
            self.announce(scan_id, ScanEventPayload::Cancelled).await;
            return Ok(JobSettlement::Cancelled);
        }

        let disposition = self
            .queue
            .fail(lease.lease_id, err.retryable(), Some(message.clone()))
            .await?;
        match disposition {
            FailDisposition::Retrying { attempts, retry_at } => {
                info!(%scan_id, %code, attempts, %retry_at, "attempt failed; retry scheduled");
                self.announce(
                    scan_id,
                    ScanEventPayload::RetryScheduled {
                        attempt: u32::from(attempts) + 1,
                        retry_at,
                    },
                )
                .await;
                Ok(JobSettlement::RetryScheduled { code, attempts })
            }
            FailDisposition::Exhausted { attempts } | FailDisposition::Failed { attempts } => {
                debug!(%scan_id, %code, attempts, "failing scan");
                self.repos.scans.mark_failed(scan_id, code, &message).await?;
                self.announce(scan_id, ScanEventPayload::Failed { code, message })
                    .await;
                Ok(JobSettlement::Failed { code })
            }
        }
    }

    async fn announce(&self, scan_id: ScanId, payload: ScanEventPayload) {
        notify(self.events.as_ref(), ScanEvent::new(scan_id, payload)).await;
    }
}

