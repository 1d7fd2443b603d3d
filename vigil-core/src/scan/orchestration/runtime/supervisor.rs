use std::{
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::scan::orchestration::{
    consumer::JobConsumer,
    lease::DequeueRequest,
    queue::{LeaseExpiryScanner, QueueService},
};

/// Supervises the consumer loops of one worker process.
///
/// Each loop owns a fixed slot, and the slot decides the chain port, so two
/// jobs in the same process never share a chain.
pub struct ScanWorkerRuntime {
    queue: Arc<dyn QueueService>,
    expiry: Option<Arc<dyn LeaseExpiryScanner>>,
    consumer: Arc<JobConsumer>,
    worker_group: String,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanWorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("ScanWorkerRuntime")
            .field("worker_group", &self.worker_group)
            .field("consumer", &self.consumer)
            .field("housekeeping", &self.expiry.is_some())
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ScanWorkerRuntime {
    pub fn new(queue: Arc<dyn QueueService>, consumer: Arc<JobConsumer>) -> Self {
        Self {
            queue,
            expiry: None,
            consumer,
            worker_group: format!("scan-{}", std::process::id()),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Periodically return expired leases to the ready set.
    pub fn with_lease_expiry(mut self, scanner: Arc<dyn LeaseExpiryScanner>) -> Self {
        self.expiry = Some(scanner);
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(&self) -> Result<()> {
        let parallelism = self.consumer.config().concurrency.max(1);
        tracing::info!(parallelism, group = %self.worker_group, "starting scan workers");

        let mut handles = self.worker_handles.lock().await;
        for slot in 0..parallelism {
            handles.push(self.spawn_worker(slot));
        }
        if let Some(handle) = self.spawn_housekeeper() {
            handles.push(handle);
        }
        Ok(())
    }

    fn spawn_worker(&self, slot: usize) -> JoinHandle<()> {
        let worker_id = format!("{}-w{}", self.worker_group, slot);
        let queue = Arc::clone(&self.queue);
        let consumer = Arc::clone(&self.consumer);
        let shutdown = self.shutdown_token.clone();
        let lease_ttl = consumer.config().lease_ttl();
        let idle = consumer.config().idle_poll();

        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    tracing::info!("Worker {} shutting down", worker_id);
                    break;
                }

                let dequeue = DequeueRequest {
                    worker_id: worker_id.clone(),
                    lease_ttl,
                };

                match queue.dequeue(dequeue).await {
                    Ok(Some(lease)) => {
                        let job_id = lease.job.id;
                        // In-flight pipelines finish even when shutdown fires mid-job.
                        match consumer.process_lease(lease, slot).await {
                            Ok(settlement) => {
                                tracing::debug!(worker = %worker_id, %job_id, ?settlement, "job settled");
                            }
                            Err(err) => {
                                tracing::error!(worker = %worker_id, %job_id, error = %err, "job processing failed; lease left to expire");
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                    Err(err) => {
                        tracing::warn!(worker = %worker_id, error = %err, "dequeue failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                }
            }
        })
    }

    fn spawn_housekeeper(&self) -> Option<JoinHandle<()>> {
        let scanner = self.expiry.clone()?;
        let interval = self.consumer.config().lease_scan_interval();
        let shutdown = self.shutdown_token.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match scanner.scan_expired_leases().await {
                            Ok(0) => {}
                            Ok(resurrected) => tracing::info!(resurrected, "expired leases returned to queue"),
                            Err(err) => tracing::warn!("housekeeper scan_expired_leases error: {err}"),
                        }
                    }
                }
            }
        }))
    }

    /// Stop taking new jobs and wait up to `drain` for in-flight ones. Loops
    /// still running after that are aborted; their leases expire and requeue.
    pub async fn shutdown(&self, drain: Duration) -> Result<()> {
        tracing::info!("Initiating graceful shutdown of scan worker runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(drain, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!("Worker task failed: {:?}", e);
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    drain_secs = drain.as_secs(),
                    "Worker tasks did not drain in time; aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        tracing::info!("Scan worker runtime shutdown complete");
        Ok(())
    }
}
