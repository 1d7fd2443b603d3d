//! Gate between a dequeued job and the pipeline: a job may only run once it
//! holds one agent from the bounded pool.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, ScanError},
    scan::model::{Agent, AgentStatus},
    types::ids::{ProtocolId, ScanId},
};

use super::{
    config::AdmissionConfig,
    events::{ScanEvent, ScanEventPayload, ScanEventPublisher, notify},
    persistence::AgentPool,
};

/// Claimed agent. Hand it back through [`AdmissionController::release`].
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub agent: Agent,
    pub scan_id: ScanId,
    pub acquired_at: DateTime<Utc>,
}

pub struct AdmissionController {
    agents: Arc<dyn AgentPool>,
    events: Arc<dyn ScanEventPublisher>,
    config: AdmissionConfig,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(
        agents: Arc<dyn AgentPool>,
        events: Arc<dyn ScanEventPublisher>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            agents,
            events,
            config,
        }
    }

    /// Wait for an agent until `deadline_secs` after `queued_at`.
    ///
    /// Time the job spent in the queue counts against the budget, so a job
    /// that was already queued past its deadline gets exactly one immediate
    /// attempt before failing with [`ScanError::CapacityTimeout`].
    pub async fn acquire_capacity(
        &self,
        scan_id: ScanId,
        protocol_id: ProtocolId,
        queued_at: DateTime<Utc>,
    ) -> Result<WorkerHandle> {
        let budget = self.config.deadline();
        let queued_for = (Utc::now() - queued_at).to_std().unwrap_or(Duration::ZERO);
        let remaining = budget.saturating_sub(queued_for);
        // Converted once so the wait is measured on the tokio clock.
        let deadline = Instant::now() + remaining;

        loop {
            if let Some(agent) = self.try_acquire(scan_id).await? {
                info!(%scan_id, %protocol_id, agent = %agent.id, "capacity acquired");
                return Ok(WorkerHandle {
                    agent,
                    scan_id,
                    acquired_at: Utc::now(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = queued_for + remaining;
                warn!(%scan_id, %protocol_id, ?waited, "no agent available before admission deadline");
                return Err(ScanError::CapacityTimeout { waited });
            }

            let left = deadline - now;
            debug!(%scan_id, remaining_secs = left.as_secs(), "waiting for capacity");
            notify(
                self.events.as_ref(),
                ScanEvent::new(
                    scan_id,
                    ScanEventPayload::WaitingForCapacity {
                        remaining_secs: left.as_secs(),
                    },
                ),
            )
            .await;
            sleep(self.config.poll_interval().min(left)).await;
        }
    }

    /// One poll tick: propose, claim, and re-propose when another consumer
    /// won the claim, up to `max_claim_races` times.
    async fn try_acquire(&self, scan_id: ScanId) -> Result<Option<Agent>> {
        for _ in 0..=self.config.max_claim_races {
            let Some(mut agent) = self
                .agents
                .find_available(&self.config.agent_role, &[AgentStatus::Idle])
                .await?
            else {
                return Ok(None);
            };

            if self.agents.try_claim(agent.id, scan_id).await? {
                agent.status = AgentStatus::Busy;
                agent.current_scan = Some(scan_id);
                return Ok(Some(agent));
            }
            debug!(%scan_id, agent = %agent.id, "lost agent claim race");
        }
        Ok(None)
    }

    pub async fn release(&self, handle: &WorkerHandle) -> Result<()> {
        self.agents.release(handle.agent.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::orchestration::runtime::InProcScanEventBus;
    use crate::scan::orchestration::persistence::InMemoryStore;

    fn config() -> AdmissionConfig {
        AdmissionConfig::default()
    }

    #[tokio::test]
    async fn claims_idle_agent_immediately() {
        let store = Arc::new(InMemoryStore::new().with_agents("scanner", 1).await);
        let controller =
            AdmissionController::new(store.clone(), Arc::new(InProcScanEventBus::default()), config());

        let scan_id = ScanId::new();
        let handle = controller
            .acquire_capacity(scan_id, ProtocolId::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(handle.agent.status, AgentStatus::Busy);

        let agents = store.agents().await;
        assert_eq!(agents[0].status, AgentStatus::Busy);
        assert_eq!(agents[0].current_scan, Some(scan_id));

        controller.release(&handle).await.unwrap();
        assert_eq!(store.agents().await[0].status, AgentStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_time_spent_queued() {
        let store = Arc::new(InMemoryStore::new().with_agents("scanner", 1).await);
        let bus = Arc::new(InProcScanEventBus::default());
        let mut events = bus.subscribe();
        let controller = AdmissionController::new(store.clone(), bus, config());

        // Occupy the only agent.
        let _holder = controller
            .acquire_capacity(ScanId::new(), ProtocolId::new(), Utc::now())
            .await
            .unwrap();

        let queued_at = Utc::now() - chrono::Duration::seconds(240);
        let started = Instant::now();
        let err = controller
            .acquire_capacity(ScanId::new(), ProtocolId::new(), queued_at)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::CapacityTimeout { .. }));
        assert!(!err.retryable());
        assert!(started.elapsed() <= Duration::from_secs(61));
        assert!(started.elapsed() >= Duration::from_secs(59));

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first.payload,
            ScanEventPayload::WaitingForCapacity { remaining_secs } if remaining_secs <= 60
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_budget_still_tries_once() {
        let store = Arc::new(InMemoryStore::new().with_agents("scanner", 1).await);
        let controller =
            AdmissionController::new(store, Arc::new(InProcScanEventBus::default()), config());
        let queued_at = Utc::now() - chrono::Duration::seconds(600);
        controller
            .acquire_capacity(ScanId::new(), ProtocolId::new(), queued_at)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn picks_up_agent_released_while_polling() {
        let store = Arc::new(InMemoryStore::new().with_agents("scanner", 1).await);
        let controller = Arc::new(AdmissionController::new(
            store.clone(),
            Arc::new(InProcScanEventBus::default()),
            config(),
        ));
        let holder = controller
            .acquire_capacity(ScanId::new(), ProtocolId::new(), Utc::now())
            .await
            .unwrap();

        let releaser = {
            let controller = controller.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(20)).await;
                controller.release(&holder).await.unwrap();
            })
        };

        let started = Instant::now();
        controller
            .acquire_capacity(ScanId::new(), ProtocolId::new(), Utc::now())
            .await
            .unwrap();
        // Picked up on the first poll tick after the release.
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        releaser.await.unwrap();
    }
}
