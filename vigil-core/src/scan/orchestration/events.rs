use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{ErrorCode, Result},
    scan::model::ScanStep,
    types::ids::{AgentId, ScanId},
};

/// Metadata envelope attached to every scan event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub scan_id: ScanId,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(scan_id: ScanId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            scan_id,
            emitted_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Progress notifications announced while a scan moves through the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEventPayload {
    /// Admission is still waiting for a free agent.
    WaitingForCapacity { remaining_secs: u64 },
    Started { agent_id: AgentId, attempt: u32 },
    StepStarted { step: ScanStep },
    StepCompleted { step: ScanStep },
    StepFailed {
        step: ScanStep,
        code: ErrorCode,
        fatal: bool,
    },
    Progress { step: ScanStep, percent: u8, message: String },
    Log { level: LogLevel, message: String },
    /// Failed attempt that the queue will run again.
    RetryScheduled {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Completed { findings_count: u32, proofs_count: u32 },
    Failed { code: ErrorCode, message: String },
    Cancelled,
}

/// Fully qualified scan event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanEvent {
    pub meta: EventMeta,
    pub payload: ScanEventPayload,
}

impl ScanEvent {
    pub fn new(scan_id: ScanId, payload: ScanEventPayload) -> Self {
        Self {
            meta: EventMeta::new(scan_id),
            payload,
        }
    }

    pub fn log(scan_id: ScanId, level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(
            scan_id,
            ScanEventPayload::Log {
                level,
                message: message.into(),
            },
        )
    }
}

/// Sink for fire-and-forget progress notifications.
#[async_trait]
pub trait ScanEventPublisher: Send + Sync {
    async fn publish_scan_event(&self, event: ScanEvent) -> Result<()>;
}

/// Publish and swallow failures; notifications never steer the pipeline.
pub async fn notify(publisher: &dyn ScanEventPublisher, event: ScanEvent) {
    let scan_id = event.meta.scan_id;
    if let Err(err) = publisher.publish_scan_event(event).await {
        warn!(%scan_id, error = %err, "scan event publish failed");
    }
}

/// Publisher that drops everything. Useful for CLI one-shots.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopScanEventPublisher;

#[async_trait]
impl ScanEventPublisher for NoopScanEventPublisher {
    async fn publish_scan_event(&self, _event: ScanEvent) -> Result<()> {
        Ok(())
    }
}
