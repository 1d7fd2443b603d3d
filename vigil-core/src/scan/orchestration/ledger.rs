//! Durable per-stage bookkeeping plus the matching progress notifications.

use std::{fmt, sync::Arc, time::Instant};

use serde_json::{Value, json};
use tracing::debug;

use crate::{
    error::{Result, ScanError},
    scan::model::{ScanStep, ScanStepRecord},
    types::ids::{ScanId, StepRecordId},
};

use super::{
    events::{ScanEvent, ScanEventPayload, ScanEventPublisher, notify},
    persistence::StepRecordRepository,
};

/// An open RUNNING record. Consumed when the stage closes so a record can
/// only be closed once.
#[derive(Debug)]
#[must_use = "an open step must be completed or failed"]
pub struct OpenStep {
    pub record_id: StepRecordId,
    pub scan_id: ScanId,
    pub step: ScanStep,
    started: Instant,
}

impl OpenStep {
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Clone)]
pub struct StepLedger {
    steps: Arc<dyn StepRecordRepository>,
    events: Arc<dyn ScanEventPublisher>,
}

impl fmt::Debug for StepLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepLedger").finish_non_exhaustive()
    }
}

impl StepLedger {
    pub fn new(
        steps: Arc<dyn StepRecordRepository>,
        events: Arc<dyn ScanEventPublisher>,
    ) -> Self {
        Self { steps, events }
    }

    pub async fn open(&self, scan_id: ScanId, step: ScanStep) -> Result<OpenStep> {
        let record = self.steps.start(scan_id, step).await?;
        debug!(%scan_id, %step, record = %record.id, "step opened");
        notify(
            self.events.as_ref(),
            ScanEvent::new(scan_id, ScanEventPayload::StepStarted { step }),
        )
        .await;
        Ok(OpenStep {
            record_id: record.id,
            scan_id,
            step,
            started: Instant::now(),
        })
    }

    pub async fn complete(&self, open: OpenStep, metadata: Value) -> Result<ScanStepRecord> {
        let metadata = with_duration(metadata, open.elapsed_ms());
        let record = self.steps.complete(open.record_id, metadata).await?;
        notify(
            self.events.as_ref(),
            ScanEvent::new(
                open.scan_id,
                ScanEventPayload::StepCompleted { step: open.step },
            ),
        )
        .await;
        Ok(record)
    }

    /// Close the record as FAILED. `fatal` only affects the notification;
    /// whether the pipeline aborts is the caller's decision.
    pub async fn fail(
        &self,
        open: OpenStep,
        error: &ScanError,
        fatal: bool,
        metadata: Value,
    ) -> Result<ScanStepRecord> {
        let code = error.code();
        let metadata = with_duration(metadata, open.elapsed_ms());
        let record = self
            .steps
            .fail(open.record_id, code, &error.to_string(), metadata)
            .await?;
        notify(
            self.events.as_ref(),
            ScanEvent::new(
                open.scan_id,
                ScanEventPayload::StepFailed {
                    step: open.step,
                    code,
                    fatal,
                },
            ),
        )
        .await;
        Ok(record)
    }
}

fn with_duration(metadata: Value, duration_ms: u64) -> Value {
    match metadata {
        Value::Object(mut map) => {
            map.insert("duration_ms".into(), json!(duration_ms));
            Value::Object(map)
        }
        Value::Null => json!({ "duration_ms": duration_ms }),
        other => json!({ "result": other, "duration_ms": duration_ms }),
    }
}
