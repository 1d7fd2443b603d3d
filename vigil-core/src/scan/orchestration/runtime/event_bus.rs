use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;

use crate::scan::orchestration::events::{ScanEvent, ScanEventPublisher};

/// Lightweight in-process event bus that fans out scan notifications to
/// observers (websocket bridge, CLI tail, tests). Lagging or absent
/// subscribers never block the publisher.
pub struct InProcScanEventBus {
    sender: broadcast::Sender<ScanEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcScanEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcScanEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcScanEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcScanEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl ScanEventPublisher for InProcScanEventBus {
    async fn publish_scan_event(&self, event: ScanEvent) -> Result<()> {
        // No receivers is not an error for fire-and-forget progress.
        let _ = self.sender.send(event);
        Ok(())
    }
}
