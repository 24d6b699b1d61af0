//! Telemetry publish queue.
//!
//! Every open pipe republishes its Definition on a fixed interval so an
//! external observer can see what is actively forwarding. Delivery is
//! best-effort: the queue is bounded and a full or absent drain must
//! never block relay progress.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::rules::Definition;

/// Interval between telemetry snapshots for one open pipe.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

/// Handle pipes use to publish their active Definition.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<Definition>,
}

impl TelemetrySink {
    /// Create a sink with the given queue depth, returning the drain
    /// side for the external observability layer.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Definition>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Queue a snapshot without blocking; drops it if the queue is full
    /// or the drain is gone.
    pub fn publish(&self, definition: &Definition) {
        match self.tx.try_send(definition.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(rule = %definition.name, "telemetry queue full; snapshot dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(rule = %definition.name, "telemetry drain gone; snapshot dropped");
            }
        }
    }
}
