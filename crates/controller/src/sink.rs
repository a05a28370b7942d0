use std::sync::Arc;
use std::time::Duration;

use reflex_core::ObjectKey;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::ReconcileError;

/// Outcomes reported by the controller, one per reconcile attempt plus
/// lifecycle milestones.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Synced { key: ObjectKey, elapsed: Duration },
    Retrying { key: ObjectKey, attempt: u32, delay: Duration, error: Arc<ReconcileError> },
    /// Retry budget exhausted (or the sync panicked); the key's history is cleared.
    GaveUp { key: ObjectKey, attempts: u32, error: Arc<ReconcileError> },
    CacheSynced,
    ShutdownComplete,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ControllerEvent);
}

/// Default sink: one log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::Synced { key, elapsed } => {
                info!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "synced")
            }
            ControllerEvent::Retrying { key, attempt, delay, error } => {
                warn!(key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %error, "sync failed; retrying")
            }
            ControllerEvent::GaveUp { key, attempts, error } => {
                error!(key = %key, attempts, error = %error, "dropping key out of the queue")
            }
            ControllerEvent::CacheSynced => info!("cache synced; workers starting"),
            ControllerEvent::ShutdownComplete => info!("controller stopped"),
        }
    }
}

impl EventSink for mpsc::UnboundedSender<ControllerEvent> {
    fn emit(&self, event: ControllerEvent) { let _ = self.send(event); }
}
