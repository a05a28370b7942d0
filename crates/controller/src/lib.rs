//! Reflex controller: a reflector feeding a deduplicating work queue drained
//! by a pool of workers that call user reconcile logic, with rate-limited
//! retries and a bounded retry budget per key.

#![forbid(unsafe_code)]

mod config;
mod controller;
mod error;
mod reconcile;
mod sink;
mod worker;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerState};
pub use error::{Error, ReconcileError, Result};
pub use reconcile::{Reconcile, ReconcileFn};
pub use sink::{ControllerEvent, EventSink, TracingSink};

pub use reflex_core::{ListOptions, ListWatcher, Object, ObjectKey};
pub use reflex_store::{Cache, ReflectorConfig, Store};
