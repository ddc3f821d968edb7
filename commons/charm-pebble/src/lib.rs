//! Pebble layers and the client used to supervise the workload process.

pub mod client;
pub mod layer;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::PebbleClient;
pub use layer::{Check, CheckInfo, CheckStatus, Layer, LogTarget, Service};
pub use supervisor::{LayerSync, PebbleError, ProcessSupervisor, sync_layer};
