use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::layer::{CheckInfo, Layer};

#[derive(thiserror::Error, Debug)]
pub enum PebbleError {
    #[error("cannot connect to pebble: {0}")]
    Connect(String),

    #[error("pebble returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("change {id} failed: {message}")]
    Change { id: String, message: String },

    #[error("malformed pebble response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("malformed layer: {0}")]
    Layer(#[from] serde_yaml::Error),

    #[error("invalid request: {0}")]
    Request(String),
}

/// Process supervision inside the workload container.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn can_connect(&self) -> bool;

    /// The combined plan of every layer added so far.
    async fn plan(&self) -> Result<Layer, PebbleError>;

    async fn add_layer(
        &self,
        label: &str,
        layer: &Layer,
        combine: bool,
    ) -> Result<(), PebbleError>;

    /// Restart services whose definition changed and start missing ones.
    async fn replan(&self) -> Result<(), PebbleError>;

    async fn checks(&self, names: &[&str]) -> Result<Vec<CheckInfo>, PebbleError>;

    async fn push(
        &self,
        path: &str,
        content: &[u8],
        permissions: u32,
    ) -> Result<(), PebbleError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerSync {
    Unchanged,
    Replanned { changed: Vec<String> },
}

/// Add `layer` under `label` and replan, unless the current plan already
/// runs the same definitions.
#[instrument(skip_all, fields(label = %label))]
pub async fn sync_layer<P: ProcessSupervisor + ?Sized>(
    supervisor: &P,
    label: &str,
    layer: &Layer,
) -> Result<LayerSync, PebbleError> {
    let plan = supervisor.plan().await?;
    let changed = layer.changes_against(&plan);
    if changed.is_empty() {
        debug!("plan already up to date");
        return Ok(LayerSync::Unchanged);
    }
    info!(?changed, "updating pebble layer");
    supervisor.add_layer(label, layer, true).await?;
    supervisor.replan().await?;
    Ok(LayerSync::Replanned { changed })
}
