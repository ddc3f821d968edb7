//! Event dispatch and the reconciliation loop shared by the charms.

pub mod backend;
pub mod config;
pub mod event;
pub mod mesh;
pub mod observability;
pub mod reconcile;
pub mod relations;
pub mod runtime;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{BackendError, Databag, HookTools, ModelBackend};
pub use event::{HookEvent, RelationEventKind};
pub use reconcile::{
    PassContext, ReconcileError, ReconcileFailure, Reconciler, ResourceGroup,
    Workload, WorkloadFile,
};
pub use relations::{Endpoint, Relation, RelationKind, RelationView};
pub use status::{ReconcileState, StatusKind, StatusProjector, UnitStatus};

use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str) {
    let filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy()
        .add_directive(
            default_env
                .parse()
                .unwrap_or_else(|_| LevelFilter::INFO.into()),
        );

    // Juju captures stderr into the unit log.
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
