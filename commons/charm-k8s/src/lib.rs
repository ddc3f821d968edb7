//! Rendering and idempotent server-side apply of charm-owned Kubernetes
//! resources.

pub mod cluster;
pub mod handler;
pub mod render;
pub mod service_patch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{ClusterApi, ClusterError, KubeCluster};
pub use handler::{ApplyResult, HandlerError, KubernetesResourceHandler};
pub use render::{
    Context, ObjectId, ObjectKind, ResourceDocument, TemplateError,
    TemplateRenderer, TemplateSource,
};
pub use service_patch::{PortSpec, ServicePatch};
