use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::render::{ObjectId, ObjectKind, ResourceDocument};

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("unknown resource kind {0}")]
    UnknownKind(ObjectKind),

    #[error("kube client error: {0}")]
    Client(String),
}

impl ClusterError {
    /// HTTP-like status code reported by the API server, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClusterError::Conflict { .. } => Some(409),
            ClusterError::NotFound { .. } => Some(404),
            ClusterError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            409 => ClusterError::Conflict { message },
            404 => ClusterError::NotFound { message },
            code => ClusterError::Api { code, message },
        }
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => {
                ClusterError::from_status(resp.code, resp.message)
            }
            other => ClusterError::Client(other.to_string()),
        }
    }
}

/// The cluster operations the resource handler relies on.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply `doc` as `field_manager`, optionally forcing
    /// ownership of conflicting fields.
    async fn apply(
        &self,
        doc: &ResourceDocument,
        field_manager: &str,
        force: bool,
    ) -> Result<(), ClusterError>;

    /// JSON merge patch of an existing object. Lists in `patch` replace the
    /// stored lists whole, whoever owned their entries.
    async fn merge_patch(
        &self,
        id: &ObjectId,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), ClusterError>;

    async fn delete(&self, id: &ObjectId) -> Result<(), ClusterError>;

    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ObjectId>, ClusterError>;
}

/// [`ClusterApi`] backed by a live API server.
///
/// Kinds are resolved through discovery on first use and cached for the
/// lifetime of the instance. Namespaced objects that do not name a
/// namespace land in `default_namespace` (the Juju model).
pub struct KubeCluster {
    client: Client,
    default_namespace: String,
    resources: Mutex<HashMap<ObjectKind, (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
            resources: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(
        &self,
        kind: &ObjectKind,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let mut cache = self.resources.lock().await;
        if let Some(found) = cache.get(kind) {
            return Ok(found.clone());
        }
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let found = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|err| match err {
                kube::Error::Api(resp) if resp.code == 404 => {
                    ClusterError::UnknownKind(kind.clone())
                }
                other => ClusterError::from(other),
            })?;
        debug!(%kind, plural = %found.0.plural, "discovered resource kind");
        cache.insert(kind.clone(), found.clone());
        Ok(found)
    }

    async fn api_for(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, caps) = self.resolve(kind).await?;
        Ok(match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or(&self.default_namespace),
                &ar,
            ),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn apply(
        &self,
        doc: &ResourceDocument,
        field_manager: &str,
        force: bool,
    ) -> Result<(), ClusterError> {
        let id = doc.id();
        let api = self.api_for(&id.kind, id.namespace.as_deref()).await?;
        let mut params = PatchParams::apply(field_manager);
        if force {
            params = params.force();
        }
        trace!(object = %id, force, "server-side apply");
        api.patch(&id.name, &params, &Patch::Apply(doc.manifest()))
            .await?;
        Ok(())
    }

    async fn merge_patch(
        &self,
        id: &ObjectId,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<(), ClusterError> {
        let api = self.api_for(&id.kind, id.namespace.as_deref()).await?;
        let params = PatchParams {
            field_manager: Some(field_manager.to_string()),
            ..Default::default()
        };
        trace!(object = %id, "merge patch");
        api.patch(&id.name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClusterError> {
        let api = self.api_for(&id.kind, id.namespace.as_deref()).await?;
        api.delete(&id.name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ObjectId>, ClusterError> {
        let api = self.api_for(kind, namespace).await?;
        let objects = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(objects
            .into_iter()
            .map(|obj| ObjectId {
                kind: kind.clone(),
                namespace: obj.namespace(),
                name: obj.name_any(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_variants() {
        assert!(matches!(
            ClusterError::from_status(409, "x"),
            ClusterError::Conflict { .. }
        ));
        assert!(matches!(
            ClusterError::from_status(404, "x"),
            ClusterError::NotFound { .. }
        ));
        let err = ClusterError::from_status(422, "bad");
        assert_eq!(err.code(), Some(422));
        assert_eq!(err.to_string(), "api error (422): bad");
        assert_eq!(ClusterError::Client("x".into()).code(), None);
    }
}
