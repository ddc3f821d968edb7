//! Service-mesh relation selection and the payloads sent over it.

use serde::Serialize;

use crate::backend::Databag;
use crate::reconcile::ReconcileFailure;
use crate::relations::{Relation, RelationKind, RelationView};

pub const SDI_VERSIONS_KEY: &str = "_supported_versions";
pub const SDI_DATA_KEY: &str = "data";
pub const SDI_VERSION: &str = "v1";

/// The one mesh relation a pass works with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshRelation<'a> {
    Absent,
    Sidecar(&'a Relation),
    Ambient(&'a Relation),
}

impl<'a> MeshRelation<'a> {
    pub fn relation(&self) -> Option<&'a Relation> {
        match self {
            MeshRelation::Absent => None,
            MeshRelation::Sidecar(r) | MeshRelation::Ambient(r) => Some(r),
        }
    }
}

/// Pick the mesh relation. Sidecar and ambient relations exclude each other
/// whatever order they were added in.
pub fn select_mesh(view: &RelationView) -> Result<MeshRelation<'_>, ReconcileFailure> {
    let sidecar = view.first(RelationKind::SidecarMesh);
    let ambient = view.first(RelationKind::AmbientMesh);
    match (sidecar, ambient) {
        (Some(s), Some(a)) => Err(ReconcileFailure::Blocked(format!(
            "Cannot have both sidecar ({}) and ambient ({}) relations at the same time",
            s.endpoint, a.endpoint
        ))),
        (Some(s), None) => Ok(MeshRelation::Sidecar(s)),
        (None, Some(a)) => Ok(MeshRelation::Ambient(a)),
        (None, None) => Ok(MeshRelation::Absent),
    }
}

/// Check the remote side of a serialized-data-interface relation speaks v1.
pub fn sdi_negotiate(relation: &Relation) -> Result<(), ReconcileFailure> {
    let app = relation.remote_app.as_deref().unwrap_or("unknown");
    let Some(raw) = relation.remote_data.get(SDI_VERSIONS_KEY) else {
        return Err(ReconcileFailure::Waiting(format!(
            "List of {} versions not found for apps: {app}",
            relation.endpoint
        )));
    };
    let versions: Vec<String> = serde_yaml::from_str(raw).unwrap_or_default();
    if versions.iter().any(|v| v == SDI_VERSION) {
        Ok(())
    } else {
        Err(ReconcileFailure::Blocked(format!(
            "No compatible {} versions found for apps: {app}",
            relation.endpoint
        )))
    }
}

/// Databag carrying `data` under the v1 serialized-data-interface.
pub fn sdi_payload<T: Serialize>(data: &T) -> Result<Databag, serde_yaml::Error> {
    Ok(Databag::from([
        (
            SDI_VERSIONS_KEY.to_string(),
            serde_yaml::to_string(&[SDI_VERSION])?,
        ),
        (SDI_DATA_KEY.to_string(), serde_yaml::to_string(data)?),
    ]))
}

/// Read the `data` document a remote SDI provider published.
pub fn sdi_remote_data<T: serde::de::DeserializeOwned>(
    relation: &Relation,
) -> Result<Option<T>, ReconcileFailure> {
    sdi_negotiate(relation)?;
    let Some(raw) = relation.remote_data.get(SDI_DATA_KEY) else {
        return Ok(None);
    };
    serde_yaml::from_str(raw).map(Some).map_err(|e| {
        ReconcileFailure::Blocked(format!(
            "Invalid {} data from {}: {e}",
            relation.endpoint,
            relation.remote_app.as_deref().unwrap_or("unknown")
        ))
    })
}

/// Sidecar ingress request sent to the gateway charm.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct IngressRequest {
    pub prefix: String,
    pub rewrite: String,
    pub service: String,
    pub port: u16,
}

/// Ambient ingress route request.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct IngressRoute {
    pub model: String,
    pub name: String,
    pub port: u16,
    pub prefix: String,
}

impl IngressRoute {
    /// Each field JSON-encoded under its own key.
    pub fn to_databag(&self) -> Databag {
        let value = serde_json::to_value(self).unwrap_or_default();
        value
            .as_object()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
