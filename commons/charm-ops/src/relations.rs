use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::{BackendError, Databag, ModelBackend};

/// The role an endpoint plays for the reconciler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Sidecar service mesh (Istio with injected proxies).
    SidecarMesh,
    /// Ambient service mesh.
    AmbientMesh,
    MetricsEndpoint,
    GrafanaDashboard,
    /// Loki log forwarding.
    Logging,
    DashboardLinks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub kind: RelationKind,
}

impl Endpoint {
    pub const fn new(name: &'static str, kind: RelationKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub kind: RelationKind,
    pub endpoint: String,
    pub id: String,
    pub remote_app: Option<String>,
    /// Remote application databag; empty until the remote side wrote to it.
    pub remote_data: Databag,
    /// Databag of every remote unit that has joined, keyed by unit name.
    pub remote_units: BTreeMap<String, Databag>,
}

/// Every relation of the declared endpoints, read once per pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelationView {
    relations: Vec<Relation>,
}

impl RelationView {
    pub fn new(relations: Vec<Relation>) -> Self {
        Self { relations }
    }

    /// Read the relations of `endpoints`, leaving out `broken` (the relation
    /// being torn down in the current hook, which Juju still reports).
    pub async fn load<B: ModelBackend + ?Sized>(
        backend: &B,
        endpoints: &[Endpoint],
        broken: Option<&str>,
    ) -> Result<Self, BackendError> {
        let mut relations = Vec::new();
        for endpoint in endpoints {
            for id in backend.relation_ids(endpoint.name).await? {
                if Some(id.as_str()) == broken {
                    debug!(relation = %id, "skipping broken relation");
                    continue;
                }
                let remote_app = backend.remote_app(&id).await?;
                let remote_data = match &remote_app {
                    Some(app) => backend.relation_get(&id, app).await?,
                    None => Databag::new(),
                };
                let mut remote_units = BTreeMap::new();
                for unit in backend.remote_units(&id).await? {
                    let data = backend.unit_relation_get(&id, &unit).await?;
                    remote_units.insert(unit, data);
                }
                relations.push(Relation {
                    kind: endpoint.kind,
                    endpoint: endpoint.name.to_string(),
                    id,
                    remote_app,
                    remote_data,
                    remote_units,
                });
            }
        }
        Ok(Self { relations })
    }

    pub fn all(&self) -> &[Relation] {
        &self.relations
    }

    pub fn of_kind(&self, kind: RelationKind) -> impl Iterator<Item = &Relation> {
        self.relations.iter().filter(move |r| r.kind == kind)
    }

    pub fn first(&self, kind: RelationKind) -> Option<&Relation> {
        self.of_kind(kind).next()
    }

    pub fn has(&self, kind: RelationKind) -> bool {
        self.first(kind).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    const ENDPOINTS: [Endpoint; 2] = [
        Endpoint::new("ingress", RelationKind::SidecarMesh),
        Endpoint::new("istio-ingress-route", RelationKind::AmbientMesh),
    ];

    #[tokio::test]
    async fn load_reads_remote_databags() {
        let backend = FakeBackend::new();
        let id = backend.add_relation("ingress", "istio-pilot");
        backend.set_remote_data(&id, "_supported_versions", "- v1");

        let view = RelationView::load(&backend, &ENDPOINTS, None).await.unwrap();
        let rel = view.first(RelationKind::SidecarMesh).unwrap();
        assert_eq!(rel.remote_app.as_deref(), Some("istio-pilot"));
        assert_eq!(rel.remote_data["_supported_versions"], "- v1");
        assert!(!view.has(RelationKind::AmbientMesh));
    }

    #[tokio::test]
    async fn load_reads_unit_databags() {
        let backend = FakeBackend::new();
        let id = backend.add_relation("ingress", "istio-pilot");
        backend.add_remote_unit(&id, "istio-pilot/0");
        backend.set_remote_unit_data(&id, "istio-pilot/1", "ingress-address", "10.1.2.3");

        let view = RelationView::load(&backend, &ENDPOINTS, None).await.unwrap();
        let rel = view.first(RelationKind::SidecarMesh).unwrap();
        assert_eq!(
            rel.remote_units.keys().collect::<Vec<_>>(),
            vec!["istio-pilot/0", "istio-pilot/1"]
        );
        assert!(rel.remote_units["istio-pilot/0"].is_empty());
        assert_eq!(rel.remote_units["istio-pilot/1"]["ingress-address"], "10.1.2.3");
        assert!(rel.remote_data.is_empty());
    }

    #[tokio::test]
    async fn broken_relation_is_excluded() {
        let backend = FakeBackend::new();
        let id = backend.add_relation("istio-ingress-route", "istio-ingress");
        let view = RelationView::load(&backend, &ENDPOINTS, Some(&id)).await.unwrap();
        assert!(view.all().is_empty());
    }
}
