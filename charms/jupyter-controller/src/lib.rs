//! Operator for the Kubeflow notebook controller.
//!
//! The controller watches `Notebook` objects and turns them into
//! StatefulSets, Services and Istio VirtualServices. This charm installs the
//! Notebook CRD and the controller's RBAC, runs `./manager` under Pebble and
//! points it at the Istio gateway advertised on the mesh relation.

use std::collections::BTreeMap;

use charm_k8s::TemplateSource;
use charm_ops::mesh::MeshRelation;
use charm_ops::observability::{
    ObservabilityError, ScrapeJob, grafana_dashboard_data, metrics_endpoint_data,
};
use charm_ops::{
    Databag, Endpoint, PassContext, ReconcileFailure, Relation, RelationKind,
    ResourceGroup, Workload,
};
use charm_pebble::layer::{CheckAction, Startup};
use charm_pebble::{Check, Layer, Service};
use serde::Deserialize;
use tracing::debug;

pub const CONTAINER: &str = "jupyter-controller";
pub const HEALTH_CHECK: &str = "jupyter-controller-up";
pub const HEALTH_URL: &str = "http://localhost:8081/healthz";
pub const METRICS_PORT: u16 = 8080;
pub const DEFAULT_GATEWAY: &str = "kubeflow-gateway";

const CRDS: &str = include_str!("../templates/crds.yaml.j2");
const AUTH: &str = include_str!("../templates/auth_manifests.yaml.j2");
const ALERT_RULES: [(&str, &str); 4] = [
    ("controller.rule", include_str!("prometheus_alert_rules/controller.rule")),
    ("host_resources.rules", include_str!("prometheus_alert_rules/host_resources.rules")),
    ("model_errors.rule", include_str!("prometheus_alert_rules/model_errors.rule")),
    ("unit_unavailable.rule", include_str!("prometheus_alert_rules/unit_unavailable.rule")),
];
const DASHBOARD: &str = include_str!("grafana_dashboards/jupyter-notebook-controller.json");

const GATEWAY_INFO: &str = "gateway-info";
const GATEWAY_METADATA: &str = "gateway-metadata";

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ControllerConfig {
    pub enable_culling: bool,
    /// Minutes a notebook may stay idle before it is culled.
    pub cull_idle_time: u32,
    /// Minutes between idleness checks.
    pub idleness_check_period: u32,
    pub cluster_domain: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_culling: false,
            cull_idle_time: 1440,
            idleness_check_period: 1,
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

/// Istio gateway the controller attaches notebook VirtualServices to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn gateway_from(
    relation: &Relation,
    namespace_key: &str,
) -> Result<Gateway, ReconcileFailure> {
    let data = &relation.remote_data;
    match (data.get(namespace_key), data.get("gateway_name")) {
        (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok(Gateway {
                namespace: namespace.clone(),
                name: name.clone(),
            })
        }
        _ => Err(ReconcileFailure::Waiting(format!(
            "Waiting for gateway data on the {} relation",
            relation.endpoint
        ))),
    }
}

/// Resolve the gateway from whichever mesh relation is present, falling back
/// to `kubeflow-gateway` in the charm's own model.
pub fn resolve_gateway(
    pass: &PassContext<ControllerConfig>,
) -> Result<Gateway, ReconcileFailure> {
    match pass.mesh()? {
        MeshRelation::Sidecar(rel) => gateway_from(rel, "gateway_namespace"),
        MeshRelation::Ambient(rel) => gateway_from(rel, "namespace"),
        MeshRelation::Absent => {
            debug!("no gateway relation, using the model gateway");
            Ok(Gateway {
                namespace: pass.model_name.clone(),
                name: DEFAULT_GATEWAY.to_string(),
            })
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct JupyterController;

impl Workload for JupyterController {
    type Config = ControllerConfig;

    fn container(&self) -> &str {
        CONTAINER
    }

    fn charm_name(&self) -> &str {
        "jupyter-controller"
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![
            Endpoint::new(GATEWAY_INFO, RelationKind::SidecarMesh),
            Endpoint::new(GATEWAY_METADATA, RelationKind::AmbientMesh),
            Endpoint::new("metrics-endpoint", RelationKind::MetricsEndpoint),
            Endpoint::new("grafana-dashboard", RelationKind::GrafanaDashboard),
            Endpoint::new("logging", RelationKind::Logging),
        ]
    }

    fn validate_config(&self, config: &ControllerConfig) -> Result<(), String> {
        if config.cull_idle_time == 0 {
            return Err("cull-idle-time must be positive".to_string());
        }
        if config.idleness_check_period == 0 {
            return Err("idleness-check-period must be positive".to_string());
        }
        if config.cluster_domain.trim().is_empty() {
            return Err("cluster-domain must not be empty".to_string());
        }
        Ok(())
    }

    fn resource_groups(&self) -> Vec<ResourceGroup> {
        vec![
            ResourceGroup::new("crds", vec![TemplateSource::new("crds.yaml.j2", CRDS)]),
            ResourceGroup::new(
                "auth",
                vec![TemplateSource::new("auth_manifests.yaml.j2", AUTH)],
            ),
        ]
    }

    fn check_relations(
        &self,
        pass: &PassContext<ControllerConfig>,
    ) -> Result<(), ReconcileFailure> {
        resolve_gateway(pass).map(|_| ())
    }

    fn layer(
        &self,
        pass: &PassContext<ControllerConfig>,
    ) -> Result<Layer, ReconcileFailure> {
        let gateway = resolve_gateway(pass)?;
        let config = &pass.config;
        let environment = BTreeMap::from([
            ("USE_ISTIO".to_string(), "true".to_string()),
            ("ISTIO_GATEWAY".to_string(), gateway.to_string()),
            ("ISTIO_HOST".to_string(), "*".to_string()),
            ("CLUSTER_DOMAIN".to_string(), config.cluster_domain.clone()),
            ("ENABLE_CULLING".to_string(), config.enable_culling.to_string()),
            ("CULL_IDLE_TIME".to_string(), config.cull_idle_time.to_string()),
            (
                "IDLENESS_CHECK_PERIOD".to_string(),
                config.idleness_check_period.to_string(),
            ),
        ]);

        let mut layer = Layer {
            summary: "jupyter-controller layer".to_string(),
            description: "Pebble config layer for jupyter-controller".to_string(),
            ..Default::default()
        };
        layer.services.insert(
            CONTAINER.to_string(),
            Service {
                summary: "Entrypoint of jupyter-controller image".to_string(),
                command: "./manager".to_string(),
                startup: Some(Startup::Enabled),
                environment,
                on_check_failure: BTreeMap::from([(
                    HEALTH_CHECK.to_string(),
                    CheckAction::Restart,
                )]),
                ..Default::default()
            },
        );
        layer
            .checks
            .insert(HEALTH_CHECK.to_string(), Check::http(HEALTH_URL));
        Ok(layer)
    }

    fn health_check(&self) -> &str {
        HEALTH_CHECK
    }

    fn relation_data(
        &self,
        pass: &PassContext<ControllerConfig>,
    ) -> Result<Vec<(RelationKind, Databag)>, ObservabilityError> {
        let topology = pass.topology(self.charm_name());
        Ok(vec![
            (
                RelationKind::MetricsEndpoint,
                metrics_endpoint_data(
                    &topology,
                    &[ScrapeJob::all_units("/metrics", METRICS_PORT)],
                    &ALERT_RULES,
                )?,
            ),
            (
                RelationKind::GrafanaDashboard,
                grafana_dashboard_data(
                    &topology,
                    &[("jupyter-notebook-controller.json", DASHBOARD)],
                )?,
            ),
        ])
    }
}
