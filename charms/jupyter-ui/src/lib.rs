//! Operator for the Jupyter web app, the spawner UI users open from the
//! Kubeflow dashboard to create and manage notebooks.

use std::collections::BTreeMap;

use charm_k8s::{PortSpec, TemplateSource};
use charm_ops::mesh::{IngressRequest, IngressRoute, MeshRelation, sdi_negotiate, sdi_payload};
use charm_ops::observability::{ObservabilityError, SidebarItem, sidebar_data};
use charm_ops::{
    Databag, Endpoint, PassContext, ReconcileFailure, RelationKind, ResourceGroup,
    Workload, WorkloadFile,
};
use charm_pebble::layer::Startup;
use charm_pebble::{Check, Layer, Service};
use serde::Deserialize;
use tracing::debug;

pub const CONTAINER: &str = "jupyter-ui";
pub const HEALTH_CHECK: &str = "jupyter-ui-up";
pub const SPAWNER_CONFIG_PATH: &str = "/etc/config/spawner_ui_config.yaml";
pub const USERID_HEADER: &str = "kubeflow-userid";

const AUTH: &str = include_str!("../templates/auth_manifests.yaml.j2");
const SPAWNER_CONFIG: &str = include_str!("spawner_ui_config.yaml");

const BACKEND_MODES: [&str; 2] = ["production", "development"];

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct UiConfig {
    pub port: u16,
    pub url_prefix: String,
    pub secure_cookies: bool,
    pub backend_mode: String,
    pub ui: String,
    pub cluster_domain: String,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            url_prefix: "/jupyter".to_string(),
            secure_cookies: false,
            backend_mode: "production".to_string(),
            ui: "default".to_string(),
            cluster_domain: "cluster.local".to_string(),
        }
    }
}

impl UiConfig {
    /// Path the ingress routes to the app, always with a trailing slash.
    pub fn ingress_prefix(&self) -> String {
        format!("{}/", self.url_prefix.trim_end_matches('/'))
    }
}

#[derive(Clone, Debug, Default)]
pub struct JupyterUi;

impl Workload for JupyterUi {
    type Config = UiConfig;

    fn container(&self) -> &str {
        CONTAINER
    }

    fn charm_name(&self) -> &str {
        "jupyter-ui"
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![
            Endpoint::new("ingress", RelationKind::SidecarMesh),
            Endpoint::new("istio-ingress-route", RelationKind::AmbientMesh),
            Endpoint::new("dashboard-links", RelationKind::DashboardLinks),
            Endpoint::new("logging", RelationKind::Logging),
        ]
    }

    fn validate_config(&self, config: &UiConfig) -> Result<(), String> {
        if config.port == 0 {
            return Err("port must be positive".to_string());
        }
        if !config.url_prefix.starts_with('/') {
            return Err(format!(
                "url-prefix must start with '/', got {:?}",
                config.url_prefix
            ));
        }
        if !BACKEND_MODES.contains(&config.backend_mode.as_str()) {
            return Err(format!(
                "backend-mode must be one of {BACKEND_MODES:?}, got {:?}",
                config.backend_mode
            ));
        }
        Ok(())
    }

    fn resource_groups(&self) -> Vec<ResourceGroup> {
        vec![ResourceGroup::new(
            "auth",
            vec![TemplateSource::new("auth_manifests.yaml.j2", AUTH)],
        )]
    }

    fn check_relations(&self, pass: &PassContext<UiConfig>) -> Result<(), ReconcileFailure> {
        match pass.mesh()? {
            MeshRelation::Sidecar(rel) => sdi_negotiate(rel),
            MeshRelation::Ambient(_) | MeshRelation::Absent => Ok(()),
        }
    }

    fn service_ports(&self, config: &UiConfig) -> Vec<PortSpec> {
        vec![PortSpec::new("http", i32::from(config.port))]
    }

    fn files(&self, _pass: &PassContext<UiConfig>) -> Vec<WorkloadFile> {
        vec![WorkloadFile {
            path: SPAWNER_CONFIG_PATH.to_string(),
            content: SPAWNER_CONFIG.as_bytes().to_vec(),
            permissions: 0o644,
        }]
    }

    fn layer(&self, pass: &PassContext<UiConfig>) -> Result<Layer, ReconcileFailure> {
        let config = &pass.config;
        let environment = BTreeMap::from([
            ("APP_PREFIX".to_string(), config.url_prefix.clone()),
            ("APP_SECURE_COOKIES".to_string(), config.secure_cookies.to_string()),
            ("BACKEND_MODE".to_string(), config.backend_mode.clone()),
            ("CLUSTER_DOMAIN".to_string(), config.cluster_domain.clone()),
            ("UI".to_string(), config.ui.clone()),
            ("USERID_HEADER".to_string(), USERID_HEADER.to_string()),
            ("USERID_PREFIX".to_string(), String::new()),
        ]);

        let mut layer = Layer {
            summary: "jupyter-ui layer".to_string(),
            description: "Pebble config layer for jupyter-ui".to_string(),
            ..Default::default()
        };
        layer.services.insert(
            CONTAINER.to_string(),
            Service {
                summary: "Entrypoint of jupyter-ui image".to_string(),
                command: format!(
                    "gunicorn -w 3 --bind 0.0.0.0:{} --access-logfile - entrypoint:app",
                    config.port
                ),
                startup: Some(Startup::Enabled),
                environment,
                ..Default::default()
            },
        );
        layer
            .checks
            .insert(HEALTH_CHECK.to_string(), Check::tcp(config.port));
        Ok(layer)
    }

    fn health_check(&self) -> &str {
        HEALTH_CHECK
    }

    fn mesh_data(
        &self,
        pass: &PassContext<UiConfig>,
        mesh: &MeshRelation<'_>,
    ) -> Result<Option<Databag>, ReconcileFailure> {
        let config = &pass.config;
        match mesh {
            MeshRelation::Absent => {
                debug!("no ingress relation");
                Ok(None)
            }
            MeshRelation::Sidecar(_) => {
                let request = IngressRequest {
                    prefix: config.ingress_prefix(),
                    rewrite: "/".to_string(),
                    service: pass.app_name.clone(),
                    port: config.port,
                };
                sdi_payload(&request).map(Some).map_err(|e| {
                    ReconcileFailure::Blocked(format!("Failed to encode ingress data: {e}"))
                })
            }
            MeshRelation::Ambient(_) => Ok(Some(
                IngressRoute {
                    model: pass.model_name.clone(),
                    name: pass.app_name.clone(),
                    port: config.port,
                    prefix: config.ingress_prefix(),
                }
                .to_databag(),
            )),
        }
    }

    fn relation_data(
        &self,
        pass: &PassContext<UiConfig>,
    ) -> Result<Vec<(RelationKind, Databag)>, ObservabilityError> {
        let link = SidebarItem::item(
            1,
            "Notebooks",
            &pass.config.ingress_prefix(),
            "book",
        );
        Ok(vec![(RelationKind::DashboardLinks, sidebar_data(&[link])?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charm_ops::{HookEvent, Relation, RelationView};

    fn pass(config: UiConfig, relations: Vec<Relation>) -> PassContext<UiConfig> {
        PassContext {
            app_name: "jupyter-ui".into(),
            model_name: "kubeflow".into(),
            model_uuid: "0d6c2b1e-7f3a-4c5d-9e8f-a1b2c3d4e5f6".into(),
            event: HookEvent::ConfigChanged,
            config,
            relations: RelationView::new(relations),
        }
    }

    #[test]
    fn layer_sets_exactly_seven_variables() {
        let layer = JupyterUi.layer(&pass(UiConfig::default(), vec![])).unwrap();
        let service = &layer.services[CONTAINER];
        assert_eq!(
            service.command,
            "gunicorn -w 3 --bind 0.0.0.0:5000 --access-logfile - entrypoint:app"
        );
        assert_eq!(service.environment.len(), 7);
        assert_eq!(service.environment["APP_PREFIX"], "/jupyter");
        assert_eq!(service.environment["APP_SECURE_COOKIES"], "false");
        assert_eq!(service.environment["USERID_PREFIX"], "");
        assert_eq!(layer.checks[HEALTH_CHECK].tcp.as_ref().unwrap().port, 5000);
    }

    #[test]
    fn ingress_prefix_has_one_trailing_slash() {
        let mut config = UiConfig::default();
        assert_eq!(config.ingress_prefix(), "/jupyter/");
        config.url_prefix = "/notebooks/".into();
        assert_eq!(config.ingress_prefix(), "/notebooks/");
    }

    #[test]
    fn config_validation() {
        let ui = JupyterUi;
        assert!(ui.validate_config(&UiConfig::default()).is_ok());
        let bad_prefix = UiConfig {
            url_prefix: "jupyter".into(),
            ..Default::default()
        };
        assert!(ui.validate_config(&bad_prefix).is_err());
        let bad_mode = UiConfig {
            backend_mode: "debug".into(),
            ..Default::default()
        };
        assert!(ui.validate_config(&bad_mode).unwrap_err().contains("backend-mode"));
    }

    #[test]
    fn spawner_config_is_valid_yaml() {
        let doc: serde_yaml::Value = serde_yaml::from_str(SPAWNER_CONFIG).unwrap();
        assert!(doc.get("spawnerFormDefaults").is_some());
    }

    #[test]
    fn sidebar_links_to_the_prefix() {
        let data = JupyterUi
            .relation_data(&pass(UiConfig::default(), vec![]))
            .unwrap();
        let (kind, bag) = &data[0];
        assert_eq!(*kind, RelationKind::DashboardLinks);
        assert!(bag["config"].contains(r#""link":"/jupyter/""#));
    }
}
