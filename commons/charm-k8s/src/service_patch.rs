use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{info, instrument};

use crate::cluster::ClusterApi;
use crate::handler::HandlerError;
use crate::render::{InvalidDocument, ObjectId, ResourceDocument, TemplateError};

/// One port the application service should expose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
            target_port: port,
        }
    }
}

/// Overrides the ports of the Service Juju creates for the application.
#[derive(Clone, Debug)]
pub struct ServicePatch {
    app_name: String,
    namespace: String,
    ports: Vec<PortSpec>,
}

impl ServicePatch {
    pub fn new(
        app_name: impl Into<String>,
        namespace: impl Into<String>,
        ports: Vec<PortSpec>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            namespace: namespace.into(),
            ports,
        }
    }

    pub fn service(&self) -> Service {
        let selector =
            BTreeMap::from([("app.kubernetes.io/name".to_string(), self.app_name.clone())]);
        Service {
            metadata: ObjectMeta {
                name: Some(self.app_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(selector),
                ports: Some(
                    self.ports
                        .iter()
                        .map(|p| ServicePort {
                            name: Some(p.name.clone()),
                            port: p.port,
                            target_port: Some(IntOrString::Int(p.target_port)),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn document(&self) -> Result<ResourceDocument, InvalidDocument> {
        let value = serde_json::to_value(self.service())
            .map_err(|_| InvalidDocument("service"))?;
        ResourceDocument::from_value(value)
    }

    /// Merge-patch the Juju-created service. A merge patch replaces
    /// `spec.ports` whole, so the placeholder port Juju added is dropped;
    /// server-side apply would keep it, as ports are merged per
    /// `port`/`protocol` key.
    #[instrument(skip_all, fields(service = %self.app_name))]
    pub async fn apply<C: ClusterApi + ?Sized>(
        &self,
        cluster: &C,
        field_manager: &str,
    ) -> Result<ObjectId, HandlerError> {
        let doc = self.document().map_err(|source| {
            HandlerError::Template(TemplateError::Invalid {
                template: "service-patch".to_string(),
                index: 0,
                source,
            })
        })?;
        let object = doc.id().clone();
        cluster
            .merge_patch(&object, doc.manifest(), field_manager)
            .await
            .map_err(|source| HandlerError::Apply {
                object: object.clone(),
                source,
            })?;
        info!(%object, ports = self.ports.len(), "service patched");
        Ok(object)
    }
}
