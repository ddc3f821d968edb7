use std::sync::Arc;

use charm_k8s::{
    ClusterApi, Context, HandlerError, KubernetesResourceHandler, PortSpec,
    ServicePatch, TemplateRenderer, TemplateSource,
};
use charm_pebble::{
    CheckStatus, Layer, LogTarget, PebbleError, ProcessSupervisor, sync_layer,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendError, Databag, ModelBackend};
use crate::event::HookEvent;
use crate::mesh::{MeshRelation, select_mesh};
use crate::observability::{JujuTopology, ObservabilityError, loki_endpoints};
use crate::relations::{Endpoint, RelationKind, RelationView};
use crate::status::{ReconcileState, StatusProjector};

pub const MSG_WAITING_LEADERSHIP: &str = "Waiting for leadership";
pub const MSG_POD_STARTUP: &str = "Pod startup is not complete";
pub const MSG_HEALTH_CHECK_FAILED: &str = "Workload failed health check";
pub const MSG_HEALTH_CHECK_INACTIVE: &str = "Waiting for workload health check to start";
pub const MSG_REMOVING: &str = "Removing k8s resources";
pub const MSG_REMOVED: &str = "K8S resources removed";

/// Why a pass stopped before reaching `Active`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileFailure {
    #[error("waiting: {0}")]
    Waiting(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("maintenance: {0}")]
    Maintenance(String),
}

impl From<ReconcileFailure> for ReconcileState {
    fn from(failure: ReconcileFailure) -> Self {
        match failure {
            ReconcileFailure::Waiting(msg) => ReconcileState::Waiting(msg),
            ReconcileFailure::Blocked(msg) => ReconcileState::Blocked(msg),
            ReconcileFailure::Maintenance(msg) => ReconcileState::Maintenance(msg),
        }
    }
}

impl From<HandlerError> for ReconcileFailure {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Conflict { object, .. } => {
                ReconcileFailure::Blocked(format!("resource conflict: {object}"))
            }
            HandlerError::Apply { object, .. } => {
                ReconcileFailure::Blocked(format!("resource creation failed: {object}"))
            }
            HandlerError::Template(e) => {
                ReconcileFailure::Blocked(format!("template error: {e}"))
            }
            other => ReconcileFailure::Blocked(other.to_string()),
        }
    }
}

fn replan_failure(err: PebbleError) -> ReconcileFailure {
    ReconcileFailure::Blocked(format!("Failed to replan: {err}"))
}

/// Failures that escape [`Reconciler::handle`].
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("failed to remove resources: {}", .failures.join("; "))]
    Cleanup { failures: Vec<String> },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Templates applied together under one handler scope.
#[derive(Clone, Debug)]
pub struct ResourceGroup {
    pub scope: &'static str,
    pub templates: Vec<TemplateSource>,
}

impl ResourceGroup {
    pub fn new(scope: &'static str, templates: Vec<TemplateSource>) -> Self {
        Self { scope, templates }
    }
}

/// A file pushed into the workload container before the layer is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadFile {
    pub path: String,
    pub content: Vec<u8>,
    pub permissions: u32,
}

/// Everything a pass has read from the model before mutating anything.
#[derive(Debug)]
pub struct PassContext<C> {
    pub app_name: String,
    pub model_name: String,
    pub model_uuid: String,
    pub event: HookEvent,
    pub config: C,
    pub relations: RelationView,
}

impl<C> PassContext<C> {
    pub fn mesh(&self) -> Result<MeshRelation<'_>, ReconcileFailure> {
        select_mesh(&self.relations)
    }

    pub fn topology(&self, charm_name: &str) -> JujuTopology {
        JujuTopology {
            model: self.model_name.clone(),
            model_uuid: self.model_uuid.clone(),
            application: self.app_name.clone(),
            charm_name: charm_name.to_string(),
        }
    }
}

/// The per-charm half of reconciliation. Every method is pure; the
/// [`Reconciler`] performs all I/O.
pub trait Workload: Send + Sync {
    type Config: DeserializeOwned + Default + Send + Sync;

    /// Workload container, also used as the Pebble service and layer name.
    fn container(&self) -> &str;

    fn charm_name(&self) -> &str;

    fn endpoints(&self) -> Vec<Endpoint>;

    fn validate_config(&self, _config: &Self::Config) -> Result<(), String> {
        Ok(())
    }

    fn resource_groups(&self) -> Vec<ResourceGroup>;

    /// Add charm-specific template keys to the base context
    /// (`app_name`, `namespace`).
    fn extend_context(&self, _config: &Self::Config, ctx: Context) -> Context {
        ctx
    }

    /// Relation checks that must pass before anything is applied.
    fn check_relations(
        &self,
        _pass: &PassContext<Self::Config>,
    ) -> Result<(), ReconcileFailure> {
        Ok(())
    }

    fn service_ports(&self, _config: &Self::Config) -> Vec<PortSpec> {
        Vec::new()
    }

    fn files(&self, _pass: &PassContext<Self::Config>) -> Vec<WorkloadFile> {
        Vec::new()
    }

    fn layer(&self, pass: &PassContext<Self::Config>) -> Result<Layer, ReconcileFailure>;

    /// Name of the Pebble check that decides workload health.
    fn health_check(&self) -> &str;

    /// Data to publish on the selected mesh relation, if any.
    fn mesh_data(
        &self,
        _pass: &PassContext<Self::Config>,
        _mesh: &MeshRelation<'_>,
    ) -> Result<Option<Databag>, ReconcileFailure> {
        Ok(None)
    }

    /// Application data for every relation of the given kind.
    fn relation_data(
        &self,
        _pass: &PassContext<Self::Config>,
    ) -> Result<Vec<(RelationKind, Databag)>, ObservabilityError> {
        Ok(Vec::new())
    }
}

pub struct Reconciler<W, B: ?Sized, P: ?Sized, C: ?Sized> {
    workload: W,
    app_name: String,
    model_name: String,
    model_uuid: String,
    backend: Arc<B>,
    pebble: Arc<P>,
    cluster: Arc<C>,
}

impl<W, B, P, C> Reconciler<W, B, P, C>
where
    W: Workload,
    B: ModelBackend + ?Sized,
    P: ProcessSupervisor + ?Sized,
    C: ClusterApi + ?Sized,
{
    pub fn new(
        workload: W,
        app_name: impl Into<String>,
        model_name: impl Into<String>,
        model_uuid: impl Into<String>,
        backend: Arc<B>,
        pebble: Arc<P>,
        cluster: Arc<C>,
    ) -> Self {
        Self {
            workload,
            app_name: app_name.into(),
            model_name: model_name.into(),
            model_uuid: model_uuid.into(),
            backend,
            pebble,
            cluster,
        }
    }

    pub fn workload(&self) -> &W {
        &self.workload
    }

    /// Run the hook and publish the resulting unit status. Returns `None`
    /// for hooks that need no work.
    #[instrument(skip_all, fields(event = %event, app = %self.app_name))]
    pub async fn handle(
        &self,
        event: &HookEvent,
    ) -> Result<Option<ReconcileState>, ReconcileError> {
        let state = match event {
            HookEvent::Remove => return self.remove().await.map(Some),
            event if event.is_ignored() => {
                debug!("nothing to do");
                return Ok(None);
            }
            HookEvent::UpdateStatus => {
                let state = self.reconcile(event).await;
                if state.is_active() {
                    self.check_health().await.map_or_else(Into::into, |()| state)
                } else {
                    state
                }
            }
            _ => self.reconcile(event).await,
        };
        StatusProjector::publish(&*self.backend, &state).await?;
        Ok(Some(state))
    }

    /// One full pass. The state is recomputed from scratch every time.
    pub async fn reconcile(&self, event: &HookEvent) -> ReconcileState {
        match self.run_pass(event).await {
            Ok(()) => {
                info!(app = %self.app_name, "reconcile complete");
                ReconcileState::Active
            }
            Err(failure) => {
                info!(app = %self.app_name, %failure, "reconcile stopped");
                failure.into()
            }
        }
    }

    async fn run_pass(&self, event: &HookEvent) -> Result<(), ReconcileFailure> {
        let leader = self.backend.is_leader().await.map_err(|e| {
            ReconcileFailure::Waiting(format!("Failed to check leadership: {e}"))
        })?;
        if !leader {
            return Err(ReconcileFailure::Waiting(MSG_WAITING_LEADERSHIP.to_string()));
        }
        if !self.pebble.can_connect().await {
            return Err(ReconcileFailure::Maintenance(MSG_POD_STARTUP.to_string()));
        }

        let config = self.load_config().await?;
        let relations = RelationView::load(
            &*self.backend,
            &self.workload.endpoints(),
            event.broken_relation(),
        )
        .await
        .map_err(|e| {
            ReconcileFailure::Waiting(format!("Failed to read relation data: {e}"))
        })?;
        let pass = PassContext {
            app_name: self.app_name.clone(),
            model_name: self.model_name.clone(),
            model_uuid: self.model_uuid.clone(),
            event: event.clone(),
            config,
            relations,
        };

        // Everything below the gates is derived before the first mutation.
        let mesh = pass.mesh()?;
        self.workload.check_relations(&pass)?;
        let mesh_data = self.workload.mesh_data(&pass, &mesh)?;
        let layer = self.build_layer(&pass)?;

        self.apply_resources(&pass.config, event.is_upgrade()).await?;
        self.patch_service(&pass.config).await?;
        self.sync_process_layer(&pass, &layer).await?;
        self.configure_mesh(&mesh, mesh_data).await?;
        self.publish_relation_data(&pass).await;
        Ok(())
    }

    async fn load_config(&self) -> Result<W::Config, ReconcileFailure> {
        let raw = self.backend.config().await.map_err(|e| {
            ReconcileFailure::Waiting(format!("Failed to read config: {e}"))
        })?;
        let config: W::Config = serde_json::from_value(Value::Object(raw))
            .map_err(|e| ReconcileFailure::Blocked(format!("Invalid config: {e}")))?;
        self.workload
            .validate_config(&config)
            .map_err(|msg| ReconcileFailure::Blocked(format!("Invalid config: {msg}")))?;
        Ok(config)
    }

    fn context(&self, config: &W::Config) -> Context {
        let base = Context::new()
            .with("app_name", self.app_name.as_str())
            .with("namespace", self.model_name.as_str());
        self.workload.extend_context(config, base)
    }

    fn handler(
        &self,
        group: ResourceGroup,
        ctx: Context,
    ) -> KubernetesResourceHandler<C> {
        KubernetesResourceHandler::new(
            self.app_name.as_str(),
            group.scope,
            &self.model_name,
            TemplateRenderer::new(group.templates),
            ctx,
            self.cluster.clone(),
        )
    }

    fn build_layer(
        &self,
        pass: &PassContext<W::Config>,
    ) -> Result<Layer, ReconcileFailure> {
        let mut layer = self.workload.layer(pass)?;
        for (i, url) in loki_endpoints(&pass.relations).into_iter().enumerate() {
            layer.log_targets.insert(format!("loki-{i}"), LogTarget::loki(url));
        }
        Ok(layer)
    }

    /// Apply every resource group. On upgrade, objects that report a
    /// conflict are re-applied with forced ownership.
    async fn apply_resources(
        &self,
        config: &W::Config,
        force: bool,
    ) -> Result<(), ReconcileFailure> {
        let ctx = self.context(config);
        for group in self.workload.resource_groups() {
            let scope = group.scope;
            let mut handler = self.handler(group, ctx.clone());
            match handler.apply(force).await {
                Ok(result) => {
                    if !result.forced.is_empty() {
                        warn!(
                            %scope,
                            forced = ?result.forced,
                            "took ownership of conflicting fields"
                        );
                    }
                    debug!(%scope, applied = result.applied.len(), "resource group applied");
                }
                Err(err) => {
                    error!(%scope, error = %err, "failed to apply resource group");
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    async fn patch_service(&self, config: &W::Config) -> Result<(), ReconcileFailure> {
        let ports = self.workload.service_ports(config);
        if ports.is_empty() {
            return Ok(());
        }
        ServicePatch::new(self.app_name.as_str(), self.model_name.as_str(), ports)
            .apply(&*self.cluster, &self.app_name)
            .await
            .map_err(|err| {
                error!(error = %err, "failed to patch service");
                ReconcileFailure::from(err)
            })?;
        Ok(())
    }

    async fn sync_process_layer(
        &self,
        pass: &PassContext<W::Config>,
        layer: &Layer,
    ) -> Result<(), ReconcileFailure> {
        for file in self.workload.files(pass) {
            self.pebble
                .push(&file.path, &file.content, file.permissions)
                .await
                .map_err(|err| {
                    error!(path = %file.path, error = %err, "failed to push file");
                    replan_failure(err)
                })?;
        }
        sync_layer(&*self.pebble, self.workload.container(), layer)
            .await
            .map_err(|err| {
                error!(error = %err, "failed to update pebble layer");
                replan_failure(err)
            })?;
        Ok(())
    }

    async fn configure_mesh(
        &self,
        mesh: &MeshRelation<'_>,
        data: Option<Databag>,
    ) -> Result<(), ReconcileFailure> {
        let (Some(relation), Some(data)) = (mesh.relation(), data) else {
            return Ok(());
        };
        self.backend
            .relation_set(&relation.id, &data)
            .await
            .map_err(|e| {
                ReconcileFailure::Waiting(format!(
                    "Failed to update {} relation: {e}",
                    relation.endpoint
                ))
            })?;
        info!(relation = %relation.id, "mesh relation configured");
        Ok(())
    }

    /// Observability and sidebar data. Failures here never change the state.
    async fn publish_relation_data(&self, pass: &PassContext<W::Config>) {
        let payloads = match self.workload.relation_data(pass) {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(error = %err, "failed to build relation data");
                return;
            }
        };
        for (kind, data) in payloads {
            for relation in pass.relations.of_kind(kind) {
                if let Err(err) = self.backend.relation_set(&relation.id, &data).await {
                    warn!(
                        relation = %relation.id,
                        error = %err,
                        "failed to publish relation data"
                    );
                }
            }
        }
    }

    async fn check_health(&self) -> Result<(), ReconcileFailure> {
        let name = self.workload.health_check();
        let failed = || ReconcileFailure::Maintenance(MSG_HEALTH_CHECK_FAILED.to_string());
        let checks = self.pebble.checks(&[name]).await.map_err(|err| {
            warn!(check = name, error = %err, "cannot read health check");
            failed()
        })?;
        match checks.iter().find(|c| c.name == name) {
            Some(c) => match c.status {
                CheckStatus::Up => Ok(()),
                CheckStatus::Inactive => {
                    info!(check = name, "health check not running yet");
                    Err(ReconcileFailure::Waiting(MSG_HEALTH_CHECK_INACTIVE.to_string()))
                }
                CheckStatus::Down => {
                    warn!(
                        check = name,
                        failures = c.failures,
                        threshold = c.threshold,
                        "health check down"
                    );
                    Err(failed())
                }
            },
            None => {
                warn!(check = name, "health check not found in plan");
                Err(failed())
            }
        }
    }

    /// Delete every resource group. All groups are attempted; any residue
    /// is reported as [`ReconcileError::Cleanup`].
    #[instrument(skip_all, fields(app = %self.app_name))]
    pub async fn remove(&self) -> Result<ReconcileState, ReconcileError> {
        if !self.backend.is_leader().await? {
            info!("not the leader; leaving cleanup to the leader");
            let state = ReconcileState::Waiting(MSG_WAITING_LEADERSHIP.to_string());
            StatusProjector::publish(&*self.backend, &state).await?;
            return Ok(state);
        }
        StatusProjector::publish(
            &*self.backend,
            &ReconcileState::Maintenance(MSG_REMOVING.to_string()),
        )
        .await?;

        let config = match self.load_config().await {
            Ok(config) => config,
            Err(failure) => {
                warn!(%failure, "using default config to render resources for removal");
                W::Config::default()
            }
        };
        let ctx = self.context(&config);
        let mut failures = Vec::new();
        for group in self.workload.resource_groups() {
            let scope = group.scope;
            let mut handler = self.handler(group, ctx.clone());
            if let Err(err) = handler.delete().await {
                error!(%scope, error = %err, "failed to delete resource group");
                failures.push(format!("{scope}: {err}"));
            }
        }
        if !failures.is_empty() {
            return Err(ReconcileError::Cleanup { failures });
        }

        let state = ReconcileState::Maintenance(MSG_REMOVED.to_string());
        StatusProjector::publish(&*self.backend, &state).await?;
        info!("resources removed");
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::mesh::IngressRoute;
    use crate::observability::{SidebarItem, sidebar_data};
    use crate::status::{StatusKind, UnitStatus};
    use crate::testing::FakeBackend;
    use charm_k8s::testing::{ClusterCall, FakeCluster};
    use charm_k8s::{ObjectId, ObjectKind};
    use charm_pebble::testing::FakePebble;
    use charm_pebble::{Check, Service};
    use serde::Deserialize;
    use serde_json::json;

    const AUTH: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {{ app_name }}
rules: []
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ app_name }}-settings
  namespace: {{ namespace }}
data:
  mode: {{ mode }}
"#;

    const EXTRA: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ app_name }}-extra
  namespace: {{ namespace }}
"#;

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "kebab-case", default)]
    struct TestConfig {
        mode: String,
        port: u16,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                mode: "standard".into(),
                port: 8888,
            }
        }
    }

    struct TestWorkload;

    impl Workload for TestWorkload {
        type Config = TestConfig;

        fn container(&self) -> &str {
            "app"
        }

        fn charm_name(&self) -> &str {
            "test-charm"
        }

        fn endpoints(&self) -> Vec<Endpoint> {
            vec![
                Endpoint::new("ingress", RelationKind::SidecarMesh),
                Endpoint::new("istio-ingress-route", RelationKind::AmbientMesh),
                Endpoint::new("dashboard-links", RelationKind::DashboardLinks),
                Endpoint::new("logging", RelationKind::Logging),
            ]
        }

        fn validate_config(&self, config: &TestConfig) -> Result<(), String> {
            if config.port == 0 {
                return Err("port must be positive".into());
            }
            Ok(())
        }

        fn resource_groups(&self) -> Vec<ResourceGroup> {
            vec![
                ResourceGroup::new("auth", vec![TemplateSource::new("auth.yaml.j2", AUTH)]),
                ResourceGroup::new("extra", vec![TemplateSource::new("extra.yaml.j2", EXTRA)]),
            ]
        }

        fn extend_context(&self, config: &TestConfig, ctx: Context) -> Context {
            ctx.with("mode", config.mode.as_str())
        }

        fn service_ports(&self, config: &TestConfig) -> Vec<PortSpec> {
            vec![PortSpec::new("http", i32::from(config.port))]
        }

        fn files(&self, _pass: &PassContext<TestConfig>) -> Vec<WorkloadFile> {
            vec![WorkloadFile {
                path: "/etc/app/app.yaml".into(),
                content: b"key: value\n".to_vec(),
                permissions: 0o644,
            }]
        }

        fn layer(&self, pass: &PassContext<TestConfig>) -> Result<Layer, ReconcileFailure> {
            let mut layer = Layer::default();
            layer.services.insert(
                "app".into(),
                Service {
                    command: "serve".into(),
                    environment: BTreeMap::from([("MODE".into(), pass.config.mode.clone())]),
                    ..Default::default()
                },
            );
            layer.checks.insert("app-up".into(), Check::tcp(pass.config.port));
            Ok(layer)
        }

        fn health_check(&self) -> &str {
            "app-up"
        }

        fn mesh_data(
            &self,
            pass: &PassContext<TestConfig>,
            mesh: &MeshRelation<'_>,
        ) -> Result<Option<Databag>, ReconcileFailure> {
            Ok(match mesh {
                MeshRelation::Ambient(_) => Some(
                    IngressRoute {
                        model: pass.model_name.clone(),
                        name: pass.app_name.clone(),
                        port: pass.config.port,
                        prefix: "/app/".into(),
                    }
                    .to_databag(),
                ),
                _ => None,
            })
        }

        fn relation_data(
            &self,
            _pass: &PassContext<TestConfig>,
        ) -> Result<Vec<(RelationKind, Databag)>, ObservabilityError> {
            Ok(vec![(
                RelationKind::DashboardLinks,
                sidebar_data(&[SidebarItem::item(1, "App", "/app/", "book")])?,
            )])
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        pebble: Arc<FakePebble>,
        cluster: Arc<FakeCluster>,
        reconciler: Reconciler<TestWorkload, FakeBackend, FakePebble, FakeCluster>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let pebble = Arc::new(FakePebble::new());
        let cluster = Arc::new(FakeCluster::new());
        // Juju creates the application Service before the charm runs.
        let juju_service =
            ServicePatch::new("app", "models", vec![PortSpec::new("placeholder", 65535)]);
        cluster.seed("juju", &juju_service.document().unwrap());
        let reconciler = Reconciler::new(
            TestWorkload,
            "app",
            "models",
            "0d6c2b1e-7f3a-4c5d-9e8f-a1b2c3d4e5f6",
            backend.clone(),
            pebble.clone(),
            cluster.clone(),
        );
        Harness {
            backend,
            pebble,
            cluster,
            reconciler,
        }
    }

    fn settings_id() -> ObjectId {
        ObjectId {
            kind: ObjectKind::new("", "v1", "ConfigMap"),
            namespace: Some("models".into()),
            name: "app-settings".into(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn fresh_install_reaches_active() {
        let h = harness();
        let state = h.reconciler.handle(&HookEvent::Install).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Active));
        assert_eq!(h.backend.status(), UnitStatus::new(StatusKind::Active, ""));
        // Two groups plus the patched service.
        assert_eq!(h.cluster.len(), 4);
        assert_eq!(h.pebble.replans(), 1);
        assert_eq!(
            h.pebble.current_plan().services["app"].environment["MODE"],
            "standard"
        );
        assert_eq!(h.pebble.file("/etc/app/app.yaml").unwrap(), b"key: value\n");
    }

    #[tokio::test]
    async fn second_pass_changes_nothing() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        let before = h.cluster.get(&settings_id());
        h.reconciler.handle(&HookEvent::ConfigChanged).await.unwrap();
        assert_eq!(h.cluster.get(&settings_id()), before);
        assert_eq!(h.pebble.replans(), 1);
        assert_eq!(h.backend.status_writes().len(), 1);
    }

    #[tokio::test]
    async fn non_leader_waits_without_mutations() {
        let h = harness();
        h.backend.set_leader(false);
        let state = h.reconciler.handle(&HookEvent::ConfigChanged).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Waiting(MSG_WAITING_LEADERSHIP.into())));
        assert_eq!(h.cluster.mutations(), 0);
        assert!(h.pebble.layers().is_empty());
    }

    #[tokio::test]
    async fn unreachable_container_is_maintenance() {
        let h = harness();
        h.pebble.set_reachable(false);
        let state = h.reconciler.reconcile(&HookEvent::Install).await;
        assert_eq!(state, ReconcileState::Maintenance(MSG_POD_STARTUP.into()));
        assert_eq!(h.cluster.mutations(), 0);
    }

    #[tokio::test]
    async fn invalid_config_blocks() {
        let h = harness();
        h.backend.set_config("port", json!(0));
        let state = h.reconciler.reconcile(&HookEvent::ConfigChanged).await;
        assert_eq!(
            state,
            ReconcileState::Blocked("Invalid config: port must be positive".into())
        );

        h.backend.set_config("port", json!("not-a-port"));
        let state = h.reconciler.reconcile(&HookEvent::ConfigChanged).await;
        assert!(
            matches!(&state, ReconcileState::Blocked(m) if m.starts_with("Invalid config: ")),
            "{state:?}"
        );
        assert_eq!(h.cluster.mutations(), 0);
    }

    #[tokio::test]
    async fn conflict_outside_upgrade_blocks() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        h.backend.set_config("mode", json!("changed"));
        // Another manager takes the field over.
        let mut foreign = h.cluster.get(&settings_id()).unwrap();
        foreign["data"]["mode"] = json!("theirs");
        h.cluster.seed(
            "someone-else",
            &charm_k8s::ResourceDocument::from_value(foreign).unwrap(),
        );

        let state = h.reconciler.reconcile(&HookEvent::ConfigChanged).await;
        assert_eq!(
            state,
            ReconcileState::Blocked(format!("resource conflict: {}", settings_id()))
        );
        assert_eq!(h.cluster.get(&settings_id()).unwrap()["data"]["mode"], "theirs");
    }

    #[test_log::test(tokio::test)]
    async fn upgrade_forces_conflicting_objects_only() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        let mut foreign = h.cluster.get(&settings_id()).unwrap();
        foreign["data"]["mode"] = json!("theirs");
        h.cluster.seed(
            "someone-else",
            &charm_k8s::ResourceDocument::from_value(foreign).unwrap(),
        );
        h.cluster.clear_calls();

        let state = h.reconciler.handle(&HookEvent::UpgradeCharm).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Active));
        assert_eq!(h.cluster.get(&settings_id()).unwrap()["data"]["mode"], "standard");
        assert_eq!(
            h.cluster.owner_of(&settings_id(), &["data", "mode"]).as_deref(),
            Some("app")
        );
        let forced: Vec<ObjectId> = h
            .cluster
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ClusterCall::Apply { id, force: true, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(forced, vec![settings_id()]);
    }

    #[tokio::test]
    async fn apply_failure_names_the_object() {
        let h = harness();
        h.cluster.fail_apply("app-extra", 403);
        let state = h.reconciler.reconcile(&HookEvent::Install).await;
        assert_eq!(
            state,
            ReconcileState::Blocked("resource creation failed: ConfigMap/models/app-extra".into())
        );
    }

    #[tokio::test]
    async fn both_mesh_relations_block_before_any_mutation() {
        for order in [["ingress", "istio-ingress-route"], ["istio-ingress-route", "ingress"]] {
            let h = harness();
            for endpoint in order {
                h.backend.add_relation(endpoint, "istio");
            }
            let state = h.reconciler.reconcile(&HookEvent::ConfigChanged).await;
            assert!(matches!(state, ReconcileState::Blocked(_)), "{state:?}");
            assert_eq!(h.cluster.mutations(), 0);
        }
    }

    #[tokio::test]
    async fn broken_relation_no_longer_counts() {
        let h = harness();
        h.backend.add_relation("ingress", "istio");
        let ambient = h.backend.add_relation("istio-ingress-route", "istio-ingress");
        let event =
            HookEvent::parse("istio-ingress-route-relation-broken", Some(ambient.as_str()))
                .unwrap();
        assert_eq!(h.reconciler.reconcile(&event).await, ReconcileState::Active);
    }

    #[tokio::test]
    async fn ambient_route_and_sidebar_are_published() {
        let h = harness();
        let route = h.backend.add_relation("istio-ingress-route", "istio-ingress");
        let links = h.backend.add_relation("dashboard-links", "kubeflow-dashboard");
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        assert_eq!(h.backend.local_data(&route)["prefix"], "\"/app/\"");
        assert!(h.backend.local_data(&links)["config"].contains("\"text\":\"App\""));
    }

    #[tokio::test]
    async fn loki_units_add_log_targets() {
        let h = harness();
        let id = h.backend.add_relation("logging", "loki");
        for unit in 0..2 {
            h.backend.set_remote_unit_data(
                &id,
                &format!("loki/{unit}"),
                "endpoint",
                &format!(r#"{{"url":"http://loki-{unit}:3100/loki/api/v1/push"}}"#),
            );
        }
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        let plan = h.pebble.current_plan();
        assert_eq!(plan.log_targets.len(), 2);
        assert_eq!(
            plan.log_targets["loki-1"].location,
            "http://loki-1:3100/loki/api/v1/push"
        );
    }

    #[tokio::test]
    async fn service_ports_replace_the_juju_placeholder() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        let service = ObjectId {
            kind: ObjectKind::new("", "v1", "Service"),
            namespace: Some("models".into()),
            name: "app".into(),
        };
        let stored = h.cluster.get(&service).unwrap();
        assert_eq!(stored["spec"]["ports"], json!([{
            "name": "http",
            "port": 8888,
            "targetPort": 8888,
        }]));
    }

    #[tokio::test]
    async fn replan_failure_blocks() {
        let h = harness();
        h.pebble.fail_replan("service app exited");
        let state = h.reconciler.reconcile(&HookEvent::Install).await;
        assert!(
            matches!(&state, ReconcileState::Blocked(m) if m.starts_with("Failed to replan: ")),
            "{state:?}"
        );
    }

    #[tokio::test]
    async fn failing_health_check_on_update_status_is_maintenance() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        h.pebble.set_check("app-up", CheckStatus::Down);
        let state = h.reconciler.handle(&HookEvent::UpdateStatus).await.unwrap();
        assert_eq!(
            state,
            Some(ReconcileState::Maintenance(MSG_HEALTH_CHECK_FAILED.into()))
        );
        // Nothing rolled back.
        assert_eq!(h.cluster.len(), 4);

        h.pebble.set_check("app-up", CheckStatus::Up);
        h.pebble.set_checks_unreadable(true);
        let state = h.reconciler.handle(&HookEvent::UpdateStatus).await.unwrap();
        assert_eq!(
            state,
            Some(ReconcileState::Maintenance(MSG_HEALTH_CHECK_FAILED.into()))
        );

        h.pebble.set_checks_unreadable(false);
        let state = h.reconciler.handle(&HookEvent::UpdateStatus).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Active));
    }

    #[tokio::test]
    async fn inactive_health_check_waits() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        h.pebble.set_check("app-up", CheckStatus::Inactive);
        let state = h.reconciler.handle(&HookEvent::UpdateStatus).await.unwrap();
        assert_eq!(
            state,
            Some(ReconcileState::Waiting(MSG_HEALTH_CHECK_INACTIVE.into()))
        );
    }

    #[tokio::test]
    async fn stop_and_unhandled_hooks_are_ignored() {
        let h = harness();
        let unhandled = HookEvent::parse("app-pebble-check-failed", None).unwrap();
        for event in [HookEvent::Stop, unhandled] {
            assert_eq!(h.reconciler.handle(&event).await.unwrap(), None);
        }
        assert!(h.backend.status_writes().is_empty());
        assert!(h.cluster.calls().is_empty());
        assert!(h.pebble.layers().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn remove_deletes_every_group() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        let state = h.reconciler.handle(&HookEvent::Remove).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Maintenance(MSG_REMOVED.into())));
        // Only the Juju-owned service is left.
        assert_eq!(h.cluster.len(), 1);
        let writes = h.backend.status_writes();
        assert_eq!(
            writes[writes.len() - 2],
            UnitStatus::new(StatusKind::Maintenance, MSG_REMOVING)
        );
    }

    #[tokio::test]
    async fn remove_attempts_all_groups_and_reports_residue() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        h.cluster.fail_delete("app", 500);
        let err = h.reconciler.handle(&HookEvent::Remove).await.unwrap_err();
        match err {
            ReconcileError::Cleanup { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("auth: "), "{failures:?}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(h.cluster.get(&settings_id()).is_none());
        let extra = ObjectId {
            name: "app-extra".into(),
            ..settings_id()
        };
        assert!(h.cluster.get(&extra).is_none());
    }

    #[tokio::test]
    async fn remove_on_non_leader_leaves_resources() {
        let h = harness();
        h.reconciler.handle(&HookEvent::Install).await.unwrap();
        h.backend.set_leader(false);
        h.cluster.clear_calls();
        let state = h.reconciler.handle(&HookEvent::Remove).await.unwrap();
        assert_eq!(state, Some(ReconcileState::Waiting(MSG_WAITING_LEADERSHIP.into())));
        assert_eq!(h.cluster.mutations(), 0);
    }
}
