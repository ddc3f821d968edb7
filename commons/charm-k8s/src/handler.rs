use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::render::{
    Context, ObjectId, ObjectKind, ResourceDocument, TemplateError,
    TemplateRenderer,
};

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const SCOPE_LABEL: &str = "kubernetes-resource-handler-scope";

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("conflict applying {object}: {message}")]
    Conflict { object: ObjectId, message: String },

    #[error("failed to apply {object}: {source}")]
    Apply {
        object: ObjectId,
        #[source]
        source: ClusterError,
    },

    #[error("failed to delete {}", DeleteFailures(.failures))]
    Delete { failures: Vec<(ObjectId, ClusterError)> },

    #[error("failed to list {kind}: {source}")]
    List {
        kind: ObjectKind,
        #[source]
        source: ClusterError,
    },
}

struct DeleteFailures<'a>(&'a [(ObjectId, ClusterError)]);

impl fmt::Display for DeleteFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (id, err)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id} ({err})")?;
        }
        Ok(())
    }
}

/// Outcome of a successful apply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub applied: Vec<ObjectId>,
    /// Objects that reported a conflict and were re-applied with force.
    pub forced: Vec<ObjectId>,
}

/// Applies and deletes one group of rendered resources under a single
/// field manager.
pub struct KubernetesResourceHandler<C: ?Sized> {
    field_manager: String,
    scope: String,
    renderer: TemplateRenderer,
    context: Context,
    labels: BTreeMap<String, String>,
    cluster: Arc<C>,
    rendered: Option<Vec<ResourceDocument>>,
}

impl<C: ClusterApi + ?Sized> KubernetesResourceHandler<C> {
    pub fn new(
        field_manager: impl Into<String>,
        scope: impl Into<String>,
        model_name: &str,
        renderer: TemplateRenderer,
        context: Context,
        cluster: Arc<C>,
    ) -> Self {
        let field_manager = field_manager.into();
        let scope = scope.into();
        let labels = default_labels(&field_manager, model_name, &scope);
        Self {
            field_manager,
            scope,
            renderer,
            context,
            labels,
            cluster,
            rendered: None,
        }
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Selector matching every object this handler stamps.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render the templates once; later calls return the cached documents.
    pub fn render(&mut self) -> Result<&[ResourceDocument], TemplateError> {
        if self.rendered.is_none() {
            let mut docs = self.renderer.render(&self.context)?;
            for doc in &mut docs {
                doc.add_labels(&self.labels);
            }
            debug!(scope = %self.scope, count = docs.len(), "rendered manifests");
            self.rendered = Some(docs);
        }
        Ok(self.rendered.as_deref().unwrap_or_default())
    }

    pub async fn apply(
        &mut self,
        force: bool,
    ) -> Result<ApplyResult, HandlerError> {
        let docs = self.render()?.to_vec();
        self.apply_documents(&docs, force).await
    }

    #[instrument(skip_all, fields(scope = %self.scope, force = force))]
    pub async fn apply_documents(
        &self,
        docs: &[ResourceDocument],
        force: bool,
    ) -> Result<ApplyResult, HandlerError> {
        let mut result = ApplyResult::default();
        for doc in docs {
            let object = doc.id().clone();
            match self.cluster.apply(doc, &self.field_manager, false).await {
                Ok(()) => {}
                Err(ClusterError::Conflict { message }) if force => {
                    warn!(%object, %message, "conflict detected; forcing ownership");
                    self.cluster
                        .apply(doc, &self.field_manager, true)
                        .await
                        .map_err(|source| HandlerError::Apply {
                            object: object.clone(),
                            source,
                        })?;
                    result.forced.push(object.clone());
                }
                Err(ClusterError::Conflict { message }) => {
                    return Err(HandlerError::Conflict { object, message });
                }
                Err(source) => {
                    return Err(HandlerError::Apply { object, source });
                }
            }
            debug!(%object, "applied");
            result.applied.push(object);
        }
        info!(
            applied = result.applied.len(),
            forced = result.forced.len(),
            "apply complete"
        );
        Ok(result)
    }

    pub async fn delete(&mut self) -> Result<(), HandlerError> {
        let docs = self.render()?.to_vec();
        self.delete_documents(&docs).await
    }

    /// Delete every document, newest first. Missing objects count as
    /// deleted; other failures are reported once all deletions were tried.
    #[instrument(skip_all, fields(scope = %self.scope))]
    pub async fn delete_documents(
        &self,
        docs: &[ResourceDocument],
    ) -> Result<(), HandlerError> {
        let mut failures = Vec::new();
        for doc in docs.iter().rev() {
            let object = doc.id();
            match self.cluster.delete(object).await {
                Ok(()) => debug!(%object, "deleted"),
                Err(ClusterError::NotFound { .. }) => {
                    debug!(%object, "already absent")
                }
                Err(err) => {
                    warn!(%object, error = %err, "delete failed");
                    failures.push((object.clone(), err));
                }
            }
        }
        if failures.is_empty() {
            info!(count = docs.len(), "delete complete");
            Ok(())
        } else {
            Err(HandlerError::Delete { failures })
        }
    }

    /// Objects on the cluster carrying this handler's labels, for every kind
    /// the templates render.
    pub async fn list_applied(&mut self) -> Result<Vec<ObjectId>, HandlerError> {
        let selector = self.label_selector();
        let targets: BTreeSet<(ObjectKind, Option<String>)> = self
            .render()?
            .iter()
            .map(|d| (d.id().kind.clone(), d.id().namespace.clone()))
            .collect();
        let mut found = Vec::new();
        for (kind, namespace) in targets {
            let ids = self
                .cluster
                .list(&kind, namespace.as_deref(), &selector)
                .await
                .map_err(|source| HandlerError::List {
                    kind: kind.clone(),
                    source,
                })?;
            found.extend(ids);
        }
        Ok(found)
    }
}

fn default_labels(
    app_name: &str,
    model_name: &str,
    scope: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        INSTANCE_LABEL.to_string(),
        format!("{app_name}-{model_name}"),
    );
    labels.insert(SCOPE_LABEL.to_string(), scope.to_string());
    labels
}
