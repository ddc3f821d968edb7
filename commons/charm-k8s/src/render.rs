//! Manifest templates rendered against a flat string context.
//!
//! Templates are plain YAML (optionally multi-document) with `{{ key }}`
//! placeholders. Rendering is pure: the caller hands over the template text
//! and the context, and gets back the parsed documents in template order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{(.*?)\}\}").expect("expression pattern is valid")
});

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("template {template}: undefined variable `{variable}`")]
    UndefinedVariable { template: String, variable: String },

    #[error("template {template}: unsupported expression `{{{{{expression}}}}}`")]
    UnsupportedExpression { template: String, expression: String },

    #[error("template {template}: invalid yaml: {source}")]
    Yaml {
        template: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("template {template}, document {index}: {source}")]
    Invalid {
        template: String,
        index: usize,
        #[source]
        source: InvalidDocument,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("document is missing `{0}`")]
pub struct InvalidDocument(pub &'static str);

/// Group/version/kind of a cluster object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ObjectKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Split an `apiVersion` such as `rbac.authorization.k8s.io/v1` or `v1`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version())
    }
}

/// Identity of one cluster object, stable across reconciliation passes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind.kind, self.name),
        }
    }
}

/// A rendered manifest together with its parsed identity.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDocument {
    id: ObjectId,
    manifest: Value,
}

impl ResourceDocument {
    pub fn from_value(manifest: Value) -> Result<Self, InvalidDocument> {
        let api_version = manifest
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or(InvalidDocument("apiVersion"))?;
        let kind = manifest
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(InvalidDocument("kind"))?;
        let metadata = manifest.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or(InvalidDocument("metadata.name"))?;
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = ObjectId {
            kind: ObjectKind::from_api_version(api_version, kind),
            namespace,
            name: name.to_string(),
        };
        Ok(Self { id, manifest })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn manifest(&self) -> &Value {
        &self.manifest
    }

    pub fn into_manifest(self) -> Value {
        self.manifest
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.manifest
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| {
                        v.as_str().map(|v| (k.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Merge `labels` into `metadata.labels`, overriding existing keys.
    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) {
        let Some(root) = self.manifest.as_object_mut() else {
            return;
        };
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(metadata) = metadata.as_object_mut() else {
            return;
        };
        let existing = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Map::new()));
        if !existing.is_object() {
            *existing = Value::Object(Map::new());
        }
        if let Some(existing) = existing.as_object_mut() {
            for (k, v) in labels {
                existing.insert(k.clone(), Value::String(v.clone()));
            }
        }
    }
}

/// Values substituted into templates. Immutable for the duration of a pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Named template text, usually embedded with `include_str!`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateSource {
    pub name: String,
    pub text: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TemplateRenderer {
    templates: Vec<TemplateSource>,
}

impl TemplateRenderer {
    pub fn new(templates: Vec<TemplateSource>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &[TemplateSource] {
        &self.templates
    }

    pub fn render(
        &self,
        ctx: &Context,
    ) -> Result<Vec<ResourceDocument>, TemplateError> {
        let mut out = Vec::new();
        for template in &self.templates {
            let text = substitute(&template.name, &template.text, ctx)?;
            let docs = serde_yaml::Deserializer::from_str(&text);
            for (index, de) in docs.enumerate() {
                let value = Value::deserialize(de).map_err(|source| {
                    TemplateError::Yaml {
                        template: template.name.clone(),
                        source,
                    }
                })?;
                if value.is_null() {
                    continue;
                }
                let doc = ResourceDocument::from_value(value).map_err(
                    |source| TemplateError::Invalid {
                        template: template.name.clone(),
                        index,
                        source,
                    },
                )?;
                out.push(doc);
            }
        }
        Ok(out)
    }
}

fn substitute(
    template: &str,
    text: &str,
    ctx: &Context,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in EXPRESSION.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let expression = inner.as_str().trim();
        if !is_identifier(expression) {
            return Err(TemplateError::UnsupportedExpression {
                template: template.to_string(),
                expression: expression.to_string(),
            });
        }
        let value = ctx.get(expression).ok_or_else(|| {
            TemplateError::UndefinedVariable {
                template: template.to_string(),
                variable: expression.to_string(),
            }
        })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: {{ app_name }}
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: {{app_name}}-sa
  namespace: {{ namespace }}
"#;

    const SVC: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: {{ service_name }}
  namespace: {{ namespace }}
spec:
  ports:
    - port: 80
"#;

    fn ctx() -> Context {
        Context::new()
            .with("app_name", "jupyter-ui")
            .with("namespace", "kubeflow")
            .with("service_name", "jupyter-ui")
    }

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(vec![
            TemplateSource::new("auth.yaml.j2", AUTH),
            TemplateSource::new("svc.yaml.j2", SVC),
        ])
    }

    #[test]
    fn render_preserves_template_and_document_order() {
        let docs = renderer().render(&ctx()).unwrap();
        let ids: Vec<String> = docs.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "ClusterRole/jupyter-ui",
                "ServiceAccount/kubeflow/jupyter-ui-sa",
                "Service/kubeflow/jupyter-ui",
            ]
        );
        assert_eq!(docs[0].id().kind.group, "rbac.authorization.k8s.io");
        assert_eq!(docs[1].id().kind.group, "");
        assert_eq!(docs[1].id().kind.version, "v1");
    }

    #[test]
    fn render_is_deterministic() {
        let r = renderer();
        assert_eq!(r.render(&ctx()).unwrap(), r.render(&ctx()).unwrap());
    }

    #[test]
    fn undefined_variable_is_a_hard_failure() {
        let c = Context::new().with("app_name", "x");
        let err = renderer().render(&c).unwrap_err();
        match err {
            TemplateError::UndefinedVariable { template, variable } => {
                assert_eq!(template, "auth.yaml.j2");
                assert_eq!(variable, "namespace");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn filters_are_not_supported() {
        let r = TemplateRenderer::new(vec![TemplateSource::new(
            "t",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ app_name | upper }}\n",
        )]);
        assert!(matches!(
            r.render(&ctx()),
            Err(TemplateError::UnsupportedExpression { .. })
        ));
    }

    #[test]
    fn missing_name_is_rejected() {
        let r = TemplateRenderer::new(vec![TemplateSource::new(
            "t",
            "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n",
        )]);
        match r.render(&ctx()) {
            Err(TemplateError::Invalid { index, source, .. }) => {
                assert_eq!(index, 0);
                assert_eq!(source, InvalidDocument("metadata.name"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_documents_are_skipped() {
        let text = format!("---\n{AUTH}\n---\n");
        let r = TemplateRenderer::new(vec![TemplateSource::new("t", text)]);
        assert_eq!(r.render(&ctx()).unwrap().len(), 2);
    }

    #[test]
    fn add_labels_creates_and_merges() {
        let mut doc = renderer().render(&ctx()).unwrap().remove(0);
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        doc.add_labels(&labels);
        labels.insert("b".to_string(), "2".to_string());
        doc.add_labels(&labels);
        assert_eq!(doc.labels(), labels);
    }
}
