//! In-memory cluster used by unit and scenario tests.
//!
//! Field ownership follows server-side apply closely enough to exercise the
//! conflict policy: every leaf is owned by the last manager that applied it,
//! and an unforced apply that changes a leaf owned by another manager fails
//! with 409. Arrays are atomic leaves except `spec.ports`, which is a map
//! list keyed by `port` and `protocol` as on a real API server: each entry
//! has its own owner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cluster::{ClusterApi, ClusterError};
use crate::render::{ObjectId, ObjectKind, ResourceDocument};

type FieldPath = Vec<String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterCall {
    Apply {
        id: ObjectId,
        field_manager: String,
        force: bool,
    },
    Patch {
        id: ObjectId,
        field_manager: String,
    },
    Delete {
        id: ObjectId,
    },
    List {
        kind: ObjectKind,
        selector: String,
    },
}

impl ClusterCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ClusterCall::List { .. })
    }
}

#[derive(Debug)]
struct Stored {
    manifest: Value,
    owners: BTreeMap<FieldPath, String>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectId, Stored>,
    calls: Vec<ClusterCall>,
    apply_failures: HashMap<String, u16>,
    delete_failures: HashMap<String, u16>,
}

#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `doc` as if `field_manager` had applied it, without recording
    /// a call.
    pub fn seed(&self, field_manager: &str, doc: &ResourceDocument) {
        let mut state = self.state();
        merge(&mut state, doc, field_manager);
    }

    pub fn get(&self, id: &ObjectId) -> Option<Value> {
        self.state().objects.get(id).map(|o| render(&o.manifest))
    }

    pub fn owner_of(&self, id: &ObjectId, path: &[&str]) -> Option<String> {
        let path: FieldPath = path.iter().map(|s| s.to_string()).collect();
        self.state()
            .objects
            .get(id)
            .and_then(|o| o.owners.get(&path).cloned())
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state().calls.clone()
    }

    pub fn mutations(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Fail every apply of an object called `name` with `code`.
    pub fn fail_apply(&self, name: &str, code: u16) {
        self.state().apply_failures.insert(name.to_string(), code);
    }

    /// Fail every delete of an object called `name` with `code`.
    pub fn fail_delete(&self, name: &str, code: u16) {
        self.state().delete_failures.insert(name.to_string(), code);
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(
        &self,
        doc: &ResourceDocument,
        field_manager: &str,
        force: bool,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        let id = doc.id().clone();
        state.calls.push(ClusterCall::Apply {
            id: id.clone(),
            field_manager: field_manager.to_string(),
            force,
        });
        if let Some(code) = state.apply_failures.get(&id.name) {
            return Err(ClusterError::from_status(
                *code,
                format!("injected apply failure for {id}"),
            ));
        }
        if !force {
            if let Some(existing) = state.objects.get(&id) {
                let conflicts = conflicts(existing, doc, field_manager);
                if !conflicts.is_empty() {
                    return Err(ClusterError::Conflict {
                        message: format!(
                            "Apply failed with {} conflict(s): {}",
                            conflicts.len(),
                            conflicts.join(", ")
                        ),
                    });
                }
            }
        }
        merge(&mut state, doc, field_manager);
        Ok(())
    }

    async fn merge_patch(
        &self,
        id: &ObjectId,
        patch: &Value,
        field_manager: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(ClusterCall::Patch {
            id: id.clone(),
            field_manager: field_manager.to_string(),
        });
        if let Some(code) = state.apply_failures.get(&id.name) {
            return Err(ClusterError::from_status(
                *code,
                format!("injected patch failure for {id}"),
            ));
        }
        let Some(stored) = state.objects.get_mut(id) else {
            return Err(ClusterError::NotFound {
                message: format!("{id} not found"),
            });
        };
        if lookup_str(patch, &PORTS).is_some() {
            // A merge patch replaces the list whole.
            remove_at(&mut stored.manifest, &ports_path());
            stored.owners.retain(|path, _| !under_ports(path));
        }
        for (path, value) in leaves(patch) {
            if value.is_null() {
                remove_at(&mut stored.manifest, &path);
                stored.owners.remove(&path);
            } else {
                set_at(&mut stored.manifest, &path, value.clone());
                stored.owners.insert(path, field_manager.to_string());
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClusterError> {
        let mut state = self.state();
        state.calls.push(ClusterCall::Delete { id: id.clone() });
        if let Some(code) = state.delete_failures.get(&id.name) {
            return Err(ClusterError::from_status(
                *code,
                format!("injected delete failure for {id}"),
            ));
        }
        match state.objects.remove(id) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                message: format!("{id} not found"),
            }),
        }
    }

    async fn list(
        &self,
        kind: &ObjectKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ObjectId>, ClusterError> {
        let mut state = self.state();
        state.calls.push(ClusterCall::List {
            kind: kind.clone(),
            selector: label_selector.to_string(),
        });
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.split_once('='))
            .collect();
        Ok(state
            .objects
            .iter()
            .filter(|(id, _)| &id.kind == kind)
            .filter(|(id, _)| {
                namespace.is_none() || id.namespace.as_deref() == namespace
            })
            .filter(|(_, obj)| {
                wanted.iter().all(|(k, v)| {
                    obj.manifest
                        .pointer("/metadata/labels")
                        .and_then(|l| l.get(*k))
                        .and_then(Value::as_str)
                        == Some(*v)
                })
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}

fn conflicts(
    existing: &Stored,
    doc: &ResourceDocument,
    field_manager: &str,
) -> Vec<String> {
    leaves(doc.manifest())
        .into_iter()
        .filter_map(|(path, value)| {
            let owner = existing.owners.get(&path)?;
            if owner == field_manager {
                return None;
            }
            let current = lookup(&existing.manifest, &path);
            (current != Some(value))
                .then(|| format!("conflict with \"{owner}\": .{}", path.join(".")))
        })
        .collect()
}

fn merge(state: &mut State, doc: &ResourceDocument, field_manager: &str) {
    let incoming = leaves(doc.manifest());
    let stored = state
        .objects
        .entry(doc.id().clone())
        .or_insert_with(|| Stored {
            manifest: identity_of(doc.manifest()),
            owners: BTreeMap::new(),
        });

    // Fields this manager applied before but no longer sends are dropped.
    let stale: Vec<FieldPath> = stored
        .owners
        .iter()
        .filter(|(path, owner)| {
            owner.as_str() == field_manager
                && !incoming.iter().any(|(p, _)| p == *path)
        })
        .map(|(path, _)| path.clone())
        .collect();
    for path in stale {
        remove_at(&mut stored.manifest, &path);
        stored.owners.remove(&path);
    }

    for (path, value) in incoming {
        set_at(&mut stored.manifest, &path, value.clone());
        stored.owners.insert(path, field_manager.to_string());
    }
}

fn identity_of(manifest: &Value) -> Value {
    let mut root = Map::new();
    for key in ["apiVersion", "kind"] {
        if let Some(v) = manifest.get(key) {
            root.insert(key.to_string(), v.clone());
        }
    }
    let mut metadata = Map::new();
    for key in ["name", "namespace"] {
        if let Some(v) = manifest.pointer(&format!("/metadata/{key}")) {
            metadata.insert(key.to_string(), v.clone());
        }
    }
    root.insert("metadata".to_string(), Value::Object(metadata));
    Value::Object(root)
}

fn is_identity(path: &[String]) -> bool {
    matches!(
        path.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["apiVersion"] | ["kind"] | ["metadata", "name"] | ["metadata", "namespace"]
    )
}

const PORTS: [&str; 2] = ["spec", "ports"];

fn ports_path() -> FieldPath {
    PORTS.iter().map(|s| s.to_string()).collect()
}

fn under_ports(path: &[String]) -> bool {
    path.len() >= PORTS.len() && path.iter().zip(PORTS).all(|(a, b)| a == b)
}

/// Field path segment of a `spec.ports` entry, as the API server writes it
/// in `managedFields`.
pub fn port_key(port: i64, protocol: &str) -> String {
    format!("k:{{\"port\":{port},\"protocol\":\"{protocol}\"}}")
}

fn port_entry_key(entry: &Value) -> Option<String> {
    let port = entry.get("port")?.as_i64()?;
    let protocol = entry.get("protocol").and_then(Value::as_str).unwrap_or("TCP");
    Some(port_key(port, protocol))
}

/// The stored manifest with keyed `spec.ports` entries turned back into a
/// list.
fn render(manifest: &Value) -> Value {
    let mut out = manifest.clone();
    if let Some(Value::Object(entries)) = lookup_str(manifest, &PORTS) {
        let ports = Value::Array(entries.values().cloned().collect());
        set_at(&mut out, &ports_path(), ports);
    }
    out
}

fn leaves(value: &Value) -> Vec<(FieldPath, &Value)> {
    fn walk<'a>(
        value: &'a Value,
        path: &mut FieldPath,
        out: &mut Vec<(FieldPath, &'a Value)>,
    ) {
        match value {
            Value::Array(items) if path.len() == PORTS.len() && under_ports(path) => {
                let keys: Option<Vec<String>> = items.iter().map(port_entry_key).collect();
                match keys {
                    Some(keys) => {
                        for (key, item) in keys.into_iter().zip(items) {
                            let mut entry = path.clone();
                            entry.push(key);
                            out.push((entry, item));
                        }
                    }
                    None => out.push((path.clone(), value)),
                }
            }
            Value::Object(map) if !map.is_empty() => {
                for (k, v) in map {
                    path.push(k.clone());
                    walk(v, path, out);
                    path.pop();
                }
            }
            _ => {
                if !is_identity(path) {
                    out.push((path.clone(), value));
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(value, &mut Vec::new(), &mut out);
    out
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn lookup_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn set_at(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut cursor = root;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Some(map) = cursor.as_object_mut() else {
            return;
        };
        cursor = map
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Some(map) = cursor.as_object_mut() {
        map.insert(last.clone(), value);
    }
}

fn remove_at(root: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for key in parents {
        match cursor.get_mut(key) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(map) = cursor.as_object_mut() {
        map.remove(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> ResourceDocument {
        ResourceDocument::from_value(value).unwrap()
    }

    fn config(mode: &str) -> ResourceDocument {
        doc(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"},
            "data": {"mode": mode, "fixed": "x"},
        }))
    }

    #[tokio::test]
    async fn equal_values_do_not_conflict() {
        let cluster = FakeCluster::new();
        cluster.seed("other", &config("a"));
        cluster.apply(&config("a"), "mine", false).await.unwrap();
        assert_eq!(
            cluster.owner_of(config("a").id(), &["data", "mode"]).as_deref(),
            Some("mine")
        );
    }

    #[tokio::test]
    async fn changed_foreign_field_conflicts() {
        let cluster = FakeCluster::new();
        cluster.seed("other", &config("a"));
        let err = cluster.apply(&config("b"), "mine", false).await.unwrap_err();
        assert!(err.to_string().contains(".data.mode"), "{err}");
        assert_eq!(err.code(), Some(409));
    }

    #[tokio::test]
    async fn dropped_fields_are_pruned() {
        let cluster = FakeCluster::new();
        cluster.apply(&config("a"), "mine", false).await.unwrap();
        let slim = doc(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"},
            "data": {"mode": "a"},
        }));
        cluster.apply(&slim, "mine", false).await.unwrap();
        let stored = cluster.get(slim.id()).unwrap();
        assert!(stored["data"].get("fixed").is_none());
    }

    fn service(manager_ports: &[(&str, i64)]) -> ResourceDocument {
        let ports: Vec<Value> = manager_ports
            .iter()
            .map(|(name, port)| json!({"name": name, "port": port}))
            .collect();
        doc(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "ns"},
            "spec": {"ports": ports},
        }))
    }

    #[tokio::test]
    async fn ports_are_owned_per_entry() {
        let cluster = FakeCluster::new();
        cluster.seed("juju", &service(&[("placeholder", 65535)]));
        let mine = service(&[("http", 5000)]);
        cluster.apply(&mine, "mine", false).await.unwrap();

        let id = mine.id();
        let ports = cluster.get(id).unwrap()["spec"]["ports"].clone();
        assert_eq!(ports.as_array().unwrap().len(), 2);
        let (http, placeholder) = (port_key(5000, "TCP"), port_key(65535, "TCP"));
        assert_eq!(
            cluster.owner_of(id, &["spec", "ports", http.as_str()]).as_deref(),
            Some("mine")
        );
        assert_eq!(
            cluster.owner_of(id, &["spec", "ports", placeholder.as_str()]).as_deref(),
            Some("juju")
        );
    }

    #[tokio::test]
    async fn merge_patch_replaces_lists() {
        let cluster = FakeCluster::new();
        cluster.seed("juju", &service(&[("placeholder", 65535)]));
        let patch = service(&[("http", 5000)]);
        cluster
            .merge_patch(patch.id(), patch.manifest(), "mine")
            .await
            .unwrap();
        assert_eq!(
            cluster.get(patch.id()).unwrap()["spec"]["ports"],
            json!([{"name": "http", "port": 5000}])
        );
        assert_eq!(cluster.mutations(), 1);

        let missing = ObjectId {
            name: "absent".into(),
            ..patch.id().clone()
        };
        let err = cluster
            .merge_patch(&missing, patch.manifest(), "mine")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(404));
    }

    #[tokio::test]
    async fn list_filters_by_labels() {
        let cluster = FakeCluster::new();
        let mut labelled = config("a");
        let mut labels = BTreeMap::new();
        labels.insert("scope".to_string(), "auth".to_string());
        labelled.add_labels(&labels);
        cluster.seed("mine", &labelled);
        let kind = labelled.id().kind.clone();
        assert_eq!(cluster.list(&kind, None, "scope=auth").await.unwrap().len(), 1);
        assert!(cluster.list(&kind, None, "scope=crds").await.unwrap().is_empty());
    }
}
