//! In-memory Juju model for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::backend::{BackendError, Databag, ModelBackend};
use crate::status::{StatusKind, UnitStatus};

#[derive(Debug)]
struct FakeRelation {
    endpoint: String,
    remote_app: Option<String>,
    remote_data: Databag,
    remote_units: BTreeMap<String, Databag>,
    local_data: Databag,
}

#[derive(Debug)]
struct State {
    leader: bool,
    config: Map<String, Value>,
    relations: BTreeMap<String, FakeRelation>,
    next_relation: u32,
    status: UnitStatus,
    status_writes: Vec<UnitStatus>,
}

#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// A leader unit with no config, no relations and an unknown status.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                leader: true,
                config: Map::new(),
                relations: BTreeMap::new(),
                next_relation: 0,
                status: UnitStatus::new(StatusKind::Unknown, ""),
                status_writes: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_leader(&self, leader: bool) {
        self.state().leader = leader;
    }

    pub fn set_config(&self, key: &str, value: Value) {
        self.state().config.insert(key.to_string(), value);
    }

    /// Add a relation on `endpoint` and return its id.
    pub fn add_relation(&self, endpoint: &str, remote_app: &str) -> String {
        let mut state = self.state();
        let id = format!("{endpoint}:{}", state.next_relation);
        state.next_relation += 1;
        state.relations.insert(
            id.clone(),
            FakeRelation {
                endpoint: endpoint.to_string(),
                remote_app: Some(remote_app.to_string()),
                remote_data: Databag::new(),
                remote_units: BTreeMap::new(),
                local_data: Databag::new(),
            },
        );
        id
    }

    pub fn remove_relation(&self, id: &str) {
        self.state().relations.remove(id);
    }

    pub fn set_remote_data(&self, id: &str, key: &str, value: &str) {
        if let Some(rel) = self.state().relations.get_mut(id) {
            rel.remote_data.insert(key.to_string(), value.to_string());
        }
    }

    /// Join `unit` to the relation with an empty databag.
    pub fn add_remote_unit(&self, id: &str, unit: &str) {
        if let Some(rel) = self.state().relations.get_mut(id) {
            rel.remote_units.entry(unit.to_string()).or_default();
        }
    }

    /// Write to a remote unit's databag, joining the unit if needed.
    pub fn set_remote_unit_data(&self, id: &str, unit: &str, key: &str, value: &str) {
        if let Some(rel) = self.state().relations.get_mut(id) {
            rel.remote_units
                .entry(unit.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
    }

    pub fn local_data(&self, id: &str) -> Databag {
        self.state()
            .relations
            .get(id)
            .map(|r| r.local_data.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> UnitStatus {
        self.state().status.clone()
    }

    pub fn status_writes(&self) -> Vec<UnitStatus> {
        self.state().status_writes.clone()
    }
}

#[async_trait]
impl ModelBackend for FakeBackend {
    async fn is_leader(&self) -> Result<bool, BackendError> {
        Ok(self.state().leader)
    }

    async fn config(&self) -> Result<Map<String, Value>, BackendError> {
        Ok(self.state().config.clone())
    }

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .state()
            .relations
            .iter()
            .filter(|(_, r)| r.endpoint == endpoint)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn remote_app(&self, relation_id: &str) -> Result<Option<String>, BackendError> {
        Ok(self
            .state()
            .relations
            .get(relation_id)
            .and_then(|r| r.remote_app.clone()))
    }

    async fn relation_get(
        &self,
        relation_id: &str,
        app: &str,
    ) -> Result<Databag, BackendError> {
        let state = self.state();
        let rel = state.relations.get(relation_id).ok_or_else(|| BackendError::Tool {
            tool: "relation-get".to_string(),
            code: Some(2),
            stderr: format!("invalid relation id {relation_id:?}"),
        })?;
        if rel.remote_app.as_deref() == Some(app) {
            Ok(rel.remote_data.clone())
        } else {
            Ok(rel.local_data.clone())
        }
    }

    async fn remote_units(&self, relation_id: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .state()
            .relations
            .get(relation_id)
            .map(|r| r.remote_units.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn unit_relation_get(
        &self,
        relation_id: &str,
        unit: &str,
    ) -> Result<Databag, BackendError> {
        let state = self.state();
        let rel = state.relations.get(relation_id).ok_or_else(|| BackendError::Tool {
            tool: "relation-get".to_string(),
            code: Some(2),
            stderr: format!("invalid relation id {relation_id:?}"),
        })?;
        rel.remote_units
            .get(unit)
            .cloned()
            .ok_or_else(|| BackendError::Tool {
                tool: "relation-get".to_string(),
                code: Some(2),
                stderr: format!("unit {unit:?} is not in relation {relation_id:?}"),
            })
    }

    async fn relation_set(
        &self,
        relation_id: &str,
        data: &Databag,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        let rel = state.relations.get_mut(relation_id).ok_or_else(|| BackendError::Tool {
            tool: "relation-set".to_string(),
            code: Some(2),
            stderr: format!("invalid relation id {relation_id:?}"),
        })?;
        for (k, v) in data {
            if v.is_empty() {
                rel.local_data.remove(k);
            } else {
                rel.local_data.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn status_get(&self) -> Result<UnitStatus, BackendError> {
        Ok(self.state().status.clone())
    }

    async fn status_set(&self, status: &UnitStatus) -> Result<(), BackendError> {
        let mut state = self.state();
        state.status = status.clone();
        state.status_writes.push(status.clone());
        Ok(())
    }
}
