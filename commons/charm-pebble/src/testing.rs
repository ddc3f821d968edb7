//! In-memory stand-in for a Pebble daemon.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::layer::{CheckInfo, CheckStatus, Layer};
use crate::supervisor::{PebbleError, ProcessSupervisor};

#[derive(Debug, Default)]
struct State {
    reachable: bool,
    layers: Vec<(String, Layer)>,
    plan: Layer,
    replans: usize,
    files: BTreeMap<String, (Vec<u8>, u32)>,
    check_status: BTreeMap<String, CheckStatus>,
    unreadable_checks: bool,
    fail_replan: Option<String>,
}

#[derive(Debug)]
pub struct FakePebble {
    state: Mutex<State>,
}

impl Default for FakePebble {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePebble {
    /// A reachable daemon with an empty plan.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reachable: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    pub fn set_check(&self, name: &str, status: CheckStatus) {
        self.state().check_status.insert(name.to_string(), status);
    }

    pub fn set_checks_unreadable(&self, unreadable: bool) {
        self.state().unreadable_checks = unreadable;
    }

    pub fn fail_replan(&self, message: &str) {
        self.state().fail_replan = Some(message.to_string());
    }

    pub fn current_plan(&self) -> Layer {
        self.state().plan.clone()
    }

    pub fn layers(&self) -> Vec<(String, Layer)> {
        self.state().layers.clone()
    }

    pub fn replans(&self) -> usize {
        self.state().replans
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).map(|(c, _)| c.clone())
    }

    fn ensure_reachable(state: &State) -> Result<(), PebbleError> {
        if state.reachable {
            Ok(())
        } else {
            Err(PebbleError::Connect("socket not found".to_string()))
        }
    }
}

#[async_trait]
impl ProcessSupervisor for FakePebble {
    async fn can_connect(&self) -> bool {
        self.state().reachable
    }

    async fn plan(&self) -> Result<Layer, PebbleError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        Ok(state.plan.clone())
    }

    async fn add_layer(
        &self,
        label: &str,
        layer: &Layer,
        combine: bool,
    ) -> Result<(), PebbleError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        let existing = state.layers.iter().position(|(l, _)| l == label);
        match (existing, combine) {
            (Some(_), false) => {
                return Err(PebbleError::Api {
                    status: 400,
                    message: format!("layer {label:?} already exists"),
                });
            }
            (Some(i), true) => state.layers[i].1.combine(layer),
            (None, _) => state.layers.push((label.to_string(), layer.clone())),
        }
        let mut plan = Layer::default();
        for (_, l) in &state.layers {
            plan.combine(l);
        }
        state.plan = plan;
        Ok(())
    }

    async fn replan(&self) -> Result<(), PebbleError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        if let Some(message) = state.fail_replan.clone() {
            return Err(PebbleError::Change {
                id: "1".to_string(),
                message,
            });
        }
        state.replans += 1;
        Ok(())
    }

    async fn checks(&self, names: &[&str]) -> Result<Vec<CheckInfo>, PebbleError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        if state.unreadable_checks {
            return Err(PebbleError::Api {
                status: 500,
                message: "checks unavailable".to_string(),
            });
        }
        Ok(state
            .plan
            .checks
            .iter()
            .filter(|(name, _)| names.is_empty() || names.contains(&name.as_str()))
            .map(|(name, check)| {
                let status = state
                    .check_status
                    .get(name)
                    .copied()
                    .unwrap_or(CheckStatus::Up);
                let threshold = check.threshold.unwrap_or_default();
                CheckInfo {
                    name: name.clone(),
                    level: check.level,
                    status,
                    failures: if status == CheckStatus::Down { threshold } else { 0 },
                    threshold,
                }
            })
            .collect())
    }

    async fn push(
        &self,
        path: &str,
        content: &[u8],
        permissions: u32,
    ) -> Result<(), PebbleError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        state
            .files
            .insert(path.to_string(), (content.to_vec(), permissions));
        Ok(())
    }
}
