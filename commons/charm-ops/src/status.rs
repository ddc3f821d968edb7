use std::fmt;

use tracing::{debug, info};

use crate::backend::{BackendError, ModelBackend};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Active,
    Blocked,
    Maintenance,
    Waiting,
    Unknown,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Active => "active",
            StatusKind::Blocked => "blocked",
            StatusKind::Maintenance => "maintenance",
            StatusKind::Waiting => "waiting",
            StatusKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => StatusKind::Active,
            "blocked" => StatusKind::Blocked,
            "maintenance" => StatusKind::Maintenance,
            "waiting" => StatusKind::Waiting,
            _ => StatusKind::Unknown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitStatus {
    pub kind: StatusKind,
    pub message: String,
}

impl UnitStatus {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    Waiting(String),
    Blocked(String),
    Maintenance(String),
    Active,
}

impl Default for ReconcileState {
    fn default() -> Self {
        ReconcileState::Waiting("not yet reconciled".to_string())
    }
}

impl ReconcileState {
    pub fn is_active(&self) -> bool {
        matches!(self, ReconcileState::Active)
    }
}

pub struct StatusProjector;

impl StatusProjector {
    pub fn project(state: &ReconcileState) -> UnitStatus {
        match state {
            ReconcileState::Waiting(msg) => UnitStatus::new(StatusKind::Waiting, msg),
            ReconcileState::Blocked(msg) => UnitStatus::new(StatusKind::Blocked, msg),
            ReconcileState::Maintenance(msg) => {
                UnitStatus::new(StatusKind::Maintenance, msg)
            }
            ReconcileState::Active => UnitStatus::new(StatusKind::Active, ""),
        }
    }

    /// Write the unit status for `state`, unless it is already showing.
    /// Returns whether a write happened.
    pub async fn publish<B: ModelBackend + ?Sized>(
        backend: &B,
        state: &ReconcileState,
    ) -> Result<bool, BackendError> {
        let wanted = Self::project(state);
        let current = backend.status_get().await?;
        if current == wanted {
            debug!(status = %wanted, "unit status unchanged");
            return Ok(false);
        }
        backend.status_set(&wanted).await?;
        info!(status = %wanted, previous = %current, "unit status updated");
        Ok(true)
    }
}
