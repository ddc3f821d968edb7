use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("malformed hook name `{0}`")]
    MalformedHook(String),

    #[error("invalid dispatch path `{0}`")]
    InvalidDispatchPath(String),

    #[error("invalid relation id `{0}`")]
    InvalidRelationId(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationEventKind {
    Created,
    Joined,
    Changed,
    Departed,
    Broken,
}

impl RelationEventKind {
    const ALL: [(&'static str, RelationEventKind); 5] = [
        ("-relation-created", RelationEventKind::Created),
        ("-relation-joined", RelationEventKind::Joined),
        ("-relation-changed", RelationEventKind::Changed),
        ("-relation-departed", RelationEventKind::Departed),
        ("-relation-broken", RelationEventKind::Broken),
    ];
}

/// A Juju hook as seen by the charm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Install,
    Start,
    Stop,
    UpgradeCharm,
    ConfigChanged,
    LeaderElected,
    UpdateStatus,
    Remove,
    PebbleReady {
        container: String,
    },
    Relation {
        endpoint: String,
        kind: RelationEventKind,
        /// Juju relation id, e.g. `ingress:3`.
        relation_id: Option<String>,
    },
    /// Any other hook Juju dispatches (`leader-settings-changed`,
    /// `<container>-pebble-check-failed`, `secret-changed`, ...). Not handled.
    Other(String),
}

impl HookEvent {
    /// Parse a hook name such as `config-changed` or `ingress-relation-broken`.
    pub fn parse(
        hook: &str,
        relation_id: Option<&str>,
    ) -> Result<Self, EventError> {
        let event = match hook {
            "install" => HookEvent::Install,
            "start" => HookEvent::Start,
            "stop" => HookEvent::Stop,
            "upgrade-charm" => HookEvent::UpgradeCharm,
            "config-changed" => HookEvent::ConfigChanged,
            "leader-elected" => HookEvent::LeaderElected,
            "update-status" => HookEvent::UpdateStatus,
            "remove" => HookEvent::Remove,
            other => {
                if let Some(container) = other.strip_suffix("-pebble-ready") {
                    return non_empty(container, other).map(|container| {
                        HookEvent::PebbleReady {
                            container: container.to_string(),
                        }
                    });
                }
                let Some((endpoint, kind)) =
                    RelationEventKind::ALL.iter().find_map(|(suffix, kind)| {
                        other.strip_suffix(suffix).map(|e| (e, *kind))
                    })
                else {
                    return Ok(HookEvent::Other(other.to_string()));
                };
                let endpoint = non_empty(endpoint, other)?;
                let relation_id = relation_id
                    .filter(|id| !id.is_empty())
                    .map(|id| validate_relation_id(id).map(str::to_string))
                    .transpose()?;
                HookEvent::Relation {
                    endpoint: endpoint.to_string(),
                    kind,
                    relation_id,
                }
            }
        };
        Ok(event)
    }

    /// Parse `JUJU_DISPATCH_PATH`, which looks like `hooks/<hook-name>`.
    pub fn from_dispatch_path(
        path: &str,
        relation_id: Option<&str>,
    ) -> Result<Self, EventError> {
        let hook = path
            .rsplit('/')
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EventError::InvalidDispatchPath(path.to_string()))?;
        Self::parse(hook, relation_id)
    }

    /// Hooks the charm does not react to.
    pub fn is_ignored(&self) -> bool {
        matches!(self, HookEvent::Stop | HookEvent::Other(_))
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self, HookEvent::UpgradeCharm)
    }

    /// Relation id of a relation that is going away in this hook.
    pub fn broken_relation(&self) -> Option<&str> {
        match self {
            HookEvent::Relation {
                kind: RelationEventKind::Broken,
                relation_id,
                ..
            } => relation_id.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::Install => f.write_str("install"),
            HookEvent::Start => f.write_str("start"),
            HookEvent::Stop => f.write_str("stop"),
            HookEvent::UpgradeCharm => f.write_str("upgrade-charm"),
            HookEvent::ConfigChanged => f.write_str("config-changed"),
            HookEvent::LeaderElected => f.write_str("leader-elected"),
            HookEvent::UpdateStatus => f.write_str("update-status"),
            HookEvent::Remove => f.write_str("remove"),
            HookEvent::PebbleReady { container } => {
                write!(f, "{container}-pebble-ready")
            }
            HookEvent::Relation { endpoint, kind, .. } => {
                let suffix = RelationEventKind::ALL
                    .iter()
                    .find(|(_, k)| k == kind)
                    .map(|(s, _)| *s)
                    .unwrap_or_default();
                write!(f, "{endpoint}{suffix}")
            }
            HookEvent::Other(hook) => f.write_str(hook),
        }
    }
}

fn non_empty<'a>(part: &'a str, hook: &str) -> Result<&'a str, EventError> {
    if part.is_empty() {
        Err(EventError::MalformedHook(hook.to_string()))
    } else {
        Ok(part)
    }
}

fn validate_relation_id(id: &str) -> Result<&str, EventError> {
    match id.rsplit_once(':') {
        Some((endpoint, num))
            if !endpoint.is_empty() && num.parse::<u32>().is_ok() =>
        {
            Ok(id)
        }
        _ => Err(EventError::InvalidRelationId(id.to_string())),
    }
}
