//! Pebble layer schema.
//!
//! Only the fields the charms set are modelled; unknown fields in a plan
//! returned by Pebble are ignored on decode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CHECK_PERIOD: &str = "30s";
pub const CHECK_TIMEOUT: &str = "20s";
pub const CHECK_THRESHOLD: u32 = 4;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    #[default]
    Replace,
    Merge,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    Enabled,
    Disabled,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckAction {
    Restart,
    Shutdown,
    Ignore,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    Alive,
    Ready,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Layer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, Check>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_targets: BTreeMap<String, LogTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Service {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default)]
    pub r#override: Override,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<Startup>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_check_failure: BTreeMap<String, CheckAction>,
}

impl Service {
    /// Whether running this definition would behave differently from
    /// `other`. Descriptive fields do not count.
    pub fn differs_from(&self, other: &Service) -> bool {
        self.command != other.command
            || self.startup != other.startup
            || self.environment != other.environment
            || self.on_check_failure != other.on_check_failure
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Check {
    #[serde(default)]
    pub r#override: Override,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<CheckLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpCheck {
    pub url: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TcpCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecCheck {
    pub command: String,
}

/// Where Pebble forwards service logs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LogTarget {
    #[serde(default)]
    pub r#override: Override,
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

impl LogTarget {
    /// Forward every service's logs to a Loki push endpoint.
    pub fn loki(location: impl Into<String>) -> Self {
        LogTarget {
            r#override: Override::Replace,
            kind: "loki".to_string(),
            location: location.into(),
            services: vec!["all".to_string()],
        }
    }
}

impl Check {
    fn alive() -> Self {
        Check {
            r#override: Override::Replace,
            level: Some(CheckLevel::Alive),
            period: Some(CHECK_PERIOD.to_string()),
            timeout: Some(CHECK_TIMEOUT.to_string()),
            threshold: Some(CHECK_THRESHOLD),
            ..Default::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Check {
            http: Some(HttpCheck { url: url.into() }),
            ..Self::alive()
        }
    }

    pub fn tcp(port: u16) -> Self {
        Check {
            tcp: Some(TcpCheck { host: None, port }),
            ..Self::alive()
        }
    }

    pub fn exec(command: impl Into<String>) -> Self {
        Check {
            exec: Some(ExecCheck {
                command: command.into(),
            }),
            ..Self::alive()
        }
    }

    pub fn differs_from(&self, other: &Check) -> bool {
        self.level != other.level
            || self.period != other.period
            || self.timeout != other.timeout
            || self.threshold != other.threshold
            || self.http != other.http
            || self.tcp != other.tcp
            || self.exec != other.exec
    }
}

impl Layer {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Layer::default());
        }
        serde_yaml::from_str(text)
    }

    /// Entries of `self` that are missing from `plan` or defined
    /// differently there, as `service/<name>`, `check/<name>` and so on.
    pub fn changes_against(&self, plan: &Layer) -> Vec<String> {
        let services = self.services.iter().filter_map(|(name, svc)| {
            match plan.services.get(name) {
                Some(current) if !svc.differs_from(current) => None,
                _ => Some(format!("service/{name}")),
            }
        });
        let checks = self.checks.iter().filter_map(|(name, check)| {
            match plan.checks.get(name) {
                Some(current) if !check.differs_from(current) => None,
                _ => Some(format!("check/{name}")),
            }
        });
        let targets = self.log_targets.iter().filter_map(|(name, target)| {
            match plan.log_targets.get(name) {
                Some(current) if target.location == current.location
                    && target.services == current.services => None,
                _ => Some(format!("log-target/{name}")),
            }
        });
        services.chain(checks).chain(targets).collect()
    }

    /// Fold `other` into `self` the way Pebble combines a layer with an
    /// existing label.
    pub fn combine(&mut self, other: &Layer) {
        if !other.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if !other.description.is_empty() {
            self.description = other.description.clone();
        }
        for (name, svc) in &other.services {
            match (svc.r#override, self.services.get_mut(name)) {
                (Override::Merge, Some(current)) => {
                    if !svc.command.is_empty() {
                        current.command = svc.command.clone();
                    }
                    if svc.startup.is_some() {
                        current.startup = svc.startup;
                    }
                    current.environment.extend(svc.environment.clone());
                    current.on_check_failure.extend(svc.on_check_failure.clone());
                }
                _ => {
                    self.services.insert(name.clone(), svc.clone());
                }
            }
        }
        for (name, check) in &other.checks {
            self.checks.insert(name.clone(), check.clone());
        }
        for (name, target) in &other.log_targets {
            self.log_targets.insert(name.clone(), target.clone());
        }
    }
}

/// Health of one check as reported by `GET /v1/checks`.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
    /// Defined in the plan but not running, e.g. before its service starts.
    Inactive,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CheckInfo {
    pub name: String,
    #[serde(default)]
    pub level: Option<CheckLevel>,
    pub status: CheckStatus,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub threshold: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> Layer {
        let mut layer = Layer {
            summary: "jupyter-ui layer".into(),
            ..Default::default()
        };
        layer.services.insert(
            "jupyter-ui".into(),
            Service {
                summary: "entrypoint".into(),
                command: "gunicorn app".into(),
                startup: Some(Startup::Enabled),
                environment: BTreeMap::from([("UI".into(), "default".into())]),
                on_check_failure: BTreeMap::from([(
                    "jupyter-ui-up".into(),
                    CheckAction::Restart,
                )]),
                ..Default::default()
            },
        );
        layer.checks.insert("jupyter-ui-up".into(), Check::tcp(5000));
        layer
    }

    #[test]
    fn yaml_uses_pebble_field_names() {
        let yaml = layer().to_yaml().unwrap();
        assert!(yaml.contains("override: replace"), "{yaml}");
        assert!(yaml.contains("on-check-failure:"), "{yaml}");
        assert!(yaml.contains("jupyter-ui-up: restart"), "{yaml}");
        assert!(yaml.contains("period: 30s"), "{yaml}");
        assert!(yaml.contains("timeout: 20s"), "{yaml}");
        assert!(yaml.contains("threshold: 4"), "{yaml}");
        assert_eq!(Layer::from_yaml(&yaml).unwrap(), layer());
    }

    #[test]
    fn empty_plan_reports_everything() {
        let changes = layer().changes_against(&Layer::default());
        assert_eq!(changes, vec!["service/jupyter-ui", "check/jupyter-ui-up"]);
        assert_eq!(Layer::from_yaml("").unwrap(), Layer::default());
    }

    #[test]
    fn descriptive_fields_do_not_count_as_changes() {
        let mut plan = layer();
        plan.summary.clear();
        if let Some(svc) = plan.services.get_mut("jupyter-ui") {
            svc.summary = "something else".into();
        }
        assert!(layer().changes_against(&plan).is_empty());
    }

    #[test]
    fn environment_change_is_detected() {
        let plan = layer();
        let mut wanted = layer();
        if let Some(svc) = wanted.services.get_mut("jupyter-ui") {
            svc.environment.insert("UI".into(), "rok".into());
        }
        assert_eq!(wanted.changes_against(&plan), vec!["service/jupyter-ui"]);
    }

    #[test]
    fn combine_merges_or_replaces() {
        let mut plan = layer();
        let mut merge = Layer::default();
        merge.services.insert(
            "jupyter-ui".into(),
            Service {
                r#override: Override::Merge,
                environment: BTreeMap::from([("EXTRA".into(), "1".into())]),
                ..Default::default()
            },
        );
        plan.combine(&merge);
        let svc = &plan.services["jupyter-ui"];
        assert_eq!(svc.command, "gunicorn app");
        assert_eq!(svc.environment.len(), 2);

        let mut replace = merge.clone();
        if let Some(svc) = replace.services.get_mut("jupyter-ui") {
            svc.r#override = Override::Replace;
        }
        plan.combine(&replace);
        assert!(plan.services["jupyter-ui"].command.is_empty());
    }

    #[test]
    fn log_targets_serialize_and_diff() {
        let mut wanted = layer();
        wanted
            .log_targets
            .insert("loki-0".into(), LogTarget::loki("http://loki:3100/loki/api/v1/push"));
        let yaml = wanted.to_yaml().unwrap();
        assert!(yaml.contains("log-targets:"), "{yaml}");
        assert!(yaml.contains("type: loki"), "{yaml}");
        assert_eq!(wanted.changes_against(&layer()), vec!["log-target/loki-0"]);
    }

    #[test]
    fn check_info_decodes() {
        let info: CheckInfo = serde_json::from_str(
            r#"{"name":"jupyter-ui-up","level":"alive","status":"down",
                "failures":4,"threshold":4}"#,
        )
        .unwrap();
        assert_eq!(info.status, CheckStatus::Down);
        assert_eq!(info.failures, 4);

        let info: CheckInfo =
            serde_json::from_str(r#"{"name":"jupyter-ui-up","status":"inactive"}"#).unwrap();
        assert_eq!(info.status, CheckStatus::Inactive);
    }
}
