//! Application databags for the observability relations and the dashboard
//! sidebar.

use std::collections::BTreeMap;
use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::{Value, json};
use xz2::write::XzEncoder;

use crate::backend::Databag;
use crate::relations::{RelationKind, RelationView};

const TOPOLOGY_PLACEHOLDER: &str = "%%juju_topology%%";

#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("invalid alert rules: {0}")]
    AlertRules(#[from] serde_yaml::Error),

    #[error("alert rule file {0} has neither `groups` nor `alert`")]
    InvalidRuleFile(String),

    #[error("malformed alert group in {0}")]
    MalformedGroup(String),

    #[error("failed to compress dashboard: {0}")]
    Compress(#[from] std::io::Error),

    #[error("failed to encode relation data: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Identifies the charm in the metadata other charms attach to its data.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct JujuTopology {
    pub model: String,
    pub model_uuid: String,
    pub application: String,
    pub charm_name: String,
}

impl JujuTopology {
    /// `<model>_<model_uuid>_<application>`
    pub fn identifier(&self) -> String {
        format!("{}_{}_{}", self.model, self.model_uuid, self.application)
    }

    /// Labels that tie a metric or alert to this application.
    pub fn label_matchers(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("juju_application", self.application.clone()),
            ("juju_model", self.model.clone()),
            ("juju_model_uuid", self.model_uuid.clone()),
        ])
    }

    fn promql_matchers(&self) -> String {
        self.label_matchers()
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrapeJob {
    pub metrics_path: String,
    pub targets: Vec<String>,
}

impl ScrapeJob {
    /// Scrape `path` on `port` of every unit.
    pub fn all_units(path: &str, port: u16) -> Self {
        Self {
            metrics_path: path.to_string(),
            targets: vec![format!("*:{port}")],
        }
    }
}

fn file_stem(file: &str) -> &str {
    file.rsplit_once('.').map_or(file, |(stem, _)| stem)
}

/// Merge `(file name, yaml)` rule files into one `groups` document.
///
/// A file holds either `groups` or a single rule (`alert` at the top level),
/// which becomes a group named after the file. Group names are prefixed with
/// the topology identifier, every rule gets the `juju_*` labels, and
/// `%%juju_topology%%` in an expression is replaced by the matching label
/// selectors.
pub fn alert_rules(
    topology: &JujuTopology,
    files: &[(&str, &str)],
) -> Result<Value, ObservabilityError> {
    let identifier = topology.identifier();
    let labels = topology.label_matchers();
    let matchers = topology.promql_matchers();

    let mut groups = Vec::new();
    for (file, text) in files {
        let doc: Value = serde_yaml::from_str(text)?;
        let stem = file_stem(file);
        let file_groups = match doc.get("groups") {
            Some(Value::Array(groups)) => groups.clone(),
            Some(_) => return Err(ObservabilityError::InvalidRuleFile(file.to_string())),
            None if doc.get("alert").is_some() => {
                vec![json!({"name": stem, "rules": [doc]})]
            }
            None => return Err(ObservabilityError::InvalidRuleFile(file.to_string())),
        };
        let malformed = || ObservabilityError::MalformedGroup(file.to_string());
        for mut group in file_groups {
            if !group.is_object() {
                return Err(malformed());
            }
            let name = group
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(stem)
                .to_string();
            group["name"] = json!(format!("{identifier}_{name}_alerts"));
            let rules = group
                .get_mut("rules")
                .and_then(Value::as_array_mut)
                .ok_or_else(malformed)?;
            for rule in rules.iter_mut() {
                if !rule.is_object() {
                    return Err(malformed());
                }
                if let Some(expr) = rule.get("expr").and_then(Value::as_str) {
                    let expr = expr.replace(TOPOLOGY_PLACEHOLDER, &matchers);
                    rule["expr"] = json!(expr);
                }
                if !rule.get("labels").is_some_and(Value::is_object) {
                    rule["labels"] = json!({});
                }
                for (k, v) in &labels {
                    rule["labels"][*k] = json!(v);
                }
            }
            groups.push(group);
        }
    }
    Ok(json!({ "groups": groups }))
}

/// `metrics-endpoint` provider data: scrape jobs, their metadata, and the
/// alert rules built from `rule_files`.
pub fn metrics_endpoint_data(
    topology: &JujuTopology,
    jobs: &[ScrapeJob],
    rule_files: &[(&str, &str)],
) -> Result<Databag, ObservabilityError> {
    let rules = alert_rules(topology, rule_files)?;
    let jobs: Vec<Value> = jobs
        .iter()
        .map(|job| {
            json!({
                "metrics_path": job.metrics_path,
                "static_configs": [{"targets": job.targets}],
            })
        })
        .collect();
    Ok(Databag::from([
        ("scrape_jobs".to_string(), serde_json::to_string(&jobs)?),
        ("scrape_metadata".to_string(), serde_json::to_string(topology)?),
        ("alert_rules".to_string(), serde_json::to_string(&rules)?),
    ]))
}

/// XZ-compress then base64-encode, the form dashboards travel in.
pub fn compress_dashboard(content: &str) -> Result<String, ObservabilityError> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(content.as_bytes())?;
    Ok(BASE64.encode(encoder.finish()?))
}

/// `grafana-dashboard` provider data for `(file name, json)` dashboards.
pub fn grafana_dashboard_data(
    topology: &JujuTopology,
    dashboards: &[(&str, &str)],
) -> Result<Databag, ObservabilityError> {
    let mut templates = serde_json::Map::new();
    for (file, content) in dashboards {
        templates.insert(
            format!("file:{}", file_stem(file)),
            json!({
                "charm": topology.charm_name,
                "content": compress_dashboard(content)?,
                "juju_topology": topology,
                "inject_dropdowns": true,
            }),
        );
    }
    Ok(Databag::from([(
        "dashboards".to_string(),
        serde_json::to_string(&json!({ "templates": templates }))?,
    )]))
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SidebarItem {
    pub position: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub link: String,
    pub text: String,
    pub icon: String,
}

impl SidebarItem {
    pub fn item(position: u32, text: &str, link: &str, icon: &str) -> Self {
        Self {
            position,
            kind: "item".to_string(),
            link: link.to_string(),
            text: text.to_string(),
            icon: icon.to_string(),
        }
    }
}

/// `dashboard-links` data: the sidebar entries as a JSON list.
pub fn sidebar_data(items: &[SidebarItem]) -> Result<Databag, ObservabilityError> {
    Ok(Databag::from([(
        "config".to_string(),
        serde_json::to_string(items)?,
    )]))
}

/// Loki push URLs advertised on the logging relations.
///
/// Providers publish `endpoint` in each unit's databag; the application
/// databag is read too. Duplicates are dropped, first occurrence wins.
pub fn loki_endpoints(view: &RelationView) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for rel in view.of_kind(RelationKind::Logging) {
        let bags = rel.remote_units.values().chain(std::iter::once(&rel.remote_data));
        for raw in bags.filter_map(|bag| bag.get("endpoint")) {
            let Ok(endpoint) = serde_json::from_str::<Value>(raw) else {
                continue;
            };
            if let Some(url) = endpoint.get("url").and_then(Value::as_str) {
                if !urls.iter().any(|u| u == url) {
                    urls.push(url.to_string());
                }
            }
        }
    }
    urls
}
