use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::status::{StatusKind, UnitStatus};

pub type Databag = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {stderr}")]
    Tool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from {tool}: {source}")]
    Decode {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What the charm can ask of the Juju model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn is_leader(&self) -> Result<bool, BackendError>;

    /// Every charm option, with Juju-side defaults filled in.
    async fn config(&self) -> Result<Map<String, Value>, BackendError>;

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>, BackendError>;

    /// The application on the other side of `relation_id`, once known.
    async fn remote_app(&self, relation_id: &str) -> Result<Option<String>, BackendError>;

    /// Application databag of `app` on `relation_id`.
    async fn relation_get(
        &self,
        relation_id: &str,
        app: &str,
    ) -> Result<Databag, BackendError>;

    /// Remote units currently in `relation_id`.
    async fn remote_units(&self, relation_id: &str) -> Result<Vec<String>, BackendError>;

    /// Databag `unit` wrote on `relation_id`.
    async fn unit_relation_get(
        &self,
        relation_id: &str,
        unit: &str,
    ) -> Result<Databag, BackendError>;

    /// Update this application's databag on `relation_id`. Empty values
    /// remove the key.
    async fn relation_set(
        &self,
        relation_id: &str,
        data: &Databag,
    ) -> Result<(), BackendError>;

    async fn status_get(&self) -> Result<UnitStatus, BackendError>;

    async fn status_set(&self, status: &UnitStatus) -> Result<(), BackendError>;
}

/// [`ModelBackend`] over the Juju hook tools.
#[derive(Clone, Debug, Default)]
pub struct HookTools {
    tools_dir: Option<PathBuf>,
}

impl HookTools {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        Self { tools_dir }
    }

    fn command(&self, tool: &str) -> Command {
        match &self.tools_dir {
            Some(dir) => Command::new(dir.join(tool)),
            None => Command::new(tool),
        }
    }

    async fn run(
        &self,
        tool: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, BackendError> {
        let spawn_err = |source| BackendError::Spawn {
            tool: tool.to_string(),
            source,
        };
        trace!(tool, ?args, "running hook tool");
        let mut cmd = self.command(tool);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(spawn_err)?;
            pipe.shutdown().await.map_err(spawn_err)?;
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;
        if !output.status.success() {
            return Err(BackendError::Tool {
                tool: tool.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn run_json<T: DeserializeOwned>(
        &self,
        tool: &str,
        args: &[&str],
    ) -> Result<T, BackendError> {
        let out = self.run(tool, args, None).await?;
        decode(tool, &out)
    }
}

fn decode<T: DeserializeOwned>(tool: &str, out: &[u8]) -> Result<T, BackendError> {
    serde_json::from_slice(out).map_err(|source| BackendError::Decode {
        tool: tool.to_string(),
        source,
    })
}

#[derive(Deserialize)]
struct StatusOutput {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl ModelBackend for HookTools {
    async fn is_leader(&self) -> Result<bool, BackendError> {
        self.run_json("is-leader", &["--format=json"]).await
    }

    async fn config(&self) -> Result<Map<String, Value>, BackendError> {
        let value: Option<Map<String, Value>> =
            self.run_json("config-get", &["--all", "--format=json"]).await?;
        Ok(value.unwrap_or_default())
    }

    async fn relation_ids(&self, endpoint: &str) -> Result<Vec<String>, BackendError> {
        let ids: Option<Vec<String>> = self
            .run_json("relation-ids", &[endpoint, "--format=json"])
            .await?;
        Ok(ids.unwrap_or_default())
    }

    async fn remote_app(&self, relation_id: &str) -> Result<Option<String>, BackendError> {
        let app: Option<String> = self
            .run_json("relation-list", &["-r", relation_id, "--app", "--format=json"])
            .await?;
        Ok(app.filter(|a| !a.is_empty()))
    }

    async fn relation_get(
        &self,
        relation_id: &str,
        app: &str,
    ) -> Result<Databag, BackendError> {
        let bag: Option<Databag> = self
            .run_json(
                "relation-get",
                &["-r", relation_id, "--app", "-", app, "--format=json"],
            )
            .await?;
        Ok(bag.unwrap_or_default())
    }

    async fn remote_units(&self, relation_id: &str) -> Result<Vec<String>, BackendError> {
        let units: Option<Vec<String>> = self
            .run_json("relation-list", &["-r", relation_id, "--format=json"])
            .await?;
        Ok(units.unwrap_or_default())
    }

    async fn unit_relation_get(
        &self,
        relation_id: &str,
        unit: &str,
    ) -> Result<Databag, BackendError> {
        let bag: Option<Databag> = self
            .run_json("relation-get", &["-r", relation_id, "-", unit, "--format=json"])
            .await?;
        Ok(bag.unwrap_or_default())
    }

    async fn relation_set(
        &self,
        relation_id: &str,
        data: &Databag,
    ) -> Result<(), BackendError> {
        // JSON is valid YAML, which is what --file expects.
        let body = serde_json::to_vec(data).map_err(|source| BackendError::Decode {
            tool: "relation-set".to_string(),
            source,
        })?;
        self.run(
            "relation-set",
            &["-r", relation_id, "--app", "--file", "-"],
            Some(&body),
        )
        .await?;
        debug!(relation_id, keys = data.len(), "relation data written");
        Ok(())
    }

    async fn status_get(&self) -> Result<UnitStatus, BackendError> {
        let out: StatusOutput = self.run_json("status-get", &["--format=json"]).await?;
        Ok(UnitStatus::new(StatusKind::parse(&out.status), out.message))
    }

    async fn status_set(&self, status: &UnitStatus) -> Result<(), BackendError> {
        self.run(
            "status-set",
            &[status.kind.as_str(), status.message.as_str()],
            None,
        )
        .await?;
        Ok(())
    }
}
