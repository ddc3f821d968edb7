use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, header};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::layer::{CheckInfo, Layer};
use crate::supervisor::{PebbleError, ProcessSupervisor};

pub const DEFAULT_SOCKET_DIR: &str = "/charm/containers";
pub const REPLAN_TIMEOUT: Duration = Duration::from_secs(30);

const MULTIPART_BOUNDARY: &str = "charm-pebble-boundary-6d3f1a";

#[derive(Deserialize, Debug)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "status-code")]
    status_code: u16,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    change: Option<String>,
}

/// Pebble API client over the container's unix socket.
pub struct PebbleClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl PebbleClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket: socket.into(),
            client,
        }
    }

    /// Client for `<socket_dir>/<container>/pebble.socket`.
    pub fn for_container(socket_dir: impl AsRef<Path>, container: &str) -> Self {
        Self::new(socket_dir.as_ref().join(container).join("pebble.socket"))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Envelope, PebbleError> {
        let uri: http::Uri = hyperlocal::Uri::new(&self.socket, path).into();
        let mut req = Request::builder().method(method.clone()).uri(uri);
        if let Some(ct) = content_type {
            req = req.header(header::CONTENT_TYPE, ct);
        }
        let req = req
            .body(Full::new(body))
            .map_err(|e| PebbleError::Request(e.to_string()))?;

        trace!(%method, path, "pebble request");
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| PebbleError::Connect(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| PebbleError::Connect(e.to_string()))?
            .to_bytes();

        let envelope: Envelope = serde_json::from_slice(&bytes)?;
        if envelope.kind == "error" || !status.is_success() {
            let message = envelope
                .result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(PebbleError::Api {
                status: envelope.status_code,
                message,
            });
        }
        Ok(envelope)
    }

    async fn get(&self, path: &str) -> Result<Value, PebbleError> {
        Ok(self.call(Method::GET, path, None, Bytes::new()).await?.result)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<Envelope, PebbleError> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        self.call(Method::POST, path, Some("application/json"), body).await
    }

    async fn wait_change(&self, id: &str) -> Result<(), PebbleError> {
        let path = format!(
            "/v1/changes/{id}/wait?timeout={}s",
            REPLAN_TIMEOUT.as_secs()
        );
        let change = self.get(&path).await?;
        if let Some(err) = change.get("err").and_then(Value::as_str) {
            return Err(PebbleError::Change {
                id: id.to_string(),
                message: err.to_string(),
            });
        }
        if change.get("ready").and_then(Value::as_bool) == Some(false) {
            return Err(PebbleError::Change {
                id: id.to_string(),
                message: format!(
                    "not ready after {}s",
                    REPLAN_TIMEOUT.as_secs()
                ),
            });
        }
        debug!(change = %id, "change complete");
        Ok(())
    }
}

fn multipart_write(path: &str, content: &[u8], permissions: u32) -> Result<Bytes, PebbleError> {
    let request = json!({
        "action": "write",
        "files": [{
            "path": path,
            "make-dirs": true,
            "permissions": format!("{permissions:03o}"),
        }],
    });
    let mut body = Vec::with_capacity(content.len() + 512);
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Type: application/json\r\n\
             Content-Disposition: form-data; name=\"request\"\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&serde_json::to_vec(&request)?);
    body.extend_from_slice(
        format!(
            "\r\n--{MULTIPART_BOUNDARY}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: form-data; name=\"files\"; filename=\"{path}\"\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    Ok(Bytes::from(body))
}

#[async_trait]
impl ProcessSupervisor for PebbleClient {
    async fn can_connect(&self) -> bool {
        match self.get("/v1/system-info").await {
            Ok(_) => true,
            Err(err) => {
                debug!(socket = %self.socket.display(), error = %err, "pebble not reachable");
                false
            }
        }
    }

    async fn plan(&self) -> Result<Layer, PebbleError> {
        let result = self.get("/v1/plan?format=yaml").await?;
        let text = result.as_str().unwrap_or_default();
        Ok(Layer::from_yaml(text)?)
    }

    async fn add_layer(
        &self,
        label: &str,
        layer: &Layer,
        combine: bool,
    ) -> Result<(), PebbleError> {
        let body = json!({
            "action": "add",
            "label": label,
            "combine": combine,
            "format": "yaml",
            "layer": layer.to_yaml()?,
        });
        self.post_json("/v1/layers", &body).await?;
        Ok(())
    }

    async fn replan(&self) -> Result<(), PebbleError> {
        let body = json!({"action": "replan", "services": []});
        let envelope = self.post_json("/v1/services", &body).await?;
        match envelope.change {
            Some(id) => self.wait_change(&id).await,
            None => {
                warn!("replan returned no change id");
                Ok(())
            }
        }
    }

    async fn checks(&self, names: &[&str]) -> Result<Vec<CheckInfo>, PebbleError> {
        let path = if names.is_empty() {
            "/v1/checks".to_string()
        } else {
            format!("/v1/checks?names={}", names.join(","))
        };
        let result = self.get(&path).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn push(
        &self,
        path: &str,
        content: &[u8],
        permissions: u32,
    ) -> Result<(), PebbleError> {
        let body = multipart_write(path, content, permissions)?;
        let content_type = format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}");
        let envelope = self
            .call(Method::POST, "/v1/files", Some(&content_type), body)
            .await?;
        // Per-file errors come back inside a successful envelope.
        if let Some(err) = envelope
            .result
            .as_array()
            .and_then(|files| files.first())
            .and_then(|f| f.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return Err(PebbleError::Api {
                status: envelope.status_code,
                message: format!("{path}: {err}"),
            });
        }
        debug!(path, bytes = content.len(), "file pushed");
        Ok(())
    }
}
