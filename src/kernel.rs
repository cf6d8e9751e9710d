//! HTTP client for the external Python kernel service.
//!
//! The kernel is a separate process speaking a small REST surface:
//! `/health`, `/execute`, `/variables`, `/restart`, `/interrupt`. Execution
//! failures never escape a cell — they become an error [`CellOutput`].
//!
//! A common misconfiguration is pointing the kernel URL at the collab
//! gateway; its self-description JSON advertises a websocket endpoint, and
//! [`KernelClient::health`] turns that shape into a targeted diagnostic
//! instead of a confusing generic failure.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kernel connection state as surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelStatus {
    #[default]
    Disconnected,
    Loading,
    Starting,
    Idle,
    Busy,
}

/// Output payload kinds the kernel can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Text,
    Plot,
    Table,
    Latex,
    Error,
    Html,
}

/// One cell's execution output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    pub content: String,
    /// Extra mime payloads (e.g. `image/png` for plots).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
}

impl CellOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            output_type: OutputType::Text,
            content: content.into(),
            data: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            output_type: OutputType::Error,
            content: content.into(),
            data: None,
        }
    }
}

/// One entry of the kernel's variable inspector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KernelHealth {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    output: CellOutput,
}

#[derive(Debug, Deserialize)]
struct VariablesResponse {
    #[serde(default)]
    variables: Vec<Variable>,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel unreachable: {0}")]
    Transport(String),
    #[error("kernel returned malformed output: {0}")]
    Malformed(String),
    #[error("{0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for KernelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Does this health-check body look like the collab gateway's
/// self-description rather than a kernel?
pub fn looks_like_collab_gateway(body: &serde_json::Value) -> bool {
    body.get("endpoints")
        .and_then(|e| e.get("websocket"))
        .is_some()
}

/// The remediation shown when the kernel URL points at the gateway.
pub const MISCONFIGURED_KERNEL_MESSAGE: &str = "The kernel URL points at the \
collaboration Worker; set it to your Python kernel server instead.";

/// Thin HTTP client over the kernel REST surface.
pub struct KernelClient {
    http: reqwest::Client,
    base_url: String,
}

impl KernelClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, KernelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe `/health`. Detects the misrouted-to-gateway case.
    pub async fn health(&self) -> Result<KernelHealth, KernelError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KernelError::Transport(format!(
                "health returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KernelError::Malformed(e.to_string()))?;
        if looks_like_collab_gateway(&body) {
            return Err(KernelError::Misconfigured(
                MISCONFIGURED_KERNEL_MESSAGE.to_string(),
            ));
        }
        serde_json::from_value(body).map_err(|e| KernelError::Malformed(e.to_string()))
    }

    /// Execute one cell's code.
    pub async fn execute(&self, code: &str) -> Result<CellOutput, KernelError> {
        let response = self
            .http
            .post(format!("{}/execute", self.base_url))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KernelError::Transport(format!(
                "execute returned {}",
                response.status()
            )));
        }
        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| KernelError::Malformed(e.to_string()))?;
        Ok(body.output)
    }

    pub async fn variables(&self) -> Result<Vec<Variable>, KernelError> {
        let response = self
            .http
            .get(format!("{}/variables", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let body: VariablesResponse = response
            .json()
            .await
            .map_err(|e| KernelError::Malformed(e.to_string()))?;
        Ok(body.variables)
    }

    pub async fn restart(&self) -> Result<(), KernelError> {
        let response = self
            .http
            .post(format!("{}/restart", self.base_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KernelError::Transport(format!(
                "restart returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fire-and-forget interrupt.
    pub fn interrupt(&self) {
        let request = self
            .http
            .post(format!("{}/interrupt", self.base_url))
            .timeout(Duration::from_secs(5));
        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                log::debug!("kernel interrupt failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_output_deserializes_kernel_shapes() {
        let text: CellOutput =
            serde_json::from_value(json!({"type": "text", "content": "42"})).unwrap();
        assert_eq!(text.output_type, OutputType::Text);
        assert_eq!(text.content, "42");
        assert!(text.data.is_none());

        let plot: CellOutput = serde_json::from_value(json!({
            "type": "plot",
            "content": "",
            "data": {"image/png": "aGVsbG8="}
        }))
        .unwrap();
        assert_eq!(plot.output_type, OutputType::Plot);
        assert_eq!(plot.data.unwrap()["image/png"], "aGVsbG8=");

        let error: CellOutput =
            serde_json::from_value(json!({"type": "error", "content": "Traceback..."})).unwrap();
        assert_eq!(error.output_type, OutputType::Error);
    }

    #[test]
    fn test_variable_shape() {
        let v: Variable = serde_json::from_value(json!({
            "name": "df",
            "type": "DataFrame",
            "value": "<df>",
            "size": "(3, 4)"
        }))
        .unwrap();
        assert_eq!(v.type_name, "DataFrame");
        assert_eq!(v.size.as_deref(), Some("(3, 4)"));
    }

    #[test]
    fn test_gateway_self_description_detected() {
        let gateway = json!({
            "ok": true,
            "message": "Notebook collaboration gateway. Connect clients over WebSocket.",
            "endpoints": {"health": "/api/health", "websocket": "/ws/:notebookId"}
        });
        assert!(looks_like_collab_gateway(&gateway));

        let kernel = json!({
            "ok": true,
            "name": "Kernel Server",
            "features": {"matplotlib": true}
        });
        assert!(!looks_like_collab_gateway(&kernel));
    }

    #[test]
    fn test_misconfigured_message_names_both_sides() {
        assert!(MISCONFIGURED_KERNEL_MESSAGE.contains("collaboration Worker"));
        assert!(MISCONFIGURED_KERNEL_MESSAGE.contains("Python kernel server"));
    }
}
