//! # switchyard-host — Gateway
//!
//! Thin, stateless pass-through to tool providers. Resolves the provider
//! from the registry, POSTs `{args, capability}` to `{base_url}/{tool}` and
//! measures the wall-clock duration of the exchange. Admission control and
//! outcome recording are the caller's business (see [`crate::broker`]).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_shared::{ServiceDescriptor, SwitchyardError};
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::registry::Registry;

/// Upstream error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub capability: Option<String>,
}

impl GatewayRequest {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args: None,
            capability: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayResponse {
    pub server: String,
    pub tool: String,
    pub duration_ms: u64,
    pub result: Value,
}

pub struct Gateway {
    registry: Arc<Registry>,
    client: reqwest::Client,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, config: &GatewayConfig) -> Result<Self, SwitchyardError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| SwitchyardError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { registry, client })
    }

    /// Resolve the server and perform one call. Unknown servers fail with a
    /// resolution error before anything touches the network.
    pub async fn call(&self, request: &GatewayRequest) -> Result<GatewayResponse, SwitchyardError> {
        let descriptor = self.registry.resolve(&request.server).await?;
        self.call_descriptor(&descriptor, request).await
    }

    /// Perform one call against an already-resolved descriptor.
    pub async fn call_descriptor(
        &self,
        descriptor: &ServiceDescriptor,
        request: &GatewayRequest,
    ) -> Result<GatewayResponse, SwitchyardError> {
        let url = format!("{}/{}", descriptor.base_url, tool_path(&request.tool)?);
        let body = json!({
            "args": request.args.clone().unwrap_or_else(|| json!({})),
            "capability": request.capability,
        });
        let deadline = Duration::from_millis(descriptor.timeout_ms);

        debug!(service = %descriptor.name, tool = %request.tool, url = %url, "Gateway call");

        let started = Instant::now();
        let exchange = async {
            let mut req = self.client.post(&url).json(&body);
            if let Some(token) = &descriptor.auth_token {
                req = req.bearer_auth(token);
            }
            let resp = req.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };
        // Dropping the exchange future on deadline cancels the request.
        let outcome = tokio::time::timeout(deadline, exchange).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let service = descriptor.name.clone();
        let tool = request.tool.clone();
        match outcome {
            Err(_) => {
                warn!(service = %service, tool = %tool, duration_ms, "Gateway call timed out");
                Err(SwitchyardError::Timeout {
                    service,
                    tool,
                    duration_ms,
                })
            }
            Ok(Err(e)) if e.is_timeout() => Err(SwitchyardError::Timeout {
                service,
                tool,
                duration_ms,
            }),
            Ok(Err(e)) => {
                warn!(service = %service, tool = %tool, error = %e, "Gateway transport failure");
                Err(SwitchyardError::Transport {
                    service,
                    tool,
                    duration_ms,
                    message: e.to_string(),
                })
            }
            Ok(Ok((status, text))) if !status.is_success() => {
                warn!(service = %service, tool = %tool, status = status.as_u16(), "Provider returned failure");
                Err(SwitchyardError::Upstream {
                    service,
                    tool,
                    status: status.as_u16(),
                    duration_ms,
                    body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                })
            }
            Ok(Ok((_, text))) => Ok(GatewayResponse {
                server: service,
                tool,
                duration_ms,
                result: parse_body(&text),
            }),
        }
    }
}

/// Tool names map onto URL paths; surrounding slashes are ignored.
fn tool_path(tool: &str) -> Result<&str, SwitchyardError> {
    let path = tool.trim().trim_matches('/');
    if path.is_empty() {
        return Err(SwitchyardError::Invalid("tool name is required".into()));
    }
    // Query, fragment and escape characters would change what the joined URL points at.
    let bad_char =
        |c: char| matches!(c, '?' | '#' | '%' | '\\') || c.is_whitespace() || c.is_control();
    if path.contains(bad_char)
        || path.split('/').any(|seg| seg == ".." || seg == "." || seg.is_empty())
    {
        return Err(SwitchyardError::Invalid(format!("invalid tool path: {tool}")));
    }
    Ok(path)
}

/// JSON when the provider sent JSON, otherwise the raw text as a JSON string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
