use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::correlation::CorrelationId;

/// Wire envelopes exchanged between the host and one plugin worker.
///
/// Framing is one JSON object per line in both directions:
///
/// * host → worker: `{"correlationId": "...", "name": "...", "payload": ...}`
/// * worker → host: `{"correlationId": "...", "payload": ...}` on success,
///   `{"correlationId": "...", "error": "..."}` on failure
///
/// Replies may arrive in any order; pairing is by `correlationId` only.

/// The fixed set of capabilities a plugin may implement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum HookName {
    /// Metadata query; the worker replies with [`PluginInfo`].
    Info,
    /// Content filter over a response body.
    Filter,
    /// Converts foreign data into workspace resources.
    Import,
    /// Converts a request into an external representation.
    Export,
    /// Custom action applied to an HTTP request.
    HttpRequestAction,
}

/// Outbound envelope, host → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookCall {
    pub correlation_id: CorrelationId,
    pub name: HookName,
    pub payload: Value,
}

impl HookCall {
    pub fn new(correlation_id: CorrelationId, name: HookName, payload: Value) -> Self {
        Self { correlation_id, name, payload }
    }
}

/// Inbound envelope, worker → host. Exactly one of the two variants exists
/// per frame; a frame carrying `error` is a failure no matter what else it
/// carries, so `Failure` must stay first in the untagged ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookReply {
    Failure(HookFailure),
    Success(HookSuccess),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSuccess {
    pub correlation_id: CorrelationId,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookFailure {
    pub correlation_id: CorrelationId,
    pub error: String,
}

impl HookReply {
    pub fn success(correlation_id: CorrelationId, payload: Value) -> Self {
        Self::Success(HookSuccess { correlation_id, payload })
    }

    pub fn failure(correlation_id: CorrelationId, error: impl Into<String>) -> Self {
        Self::Failure(HookFailure { correlation_id, error: error.into() })
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::Success(s) => &s.correlation_id,
            Self::Failure(f) => &f.correlation_id,
        }
    }
}

// -----------------------------------------------------------------------------
// Typed hook payloads
// -----------------------------------------------------------------------------
// Workspace models (requests, resources) belong to the host application, so
// they cross this boundary as raw `Value`s; everything the protocol itself
// gives meaning to is typed.

/// Reply payload of the `info` hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Hooks this plugin actually implements.
    pub capabilities: Vec<HookName>,
}

/// Arguments of the `filter` hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterArgs {
    /// Filter expression, e.g. a JSONPath or XPath query.
    pub filter: String,
    pub text: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterResult {
    pub text: String,
}

/// Arguments of the `import` hook: raw file contents or a pasted command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportArgs {
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportResult {
    /// Workspace resources in the host application's export shape.
    pub resources: Value,
}

/// Arguments of the `export` hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportArgs {
    /// The request model to export.
    pub request: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportResult {
    pub content: String,
}

/// Arguments of the `httpRequestAction` hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpRequestActionArgs {
    /// Which of the plugin's actions to run.
    pub action: String,
    pub request: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpRequestActionResult {
    /// The updated request, if the action produced one.
    pub request: Option<Value>,
}
