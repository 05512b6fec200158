//! Wire protocol between the trusted host and an isolated execution unit.
//!
//! Every request carries a unique id; every response or stream event
//! references that id. Events for a single request id are delivered in
//! emission order; nothing is guaranteed across concurrent requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HostError, HostResult};

/// Default deadline for generic request/response exchanges.
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Tool and action execution may legitimately run longer.
pub const EXECUTE_TIMEOUT_MS: u64 = 120_000;
/// How long activation waits for the unit's ready handshake.
pub const READY_TIMEOUT_MS: u64 = 10_000;

/// A message crossing the host/unit boundary, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Unit signals it is up and its runtime is listening.
    Ready,

    /// Host asks the unit to run the extension's activate hook.
    Activate { id: String },

    /// Host asks the unit to run the deactivate hook and clear registries.
    Deactivate { id: String },

    /// Host fans out a settings update; no response expected.
    SettingsChanged { settings: Value },

    /// Host fires the unit's registered scheduler callbacks.
    SchedulerFire {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Host forwards a chat request to a provider registered in the unit.
    ProviderChatRequest {
        id: String,
        provider_id: String,
        request: ChatRequest,
    },

    /// Host asks a registered provider for its model list.
    ProviderModelsRequest { id: String, provider_id: String },

    /// Host asks the unit to execute a registered tool.
    ToolExecuteRequest {
        id: String,
        tool_id: String,
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Host asks the unit to execute a registered action.
    ActionExecuteRequest {
        id: String,
        action_id: String,
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Host asks the unit's task manager to start a registered task.
    TaskStartRequest { id: String, task_id: String },

    /// Host asks the unit's task manager to stop a registered task.
    TaskStopRequest { id: String, task_id: String },

    /// Unit calls back into a host capability.
    CapabilityRequest { id: String, call: CapabilityCall },

    /// Terminal reply to any request, in either direction.
    Response { id: String, result: WireResult },

    /// One streamed event for an in-flight request.
    StreamEvent { id: String, event: StreamEvent },

    /// One chunk of a streaming network fetch, host -> unit.
    /// The next chunk is not sent until this one is acked.
    StreamingFetchChunk {
        stream_id: String,
        seq: u64,
        /// Base64-encoded body bytes; empty on the final frame.
        data: String,
        done: bool,
    },

    /// Unit acknowledges a streaming fetch chunk.
    StreamingFetchAck { stream_id: String, seq: u64 },

    /// Unit relays an extension log line to the host.
    Log { level: LogLevel, message: String },

    /// Unit announces a provider registration.
    ProviderRegistered { provider_id: String, name: String },

    /// Unit announces a tool registration.
    ToolRegistered {
        tool_id: String,
        description: String,
        input_schema: Value,
    },

    /// Unit announces an action registration.
    ActionRegistered { action_id: String, title: String },
}

/// Capability calls an extension can make against the host.
///
/// Operations that exist in both extension scope and user scope carry an
/// optional `user_id`; the context API exposes separate `*_for_user`
/// methods that fill it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum CapabilityCall {
    // Key/value storage
    StorageGet {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    StorageSet {
        key: String,
        value: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    StorageDelete {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    StorageKeys {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    // Document storage
    DocumentPut {
        collection: String,
        id: String,
        data: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentGet {
        collection: String,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentDelete {
        collection: String,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentFind {
        collection: String,
        query: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentFindOne {
        collection: String,
        query: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentCount {
        collection: String,
        query: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentPutMany {
        collection: String,
        documents: Vec<DocumentInput>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentDeleteMany {
        collection: String,
        query: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    DocumentDropCollection {
        collection: String,
    },
    DocumentListCollections,

    // Secrets
    SecretSet {
        key: String,
        value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    SecretGet {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    SecretDelete {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    SecretList {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    // Network
    NetworkFetch {
        request: FetchRequest,
    },
    NetworkFetchStream {
        stream_id: String,
        request: FetchRequest,
    },

    // Raw database access, restricted to the extension's own tables
    DatabaseExecute {
        sql: String,
        params: Vec<Value>,
    },

    // Embedding-application surfaces, fulfilled by the host delegate
    ChatPost {
        role: String,
        content: String,
    },
    UserInfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    // Background tasks
    TaskRegistered {
        config: TaskConfig,
    },
    TaskStopped {
        task_id: String,
    },
    TaskHealth {
        task_id: String,
        healthy: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl CapabilityCall {
    /// The coarse capability gating this call. The runtime only exposes
    /// handles for granted capabilities, but the host re-checks this on
    /// every request regardless.
    pub fn required_capability(&self) -> &'static str {
        use CapabilityCall::*;
        match self {
            StorageGet { .. } | StorageSet { .. } | StorageDelete { .. } | StorageKeys { .. } => {
                "storage"
            }
            DocumentPut { .. }
            | DocumentGet { .. }
            | DocumentDelete { .. }
            | DocumentFind { .. }
            | DocumentFindOne { .. }
            | DocumentCount { .. }
            | DocumentPutMany { .. }
            | DocumentDeleteMany { .. }
            | DocumentDropCollection { .. }
            | DocumentListCollections => "storage.collections",
            SecretSet { .. } | SecretGet { .. } | SecretDelete { .. } | SecretList { .. } => {
                "secrets"
            }
            NetworkFetch { .. } | NetworkFetchStream { .. } => "network",
            DatabaseExecute { .. } => "database",
            ChatPost { .. } => "chat",
            UserInfo { .. } => "user",
            TaskRegistered { .. } | TaskStopped { .. } | TaskHealth { .. } => "scheduler",
        }
    }
}

/// One unit of a terminated sequence of provider/tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking { text: String },
    Content { text: String },
    ToolStart { tool_id: String, payload: Value },
    ToolEnd { tool_id: String, result: Value },
    Done,
    Error { message: String },
}

impl StreamEvent {
    /// Terminal events end the sequence for their request id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

/// Outcome of a request, success or structured failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WireResult {
    Ok { value: Value },
    Err { error: String },
}

impl WireResult {
    pub fn ok(value: Value) -> Self {
        WireResult::Ok { value }
    }

    pub fn err(error: impl std::fmt::Display) -> Self {
        WireResult::Err {
            error: error.to_string(),
        }
    }

    /// Convert back into a host result. Failure payloads come back as
    /// `UnitFailure` since the original error type does not survive the
    /// wire.
    pub fn into_result(self) -> HostResult<Value> {
        match self {
            WireResult::Ok { value } => Ok(value),
            WireResult::Err { error } => Err(HostError::UnitFailure(error)),
        }
    }
}

impl From<HostResult<Value>> for WireResult {
    fn from(result: HostResult<Value>) -> Self {
        match result {
            Ok(value) => WireResult::ok(value),
            Err(err) => WireResult::err(err),
        }
    }
}

/// Log levels relayed from extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A chat message in a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request forwarded to a provider registered by an extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Model advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub context_window: u32,
    #[serde(default)]
    pub supports_streaming: bool,
}

/// HTTP request issued through the network capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP response returned by the network capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// One document in a `put_many` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    pub id: String,
    pub data: Value,
}

/// Background task registration carried over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

/// Declared restart policy. Stored and reported, but no automatic
/// restart loop exists: restarts happen through explicit start requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
}

/// Generate a fresh request id.
pub fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_message_tags() {
        let msg = WireMessage::ToolExecuteRequest {
            id: "r1".into(),
            tool_id: "summarize".into(),
            payload: json!({"text": "hi"}),
            user_id: None,
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "tool-execute-request");
        assert_eq!(encoded["tool_id"], "summarize");
        assert!(encoded.get("user_id").is_none());
    }

    #[test]
    fn test_stream_event_terminal() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::Error {
            message: "boom".into()
        }
        .is_terminal());
        assert!(!StreamEvent::Content { text: "x".into() }.is_terminal());
    }

    #[test]
    fn test_stream_event_tags() {
        let event = StreamEvent::ToolStart {
            tool_id: "t".into(),
            payload: json!({}),
        };
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["type"], "tool_start");
    }

    #[test]
    fn test_wire_result_round_trip() {
        let ok: WireResult = Ok(json!(42)).into();
        assert_eq!(ok.into_result().unwrap(), json!(42));

        let failed: HostResult<Value> = Err(HostError::Timeout("x".into()));
        let err: WireResult = failed.into();
        assert!(err.into_result().is_err());
    }

    #[test]
    fn test_capability_call_gates() {
        let call = CapabilityCall::SecretGet {
            key: "k".into(),
            user_id: None,
        };
        assert_eq!(call.required_capability(), "secrets");

        let call = CapabilityCall::DocumentFind {
            collection: "todos".into(),
            query: json!({}),
            user_id: None,
        };
        assert_eq!(call.required_capability(), "storage.collections");
    }
}
