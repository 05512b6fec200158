//! Extension-facing API surface.
//!
//! An [`ExtensionContext`] is handed to extension code on activation.
//! Every capability is an `Option` field: a handle exists only when the
//! manifest requested the matching permission, so ungranted capabilities
//! are unrepresentable in extension code. The host re-checks permissions
//! on every capability request anyway; the gating here is ergonomics,
//! not the security boundary.

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use super::RuntimeShared;
use crate::error::{HostError, HostResult};
use crate::manifest::ExtensionManifest;
use crate::permissions::PermissionChecker;
use crate::protocol::{
    CapabilityCall, ChatRequest, FetchRequest, FetchResponse, ModelInfo, StreamEvent, TaskConfig,
    WireMessage, REQUEST_TIMEOUT_MS,
};
use crate::storage::Document;
use crate::tasks::{BackgroundTaskManager, TaskCallback, TaskSnapshot, TaskStatus};

fn request_timeout() -> Duration {
    Duration::from_millis(REQUEST_TIMEOUT_MS)
}

tokio::task_local! {
    /// User the current dispatch runs on behalf of. Task-local, so
    /// concurrent dispatches carrying different users never observe
    /// each other's scope.
    static CURRENT_USER: Option<String>;
}

/// Run `fut` with the given user as the ambient current user.
pub(crate) async fn scope_user<F>(user: Option<String>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_USER.scope(user, fut).await
}

/// Undoes one registration when disposed. Dropping without calling
/// [`dispose`](Disposable::dispose) leaves the registration in place.
pub struct Disposable {
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposable {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Static facts about the extension instance.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub id: String,
    pub version: String,
    /// Scratch directory reserved for this extension.
    pub storage_path: PathBuf,
}

/// Capability-gated API surface handed to extension code.
pub struct ExtensionContext {
    pub extension: ExtensionInfo,

    pub storage: Option<StorageApi>,
    pub secrets: Option<SecretsApi>,
    pub network: Option<NetworkApi>,
    pub database: Option<DatabaseApi>,
    pub settings: Option<SettingsApi>,
    pub providers: Option<ProviderRegistry>,
    pub tools: Option<ToolRegistry>,
    pub actions: Option<ActionRegistry>,
    pub events: Option<EventBus>,
    pub scheduler: Option<SchedulerApi>,
    pub user: Option<UserApi>,
    pub chat: Option<ChatApi>,
}

impl ExtensionContext {
    pub(crate) fn new(
        manifest: &ExtensionManifest,
        storage_path: PathBuf,
        shared: Arc<RuntimeShared>,
        tasks: Arc<BackgroundTaskManager>,
    ) -> Arc<Self> {
        let checker = PermissionChecker::from_manifest(manifest);

        let storage = checker.has("storage").then(|| StorageApi {
            shared: shared.clone(),
            documents: checker.has("storage.collections").then(|| DocumentsApi {
                shared: shared.clone(),
            }),
        });

        Arc::new(Self {
            extension: ExtensionInfo {
                id: manifest.id().to_string(),
                version: manifest.extension.version.clone(),
                storage_path,
            },
            storage,
            secrets: checker.has("secrets").then(|| SecretsApi {
                shared: shared.clone(),
            }),
            network: checker.has("network").then(|| NetworkApi {
                shared: shared.clone(),
                streams: Arc::new(DashMap::new()),
            }),
            database: checker.has("database").then(|| DatabaseApi {
                shared: shared.clone(),
            }),
            settings: checker.has("settings").then(SettingsApi::new),
            providers: checker.has("providers").then(|| ProviderRegistry {
                entries: Arc::new(DashMap::new()),
                shared: shared.clone(),
            }),
            tools: checker.has("tools").then(|| ToolRegistry {
                entries: Arc::new(DashMap::new()),
                shared: shared.clone(),
            }),
            actions: checker.has("actions").then(|| ActionRegistry {
                entries: Arc::new(DashMap::new()),
                shared: shared.clone(),
            }),
            events: checker.has("events").then(EventBus::new),
            scheduler: checker.has("scheduler").then(|| SchedulerApi {
                callbacks: Arc::new(DashMap::new()),
                next_id: Arc::new(AtomicU64::new(0)),
                tasks,
                shared: shared.clone(),
            }),
            user: checker.has("user").then(|| UserApi {
                shared: shared.clone(),
            }),
            chat: checker.has("chat").then(|| ChatApi { shared }),
        })
    }

    /// User the current invocation runs on behalf of, if any. Scoped to
    /// the dispatch task for scheduler fires and tool/action executions
    /// that carry a user id.
    pub fn current_user(&self) -> Option<String> {
        CURRENT_USER.try_with(Clone::clone).unwrap_or(None)
    }

    /// Drop every registration made through this context. Invoked on
    /// deactivation so a reactivated instance starts clean.
    pub(crate) fn clear_registrations(&self) {
        if let Some(providers) = &self.providers {
            providers.clear();
        }
        if let Some(tools) = &self.tools {
            tools.clear();
        }
        if let Some(actions) = &self.actions {
            actions.clear();
        }
        if let Some(events) = &self.events {
            events.clear();
        }
        if let Some(settings) = &self.settings {
            settings.clear();
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.clear();
        }
    }
}

// ---------------------------------------------------------------------
// Storage

/// Key/value storage scoped to this extension.
pub struct StorageApi {
    shared: Arc<RuntimeShared>,
    /// Document collections; present only with `storage.collections`.
    pub documents: Option<DocumentsApi>,
}

impl StorageApi {
    pub async fn get(&self, key: &str) -> HostResult<Option<Value>> {
        self.get_scoped(None, key).await
    }

    pub async fn get_for_user(&self, user_id: &str, key: &str) -> HostResult<Option<Value>> {
        self.get_scoped(Some(user_id), key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> HostResult<()> {
        self.set_scoped(None, key, value).await
    }

    pub async fn set_for_user(&self, user_id: &str, key: &str, value: Value) -> HostResult<()> {
        self.set_scoped(Some(user_id), key, value).await
    }

    pub async fn delete(&self, key: &str) -> HostResult<bool> {
        self.delete_scoped(None, key).await
    }

    pub async fn delete_for_user(&self, user_id: &str, key: &str) -> HostResult<bool> {
        self.delete_scoped(Some(user_id), key).await
    }

    pub async fn keys(&self) -> HostResult<Vec<String>> {
        self.keys_scoped(None).await
    }

    pub async fn keys_for_user(&self, user_id: &str) -> HostResult<Vec<String>> {
        self.keys_scoped(Some(user_id)).await
    }

    async fn get_scoped(&self, user_id: Option<&str>, key: &str) -> HostResult<Option<Value>> {
        let value = self
            .shared
            .call(
                CapabilityCall::StorageGet {
                    key: key.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "storage.get",
            )
            .await?;
        Ok(match value {
            Value::Null => None,
            other => Some(other),
        })
    }

    async fn set_scoped(&self, user_id: Option<&str>, key: &str, value: Value) -> HostResult<()> {
        self.shared
            .call(
                CapabilityCall::StorageSet {
                    key: key.to_string(),
                    value,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "storage.set",
            )
            .await?;
        Ok(())
    }

    async fn delete_scoped(&self, user_id: Option<&str>, key: &str) -> HostResult<bool> {
        let value = self
            .shared
            .call(
                CapabilityCall::StorageDelete {
                    key: key.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "storage.delete",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn keys_scoped(&self, user_id: Option<&str>) -> HostResult<Vec<String>> {
        let value = self
            .shared
            .call(
                CapabilityCall::StorageKeys {
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "storage.keys",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Document collections declared in the manifest.
pub struct DocumentsApi {
    shared: Arc<RuntimeShared>,
}

impl DocumentsApi {
    pub async fn put(&self, collection: &str, id: &str, data: Value) -> HostResult<Document> {
        self.put_scoped(None, collection, id, data).await
    }

    pub async fn put_for_user(
        &self,
        user_id: &str,
        collection: &str,
        id: &str,
        data: Value,
    ) -> HostResult<Document> {
        self.put_scoped(Some(user_id), collection, id, data).await
    }

    pub async fn get(&self, collection: &str, id: &str) -> HostResult<Option<Document>> {
        self.get_scoped(None, collection, id).await
    }

    pub async fn get_for_user(
        &self,
        user_id: &str,
        collection: &str,
        id: &str,
    ) -> HostResult<Option<Document>> {
        self.get_scoped(Some(user_id), collection, id).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> HostResult<bool> {
        self.delete_scoped(None, collection, id).await
    }

    pub async fn delete_for_user(
        &self,
        user_id: &str,
        collection: &str,
        id: &str,
    ) -> HostResult<bool> {
        self.delete_scoped(Some(user_id), collection, id).await
    }

    /// Run a structured query. `query` accepts either a bare filter or
    /// an envelope with `filter` / `sort` / `limit` / `offset`.
    pub async fn find(&self, collection: &str, query: Value) -> HostResult<Vec<Document>> {
        self.find_scoped(None, collection, query).await
    }

    pub async fn find_for_user(
        &self,
        user_id: &str,
        collection: &str,
        query: Value,
    ) -> HostResult<Vec<Document>> {
        self.find_scoped(Some(user_id), collection, query).await
    }

    pub async fn find_one(&self, collection: &str, query: Value) -> HostResult<Option<Document>> {
        self.find_one_scoped(None, collection, query).await
    }

    pub async fn find_one_for_user(
        &self,
        user_id: &str,
        collection: &str,
        query: Value,
    ) -> HostResult<Option<Document>> {
        self.find_one_scoped(Some(user_id), collection, query).await
    }

    pub async fn count(&self, collection: &str, query: Value) -> HostResult<u64> {
        self.count_scoped(None, collection, query).await
    }

    pub async fn count_for_user(
        &self,
        user_id: &str,
        collection: &str,
        query: Value,
    ) -> HostResult<u64> {
        self.count_scoped(Some(user_id), collection, query).await
    }

    pub async fn put_many(
        &self,
        collection: &str,
        documents: Vec<crate::protocol::DocumentInput>,
    ) -> HostResult<u64> {
        self.put_many_scoped(None, collection, documents).await
    }

    pub async fn put_many_for_user(
        &self,
        user_id: &str,
        collection: &str,
        documents: Vec<crate::protocol::DocumentInput>,
    ) -> HostResult<u64> {
        self.put_many_scoped(Some(user_id), collection, documents)
            .await
    }

    pub async fn delete_many(&self, collection: &str, query: Value) -> HostResult<u64> {
        self.delete_many_scoped(None, collection, query).await
    }

    pub async fn delete_many_for_user(
        &self,
        user_id: &str,
        collection: &str,
        query: Value,
    ) -> HostResult<u64> {
        self.delete_many_scoped(Some(user_id), collection, query)
            .await
    }

    pub async fn drop_collection(&self, collection: &str) -> HostResult<()> {
        self.shared
            .call(
                CapabilityCall::DocumentDropCollection {
                    collection: collection.to_string(),
                },
                request_timeout(),
                "documents.drop_collection",
            )
            .await?;
        Ok(())
    }

    pub async fn list_collections(&self) -> HostResult<Vec<String>> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentListCollections,
                request_timeout(),
                "documents.list_collections",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn put_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        id: &str,
        data: Value,
    ) -> HostResult<Document> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentPut {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    data,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.put",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        id: &str,
    ) -> HostResult<Option<Document>> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentGet {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.get",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        id: &str,
    ) -> HostResult<bool> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentDelete {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.delete",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn find_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        query: Value,
    ) -> HostResult<Vec<Document>> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentFind {
                    collection: collection.to_string(),
                    query,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.find",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn find_one_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        query: Value,
    ) -> HostResult<Option<Document>> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentFindOne {
                    collection: collection.to_string(),
                    query,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.find_one",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn count_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        query: Value,
    ) -> HostResult<u64> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentCount {
                    collection: collection.to_string(),
                    query,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.count",
            )
            .await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    async fn put_many_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        documents: Vec<crate::protocol::DocumentInput>,
    ) -> HostResult<u64> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentPutMany {
                    collection: collection.to_string(),
                    documents,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.put_many",
            )
            .await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    async fn delete_many_scoped(
        &self,
        user_id: Option<&str>,
        collection: &str,
        query: Value,
    ) -> HostResult<u64> {
        let value = self
            .shared
            .call(
                CapabilityCall::DocumentDeleteMany {
                    collection: collection.to_string(),
                    query,
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "documents.delete_many",
            )
            .await?;
        Ok(value.as_u64().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------
// Secrets

/// Encrypted secret storage scoped to this extension.
pub struct SecretsApi {
    shared: Arc<RuntimeShared>,
}

impl SecretsApi {
    pub async fn set(&self, key: &str, value: &str) -> HostResult<()> {
        self.set_scoped(None, key, value).await
    }

    pub async fn set_for_user(&self, user_id: &str, key: &str, value: &str) -> HostResult<()> {
        self.set_scoped(Some(user_id), key, value).await
    }

    pub async fn get(&self, key: &str) -> HostResult<Option<String>> {
        self.get_scoped(None, key).await
    }

    pub async fn get_for_user(&self, user_id: &str, key: &str) -> HostResult<Option<String>> {
        self.get_scoped(Some(user_id), key).await
    }

    pub async fn delete(&self, key: &str) -> HostResult<bool> {
        self.delete_scoped(None, key).await
    }

    pub async fn delete_for_user(&self, user_id: &str, key: &str) -> HostResult<bool> {
        self.delete_scoped(Some(user_id), key).await
    }

    /// Key names only; bulk values never cross the boundary.
    pub async fn list(&self) -> HostResult<Vec<String>> {
        self.list_scoped(None).await
    }

    pub async fn list_for_user(&self, user_id: &str) -> HostResult<Vec<String>> {
        self.list_scoped(Some(user_id)).await
    }

    async fn set_scoped(&self, user_id: Option<&str>, key: &str, value: &str) -> HostResult<()> {
        self.shared
            .call(
                CapabilityCall::SecretSet {
                    key: key.to_string(),
                    value: value.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "secrets.set",
            )
            .await?;
        Ok(())
    }

    async fn get_scoped(&self, user_id: Option<&str>, key: &str) -> HostResult<Option<String>> {
        let value = self
            .shared
            .call(
                CapabilityCall::SecretGet {
                    key: key.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "secrets.get",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_scoped(&self, user_id: Option<&str>, key: &str) -> HostResult<bool> {
        let value = self
            .shared
            .call(
                CapabilityCall::SecretDelete {
                    key: key.to_string(),
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "secrets.delete",
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn list_scoped(&self, user_id: Option<&str>) -> HostResult<Vec<String>> {
        let value = self
            .shared
            .call(
                CapabilityCall::SecretList {
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "secrets.list",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

// ---------------------------------------------------------------------
// Network

/// One decoded chunk of a streaming fetch.
#[derive(Debug, Clone)]
pub struct FetchChunk {
    pub seq: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// Consumer side of a streaming fetch. Chunks arrive in order; the host
/// does not send the next one until the previous is acknowledged, so an
/// unread stream applies backpressure all the way to the socket.
pub struct FetchStream {
    rx: mpsc::Receiver<FetchChunk>,
}

impl FetchStream {
    /// Next chunk, `None` after the final (`done`) chunk or if the
    /// stream was torn down.
    pub async fn next_chunk(&mut self) -> Option<FetchChunk> {
        self.rx.recv().await
    }
}

/// Outbound HTTP through the host.
pub struct NetworkApi {
    shared: Arc<RuntimeShared>,
    streams: Arc<DashMap<String, mpsc::Sender<FetchChunk>>>,
}

impl NetworkApi {
    /// Buffered request/response fetch.
    pub async fn fetch(&self, request: FetchRequest) -> HostResult<FetchResponse> {
        let value = self
            .shared
            .call(
                CapabilityCall::NetworkFetch { request },
                request_timeout(),
                "network.fetch",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Start a streaming fetch. Returns once the host has accepted the
    /// request; body chunks then arrive through the stream.
    pub async fn fetch_stream(&self, request: FetchRequest) -> HostResult<FetchStream> {
        let stream_id = crate::protocol::request_id();
        let (tx, rx) = mpsc::channel(8);
        self.streams.insert(stream_id.clone(), tx);

        let accepted = self
            .shared
            .call(
                CapabilityCall::NetworkFetchStream {
                    stream_id: stream_id.clone(),
                    request,
                },
                request_timeout(),
                "network.fetch_stream",
            )
            .await;
        if let Err(e) = accepted {
            self.streams.remove(&stream_id);
            return Err(e);
        }
        Ok(FetchStream { rx })
    }

    /// Route an incoming chunk to its consumer. Delivery awaits channel
    /// capacity, which is what holds the ack back and produces
    /// end-to-end backpressure. Chunks for unknown or abandoned streams
    /// are dropped.
    pub(crate) async fn deliver_chunk(&self, stream_id: &str, seq: u64, data: &str, done: bool) {
        let decoded = match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(stream = %stream_id, "undecodable fetch chunk: {e}");
                self.streams.remove(stream_id);
                return;
            }
        };

        let tx = match self.streams.get(stream_id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        let delivered = tx
            .send(FetchChunk {
                seq,
                data: decoded,
                done,
            })
            .await;
        if delivered.is_err() || done {
            self.streams.remove(stream_id);
        }
    }
}

// ---------------------------------------------------------------------
// Raw database access

/// Raw SQL against tables owned by this extension.
pub struct DatabaseApi {
    shared: Arc<RuntimeShared>,
}

impl DatabaseApi {
    /// Execute a statement. SELECTs return an array of row objects;
    /// anything else returns `{"rows_affected": n}`. Statements touching
    /// tables outside the extension's own prefix are rejected host-side.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> HostResult<Value> {
        self.shared
            .call(
                CapabilityCall::DatabaseExecute {
                    sql: sql.to_string(),
                    params,
                },
                request_timeout(),
                "database.execute",
            )
            .await
    }
}

// ---------------------------------------------------------------------
// Settings

/// Listener invoked on each settings update with the full new snapshot.
pub type SettingsListener = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Host settings snapshot plus change notifications.
pub struct SettingsApi {
    current: Arc<RwLock<Value>>,
    listeners: Arc<DashMap<u64, SettingsListener>>,
    next_id: Arc<AtomicU64>,
}

impl SettingsApi {
    fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Value::Null)),
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Latest settings snapshot received from the host.
    pub fn current(&self) -> Value {
        self.current.read().unwrap().clone()
    }

    pub fn on_change(&self, listener: SettingsListener) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        let listeners = self.listeners.clone();
        Disposable::new(move || {
            listeners.remove(&id);
        })
    }

    /// Apply an update and fan it out. Listeners run to completion one
    /// after another; a slow listener delays the rest but the host is
    /// not waiting on any of them.
    pub(crate) async fn apply(&self, settings: Value) {
        *self.current.write().unwrap() = settings.clone();
        let listeners: Vec<SettingsListener> =
            self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener(settings.clone()).await;
        }
    }

    fn clear(&self) {
        self.listeners.clear();
    }
}

// ---------------------------------------------------------------------
// Providers

/// Emits stream events for one in-flight chat request.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<RuntimeShared>,
    request_id: String,
}

impl EventSink {
    pub(crate) fn new(shared: Arc<RuntimeShared>, request_id: String) -> Self {
        Self { shared, request_id }
    }

    pub async fn emit(&self, event: StreamEvent) -> HostResult<()> {
        self.shared
            .notify(WireMessage::StreamEvent {
                id: self.request_id.clone(),
                event,
            })
            .await
    }
}

/// A chat model provider implemented by an extension.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Handle one chat request, emitting events through the sink. The
    /// runtime emits the terminal event from the return value, so
    /// implementations only stream content.
    async fn chat(&self, request: ChatRequest, events: EventSink) -> anyhow::Result<()>;

    /// Models this provider serves.
    async fn models(&self) -> anyhow::Result<Vec<ModelInfo>>;
}

/// Providers registered by this extension instance.
pub struct ProviderRegistry {
    entries: Arc<DashMap<String, Arc<dyn ChatProvider>>>,
    shared: Arc<RuntimeShared>,
}

impl ProviderRegistry {
    pub async fn register(
        &self,
        provider_id: &str,
        provider: Arc<dyn ChatProvider>,
    ) -> HostResult<Disposable> {
        if self.entries.contains_key(provider_id) {
            return Err(HostError::InvalidInput(format!(
                "provider '{provider_id}' already registered"
            )));
        }
        let name = provider.name().to_string();
        self.entries.insert(provider_id.to_string(), provider);
        self.shared
            .notify(WireMessage::ProviderRegistered {
                provider_id: provider_id.to_string(),
                name,
            })
            .await?;

        let entries = self.entries.clone();
        let id = provider_id.to_string();
        Ok(Disposable::new(move || {
            entries.remove(&id);
        }))
    }

    pub(crate) fn get(&self, provider_id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.entries.get(provider_id).map(|e| e.value().clone())
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------
// Tools and actions

/// Async tool body: payload in, JSON result out.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Tools registered by this extension instance.
pub struct ToolRegistry {
    entries: Arc<DashMap<String, ToolEntry>>,
    shared: Arc<RuntimeShared>,
}

struct ToolEntry {
    handler: ToolHandler,
}

impl ToolRegistry {
    pub async fn register(
        &self,
        tool_id: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) -> HostResult<Disposable> {
        if self.entries.contains_key(tool_id) {
            return Err(HostError::InvalidInput(format!(
                "tool '{tool_id}' already registered"
            )));
        }
        self.entries
            .insert(tool_id.to_string(), ToolEntry { handler });
        self.shared
            .notify(WireMessage::ToolRegistered {
                tool_id: tool_id.to_string(),
                description: description.to_string(),
                input_schema,
            })
            .await?;

        let entries = self.entries.clone();
        let id = tool_id.to_string();
        Ok(Disposable::new(move || {
            entries.remove(&id);
        }))
    }

    pub(crate) fn handler(&self, tool_id: &str) -> Option<ToolHandler> {
        self.entries.get(tool_id).map(|e| e.handler.clone())
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// Actions registered by this extension instance. Same execution shape
/// as tools; actions are user-triggered rather than model-triggered.
pub struct ActionRegistry {
    entries: Arc<DashMap<String, ToolHandler>>,
    shared: Arc<RuntimeShared>,
}

impl ActionRegistry {
    pub async fn register(
        &self,
        action_id: &str,
        title: &str,
        handler: ToolHandler,
    ) -> HostResult<Disposable> {
        if self.entries.contains_key(action_id) {
            return Err(HostError::InvalidInput(format!(
                "action '{action_id}' already registered"
            )));
        }
        self.entries.insert(action_id.to_string(), handler);
        self.shared
            .notify(WireMessage::ActionRegistered {
                action_id: action_id.to_string(),
                title: title.to_string(),
            })
            .await?;

        let entries = self.entries.clone();
        let id = action_id.to_string();
        Ok(Disposable::new(move || {
            entries.remove(&id);
        }))
    }

    pub(crate) fn handler(&self, action_id: &str) -> Option<ToolHandler> {
        self.entries.get(action_id).map(|e| e.value().clone())
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------
// Local events

/// Handler for a locally emitted event.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-process pub/sub between parts of one extension. Nothing crosses
/// the host boundary.
pub struct EventBus {
    handlers: Arc<DashMap<String, Vec<(u64, EventHandler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn on(&self, event: &str, handler: EventHandler) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));

        let handlers = self.handlers.clone();
        let event = event.to_string();
        Disposable::new(move || {
            if let Some(mut entry) = handlers.get_mut(&event) {
                entry.retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    pub async fn emit(&self, event: &str, payload: Value) {
        let snapshot: Vec<EventHandler> = match self.handlers.get(event) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(payload.clone()).await;
        }
    }

    fn clear(&self) {
        self.handlers.clear();
    }
}

// ---------------------------------------------------------------------
// Scheduler and background tasks

/// Callback invoked on each scheduler fire with the optional user id.
pub type ScheduleCallback =
    Arc<dyn Fn(Option<String>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Scheduler fires plus background task registration.
pub struct SchedulerApi {
    callbacks: Arc<DashMap<u64, ScheduleCallback>>,
    next_id: Arc<AtomicU64>,
    tasks: Arc<BackgroundTaskManager>,
    shared: Arc<RuntimeShared>,
}

impl SchedulerApi {
    pub fn on_fire(&self, callback: ScheduleCallback) -> Disposable {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(id, callback);
        let callbacks = self.callbacks.clone();
        Disposable::new(move || {
            callbacks.remove(&id);
        })
    }

    /// Register a background task with the supervisor and announce it to
    /// the host.
    pub async fn register_task(
        &self,
        config: TaskConfig,
        callback: TaskCallback,
    ) -> HostResult<()> {
        self.tasks.register(config.clone(), callback)?;
        self.shared
            .call(
                CapabilityCall::TaskRegistered { config },
                request_timeout(),
                "task.registered",
            )
            .await?;
        Ok(())
    }

    /// Stop a task locally and notify the host.
    pub async fn stop_task(&self, task_id: &str) -> HostResult<TaskStatus> {
        let status = self.tasks.stop(task_id).await?;
        self.shared
            .call(
                CapabilityCall::TaskStopped {
                    task_id: task_id.to_string(),
                },
                request_timeout(),
                "task.stopped",
            )
            .await?;
        Ok(status)
    }

    /// Report a task's health to the host catalog.
    pub async fn report_health(
        &self,
        task_id: &str,
        healthy: bool,
        detail: Option<String>,
    ) -> HostResult<()> {
        self.shared
            .call(
                CapabilityCall::TaskHealth {
                    task_id: task_id.to_string(),
                    healthy,
                    detail,
                },
                request_timeout(),
                "task.health",
            )
            .await?;
        Ok(())
    }

    /// Snapshot of every task registered in this instance.
    pub fn task_snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks.snapshot()
    }

    /// Run every registered callback concurrently. Individual failures
    /// are logged and counted, never propagated.
    pub(crate) async fn fire(&self, user_id: Option<String>) -> (usize, usize) {
        let callbacks: Vec<ScheduleCallback> =
            self.callbacks.iter().map(|e| e.value().clone()).collect();
        if callbacks.is_empty() {
            return (0, 0);
        }

        let runs = callbacks
            .into_iter()
            .map(|callback| callback(user_id.clone()));
        let results = futures::future::join_all(runs).await;

        let mut succeeded = 0;
        let mut failed = 0;
        for result in results {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!("scheduler callback failed: {e}");
                }
            }
        }
        (succeeded, failed)
    }

    fn clear(&self) {
        self.callbacks.clear();
    }
}

// ---------------------------------------------------------------------
// Embedding-application surfaces

/// User profile lookups, fulfilled by the embedding application.
pub struct UserApi {
    shared: Arc<RuntimeShared>,
}

impl UserApi {
    pub async fn info(&self, user_id: Option<&str>) -> HostResult<Value> {
        self.shared
            .call(
                CapabilityCall::UserInfo {
                    user_id: user_id.map(String::from),
                },
                request_timeout(),
                "user.info",
            )
            .await
    }
}

/// Posting into the host chat surface.
pub struct ChatApi {
    shared: Arc<RuntimeShared>,
}

impl ChatApi {
    pub async fn post(&self, role: &str, content: &str) -> HostResult<Value> {
        self.shared
            .call(
                CapabilityCall::ChatPost {
                    role: role.to_string(),
                    content: content.to_string(),
                },
                request_timeout(),
                "chat.post",
            )
            .await
    }
}
