//! Trusted host side.
//!
//! The [`ExtensionHost`] loads manifests, starts one isolated worker per
//! extension, and owns every privileged resource: storage, secrets, the
//! network, and the embedding application's surfaces. Workers talk to it
//! only through the wire protocol, and every capability request is
//! permission-checked here no matter what the worker-side runtime
//! already enforced.

mod network;
mod stream;

pub use network::{check_network_access, NetworkService};
pub use stream::EventStream;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::manifest::ExtensionManifest;
use crate::pending::PendingRequests;
use crate::permissions::{validate_user_id, PermissionChecker};
use crate::protocol::{
    request_id, CapabilityCall, ChatRequest, LogLevel, ModelInfo, StreamEvent, TaskConfig,
    WireMessage, WireResult,
};
use crate::runtime::{Extension, ExtensionRuntime};
use crate::secrets::SecretsManager;
use crate::storage::{query::parse_query, StorageEngine};
use crate::transport::{ChannelTransport, Transport};

const READY_KEY: &str = "__ready__";

/// Starts and stops the isolated worker for an extension. The host does
/// not care whether that is an in-process task or a child process.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start the worker and hand back the host side of its transport.
    async fn start(
        &self,
        manifest: &ExtensionManifest,
        storage_path: &Path,
    ) -> HostResult<Arc<dyn Transport>>;

    /// Tear the worker down.
    async fn stop(&self, extension_id: &str) -> HostResult<()>;
}

/// Builds the extension object for an in-process worker.
pub type ExtensionFactory =
    Arc<dyn Fn(&ExtensionManifest) -> HostResult<Arc<dyn Extension>> + Send + Sync>;

/// Runs each extension as a tokio task inside the host process. The
/// isolation is the protocol boundary, not an OS boundary; use a
/// process transport for untrusted code.
pub struct TaskWorkerSpawner {
    factory: ExtensionFactory,
    running: DashMap<String, JoinHandle<()>>,
    channel_capacity: usize,
}

impl TaskWorkerSpawner {
    pub fn new(factory: ExtensionFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            running: DashMap::new(),
            channel_capacity: 64,
        })
    }
}

#[async_trait]
impl WorkerSpawner for TaskWorkerSpawner {
    async fn start(
        &self,
        manifest: &ExtensionManifest,
        storage_path: &Path,
    ) -> HostResult<Arc<dyn Transport>> {
        let extension = (self.factory)(manifest)?;
        let (host_side, unit_side) = ChannelTransport::pair(self.channel_capacity);
        let runtime = ExtensionRuntime::new(
            extension,
            manifest,
            Arc::new(unit_side),
            storage_path.to_path_buf(),
        );
        let handle = tokio::spawn(runtime.run());
        if let Some(prior) = self.running.insert(manifest.id().to_string(), handle) {
            prior.abort();
        }
        Ok(Arc::new(host_side))
    }

    async fn stop(&self, extension_id: &str) -> HostResult<()> {
        if let Some((_, handle)) = self.running.remove(extension_id) {
            handle.abort();
        }
        Ok(())
    }
}

/// Surfaces the embedding application fulfills on behalf of extensions.
/// Defaults are inert so a host without an application shell still runs.
#[async_trait]
pub trait HostDelegate: Send + Sync + 'static {
    /// `chat` capability: post a message into the application's chat.
    async fn chat_post(
        &self,
        _extension_id: &str,
        _role: &str,
        _content: &str,
    ) -> HostResult<Value> {
        Ok(Value::Null)
    }

    /// `user` capability: profile lookup for the given user.
    async fn user_info(&self, _extension_id: &str, _user_id: Option<&str>) -> HostResult<Value> {
        Ok(Value::Null)
    }
}

struct NoopDelegate;

#[async_trait]
impl HostDelegate for NoopDelegate {}

/// Host-side notifications about loaded extensions.
#[derive(Debug, Clone)]
pub enum HostEvent {
    ExtensionLoaded {
        extension_id: String,
    },
    ExtensionUnloaded {
        extension_id: String,
    },
    /// The worker died or misbehaved.
    ExtensionError {
        extension_id: String,
        message: String,
    },
    Log {
        extension_id: String,
        level: LogLevel,
        message: String,
    },
    ProviderRegistered {
        extension_id: String,
        provider_id: String,
        name: String,
    },
    ToolRegistered {
        extension_id: String,
        tool_id: String,
        description: String,
    },
    ActionRegistered {
        extension_id: String,
        action_id: String,
        title: String,
    },
}

/// A provider announced by a loaded extension.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub provider_id: String,
    pub name: String,
}

/// A tool announced by a loaded extension.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool_id: String,
    pub description: String,
    pub input_schema: Value,
}

/// An action announced by a loaded extension.
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub action_id: String,
    pub title: String,
}

/// Host-side record of a background task the worker registered.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub config: TaskConfig,
    pub healthy: Option<bool>,
    pub stopped: bool,
}

/// Result of a tool or action execution. Handler failures inside the
/// extension come back structured, not as transport errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    fn succeeded(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

struct HostShared {
    config: HostConfig,
    storage: Arc<StorageEngine>,
    secrets: Arc<SecretsManager>,
    network: NetworkService,
    delegate: Arc<dyn HostDelegate>,
    events_tx: broadcast::Sender<HostEvent>,
}

struct LoadedExtension {
    manifest: ExtensionManifest,
    checker: PermissionChecker,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
    streams: DashMap<String, mpsc::Sender<StreamEvent>>,
    providers: DashMap<String, ProviderInfo>,
    tools: DashMap<String, ToolInfo>,
    actions: DashMap<String, ActionInfo>,
    tasks: DashMap<String, TaskRecord>,
    unloading: AtomicBool,
}

impl LoadedExtension {
    fn id(&self) -> &str {
        self.manifest.id()
    }
}

/// The trusted coordinator for all loaded extensions.
pub struct ExtensionHost {
    shared: Arc<HostShared>,
    spawner: Arc<dyn WorkerSpawner>,
    extensions: DashMap<String, Arc<LoadedExtension>>,
}

impl ExtensionHost {
    /// Open the host's databases and prepare for loading extensions.
    pub fn new(config: HostConfig, spawner: Arc<dyn WorkerSpawner>) -> HostResult<Self> {
        Self::with_delegate(config, spawner, Arc::new(NoopDelegate))
    }

    pub fn with_delegate(
        config: HostConfig,
        spawner: Arc<dyn WorkerSpawner>,
        delegate: Arc<dyn HostDelegate>,
    ) -> HostResult<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| HostError::InvalidInput(format!("cannot create data dir: {e}")))?;
        let storage = Arc::new(StorageEngine::open(&config.storage_db_path())?);
        let secrets = Arc::new(SecretsManager::open(
            &config.secrets_db_path(),
            &config.master_secret,
        )?);
        let (events_tx, _) = broadcast::channel(256);

        Ok(Self {
            shared: Arc::new(HostShared {
                config,
                storage,
                secrets,
                network: NetworkService::new(),
                delegate,
                events_tx,
            }),
            spawner,
            extensions: DashMap::new(),
        })
    }

    /// Load an extension: provision its collections, start its worker,
    /// wait for the ready handshake, and activate it.
    pub async fn load(&self, manifest: ExtensionManifest) -> HostResult<()> {
        manifest
            .validate()
            .map_err(|e| HostError::InvalidInput(format!("{e:#}")))?;
        let extension_id = manifest.id().to_string();
        if self.extensions.contains_key(&extension_id) {
            return Err(HostError::InvalidInput(format!(
                "extension '{extension_id}' is already loaded"
            )));
        }

        let checker = PermissionChecker::from_manifest(&manifest);
        if checker.has("storage.collections") {
            for (name, fields) in &manifest.collections {
                self.shared
                    .storage
                    .ensure_collection(&extension_id, name, fields)?;
            }
        }

        let storage_path = self.shared.config.extension_storage_path(&extension_id);
        std::fs::create_dir_all(&storage_path)
            .map_err(|e| HostError::InvalidInput(format!("cannot create storage path: {e}")))?;

        let transport = self.spawner.start(&manifest, &storage_path).await?;
        let pending = PendingRequests::new();
        // Registered before the receive loop starts, so an instantly
        // ready worker cannot race the handshake.
        let ready = pending.create(READY_KEY, self.shared.config.ready_timeout(), "ready handshake");

        let ext = Arc::new(LoadedExtension {
            manifest,
            checker,
            transport,
            pending,
            streams: DashMap::new(),
            providers: DashMap::new(),
            tools: DashMap::new(),
            actions: DashMap::new(),
            tasks: DashMap::new(),
            unloading: AtomicBool::new(false),
        });
        tokio::spawn(run_unit_loop(self.shared.clone(), ext.clone()));

        if let Err(e) = ready.await {
            ext.unloading.store(true, Ordering::SeqCst);
            let _ = self.spawner.stop(&extension_id).await;
            return Err(e);
        }

        let rid = request_id();
        let activated = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "activate");
        let sent = ext.transport.send(WireMessage::Activate { id: rid }).await;
        let activation = match sent {
            Ok(()) => activated.await,
            Err(e) => Err(e),
        };
        if let Err(e) = activation {
            ext.unloading.store(true, Ordering::SeqCst);
            let _ = self.spawner.stop(&extension_id).await;
            ext.pending.cancel_all();
            return Err(e);
        }

        self.extensions.insert(extension_id.clone(), ext);
        let _ = self
            .shared
            .events_tx
            .send(HostEvent::ExtensionLoaded { extension_id });
        Ok(())
    }

    /// Deactivate and tear down an extension. Deactivation failures are
    /// logged, never fatal; the worker goes away regardless.
    pub async fn unload(&self, extension_id: &str) -> HostResult<()> {
        let (_, ext) = self
            .extensions
            .remove(extension_id)
            .ok_or_else(|| HostError::not_found("extension", extension_id))?;
        ext.unloading.store(true, Ordering::SeqCst);

        let rid = request_id();
        let deactivated = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "deactivate");
        match ext.transport.send(WireMessage::Deactivate { id: rid }).await {
            Ok(()) => {
                if let Err(e) = deactivated.await {
                    tracing::warn!(extension = %extension_id, "deactivation failed: {e}");
                }
            }
            Err(e) => tracing::warn!(extension = %extension_id, "deactivate not delivered: {e}"),
        }

        self.spawner.stop(extension_id).await?;
        ext.pending.cancel_all();
        let _ = self.shared.events_tx.send(HostEvent::ExtensionUnloaded {
            extension_id: extension_id.to_string(),
        });
        Ok(())
    }

    /// Execute a registered tool. Unknown extensions and tools are typed
    /// errors; handler failures come back as a failed outcome.
    pub async fn execute_tool(
        &self,
        extension_id: &str,
        tool_id: &str,
        payload: Value,
        user_id: Option<&str>,
    ) -> HostResult<ExecutionOutcome> {
        let ext = self.get(extension_id)?;
        if !ext.tools.contains_key(tool_id) {
            return Err(HostError::not_found("tool", tool_id));
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.execute_timeout(), "tool execute");
        ext.transport
            .send(WireMessage::ToolExecuteRequest {
                id: rid,
                tool_id: tool_id.to_string(),
                payload,
                user_id: user_id.map(String::from),
            })
            .await?;

        match response.await {
            Ok(value) => Ok(ExecutionOutcome::succeeded(value)),
            Err(HostError::UnitFailure(message)) => Ok(ExecutionOutcome::failed(message)),
            Err(other) => Err(other),
        }
    }

    /// Execute a registered action. Same semantics as tools.
    pub async fn execute_action(
        &self,
        extension_id: &str,
        action_id: &str,
        payload: Value,
        user_id: Option<&str>,
    ) -> HostResult<ExecutionOutcome> {
        let ext = self.get(extension_id)?;
        if !ext.actions.contains_key(action_id) {
            return Err(HostError::not_found("action", action_id));
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.execute_timeout(), "action execute");
        ext.transport
            .send(WireMessage::ActionExecuteRequest {
                id: rid,
                action_id: action_id.to_string(),
                payload,
                user_id: user_id.map(String::from),
            })
            .await?;

        match response.await {
            Ok(value) => Ok(ExecutionOutcome::succeeded(value)),
            Err(HostError::UnitFailure(message)) => Ok(ExecutionOutcome::failed(message)),
            Err(other) => Err(other),
        }
    }

    /// Forward a chat request to a provider and return its event stream.
    pub async fn chat(
        &self,
        extension_id: &str,
        provider_id: &str,
        request: ChatRequest,
    ) -> HostResult<EventStream> {
        let ext = self.get(extension_id)?;
        if !ext.providers.contains_key(provider_id) {
            return Err(HostError::not_found("provider", provider_id));
        }

        let rid = request_id();
        let (tx, rx) = mpsc::channel(self.shared.config.stream_buffer);
        ext.streams.insert(rid.clone(), tx);
        let sent = ext
            .transport
            .send(WireMessage::ProviderChatRequest {
                id: rid.clone(),
                provider_id: provider_id.to_string(),
                request,
            })
            .await;
        if let Err(e) = sent {
            ext.streams.remove(&rid);
            return Err(e);
        }
        Ok(EventStream::new(rx))
    }

    /// Ask a provider for its model list.
    pub async fn models(
        &self,
        extension_id: &str,
        provider_id: &str,
    ) -> HostResult<Vec<ModelInfo>> {
        let ext = self.get(extension_id)?;
        if !ext.providers.contains_key(provider_id) {
            return Err(HostError::not_found("provider", provider_id));
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "provider models");
        ext.transport
            .send(WireMessage::ProviderModelsRequest {
                id: rid,
                provider_id: provider_id.to_string(),
            })
            .await?;
        Ok(serde_json::from_value(response.await?)?)
    }

    /// Fire the extension's scheduler callbacks. Returns the success and
    /// failure counts the worker reported.
    pub async fn fire_scheduler(
        &self,
        extension_id: &str,
        user_id: Option<&str>,
    ) -> HostResult<Value> {
        let ext = self.get(extension_id)?;
        if let Some(user) = user_id {
            validate_user_id(user).map_err(|e| HostError::InvalidInput(e.to_string()))?;
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "scheduler fire");
        ext.transport
            .send(WireMessage::SchedulerFire {
                id: rid,
                user_id: user_id.map(String::from),
            })
            .await?;
        response.await
    }

    /// Push a settings snapshot to one extension, or to all of them.
    pub async fn update_settings(
        &self,
        extension_id: Option<&str>,
        settings: Value,
    ) -> HostResult<()> {
        match extension_id {
            Some(id) => {
                let ext = self.get(id)?;
                ext.transport
                    .send(WireMessage::SettingsChanged { settings })
                    .await
            }
            None => {
                let targets: Vec<Arc<LoadedExtension>> =
                    self.extensions.iter().map(|e| e.value().clone()).collect();
                for ext in targets {
                    if let Err(e) = ext
                        .transport
                        .send(WireMessage::SettingsChanged {
                            settings: settings.clone(),
                        })
                        .await
                    {
                        tracing::warn!(extension = %ext.id(), "settings push failed: {e}");
                    }
                }
                Ok(())
            }
        }
    }

    /// Start a background task the extension registered.
    pub async fn start_task(&self, extension_id: &str, task_id: &str) -> HostResult<()> {
        let ext = self.get(extension_id)?;
        if !ext.tasks.contains_key(task_id) {
            return Err(HostError::not_found("task", task_id));
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "task start");
        ext.transport
            .send(WireMessage::TaskStartRequest {
                id: rid,
                task_id: task_id.to_string(),
            })
            .await?;
        response.await?;
        if let Some(mut record) = ext.tasks.get_mut(task_id) {
            record.stopped = false;
        }
        Ok(())
    }

    /// Stop a background task.
    pub async fn stop_task(&self, extension_id: &str, task_id: &str) -> HostResult<()> {
        let ext = self.get(extension_id)?;
        if !ext.tasks.contains_key(task_id) {
            return Err(HostError::not_found("task", task_id));
        }

        let rid = request_id();
        let response = ext
            .pending
            .create(&rid, self.shared.config.request_timeout(), "task stop");
        ext.transport
            .send(WireMessage::TaskStopRequest {
                id: rid,
                task_id: task_id.to_string(),
            })
            .await?;
        response.await?;
        if let Some(mut record) = ext.tasks.get_mut(task_id) {
            record.stopped = true;
        }
        Ok(())
    }

    pub fn is_loaded(&self, extension_id: &str) -> bool {
        self.extensions.contains_key(extension_id)
    }

    pub fn loaded_extensions(&self) -> Vec<String> {
        self.extensions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn providers(&self, extension_id: &str) -> HostResult<Vec<ProviderInfo>> {
        let ext = self.get(extension_id)?;
        Ok(ext.providers.iter().map(|e| e.value().clone()).collect())
    }

    pub fn tools(&self, extension_id: &str) -> HostResult<Vec<ToolInfo>> {
        let ext = self.get(extension_id)?;
        Ok(ext.tools.iter().map(|e| e.value().clone()).collect())
    }

    pub fn actions(&self, extension_id: &str) -> HostResult<Vec<ActionInfo>> {
        let ext = self.get(extension_id)?;
        Ok(ext.actions.iter().map(|e| e.value().clone()).collect())
    }

    pub fn tasks(&self, extension_id: &str) -> HostResult<Vec<TaskRecord>> {
        let ext = self.get(extension_id)?;
        Ok(ext.tasks.iter().map(|e| e.value().clone()).collect())
    }

    /// Subscribe to host events. Slow subscribers miss events rather
    /// than blocking the host.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Direct handle on the storage engine, for the embedding
    /// application's own bookkeeping.
    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.shared.storage
    }

    pub fn secrets(&self) -> &Arc<SecretsManager> {
        &self.shared.secrets
    }

    fn get(&self, extension_id: &str) -> HostResult<Arc<LoadedExtension>> {
        self.extensions
            .get(extension_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| HostError::not_found("extension", extension_id))
    }
}

/// Serve one worker's messages until its transport closes.
async fn run_unit_loop(shared: Arc<HostShared>, ext: Arc<LoadedExtension>) {
    while let Some(message) = ext.transport.recv().await {
        match message {
            WireMessage::Ready => {
                if !ext.pending.resolve(READY_KEY, Value::Null) {
                    tracing::warn!(extension = %ext.id(), "unexpected ready message");
                }
            }

            WireMessage::Response { id, result } => {
                let settled = match result {
                    WireResult::Ok { value } => ext.pending.resolve(&id, value),
                    WireResult::Err { error } => {
                        ext.pending.reject(&id, HostError::UnitFailure(error))
                    }
                };
                if !settled {
                    tracing::debug!(extension = %ext.id(), "late response for {id} dropped");
                }
            }

            WireMessage::StreamEvent { id, event } => {
                let tx = ext.streams.get(&id).map(|e| e.value().clone());
                if let Some(tx) = tx {
                    let terminal = event.is_terminal();
                    let delivered = tx.send(event).await;
                    if terminal || delivered.is_err() {
                        ext.streams.remove(&id);
                    }
                } else {
                    tracing::debug!(extension = %ext.id(), "event for unknown stream {id}");
                }
            }

            WireMessage::CapabilityRequest { id, call } => {
                let shared = shared.clone();
                let ext = ext.clone();
                tokio::spawn(async move {
                    let result = fulfill(&shared, &ext, call).await;
                    if let Err(e) = &result {
                        tracing::debug!(extension = %ext.id(), "capability request failed: {e}");
                    }
                    let response = WireMessage::Response {
                        id,
                        result: result.into(),
                    };
                    if let Err(e) = ext.transport.send(response).await {
                        tracing::warn!(extension = %ext.id(), "capability response lost: {e}");
                    }
                });
            }

            WireMessage::StreamingFetchAck { stream_id, seq } => {
                ext.pending.resolve(&ack_key(&stream_id, seq), Value::Null);
            }

            WireMessage::Log { level, message } => {
                match level {
                    LogLevel::Debug => tracing::debug!(extension = %ext.id(), "{message}"),
                    LogLevel::Info => tracing::info!(extension = %ext.id(), "{message}"),
                    LogLevel::Warn => tracing::warn!(extension = %ext.id(), "{message}"),
                    LogLevel::Error => tracing::error!(extension = %ext.id(), "{message}"),
                }
                let _ = shared.events_tx.send(HostEvent::Log {
                    extension_id: ext.id().to_string(),
                    level,
                    message,
                });
            }

            WireMessage::ProviderRegistered { provider_id, name } => {
                ext.providers.insert(
                    provider_id.clone(),
                    ProviderInfo {
                        provider_id: provider_id.clone(),
                        name: name.clone(),
                    },
                );
                let _ = shared.events_tx.send(HostEvent::ProviderRegistered {
                    extension_id: ext.id().to_string(),
                    provider_id,
                    name,
                });
            }

            WireMessage::ToolRegistered {
                tool_id,
                description,
                input_schema,
            } => {
                ext.tools.insert(
                    tool_id.clone(),
                    ToolInfo {
                        tool_id: tool_id.clone(),
                        description: description.clone(),
                        input_schema,
                    },
                );
                let _ = shared.events_tx.send(HostEvent::ToolRegistered {
                    extension_id: ext.id().to_string(),
                    tool_id,
                    description,
                });
            }

            WireMessage::ActionRegistered { action_id, title } => {
                ext.actions.insert(
                    action_id.clone(),
                    ActionInfo {
                        action_id: action_id.clone(),
                        title: title.clone(),
                    },
                );
                let _ = shared.events_tx.send(HostEvent::ActionRegistered {
                    extension_id: ext.id().to_string(),
                    action_id,
                    title,
                });
            }

            other => {
                tracing::warn!(extension = %ext.id(), "unexpected message from worker: {other:?}");
            }
        }
    }

    if ext.unloading.load(Ordering::SeqCst) {
        ext.pending.cancel_all();
        return;
    }

    // The worker died with work in flight: fail the waiters, close the
    // streams with an error, and tell subscribers.
    tracing::warn!(extension = %ext.id(), "worker exited unexpectedly");
    ext.pending.fail_all("extension worker exited");
    let stream_ids: Vec<String> = ext.streams.iter().map(|e| e.key().clone()).collect();
    for stream_id in stream_ids {
        if let Some((_, tx)) = ext.streams.remove(&stream_id) {
            let _ = tx
                .send(StreamEvent::Error {
                    message: "extension worker exited".into(),
                })
                .await;
        }
    }
    let _ = shared.events_tx.send(HostEvent::ExtensionError {
        extension_id: ext.id().to_string(),
        message: "extension worker exited".into(),
    });
}

fn ack_key(stream_id: &str, seq: u64) -> String {
    format!("ack:{stream_id}:{seq}")
}

fn check_user(user_id: &Option<String>) -> HostResult<()> {
    if let Some(user) = user_id {
        validate_user_id(user).map_err(|e| HostError::InvalidInput(e.to_string()))?;
    }
    Ok(())
}

/// Fulfill one capability request. The permission check happens here on
/// every call, independent of the worker-side gating.
async fn fulfill(
    shared: &Arc<HostShared>,
    ext: &Arc<LoadedExtension>,
    call: CapabilityCall,
) -> HostResult<Value> {
    let decision = ext.checker.check_access(call.required_capability());
    if !decision.allowed {
        return Err(HostError::PermissionDenied(
            decision.reason.unwrap_or_else(|| "denied".into()),
        ));
    }
    let extension_id = ext.id();

    match call {
        CapabilityCall::StorageGet { key, user_id } => {
            check_user(&user_id)?;
            let value = shared
                .storage
                .kv_get(extension_id, user_id.as_deref(), &key)?;
            Ok(value.unwrap_or(Value::Null))
        }
        CapabilityCall::StorageSet {
            key,
            value,
            user_id,
        } => {
            check_user(&user_id)?;
            shared
                .storage
                .kv_set(extension_id, user_id.as_deref(), &key, &value)?;
            Ok(Value::Null)
        }
        CapabilityCall::StorageDelete { key, user_id } => {
            check_user(&user_id)?;
            let deleted = shared
                .storage
                .kv_delete(extension_id, user_id.as_deref(), &key)?;
            Ok(Value::Bool(deleted))
        }
        CapabilityCall::StorageKeys { user_id } => {
            check_user(&user_id)?;
            let keys = shared.storage.kv_keys(extension_id, user_id.as_deref())?;
            Ok(serde_json::to_value(keys)?)
        }

        CapabilityCall::DocumentPut {
            collection,
            id,
            data,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let doc = shared
                .storage
                .put(extension_id, &collection, user_id.as_deref(), &id, &data)?;
            Ok(serde_json::to_value(doc)?)
        }
        CapabilityCall::DocumentGet {
            collection,
            id,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let doc = shared
                .storage
                .get(extension_id, &collection, user_id.as_deref(), &id)?;
            Ok(serde_json::to_value(doc)?)
        }
        CapabilityCall::DocumentDelete {
            collection,
            id,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let deleted = shared
                .storage
                .delete(extension_id, &collection, user_id.as_deref(), &id)?;
            Ok(Value::Bool(deleted))
        }
        CapabilityCall::DocumentFind {
            collection,
            query,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let parsed = parse_query(&query)?;
            let docs = shared
                .storage
                .find(extension_id, &collection, user_id.as_deref(), &parsed)?;
            Ok(serde_json::to_value(docs)?)
        }
        CapabilityCall::DocumentFindOne {
            collection,
            query,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let parsed = parse_query(&query)?;
            let doc = shared
                .storage
                .find_one(extension_id, &collection, user_id.as_deref(), &parsed)?;
            Ok(serde_json::to_value(doc)?)
        }
        CapabilityCall::DocumentCount {
            collection,
            query,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let parsed = parse_query(&query)?;
            let count = shared
                .storage
                .count(extension_id, &collection, user_id.as_deref(), &parsed)?;
            Ok(json!(count))
        }
        CapabilityCall::DocumentPutMany {
            collection,
            documents,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let written = shared.storage.put_many(
                extension_id,
                &collection,
                user_id.as_deref(),
                &documents,
            )?;
            Ok(json!(written))
        }
        CapabilityCall::DocumentDeleteMany {
            collection,
            query,
            user_id,
        } => {
            check_collection(ext, &collection)?;
            check_user(&user_id)?;
            let parsed = parse_query(&query)?;
            let removed = shared.storage.delete_many(
                extension_id,
                &collection,
                user_id.as_deref(),
                &parsed,
            )?;
            Ok(json!(removed))
        }
        CapabilityCall::DocumentDropCollection { collection } => {
            check_collection(ext, &collection)?;
            shared.storage.drop_collection(extension_id, &collection)?;
            Ok(Value::Null)
        }
        CapabilityCall::DocumentListCollections => {
            let collections = shared.storage.list_collections(extension_id)?;
            Ok(serde_json::to_value(collections)?)
        }

        CapabilityCall::SecretSet {
            key,
            value,
            user_id,
        } => {
            check_user(&user_id)?;
            shared
                .secrets
                .set(extension_id, user_id.as_deref(), &key, &value)?;
            Ok(Value::Null)
        }
        CapabilityCall::SecretGet { key, user_id } => {
            check_user(&user_id)?;
            let value = shared.secrets.get(extension_id, user_id.as_deref(), &key)?;
            Ok(serde_json::to_value(value)?)
        }
        CapabilityCall::SecretDelete { key, user_id } => {
            check_user(&user_id)?;
            let deleted = shared
                .secrets
                .delete(extension_id, user_id.as_deref(), &key)?;
            Ok(Value::Bool(deleted))
        }
        CapabilityCall::SecretList { user_id } => {
            check_user(&user_id)?;
            let keys = shared.secrets.list(extension_id, user_id.as_deref())?;
            Ok(serde_json::to_value(keys)?)
        }

        CapabilityCall::NetworkFetch { request } => {
            check_network_access(&ext.checker, &request.url)?;
            let response = shared.network.fetch(&request).await?;
            Ok(serde_json::to_value(response)?)
        }
        CapabilityCall::NetworkFetchStream { stream_id, request } => {
            check_network_access(&ext.checker, &request.url)?;
            let (status, body) = shared.network.fetch_stream(&request).await?;
            tokio::spawn(pump_fetch_stream(
                shared.config.request_timeout(),
                ext.clone(),
                stream_id.clone(),
                body,
            ));
            Ok(json!({ "stream_id": stream_id, "status": status }))
        }

        CapabilityCall::DatabaseExecute { sql, params } => {
            shared.storage.execute_raw(extension_id, &sql, &params)
        }

        CapabilityCall::ChatPost { role, content } => {
            shared.delegate.chat_post(extension_id, &role, &content).await
        }
        CapabilityCall::UserInfo { user_id } => {
            check_user(&user_id)?;
            shared
                .delegate
                .user_info(extension_id, user_id.as_deref())
                .await
        }

        CapabilityCall::TaskRegistered { config } => {
            check_user(&config.user_id)?;
            ext.tasks.insert(
                config.id.clone(),
                TaskRecord {
                    config,
                    healthy: None,
                    stopped: false,
                },
            );
            Ok(Value::Null)
        }
        CapabilityCall::TaskStopped { task_id } => {
            if let Some(mut record) = ext.tasks.get_mut(&task_id) {
                record.stopped = true;
            }
            Ok(Value::Null)
        }
        CapabilityCall::TaskHealth {
            task_id,
            healthy,
            detail,
        } => {
            if let Some(mut record) = ext.tasks.get_mut(&task_id) {
                record.healthy = Some(healthy);
            }
            if let Some(detail) = detail {
                tracing::debug!(extension = %ext.id(), task = %task_id, healthy, "{detail}");
            }
            Ok(Value::Null)
        }
    }
}

fn check_collection(ext: &LoadedExtension, collection: &str) -> HostResult<()> {
    let access = ext.checker.validate_collection_access(collection);
    if !access.allowed {
        return Err(HostError::PermissionDenied(
            access.reason.unwrap_or_else(|| "denied".into()),
        ));
    }
    Ok(())
}

/// Push response body chunks to the worker, one at a time, waiting for
/// each ack before reading more from the socket.
async fn pump_fetch_stream(
    ack_timeout: std::time::Duration,
    ext: Arc<LoadedExtension>,
    stream_id: String,
    mut body: impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin,
) {
    let mut seq = 0u64;
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
                if send_chunk(ack_timeout, &ext, &stream_id, seq, data, false)
                    .await
                    .is_err()
                {
                    return;
                }
                seq += 1;
            }
            Err(e) => {
                tracing::warn!(extension = %ext.id(), stream = %stream_id, "fetch stream failed: {e}");
                break;
            }
        }
    }
    let _ = send_chunk(ack_timeout, &ext, &stream_id, seq, String::new(), true).await;
}

async fn send_chunk(
    ack_timeout: std::time::Duration,
    ext: &Arc<LoadedExtension>,
    stream_id: &str,
    seq: u64,
    data: String,
    done: bool,
) -> HostResult<()> {
    let ack = ext
        .pending
        .create(&ack_key(stream_id, seq), ack_timeout, "fetch stream ack");
    ext.transport
        .send(WireMessage::StreamingFetchChunk {
            stream_id: stream_id.to_string(),
            seq,
            data,
            done,
        })
        .await
        .inspect_err(|_| ext.pending.cancel(&ack_key(stream_id, seq)))?;
    ack.await?;
    Ok(())
}
