//! Worker-side runtime.
//!
//! The runtime owns the worker end of the transport: it performs the
//! ready handshake, dispatches host requests to the extension's
//! registered handlers, and correlates the extension's own capability
//! calls. Long-running work (activation, tool runs, provider chats) is
//! spawned off the receive loop, because handlers routinely issue
//! capability calls whose responses arrive through that same loop.

mod context;

pub use context::{
    ActionRegistry, ChatApi, ChatProvider, DatabaseApi, Disposable, DocumentsApi, EventBus,
    EventHandler, EventSink, ExtensionContext, ExtensionInfo, FetchChunk, FetchStream, NetworkApi,
    ProviderRegistry, ScheduleCallback, SchedulerApi, SecretsApi, SettingsApi, SettingsListener,
    StorageApi, ToolHandler, ToolRegistry, UserApi,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HostError, HostResult};
use crate::manifest::ExtensionManifest;
use crate::pending::PendingRequests;
use crate::protocol::{request_id, CapabilityCall, WireMessage, WireResult};
use crate::tasks::BackgroundTaskManager;
use crate::transport::Transport;

/// Extension entry points. Implementations are the extension.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Runs once per activation; registrations happen here.
    async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()>;

    /// Runs on deactivation, before registries are cleared.
    async fn deactivate(&self, _ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Plumbing shared by the runtime and every context handle.
pub(crate) struct RuntimeShared {
    pub(crate) extension_id: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending: Arc<PendingRequests>,
}

impl RuntimeShared {
    /// Issue a capability call and await its response.
    pub(crate) fn call(
        &self,
        call: CapabilityCall,
        timeout: Duration,
        label: &str,
    ) -> impl Future<Output = HostResult<Value>> + '_ {
        let id = request_id();
        let response = self.pending.create(&id, timeout, label);
        async move {
            self.transport
                .send(WireMessage::CapabilityRequest { id: id.clone(), call })
                .await
                .inspect_err(|_| self.pending.cancel(&id))?;
            response.await
        }
    }

    /// Fire-and-forget message toward the host.
    pub(crate) async fn notify(&self, message: WireMessage) -> HostResult<()> {
        self.transport.send(message).await
    }

    /// Send a response; a dead transport is logged, not propagated,
    /// since there is nobody left to tell.
    pub(crate) async fn respond(&self, id: String, result: WireResult) {
        if let Err(e) = self
            .transport
            .send(WireMessage::Response { id, result })
            .await
        {
            tracing::warn!(extension = %self.extension_id, "failed to send response: {e}");
        }
    }
}

/// Drives one extension instance inside its worker.
pub struct ExtensionRuntime {
    shared: Arc<RuntimeShared>,
    extension: Arc<dyn Extension>,
    ctx: Arc<ExtensionContext>,
    tasks: Arc<BackgroundTaskManager>,
}

impl ExtensionRuntime {
    pub fn new(
        extension: Arc<dyn Extension>,
        manifest: &ExtensionManifest,
        transport: Arc<dyn Transport>,
        storage_path: PathBuf,
    ) -> Arc<Self> {
        let shared = Arc::new(RuntimeShared {
            extension_id: manifest.id().to_string(),
            transport,
            pending: PendingRequests::new(),
        });
        let tasks = BackgroundTaskManager::new(manifest.id());
        let ctx = ExtensionContext::new(manifest, storage_path, shared.clone(), tasks.clone());
        Arc::new(Self {
            shared,
            extension,
            ctx,
            tasks,
        })
    }

    /// The context this runtime hands to its extension. Exposed for
    /// in-process tests.
    pub fn context(&self) -> Arc<ExtensionContext> {
        self.ctx.clone()
    }

    /// Announce readiness and serve the transport until it closes.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.shared.notify(WireMessage::Ready).await {
            tracing::error!(extension = %self.shared.extension_id, "ready handshake failed: {e}");
            return;
        }

        while let Some(message) = self.shared.transport.recv().await {
            self.clone().dispatch(message);
        }

        tracing::debug!(extension = %self.shared.extension_id, "transport closed, shutting down");
        self.shared.pending.cancel_all();
        self.tasks.dispose().await;
    }

    fn dispatch(self: Arc<Self>, message: WireMessage) {
        match message {
            // Responses settle inline so capability calls made by the
            // spawned handlers below never wait on the loop.
            WireMessage::Response { id, result } => {
                let settled = match result {
                    WireResult::Ok { value } => self.shared.pending.resolve(&id, value),
                    WireResult::Err { error } => self
                        .shared
                        .pending
                        .reject(&id, HostError::UnitFailure(error)),
                };
                if !settled {
                    tracing::debug!("late response for {id} dropped");
                }
            }

            WireMessage::Activate { id } => {
                tokio::spawn(async move {
                    let result = self.extension.activate(self.ctx.clone()).await;
                    let wire = match result {
                        Ok(()) => WireResult::ok(Value::Null),
                        Err(e) => WireResult::err(format!("activation failed: {e:#}")),
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::Deactivate { id } => {
                tokio::spawn(async move {
                    let result = self.extension.deactivate(self.ctx.clone()).await;
                    self.ctx.clear_registrations();
                    self.tasks.dispose().await;
                    let wire = match result {
                        Ok(()) => WireResult::ok(Value::Null),
                        Err(e) => WireResult::err(format!("deactivation failed: {e:#}")),
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::SettingsChanged { settings } => {
                tokio::spawn(async move {
                    if let Some(api) = &self.ctx.settings {
                        api.apply(settings).await;
                    }
                });
            }

            WireMessage::SchedulerFire { id, user_id } => {
                tokio::spawn(async move {
                    let (succeeded, failed) = match &self.ctx.scheduler {
                        Some(scheduler) => {
                            context::scope_user(user_id.clone(), scheduler.fire(user_id)).await
                        }
                        None => (0, 0),
                    };
                    self.shared
                        .respond(
                            id,
                            WireResult::ok(json!({
                                "succeeded": succeeded,
                                "failed": failed,
                            })),
                        )
                        .await;
                });
            }

            WireMessage::ProviderChatRequest {
                id,
                provider_id,
                request,
            } => {
                tokio::spawn(async move {
                    let sink = EventSink::new(self.shared.clone(), id.clone());
                    let provider = self
                        .ctx
                        .providers
                        .as_ref()
                        .and_then(|registry| registry.get(&provider_id));
                    let Some(provider) = provider else {
                        let _ = sink
                            .emit(crate::protocol::StreamEvent::Error {
                                message: HostError::not_found("provider", &provider_id)
                                    .to_string(),
                            })
                            .await;
                        return;
                    };

                    // The provider streams content; the terminal event
                    // comes from its return value.
                    match provider.chat(request, sink.clone()).await {
                        Ok(()) => {
                            let _ = sink.emit(crate::protocol::StreamEvent::Done).await;
                        }
                        Err(e) => {
                            let _ = sink
                                .emit(crate::protocol::StreamEvent::Error {
                                    message: format!("{e:#}"),
                                })
                                .await;
                        }
                    }
                });
            }

            WireMessage::ProviderModelsRequest { id, provider_id } => {
                tokio::spawn(async move {
                    let provider = self
                        .ctx
                        .providers
                        .as_ref()
                        .and_then(|registry| registry.get(&provider_id));
                    let wire = match provider {
                        None => WireResult::err(HostError::not_found("provider", &provider_id)),
                        Some(provider) => match provider.models().await {
                            Ok(models) => match serde_json::to_value(models) {
                                Ok(value) => WireResult::ok(value),
                                Err(e) => WireResult::err(e),
                            },
                            Err(e) => WireResult::err(format!("{e:#}")),
                        },
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::ToolExecuteRequest {
                id,
                tool_id,
                payload,
                user_id,
            } => {
                tokio::spawn(async move {
                    let handler = self
                        .ctx
                        .tools
                        .as_ref()
                        .and_then(|registry| registry.handler(&tool_id));
                    let wire = match handler {
                        None => WireResult::err(HostError::not_found("tool", &tool_id)),
                        Some(handler) => {
                            let result = context::scope_user(user_id, handler(payload)).await;
                            match result {
                                Ok(value) => WireResult::ok(value),
                                Err(e) => WireResult::err(format!("{e:#}")),
                            }
                        }
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::ActionExecuteRequest {
                id,
                action_id,
                payload,
                user_id,
            } => {
                tokio::spawn(async move {
                    let handler = self
                        .ctx
                        .actions
                        .as_ref()
                        .and_then(|registry| registry.handler(&action_id));
                    let wire = match handler {
                        None => WireResult::err(HostError::not_found("action", &action_id)),
                        Some(handler) => {
                            let result = context::scope_user(user_id, handler(payload)).await;
                            match result {
                                Ok(value) => WireResult::ok(value),
                                Err(e) => WireResult::err(format!("{e:#}")),
                            }
                        }
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::TaskStartRequest { id, task_id } => {
                tokio::spawn(async move {
                    let wire = match self.tasks.handle_start(&task_id).await {
                        Ok(()) => WireResult::ok(Value::Null),
                        Err(e) => WireResult::err(e),
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            WireMessage::TaskStopRequest { id, task_id } => {
                tokio::spawn(async move {
                    let wire = match self.tasks.stop(&task_id).await {
                        Ok(status) => WireResult::ok(json!({ "status": status })),
                        Err(e) => WireResult::err(e),
                    };
                    self.shared.respond(id, wire).await;
                });
            }

            // Spawned so a full consumer channel cannot stall response
            // routing; per-stream order holds because the host sends
            // the next chunk only after this one is acked.
            WireMessage::StreamingFetchChunk {
                stream_id,
                seq,
                data,
                done,
            } => {
                tokio::spawn(async move {
                    if let Some(network) = &self.ctx.network {
                        network.deliver_chunk(&stream_id, seq, &data, done).await;
                    }
                    let _ = self
                        .shared
                        .notify(WireMessage::StreamingFetchAck { stream_id, seq })
                        .await;
                });
            }

            other => {
                tracing::warn!(
                    extension = %self.shared.extension_id,
                    "unexpected message in worker: {other:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StreamEvent;
    use crate::transport::ChannelTransport;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manifest(permissions: &[&str]) -> ExtensionManifest {
        let perms = permissions
            .iter()
            .map(|p| format!("{p:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        ExtensionManifest::parse(&format!(
            r#"
[extension]
id = "test-ext"
version = "0.1.0"

permissions = [{perms}]
"#
        ))
        .unwrap()
    }

    struct NoopExtension;

    #[async_trait]
    impl Extension for NoopExtension {
        async fn activate(&self, _ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct RegisteringExtension;

    #[async_trait]
    impl Extension for RegisteringExtension {
        async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
            let tools = ctx.tools.as_ref().expect("tools capability");
            tools
                .register(
                    "echo",
                    "Echoes its payload",
                    json!({"type": "object"}),
                    Arc::new(|payload| Box::pin(async move { Ok(json!({ "echoed": payload })) })),
                )
                .await?;
            Ok(())
        }
    }

    async fn start(
        extension: Arc<dyn Extension>,
        permissions: &[&str],
    ) -> (Arc<ChannelTransport>, tokio::task::JoinHandle<()>) {
        let (host_side, unit_side) = ChannelTransport::pair(32);
        let runtime = ExtensionRuntime::new(
            extension,
            &manifest(permissions),
            Arc::new(unit_side),
            PathBuf::from("/tmp/test-ext"),
        );
        let handle = tokio::spawn(runtime.run());
        let host_side = Arc::new(host_side);

        // Ready arrives before anything else.
        let ready = host_side.recv().await.unwrap();
        assert!(matches!(ready, WireMessage::Ready));
        (host_side, handle)
    }

    #[tokio::test]
    async fn test_activation_round_trip() {
        let (host, _handle) = start(Arc::new(NoopExtension), &[]).await;

        host.send(WireMessage::Activate { id: "a1".into() })
            .await
            .unwrap();
        match host.recv().await.unwrap() {
            WireMessage::Response { id, result } => {
                assert_eq!(id, "a1");
                assert!(result.into_result().is_ok());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_registration_and_execution() {
        let (host, _handle) = start(Arc::new(RegisteringExtension), &["tools"]).await;

        host.send(WireMessage::Activate { id: "a1".into() })
            .await
            .unwrap();

        // Registration notification, then the activation response.
        let mut saw_registration = false;
        for _ in 0..2 {
            match host.recv().await.unwrap() {
                WireMessage::ToolRegistered { tool_id, .. } => {
                    assert_eq!(tool_id, "echo");
                    saw_registration = true;
                }
                WireMessage::Response { id, .. } => assert_eq!(id, "a1"),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(saw_registration);

        host.send(WireMessage::ToolExecuteRequest {
            id: "t1".into(),
            tool_id: "echo".into(),
            payload: json!({"x": 1}),
            user_id: None,
        })
        .await
        .unwrap();
        match host.recv().await.unwrap() {
            WireMessage::Response { id, result } => {
                assert_eq!(id, "t1");
                let value = result.into_result().unwrap();
                assert_eq!(value["echoed"]["x"], 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_not_found() {
        let (host, _handle) = start(Arc::new(NoopExtension), &["tools"]).await;

        host.send(WireMessage::ToolExecuteRequest {
            id: "t1".into(),
            tool_id: "ghost".into(),
            payload: json!({}),
            user_id: None,
        })
        .await
        .unwrap();
        match host.recv().await.unwrap() {
            WireMessage::Response { result, .. } => {
                let err = result.into_result().unwrap_err();
                assert!(err.to_string().contains("ghost"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overlapping_executions_see_their_own_user() {
        struct WhoamiExtension;

        #[async_trait]
        impl Extension for WhoamiExtension {
            async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
                let reader = ctx.clone();
                ctx.tools
                    .as_ref()
                    .unwrap()
                    .register(
                        "whoami",
                        "Reports the ambient user after a delay",
                        json!({"type": "object"}),
                        Arc::new(move |payload| {
                            let reader = reader.clone();
                            Box::pin(async move {
                                let delay = payload["delay_ms"].as_u64().unwrap_or(0);
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                Ok(json!({ "user": reader.current_user() }))
                            })
                        }),
                    )
                    .await?;
                Ok(())
            }
        }

        let (host, _handle) = start(Arc::new(WhoamiExtension), &["tools"]).await;
        host.send(WireMessage::Activate { id: "a1".into() })
            .await
            .unwrap();
        host.recv().await.unwrap();
        host.recv().await.unwrap();

        // The slow call is still running when the fast one starts and
        // finishes; each must report its own user.
        host.send(WireMessage::ToolExecuteRequest {
            id: "slow".into(),
            tool_id: "whoami".into(),
            payload: json!({"delay_ms": 80}),
            user_id: Some("alice".into()),
        })
        .await
        .unwrap();
        host.send(WireMessage::ToolExecuteRequest {
            id: "fast".into(),
            tool_id: "whoami".into(),
            payload: json!({"delay_ms": 0}),
            user_id: Some("bob".into()),
        })
        .await
        .unwrap();

        let mut seen = std::collections::HashMap::new();
        for _ in 0..2 {
            match host.recv().await.unwrap() {
                WireMessage::Response { id, result } => {
                    let value = result.into_result().unwrap();
                    seen.insert(id, value["user"].clone());
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(seen["slow"], json!("alice"));
        assert_eq!(seen["fast"], json!("bob"));
    }

    #[tokio::test]
    async fn test_ungranted_capability_is_absent() {
        let (host_side, unit_side) = ChannelTransport::pair(8);
        let runtime = ExtensionRuntime::new(
            Arc::new(NoopExtension),
            &manifest(&["storage"]),
            Arc::new(unit_side),
            PathBuf::from("/tmp/test-ext"),
        );
        let ctx = runtime.context();
        assert!(ctx.storage.is_some());
        assert!(ctx.network.is_none());
        assert!(ctx.secrets.is_none());
        // Document access needs its own grant on top of storage.
        assert!(ctx.storage.as_ref().unwrap().documents.is_none());
        drop(host_side);
    }

    #[tokio::test]
    async fn test_provider_chat_emits_terminal_done() {
        struct OneShotProvider;

        #[async_trait]
        impl ChatProvider for OneShotProvider {
            fn name(&self) -> &str {
                "oneshot"
            }

            async fn chat(
                &self,
                _request: crate::protocol::ChatRequest,
                events: EventSink,
            ) -> anyhow::Result<()> {
                events
                    .emit(StreamEvent::Content { text: "hi".into() })
                    .await?;
                Ok(())
            }

            async fn models(&self) -> anyhow::Result<Vec<crate::protocol::ModelInfo>> {
                Ok(vec![])
            }
        }

        struct ProviderExtension;

        #[async_trait]
        impl Extension for ProviderExtension {
            async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
                ctx.providers
                    .as_ref()
                    .unwrap()
                    .register("oneshot", Arc::new(OneShotProvider))
                    .await?;
                Ok(())
            }
        }

        let (host, _handle) = start(Arc::new(ProviderExtension), &["providers"]).await;
        host.send(WireMessage::Activate { id: "a1".into() })
            .await
            .unwrap();
        // Drain registration + activation response.
        host.recv().await.unwrap();
        host.recv().await.unwrap();

        host.send(WireMessage::ProviderChatRequest {
            id: "c1".into(),
            provider_id: "oneshot".into(),
            request: crate::protocol::ChatRequest {
                model: "m".into(),
                messages: vec![],
                temperature: None,
                max_tokens: None,
            },
        })
        .await
        .unwrap();

        let mut events = Vec::new();
        loop {
            match host.recv().await.unwrap() {
                WireMessage::StreamEvent { id, event } => {
                    assert_eq!(id, "c1");
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        break;
                    }
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_scheduler_fire_counts_outcomes() {
        struct SchedulerExtension {
            ran: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Extension for SchedulerExtension {
            async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
                let scheduler = ctx.scheduler.as_ref().unwrap();
                let ran = self.ran.clone();
                scheduler.on_fire(Arc::new(move |user| {
                    let ran = ran.clone();
                    Box::pin(async move {
                        assert_eq!(user.as_deref(), Some("alice"));
                        ran.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                }));
                scheduler.on_fire(Arc::new(|_user| {
                    Box::pin(async { Err(anyhow::anyhow!("flaky")) })
                }));
                Ok(())
            }
        }

        let ran = Arc::new(AtomicBool::new(false));
        let (host, _handle) =
            start(Arc::new(SchedulerExtension { ran: ran.clone() }), &["scheduler"]).await;

        host.send(WireMessage::Activate { id: "a1".into() })
            .await
            .unwrap();
        host.recv().await.unwrap();

        host.send(WireMessage::SchedulerFire {
            id: "s1".into(),
            user_id: Some("alice".into()),
        })
        .await
        .unwrap();
        match host.recv().await.unwrap() {
            WireMessage::Response { id, result } => {
                assert_eq!(id, "s1");
                let value = result.into_result().unwrap();
                assert_eq!(value["succeeded"], 1);
                assert_eq!(value["failed"], 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
