//! End-to-end tests: a real host, an in-process worker, and extensions
//! exercising capabilities through the wire protocol.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use proassist_host::host::TaskWorkerSpawner;
use proassist_host::protocol::{ChatRequest, StreamEvent};
use proassist_host::runtime::{ChatProvider, EventSink, Extension, ExtensionContext};
use proassist_host::{ExtensionHost, ExtensionManifest, HostConfig, HostError};

fn host_with(
    dir: &std::path::Path,
    extension: Arc<dyn Extension>,
) -> ExtensionHost {
    let config = HostConfig::new(dir, "integration-master-secret");
    let spawner = TaskWorkerSpawner::new(Arc::new(move |_manifest: &ExtensionManifest| {
        Ok(extension.clone())
    }));
    ExtensionHost::new(config, spawner).unwrap()
}

// ---------------------------------------------------------------------

struct NotetakerExtension;

#[async_trait]
impl Extension for NotetakerExtension {
    async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
        let tools = ctx.tools.as_ref().expect("tools granted");

        let note_ctx = ctx.clone();
        tools
            .register(
                "save-note",
                "Persist a note and return its document",
                json!({"type": "object", "properties": {"id": {}, "text": {}}}),
                Arc::new(move |payload| {
                    let ctx = note_ctx.clone();
                    Box::pin(async move {
                        let id = payload["id"].as_str().unwrap_or("note").to_string();
                        let docs = ctx
                            .storage
                            .as_ref()
                            .and_then(|s| s.documents.as_ref())
                            .expect("collections granted");
                        let doc = docs
                            .put("notes", &id, json!({"text": payload["text"]}))
                            .await?;
                        ctx.storage
                            .as_ref()
                            .unwrap()
                            .set("last_note", json!(id))
                            .await?;
                        Ok(serde_json::to_value(doc)?)
                    })
                }),
            )
            .await?;

        let fail_ctx = ctx.clone();
        tools
            .register(
                "always-fails",
                "Fails on purpose",
                json!({"type": "object"}),
                Arc::new(move |_payload| {
                    let _ctx = fail_ctx.clone();
                    Box::pin(async move { anyhow::bail!("nothing to see here") })
                }),
            )
            .await?;

        ctx.secrets
            .as_ref()
            .expect("secrets granted")
            .set("boot-token", "sealed")
            .await?;
        Ok(())
    }
}

fn notetaker_manifest() -> ExtensionManifest {
    ExtensionManifest::parse(
        r#"
[extension]
id = "notetaker"
version = "1.0.0"
description = "Keeps notes"

permissions = ["storage.*", "secrets", "tools"]

[collections]
notes = ["text"]
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_load_execute_and_unload() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(NotetakerExtension));

    host.load(notetaker_manifest()).await.unwrap();
    assert!(host.is_loaded("notetaker"));

    // Activation already exercised secrets through the capability path.
    let sealed = host
        .secrets()
        .get("notetaker", None, "boot-token")
        .unwrap();
    assert_eq!(sealed.as_deref(), Some("sealed"));

    let tools = host.tools("notetaker").unwrap();
    assert_eq!(tools.len(), 2);

    let outcome = host
        .execute_tool(
            "notetaker",
            "save-note",
            json!({"id": "n1", "text": "buy milk"}),
            None,
        )
        .await
        .unwrap();
    assert!(outcome.success, "{outcome:?}");
    let doc = outcome.result.unwrap();
    assert_eq!(doc["id"], "n1");
    assert_eq!(doc["data"]["text"], "buy milk");

    // The document and the kv entry landed in the host's store.
    let stored = host
        .storage()
        .get("notetaker", "notes", None, "n1")
        .unwrap()
        .unwrap();
    assert_eq!(stored.data["text"], "buy milk");
    let last = host
        .storage()
        .kv_get("notetaker", None, "last_note")
        .unwrap();
    assert_eq!(last, Some(json!("n1")));

    host.unload("notetaker").await.unwrap();
    assert!(!host.is_loaded("notetaker"));
    assert!(matches!(
        host.execute_tool("notetaker", "save-note", json!({}), None).await,
        Err(HostError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_handler_failure_is_a_structured_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(NotetakerExtension));
    host.load(notetaker_manifest()).await.unwrap();

    let outcome = host
        .execute_tool("notetaker", "always-fails", json!({}), None)
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("nothing to see here"));

    // Unknown tools are a typed error, not an outcome.
    assert!(matches!(
        host.execute_tool("notetaker", "ghost-tool", json!({}), None).await,
        Err(HostError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_load_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(NotetakerExtension));
    host.load(notetaker_manifest()).await.unwrap();

    let err = host.load(notetaker_manifest()).await.unwrap_err();
    assert!(matches!(err, HostError::InvalidInput(_)));
    assert!(err.to_string().contains("already loaded"));
}

// ---------------------------------------------------------------------

struct EchoProvider;

#[async_trait]
impl ChatProvider for EchoProvider {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn chat(&self, request: ChatRequest, events: EventSink) -> anyhow::Result<()> {
        events
            .emit(StreamEvent::Thinking {
                text: "echoing".into(),
            })
            .await?;
        for message in &request.messages {
            events
                .emit(StreamEvent::Content {
                    text: message.content.clone(),
                })
                .await?;
        }
        Ok(())
    }

    async fn models(&self) -> anyhow::Result<Vec<proassist_host::protocol::ModelInfo>> {
        Ok(vec![proassist_host::protocol::ModelInfo {
            id: "echo-1".into(),
            display_name: "Echo One".into(),
            context_window: 4096,
            supports_streaming: true,
        }])
    }
}

struct ProviderExtension;

#[async_trait]
impl Extension for ProviderExtension {
    async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
        ctx.providers
            .as_ref()
            .expect("providers granted")
            .register("echo", Arc::new(EchoProvider))
            .await?;
        Ok(())
    }
}

fn provider_manifest() -> ExtensionManifest {
    ExtensionManifest::parse(
        r#"
[extension]
id = "echo-provider"
version = "0.2.0"

permissions = ["providers"]
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_chat_streams_in_order_with_single_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(ProviderExtension));
    host.load(provider_manifest()).await.unwrap();

    let request = ChatRequest {
        model: "echo-1".into(),
        messages: vec![
            proassist_host::protocol::ChatMessage {
                role: "user".into(),
                content: "hello".into(),
            },
            proassist_host::protocol::ChatMessage {
                role: "user".into(),
                content: "world".into(),
            },
        ],
        temperature: None,
        max_tokens: None,
    };

    let mut stream = host.chat("echo-provider", "echo", request).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_eq!(events.len(), 4);
    assert!(matches!(events[0], StreamEvent::Thinking { .. }));
    assert_eq!(
        events[1],
        StreamEvent::Content {
            text: "hello".into()
        }
    );
    assert_eq!(
        events[2],
        StreamEvent::Content {
            text: "world".into()
        }
    );
    assert_eq!(events[3], StreamEvent::Done);
}

#[tokio::test]
async fn test_models_and_unknown_provider() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(ProviderExtension));
    host.load(provider_manifest()).await.unwrap();

    let models = host.models("echo-provider", "echo").await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "echo-1");

    assert!(matches!(
        host.chat(
            "echo-provider",
            "missing",
            ChatRequest {
                model: "m".into(),
                messages: vec![],
                temperature: None,
                max_tokens: None
            }
        )
        .await,
        Err(HostError::NotFound { .. })
    ));
}

// ---------------------------------------------------------------------

struct SchedulerExtension;

#[async_trait]
impl Extension for SchedulerExtension {
    async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
        let scheduler = ctx.scheduler.as_ref().expect("scheduler granted");
        let storage_ctx = ctx.clone();
        scheduler.on_fire(Arc::new(move |user| {
            let ctx = storage_ctx.clone();
            Box::pin(async move {
                let storage = ctx.storage.as_ref().unwrap();
                match user {
                    Some(user) => storage.set_for_user(&user, "last_fire", json!("user")).await?,
                    None => storage.set("last_fire", json!("global")).await?,
                }
                Ok(())
            })
        }));
        Ok(())
    }
}

#[tokio::test]
async fn test_scheduler_fire_scopes_to_user() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(SchedulerExtension));
    host.load(
        ExtensionManifest::parse(
            r#"
[extension]
id = "cron-ext"
version = "1.0.0"

permissions = ["scheduler", "storage"]
"#,
        )
        .unwrap(),
    )
    .await
    .unwrap();

    let counts = host.fire_scheduler("cron-ext", Some("alice")).await.unwrap();
    assert_eq!(counts["succeeded"], 1);
    assert_eq!(counts["failed"], 0);

    let hers = host
        .storage()
        .kv_get("cron-ext", Some("alice"), "last_fire")
        .unwrap();
    assert_eq!(hers, Some(json!("user")));
    // Nothing leaked into the extension-global scope.
    let global: Option<Value> = host.storage().kv_get("cron-ext", None, "last_fire").unwrap();
    assert_eq!(global, None);

    // Malformed user ids are rejected before reaching the worker.
    assert!(matches!(
        host.fire_scheduler("cron-ext", Some("bad/user")).await,
        Err(HostError::InvalidInput(_))
    ));
}

// ---------------------------------------------------------------------

struct PulseExtension;

#[async_trait]
impl Extension for PulseExtension {
    async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
        let scheduler = ctx.scheduler.as_ref().expect("scheduler granted");
        let task_ctx = ctx.clone();
        scheduler
            .register_task(
                proassist_host::protocol::TaskConfig {
                    id: "pulse".into(),
                    name: "Heartbeat".into(),
                    user_id: None,
                    restart_policy: proassist_host::protocol::RestartPolicy::Never,
                },
                Arc::new(move |run| {
                    let ctx = task_ctx.clone();
                    Box::pin(async move {
                        ctx.storage
                            .as_ref()
                            .unwrap()
                            .set("task_ran", json!(true))
                            .await?;
                        // Idle until the supervisor cancels the run.
                        run.signal.cancelled().await;
                        Ok(())
                    })
                }),
            )
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_background_task_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(PulseExtension));
    host.load(
        ExtensionManifest::parse(
            r#"
[extension]
id = "pulse-ext"
version = "1.0.0"

permissions = ["scheduler", "storage"]
"#,
        )
        .unwrap(),
    )
    .await
    .unwrap();

    // Registration reached the host catalog during activation.
    let tasks = host.tasks("pulse-ext").unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].config.id, "pulse");
    assert!(!tasks[0].stopped);

    host.start_task("pulse-ext", "pulse").await.unwrap();

    let mut ran = None;
    for _ in 0..100 {
        ran = host.storage().kv_get("pulse-ext", None, "task_ran").unwrap();
        if ran.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(ran, Some(json!(true)));

    host.stop_task("pulse-ext", "pulse").await.unwrap();
    assert!(host.tasks("pulse-ext").unwrap()[0].stopped);

    assert!(matches!(
        host.start_task("pulse-ext", "ghost").await,
        Err(HostError::NotFound { .. })
    ));
}

// ---------------------------------------------------------------------

#[tokio::test]
async fn test_settings_fan_out() {
    struct SettingsExtension;

    #[async_trait]
    impl Extension for SettingsExtension {
        async fn activate(&self, ctx: Arc<ExtensionContext>) -> anyhow::Result<()> {
            let settings = ctx.settings.as_ref().expect("settings granted");
            let storage_ctx = ctx.clone();
            settings.on_change(Arc::new(move |snapshot| {
                let ctx = storage_ctx.clone();
                Box::pin(async move {
                    let _ = ctx
                        .storage
                        .as_ref()
                        .unwrap()
                        .set("seen_settings", snapshot)
                        .await;
                })
            }));
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let host = host_with(dir.path(), Arc::new(SettingsExtension));
    host.load(
        ExtensionManifest::parse(
            r#"
[extension]
id = "settings-ext"
version = "1.0.0"

permissions = ["settings", "storage"]
"#,
        )
        .unwrap(),
    )
    .await
    .unwrap();

    host.update_settings(Some("settings-ext"), json!({"theme": "dark"}))
        .await
        .unwrap();

    // The listener writes through a capability call; poll for it.
    let mut seen = None;
    for _ in 0..100 {
        seen = host
            .storage()
            .kv_get("settings-ext", None, "seen_settings")
            .unwrap();
        if seen.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(seen, Some(json!({"theme": "dark"})));
}
