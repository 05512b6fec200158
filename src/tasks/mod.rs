//! Background task supervision
//!
//! Extensions register long-running jobs that the host can start and
//! stop. Cancellation is cooperative: every run gets a [`CancelSignal`]
//! it is expected to watch. Starting a task whose previous run is still
//! in flight cancels that run first - last write wins, nothing queues.
//! The declared restart policy is stored and reported but drives no
//! automatic retry loop; restarts happen through explicit start calls.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{HostError, HostResult};
use crate::protocol::{LogLevel, TaskConfig};

/// Cooperative cancellation signal threaded through a task run.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires. Safe to await from several places.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Lifecycle state of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

/// Context handed to a task callback for one run.
#[derive(Clone)]
pub struct TaskContext {
    pub signal: CancelSignal,
    pub task_id: String,
    pub extension_id: String,
    pub user_id: Option<String>,
    tasks: Arc<DashMap<String, TaskEntry>>,
}

impl TaskContext {
    /// Report run health back to the supervisor.
    pub fn report_health(&self, healthy: bool, detail: Option<String>) {
        record_health(&self.tasks, &self.task_id, healthy, detail);
    }

    /// Structured log line attributed to this task.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => {
                tracing::debug!(task = %self.task_id, extension = %self.extension_id, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(task = %self.task_id, extension = %self.extension_id, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(task = %self.task_id, extension = %self.extension_id, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(task = %self.task_id, extension = %self.extension_id, "{message}")
            }
        }
    }
}

/// Async task body registered by an extension.
pub type TaskCallback =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Reportable snapshot of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub user_id: Option<String>,
    pub restart_policy: crate::protocol::RestartPolicy,
    pub status: TaskStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub healthy: Option<bool>,
}

struct TaskEntry {
    config: TaskConfig,
    callback: TaskCallback,
    status: TaskStatus,
    restart_count: u32,
    started_once: bool,
    last_error: Option<String>,
    healthy: Option<bool>,
}

struct ActiveRun {
    signal: CancelSignal,
    handle: JoinHandle<()>,
}

/// Supervises the background tasks of one extension instance.
pub struct BackgroundTaskManager {
    extension_id: String,
    tasks: Arc<DashMap<String, TaskEntry>>,
    active: DashMap<String, ActiveRun>,
}

impl BackgroundTaskManager {
    pub fn new(extension_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            extension_id: extension_id.into(),
            tasks: Arc::new(DashMap::new()),
            active: DashMap::new(),
        })
    }

    /// Register a task. Errors if the id is already registered.
    pub fn register(&self, config: TaskConfig, callback: TaskCallback) -> HostResult<()> {
        if self.tasks.contains_key(&config.id) {
            return Err(HostError::InvalidInput(format!(
                "task '{}' already registered",
                config.id
            )));
        }
        tracing::debug!(extension = %self.extension_id, task = %config.id, "task registered");
        self.tasks.insert(
            config.id.clone(),
            TaskEntry {
                config,
                callback,
                status: TaskStatus::Pending,
                restart_count: 0,
                started_once: false,
                last_error: None,
                healthy: None,
            },
        );
        Ok(())
    }

    /// Start (or restart) a task. An in-flight run for the same id is
    /// cancelled and awaited before the new run begins.
    pub async fn handle_start(&self, id: &str) -> HostResult<()> {
        let (callback, user_id) = {
            let entry = self
                .tasks
                .get(id)
                .ok_or_else(|| HostError::not_found("task", id))?;
            (entry.callback.clone(), entry.config.user_id.clone())
        };

        // Abort-and-replace: the previous run's signal fires and the run
        // is drained before the replacement starts.
        if let Some((_, prior)) = self.active.remove(id) {
            prior.signal.cancel();
            let _ = prior.handle.await;
        }

        if let Some(mut entry) = self.tasks.get_mut(id) {
            if entry.started_once {
                entry.restart_count += 1;
            }
            entry.started_once = true;
            entry.status = TaskStatus::Running;
            entry.last_error = None;
        }

        let signal = CancelSignal::new();
        let ctx = TaskContext {
            signal: signal.clone(),
            task_id: id.to_string(),
            extension_id: self.extension_id.clone(),
            user_id,
            tasks: self.tasks.clone(),
        };

        let tasks = self.tasks.clone();
        let task_id = id.to_string();
        let run_signal = signal.clone();
        let handle = tokio::spawn(async move {
            let result = (callback)(ctx).await;
            finish_run(&tasks, &task_id, result, run_signal.is_cancelled());
        });

        self.active.insert(id.to_string(), ActiveRun { signal, handle });
        Ok(())
    }

    /// Stop a task. Reports `stopped` even when no run was active.
    pub async fn stop(&self, id: &str) -> HostResult<TaskStatus> {
        if !self.tasks.contains_key(id) {
            return Err(HostError::not_found("task", id));
        }

        if let Some((_, run)) = self.active.remove(id) {
            run.signal.cancel();
            let _ = run.handle.await;
        }
        if let Some(mut entry) = self.tasks.get_mut(id) {
            entry.status = TaskStatus::Stopped;
        }
        Ok(TaskStatus::Stopped)
    }

    /// Cancel every active run and clear all registrations.
    pub async fn dispose(&self) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, run)) = self.active.remove(&id) {
                run.signal.cancel();
                let _ = run.handle.await;
            }
        }
        self.tasks.clear();
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|e| e.status)
    }

    /// Snapshot every registered task.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .iter()
            .map(|entry| TaskSnapshot {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                user_id: entry.config.user_id.clone(),
                restart_policy: entry.config.restart_policy,
                status: entry.status,
                restart_count: entry.restart_count,
                last_error: entry.last_error.clone(),
                healthy: entry.healthy,
            })
            .collect()
    }
}

fn finish_run(
    tasks: &DashMap<String, TaskEntry>,
    id: &str,
    result: anyhow::Result<()>,
    was_cancelled: bool,
) {
    let Some(mut entry) = tasks.get_mut(id) else {
        return;
    };
    match result {
        Ok(()) => {
            entry.status = TaskStatus::Stopped;
            if was_cancelled {
                tracing::debug!(task = %id, "task run cancelled and resolved cleanly");
            } else {
                tracing::debug!(task = %id, "task run completed");
            }
        }
        Err(e) => {
            tracing::warn!(task = %id, "task run failed: {e}");
            entry.status = TaskStatus::Failed;
            entry.last_error = Some(e.to_string());
        }
    }
}

fn record_health(tasks: &DashMap<String, TaskEntry>, id: &str, healthy: bool, detail: Option<String>) {
    if let Some(mut entry) = tasks.get_mut(id) {
        entry.healthy = Some(healthy);
        if let Some(detail) = detail {
            tracing::debug!(task = %id, healthy, "task health: {detail}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RestartPolicy;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn config(id: &str) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            name: format!("{id} task"),
            user_id: None,
            restart_policy: RestartPolicy::Never,
        }
    }

    fn noop_callback() -> TaskCallback {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = BackgroundTaskManager::new("ext");
        manager.register(config("sync"), noop_callback()).unwrap();

        let err = manager
            .register(config("sync"), noop_callback())
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_clean_run_reports_stopped() {
        let manager = BackgroundTaskManager::new("ext");
        manager.register(config("sync"), noop_callback()).unwrap();
        assert_eq!(manager.status("sync"), Some(TaskStatus::Pending));

        manager.handle_start("sync").await.unwrap();
        // Drain the run
        manager.stop("sync").await.unwrap();
        assert_eq!(manager.status("sync"), Some(TaskStatus::Stopped));
    }

    #[tokio::test]
    async fn test_failing_run_reports_failed_with_message() {
        let manager = BackgroundTaskManager::new("ext");
        let callback: TaskCallback =
            Arc::new(|_ctx| Box::pin(async { Err(anyhow::anyhow!("disk on fire")) }));
        manager.register(config("sync"), callback).unwrap();

        manager.handle_start("sync").await.unwrap();
        // Wait for the run to settle
        for _ in 0..50 {
            if manager.status("sync") == Some(TaskStatus::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.status("sync"), Some(TaskStatus::Failed));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].last_error.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn test_start_while_running_cancels_prior_run() {
        let manager = BackgroundTaskManager::new("ext");
        let first_cancelled = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU32::new(0));

        let flag = first_cancelled.clone();
        let run_counter = runs.clone();
        let callback: TaskCallback = Arc::new(move |ctx| {
            let flag = flag.clone();
            let run_counter = run_counter.clone();
            Box::pin(async move {
                let run = run_counter.fetch_add(1, Ordering::SeqCst);
                if run == 0 {
                    // First run idles until its signal fires.
                    ctx.signal.cancelled().await;
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(())
            })
        });
        manager.register(config("sync"), callback).unwrap();

        manager.handle_start("sync").await.unwrap();
        manager.handle_start("sync").await.unwrap();

        // The first run observed its cancellation signal.
        assert!(first_cancelled.load(Ordering::SeqCst));
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        manager.stop("sync").await.unwrap();
        assert_eq!(manager.status("sync"), Some(TaskStatus::Stopped));
        assert_eq!(manager.snapshot()[0].restart_count, 1);
    }

    #[tokio::test]
    async fn test_stop_without_active_run_reports_stopped() {
        let manager = BackgroundTaskManager::new("ext");
        manager.register(config("sync"), noop_callback()).unwrap();
        let status = manager.stop("sync").await.unwrap();
        assert_eq!(status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_unknown_task_is_not_found() {
        let manager = BackgroundTaskManager::new("ext");
        assert!(matches!(
            manager.stop("ghost").await,
            Err(HostError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_clears() {
        let manager = BackgroundTaskManager::new("ext");
        let callback: TaskCallback = Arc::new(|ctx| {
            Box::pin(async move {
                ctx.signal.cancelled().await;
                Ok(())
            })
        });
        manager.register(config("a"), callback.clone()).unwrap();
        manager.register(config("b"), callback).unwrap();
        manager.handle_start("a").await.unwrap();
        manager.handle_start("b").await.unwrap();

        manager.dispose().await;
        assert!(manager.snapshot().is_empty());
        assert_eq!(manager.status("a"), None);
    }

    #[tokio::test]
    async fn test_health_reporting() {
        let manager = BackgroundTaskManager::new("ext");
        let callback: TaskCallback = Arc::new(|ctx| {
            Box::pin(async move {
                ctx.report_health(true, Some("warmed up".into()));
                Ok(())
            })
        });
        manager.register(config("sync"), callback).unwrap();
        manager.handle_start("sync").await.unwrap();
        manager.stop("sync").await.unwrap();

        assert_eq!(manager.snapshot()[0].healthy, Some(true));
    }
}
