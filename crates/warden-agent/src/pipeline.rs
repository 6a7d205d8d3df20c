//! Sequential, observable runner for named provisioning steps.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures_util::{FutureExt, future::BoxFuture};
use serde::Serialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const STATUS_CHANNEL_CAPACITY: usize = 10;

type Action = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type ErrorHook = Box<dyn FnOnce(String, anyhow::Error) -> BoxFuture<'static, ()> + Send>;

pub struct Task {
    name: String,
    action: Action,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub percentage: f64,
    pub current_task: String,
    pub is_running: bool,
    pub err: Option<String>,
    pub state: PipelineState,
}

impl TaskStatus {
    fn idle() -> Self {
        Self {
            total_tasks: 0,
            completed_tasks: 0,
            percentage: 0.0,
            current_task: String::new(),
            is_running: false,
            err: None,
            state: PipelineState::Idle,
        }
    }

    fn recompute(&mut self) {
        self.percentage = if self.total_tasks == 0 {
            100.0
        } else {
            self.completed_tasks as f64 / self.total_tasks as f64 * 100.0
        };
    }
}

struct Shared {
    label: String,
    status: Mutex<TaskStatus>,
    status_tx: broadcast::Sender<TaskStatus>,
    stop: AtomicBool,
}

impl Shared {
    fn publish(&self, update: impl FnOnce(&mut TaskStatus)) {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            update(&mut status);
            status.recompute();
            status.clone()
        };
        // No subscribers, or a full channel for a slow one, is fine: `status()` stays authoritative.
        let _ = self.status_tx.send(snapshot);
    }
}

/// Runs its tasks strictly in order on a background task, stopping at the first failure.
pub struct TaskPipeline {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<Task>>,
    on_error: Mutex<Option<ErrorHook>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("label", &self.shared.label)
            .field("status", &self.status())
            .finish()
    }
}

impl TaskPipeline {
    pub fn new(label: impl Into<String>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                status: Mutex::new(TaskStatus::idle()),
                status_tx,
                stop: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
            on_error: Mutex::new(None),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn add_task(&self, task: Task) -> Result<()> {
        if self.status().state != PipelineState::Idle {
            return Err(Error::InvalidState(format!(
                "pipeline {} already started",
                self.shared.label
            )));
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(task);
        let total = tasks.len();
        drop(tasks);
        let mut status = self.shared.status.lock().unwrap_or_else(|e| e.into_inner());
        status.total_tasks = total;
        Ok(())
    }

    /// Registers the hook run once with the failing task's name and error.
    pub fn on_error<F, Fut>(&self, hook: F)
    where
        F: FnOnce(String, anyhow::Error) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: ErrorHook = Box::new(move |task, err| hook(task, err).boxed());
        *self.on_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Receives status updates; a lagging receiver skips updates instead of blocking the run.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn status(&self) -> TaskStatus {
        self.shared
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Requests cancellation; honoured before the next task begins.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.status().state != PipelineState::Idle {
            return Err(Error::InvalidState(format!(
                "pipeline {} already started",
                self.shared.label
            )));
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let on_error = self.on_error.lock().unwrap_or_else(|e| e.into_inner()).take();
        let total = tasks.len();
        self.shared.publish(|s| {
            s.total_tasks = total;
            s.is_running = true;
            s.state = PipelineState::Running;
        });

        let shared = self.shared.clone();
        *handle = Some(tokio::spawn(run(shared, tasks, on_error)));
        Ok(())
    }

    /// Waits for the background run, including the error hook, to finish.
    pub async fn join(&self) -> TaskStatus {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(pipeline = %self.shared.label, error = %e, "pipeline task aborted");
        }
        self.status()
    }
}

async fn run(shared: Arc<Shared>, tasks: Vec<Task>, mut on_error: Option<ErrorHook>) {
    let total = tasks.len();
    info!(pipeline = %shared.label, total, "pipeline started");

    for (i, task) in tasks.into_iter().enumerate() {
        if shared.stop.load(Ordering::SeqCst) {
            shared.publish(|s| {
                s.is_running = false;
                s.state = PipelineState::Stopped;
            });
            info!(pipeline = %shared.label, completed = i, "pipeline stopped");
            return;
        }

        let Task { name, action } = task;
        shared.publish(|s| {
            s.current_task = name.clone();
            s.completed_tasks = i;
        });
        debug!(pipeline = %shared.label, task = %name, "task started");

        let outcome = match AssertUnwindSafe(action()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!("task {name} panicked")),
        };

        match outcome {
            Ok(()) => {
                shared.publish(|s| s.completed_tasks = i + 1);
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(pipeline = %shared.label, task = %name, error = %message, "task failed");
                shared.publish(|s| {
                    s.err = Some(message);
                    s.is_running = false;
                    s.state = PipelineState::Failed;
                });
                if let Some(hook) = on_error.take() {
                    hook(name, e).await;
                }
                return;
            }
        }
    }

    shared.publish(|s| {
        s.completed_tasks = total;
        s.is_running = false;
        s.state = PipelineState::Completed;
    });
    info!(pipeline = %shared.label, total, "pipeline completed");
}
