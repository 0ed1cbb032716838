//! Process lifecycle: ordered startup of the relay tasks and two-phase
//! cooperative shutdown.
//!
//! Shutdown sequence:
//! 1. cancel `stop` and join the ingestion loop (no new requests),
//! 2. shut the queue down and give workers plus the reply loop
//!    `shutdown_grace` to drain what is already buffered,
//! 3. on expiry cancel `abort` so workers publish `Cancelled` for in-flight
//!    and queued requests, wait `abort_grace`,
//! 4. abort whatever is still running.

use crate::authorizer::Authorizer;
use crate::backend::CompletionBackend;
use crate::config::RelayConfig;
use crate::frontend::{ChatFrontend, FrontendSettings};
use crate::messages::Localization;
use crate::queue::RequestQueue;
use crate::request::RequestIdGenerator;
use crate::worker::{AiWorker, RetryPolicy};
use relay_channels::ChatPlatform;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const MIN_REPLY_CHANNEL_CAPACITY: usize = 64;

/// Collaborators injected into the relay.
pub struct Components {
    pub platform: Arc<dyn ChatPlatform>,
    pub authorizer: Arc<dyn Authorizer>,
    pub backend: Arc<dyn CompletionBackend>,
    pub localization: Arc<Localization>,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// `0` means unbounded.
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub retry: RetryPolicy,
    pub frontend: FrontendSettings,
    pub shutdown_grace: Duration,
    pub abort_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &RelayConfig) -> Self {
        Self {
            queue_capacity: cfg.queue.capacity,
            worker_count: cfg.worker.count,
            retry: RetryPolicy::from_config(&cfg.worker),
            frontend: FrontendSettings::from_config(&cfg.frontend),
            shutdown_grace: cfg.shutdown_grace(),
            abort_grace: cfg.abort_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    Ingestion,
    Worker,
    ReplyLoop,
}

struct SupervisedTask {
    name: String,
    role: TaskRole,
    handle: JoinHandle<()>,
    finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every worker and the reply loop finished within the grace period.
    pub drained: bool,
    /// Requests still buffered when the queue was closed.
    pub pending_at_close: usize,
    /// Tasks that had to be aborted.
    pub aborted_tasks: Vec<String>,
}

pub struct ProcessSupervisor {
    queue: Arc<RequestQueue>,
    stop: CancellationToken,
    abort: CancellationToken,
    tasks: Vec<SupervisedTask>,
    shutdown_grace: Duration,
    abort_grace: Duration,
}

impl ProcessSupervisor {
    /// Brings the relay up in dependency order. Must be called inside a
    /// tokio runtime.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn start(components: Components, settings: SupervisorSettings) -> anyhow::Result<Self> {
        if settings.worker_count == 0 {
            return Err(anyhow::anyhow!("at least one worker is required"));
        }

        components.authorizer.ready()?;

        let queue = Arc::new(RequestQueue::new(settings.queue_capacity));
        tracing::info!(capacity = settings.queue_capacity, "request queue ready");

        let mut supervisor = Self {
            queue: Arc::clone(&queue),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            tasks: Vec::new(),
            shutdown_grace: settings.shutdown_grace,
            abort_grace: settings.abort_grace,
        };

        let reply_capacity = settings.queue_capacity.max(MIN_REPLY_CHANNEL_CAPACITY) + settings.worker_count;
        let (reply_tx, reply_rx) = mpsc::channel(reply_capacity);
        let abort = supervisor.abort.clone();
        for id in 0..settings.worker_count {
            let worker = AiWorker::new(
                id,
                Arc::clone(&queue),
                Arc::clone(&components.backend),
                reply_tx.clone(),
                settings.retry.clone(),
            );
            supervisor.spawn(format!("worker-{id}"), TaskRole::Worker, worker.run(abort.clone()));
        }
        drop(reply_tx);
        tracing::info!(workers = settings.worker_count, "workers started");

        let frontend = Arc::new(ChatFrontend::new(
            Arc::clone(&components.platform),
            Arc::clone(&components.authorizer),
            Arc::clone(&queue),
            components.localization,
            Arc::new(RequestIdGenerator::new()),
            settings.frontend,
        ));
        supervisor.spawn(
            "reply-loop".to_string(),
            TaskRole::ReplyLoop,
            Arc::clone(&frontend).run_replies(reply_rx),
        );
        tracing::info!("reply loop started");

        let stop = supervisor.stop.clone();
        supervisor.spawn("ingestion".to_string(), TaskRole::Ingestion, frontend.run_ingestion(stop));
        tracing::info!(platform = %components.platform.platform_id(), "ingestion started; relay is up");

        Ok(supervisor)
    }

    fn spawn<F>(&mut self, name: String, role: TaskRole, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = %name, ?role, "spawning task");
        self.tasks.push(SupervisedTask {
            name,
            role,
            handle: tokio::spawn(task),
            finished: false,
        });
    }

    /// Cancelling this token starts shutdown; the ingestion loop also cancels
    /// it when the platform stream ends.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn shutdown(mut self) -> ShutdownReport {
        tracing::info!("shutdown started");
        self.stop.cancel();
        let ingestion_deadline = Instant::now() + self.shutdown_grace;
        if !self.join_roles(&[TaskRole::Ingestion], ingestion_deadline).await {
            tracing::warn!("ingestion loop did not stop in time");
        }

        self.queue.shutdown();
        let pending_at_close = self.queue.len();
        tracing::info!(pending = pending_at_close, grace_secs = self.shutdown_grace.as_secs_f64(), "draining in-flight requests");

        let drain_deadline = Instant::now() + self.shutdown_grace;
        let drained = self
            .join_roles(&[TaskRole::Worker, TaskRole::ReplyLoop], drain_deadline)
            .await;

        if !drained {
            tracing::warn!(
                abort_grace_secs = self.abort_grace.as_secs_f64(),
                "grace period expired; cancelling in-flight requests"
            );
            self.abort.cancel();
            let abort_deadline = Instant::now() + self.abort_grace;
            self.join_roles(
                &[TaskRole::Ingestion, TaskRole::Worker, TaskRole::ReplyLoop],
                abort_deadline,
            )
            .await;
        }

        let aborted_tasks = self.abort_survivors().await;
        let report = ShutdownReport {
            drained,
            pending_at_close,
            aborted_tasks,
        };
        tracing::info!(
            drained = report.drained,
            pending_at_close = report.pending_at_close,
            aborted = ?report.aborted_tasks,
            "shutdown finished"
        );
        report
    }

    /// Joins unfinished tasks with one of `roles` until `deadline`. Returns
    /// true if all of them finished.
    async fn join_roles(&mut self, roles: &[TaskRole], deadline: Instant) -> bool {
        let mut all_finished = true;
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| !t.finished && roles.contains(&t.role))
        {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => {
                    task.finished = true;
                    tracing::debug!(task = %task.name, "task joined");
                }
                Ok(Err(e)) => {
                    task.finished = true;
                    tracing::error!(task = %task.name, error = %e, "task failed");
                }
                Err(_) => {
                    all_finished = false;
                }
            }
        }
        all_finished
    }

    async fn abort_survivors(&mut self) -> Vec<String> {
        let mut aborted = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| !t.finished) {
            tracing::warn!(task = %task.name, "aborting task");
            task.handle.abort();
            if let Err(e) = (&mut task.handle).await {
                if !e.is_cancelled() {
                    tracing::error!(task = %task.name, error = %e, "task failed while aborting");
                }
            }
            task.finished = true;
            aborted.push(task.name.clone());
        }
        aborted
    }
}
