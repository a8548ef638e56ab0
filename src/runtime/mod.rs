//! The polling loop. One long-running task drives the whole agent: refresh
//! credentials, report metrics, fetch the next task, dispatch it, sleep
//! with jitter, repeat. Nothing in here is fatal; the agent is built to
//! outlive arbitrary control-plane downtime.

use anyhow::{Context, Result};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::auth::AuthManager;
use crate::client::{ControlPlaneApi, PollResponse};
use crate::handlers::{CleanupHandler, DeployHandler, UpdateHandler};
use crate::metrics::SystemProbe;
use crate::types::{
    AgentState, AgentStatus, AgentTask, CleanupTask, DeploymentStepTask, UpdateTask,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const FAST_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_FILE: &str = "shutdown.signal";
const SHUTDOWN_PROBE_INTERVAL: Duration = Duration::from_secs(1);

enum Flow {
    Continue,
    ExitForUpdate,
}

pub struct AgentRuntime {
    client: Arc<dyn ControlPlaneApi>,
    auth: Arc<AuthManager>,
    probe: SystemProbe,
    deploy: DeployHandler,
    cleanup: CleanupHandler,
    update: UpdateHandler,
    version: String,
    work_dir: PathBuf,
    status: AgentStatus,
    state: AgentState,
    poll_interval: Duration,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ControlPlaneApi>,
        auth: Arc<AuthManager>,
        deploy: DeployHandler,
        cleanup: CleanupHandler,
        update: UpdateHandler,
        version: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            auth,
            probe: SystemProbe::new(),
            deploy,
            cleanup,
            update,
            version: version.into(),
            work_dir: work_dir.into(),
            status: AgentStatus::Healthy,
            state: AgentState::Waiting,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Run until a shutdown signal or a dispatched self-update.
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown = spawn_shutdown_watcher(self.work_dir.clone());
        log::info!(
            "polling loop started (interval {}s)",
            DEFAULT_POLL_INTERVAL.as_secs()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Flow::ExitForUpdate = self.poll_once().await {
                log::info!("update dispatched, exiting polling loop");
                return Ok(());
            }

            let sleep_for = jittered(self.poll_interval);
            log::debug!(
                "status={} state={}, next poll in {}s",
                self.status.as_str(),
                self.state.as_str(),
                sleep_for.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }

        log::info!("shutdown signal received, going offline");
        if let Err(e) = self.client.set_offline().await {
            log::warn!("set-offline failed: {e:#}");
        }
        Ok(())
    }

    /// One loop iteration: refresh, poll, dispatch. Every failure lands in
    /// a status transition instead of an error.
    async fn poll_once(&mut self) -> Flow {
        self.auth.ensure_valid().await;
        let envelope = self
            .probe
            .envelope(&self.version, self.status, self.state)
            .await;

        match self.client.next_task(&envelope).await {
            Ok(PollResponse::Task(task)) => {
                self.state = AgentState::Busy;
                self.status = AgentStatus::Healthy;
                let flow = match self.dispatch(task).await {
                    Ok(flow) => {
                        self.status = AgentStatus::Healthy;
                        flow
                    }
                    Err(e) => {
                        log::error!("task execution failed: {e:#}");
                        self.status = AgentStatus::Unhealthy;
                        Flow::Continue
                    }
                };
                self.state = AgentState::Waiting;
                flow
            }
            Ok(PollResponse::NoWork) => {
                self.poll_interval = DEFAULT_POLL_INTERVAL;
                if self.status == AgentStatus::Offline {
                    self.status = AgentStatus::Healthy;
                }
                Flow::Continue
            }
            Ok(PollResponse::Conflict) => Flow::Continue,
            Ok(PollResponse::ServerError(code)) => {
                log::warn!("next-task returned {code}, marking offline");
                self.status = AgentStatus::Offline;
                Flow::Continue
            }
            Err(e) => {
                log::warn!("poll failed: {e:#}");
                self.status = AgentStatus::Unhealthy;
                self.state = AgentState::Waiting;
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, task: AgentTask) -> Result<Flow> {
        log::info!("dispatching {} task {}", task.task_type, task.id);
        match task.task_type.as_str() {
            "Deploy" => {
                // tighter polling keeps the gap between steps small
                self.poll_interval = FAST_POLL_INTERVAL;
                let step: DeploymentStepTask =
                    serde_json::from_value(task.payload).context("decoding Deploy payload")?;
                let (_cancel_tx, cancel_rx) = watch::channel(false);
                self.deploy.handle(step, cancel_rx).await?;
                Ok(Flow::Continue)
            }
            "Cleanup" => {
                self.poll_interval = DEFAULT_POLL_INTERVAL;
                let cleanup: CleanupTask =
                    serde_json::from_value(task.payload).context("decoding Cleanup payload")?;
                self.cleanup.handle(cleanup).await?;
                Ok(Flow::Continue)
            }
            "Update" => {
                self.poll_interval = DEFAULT_POLL_INTERVAL;
                self.status = AgentStatus::Updating;
                let update: UpdateTask =
                    serde_json::from_value(task.payload).context("decoding Update payload")?;
                self.update.handle(update).await?;
                Ok(Flow::ExitForUpdate)
            }
            other => {
                self.poll_interval = DEFAULT_POLL_INTERVAL;
                log::warn!("unknown task type {other:?}, treating as no-op");
                Ok(Flow::Continue)
            }
        }
    }
}

/// Uniform jitter in [−1, +2] seconds, floored at 1 s. `RandomState` is the
/// process's seeded hasher, which is plenty for decorrelating poll times.
fn jittered(base: Duration) -> Duration {
    let jitter = jitter_seconds();
    let secs = (base.as_secs() as i64 + jitter).max(1);
    Duration::from_secs(secs as u64)
}

fn jitter_seconds() -> i64 {
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    (hasher.finish() % 4) as i64 - 1
}

/// Probe for `shutdown.signal` once a second. On detection the file is
/// deleted and `true` is published; the watcher then stops.
fn spawn_shutdown_watcher(work_dir: PathBuf) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let signal = work_dir.join(SHUTDOWN_FILE);
        loop {
            if signal.exists() {
                if let Err(e) = std::fs::remove_file(&signal) {
                    log::warn!("failed to remove {}: {e}", signal.display());
                }
                let _ = tx.send(true);
                break;
            }
            tokio::time::sleep(SHUTDOWN_PROBE_INTERVAL).await;
        }
    });
    rx
}
