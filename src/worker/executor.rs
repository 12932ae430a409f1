use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::scheduler::{Engine, FailureReason, JobStatus, SharedJob};

/// What a render process reported, decoded from its output.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    ProgressUpdate(f64),
    ProcessIdentified(u32),
    FrameSaved { render_time: Option<Duration> },
    WarningOrError(String),
}

/// One frame attempt on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRequest {
    pub job_id: String,
    pub node: String,
    pub path: String,
    pub frame: i64,
    pub engine: Engine,
    pub attempt: u64,
    /// Echo every output line at info level.
    pub verbose: bool,
}

/// Remote process control on render nodes.
///
/// `launch` starts the render and returns its decoded event stream. A stream
/// that closes without `FrameSaved` counts as a broken stream. Dropping the
/// receiver means the caller has lost interest in the process.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync + 'static {
    async fn launch(&self, request: &FrameRequest) -> Result<mpsc::Receiver<RenderEvent>>;

    async fn kill(&self, node: &str, pid: u32) -> Result<()>;

    /// Lower the scheduling priority of a render process.
    async fn renice(&self, node: &str, pid: u32) -> Result<()>;

    async fn killall(&self, node: &str, process_name: &str) -> Result<()>;
}

/// Best-effort remote kill. Failures are logged and otherwise ignored.
pub fn kill_in_background(adapter: Arc<dyn ExecutionAdapter>, node: String, pid: u32) {
    tokio::spawn(async move {
        match adapter.kill(&node, pid).await {
            Ok(()) => tracing::info!(node = %node, pid, "Sent kill signal"),
            Err(e) => tracing::warn!(node = %node, pid, error = %e, "Remote kill failed"),
        }
    });
}

/// Spawn the worker for one frame attempt.
///
/// A panic inside the worker is caught here and reported as a node failure.
pub fn spawn_worker(
    job: SharedJob,
    adapter: Arc<dyn ExecutionAdapter>,
    request: FrameRequest,
    renice: bool,
    idle_limit: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let inner = tokio::spawn(run_frame(
            job.clone(),
            adapter.clone(),
            request.clone(),
            renice,
            idle_limit,
        ));
        if let Err(e) = inner.await {
            if e.is_panic() {
                tracing::error!(
                    job_id = %request.job_id,
                    node = %request.node,
                    frame = request.frame,
                    "Frame worker panicked"
                );
                fail_frame(&job, &adapter, &request, FailureReason::WorkerPanic).await;
            }
        }
    })
}

/// Render one frame: launch, follow the event stream, write the outcome back.
///
/// After `idle_limit` of silence the worker gives up if the assignment has moved
/// on, and fails the frame with a timeout if its job is no longer rendering.
pub async fn run_frame(
    job: SharedJob,
    adapter: Arc<dyn ExecutionAdapter>,
    request: FrameRequest,
    renice: bool,
    idle_limit: Duration,
) {
    let FrameRequest {
        node,
        frame,
        attempt,
        ..
    } = &request;
    let started = Instant::now();

    let mut events = match adapter.launch(&request).await {
        Ok(events) => events,
        Err(e) => {
            fail_frame(&job, &adapter, &request, FailureReason::LaunchFailed(e.to_string())).await;
            return;
        }
    };

    loop {
        let event = match tokio::time::timeout(idle_limit, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                let (assigned, rendering) = {
                    let job = job.read().await;
                    (job.is_assigned(node, *attempt), job.status == JobStatus::Rendering)
                };
                if assigned && rendering {
                    // The dispatcher owns timeouts while the job renders.
                    continue;
                }
                if assigned {
                    tracing::warn!(job_id = %request.job_id, node = %node, frame, "Frame went silent after its job stopped");
                    fail_frame(&job, &adapter, &request, FailureReason::Timeout).await;
                } else {
                    tracing::debug!(job_id = %request.job_id, node = %node, frame, "Abandoning silent worker");
                }
                return;
            }
        };

        match event {
            RenderEvent::ProgressUpdate(percent) => {
                job.write().await.record_progress(node, *attempt, percent);
            }
            RenderEvent::ProcessIdentified(pid) => {
                let current = job.write().await.record_pid(node, *attempt, pid);
                if !current {
                    // Assignment was dropped before the pid arrived; nobody else can kill it.
                    kill_in_background(adapter.clone(), node.clone(), pid);
                    return;
                }
                tracing::debug!(job_id = %request.job_id, node = %node, frame, pid, "Render process identified");
                if renice {
                    if let Err(e) = adapter.renice(node, pid).await {
                        tracing::warn!(node = %node, pid, error = %e, "Renice failed");
                    }
                }
            }
            RenderEvent::FrameSaved { render_time } => {
                let render_time = render_time.or_else(|| Some(started.elapsed()));
                job.write().await.frame_saved(node, *attempt, *frame, render_time);
                return;
            }
            RenderEvent::WarningOrError(text) => {
                fail_frame(&job, &adapter, &request, FailureReason::EngineError(text)).await;
                return;
            }
        }
    }

    fail_frame(&job, &adapter, &request, FailureReason::BrokenStream).await;
}

async fn fail_frame(
    job: &SharedJob,
    adapter: &Arc<dyn ExecutionAdapter>,
    request: &FrameRequest,
    reason: FailureReason,
) {
    let pid = job
        .write()
        .await
        .fail_node(&request.node, request.attempt, reason);
    if let Some(pid) = pid {
        kill_in_background(adapter.clone(), request.node.clone(), pid);
    }
}
