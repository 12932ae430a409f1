//! Test harness for render controller integration tests.
//!
//! Provides a scripted execution adapter, short-timeout configs and a handle
//! for running a whole controller on an ephemeral port.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use render_controller::config::ControllerConfig;
use render_controller::error::{ControllerError, Result};
use render_controller::node::ControllerNode;
use render_controller::scheduler::Scheduler;
use render_controller::worker::{ExecutionAdapter, FrameRequest, RenderEvent};

/// How a mock render process behaves once launched.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report a pid and some progress, then save the frame after `delay`.
    Succeed { delay: Duration },
    /// Report a pid, then stay silent until killed or abandoned.
    Hang,
    /// Report a pid, then an engine error.
    Fail(String),
    /// Report a pid, then close the stream.
    Broken,
    /// The remote shell could not be started.
    LaunchError,
}

impl Behavior {
    pub fn quick() -> Self {
        Behavior::Succeed {
            delay: Duration::from_millis(20),
        }
    }

    pub fn slow(ms: u64) -> Self {
        Behavior::Succeed {
            delay: Duration::from_millis(ms),
        }
    }
}

/// A frame launch seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub job_id: String,
    pub node: String,
    pub frame: i64,
    pub attempt: u64,
    pub pid: u32,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<Behavior>>,
    defaults: HashMap<String, Behavior>,
    running: HashMap<u32, CancellationToken>,
    next_pid: u32,
    launches: Vec<Launch>,
    kills: Vec<(String, u32)>,
    killalls: Vec<(String, String)>,
}

/// Scripted stand-in for the remote shell executor.
///
/// Each node replays its scripted behaviors in order, then falls back to its
/// default (or the executor-wide default). `kill` ends the matching process.
pub struct MockExecutor {
    state: Mutex<MockState>,
    fallback: Behavior,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Self::with_default(Behavior::quick())
    }

    pub fn with_default(fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_pid: 4000,
                ..Default::default()
            }),
            fallback,
        })
    }

    /// Queue one behavior for the next launch on `node`.
    pub fn script(&self, node: &str, behavior: Behavior) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(node.to_string())
            .or_default()
            .push_back(behavior);
    }

    /// Behavior for every unscripted launch on `node`.
    pub fn set_default(&self, node: &str, behavior: Behavior) {
        let mut state = self.state.lock().unwrap();
        state.defaults.insert(node.to_string(), behavior);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn launches_for(&self, job_id: &str) -> Vec<Launch> {
        self.launches()
            .into_iter()
            .filter(|l| l.job_id == job_id)
            .collect()
    }

    pub fn kills(&self) -> Vec<(String, u32)> {
        self.state.lock().unwrap().kills.clone()
    }

    pub fn killalls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().killalls.clone()
    }

    fn next_behavior(&self, node: &str) -> (Behavior, u32, CancellationToken) {
        let mut state = self.state.lock().unwrap();
        let scripted = state.scripts.get_mut(node).and_then(|q| q.pop_front());
        let behavior = match scripted {
            Some(b) => b,
            None => state
                .defaults
                .get(node)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone()),
        };
        state.next_pid += 1;
        let pid = state.next_pid;
        let token = CancellationToken::new();
        state.running.insert(pid, token.clone());
        (behavior, pid, token)
    }
}

#[async_trait]
impl ExecutionAdapter for MockExecutor {
    async fn launch(&self, request: &FrameRequest) -> Result<mpsc::Receiver<RenderEvent>> {
        let (behavior, pid, killed) = self.next_behavior(&request.node);
        if let Behavior::LaunchError = behavior {
            return Err(ControllerError::RemoteControl {
                node: request.node.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.state.lock().unwrap().launches.push(Launch {
            job_id: request.job_id.clone(),
            node: request.node.clone(),
            frame: request.frame,
            attempt: request.attempt,
            pid,
        });

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if tx.send(RenderEvent::ProcessIdentified(pid)).await.is_err() {
                return;
            }
            match behavior {
                Behavior::Succeed { delay } => {
                    let _ = tx.send(RenderEvent::ProgressUpdate(50.0)).await;
                    tokio::select! {
                        _ = killed.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = tx
                                .send(RenderEvent::FrameSaved { render_time: Some(delay) })
                                .await;
                        }
                    }
                }
                Behavior::Hang => {
                    tokio::select! {
                        _ = killed.cancelled() => {}
                        _ = tx.closed() => {}
                    }
                }
                Behavior::Fail(message) => {
                    let _ = tx.send(RenderEvent::WarningOrError(message)).await;
                }
                Behavior::Broken | Behavior::LaunchError => {}
            }
        });
        Ok(rx)
    }

    async fn kill(&self, node: &str, pid: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.kills.push((node.to_string(), pid));
        if let Some(token) = state.running.remove(&pid) {
            token.cancel();
        }
        Ok(())
    }

    async fn renice(&self, _node: &str, _pid: u32) -> Result<()> {
        Ok(())
    }

    async fn killall(&self, node: &str, process_name: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .killalls
            .push((node.to_string(), process_name.to_string()));
        Ok(())
    }
}

/// Controller config with short timeouts, an ephemeral port and files under `dir`.
pub fn test_config(dir: &Path, nodes: &[&str]) -> ControllerConfig {
    let mut config =
        ControllerConfig::new("127.0.0.1:0".parse().unwrap()).with_linux_nodes(nodes);
    config.dispatch_interval_ms = 10;
    config.update_interval_ms = 50;
    config.node_timeout_ms = 5_000;
    config.request_timeout_ms = 2_000;
    config.autostart = false;
    config.log_dir = dir.to_path_buf();
    config.state_file = dir.join("serverstate.json");
    config
}

/// Create an empty project file the controller can validate.
pub fn project_file(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, b"").unwrap();
    path.to_str().unwrap().to_string()
}

/// Scheduler without the controller loop; autostart has to be driven by hand.
pub fn test_scheduler(config: ControllerConfig, adapter: Arc<MockExecutor>) -> Arc<Scheduler> {
    let (scheduler, _events) = Scheduler::new(config, adapter);
    Arc::new(scheduler)
}

pub async fn status_of(scheduler: &Scheduler, id: &str) -> String {
    scheduler.status(id).await.unwrap().to_string()
}

/// Rendered frames of a job, read from its client-visible attributes.
pub async fn rendered_frames(scheduler: &Scheduler, id: &str) -> Vec<i64> {
    let attrs = scheduler.attrs(id).await.unwrap();
    frames_in(&attrs)
}

pub fn frames_in(attrs: &Value) -> Vec<i64> {
    attrs["frame_slots"]
        .as_array()
        .map(|slots| slots.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// A whole controller (scheduler, protocol server, update loop) on an ephemeral port.
pub struct TestController {
    pub addr: SocketAddr,
    pub scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestController {
    pub async fn start(config: ControllerConfig, adapter: Arc<MockExecutor>) -> Self {
        let node = ControllerNode::with_adapter(config, adapter);
        let scheduler = node.scheduler();
        let shutdown = CancellationToken::new();
        let (addr, handle) = node.spawn(shutdown.clone()).await.unwrap();
        Self {
            addr,
            scheduler,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Cancel and wait for the final snapshot to be written.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

impl Drop for TestController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
