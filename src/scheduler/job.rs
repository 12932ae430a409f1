use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};
use crate::renderlog::{LogHeader, LogWriter, RenderLog};
use crate::scheduler::queue::FrameQueue;

/// Characters that would break out of the remote shell command line.
const ILLEGAL_PATH_CHARS: &[char] = &[';', '&', '|', '`', '$', '\n', '\r'];

/// Most frames one job may hold, main range and extra frames together.
pub const MAX_FRAMES: usize = 1_000_000;

/// Length of `start..=end`, or `None` if it is empty or longer than [`MAX_FRAMES`].
fn range_len(start: i64, end: i64) -> Option<usize> {
    let len = end.checked_sub(start)?.checked_add(1)?;
    usize::try_from(len)
        .ok()
        .filter(|n| (1..=MAX_FRAMES).contains(n))
}

/// Number of frame slots for a range plus extras, checking the frame layout.
fn frame_total(start: i64, end: i64, extra_frames: &[i64]) -> Result<usize> {
    if end < start {
        return Err(ControllerError::Validation(format!(
            "end frame {} is before start frame {}",
            end, start
        )));
    }
    if let Some(frame) = extra_frames.iter().find(|f| (start..=end).contains(*f)) {
        return Err(ControllerError::Validation(format!(
            "extra frame {} is inside the frame range {}-{}",
            frame, start, end
        )));
    }
    range_len(start, end)
        .and_then(|n| n.checked_add(extra_frames.len()))
        .filter(|n| *n <= MAX_FRAMES)
        .ok_or_else(|| {
            ControllerError::Validation(format!(
                "frames {}-{} plus {} extra frames exceed the limit of {} frames",
                start,
                end,
                extra_frames.len(),
                MAX_FRAMES
            ))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Rendering,
    Stopped,
    Paused,
    Finished,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "Waiting"),
            JobStatus::Rendering => write!(f, "Rendering"),
            JobStatus::Stopped => write!(f, "Stopped"),
            JobStatus::Paused => write!(f, "Paused"),
            JobStatus::Finished => write!(f, "Finished"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    #[serde(alias = "normal")]
    Normal,
    #[serde(alias = "high")]
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Normal => write!(f, "Normal"),
            Priority::High => write!(f, "High"),
        }
    }
}

/// Render engine used for a job. Selects the command line and output parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    #[serde(alias = "blend")]
    Blender,
    #[serde(alias = "tgd")]
    Terragen,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Engine::Blender => write!(f, "blender"),
            Engine::Terragen => write!(f, "terragen"),
        }
    }
}

/// Why a frame attempt on a node was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    BrokenStream,
    EngineError(String),
    LaunchFailed(String),
    WorkerPanic,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "Timeout"),
            FailureReason::BrokenStream => write!(f, "Broken pipe"),
            FailureReason::EngineError(text) => write!(f, "Engine error: {}", text),
            FailureReason::LaunchFailed(text) => write!(f, "Launch failed: {}", text),
            FailureReason::WorkerPanic => write!(f, "Worker panicked"),
        }
    }
}

/// Per-node view of one job. Present for every node in the farm, even idle ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub active: bool,
    pub frame: Option<i64>,
    pub attempt: u64,
    pub assigned_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub progress: f64,
    pub last_error: Option<String>,
    #[serde(skip)]
    last_activity: Option<Instant>,
}

impl NodeStatus {
    fn is_current(&self, attempt: u64) -> bool {
        self.active && self.attempt == attempt
    }

    fn reset(&mut self) {
        let last_error = self.last_error.take();
        *self = NodeStatus {
            last_error,
            ..Default::default()
        };
    }
}

/// A node excluded from new assignments after a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipEntry {
    pub node: String,
    pub since: DateTime<Utc>,
}

/// Parameters accepted by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueParams {
    pub path: String,
    pub start_frame: i64,
    pub end_frame: i64,
    pub extra_frames: Vec<i64>,
    pub engine: Engine,
    pub nodes: Vec<String>,
    pub priority: Priority,
}

impl EnqueueParams {
    pub fn new(path: &str, start_frame: i64, end_frame: i64, nodes: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            start_frame,
            end_frame,
            extra_frames: Vec::new(),
            engine: Engine::Blender,
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            priority: Priority::Normal,
        }
    }

    pub fn with_extra_frames(mut self, extra_frames: &[i64]) -> Self {
        self.extra_frames = extra_frames.to_vec();
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Checks everything that does not touch the filesystem.
    pub fn validate(&self, universe: &[String]) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(ControllerError::Validation("path is empty".to_string()));
        }
        if let Some(c) = self.path.chars().find(|c| ILLEGAL_PATH_CHARS.contains(c)) {
            return Err(ControllerError::Validation(format!(
                "path contains illegal character {:?}",
                c
            )));
        }
        frame_total(self.start_frame, self.end_frame, &self.extra_frames)?;
        if self.nodes.is_empty() {
            return Err(ControllerError::Validation("node pool is empty".to_string()));
        }
        if let Some(node) = self.nodes.iter().find(|n| !universe.contains(n)) {
            return Err(ControllerError::NodeNotFound(node.clone()));
        }
        Ok(())
    }
}

/// The project file must be visible from the controller.
pub fn validate_path(path: &str) -> Result<()> {
    if Path::new(path).is_file() {
        Ok(())
    } else {
        Err(ControllerError::Validation(format!(
            "path {} does not exist or is not a regular file",
            path
        )))
    }
}

/// A frame handed to a node by one dispatch round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAssignment {
    pub node: String,
    pub frame: i64,
    pub attempt: u64,
}

/// Result of one dispatcher round.
#[derive(Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    Continue {
        launches: Vec<FrameAssignment>,
        kills: Vec<(String, u32)>,
    },
    Finished,
    Exit,
}

/// Handle for a dispatcher run, returned by [`RenderJob::begin_run`].
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub run_id: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct RunState {
    id: u64,
    token: CancellationToken,
    started: Instant,
}

/// Elapsed, average-per-frame and estimated remaining time, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobTimes {
    pub elapsed: f64,
    pub average: f64,
    pub remaining: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: String,
    pub path: String,
    pub start_frame: i64,
    pub end_frame: i64,
    pub extra_frames: Vec<i64>,
    pub engine: Engine,
    pub node_pool: Vec<String>,
    pub status: JobStatus,
    pub priority: Priority,
    /// One slot per expected frame, holding the frame number once rendered.
    pub frame_slots: Vec<Option<i64>>,
    /// Farm node order; dispatch iterates the pool in this order.
    pub node_order: Vec<String>,
    pub node_state: BTreeMap<String, NodeStatus>,
    pub skip_list: VecDeque<SkipEntry>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Render time accumulated by earlier runs.
    pub elapsed_ms: u64,
    #[serde(skip)]
    queue: FrameQueue,
    #[serde(skip)]
    run: Option<RunState>,
    #[serde(skip)]
    run_counter: u64,
    #[serde(skip)]
    attempt_counter: u64,
    #[serde(skip)]
    log: Option<RenderLog>,
}

impl RenderJob {
    /// Create a `Waiting` job. Nothing is created if validation fails.
    pub fn new(id: &str, params: EnqueueParams, universe: &[String]) -> Result<Self> {
        params.validate(universe)?;
        validate_path(&params.path)?;

        let mut extra_frames = params.extra_frames;
        extra_frames.sort_unstable();
        extra_frames.dedup();

        let total = frame_total(params.start_frame, params.end_frame, &extra_frames)?;
        let node_state = universe
            .iter()
            .map(|n| (n.clone(), NodeStatus::default()))
            .collect();

        let mut node_pool: Vec<String> = Vec::new();
        for node in params.nodes {
            if !node_pool.contains(&node) {
                node_pool.push(node);
            }
        }

        Ok(Self {
            id: id.to_string(),
            queue: FrameQueue::for_frames(params.start_frame, params.end_frame, &extra_frames),
            path: params.path,
            start_frame: params.start_frame,
            end_frame: params.end_frame,
            extra_frames,
            engine: params.engine,
            node_pool,
            status: JobStatus::Waiting,
            priority: params.priority,
            frame_slots: vec![None; total],
            node_order: universe.to_vec(),
            node_state,
            skip_list: VecDeque::new(),
            queued_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            elapsed_ms: 0,
            run: None,
            run_counter: 0,
            attempt_counter: 0,
            log: None,
        })
    }

    /// Prepare a job read back from a snapshot for use in this process.
    ///
    /// Node assignments are reset, frames that were in flight are requeued, and
    /// `Rendering` jobs come back as `Waiting` so the caller can restart them.
    /// Returns true if the job was rendering when the snapshot was taken, or a
    /// `ValidationError` if the saved frame layout is unusable.
    pub fn restore(&mut self, universe: &[String]) -> Result<bool> {
        self.extra_frames.sort_unstable();
        self.extra_frames.dedup();
        let expected = frame_total(self.start_frame, self.end_frame, &self.extra_frames)?;
        let was_rendering = self.status == JobStatus::Rendering;

        self.node_order = universe.to_vec();
        let mut node_state = BTreeMap::new();
        for node in universe {
            let mut state = self.node_state.remove(node).unwrap_or_default();
            state.reset();
            node_state.insert(node.clone(), state);
        }
        self.node_state = node_state;
        self.skip_list.clear();
        self.run = None;

        self.frame_slots.resize(expected, None);
        let rendered: Vec<i64> = self.frame_slots.iter().flatten().copied().collect();
        self.queue = if self.status == JobStatus::Finished {
            FrameQueue::new()
        } else {
            FrameQueue::for_pending(self.start_frame, self.end_frame, &self.extra_frames, |f| {
                !rendered.contains(&f)
            })
        };

        if was_rendering {
            self.status = JobStatus::Waiting;
        }
        Ok(was_rendering)
    }

    /// Snapshot copy with the running portion of the timer folded into `elapsed_ms`.
    pub fn snapshot_record(&self) -> RenderJob {
        RenderJob {
            id: self.id.clone(),
            path: self.path.clone(),
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            extra_frames: self.extra_frames.clone(),
            engine: self.engine,
            node_pool: self.node_pool.clone(),
            status: self.status,
            priority: self.priority,
            frame_slots: self.frame_slots.clone(),
            node_order: self.node_order.clone(),
            node_state: self.node_state.clone(),
            skip_list: self.skip_list.clone(),
            queued_at: self.queued_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            elapsed_ms: self.elapsed().as_millis() as u64,
            queue: FrameQueue::new(),
            run: None,
            run_counter: 0,
            attempt_counter: 0,
            log: None,
        }
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn total_frames(&self) -> usize {
        self.frame_slots.len()
    }

    pub fn completed_frames(&self) -> Vec<i64> {
        self.frame_slots.iter().flatten().copied().collect()
    }

    pub fn is_rendered(&self, frame: i64) -> bool {
        self.slot_index(frame)
            .and_then(|i| self.frame_slots.get(i))
            .is_some_and(|slot| slot.is_some())
    }

    fn slot_index(&self, frame: i64) -> Option<usize> {
        if (self.start_frame..=self.end_frame).contains(&frame) {
            return usize::try_from(frame.checked_sub(self.start_frame)?).ok();
        }
        let main_len = range_len(self.start_frame, self.end_frame)?;
        self.extra_frames
            .binary_search(&frame)
            .ok()
            .map(|i| main_len + i)
    }

    pub fn progress(&self) -> f64 {
        if self.status == JobStatus::Finished {
            return 100.0;
        }
        if self.frame_slots.is_empty() {
            return 0.0;
        }
        let done = self.frame_slots.iter().filter(|s| s.is_some()).count();
        done as f64 / self.frame_slots.len() as f64 * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        let running = self
            .run
            .as_ref()
            .map(|r| r.started.elapsed())
            .unwrap_or_default();
        Duration::from_millis(self.elapsed_ms) + running
    }

    pub fn times(&self) -> JobTimes {
        let elapsed = self.elapsed().as_secs_f64();
        let done = self.frame_slots.iter().filter(|s| s.is_some()).count();
        let average = if done == 0 { 0.0 } else { elapsed / done as f64 };
        let remaining = if self.status == JobStatus::Rendering {
            average * (self.frame_slots.len() - done) as f64
        } else {
            0.0
        };
        JobTimes {
            elapsed,
            average,
            remaining,
        }
    }

    pub fn is_skipped(&self, node: &str) -> bool {
        self.skip_list.iter().any(|e| e.node == node)
    }

    pub fn has_active_nodes(&self) -> bool {
        self.node_state.values().any(|s| s.active)
    }

    /// True while `attempt` is the node's live assignment.
    pub fn is_assigned(&self, node: &str, attempt: u64) -> bool {
        self.node_state.get(node).is_some_and(|s| s.is_current(attempt))
    }

    pub fn is_current_run(&self, run_id: u64) -> bool {
        self.run.as_ref().is_some_and(|r| r.id == run_id)
    }

    /// `Waiting` -> `Rendering`. The caller spawns the dispatcher for the returned run.
    pub fn begin_run(&mut self, logs: &LogWriter) -> Result<RunTicket> {
        if self.status != JobStatus::Waiting {
            return Err(ControllerError::status(&self.id, self.status, "start"));
        }

        let log = self.log.get_or_insert_with(|| {
            RenderLog::new(logs, &self.path, self.queued_at, self.frame_slots.len())
        });
        log.started(&LogHeader {
            project: &self.path,
            start_frame: self.start_frame,
            end_frame: self.end_frame,
            extra_frames: &self.extra_frames,
            nodes: &self.node_pool,
        });

        self.skip_list.clear();
        self.run_counter += 1;
        let token = CancellationToken::new();
        self.run = Some(RunState {
            id: self.run_counter,
            token: token.clone(),
            started: Instant::now(),
        });
        self.status = JobStatus::Rendering;
        self.started_at = Some(Utc::now());
        self.stopped_at = None;

        tracing::info!(job_id = %self.id, run_id = self.run_counter, "Render started");
        Ok(RunTicket {
            run_id: self.run_counter,
            token,
        })
    }

    /// Freeze the timer and cancel the dispatcher of the current run.
    fn end_run(&mut self) {
        if let Some(run) = self.run.take() {
            self.elapsed_ms += run.started.elapsed().as_millis() as u64;
            run.token.cancel();
        }
        self.stopped_at = Some(Utc::now());
    }

    /// `Rendering` -> `Stopped`, killing every in-flight frame.
    ///
    /// Returns the `(node, pid)` pairs the caller should kill remotely.
    pub fn stop_now(&mut self) -> Result<Vec<(String, u32)>> {
        if self.status != JobStatus::Rendering {
            return Err(ControllerError::status(&self.id, self.status, "stop"));
        }
        self.status = JobStatus::Stopped;
        self.end_run();
        self.log_stopped();

        let active: Vec<String> = self
            .node_state
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(n, _)| n.clone())
            .collect();
        let kills = active
            .iter()
            .filter_map(|node| self.release_node(node).map(|pid| (node.clone(), pid)))
            .collect();

        tracing::info!(job_id = %self.id, "Render stopped, in-flight frames requeued");
        Ok(kills)
    }

    /// `Rendering` -> `final_status` without touching in-flight frames.
    ///
    /// Already dispatched frames keep running and still land in the frame slots.
    pub fn stop_later(&mut self, final_status: JobStatus) -> Result<()> {
        if self.status != JobStatus::Rendering {
            return Err(ControllerError::status(&self.id, self.status, "stop"));
        }
        self.status = final_status;
        self.end_run();
        self.log_stopped();
        tracing::info!(job_id = %self.id, status = %final_status, "Render winding down, in-flight frames will finish");
        Ok(())
    }

    fn log_stopped(&self) {
        if let Some(log) = &self.log {
            let times = self.times();
            log.stopped(times.elapsed, times.average);
        }
    }

    /// `Stopped`/`Paused` -> `Waiting`, with every node assignment reset.
    ///
    /// Frames still running from a stop that let them finish are abandoned and
    /// requeued. Returns the `(node, pid)` pairs the caller should kill remotely.
    pub fn resume(&mut self) -> Result<Vec<(String, u32)>> {
        if !matches!(self.status, JobStatus::Stopped | JobStatus::Paused) {
            return Err(ControllerError::status(&self.id, self.status, "resume"));
        }
        let nodes: Vec<String> = self.node_state.keys().cloned().collect();
        let mut kills = Vec::new();
        for node in nodes {
            if let Some(pid) = self.release_node(&node) {
                kills.push((node.clone(), pid));
            }
            if let Some(state) = self.node_state.get_mut(&node) {
                *state = NodeStatus::default();
            }
        }
        self.status = JobStatus::Waiting;
        if !kills.is_empty() {
            tracing::info!(job_id = %self.id, processes = kills.len(), "Killing frames left over from the previous run");
        }
        Ok(kills)
    }

    /// Clear a node's assignment and requeue its frame. Returns the pid to kill.
    fn release_node(&mut self, node: &str) -> Option<u32> {
        let state = self.node_state.get_mut(node)?;
        if !state.active {
            return None;
        }
        let frame = state.frame;
        let pid = state.pid;
        state.reset();

        if let Some(frame) = frame {
            if !self.is_rendered(frame) {
                self.queue.push(frame);
            }
        }
        if let (Some(pid), Some(log)) = (pid, &self.log) {
            log.process_killed(pid, node);
        }
        pid
    }

    /// Add `node` to the pool if absent, remove it otherwise. Returns true if added.
    pub fn toggle_node(&mut self, node: &str) -> Result<bool> {
        if !self.node_state.contains_key(node) {
            return Err(ControllerError::NodeNotFound(node.to_string()));
        }
        let rendering = self.status == JobStatus::Rendering;
        if let Some(pos) = self.node_pool.iter().position(|n| n == node) {
            self.node_pool.remove(pos);
            if let (true, Some(log)) = (rendering, &self.log) {
                log.node_removed(node);
            }
            tracing::info!(job_id = %self.id, node, "Node removed from pool");
            Ok(false)
        } else {
            self.node_pool.push(node.to_string());
            if let (true, Some(log)) = (rendering, &self.log) {
                log.node_added(node);
            }
            tracing::info!(job_id = %self.id, node, "Node added to pool");
            Ok(true)
        }
    }

    /// Remove `node` from the pool and abandon its frame. Returns the pid to kill.
    ///
    /// Fails without side effects unless the node is running a process for this job.
    pub fn kill_node(&mut self, node: &str) -> Result<u32> {
        let state = self
            .node_state
            .get(node)
            .ok_or_else(|| ControllerError::NodeNotFound(node.to_string()))?;
        let pid = match (state.active, state.pid) {
            (true, Some(pid)) => pid,
            _ => return Err(ControllerError::status(&self.id, self.status, "kill a frame of")),
        };

        if let Some(pos) = self.node_pool.iter().position(|n| n == node) {
            self.node_pool.remove(pos);
            if let (true, Some(log)) = (self.status == JobStatus::Rendering, &self.log) {
                log.node_removed(node);
            }
        }
        self.release_node(node);
        if let Some(state) = self.node_state.get_mut(node) {
            state.last_error = Some("Killed".to_string());
        }
        tracing::info!(job_id = %self.id, node, pid, "Killed frame on node");
        Ok(pid)
    }

    /// Returns false if the priority was already set.
    pub fn set_priority(&mut self, priority: Priority) -> bool {
        if self.priority == priority {
            return false;
        }
        self.priority = priority;
        true
    }

    /// One pass of the dispatch loop.
    pub fn dispatch_round(&mut self, run_id: u64, node_timeout: Duration) -> RoundOutcome {
        if self.status != JobStatus::Rendering || !self.is_current_run(run_id) {
            return RoundOutcome::Exit;
        }

        if self.queue.is_empty() && !self.has_active_nodes() {
            self.status = JobStatus::Finished;
            self.end_run();
            if let Some(log) = &self.log {
                let times = self.times();
                log.finished(times.elapsed, times.average);
            }
            tracing::info!(job_id = %self.id, frames = self.frame_slots.len(), "Render finished");
            return RoundOutcome::Finished;
        }

        let enabled: Vec<String> = self
            .node_order
            .iter()
            .filter(|n| self.node_pool.contains(n))
            .cloned()
            .collect();
        if !enabled.is_empty() && enabled.iter().all(|n| self.is_skipped(n)) {
            tracing::warn!(job_id = %self.id, "Every pool node is skip-listed, releasing the oldest");
            self.evict_oldest_skip();
        }

        let mut launches = Vec::new();
        for node in &enabled {
            let idle = self.node_state.get(node).is_some_and(|s| !s.active);
            if !idle || self.is_skipped(node) {
                continue;
            }
            let Some(frame) = self.next_pending_frame() else {
                break;
            };
            self.attempt_counter += 1;
            let attempt = self.attempt_counter;
            if let Some(state) = self.node_state.get_mut(node) {
                *state = NodeStatus {
                    active: true,
                    frame: Some(frame),
                    attempt,
                    assigned_at: Some(Utc::now()),
                    last_activity: Some(Instant::now()),
                    ..Default::default()
                };
            }
            if let Some(log) = &self.log {
                log.frame_sent(frame, node);
            }
            tracing::debug!(job_id = %self.id, node = %node, frame, attempt, "Frame sent");
            launches.push(FrameAssignment {
                node: node.clone(),
                frame,
                attempt,
            });
        }

        // Timeouts are checked on every active node, including ones that left the pool.
        let timed_out: Vec<(String, u64)> = self
            .node_state
            .iter()
            .filter(|(_, s)| {
                s.active
                    && s.last_activity
                        .is_some_and(|t| t.elapsed() > node_timeout)
            })
            .map(|(n, s)| (n.clone(), s.attempt))
            .collect();
        let mut kills = Vec::new();
        for (node, attempt) in timed_out {
            if let Some(pid) = self.fail_node(&node, attempt, FailureReason::Timeout) {
                kills.push((node, pid));
            }
        }

        RoundOutcome::Continue { launches, kills }
    }

    fn next_pending_frame(&mut self) -> Option<i64> {
        while let Some(frame) = self.queue.pop() {
            if !self.is_rendered(frame) {
                return Some(frame);
            }
        }
        None
    }

    /// Shared failure path for timeouts, broken streams and engine errors.
    ///
    /// A no-op unless `attempt` is still the node's current assignment. Returns the
    /// pid that should be killed remotely, if one was known.
    pub fn fail_node(&mut self, node: &str, attempt: u64, reason: FailureReason) -> Option<u32> {
        let state = self.node_state.get_mut(node)?;
        if !state.is_current(attempt) {
            tracing::debug!(job_id = %self.id, node, attempt, "Ignoring failure for a cleared assignment");
            return None;
        }
        let frame = state.frame;
        let pid = state.pid;
        state.reset();
        state.last_error = Some(reason.to_string());

        if !self.is_skipped(node) {
            self.skip_list.push_back(SkipEntry {
                node: node.to_string(),
                since: Utc::now(),
            });
        }
        if let Some(frame) = frame {
            if !self.is_rendered(frame) {
                self.queue.push(frame);
            }
            if let Some(log) = &self.log {
                log.frame_failed(frame, node, &reason.to_string());
            }
        }
        if let (Some(pid), Some(log)) = (pid, &self.log) {
            log.process_killed(pid, node);
        }
        tracing::warn!(job_id = %self.id, node, frame = ?frame, reason = %reason, "Frame failed, node skip-listed");
        pid
    }

    /// Record a rendered frame. Slots are idempotent, and a stale attempt never
    /// clears a newer assignment on the same node.
    pub fn frame_saved(&mut self, node: &str, attempt: u64, frame: i64, render_time: Option<Duration>) {
        if let Some(slot) = self.slot_index(frame).and_then(|i| self.frame_slots.get_mut(i)) {
            *slot = Some(frame);
        }
        if let Some(state) = self.node_state.get_mut(node) {
            if state.is_current(attempt) {
                *state = NodeStatus::default();
            }
        }
        if let Some(log) = &self.log {
            log.frame_received(frame, node, render_time);
        }
        tracing::info!(job_id = %self.id, node, frame, render_time = ?render_time, "Frame received");
        self.evict_oldest_skip();
    }

    pub fn record_progress(&mut self, node: &str, attempt: u64, percent: f64) {
        if let Some(state) = self.node_state.get_mut(node).filter(|s| s.is_current(attempt)) {
            state.progress = percent.clamp(0.0, 100.0);
            state.last_activity = Some(Instant::now());
        }
    }

    /// Returns false if the attempt is no longer current.
    pub fn record_pid(&mut self, node: &str, attempt: u64, pid: u32) -> bool {
        match self.node_state.get_mut(node).filter(|s| s.is_current(attempt)) {
            Some(state) => {
                state.pid = Some(pid);
                state.last_activity = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    /// Remove the oldest skip-list entry and clear that node's error.
    fn evict_oldest_skip(&mut self) {
        if let Some(entry) = self.skip_list.pop_front() {
            if let Some(state) = self.node_state.get_mut(&entry.node).filter(|s| !s.active) {
                *state = NodeStatus::default();
            }
            tracing::info!(job_id = %self.id, node = %entry.node, "Node released from skip list");
        }
    }

    /// Note an interrupted render in the audit log at shutdown.
    pub fn note_shutdown(&mut self, logs: &LogWriter) {
        if self.status == JobStatus::Finished {
            return;
        }
        let log = self.log.get_or_insert_with(|| {
            RenderLog::new(logs, &self.path, self.queued_at, self.frame_slots.len())
        });
        if self.started_at.is_some() {
            log.server_shutdown();
        }
    }

    /// Status view sent to clients.
    pub fn attrs(&self) -> JobAttrs<'_> {
        JobAttrs {
            job: self,
            progress: self.progress(),
            times: self.times(),
            queued_frames: self.queue.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobAttrs<'a> {
    #[serde(flatten)]
    pub job: &'a RenderJob,
    pub progress: f64,
    pub times: JobTimes,
    pub queued_frames: usize,
}
