use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::persistence::{GlobalFlags, Snapshot};
use crate::renderlog::LogWriter;
use crate::scheduler::dispatcher::{DispatchContext, Dispatcher, SchedulerEvent};
use crate::scheduler::job::{EnqueueParams, JobStatus, Priority, RenderJob};
use crate::scheduler::SharedJob;
use crate::worker::executor::{kill_in_background, ExecutionAdapter};

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, SharedJob>,
    /// Ids eligible for autostart, oldest first. Holds only `Waiting`/`Paused` jobs.
    waitlist: VecDeque<String>,
}

/// Owns every render job and decides which ones render.
///
/// Lock order: scheduler state first, then a job lock. Dispatchers and workers
/// only ever take job locks.
pub struct Scheduler {
    config: Arc<ControllerConfig>,
    universe: Vec<String>,
    adapter: Arc<dyn ExecutionAdapter>,
    state: RwLock<SchedulerState>,
    autostart: AtomicBool,
    verbose: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    logs: LogWriter,
}

impl Scheduler {
    /// Must be called inside a tokio runtime; the audit-log writer is spawned here.
    pub fn new(
        config: ControllerConfig,
        adapter: Arc<dyn ExecutionAdapter>,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            logs: LogWriter::spawn(&config.log_dir),
            universe: config.node_names(),
            autostart: AtomicBool::new(config.autostart),
            verbose: Arc::new(AtomicBool::new(config.verbose)),
            config: Arc::new(config),
            adapter,
            state: RwLock::new(SchedulerState::default()),
            events,
        };
        (scheduler, events_rx)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn adapter(&self) -> Arc<dyn ExecutionAdapter> {
        self.adapter.clone()
    }

    fn notify(&self) {
        if self.events.send(SchedulerEvent::QueueChanged).is_err() {
            tracing::debug!("Scheduler event channel closed");
        }
    }

    fn kill_processes(&self, kills: Vec<(String, u32)>) {
        for (node, pid) in kills {
            kill_in_background(self.adapter.clone(), node, pid);
        }
    }

    async fn job(&self, id: &str) -> Result<SharedJob> {
        self.state
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::JobNotFound(id.to_string()))
    }

    fn dispatch_context(&self) -> DispatchContext {
        let renice_nodes: HashSet<String> = self
            .config
            .nodes
            .iter()
            .filter(|n| n.renice)
            .map(|n| n.name.clone())
            .collect();
        DispatchContext {
            adapter: self.adapter.clone(),
            renice_nodes: Arc::new(renice_nodes),
            node_timeout: self.config.node_timeout(),
            interval: self.config.dispatch_interval(),
            verbose: self.verbose.clone(),
            events: self.events.clone(),
        }
    }

    /// Begin a run of a job the caller has locked, and spawn its dispatcher.
    fn launch(&self, id: &str, shared: &SharedJob, job: &mut RenderJob) -> Result<()> {
        let ticket = job.begin_run(&self.logs)?;
        Dispatcher::new(id, shared.clone(), ticket, self.dispatch_context()).spawn();
        Ok(())
    }

    /// Add a job in `Waiting` and return its id. A fresh id is generated if none is given.
    ///
    /// An existing job with the same id is replaced unless it is rendering.
    pub async fn enqueue(&self, id: Option<String>, params: EnqueueParams) -> Result<String> {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job = RenderJob::new(&id, params, &self.universe)?;
        let total = job.total_frames();

        let mut state = self.state.write().await;
        if let Some(existing) = state.jobs.get(&id) {
            let existing = existing.read().await;
            if existing.status == JobStatus::Rendering {
                return Err(ControllerError::status(&id, existing.status, "replace"));
            }
        }
        state.waitlist.retain(|w| w != &id);
        state.jobs.insert(id.clone(), Arc::new(RwLock::new(job)));
        state.waitlist.push_back(id.clone());
        drop(state);

        tracing::info!(job_id = %id, frames = total, "Job enqueued");
        self.notify();
        Ok(id)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let shared = state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::JobNotFound(id.to_string()))?;
        let mut job = shared.write().await;
        self.launch(id, &shared, &mut job)?;
        state.waitlist.retain(|w| w != id);
        Ok(())
    }

    /// Stop a render. `kill_now` kills in-flight frames; otherwise they finish.
    pub async fn stop(&self, id: &str, kill_now: bool) -> Result<()> {
        let shared = self.job(id).await?;
        let mut job = shared.write().await;
        if kill_now {
            let kills = job.stop_now()?;
            self.kill_processes(kills);
        } else {
            job.stop_later(JobStatus::Stopped)?;
        }
        drop(job);
        self.notify();
        Ok(())
    }

    /// Return a stopped or paused job to `Waiting`, and optionally start it.
    pub async fn resume(&self, id: &str, start_now: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let shared = state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::JobNotFound(id.to_string()))?;
        let mut job = shared.write().await;
        let kills = job.resume()?;
        self.kill_processes(kills);

        if start_now {
            self.launch(id, &shared, &mut job)?;
            state.waitlist.retain(|w| w != id);
        } else if !state.waitlist.iter().any(|w| w == id) {
            state.waitlist.push_back(id.to_string());
        }
        drop(job);
        drop(state);
        self.notify();
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let shared = state
            .jobs
            .get(id)
            .ok_or_else(|| ControllerError::JobNotFound(id.to_string()))?;
        let status = shared.read().await.status;
        if status == JobStatus::Rendering {
            return Err(ControllerError::status(id, status, "delete"));
        }
        state.jobs.remove(id);
        state.waitlist.retain(|w| w != id);
        tracing::info!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Returns true if the node was added to the pool, false if removed.
    pub async fn toggle_node(&self, id: &str, node: &str) -> Result<bool> {
        let shared = self.job(id).await?;
        let added = shared.write().await.toggle_node(node)?;
        Ok(added)
    }

    /// Kill the frame a node is rendering for a job and drop the node from its pool.
    pub async fn kill_node(&self, id: &str, node: &str) -> Result<u32> {
        let shared = self.job(id).await?;
        let pid = shared.write().await.kill_node(node)?;
        kill_in_background(self.adapter.clone(), node.to_string(), pid);
        Ok(pid)
    }

    pub async fn set_priority(&self, id: &str, priority: Priority) -> Result<()> {
        let shared = self.job(id).await?;
        if shared.write().await.set_priority(priority) {
            tracing::info!(job_id = %id, priority = %priority, "Job priority changed");
            self.notify();
        }
        Ok(())
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.state.read().await.jobs.contains_key(id)
    }

    pub async fn status(&self, id: &str) -> Result<JobStatus> {
        Ok(self.job(id).await?.read().await.status)
    }

    pub async fn attrs(&self, id: &str) -> Result<Value> {
        let shared = self.job(id).await?;
        let job = shared.read().await;
        Ok(serde_json::to_value(job.attrs())?)
    }

    /// Attributes of every job, keyed by id.
    pub async fn all_attrs(&self) -> Result<Value> {
        let state = self.state.read().await;
        let mut all = serde_json::Map::new();
        for (id, shared) in &state.jobs {
            let job = shared.read().await;
            all.insert(id.clone(), serde_json::to_value(job.attrs())?);
        }
        Ok(Value::Object(all))
    }

    /// Ids in the autostart waitlist, next candidate first.
    pub async fn waitlist(&self) -> Vec<String> {
        self.state.read().await.waitlist.iter().cloned().collect()
    }

    pub fn autostart_enabled(&self) -> bool {
        self.autostart.load(Ordering::SeqCst)
    }

    pub fn verbose_enabled(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }

    /// Flip autostart and return the new value.
    pub fn toggle_autostart(&self) -> bool {
        let enabled = !self.autostart.fetch_xor(true, Ordering::SeqCst);
        tracing::info!(enabled, "Autostart toggled");
        if enabled {
            self.notify();
        }
        enabled
    }

    /// Flip verbose engine output logging and return the new value.
    pub fn toggle_verbose(&self) -> bool {
        let enabled = !self.verbose.fetch_xor(true, Ordering::SeqCst);
        tracing::info!(enabled, "Verbose toggled");
        enabled
    }

    /// Send `killall <process_name>` to each node, or to the whole farm if `nodes` is empty.
    /// Returns without waiting for the nodes to answer.
    pub fn killall(&self, nodes: &[String], process_name: &str) -> Result<Vec<String>> {
        if process_name.is_empty() || !process_name.chars().all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c)) {
            return Err(ControllerError::Validation(format!(
                "invalid process name {:?}",
                process_name
            )));
        }
        let targets = if nodes.is_empty() {
            self.universe.clone()
        } else {
            if let Some(node) = nodes.iter().find(|n| !self.universe.contains(n)) {
                return Err(ControllerError::NodeNotFound(node.clone()));
            }
            nodes.to_vec()
        };

        for node in &targets {
            let adapter = self.adapter.clone();
            let node = node.clone();
            let process_name = process_name.to_string();
            tokio::spawn(async move {
                if let Err(e) = adapter.killall(&node, &process_name).await {
                    tracing::warn!(node = %node, process = %process_name, error = %e, "killall failed");
                }
            });
        }
        tracing::info!(process = process_name, nodes = targets.len(), "killall sent");
        Ok(targets)
    }

    /// Start whatever the autostart policy says should be rendering now.
    ///
    /// A waiting `High` job preempts every rendering `Normal` job: they are paused
    /// with in-flight frames left to finish and go back to the front of the
    /// waitlist. While a `High` job renders nothing else is started. Otherwise the
    /// oldest waitlisted job starts as long as fewer than `max_concurrent_jobs`
    /// jobs are rendering.
    pub async fn check_autostart(&self) {
        if !self.autostart_enabled() {
            return;
        }
        let mut state = self.state.write().await;

        let mut rendering: Vec<(String, chrono::DateTime<chrono::Utc>)> = Vec::new();
        let mut high_rendering = false;
        let mut eligible: HashMap<String, Priority> = HashMap::new();
        for (id, shared) in &state.jobs {
            let job = shared.read().await;
            match job.status {
                JobStatus::Rendering => {
                    high_rendering |= job.priority == Priority::High;
                    rendering.push((id.clone(), job.queued_at));
                }
                JobStatus::Waiting | JobStatus::Paused => {
                    eligible.insert(id.clone(), job.priority);
                }
                _ => {}
            }
        }
        state.waitlist.retain(|id| eligible.contains_key(id));
        if high_rendering {
            return;
        }

        let next_high = state
            .waitlist
            .iter()
            .find(|id| eligible.get(*id) == Some(&Priority::High))
            .cloned();

        if let Some(high_id) = next_high {
            rendering.sort_by_key(|(_, queued_at)| *queued_at);
            for (id, _) in rendering.iter().rev() {
                if let Some(shared) = state.jobs.get(id).cloned() {
                    if shared.write().await.stop_later(JobStatus::Paused).is_ok() {
                        tracing::info!(job_id = %id, preempted_by = %high_id, "Job paused for high priority job");
                        state.waitlist.push_front(id.clone());
                    }
                }
            }
            self.autostart_job(&mut state, &high_id).await;
            return;
        }

        let limit = self.config.max_concurrent_jobs.max(1);
        let mut running = rendering.len();
        while running < limit {
            let Some(id) = state.waitlist.front().cloned() else {
                break;
            };
            if self.autostart_job(&mut state, &id).await {
                running += 1;
            }
        }
    }

    /// Start a waitlisted job, resuming it first if paused. Removes it from the
    /// waitlist either way.
    async fn autostart_job(&self, state: &mut SchedulerState, id: &str) -> bool {
        state.waitlist.retain(|w| w != id);
        let Some(shared) = state.jobs.get(id).cloned() else {
            return false;
        };
        let mut job = shared.write().await;
        if job.status == JobStatus::Paused {
            match job.resume() {
                Ok(kills) => self.kill_processes(kills),
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Autostart could not resume job");
                    return false;
                }
            }
        }
        match self.launch(id, &shared, &mut job) {
            Ok(()) => {
                tracing::info!(job_id = %id, priority = %job.priority, "Job autostarted");
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Autostart failed");
                false
            }
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        let mut jobs = BTreeMap::new();
        for (id, shared) in &state.jobs {
            jobs.insert(id.clone(), shared.read().await.snapshot_record());
        }
        Snapshot(
            GlobalFlags::new(self.autostart_enabled(), self.verbose_enabled()),
            jobs,
        )
    }

    /// Load a snapshot into an empty scheduler.
    ///
    /// Waiting and paused jobs rejoin the waitlist in enqueue order. Jobs that were
    /// rendering restart right away with their elapsed time carried over. Jobs
    /// whose saved frame layout is unusable are dropped.
    pub async fn restore(&self, snapshot: Snapshot) {
        let flags = snapshot.flags();
        self.autostart.store(flags.autostart, Ordering::SeqCst);
        self.verbose.store(flags.verbose, Ordering::SeqCst);

        let mut state = self.state.write().await;
        let mut waiting = Vec::new();
        let mut restart = Vec::new();
        for (id, mut job) in snapshot.into_jobs() {
            let was_rendering = match job.restore(&self.universe) {
                Ok(was_rendering) => was_rendering,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Dropping unusable job from snapshot");
                    continue;
                }
            };
            if was_rendering {
                restart.push(id.clone());
            } else if matches!(job.status, JobStatus::Waiting | JobStatus::Paused) {
                waiting.push((job.queued_at, id.clone()));
            }
            state.jobs.insert(id, Arc::new(RwLock::new(job)));
        }
        waiting.sort();
        state.waitlist = waiting.into_iter().map(|(_, id)| id).collect();

        for id in restart {
            let Some(shared) = state.jobs.get(&id).cloned() else {
                continue;
            };
            let mut job = shared.write().await;
            match self.launch(&id, &shared, &mut job) {
                Ok(()) => tracing::info!(job_id = %id, "Restarted interrupted render"),
                Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to restart render"),
            }
        }
        tracing::info!(jobs = state.jobs.len(), waitlist = state.waitlist.len(), "Scheduler state restored");
    }

    /// Note the shutdown in the audit log of every unfinished job, and wait for
    /// the audit logs to reach disk.
    pub async fn note_shutdown(&self) {
        let state = self.state.read().await;
        for shared in state.jobs.values() {
            shared.write().await.note_shutdown(&self.logs);
        }
        drop(state);
        self.logs.flush().await;
    }

    /// Wait until every audit-log line produced so far has been written.
    pub async fn flush_logs(&self) {
        self.logs.flush().await;
    }
}
