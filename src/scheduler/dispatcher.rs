use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::scheduler::job::{RoundOutcome, RunTicket};
use crate::scheduler::SharedJob;
use crate::worker::executor::{kill_in_background, spawn_worker, ExecutionAdapter, FrameRequest};

/// Notifications from dispatchers and operator commands to the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    JobFinished(String),
    QueueChanged,
}

/// Everything a dispatcher needs besides its job.
#[derive(Clone)]
pub struct DispatchContext {
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub renice_nodes: Arc<HashSet<String>>,
    pub node_timeout: Duration,
    pub interval: Duration,
    pub verbose: Arc<AtomicBool>,
    pub events: mpsc::UnboundedSender<SchedulerEvent>,
}

/// The loop that feeds one job's frames to its nodes for one run.
///
/// Only takes the job lock. Completion is reported to the scheduler through
/// the event channel rather than by locking scheduler state.
pub struct Dispatcher {
    job_id: String,
    job: SharedJob,
    ticket: RunTicket,
    ctx: DispatchContext,
}

impl Dispatcher {
    pub fn new(job_id: &str, job: SharedJob, ticket: RunTicket, ctx: DispatchContext) -> Self {
        Self {
            job_id: job_id.to_string(),
            job,
            ticket,
            ctx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.ctx.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(job_id = %self.job_id, run_id = self.ticket.run_id, "Dispatcher started");

        loop {
            tokio::select! {
                _ = self.ticket.token.cancelled() => {
                    tracing::debug!(job_id = %self.job_id, run_id = self.ticket.run_id, "Dispatcher cancelled");
                    break;
                }
                _ = tick.tick() => {}
            }

            let (outcome, path, engine) = {
                let mut job = self.job.write().await;
                let outcome = job.dispatch_round(self.ticket.run_id, self.ctx.node_timeout);
                (outcome, job.path.clone(), job.engine)
            };

            match outcome {
                RoundOutcome::Continue { launches, kills } => {
                    for (node, pid) in kills {
                        kill_in_background(self.ctx.adapter.clone(), node, pid);
                    }
                    for assignment in launches {
                        let renice = self.ctx.renice_nodes.contains(&assignment.node);
                        let request = FrameRequest {
                            job_id: self.job_id.clone(),
                            node: assignment.node,
                            path: path.clone(),
                            frame: assignment.frame,
                            engine,
                            attempt: assignment.attempt,
                            verbose: self.ctx.verbose.load(Ordering::Relaxed),
                        };
                        spawn_worker(
                            self.job.clone(),
                            self.ctx.adapter.clone(),
                            request,
                            renice,
                            self.ctx.node_timeout,
                        );
                    }
                }
                RoundOutcome::Finished => {
                    if self
                        .ctx
                        .events
                        .send(SchedulerEvent::JobFinished(self.job_id.clone()))
                        .is_err()
                    {
                        tracing::debug!(job_id = %self.job_id, "Scheduler event channel closed");
                    }
                    break;
                }
                RoundOutcome::Exit => break,
            }
        }

        tracing::debug!(job_id = %self.job_id, run_id = self.ticket.run_id, "Dispatcher exited");
    }
}
