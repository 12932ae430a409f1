//! Render jobs and the machinery that drives them.
//!
//! - [`queue`]: per-job LIFO of pending frames
//! - [`job`]: the [`RenderJob`] state machine and per-node assignment table
//! - [`dispatcher`]: the per-run loop handing frames to idle nodes
//! - [`controller`]: the [`Scheduler`] owning all jobs, autostart and snapshots

use std::sync::Arc;

use tokio::sync::RwLock;

pub mod controller;
pub mod dispatcher;
pub mod job;
pub mod queue;

pub use controller::Scheduler;
pub use dispatcher::SchedulerEvent;
pub use job::{
    EnqueueParams, Engine, FailureReason, JobStatus, NodeStatus, Priority, RenderJob, SkipEntry,
};
pub use queue::FrameQueue;

/// A job behind its own lock, shared by the scheduler, its dispatcher and workers.
pub type SharedJob = Arc<RwLock<RenderJob>>;
