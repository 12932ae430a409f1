//! Per-frame render workers.
//!
//! - [`executor`]: the [`ExecutionAdapter`] seam and the worker that follows one
//!   frame attempt from launch to result
//! - [`engine`]: stdout parsers for each render engine
//! - [`remote`]: [`RemoteShellExecutor`], the ssh-backed adapter
//!
//! A worker renders exactly one frame on one node and writes its outcome back
//! into the job under the job lock. Failures never propagate past the worker;
//! they land in the job's skip-list instead.

pub mod engine;
pub mod executor;
pub mod remote;

pub use executor::{ExecutionAdapter, FrameRequest, RenderEvent};
pub use remote::RemoteShellExecutor;
