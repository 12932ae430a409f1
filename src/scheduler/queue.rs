use serde::{Deserialize, Serialize};

/// Pending frames of one render job.
///
/// Frames pop last-in-first-out, so a frame pushed back after a failure is
/// retried before anything deeper in the backlog. Access is serialized by the
/// owning job's lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameQueue {
    frames: Vec<i64>,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the initial queue for a job.
    ///
    /// The main range pops in ascending order. Extra frames are pushed after it,
    /// so they pop first, lowest extra frame first.
    pub fn for_frames(start_frame: i64, end_frame: i64, extra_frames: &[i64]) -> Self {
        Self::for_pending(start_frame, end_frame, extra_frames, |_| true)
    }

    /// Like [`FrameQueue::for_frames`] but only queues frames accepted by `pending`.
    pub fn for_pending<F>(start_frame: i64, end_frame: i64, extra_frames: &[i64], pending: F) -> Self
    where
        F: Fn(i64) -> bool,
    {
        let mut queue = Self::new();
        for frame in (start_frame..=end_frame).rev().filter(|f| pending(*f)) {
            queue.push(frame);
        }

        let mut extras = extra_frames.to_vec();
        extras.sort_unstable();
        for frame in extras.into_iter().rev().filter(|f| pending(*f)) {
            queue.push(frame);
        }
        queue
    }

    pub fn push(&mut self, frame: i64) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<i64> {
        self.frames.pop()
    }

    pub fn peek(&self) -> Option<i64> {
        self.frames.last().copied()
    }

    pub fn contains(&self, frame: i64) -> bool {
        self.frames.contains(&frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in the order they would be popped.
    pub fn pop_order(&self) -> Vec<i64> {
        self.frames.iter().rev().copied().collect()
    }
}
