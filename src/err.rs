use core::fmt;

use crate::task::KpuTask;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KpuError {
    #[error("another task is already running on the KPU")]
    Busy,
    #[error("failed to allocate {bytes} byte output buffer")]
    AllocationError { bytes: usize },
    #[error("malformed task: {0}")]
    MalformedTask(&'static str),
    #[error("buffer too small: need {needed}, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// A task handed back by [`Kpu::run`](crate::Kpu::run) together with the
/// reason it was not started.
#[derive(thiserror::Error)]
#[error("{error}")]
pub struct RejectedTask {
    pub error: KpuError,
    pub task: KpuTask,
}

impl RejectedTask {
    pub fn into_inner(self) -> KpuTask {
        self.task
    }
}

impl fmt::Debug for RejectedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedTask")
            .field("error", &self.error)
            .field("task", &self.task)
            .finish()
    }
}
