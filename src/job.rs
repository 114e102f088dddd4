//! Single-flight job bookkeeping: the task slot and the pipeline state
//! machine driven by interrupt events.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::{
    err::KpuError,
    osal::DmaChannel,
    task::{Cursor, KpuTask},
};

/// Handler for KPU interrupts that arrive while no task is running.
pub type IrqCallback = Box<dyn FnMut() + Send>;

/// One-shot handler for a single-layer helper's DMA completion.
pub type DmaCallback = Box<dyn FnOnce() + Send>;

/// Single-slot semaphore guarding the accelerator.
#[derive(Debug, Default)]
pub struct TaskSlot {
    busy: AtomicBool,
}

/// Proof of slot ownership. Only [`TaskSlot::try_acquire`] creates one and
/// only [`TaskSlot::release`] consumes it.
#[derive(Debug)]
#[must_use]
pub struct SlotToken {
    _private: (),
}

impl TaskSlot {
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_acquire(&self) -> Result<SlotToken, KpuError> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| SlotToken { _private: () })
            .map_err(|_| KpuError::Busy)
    }

    pub fn release(&self, token: SlotToken) {
        let SlotToken { _private: () } = token;
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Pipeline state of the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    Acquired = 1,
    InputTransfer = 2,
    Armed = 3,
    BurstLoading = 4,
    Complete = 5,
}

/// Hardware events that advance a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The input DMA finished copying the source into image memory.
    InputDmaDone,
    /// The layer-argument FIFO drained to its low-water mark.
    FifoAlmostEmpty,
    /// The final layer raised calc-done.
    CalcDone,
    /// The output DMA finished draining into the destination buffer.
    OutputDmaDone,
}

impl JobState {
    /// Whether `event` is meaningful in this state. Anything else is stale or
    /// out of order and gets dropped.
    pub fn accepts(self, event: Event) -> bool {
        matches!(
            (self, event),
            (JobState::InputTransfer, Event::InputDmaDone)
                | (JobState::BurstLoading, Event::FifoAlmostEmpty)
                | (JobState::BurstLoading, Event::CalcDone)
                | (JobState::BurstLoading, Event::OutputDmaDone)
        )
    }
}

impl From<u8> for JobState {
    fn from(raw: u8) -> Self {
        match raw {
            1 => JobState::Acquired,
            2 => JobState::InputTransfer,
            3 => JobState::Armed,
            4 => JobState::BurstLoading,
            5 => JobState::Complete,
            _ => JobState::Idle,
        }
    }
}

/// Lock-free snapshot of the active job, readable from any context.
#[derive(Debug, Default)]
pub struct JobStatus {
    state: AtomicU8,
    remaining: AtomicUsize,
}

impl JobStatus {
    pub fn publish(&self, job: Option<&ActiveJob>) {
        let (state, remaining) = job.map_or((JobState::Idle, 0), |job| {
            (job.state, job.cursor.remaining)
        });
        self.remaining.store(remaining, Ordering::Release);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> JobState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// Slot ownership shared by the single-layer helpers.
///
/// The first helper to start takes the slot; it goes back once every helper
/// DMA callback has fired and any pending `conv2d` has reported calc-done.
/// Each DMA channel carries at most one helper transfer.
#[derive(Default)]
pub struct HelperLease {
    token: Option<SlotToken>,
    dma: [Option<DmaCallback>; DmaChannel::COUNT],
    conv_pending: bool,
}

impl HelperLease {
    pub fn acquire(&mut self, slot: &TaskSlot) -> Result<(), KpuError> {
        if self.token.is_none() {
            self.token = Some(slot.try_acquire()?);
        }
        Ok(())
    }

    pub fn channel_in_use(&self, channel: DmaChannel) -> bool {
        self.dma[channel.index()].is_some()
    }

    pub fn route_dma(&mut self, channel: DmaChannel, callback: DmaCallback) {
        self.dma[channel.index()] = Some(callback);
    }

    pub fn take_dma(&mut self, channel: DmaChannel) -> Option<DmaCallback> {
        self.dma[channel.index()].take()
    }

    pub fn set_conv_pending(&mut self) {
        self.conv_pending = true;
    }

    pub fn take_conv_pending(&mut self) -> bool {
        core::mem::take(&mut self.conv_pending)
    }

    pub fn is_idle(&self) -> bool {
        !self.conv_pending && self.dma.iter().all(Option::is_none)
    }

    /// Give the slot back if nothing is outstanding.
    pub fn settle(&mut self, slot: &TaskSlot) {
        if self.is_idle()
            && let Some(token) = self.token.take()
        {
            slot.release(token);
        }
    }
}

/// The task currently owning the accelerator.
#[derive(Debug)]
pub struct ActiveJob {
    pub task: KpuTask,
    pub cursor: Cursor,
    pub state: JobState,
    pub calc_done: bool,
    pub output_drained: bool,
    pub token: SlotToken,
}

impl ActiveJob {
    pub fn new(task: KpuTask, token: SlotToken) -> Self {
        let cursor = Cursor::new(task.layers().len());
        Self {
            task,
            cursor,
            state: JobState::Acquired,
            calc_done: false,
            output_drained: false,
            token,
        }
    }

    /// Completion needs both the final calc-done and the output DMA, which
    /// may arrive in either order.
    pub fn is_finished(&self) -> bool {
        self.cursor.is_exhausted() && self.calc_done && self.output_drained
    }
}
