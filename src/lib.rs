//! Driver for the Kendryte K210 KPU convolution accelerator.
//!
//! The crate streams pre-compiled layer descriptors into the KPU's
//! layer-argument FIFO, moves tensors in and out over DMA and provides the
//! quantized post-processing kernels needed to read the KPU's tiled output.
//!
//! Execution is interrupt driven and single-flight: [`Kpu::run`] starts a
//! task and returns immediately; the platform's interrupt handlers call
//! [`Kpu::on_dma_irq`] and [`Kpu::on_ai_irq`], and the task's completion
//! callback fires from the last of those.
//!
//! The platform must provide a [`critical_section`] implementation.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod err;
mod job;
mod osal;
pub mod quant;
mod registers;
mod task;

use core::sync::atomic::{AtomicU8, Ordering};

pub use config::*;
pub use err::*;
pub use job::{DmaCallback, Event, IrqCallback, JobState, SlotToken, TaskSlot};
pub use osal::*;
pub use registers::{KpuRegisters, KpuRegs, consts, int::InterruptSources};
use spin::Mutex;
pub use task::*;

use crate::{
    job::{ActiveJob, HelperLease, JobStatus},
    task::burst::{push_burst, push_layer},
};

/// Pending bit for the KPU line; DMA channels use bits 0..6.
const AI_PENDING: u8 = 1 << 7;

/// Where the KPU interrupt line is currently delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AiRoute {
    User,
    BurstLoader,
}

/// Work to run once the driver lock is released.
enum Wake {
    Task(KpuTask, CompletionCallback),
    Helper(DmaCallback),
    User(IrqCallback),
}

struct Inner<P, D, I> {
    port: P,
    dmac: D,
    plic: I,
    job: Option<ActiveJob>,
    ai_route: AiRoute,
    user_handler: Option<IrqCallback>,
    helpers: HelperLease,
}

/// KPU driver.
///
/// Driver state sits behind a spin lock that is only taken inside a critical
/// section. Interrupt entry points never wait for it: if it is held they
/// record the interrupt and the holder services it on release.
pub struct Kpu<P, D, I> {
    config: KpuConfig,
    slot: TaskSlot,
    status: JobStatus,
    pending: AtomicU8,
    inner: Mutex<Inner<P, D, I>>,
}

impl<P: KpuPort, D: Dmac, I: Plic> Kpu<P, D, I> {
    pub fn new(port: P, dmac: D, plic: I, config: KpuConfig) -> Result<Self, KpuError> {
        config.validate()?;
        Ok(Self {
            config,
            slot: TaskSlot::new(),
            status: JobStatus::default(),
            pending: AtomicU8::new(0),
            inner: Mutex::new(Inner {
                port,
                dmac,
                plic,
                job: None,
                ai_route: AiRoute::User,
                user_handler: None,
                helpers: HelperLease::default(),
            }),
        })
    }

    pub fn config(&self) -> &KpuConfig {
        &self.config
    }

    /// One-time hardware setup. `handler` receives KPU interrupts that occur
    /// outside a task, such as the calc-done of [`Kpu::conv2d`].
    pub fn init(&self, eight_bit_mode: bool, handler: Option<IrqCallback>) {
        let threshold = self.config.init_threshold;
        self.locked(|inner| {
            inner.port.clear_interrupts(InterruptSources::all());
            inner.port.set_fifo_threshold(threshold.full, threshold.empty);
            inner.port.set_eight_bit_mode(eight_bit_mode);
            inner.port.set_interrupt_mask(InterruptSources::REFILL_MASK);

            inner.plic.enable(self.config.irq);
            inner
                .plic
                .set_priority(self.config.irq, self.config.init_priority);
            inner.user_handler = handler;
            inner.ai_route = AiRoute::User;
        });
        info!(
            "KPU init: eight_bit_mode={} irq={} priority={}",
            eight_bit_mode, self.config.irq, self.config.init_priority
        );
        self.service();
    }

    /// Start `task`. Returns as soon as the first stage is programmed; the
    /// task's callback fires once the output has landed in its buffer.
    ///
    /// A rejected task is handed back untouched.
    pub fn run(&self, task: KpuTask) -> Result<(), RejectedTask> {
        if let Err(error) = task.validate() {
            return Err(RejectedTask { error, task });
        }
        let token = match self.slot.try_acquire() {
            Ok(token) => token,
            Err(error) => {
                debug!("run rejected: {}", error);
                return Err(RejectedTask { error, task });
            }
        };

        self.locked(|inner| {
            let job = inner.job.insert(ActiveJob::new(task, token));
            debug!(
                "run: {} layers on {:?}, input {} words, output {} words",
                job.task.layers().len(),
                job.task.dma_channel(),
                job.task.input_len(),
                job.task.output_len()
            );

            match job.task.source() {
                None => self.arm(inner),
                Some(src) => {
                    job.state = JobState::InputTransfer;
                    let channel = job.task.dma_channel();
                    let transfer = DmaTransfer {
                        src: src.as_ptr() as usize,
                        dst: self.config.ai_io_base_addr,
                        src_mode: AddressMode::Increment,
                        dst_mode: AddressMode::Increment,
                        burst: BurstSize::Items16,
                        width: TransferWidth::Bits64,
                        count: job.task.input_len(),
                    };
                    inner.dmac.set_irq_enabled(channel, true);
                    inner.dmac.set_single_mode(channel, &transfer);
                }
            }
        });
        self.service();
        Ok(())
    }

    /// Advance the active task by one hardware event.
    pub fn handle(&self, event: Event) {
        if let Some(wake) = self.locked(|inner| self.step(inner, event)) {
            self.wake(wake);
        }
        self.service();
    }

    /// Entry point for the KPU interrupt line.
    pub fn on_ai_irq(&self) {
        self.pending.fetch_or(AI_PENDING, Ordering::SeqCst);
        self.service();
    }

    /// Entry point for a DMA channel's completion interrupt.
    pub fn on_dma_irq(&self, channel: DmaChannel) {
        self.pending
            .fetch_or(1 << channel.index(), Ordering::SeqCst);
        self.service();
    }

    pub fn state(&self) -> JobState {
        self.status.state()
    }

    /// Descriptors of the active task not yet pushed to the FIFO.
    pub fn remaining_layers(&self) -> usize {
        self.status.remaining()
    }

    /// True while a task or a single-layer helper owns the accelerator.
    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }

    /// Copy `src` into KPU image memory at `layer`'s source address.
    ///
    /// # Safety
    ///
    /// `src` must stay valid and unmodified until `callback` runs.
    pub unsafe fn input_dma(
        &self,
        layer: &LayerArgument,
        src: &[u8],
        channel: DmaChannel,
        callback: DmaCallback,
    ) -> Result<(), KpuError> {
        let bytes = layer.input_bytes();
        if src.len() < bytes {
            return Err(KpuError::BufferTooSmall {
                needed: bytes,
                actual: src.len(),
            });
        }

        let transfer = DmaTransfer {
            src: src.as_ptr() as usize,
            dst: self.config.ai_io_base_addr
                + layer.image_src_addr() as usize * consts::TILE_ROW_BYTES,
            src_mode: AddressMode::Increment,
            dst_mode: AddressMode::Increment,
            burst: BurstSize::Items16,
            width: TransferWidth::Bits64,
            count: bytes / 8,
        };
        let res = self.locked(|inner| {
            self.lease_channel(inner, channel)?;
            inner.helpers.route_dma(channel, callback);
            inner.dmac.set_irq_enabled(channel, true);
            inner.dmac.set_single_mode(channel, &transfer);
            Ok(())
        });
        self.service();
        res
    }

    /// Run one layer whose result stays in image memory. Completion is
    /// reported to the handler given to [`Kpu::init`].
    pub fn conv2d(&self, layer: &LayerArgument) -> Result<(), KpuError> {
        let res = self.locked(|inner| {
            inner.helpers.acquire(&self.slot)?;
            inner.helpers.set_conv_pending();
            inner.port.clear_interrupts(InterruptSources::all());
            inner.port.set_interrupt_mask(InterruptSources::REFILL_MASK);
            push_layer(&mut inner.port, layer);
            Ok(())
        });
        self.service();
        res
    }

    /// Run one layer and stream its output into `dest`.
    ///
    /// # Safety
    ///
    /// `dest` is written by DMA after this returns; it must stay valid and
    /// must not be accessed until `callback` runs.
    pub unsafe fn conv2d_output(
        &self,
        layer: &mut LayerArgument,
        channel: DmaChannel,
        dest: &mut [u64],
        callback: DmaCallback,
    ) -> Result<(), KpuError> {
        let count = (layer.dma_total_byte() as usize + 8) / 8;
        self.start_output(layer, channel, dest, count, false, callback)
    }

    /// Like [`Kpu::conv2d_output`], but accumulates each output channel to a
    /// single 64-bit sum.
    ///
    /// # Safety
    ///
    /// Same contract as [`Kpu::conv2d_output`].
    pub unsafe fn conv2d_output_full_add(
        &self,
        layer: &mut LayerArgument,
        channel: DmaChannel,
        dest: &mut [u64],
        callback: DmaCallback,
    ) -> Result<(), KpuError> {
        let count = layer.output_channels() as usize;
        self.start_output(layer, channel, dest, count, true, callback)
    }

    fn start_output(
        &self,
        layer: &mut LayerArgument,
        channel: DmaChannel,
        dest: &mut [u64],
        count: usize,
        full_add: bool,
        callback: DmaCallback,
    ) -> Result<(), KpuError> {
        if dest.len() < count {
            return Err(KpuError::BufferTooSmall {
                needed: count,
                actual: dest.len(),
            });
        }

        let transfer = DmaTransfer {
            src: self.config.fifo_data_out_addr(),
            dst: dest.as_mut_ptr() as usize,
            src_mode: AddressMode::NoChange,
            dst_mode: AddressMode::Increment,
            burst: BurstSize::Items8,
            width: TransferWidth::Bits64,
            count,
        };
        let res = self.locked(|inner| {
            self.lease_channel(inner, channel)?;
            if full_add {
                layer.set_full_add();
            }
            layer.set_send_data_out();

            inner.port.clear_interrupts(InterruptSources::all());
            inner.port.set_interrupt_mask(InterruptSources::all());
            inner.helpers.route_dma(channel, callback);
            inner.dmac.select_request(channel, DmaRequest::AiRx);
            inner.dmac.set_irq_enabled(channel, true);
            inner.dmac.set_single_mode(channel, &transfer);
            push_layer(&mut inner.port, layer);
            Ok(())
        });
        self.service();
        res
    }

    /// Take the helper lease for a transfer on `channel`.
    fn lease_channel(&self, inner: &mut Inner<P, D, I>, channel: DmaChannel) -> Result<(), KpuError> {
        if inner.helpers.channel_in_use(channel) {
            debug!("{:?} already carries a helper transfer", channel);
            return Err(KpuError::Busy);
        }
        inner.helpers.acquire(&self.slot)
    }

    /// Run `f` on the driver state inside a critical section and publish the
    /// resulting job status.
    fn locked<R>(&self, f: impl FnOnce(&mut Inner<P, D, I>) -> R) -> R {
        critical_section::with(|_| {
            let mut inner = self.inner.lock();
            let res = f(&mut inner);
            self.status.publish(inner.job.as_ref());
            res
        })
    }

    /// Like [`Self::locked`], but gives up if the state is already held.
    fn try_locked<R>(&self, f: impl FnOnce(&mut Inner<P, D, I>) -> R) -> Option<R> {
        critical_section::with(|_| {
            let mut inner = self.inner.try_lock()?;
            let res = f(&mut inner);
            self.status.publish(inner.job.as_ref());
            Some(res)
        })
    }

    /// Drain recorded interrupts, one source at a time.
    fn service(&self) {
        loop {
            let pending = self.pending.load(Ordering::SeqCst);
            if pending == 0 {
                return;
            }
            let bit = pending & pending.wrapping_neg();
            let Some(wake) = self.try_locked(|inner| {
                self.pending.fetch_and(!bit, Ordering::SeqCst);
                if bit == AI_PENDING {
                    self.ai_irq(inner)
                } else {
                    let channel = DmaChannel::ALL[bit.trailing_zeros() as usize];
                    self.dma_irq(inner, channel)
                }
            }) else {
                trace!("driver busy, interrupt deferred");
                return;
            };
            if let Some(wake) = wake {
                self.wake(wake);
            }
        }
    }

    fn wake(&self, wake: Wake) {
        match wake {
            Wake::Task(task, callback) => callback(task),
            Wake::Helper(callback) => callback(),
            Wake::User(mut handler) => {
                handler();
                self.locked(|inner| {
                    if inner.user_handler.is_none() {
                        inner.user_handler = Some(handler);
                    }
                });
            }
        }
    }

    fn ai_irq(&self, inner: &mut Inner<P, D, I>) -> Option<Wake> {
        match inner.ai_route {
            AiRoute::BurstLoader => {
                let pending = inner.port.pending_interrupts();
                if pending.is_empty() {
                    inner.port.clear_interrupts(InterruptSources::all());
                    trace!("spurious KPU interrupt");
                    return None;
                }
                let mut wake = None;
                if pending.contains(InterruptSources::LAYER_CFG_ALMOST_EMPTY) {
                    wake = self.step(inner, Event::FifoAlmostEmpty);
                }
                if pending.contains(InterruptSources::CALC_DONE) {
                    wake = self.step(inner, Event::CalcDone);
                }
                wake
            }
            AiRoute::User => {
                inner.port.clear_interrupts(InterruptSources::all());
                if inner.helpers.take_conv_pending() {
                    inner.helpers.settle(&self.slot);
                }
                match inner.user_handler.take() {
                    Some(handler) => Some(Wake::User(handler)),
                    None => {
                        warn!("KPU interrupt with no handler registered");
                        None
                    }
                }
            }
        }
    }

    fn dma_irq(&self, inner: &mut Inner<P, D, I>, channel: DmaChannel) -> Option<Wake> {
        let event = match inner.job.as_ref() {
            Some(job) if job.task.dma_channel() == channel => match job.state {
                JobState::InputTransfer => Some(Event::InputDmaDone),
                _ => Some(Event::OutputDmaDone),
            },
            _ => None,
        };
        if let Some(event) = event {
            return self.step(inner, event);
        }

        inner.dmac.clear_irq(channel);
        match inner.helpers.take_dma(channel) {
            Some(callback) => {
                inner.helpers.settle(&self.slot);
                Some(Wake::Helper(callback))
            }
            None => {
                warn!("DMA interrupt on {:?} with nothing routed", channel);
                None
            }
        }
    }

    fn step(&self, inner: &mut Inner<P, D, I>, event: Event) -> Option<Wake> {
        let Some(state) = inner.job.as_ref().map(|job| job.state) else {
            warn!("{:?} with no active task", event);
            return None;
        };
        if !state.accepts(event) {
            warn!("dropping {:?} in state {:?}", event, state);
            return None;
        }

        match event {
            Event::InputDmaDone => self.arm(inner),
            Event::FifoAlmostEmpty => self.refill(inner),
            Event::CalcDone => {
                inner.port.clear_interrupts(InterruptSources::CALC_DONE);
                if let Some(job) = inner.job.as_mut() {
                    if job.cursor.is_exhausted() {
                        job.calc_done = true;
                    } else {
                        trace!("calc-done before the last burst, ignored");
                    }
                }
            }
            Event::OutputDmaDone => {
                if let Some(job) = inner.job.as_mut() {
                    inner.dmac.clear_irq(job.task.dma_channel());
                    job.output_drained = true;
                }
            }
        }

        if !inner.job.as_ref().is_some_and(ActiveJob::is_finished) {
            return None;
        }
        let mut job = inner.job.take()?;
        job.state = JobState::Complete;
        inner.ai_route = AiRoute::User;
        self.complete(job)
    }

    /// Input is in image memory: start draining output, configure the KPU
    /// and push the first burst.
    fn arm(&self, inner: &mut Inner<P, D, I>) {
        let Inner {
            port,
            dmac,
            plic,
            job,
            ai_route,
            ..
        } = inner;
        let Some(job) = job.as_mut() else {
            return;
        };
        let channel = job.task.dma_channel();
        dmac.clear_irq(channel);

        let Some(dst) = job.task.output_addr() else {
            error!("active task lost its output buffer");
            return;
        };
        dmac.select_request(channel, DmaRequest::AiRx);
        dmac.set_irq_enabled(channel, true);
        dmac.set_single_mode(
            channel,
            &DmaTransfer {
                src: self.config.fifo_data_out_addr(),
                dst,
                src_mode: AddressMode::NoChange,
                dst_mode: AddressMode::Increment,
                burst: BurstSize::Items8,
                width: TransferWidth::Bits64,
                count: job.task.output_len(),
            },
        );

        let threshold = self.config.run_threshold;
        port.set_eight_bit_mode(job.task.eight_bit_mode());
        port.set_interrupt_mask(InterruptSources::all());
        port.clear_interrupts(InterruptSources::all());
        port.set_fifo_threshold(threshold.full, threshold.empty);
        plic.enable(self.config.irq);
        plic.set_priority(self.config.irq, self.config.run_priority);
        *ai_route = AiRoute::BurstLoader;
        job.state = JobState::Armed;

        push_burst(
            port,
            job.task.layers(),
            &mut job.cursor,
            self.config.burst_size,
        );
        if !job.cursor.is_exhausted() {
            port.set_interrupt_mask(InterruptSources::REFILL_MASK);
        }
        job.state = JobState::BurstLoading;
        debug!("armed: {} layers still queued", job.cursor.remaining);
    }

    fn refill(&self, inner: &mut Inner<P, D, I>) {
        let Inner { port, job, .. } = inner;
        let Some(job) = job.as_mut() else {
            return;
        };
        if job.cursor.is_exhausted() {
            port.clear_interrupts(InterruptSources::LAYER_CFG_ALMOST_EMPTY);
            trace!("almost-empty after the last burst, ignored");
            return;
        }
        push_burst(
            port,
            job.task.layers(),
            &mut job.cursor,
            self.config.burst_size,
        );
    }

    fn complete(&self, job: ActiveJob) -> Option<Wake> {
        let ActiveJob {
            mut task, token, ..
        } = job;
        self.slot.release(token);
        debug!("task complete: {} output words", task.output_len());

        match task.take_callback() {
            Some(callback) => Some(Wake::Task(task, callback)),
            None => {
                warn!("task completed without a callback, output dropped");
                None
            }
        }
    }
}
