//! Platform abstraction layer for the KPU driver.
//!
//! The driver does not own the DMA controller, the interrupt controller or the
//! register file directly; it talks to them through the narrow traits below so
//! that board support code (or a test double) can supply them.

use crate::registers::int::InterruptSources;

/// Write-mostly port onto the KPU register file.
pub trait KpuPort {
    /// Push one 64-bit word into the layer-argument FIFO.
    fn push_layer_word(&mut self, word: u64);

    /// Program the interrupt mask. Set bits mask (disable) a source.
    fn set_interrupt_mask(&mut self, masked: InterruptSources);

    fn clear_interrupts(&mut self, sources: InterruptSources);

    /// Sources currently asserted and not masked.
    fn pending_interrupts(&self) -> InterruptSources;

    fn set_eight_bit_mode(&mut self, enabled: bool);

    fn set_fifo_threshold(&mut self, full: u8, empty: u8);
}

/// DMA controller channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DmaChannel {
    Ch0 = 0,
    Ch1 = 1,
    Ch2 = 2,
    Ch3 = 3,
    Ch4 = 4,
    Ch5 = 5,
}

impl DmaChannel {
    pub const COUNT: usize = 6;

    pub const ALL: [DmaChannel; Self::COUNT] = [
        DmaChannel::Ch0,
        DmaChannel::Ch1,
        DmaChannel::Ch2,
        DmaChannel::Ch3,
        DmaChannel::Ch4,
        DmaChannel::Ch5,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Peripheral handshake a DMA channel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaRequest {
    /// KPU output FIFO has data for the memory side.
    AiRx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Increment,
    NoChange,
}

/// Items per DMA burst transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstSize {
    Items1,
    Items4,
    Items8,
    Items16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferWidth {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

/// A single-block transfer, as programmed by `dmac_set_single_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    pub src: usize,
    pub dst: usize,
    pub src_mode: AddressMode,
    pub dst_mode: AddressMode,
    pub burst: BurstSize,
    pub width: TransferWidth,
    /// Number of `width`-sized items to move.
    pub count: usize,
}

/// DMA controller collaborator.
///
/// Completion is reported back by the platform calling
/// [`Kpu::on_dma_irq`](crate::Kpu::on_dma_irq) from the channel's interrupt.
pub trait Dmac {
    fn select_request(&mut self, channel: DmaChannel, request: DmaRequest);

    fn set_irq_enabled(&mut self, channel: DmaChannel, enabled: bool);

    /// Acknowledge every pending interrupt of the channel.
    fn clear_irq(&mut self, channel: DmaChannel);

    /// Program and start a transfer.
    fn set_single_mode(&mut self, channel: DmaChannel, transfer: &DmaTransfer);
}

/// Platform-level interrupt controller collaborator.
pub trait Plic {
    fn enable(&mut self, irq: u32);

    fn set_priority(&mut self, irq: u32, priority: u32);
}
