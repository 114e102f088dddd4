//! Memory-mapped register definitions for the KPU.
//!
//! The register layout is described using [`tock_registers`], which provides a
//! safe and zero-cost abstraction over volatile MMIO access. Every register on
//! this block is 64 bits wide, including the layer-argument FIFO push port.

use core::{ops::Deref, ptr::NonNull};

use tock_registers::{
    interfaces::{Readable, Writeable},
    register_structs,
    registers::*,
};

pub mod consts;
pub mod int;

use crate::osal::KpuPort;
use int::{EIGHT_BIT_MODE, FIFO_THRESHOLD, INTERRUPT, InterruptSources};

register_structs! {
    pub KpuRegs {
        (0x0000 => pub layer_argument_fifo: WriteOnly<u64>),
        (0x0008 => pub interrupt_status: ReadOnly<u64, INTERRUPT::Register>),
        (0x0010 => pub interrupt_raw: ReadOnly<u64, INTERRUPT::Register>),
        (0x0018 => pub interrupt_mask: ReadWrite<u64, INTERRUPT::Register>),
        (0x0020 => pub interrupt_clear: WriteOnly<u64, INTERRUPT::Register>),
        (0x0028 => pub fifo_threshold: ReadWrite<u64, FIFO_THRESHOLD::Register>),
        (0x0030 => pub fifo_data_out: ReadOnly<u64>),
        (0x0038 => pub fifo_ctrl: ReadWrite<u64>),
        (0x0040 => pub eight_bit_mode: ReadWrite<u64, EIGHT_BIT_MODE::Register>),
        (0x0048 => @END),
    }
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<KpuRegs>(),
    consts::REGISTER_BLOCK_SIZE
);

/// Typed view of the KPU register file.
pub struct KpuRegisters {
    base: NonNull<KpuRegs>,
}
unsafe impl Send for KpuRegisters {}

impl KpuRegisters {
    /// Create a new facade over the KPU MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure the provided pointer is a valid mapping for the
    /// KPU register file for the lifetime of the returned object.
    pub const unsafe fn new(base_addr: NonNull<u8>) -> Self {
        Self {
            base: base_addr.cast(),
        }
    }
}

impl Deref for KpuRegisters {
    type Target = KpuRegs;

    fn deref(&self) -> &Self::Target {
        unsafe { self.base.as_ref() }
    }
}

impl KpuPort for KpuRegisters {
    fn push_layer_word(&mut self, word: u64) {
        self.layer_argument_fifo.set(word);
    }

    fn set_interrupt_mask(&mut self, masked: InterruptSources) {
        self.interrupt_mask.set(masked.bits());
    }

    fn clear_interrupts(&mut self, sources: InterruptSources) {
        self.interrupt_clear.set(sources.bits());
    }

    fn pending_interrupts(&self) -> InterruptSources {
        InterruptSources::from_bits_truncate(self.interrupt_status.get())
    }

    fn set_eight_bit_mode(&mut self, enabled: bool) {
        self.eight_bit_mode.write(if enabled {
            EIGHT_BIT_MODE::ENABLE::SET
        } else {
            EIGHT_BIT_MODE::ENABLE::CLEAR
        });
    }

    fn set_fifo_threshold(&mut self, full: u8, empty: u8) {
        self.fifo_threshold.write(
            FIFO_THRESHOLD::FULL.val(full as u64) + FIFO_THRESHOLD::EMPTY.val(empty as u64),
        );
    }
}
