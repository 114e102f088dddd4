//! Platform constants for the KPU, translated from the SDK's `platform.h`
//! and the driver's hard-coded thresholds.

use crate::err::KpuError;

/// Number of layer descriptors the layer-argument FIFO accepts per burst.
pub const LAYER_BURST_SIZE: usize = 12;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KpuType {
    K210,
}

/// Full/empty watermarks of the layer-argument FIFO, counted in descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FifoThreshold {
    pub full: u8,
    pub empty: u8,
}

#[derive(Debug, Clone)]
pub struct KpuConfig {
    pub ty: KpuType,
    /// MMIO base of the KPU control registers.
    pub ai_base_addr: usize,
    /// Base of the KPU's on-chip image memory as seen by the DMA engine.
    pub ai_io_base_addr: usize,
    pub ai_io_size: usize,
    /// PLIC source number of the KPU interrupt.
    pub irq: u32,
    pub init_priority: u32,
    pub run_priority: u32,
    pub burst_size: usize,
    pub init_threshold: FifoThreshold,
    pub run_threshold: FifoThreshold,
}

impl KpuConfig {
    pub fn new(ty: KpuType) -> Self {
        match ty {
            KpuType::K210 => Self::new_k210(),
        }
    }

    fn new_k210() -> Self {
        Self {
            ty: KpuType::K210,
            ai_base_addr: 0x4080_0000,
            ai_io_base_addr: 0x4060_0000,
            ai_io_size: 2 * 1024 * 1024,
            irq: 25,
            init_priority: 1,
            run_priority: 2,
            burst_size: LAYER_BURST_SIZE,
            init_threshold: FifoThreshold { full: 10, empty: 1 },
            run_threshold: FifoThreshold { full: 12, empty: 1 },
        }
    }

    pub fn validate(&self) -> Result<(), KpuError> {
        if self.burst_size == 0 || self.burst_size > 15 {
            return Err(KpuError::InvalidConfig("burst size must be in 1..=15"));
        }
        for t in [self.init_threshold, self.run_threshold] {
            if t.full > 0xF || t.empty > 0xF {
                return Err(KpuError::InvalidConfig("fifo threshold exceeds 4 bits"));
            }
        }
        if self.ai_io_size == 0 {
            return Err(KpuError::InvalidConfig("empty ai io window"));
        }
        Ok(())
    }

    /// Returns true if `addr` falls inside the KPU's image memory window.
    pub fn is_ai_io_addr(&self, addr: usize) -> bool {
        addr >= self.ai_io_base_addr && addr < self.ai_io_base_addr + self.ai_io_size
    }

    /// Bus address of the output FIFO read port.
    pub fn fifo_data_out_addr(&self) -> usize {
        self.ai_base_addr + crate::registers::consts::OFFSET_FIFO_DATA_OUT
    }
}

impl Default for KpuConfig {
    fn default() -> Self {
        Self::new(KpuType::K210)
    }
}
