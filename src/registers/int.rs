use bitflags::bitflags;

tock_registers::register_bitfields! {u64,
    pub INTERRUPT [
        CALC_DONE OFFSET(0) NUMBITS(1) [],
        LAYER_CFG_ALMOST_EMPTY OFFSET(1) NUMBITS(1) [],
        LAYER_CFG_ALMOST_FULL OFFSET(2) NUMBITS(1) []
    ],

    pub FIFO_THRESHOLD [
        FULL OFFSET(0) NUMBITS(4) [],
        EMPTY OFFSET(4) NUMBITS(4) []
    ],

    pub EIGHT_BIT_MODE [
        ENABLE OFFSET(0) NUMBITS(1) []
    ]
}

bitflags! {
    /// KPU interrupt sources, laid out as in the status, mask and clear
    /// registers.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptSources: u64 {
        const CALC_DONE = 1 << 0;
        const LAYER_CFG_ALMOST_EMPTY = 1 << 1;
        const LAYER_CFG_ALMOST_FULL = 1 << 2;
    }
}

impl InterruptSources {
    /// Mask value while bursts are still pending: only the almost-empty
    /// source may interrupt.
    pub const REFILL_MASK: Self = Self::CALC_DONE.union(Self::LAYER_CFG_ALMOST_FULL);

    /// Mask value once every descriptor is in the FIFO: only calc-done may
    /// interrupt.
    pub const COMPLETION_ONLY_MASK: Self =
        Self::LAYER_CFG_ALMOST_EMPTY.union(Self::LAYER_CFG_ALMOST_FULL);
}
