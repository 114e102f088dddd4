//! Raw offsets and constants that mirror the SDK's `kpu_config_t` layout.

/// Offset of the layer-argument FIFO push port.
pub const OFFSET_LAYER_ARGUMENT_FIFO: usize = 0x00;
/// Offset of the masked interrupt status register.
pub const OFFSET_INTERRUPT_STATUS: usize = 0x08;
/// Offset of the raw interrupt status register.
pub const OFFSET_INTERRUPT_RAW: usize = 0x10;
/// Offset of the interrupt mask register. A set bit masks the source.
pub const OFFSET_INTERRUPT_MASK: usize = 0x18;
/// Offset of the interrupt clear register.
pub const OFFSET_INTERRUPT_CLEAR: usize = 0x20;
/// Offset of the layer FIFO threshold register.
pub const OFFSET_FIFO_THRESHOLD: usize = 0x28;
/// Offset of the output FIFO read port drained by the DMA engine.
pub const OFFSET_FIFO_DATA_OUT: usize = 0x30;
/// Offset of the FIFO flush control register.
pub const OFFSET_FIFO_CTRL: usize = 0x38;
/// Offset of the eight-bit mode register.
pub const OFFSET_EIGHT_BIT_MODE: usize = 0x40;

/// Size in bytes of the whole register block.
pub const REGISTER_BLOCK_SIZE: usize = 0x48;

/// Width in bytes of one tile row in the KPU's image memory.
pub const TILE_ROW_BYTES: usize = 64;
