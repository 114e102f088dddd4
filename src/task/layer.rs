//! Layer descriptor as consumed by the KPU layer-argument FIFO.

use tock_registers::{
    LocalRegisterCopy, RegisterLongName,
    fields::{Field, FieldValue},
};

use crate::registers::consts::TILE_ROW_BYTES;

tock_registers::register_bitfields! {u64,
    pub INTERRUPT_ENABLE [
        INT_EN OFFSET(0) NUMBITS(1) [],
        RAM_FLAG OFFSET(1) NUMBITS(1) [],
        FULL_ADD OFFSET(2) NUMBITS(1) [],
        DEPTH_WISE_LAYER OFFSET(3) NUMBITS(1) []
    ],

    pub IMAGE_ADDR [
        IMAGE_SRC_ADDR OFFSET(0) NUMBITS(15) [],
        IMAGE_DST_ADDR OFFSET(32) NUMBITS(15) []
    ],

    pub IMAGE_CHANNEL_NUM [
        I_CH_NUM OFFSET(0) NUMBITS(10) [],
        O_CH_NUM OFFSET(32) NUMBITS(10) [],
        O_CH_NUM_COEF OFFSET(48) NUMBITS(10) []
    ],

    pub IMAGE_SIZE [
        I_ROW_WID OFFSET(0) NUMBITS(10) [],
        I_COL_HIGH OFFSET(10) NUMBITS(9) [],
        O_ROW_WID OFFSET(32) NUMBITS(10) [],
        O_COL_HIGH OFFSET(42) NUMBITS(9) []
    ],

    pub KERNEL_POOL_TYPE_CFG [
        KERNEL_TYPE OFFSET(0) NUMBITS(3) [],
        PAD_TYPE OFFSET(3) NUMBITS(1) [],
        POOL_TYPE OFFSET(4) NUMBITS(4) [],
        FIRST_STRIDE OFFSET(8) NUMBITS(1) [],
        BYPASS_CONV OFFSET(9) NUMBITS(1) [],
        LOAD_PARA OFFSET(10) NUMBITS(1) [],
        DMA_BURST_SIZE OFFSET(16) NUMBITS(8) [],
        PAD_VALUE OFFSET(24) NUMBITS(8) [],
        BWSX_BASE_ADDR OFFSET(32) NUMBITS(32) []
    ],

    pub KERNEL_LOAD_CFG [
        LOAD_COOR OFFSET(0) NUMBITS(1) [],
        LOAD_TIME OFFSET(1) NUMBITS(6) [],
        PARA_SIZE OFFSET(15) NUMBITS(17) [],
        PARA_START_ADDR OFFSET(32) NUMBITS(32) []
    ],

    pub KERNEL_OFFSET [
        COEF_COLUMN_OFFSET OFFSET(0) NUMBITS(4) [],
        COEF_ROW_OFFSET OFFSET(4) NUMBITS(12) []
    ],

    pub KERNEL_CALC_TYPE_CFG [
        CHANNEL_SWITCH_ADDR OFFSET(0) NUMBITS(15) [],
        ROW_SWITCH_ADDR OFFSET(16) NUMBITS(4) [],
        COEF_SIZE OFFSET(20) NUMBITS(8) [],
        COEF_GROUP OFFSET(28) NUMBITS(3) [],
        LOAD_ACT OFFSET(31) NUMBITS(1) [],
        ACTIVE_ADDR OFFSET(32) NUMBITS(32) []
    ],

    pub WRITE_BACK_CFG [
        WB_CHANNEL_SWITCH_ADDR OFFSET(0) NUMBITS(15) [],
        WB_ROW_SWITCH_ADDR OFFSET(16) NUMBITS(4) [],
        WB_GROUP OFFSET(20) NUMBITS(3) []
    ],

    pub CONV_VALUE [
        SHR_W OFFSET(0) NUMBITS(4) [],
        SHR_X OFFSET(4) NUMBITS(4) [],
        ARG_W OFFSET(8) NUMBITS(24) [],
        ARG_X OFFSET(32) NUMBITS(24) []
    ],

    pub CONV_VALUE2 [
        ARG_ADD OFFSET(0) NUMBITS(40) []
    ],

    pub DMA_PARAMETER [
        SEND_DATA_OUT OFFSET(0) NUMBITS(1) [],
        CHANNEL_BYTE_NUM OFFSET(16) NUMBITS(16) [],
        DMA_TOTAL_BYTE OFFSET(32) NUMBITS(32) []
    ]
}

/// Number of 64-bit words one descriptor occupies in the FIFO.
pub const LAYER_WORDS: usize = 12;

/// One layer's worth of KPU configuration, as emitted by the model compiler.
///
/// Field order matches the order the FIFO decodes them in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct LayerArgument {
    pub interrupt_enable: u64,
    pub image_addr: u64,
    pub image_channel_num: u64,
    pub image_size: u64,
    pub kernel_pool_type_cfg: u64,
    pub kernel_load_cfg: u64,
    pub kernel_offset: u64,
    pub kernel_calc_type_cfg: u64,
    pub write_back_cfg: u64,
    pub conv_value: u64,
    pub conv_value2: u64,
    pub dma_parameter: u64,
}

static_assertions::const_assert_eq!(
    core::mem::size_of::<LayerArgument>(),
    LAYER_WORDS * core::mem::size_of::<u64>()
);

fn read<R: RegisterLongName>(word: u64, field: Field<u64, R>) -> u64 {
    LocalRegisterCopy::<u64, R>::new(word).read(field)
}

fn modify<R: RegisterLongName>(word: &mut u64, value: FieldValue<u64, R>) {
    let mut copy = LocalRegisterCopy::<u64, R>::new(*word);
    copy.modify(value);
    *word = copy.get();
}

impl LayerArgument {
    /// The words in FIFO order.
    pub fn words(&self) -> [u64; LAYER_WORDS] {
        [
            self.interrupt_enable,
            self.image_addr,
            self.image_channel_num,
            self.image_size,
            self.kernel_pool_type_cfg,
            self.kernel_load_cfg,
            self.kernel_offset,
            self.kernel_calc_type_cfg,
            self.write_back_cfg,
            self.conv_value,
            self.conv_value2,
            self.dma_parameter,
        ]
    }

    /// A layer is final when it both streams its result to the output FIFO
    /// and raises calc-done when it finishes.
    pub fn is_final(&self) -> bool {
        read(self.dma_parameter, DMA_PARAMETER::SEND_DATA_OUT) != 0
            && read(self.interrupt_enable, INTERRUPT_ENABLE::INT_EN) != 0
    }

    /// Encoded output byte count. The hardware stores it minus one.
    pub fn dma_total_byte(&self) -> u64 {
        read(self.dma_parameter, DMA_PARAMETER::DMA_TOTAL_BYTE)
    }

    pub fn image_src_addr(&self) -> u64 {
        read(self.image_addr, IMAGE_ADDR::IMAGE_SRC_ADDR)
    }

    pub fn input_channels(&self) -> u64 {
        read(self.image_channel_num, IMAGE_CHANNEL_NUM::I_CH_NUM) + 1
    }

    pub fn output_channels(&self) -> u64 {
        read(self.image_channel_num, IMAGE_CHANNEL_NUM::O_CH_NUM) + 1
    }

    /// Bytes of image memory the layer reads: one channel stride of 64-byte
    /// rows per input channel.
    pub fn input_bytes(&self) -> usize {
        let stride = read(self.kernel_calc_type_cfg, KERNEL_CALC_TYPE_CFG::CHANNEL_SWITCH_ADDR);
        (stride * TILE_ROW_BYTES as u64 * self.input_channels()) as usize
    }

    pub fn set_interrupt_enabled(&mut self, enabled: bool) {
        modify(
            &mut self.interrupt_enable,
            INTERRUPT_ENABLE::INT_EN.val(enabled as u64),
        );
    }

    pub fn set_send_data_out(&mut self) {
        modify(&mut self.dma_parameter, DMA_PARAMETER::SEND_DATA_OUT::SET);
    }

    pub fn set_full_add(&mut self) {
        modify(&mut self.interrupt_enable, INTERRUPT_ENABLE::FULL_ADD::SET);
    }

    pub fn set_dma_total_byte(&mut self, encoded: u32) {
        modify(
            &mut self.dma_parameter,
            DMA_PARAMETER::DMA_TOTAL_BYTE.val(encoded as u64),
        );
    }

    pub fn set_image_src_addr(&mut self, row: u16) {
        modify(&mut self.image_addr, IMAGE_ADDR::IMAGE_SRC_ADDR.val(row as u64));
    }

    /// Sets the input geometry: `channel_switch_addr` 64-byte rows per
    /// channel and `channels` input channels.
    pub fn set_input_geometry(&mut self, channel_switch_addr: u16, channels: u16) {
        modify(
            &mut self.kernel_calc_type_cfg,
            KERNEL_CALC_TYPE_CFG::CHANNEL_SWITCH_ADDR.val(channel_switch_addr as u64),
        );
        modify(
            &mut self.image_channel_num,
            IMAGE_CHANNEL_NUM::I_CH_NUM.val(channels.saturating_sub(1) as u64),
        );
    }

    pub fn set_output_channels(&mut self, channels: u16) {
        modify(
            &mut self.image_channel_num,
            IMAGE_CHANNEL_NUM::O_CH_NUM.val(channels.saturating_sub(1) as u64),
        );
    }
}
