//! Address mapping for the KPU's tiled image memory.
//!
//! Image memory is organised in 64-byte rows. Narrow tensors share a row
//! between several channels: up to 16 columns wide, four channels sit side by
//! side at 16-byte pitch; up to 32 wide, two channels at 32-byte pitch. Wider
//! tensors get one channel per row group, spanning `ceil(width / 64)` rows.

use crate::registers::consts::TILE_ROW_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledLayout {
    /// Byte pitch between channels packed into the same row.
    pub row_padding: usize,
    /// Channels packed into one row.
    pub row_group: usize,
    /// 64-byte rows per image line.
    pub row_length: usize,
}

impl TiledLayout {
    pub const fn for_width(width: usize) -> Self {
        if width <= 16 {
            Self {
                row_padding: 16,
                row_group: 4,
                row_length: 1,
            }
        } else if width <= 32 {
            Self {
                row_padding: 32,
                row_group: 2,
                row_length: 1,
            }
        } else {
            Self {
                row_padding: 64,
                row_group: 1,
                row_length: width.div_ceil(TILE_ROW_BYTES),
            }
        }
    }

    /// Byte offset of the origin of `channel`'s plane.
    pub const fn channel_origin(&self, channel: usize, height: usize) -> usize {
        channel / self.row_group * self.row_length * height * TILE_ROW_BYTES
            + channel % self.row_group * self.row_padding
    }

    /// Byte offset of element (`channel`, `y`, `x`) in a tensor of `height`
    /// rows.
    pub const fn offset(&self, channel: usize, y: usize, x: usize, height: usize) -> usize {
        self.channel_origin(channel, height) + y * self.row_length * TILE_ROW_BYTES + x
    }

    /// Bytes a tiled tensor of `channels` x `height` occupies.
    pub const fn buffer_len(&self, channels: usize, height: usize) -> usize {
        channels.div_ceil(self.row_group) * self.row_length * height * TILE_ROW_BYTES
    }
}
