//! Post-processing kernels for int8 KPU output.
//!
//! None of these touch the accelerator; they run on buffers after the
//! output DMA has delivered them.

pub mod tiled;

use crate::{config::KpuConfig, err::KpuError};
use tiled::TiledLayout;

/// Affine mapping `real = q * scale + bias`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizeParam {
    pub scale: f32,
    pub bias: f32,
}

impl QuantizeParam {
    pub const fn new(scale: f32, bias: f32) -> Self {
        Self { scale, bias }
    }

    #[inline]
    pub fn dequantize(&self, q: u8) -> f32 {
        q as f32 * self.scale + self.bias
    }

    /// Maps `real` back into this domain, rounding half up and clamping to
    /// `0..=255`. NaN maps to 0.
    #[inline]
    pub fn requantize(&self, real: f32) -> u8 {
        let q = (real - self.bias) / self.scale;
        (q.clamp(0.0, 255.0) + 0.5) as u8
    }
}

/// How [`global_average_pool`] lays out its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLayout {
    /// One byte per channel, in channel order.
    Dense,
    /// 4x4 tiled layout ready to be fed back to the KPU; only each tile's
    /// origin is written.
    Tiled,
}

impl PoolLayout {
    /// Tiled when `dest` lives in KPU image memory.
    pub fn for_dest(config: &KpuConfig, dest: &[u8]) -> Self {
        if config.is_ai_io_addr(dest.as_ptr() as usize) {
            PoolLayout::Tiled
        } else {
            PoolLayout::Dense
        }
    }
}

const POOL_TILE: usize = 4;

fn check_len(needed: usize, actual: usize) -> Result<(), KpuError> {
    if actual < needed {
        Err(KpuError::BufferTooSmall { needed, actual })
    } else {
        Ok(())
    }
}

/// Elementwise sum of two quantized tensors, requantized into `dest_param`
/// and written in tiled layout.
///
/// Sources are dense and channel-major (`channels x height x width`).
#[allow(clippy::too_many_arguments)]
pub fn add(
    src1: &[u8],
    src1_param: &QuantizeParam,
    src2: &[u8],
    src2_param: &QuantizeParam,
    width: usize,
    height: usize,
    channels: usize,
    dest: &mut [u8],
    dest_param: &QuantizeParam,
) -> Result<(), KpuError> {
    let count = width * height * channels;
    let layout = TiledLayout::for_width(width);
    check_len(count, src1.len())?;
    check_len(count, src2.len())?;
    if count > 0 {
        check_len(layout.offset(channels - 1, height - 1, width - 1, height) + 1, dest.len())?;
    }

    let mut i = 0;
    for oc in 0..channels {
        for y in 0..height {
            for x in 0..width {
                let real = src1_param.dequantize(src1[i]) + src2_param.dequantize(src2[i]);
                dest[layout.offset(oc, y, x, height)] = dest_param.requantize(real);
                i += 1;
            }
        }
    }
    Ok(())
}

/// Average `kernel_size` consecutive samples per channel, picking the output
/// layout from where `dest` lives.
pub fn global_average_pool(
    config: &KpuConfig,
    src: &[u8],
    src_param: &QuantizeParam,
    kernel_size: usize,
    channels: usize,
    dest: &mut [u8],
    dest_param: &QuantizeParam,
) -> Result<(), KpuError> {
    let layout = PoolLayout::for_dest(config, dest);
    global_average_pool_with_layout(
        src,
        src_param,
        kernel_size,
        channels,
        dest,
        dest_param,
        layout,
    )
}

pub fn global_average_pool_with_layout(
    src: &[u8],
    src_param: &QuantizeParam,
    kernel_size: usize,
    channels: usize,
    dest: &mut [u8],
    dest_param: &QuantizeParam,
    layout: PoolLayout,
) -> Result<(), KpuError> {
    if kernel_size == 0 {
        return Err(KpuError::InvalidArgument("pool kernel size is zero"));
    }
    check_len(kernel_size * channels, src.len())?;
    let tiled = TiledLayout::for_width(POOL_TILE);
    let needed = match layout {
        PoolLayout::Dense => channels,
        PoolLayout::Tiled if channels == 0 => 0,
        PoolLayout::Tiled => tiled.channel_origin(channels - 1, POOL_TILE) + 1,
    };
    check_len(needed, dest.len())?;

    for (oc, samples) in src.chunks_exact(kernel_size).take(channels).enumerate() {
        let sum: u64 = samples.iter().map(|&s| s as u64).sum();
        let avg = sum as f32 / kernel_size as f32;
        let value = dest_param.requantize(avg * src_param.scale + src_param.bias);
        let index = match layout {
            PoolLayout::Dense => oc,
            PoolLayout::Tiled => tiled.channel_origin(oc, POOL_TILE),
        };
        dest[index] = value;
    }
    Ok(())
}

/// Lane stride of fully-connected output in the KPU's output FIFO.
pub const MATMUL_LANE_STRIDE: usize = 16;

/// Gather one value per channel from fully-connected output and dequantize.
pub fn matmul_end(
    src: &[u8],
    channels: usize,
    dest: &mut [f32],
    dest_param: &QuantizeParam,
) -> Result<(), KpuError> {
    if channels == 0 {
        return Ok(());
    }
    check_len((channels - 1) * MATMUL_LANE_STRIDE + 1, src.len())?;
    check_len(channels, dest.len())?;

    for (i, out) in dest[..channels].iter_mut().enumerate() {
        *out = dest_param.dequantize(src[i * MATMUL_LANE_STRIDE]);
    }
    Ok(())
}

pub fn dequantize(
    src: &[u8],
    src_param: &QuantizeParam,
    count: usize,
    dest: &mut [f32],
) -> Result<(), KpuError> {
    check_len(count, src.len())?;
    check_len(count, dest.len())?;

    for (out, &q) in dest[..count].iter_mut().zip(&src[..count]) {
        *out = src_param.dequantize(q);
    }
    Ok(())
}
