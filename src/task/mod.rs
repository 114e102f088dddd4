use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::{err::KpuError, osal::DmaChannel};

pub mod burst;
pub mod layer;

pub use layer::{LAYER_WORDS, LayerArgument};

/// Invoked once, from interrupt context, when a task completes. Receives the
/// task back so the caller regains its output buffer.
pub type CompletionCallback = Box<dyn FnOnce(KpuTask) + Send>;

/// Position inside the not-yet-loaded suffix of a task's layer list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub next: usize,
    pub remaining: usize,
}

impl Cursor {
    pub fn new(layers: usize) -> Self {
        Self {
            next: 0,
            remaining: layers,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// One accelerator job.
pub struct KpuTask {
    layers: Vec<LayerArgument>,
    dma_channel: DmaChannel,
    source: Option<&'static [u8]>,
    dest: Option<Vec<u64>>,
    eight_bit_mode: bool,
    callback: Option<CompletionCallback>,
    input_len: usize,
    output_len: usize,
}

impl fmt::Debug for KpuTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KpuTask")
            .field("layers", &self.layers.len())
            .field("dma_channel", &self.dma_channel)
            .field("source", &self.source.map(|s| s.as_ptr()))
            .field("dest_words", &self.dest.as_ref().map(|d| d.len()))
            .field("eight_bit_mode", &self.eight_bit_mode)
            .field("input_len", &self.input_len)
            .field("output_len", &self.output_len)
            .finish()
    }
}

impl KpuTask {
    pub fn new<F>(layers: Vec<LayerArgument>, dma_channel: DmaChannel, callback: F) -> Self
    where
        F: FnOnce(KpuTask) + Send + 'static,
    {
        Self {
            layers,
            dma_channel,
            source: None,
            dest: None,
            eight_bit_mode: false,
            callback: Some(Box::new(callback)),
            input_len: 0,
            output_len: 0,
        }
    }

    /// Feed the first layer from `source` over DMA. Without a source the task
    /// consumes whatever the previous task left in KPU image memory.
    pub fn with_source(mut self, source: &'static [u8]) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_eight_bit_mode(mut self, enabled: bool) -> Self {
        self.eight_bit_mode = enabled;
        self
    }

    /// Size the task's buffers from its first and last layers and allocate a
    /// zeroed output buffer.
    pub fn init(&mut self) -> Result<(), KpuError> {
        let (Some(first), Some(last)) = (self.layers.first(), self.layers.last()) else {
            return Err(KpuError::MalformedTask("task has no layers"));
        };

        self.input_len = first.input_bytes() / 8;
        self.output_len = (last.dma_total_byte() as usize + 1).div_ceil(8);

        let mut dest = Vec::new();
        dest.try_reserve_exact(self.output_len)
            .map_err(|_| KpuError::AllocationError {
                bytes: self.output_len * 8,
            })?;
        dest.resize(self.output_len, 0u64);
        self.dest = Some(dest);

        debug!(
            "task init: {} layers, input {} words, output {} words",
            self.layers.len(),
            self.input_len,
            self.output_len
        );
        Ok(())
    }

    pub fn deinit(&mut self) {
        if self.dest.take().is_some() {
            debug!("task deinit: released {} output words", self.output_len);
        }
    }

    pub fn layers(&self) -> &[LayerArgument] {
        &self.layers
    }

    pub fn dma_channel(&self) -> DmaChannel {
        self.dma_channel
    }

    pub fn source(&self) -> Option<&'static [u8]> {
        self.source
    }

    pub fn eight_bit_mode(&self) -> bool {
        self.eight_bit_mode
    }

    /// Input transfer length in 8-byte units.
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Output buffer length in 8-byte units.
    pub fn output_len(&self) -> usize {
        self.output_len
    }

    pub fn output_words(&self) -> Option<&[u64]> {
        self.dest.as_deref()
    }

    /// Output buffer viewed as bytes.
    pub fn output(&self) -> Option<&[u8]> {
        // SAFETY: u8 has no alignment or validity requirements and the byte
        // length covers exactly the borrowed words.
        self.dest.as_deref().map(|words| unsafe {
            core::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8)
        })
    }

    pub(crate) fn output_addr(&mut self) -> Option<usize> {
        self.dest.as_mut().map(|d| d.as_mut_ptr() as usize)
    }

    pub(crate) fn take_callback(&mut self) -> Option<CompletionCallback> {
        self.callback.take()
    }

    /// Checks everything `run` relies on but does not re-verify from
    /// interrupt context.
    pub(crate) fn validate(&self) -> Result<(), KpuError> {
        let Some(last) = self.layers.last() else {
            return Err(KpuError::MalformedTask("task has no layers"));
        };
        if !last.is_final() {
            return Err(KpuError::MalformedTask(
                "last layer must send data out and raise an interrupt",
            ));
        }
        match &self.dest {
            None => return Err(KpuError::MalformedTask("task not initialised")),
            Some(d) if d.len() < self.output_len || self.output_len == 0 => {
                return Err(KpuError::MalformedTask("output buffer shorter than last layer"));
            }
            Some(_) => {}
        }
        if let Some(src) = self.source
            && src.len() < self.input_len * 8
        {
            return Err(KpuError::MalformedTask("source shorter than first layer input"));
        }
        if self.callback.is_none() {
            return Err(KpuError::MalformedTask("completion callback already consumed"));
        }
        Ok(())
    }
}
