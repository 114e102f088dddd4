//! Burst loading of layer descriptors into the layer-argument FIFO.

use super::{Cursor, LayerArgument};
use crate::{osal::KpuPort, registers::int::InterruptSources};

/// Push the next burst of descriptors into the FIFO and return how many were
/// written.
///
/// When everything left fits in one burst the cursor is drained and only
/// calc-done stays unmasked. Otherwise exactly `capacity` descriptors go out
/// and the current mask is left alone so the almost-empty interrupt asks for
/// the next burst.
pub fn push_burst<P: KpuPort + ?Sized>(
    port: &mut P,
    layers: &[LayerArgument],
    cursor: &mut Cursor,
    capacity: usize,
) -> usize {
    port.clear_interrupts(InterruptSources::all());

    let count = cursor.remaining.min(capacity);
    for layer in &layers[cursor.next..cursor.next + count] {
        for word in layer.words() {
            port.push_layer_word(word);
        }
    }

    if cursor.remaining <= capacity {
        cursor.next += count;
        cursor.remaining = 0;
        port.set_interrupt_mask(InterruptSources::COMPLETION_ONLY_MASK);
    } else {
        cursor.next += capacity;
        cursor.remaining -= capacity;
    }

    trace!("burst: pushed {} layers, {} remaining", count, cursor.remaining);
    count
}

/// Write one descriptor outside of any task.
pub fn push_layer<P: KpuPort + ?Sized>(port: &mut P, layer: &LayerArgument) {
    for word in layer.words() {
        port.push_layer_word(word);
    }
}
