//! Two-bit-per-frame state bitmap.
//!
//! The bitmap lives in physical memory owned by its frame pool, either in dedicated info
//! frames or in the pool's own leading frames. Byte `i` describes frames `4i..4i + 4` of the
//! pool, most-significant pair first:
//!
//! ```text
//!  bit  7 6   5 4   3 2   1 0
//!      [ 4i ][4i+1][4i+2][4i+3]
//! ```

use crate::{AddressTranslator, FrameState, PhysicalAddress};

/// Number of frame states packed into one bitmap byte.
const STATES_PER_BYTE: usize = 4;

/// A view of a frame pool's state bitmap.
pub(crate) struct FrameBitmap {
    /// Physical address of the first bitmap byte.
    base: PhysicalAddress,
    /// Number of frames described.
    frames: usize,
}

impl FrameBitmap {
    /// Creates a bitmap describing `frames` frames, stored at `base`.
    ///
    /// The contents are whatever memory holds; call [`clear`](Self::clear) before use.
    pub(crate) const fn new(base: PhysicalAddress, frames: usize) -> Self {
        Self { base, frames }
    }

    /// Number of bytes needed to describe `frames` frames.
    pub(crate) const fn byte_len(frames: usize) -> usize {
        frames.div_ceil(STATES_PER_BYTE)
    }

    fn bytes(&self) -> &[u8] {
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(self.base);
        // SAFETY: The owning pool reserved `byte_len(frames)` bytes at `base` for the bitmap,
        // and nothing else writes to them.
        unsafe { core::slice::from_raw_parts(ptr, Self::byte_len(self.frames)) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(self.base);
        // SAFETY: As in `bytes`; `&mut self` makes this the only live view.
        unsafe { core::slice::from_raw_parts_mut(ptr, Self::byte_len(self.frames)) }
    }

    /// Bit shift of the pair describing `index` within its byte.
    const fn shift(index: usize) -> u32 {
        (6 - 2 * (index % STATES_PER_BYTE)) as u32
    }

    /// Returns the state of the frame at `index` (relative to the pool base).
    pub(crate) fn get(&self, index: usize) -> FrameState {
        assert!(index < self.frames, "frame index out of bitmap bounds");
        let byte = self.bytes()[index / STATES_PER_BYTE];
        FrameState::from_bits(byte >> Self::shift(index))
    }

    /// Sets the state of the frame at `index` (relative to the pool base).
    pub(crate) fn set(&mut self, index: usize, state: FrameState) {
        assert!(index < self.frames, "frame index out of bitmap bounds");
        let shift = Self::shift(index);
        let byte = &mut self.bytes_mut()[index / STATES_PER_BYTE];
        *byte = (*byte & !(0b11 << shift)) | (state.bits() << shift);

        #[cfg(feature = "detailed-logging")]
        log::trace!("bitmap[{}] <- {:?}", index, state);
    }

    /// Marks `len` frames starting at `index` as one allocated run.
    pub(crate) fn set_run(&mut self, index: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.set(index, FrameState::HeadOfSequence);
        for i in index + 1..index + len {
            self.set(i, FrameState::Allocated);
        }
    }

    /// Resets every frame to [`FrameState::Free`].
    pub(crate) fn clear(&mut self) {
        self.bytes_mut().fill(0);
    }

    /// Finds the lowest index starting `len` consecutive free frames.
    pub(crate) fn find_free_run(&self, len: usize) -> Option<usize> {
        if len == 0 || len > self.frames {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.frames {
            if self.get(index).is_free() {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// Returns the raw bitmap bytes.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> &[u8] {
        self.bytes()
    }
}
