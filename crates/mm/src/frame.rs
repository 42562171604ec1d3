/// Allocation state of a physical memory frame.
///
/// Each state is stored as two bits in a frame pool's bitmap. The encoding is shared with
/// anything that inspects the bitmap directly and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameState {
    /// Frame is available for allocation (`00`).
    Free = 0b00,
    /// First frame of an allocated run (`01`). Only a head can start a release.
    HeadOfSequence = 0b01,
    /// Frame is reserved out-of-band and never handed out or released (`10`).
    Inaccessible = 0b10,
    /// Non-first frame of an allocated run (`11`).
    Allocated = 0b11,
}

impl FrameState {
    /// Decodes a state from the low two bits of `bits`.
    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Self::Free,
            0b01 => Self::HeadOfSequence,
            0b10 => Self::Inaccessible,
            _ => Self::Allocated,
        }
    }

    /// Returns the two-bit encoding of this state.
    #[inline]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Returns whether the frame may be handed out.
    #[inline]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free)
    }
}
