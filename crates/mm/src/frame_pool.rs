//! Contiguous physical frame pools.
//!
//! A [`FramePool`] owns a contiguous range of frame numbers and hands out runs of consecutive
//! frames. Its bookkeeping is a 2-bit-per-frame bitmap (see [`FrameState`]) kept in physical
//! memory: either in info frames supplied by the caller, or in the pool's own leading frames.
//!
//! Pools are registered in a process-wide arena and referred to by [`PoolId`]. Releasing
//! frames needs only a frame number: [`FramePool::release_frames`] finds the owning pool by
//! range.

use alloc::vec::Vec;

use crate::bitmap::FrameBitmap;
use crate::global::kernel_global;
use crate::{FrameNumber, FrameState, HumanSize, PAGE_SIZE};

/// Errors reported by frame pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The pool size is zero, not a multiple of 8, or larger than one pool can describe.
    InvalidPoolSize,
    /// The supplied info frames cannot hold the pool's bitmap.
    InfoFramesTooSmall,
    /// A request for zero frames.
    ZeroFrames,
    /// No run of free frames is long enough for the request.
    OutOfFrames,
    /// The frames named by a request do not all lie inside the pool.
    OutOfRange,
    /// The frame being released does not start an allocated run.
    NotHeadOfSequence,
    /// No registered pool contains the frame.
    NotOwned,
    /// The pool handle does not name a registered pool.
    UnknownPool,
}

/// A pool of contiguous physical frames.
pub struct FramePool {
    base: FrameNumber,
    frames: usize,
    free: usize,
    bitmap: FrameBitmap,
}

impl FramePool {
    /// Largest pool, in frames.
    pub const MAX_FRAMES: usize = PAGE_SIZE * 8;

    /// Creates a pool over `frames` frames starting at `base`.
    ///
    /// With `info_frame` set, the bitmap is stored there and `info_frames` must be at least
    /// [`needed_info_frames`](Self::needed_info_frames); reserving those frames in whichever
    /// pool owns them (see [`mark_inaccessible`](Self::mark_inaccessible)) is the caller's job.
    /// Without it, the bitmap is stored in the pool's own leading frames, which are reserved
    /// as the pool's first allocated run.
    ///
    /// The bitmap memory must be reachable through the current
    /// [`AddressTranslator`](crate::AddressTranslator).
    pub fn new(
        base: FrameNumber,
        frames: usize,
        info_frame: Option<FrameNumber>,
        info_frames: usize,
    ) -> Result<Self, FrameError> {
        if frames == 0 || frames % 8 != 0 || frames > Self::MAX_FRAMES {
            log::error!("invalid frame pool size: {} frames", frames);
            return Err(FrameError::InvalidPoolSize);
        }

        let needed = Self::needed_info_frames(frames);
        let bitmap_frame = match info_frame {
            Some(frame) => {
                if info_frames < needed {
                    log::error!(
                        "{} info frames cannot describe {} frames ({} needed)",
                        info_frames,
                        frames,
                        needed
                    );
                    return Err(FrameError::InfoFramesTooSmall);
                }
                frame
            }
            None => base,
        };

        let mut pool = Self {
            base,
            frames,
            free: frames,
            bitmap: FrameBitmap::new(bitmap_frame.start(), frames),
        };
        pool.bitmap.clear();

        if info_frame.is_none() {
            let reserved = info_frames.max(needed).min(frames);
            pool.bitmap.set_run(0, reserved);
            pool.free -= reserved;
        }

        log::info!(
            "frame pool: frames {}..{} ({}), bitmap at frame {}, {} free",
            base,
            base + frames,
            HumanSize(frames * PAGE_SIZE),
            bitmap_frame,
            pool.free
        );
        Ok(pool)
    }

    /// Number of management frames needed to hold the bitmap of an `frames`-frame pool.
    ///
    /// Each frame's state takes two bits, so one management frame describes `4 * PAGE_SIZE`
    /// frames.
    #[inline]
    pub const fn needed_info_frames(frames: usize) -> usize {
        frames.div_ceil(PAGE_SIZE * 4)
    }

    /// Moves the pool into the process-wide registry, making its frames releasable through
    /// [`release_frames`](Self::release_frames).
    ///
    /// Pool ranges must not overlap; this is not checked.
    pub fn register(self) -> PoolId {
        with_frame_pools(|pools| {
            pools.push(self);
            PoolId(pools.len() - 1)
        })
    }

    /// Returns the first frame of the pool.
    #[inline]
    pub fn base_frame(&self) -> FrameNumber {
        self.base
    }

    /// Returns the number of frames in the pool.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Returns the number of free frames.
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Returns whether `frame` lies inside the pool.
    #[inline]
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.base && frame - self.base < self.frames
    }

    /// Returns the state of `frame`, or `None` if it lies outside the pool.
    pub fn state(&self, frame: FrameNumber) -> Option<FrameState> {
        self.index_of(frame).map(|index| self.bitmap.get(index))
    }

    fn index_of(&self, frame: FrameNumber) -> Option<usize> {
        self.contains(frame).then(|| frame - self.base)
    }

    /// Allocates `n` contiguous frames, returning the first.
    ///
    /// The lowest-numbered run of `n` free frames is used. Its first frame becomes
    /// [`FrameState::HeadOfSequence`], the rest [`FrameState::Allocated`]. On failure nothing
    /// changes.
    pub fn get_frames(&mut self, n: usize) -> Result<FrameNumber, FrameError> {
        if n == 0 {
            log::error!("frame pool at {}: request for zero frames", self.base);
            return Err(FrameError::ZeroFrames);
        }
        if n > self.free {
            log::error!(
                "frame pool at {}: {} frames requested, {} free",
                self.base,
                n,
                self.free
            );
            return Err(FrameError::OutOfFrames);
        }

        let Some(index) = self.bitmap.find_free_run(n) else {
            log::error!(
                "frame pool at {}: no run of {} free frames ({} free in total)",
                self.base,
                n,
                self.free
            );
            return Err(FrameError::OutOfFrames);
        };

        self.bitmap.set_run(index, n);
        self.free -= n;

        let head = self.base + index;
        log::debug!("allocated {} frames at {}", n, head);
        Ok(head)
    }

    /// Reserves `n` frames starting at `base` as one allocated run.
    ///
    /// Used for frames that are in use outside the pool's control, such as another pool's
    /// bitmap. The frames are marked regardless of their current state and the free count
    /// drops by `n` every time, so overlapping calls count frames twice; callers must not
    /// overlap them.
    pub fn mark_inaccessible(&mut self, base: FrameNumber, n: usize) -> Result<(), FrameError> {
        let in_range = self.contains(base)
            && (base - self.base)
                .checked_add(n)
                .is_some_and(|end| end <= self.frames);
        if !in_range {
            log::error!(
                "frame pool at {}: cannot reserve {} frames at {} outside the pool",
                self.base,
                n,
                base
            );
            return Err(FrameError::OutOfRange);
        }

        self.bitmap.set_run(base - self.base, n);
        self.free = self.free.saturating_sub(n);
        log::debug!("reserved {} frames at {}", n, base);
        Ok(())
    }

    /// Releases the run starting at `first`.
    ///
    /// `first` must be a [`FrameState::HeadOfSequence`] frame of this pool. The head and every
    /// following [`FrameState::Allocated`] frame become free; the walk stops at the first frame
    /// in any other state, which belongs to something else.
    pub fn release(&mut self, first: FrameNumber) -> Result<(), FrameError> {
        let Some(index) = self.index_of(first) else {
            log::error!("frame pool at {}: frame {} is not in this pool", self.base, first);
            return Err(FrameError::NotOwned);
        };

        if self.bitmap.get(index) != FrameState::HeadOfSequence {
            log::error!(
                "cannot release frame {}: not the head of a sequence ({:?})",
                first,
                self.bitmap.get(index)
            );
            return Err(FrameError::NotHeadOfSequence);
        }

        self.bitmap.set(index, FrameState::Free);
        let mut released = 1;
        for index in index + 1..self.frames {
            if self.bitmap.get(index) != FrameState::Allocated {
                break;
            }
            self.bitmap.set(index, FrameState::Free);
            released += 1;
        }
        self.free += released;

        log::debug!("released {} frames at {}", released, first);
        Ok(())
    }

    /// Releases the run starting at `first` in whichever registered pool contains it.
    pub fn release_frames(first: FrameNumber) -> Result<(), FrameError> {
        with_frame_pools(|pools| {
            let Some(pool) = pools.iter_mut().find(|pool| pool.contains(first)) else {
                log::error!("cannot release frame {}: no frame pool contains it", first);
                return Err(FrameError::NotOwned);
            };
            pool.release(first)
        })
    }
}

kernel_global! {
    /// Every registered frame pool, indexed by [`PoolId`].
    static FRAME_POOLS: Vec<FramePool> = Vec::new();
    fn with_frame_pools;
}

/// Handle to a registered [`FramePool`].
///
/// Handles are plain indices into the registry; copying one does not copy the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(usize);

impl PoolId {
    fn with<R>(self, f: impl FnOnce(&mut FramePool) -> R) -> Result<R, FrameError> {
        with_frame_pools(|pools| pools.get_mut(self.0).map(f)).ok_or_else(|| {
            log::error!("{:?} does not name a registered frame pool", self);
            FrameError::UnknownPool
        })
    }

    /// Allocates `n` contiguous frames from the pool. See [`FramePool::get_frames`].
    pub fn get_frames(self, n: usize) -> Result<FrameNumber, FrameError> {
        self.with(|pool| pool.get_frames(n))?
    }

    /// Reserves frames in the pool. See [`FramePool::mark_inaccessible`].
    pub fn mark_inaccessible(self, base: FrameNumber, n: usize) -> Result<(), FrameError> {
        self.with(|pool| pool.mark_inaccessible(base, n))?
    }

    /// Returns the number of free frames in the pool.
    pub fn free_frames(self) -> Result<usize, FrameError> {
        self.with(|pool| pool.free_frames())
    }

    /// Returns the state of `frame`, or `None` if the pool does not contain it.
    pub fn state(self, frame: FrameNumber) -> Result<Option<FrameState>, FrameError> {
        self.with(|pool| pool.state(frame))
    }

    /// Returns whether the pool contains `frame`.
    pub fn contains(self, frame: FrameNumber) -> Result<bool, FrameError> {
        self.with(|pool| pool.contains(frame))
    }
}
