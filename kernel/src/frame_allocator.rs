// Frame Allocator for the User Frame Pool
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB};
use x86_64::PhysAddr;

use crate::PAGE_SIZE;

bitflags::bitflags! {
    /// Requests attached to a frame allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the frame before handing it out.
        const ZERO = 1 << 0;
    }
}

struct PoolInner {
    bitmap: Vec<u64>,
    next_free: usize,
    free_frames: usize,
}

/// Bitmap allocator over the contiguous run of physical frames reserved for
/// user pages. Frame contents are reached through `phys_offset`, the offset
/// at which the kernel maps physical memory.
pub struct FramePool {
    base: PhysAddr,
    frame_count: usize,
    phys_offset: u64,
    inner: Mutex<PoolInner>,
}

impl FramePool {
    /// # Safety
    ///
    /// `[base, base + frame_count * PAGE_SIZE)` must be page-aligned memory
    /// owned by the caller, mapped read-write at `base + phys_offset`, and
    /// must outlive the pool.
    pub unsafe fn new(base: PhysAddr, frame_count: usize, phys_offset: u64) -> Self {
        assert!(base.is_aligned(PAGE_SIZE as u64));
        let words = (frame_count + 63) / 64;
        log::info!("Frame pool ready: {} frames at {:#x}", frame_count, base.as_u64());
        Self {
            base,
            frame_count,
            phys_offset,
            inner: Mutex::new(PoolInner {
                bitmap: vec![0; words],
                next_free: 0,
                free_frames: frame_count,
            }),
        }
    }

    fn frame_index(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address().as_u64();
        if addr < self.base.as_u64() {
            return None;
        }
        let index = ((addr - self.base.as_u64()) / PAGE_SIZE as u64) as usize;
        if index < self.frame_count {
            Some(index)
        } else {
            None
        }
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(self.base + (index * PAGE_SIZE) as u64)
    }

    /// Allocate one frame, scanning from the last allocation point with
    /// wraparound. Returns `None` when the pool is exhausted.
    pub fn alloc(&self, flags: AllocFlags) -> Option<PhysFrame> {
        let mut found = None;
        {
            let mut inner = self.inner.lock();
            let start = inner.next_free;
            for offset in 0..self.frame_count {
                let index = (start + offset) % self.frame_count;
                let (word, bit) = (index / 64, index % 64);
                if inner.bitmap[word] & (1 << bit) == 0 {
                    inner.bitmap[word] |= 1 << bit;
                    inner.next_free = (index + 1) % self.frame_count;
                    inner.free_frames -= 1;
                    found = Some(index);
                    break;
                }
            }
        }
        let frame = self.frame_at(found?);
        if flags.contains(AllocFlags::ZERO) {
            unsafe {
                core::ptr::write_bytes(self.frame_ptr(frame), 0, PAGE_SIZE);
            }
        }
        Some(frame)
    }

    /// Return a frame to the pool. Unknown frames are a logged no-op.
    pub fn free(&self, frame: PhysFrame) {
        let index = match self.frame_index(frame) {
            Some(index) => index,
            None => {
                log::warn!("Freeing frame {:?} outside the pool", frame);
                return;
            }
        };
        let mut inner = self.inner.lock();
        let (word, bit) = (index / 64, index % 64);
        if inner.bitmap[word] & (1 << bit) == 0 {
            log::warn!("Freeing frame {:?} twice", frame);
            return;
        }
        inner.bitmap[word] &= !(1 << bit);
        inner.free_frames += 1;
    }

    pub fn contains(&self, frame: PhysFrame) -> bool {
        self.frame_index(frame).is_some()
    }

    /// Kernel-visible address of the frame's contents.
    pub fn frame_ptr(&self, frame: PhysFrame) -> *mut u8 {
        debug_assert!(self.contains(frame));
        (frame.start_address().as_u64() + self.phys_offset) as *mut u8
    }

    /// # Safety
    ///
    /// The caller must own `frame` and ensure no writer aliases it.
    pub unsafe fn frame_bytes(&self, frame: PhysFrame) -> &[u8] {
        core::slice::from_raw_parts(self.frame_ptr(frame), PAGE_SIZE)
    }

    /// # Safety
    ///
    /// The caller must exclusively own `frame` for the borrow's duration.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_bytes_mut(&self, frame: PhysFrame) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_SIZE)
    }

    /// Returns `(total, free, used)` frame counts.
    pub fn stats(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (
            self.frame_count,
            inner.free_frames,
            self.frame_count - inner.free_frames,
        )
    }
}

unsafe impl FrameAllocator<Size4KiB> for &FramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.alloc(AllocFlags::empty())
    }
}

impl FrameDeallocator<Size4KiB> for &FramePool {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        self.free(frame);
    }
}
