// Copyright (c) 2025 Syswonder
// hvisor is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//     http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR
// FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.
//
// Syswonder Website:
//      https://www.syswonder.org
//
// Authors:
//
//! Physical memory allocation.

use bitmap_allocator::BitAlloc;
use spin::Mutex;

use super::addr::{align_down, is_aligned, PhysAddr};
use super::PAGE_SIZE;
use crate::error::HvResult;

// Support max 1M * 4096 = 4GB memory.
type FrameAlloc = bitmap_allocator::BitAlloc1M;

/// The bitmap aligns frame indices, so the pool base is aligned for the
/// largest contiguous request it serves.
pub const MAX_ALIGN_LOG2: usize = 9;
const POOL_ALIGN: usize = PAGE_SIZE << MAX_ALIGN_LOG2;

struct FrameAllocator {
    base: PhysAddr,
    nr_frames: usize,
    nr_free: usize,
    inner: FrameAlloc,
}

/// A safe wrapper for physical frame allocation.
#[derive(Debug)]
pub struct Frame {
    start_paddr: PhysAddr,
    frame_count: usize,
}

static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::empty());

impl FrameAllocator {
    const fn empty() -> Self {
        Self {
            base: 0,
            nr_frames: 0,
            nr_free: 0,
            inner: FrameAlloc::DEFAULT,
        }
    }

    fn init(&mut self, base: PhysAddr, size: usize) {
        let end = align_down(base + size);
        self.base = (base + POOL_ALIGN - 1) & !(POOL_ALIGN - 1);
        self.nr_frames = (end.saturating_sub(self.base) / PAGE_SIZE).min(FrameAlloc::CAP);
        self.nr_free = self.nr_frames;
        self.inner = FrameAlloc::DEFAULT;
        self.inner.insert(0..self.nr_frames);
    }

    /// Frame index of `paddr`, if it lies inside the pool.
    fn frame_idx(&self, paddr: PhysAddr) -> Option<usize> {
        if paddr < self.base || !is_aligned(paddr) {
            return None;
        }
        let idx = (paddr - self.base) / PAGE_SIZE;
        (idx < self.nr_frames).then_some(idx)
    }

    /// # Safety
    ///
    /// This function is unsafe because you need to deallocate manually.
    unsafe fn alloc(&mut self) -> Option<PhysAddr> {
        let ret = self.inner.alloc().map(|idx| {
            self.nr_free -= 1;
            idx * PAGE_SIZE + self.base
        });
        trace!("Allocate frame: {:x?}", ret);
        ret
    }

    /// # Safety
    ///
    /// This function is unsafe because your need to deallocate manually.
    unsafe fn alloc_contiguous(
        &mut self,
        frame_count: usize,
        align_log2: usize,
    ) -> Option<PhysAddr> {
        if frame_count == 0 || align_log2 > MAX_ALIGN_LOG2 {
            warn!(
                "unsupported contiguous allocation: {} frames, align {}",
                frame_count,
                1usize << align_log2
            );
            return None;
        }
        let ret = self
            .inner
            .alloc_contiguous(None, frame_count, align_log2)
            .map(|idx| {
                self.nr_free -= frame_count;
                idx * PAGE_SIZE + self.base
            });
        trace!(
            "Allocate {} frames with alignment {}: {:x?}",
            frame_count,
            1usize << align_log2,
            ret
        );
        ret
    }

    /// # Safety
    ///
    /// This function is unsafe because the frames must have been allocated.
    unsafe fn dealloc_contiguous(&mut self, target: PhysAddr, frame_count: usize) {
        trace!("Deallocate {} frames: {:x}", frame_count, target);
        let Some(start_idx) = self.frame_idx(target) else {
            warn!("free of frame {:#x} outside the pool", target);
            return;
        };
        let end_idx = (start_idx + frame_count).min(self.nr_frames);
        for i in start_idx..end_idx {
            if self.inner.test(i) {
                warn!("double free of frame {:#x}", self.base + i * PAGE_SIZE);
                continue;
            }
            self.inner.dealloc(i);
            self.nr_free += 1;
        }
    }
}

impl Frame {
    /// Allocate one physical frame.
    pub fn new() -> HvResult<Self> {
        unsafe {
            FRAME_ALLOCATOR
                .lock()
                .alloc()
                .map(|start_paddr| Self {
                    start_paddr,
                    frame_count: 1,
                })
                .ok_or(hv_err!(ENOMEM))
        }
    }

    /// Allocate one physical frame and fill with zero.
    pub fn new_zero() -> HvResult<Self> {
        let mut f = Self::new()?;
        f.clear();
        Ok(f)
    }

    /// Allocate contiguous physical frames aligned to `PAGE_SIZE << align_log2`.
    pub fn new_contiguous(frame_count: usize, align_log2: usize) -> HvResult<Self> {
        unsafe {
            FRAME_ALLOCATOR
                .lock()
                .alloc_contiguous(frame_count, align_log2)
                .map(|start_paddr| Self {
                    start_paddr,
                    frame_count,
                })
                .ok_or(hv_err!(ENOMEM))
        }
    }

    /// Constructs a frame from a raw physical address without automatically calling the destructor.
    ///
    /// # Safety
    ///
    /// This function is unsafe because the user must ensure that this is an available physical
    /// frame.
    pub unsafe fn from_paddr(start_paddr: PhysAddr) -> Self {
        debug_assert!(is_aligned(start_paddr));
        Self {
            start_paddr,
            frame_count: 0,
        }
    }

    /// Give up ownership without freeing; the caller is now responsible for
    /// returning the frames through [`Frame::dealloc_raw`].
    pub fn into_raw(self) -> (PhysAddr, usize) {
        let ret = (self.start_paddr, self.frame_count);
        core::mem::forget(self);
        ret
    }

    /// # Safety
    ///
    /// `paddr` and `frame_count` must come from [`Frame::into_raw`].
    pub unsafe fn dealloc_raw(paddr: PhysAddr, frame_count: usize) {
        drop(Self {
            start_paddr: paddr,
            frame_count,
        })
    }

    /// Get the start physical address of this frame.
    pub fn start_paddr(&self) -> PhysAddr {
        self.start_paddr
    }

    /// Get the total size (in bytes) of this frame.
    pub fn size(&self) -> usize {
        self.frame_count.max(1) * PAGE_SIZE
    }

    /// convert to raw a pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.start_paddr as *const u8
    }

    /// convert to a mutable raw pointer.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.start_paddr as *mut u8
    }

    /// Fill `self` with `byte`.
    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size()) }
    }

    /// Fill `self` with zero.
    pub fn clear(&mut self) {
        self.fill(0)
    }

    /// Forms a slice that can read data.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.as_ptr(), self.size()) }
    }

    /// Forms a mutable slice that can write data.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        unsafe {
            match self.frame_count {
                0 => {} // Do not deallocate when use Frame::from_paddr()
                n => FRAME_ALLOCATOR
                    .lock()
                    .dealloc_contiguous(self.start_paddr, n),
            }
        }
    }
}

/// Number of free frames left in the pool.
pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().nr_free
}

/// Initialize the physical frame allocator over `[base, base + size)`.
pub fn init(base: PhysAddr, size: usize) {
    FRAME_ALLOCATOR.lock().init(base, size);
    info!(
        "Frame allocator initialization finished: {:#x?}",
        base..base + size
    );
}
