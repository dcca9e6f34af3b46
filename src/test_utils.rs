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
//! Helpers shared by the unit tests. Host heap memory stands in for physical
//! memory, which works because the hypervisor addresses memory 1:1.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use spin::Once;

use crate::arch::paging::{IotlbGather, TableAllocator, TlbFlushOps};
use crate::error::HvResult;
use crate::memory::addr::phys_to_pfn;
use crate::memory::{frame, HostMmu, HypMemcache, PhysAddr, PAGE_SIZE};

fn table_layout(size: usize) -> Layout {
    let size = size.max(8).next_power_of_two();
    // Layout::from_size_align only fails for non power-of-two alignments.
    Layout::from_size_align(size, size.max(64)).unwrap()
}

/// Table allocator over the host heap that keeps track of live tables.
pub struct TestTableAllocator {
    live: Mutex<BTreeMap<PhysAddr, usize>>,
    /// Allocations left before running out of memory, `usize::MAX` for unlimited.
    budget: AtomicUsize,
}

impl TestTableAllocator {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(BTreeMap::new()),
            budget: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn with_budget(nr: usize) -> Self {
        let alloc = Self::new();
        alloc.budget.store(nr, Ordering::Relaxed);
        alloc
    }

    pub fn live_tables(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl TableAllocator for TestTableAllocator {
    fn alloc_table(&self, size: usize) -> HvResult<PhysAddr> {
        let left = self.budget.load(Ordering::Relaxed);
        if left == 0 {
            return hv_result_err!(ENOMEM);
        }
        if left != usize::MAX {
            self.budget.store(left - 1, Ordering::Relaxed);
        }
        let ptr = unsafe { alloc_zeroed(table_layout(size)) };
        if ptr.is_null() {
            return hv_result_err!(ENOMEM);
        }
        self.live.lock().unwrap().insert(ptr as PhysAddr, size);
        Ok(ptr as PhysAddr)
    }

    fn free_table(&self, paddr: PhysAddr, size: usize) {
        let recorded = self.live.lock().unwrap().remove(&paddr);
        assert_eq!(recorded, Some(size), "bad table free at {:#x}", paddr);
        unsafe { dealloc(paddr as *mut u8, table_layout(size)) };
    }
}

impl Drop for TestTableAllocator {
    fn drop(&mut self) {
        for (paddr, size) in core::mem::take(&mut *self.live.lock().unwrap()) {
            unsafe { dealloc(paddr as *mut u8, table_layout(size)) };
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbOp {
    FlushWalk { iova: usize, size: usize },
    AddPage { iova: usize, size: usize },
}

/// Records TLB maintenance and accumulates pages in the gather.
#[derive(Default)]
pub struct RecordingTlb {
    pub ops: Mutex<Vec<TlbOp>>,
}

impl RecordingTlb {
    pub fn take(&self) -> Vec<TlbOp> {
        core::mem::take(&mut *self.ops.lock().unwrap())
    }
}

impl TlbFlushOps for RecordingTlb {
    fn tlb_flush_walk(&self, iova: usize, size: usize, _granule: usize) {
        self.ops.lock().unwrap().push(TlbOp::FlushWalk { iova, size });
    }

    fn tlb_add_page(&self, gather: Option<&mut IotlbGather>, iova: usize, granule: usize) {
        self.ops
            .lock()
            .unwrap()
            .push(TlbOp::AddPage { iova, size: granule });
        if let Some(gather) = gather {
            gather.pgsize = granule;
            gather.add_range(iova, granule);
        }
    }
}

/// Page aligned, zeroed memory that lives until the test process exits.
pub fn leak_pages(nr: usize) -> PhysAddr {
    let layout = Layout::from_size_align(nr * PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as PhysAddr
}

const TEST_FRAME_POOL_PAGES: usize = 8192;

/// Back the global frame allocator with leaked heap memory, once per process.
pub fn init_frame_pool() {
    static POOL: Once<()> = Once::new();
    POOL.call_once(|| {
        // Over-allocate so the pool base can be aligned for contiguous requests.
        let slack = 1 << frame::MAX_ALIGN_LOG2;
        let base = leak_pages(TEST_FRAME_POOL_PAGES + slack);
        frame::init(base, (TEST_FRAME_POOL_PAGES + slack) * PAGE_SIZE);
    });
}

const SZ_2M: usize = 0x20_0000;

/// A 2M aligned arena standing in for host RAM in control plane tests.
pub struct TestRam {
    base: PhysAddr,
    size: usize,
    next: AtomicUsize,
}

impl TestRam {
    pub fn new(nr_pages: usize) -> Self {
        let size = nr_pages * PAGE_SIZE;
        let raw = leak_pages(nr_pages + SZ_2M / PAGE_SIZE);
        let base = (raw + SZ_2M - 1) & !(SZ_2M - 1);
        Self {
            base,
            size,
            next: AtomicUsize::new(base),
        }
    }

    pub fn range(&self) -> Range<PhysAddr> {
        self.base..self.base + self.size
    }

    /// Hand out `nr` fresh pages.
    pub fn pages(&self, nr: usize) -> PhysAddr {
        let pa = self.next.fetch_add(nr * PAGE_SIZE, Ordering::Relaxed);
        assert!(pa + nr * PAGE_SIZE <= self.base + self.size, "test RAM exhausted");
        pa
    }

    /// Place `val` in fresh pages and share them with the hypervisor, the
    /// way the host publishes its VM and vCPU structures.
    pub fn share<T>(&self, host_mmu: &HostMmu, val: T) -> PhysAddr {
        let nr = core::mem::size_of::<T>().div_ceil(PAGE_SIZE).max(1);
        let pa = self.pages(nr);
        unsafe { (pa as *mut T).write(val) };
        for i in 0..nr {
            host_mmu.host_share_hyp(phys_to_pfn(pa) + i).unwrap();
        }
        pa
    }

    /// Push `nr` host pages onto `mc`.
    pub fn fill_memcache(&self, mc: &mut HypMemcache, nr: usize) {
        for _ in 0..nr {
            let pa = self.pages(1);
            unsafe { mc.push(pa) };
        }
    }
}
