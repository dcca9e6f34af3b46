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
//! LPAE long-descriptor page tables.
//!
//! One table format serves both the SMMU domains and the guest stage-2.
//! Writers are serialized by the owner of the table. Readers may walk
//! concurrently: every entry is read once and tables are published with a
//! compare-and-swap after their contents are visible.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::cpu::{dma_wmb, flush_dcache_to_poc, wmb};
use super::s2pt::*;
use crate::error::{HvError, HvResult};
use crate::memory::{Frame, MemFlags, PhysAddr, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    NoMemory,
    NotMapped,
    AlreadyMapped,
    MappedToHugePage,
    InvalidArgument,
    OutOfRange,
    TooBig,
}

pub type PagingResult<T = ()> = Result<T, PagingError>;

impl From<PagingError> for HvError {
    fn from(err: PagingError) -> Self {
        match err {
            PagingError::NoMemory => hv_err!(ENOMEM),
            PagingError::AlreadyMapped => hv_err!(EEXIST),
            PagingError::MappedToHugePage => hv_err!(EBUSY),
            PagingError::InvalidArgument => hv_err!(EINVAL),
            PagingError::OutOfRange => hv_err!(ERANGE),
            PagingError::TooBig => hv_err!(E2BIG),
            PagingError::NotMapped => hv_err!(EFAULT),
        }
    }
}

#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageSize {
    Size4K = 0x1000,
    Size16K = 0x4000,
    Size64K = 0x1_0000,
    Size2M = 0x20_0000,
    Size32M = 0x200_0000,
    Size512M = 0x2000_0000,
    Size1G = 0x4000_0000,
}

impl PageSize {
    pub const fn is_aligned(self, addr: usize) -> bool {
        self.page_offset(addr) == 0
    }

    pub const fn align_down(self, addr: usize) -> usize {
        addr & !(self as usize - 1)
    }

    pub const fn page_offset(self, addr: usize) -> usize {
        addr & (self as usize - 1)
    }

    pub const fn is_huge(self) -> bool {
        matches!(self, Self::Size1G | Self::Size512M | Self::Size32M | Self::Size2M)
    }
}

const SZ_4K: usize = PageSize::Size4K as usize;
const SZ_16K: usize = PageSize::Size16K as usize;
const SZ_64K: usize = PageSize::Size64K as usize;
const SZ_4T: usize = 1 << 42;

const MAX_ADDR_BITS: usize = 52;
const S2_MAX_CONCAT_PAGES: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoPgtableFmt {
    Lpae64S1,
    Lpae64S2,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IoPgtableQuirks: u32 {
        /// Set NS and NSTABLE in every descriptor.
        const ARM_NS = 1 << 0;
        /// The table translates the upper half of the input range.
        const ARM_TTBR1 = 1 << 5;
        /// Outer write-back for non-coherent walks.
        const ARM_OUTER_WBWA = 1 << 6;
    }
}

/// Translation control fields derived from the table geometry. For stage-1
/// these go to the CD TCR, for stage-2 to the STE VTCR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LpaeTcr {
    pub tsz: u64,
    pub sl: u64,
    pub irgn: u64,
    pub orgn: u64,
    pub sh: u64,
    pub tg: u64,
    pub ps: u64,
}

#[derive(Debug, Clone)]
pub struct IoPgtableCfg {
    pub fmt: IoPgtableFmt,
    pub quirks: IoPgtableQuirks,
    pub pgsize_bitmap: usize,
    pub ias: usize,
    pub oas: usize,
    pub coherent_walk: bool,
    pub tcr: LpaeTcr,
    pub mair: u64,
    /// Root of the table, TTBR for stage-1 and VTTBR for stage-2.
    pub ttbr: PhysAddr,
}

impl IoPgtableCfg {
    pub fn new(
        fmt: IoPgtableFmt,
        pgsize_bitmap: usize,
        ias: usize,
        oas: usize,
        coherent_walk: bool,
    ) -> Self {
        Self {
            fmt,
            quirks: IoPgtableQuirks::empty(),
            pgsize_bitmap,
            ias,
            oas,
            coherent_walk,
            tcr: LpaeTcr::default(),
            mair: 0,
            ttbr: 0,
        }
    }

    /// Restrict the supported page sizes to the translation regime of one
    /// granule, preferring the CPU page size.
    fn restrict_pgsizes(&mut self) {
        let bitmap = self.pgsize_bitmap;
        let page_mask = !(PAGE_SIZE - 1);
        let granule = if bitmap & PAGE_SIZE != 0 {
            PAGE_SIZE
        } else if bitmap & !page_mask != 0 {
            1 << (usize::BITS - 1 - (bitmap & !page_mask).leading_zeros())
        } else if bitmap & page_mask != 0 {
            1 << (bitmap & page_mask).trailing_zeros()
        } else {
            0
        };

        let mut max_addr_bits = 48;
        let page_sizes = match granule {
            SZ_4K => SZ_4K | PageSize::Size2M as usize | PageSize::Size1G as usize,
            SZ_16K => SZ_16K | PageSize::Size32M as usize,
            SZ_64K => {
                max_addr_bits = 52;
                let mut sizes = SZ_64K | PageSize::Size512M as usize;
                if self.oas > 48 {
                    sizes |= SZ_4T;
                }
                sizes
            }
            _ => 0,
        };

        self.pgsize_bitmap &= page_sizes;
        self.ias = self.ias.min(max_addr_bits);
        self.oas = self.oas.min(max_addr_bits);
    }
}

/// Source of zeroed, naturally aligned table memory.
pub trait TableAllocator {
    fn alloc_table(&self, size: usize) -> HvResult<PhysAddr>;
    fn free_table(&self, paddr: PhysAddr, size: usize);
}

/// Table memory from the hypervisor frame pool.
pub struct FrameTableAllocator;

impl TableAllocator for FrameTableAllocator {
    fn alloc_table(&self, size: usize) -> HvResult<PhysAddr> {
        let nr = size.div_ceil(PAGE_SIZE).next_power_of_two();
        let mut frame = Frame::new_contiguous(nr, nr.trailing_zeros() as usize)?;
        frame.clear();
        Ok(frame.into_raw().0)
    }

    fn free_table(&self, paddr: PhysAddr, size: usize) {
        let nr = size.div_ceil(PAGE_SIZE).next_power_of_two();
        unsafe { Frame::dealloc_raw(paddr, nr) };
    }
}

/// Queued TLB invalidations. `end` is inclusive, `end == 0` means empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IotlbGather {
    pub start: usize,
    pub end: usize,
    pub pgsize: usize,
}

impl IotlbGather {
    pub const fn new() -> Self {
        Self {
            start: usize::MAX,
            end: 0,
            pgsize: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    pub fn add_range(&mut self, iova: usize, size: usize) {
        let end = iova + size - 1;
        if self.start > iova {
            self.start = iova;
        }
        if self.end < end {
            self.end = end;
        }
    }

    /// Whether adding `[iova, iova + size)` would leave a hole in the range.
    pub fn is_disjoint(&self, iova: usize, size: usize) -> bool {
        let end = iova + size - 1;
        self.end != 0 && (end + 1 < self.start || iova > self.end + 1)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// TLB maintenance requested by the table walkers.
pub trait TlbFlushOps {
    /// A table was removed: drop any walk cache for the range.
    fn tlb_flush_walk(&self, iova: usize, size: usize, granule: usize);
    /// A leaf was removed.
    fn tlb_add_page(&self, gather: Option<&mut IotlbGather>, iova: usize, granule: usize);
}

#[derive(Clone, Copy)]
pub struct PgtableOps<'a> {
    pub alloc: &'a dyn TableAllocator,
    pub tlb: &'a dyn TlbFlushOps,
}

struct UnmapCtx<'a, 'b, 'w> {
    ops: PgtableOps<'a>,
    gather: Option<&'b mut IotlbGather>,
    walker: Option<&'b mut (dyn FnMut(PhysAddr, usize) + 'w)>,
}

impl UnmapCtx<'_, '_, '_> {
    fn add_page(&mut self, iova: usize, size: usize) {
        self.ops.tlb.tlb_add_page(self.gather.as_deref_mut(), iova, size);
    }

    fn walk(&mut self, paddr: PhysAddr, size: usize) {
        if let Some(walker) = self.walker.as_deref_mut() {
            walker(paddr, size);
        }
    }
}

fn entry<'a>(table: PhysAddr, idx: usize) -> &'a AtomicU64 {
    unsafe { &*((table as *const AtomicU64).add(idx)) }
}

fn entry_paddr(table: PhysAddr, idx: usize) -> PhysAddr {
    table + idx * core::mem::size_of::<Iopte>()
}

pub struct LpaePgtable {
    cfg: IoPgtableCfg,
    pgd: PhysAddr,
    pgd_bits: usize,
    start_level: usize,
    bits_per_level: usize,
    idmapped: bool,
}

impl LpaePgtable {
    /// Validate `cfg`, compute the geometry and the TCR/VTCR fields.
    fn configure(mut cfg: IoPgtableCfg) -> PagingResult<Self> {
        match cfg.fmt {
            IoPgtableFmt::Lpae64S1 => {
                let allowed = IoPgtableQuirks::ARM_NS
                    | IoPgtableQuirks::ARM_TTBR1
                    | IoPgtableQuirks::ARM_OUTER_WBWA;
                if !allowed.contains(cfg.quirks) {
                    return Err(PagingError::InvalidArgument);
                }
            }
            // The NS quirk doesn't apply at stage 2.
            IoPgtableFmt::Lpae64S2 if !cfg.quirks.is_empty() => {
                return Err(PagingError::InvalidArgument)
            }
            IoPgtableFmt::Lpae64S2 => {}
        }

        cfg.restrict_pgsizes();
        if cfg.pgsize_bitmap & (SZ_4K | SZ_16K | SZ_64K) == 0 {
            return Err(PagingError::InvalidArgument);
        }
        if cfg.ias > MAX_ADDR_BITS || cfg.oas > MAX_ADDR_BITS {
            return Err(PagingError::TooBig);
        }

        let pg_shift = cfg.pgsize_bitmap.trailing_zeros() as usize;
        let bits_per_level = pg_shift - 3;
        let va_bits = cfg.ias - pg_shift;
        let levels = va_bits.div_ceil(bits_per_level);
        let mut pgt = Self {
            pgd: 0,
            pgd_bits: va_bits - bits_per_level * (levels - 1),
            start_level: MAX_LEVELS - levels,
            bits_per_level,
            idmapped: false,
            cfg,
        };

        let ps = oas_to_ps(pgt.cfg.oas).ok_or(PagingError::InvalidArgument)?;
        match pgt.cfg.fmt {
            IoPgtableFmt::Lpae64S1 => pgt.configure_s1(ps)?,
            IoPgtableFmt::Lpae64S2 => pgt.configure_s2(ps),
        }
        Ok(pgt)
    }

    fn configure_s1(&mut self, ps: u64) -> PagingResult {
        let outer_wbwa = self.cfg.quirks.contains(IoPgtableQuirks::ARM_OUTER_WBWA);
        let tcr = &mut self.cfg.tcr;
        if self.cfg.coherent_walk {
            if outer_wbwa {
                return Err(PagingError::InvalidArgument);
            }
            tcr.sh = TCR_SH_IS;
            tcr.irgn = TCR_RGN_WBWA;
            tcr.orgn = TCR_RGN_WBWA;
        } else {
            tcr.sh = TCR_SH_OS;
            tcr.irgn = TCR_RGN_NC;
            tcr.orgn = if outer_wbwa { TCR_RGN_WBWA } else { TCR_RGN_NC };
        }

        let tg1 = self.cfg.quirks.contains(IoPgtableQuirks::ARM_TTBR1);
        let granule = 8 << self.bits_per_level;
        tcr.tg = match (granule, tg1) {
            (SZ_4K, false) => TCR_TG0_4K,
            (SZ_4K, true) => TCR_TG1_4K,
            (SZ_16K, false) => TCR_TG0_16K,
            (SZ_16K, true) => TCR_TG1_16K,
            (_, false) => TCR_TG0_64K,
            (_, true) => TCR_TG1_64K,
        };
        tcr.ps = ps;
        tcr.tsz = 64 - self.cfg.ias as u64;
        self.cfg.mair = MAIR_DEFAULT;
        Ok(())
    }

    fn configure_s2(&mut self, ps: u64) {
        // Concatenate PGDs at level 1 if possible to save a level of walk.
        if self.start_level == 0 {
            let pgd_pages = (8 << self.pgd_bits) / core::mem::size_of::<Iopte>();
            if pgd_pages <= S2_MAX_CONCAT_PAGES {
                self.pgd_bits += self.bits_per_level;
                self.start_level += 1;
            }
        }

        let granule = self.granule();
        let vtcr = &mut self.cfg.tcr;
        if self.cfg.coherent_walk {
            vtcr.sh = TCR_SH_IS;
            vtcr.irgn = TCR_RGN_WBWA;
            vtcr.orgn = TCR_RGN_WBWA;
        } else {
            vtcr.sh = TCR_SH_OS;
            vtcr.irgn = TCR_RGN_NC;
            vtcr.orgn = TCR_RGN_NC;
        }

        let mut sl = self.start_level as u64;
        vtcr.tg = match granule {
            SZ_4K => {
                // SL0 format is different for 4K granule size.
                sl += 1;
                TCR_TG0_4K
            }
            SZ_16K => TCR_TG0_16K,
            _ => TCR_TG0_64K,
        };
        vtcr.ps = ps;
        vtcr.tsz = 64 - self.cfg.ias as u64;
        vtcr.sl = !sl & VTCR_SL0_MASK;
    }

    /// Allocate a table described by `cfg`.
    pub fn new(cfg: IoPgtableCfg, alloc: &dyn TableAllocator) -> PagingResult<Self> {
        let mut pgt = Self::configure(cfg)?;
        pgt.pgd = alloc
            .alloc_table(pgt.pgd_size())
            .map_err(|_| PagingError::NoMemory)?;
        // Ensure the empty pgd is visible before the TTBR can be written.
        wmb();
        pgt.cfg.ttbr = pgt.pgd;
        Ok(pgt)
    }

    /// Build a table on top of a zeroed root of `avail` bytes provided by the caller.
    pub fn new_with_pgd(cfg: IoPgtableCfg, pgd: PhysAddr, avail: usize) -> PagingResult<Self> {
        let mut pgt = Self::configure(cfg)?;
        if pgt.pgd_size() > avail || pgd & (pgt.pgd_size().min(PAGE_SIZE) - 1) != 0 {
            return Err(PagingError::InvalidArgument);
        }
        pgt.pgd = pgd;
        pgt.cfg.ttbr = pgd;
        Ok(pgt)
    }

    /// Size of the root table `cfg` would need.
    pub fn pgd_size_for(cfg: IoPgtableCfg) -> PagingResult<usize> {
        Self::configure(cfg).map(|pgt| pgt.pgd_size())
    }

    /// Tolerate remapping of existing identical leaves and unmapping of holes.
    pub fn set_idmapped(&mut self) {
        self.idmapped = true;
    }

    pub fn cfg(&self) -> &IoPgtableCfg {
        &self.cfg
    }

    pub fn root_paddr(&self) -> PhysAddr {
        self.pgd
    }

    pub fn start_level(&self) -> usize {
        self.start_level
    }

    pub fn granule(&self) -> usize {
        8 << self.bits_per_level
    }

    pub fn pgd_size(&self) -> usize {
        8 << self.pgd_bits
    }

    fn ptes_per_table(&self) -> usize {
        self.granule() >> 3
    }

    fn entries_at(&self, lvl: usize) -> usize {
        if lvl == self.start_level {
            1 << self.pgd_bits
        } else {
            self.ptes_per_table()
        }
    }

    fn lvl_shift(&self, lvl: usize) -> usize {
        (MAX_LEVELS - lvl) * self.bits_per_level + 3
    }

    pub fn block_size(&self, lvl: usize) -> usize {
        1 << self.lvl_shift(lvl)
    }

    fn lvl_idx(&self, iova: usize, lvl: usize) -> usize {
        let pgd_idx_bits = if lvl == self.start_level {
            self.pgd_bits - self.bits_per_level
        } else {
            0
        };
        (iova >> self.lvl_shift(lvl)) & ((1 << (self.bits_per_level + pgd_idx_bits)) - 1)
    }

    fn paddr_to_iopte(&self, paddr: PhysAddr) -> Iopte {
        let pte = paddr as Iopte;
        // Of the bits which overlap, either 51:48 or 15:12 are always RES0.
        (pte | (pte >> (48 - 12))) & PTE_ADDR_MASK
    }

    pub fn iopte_to_paddr(&self, pte: Iopte) -> PhysAddr {
        let paddr = pte & PTE_ADDR_MASK;
        if self.granule() < SZ_64K {
            return paddr as PhysAddr;
        }
        // Rotate the packed high-order bits back to the top.
        ((paddr | (paddr << (48 - 12))) & (PTE_ADDR_MASK << 4)) as PhysAddr
    }

    fn iova_in_range(&self, iova: usize) -> bool {
        let mut iaext = (iova as i64) >> self.cfg.ias;
        if self.cfg.quirks.contains(IoPgtableQuirks::ARM_TTBR1) {
            iaext = !iaext;
        }
        iaext == 0
    }

    fn sync_pte(&self, table: PhysAddr, idx: usize, num: usize) {
        flush_dcache_to_poc(entry_paddr(table, idx), num * core::mem::size_of::<Iopte>());
    }

    fn clear_pte(&self, table: PhysAddr, idx: usize) {
        entry(table, idx).store(0, Ordering::Release);
        if !self.cfg.coherent_walk {
            self.sync_pte(table, idx, 1);
        }
    }

    fn write_leaves(
        &self,
        paddr: PhysAddr,
        prot: Iopte,
        lvl: usize,
        num: usize,
        table: PhysAddr,
        idx: usize,
    ) {
        let sz = self.block_size(lvl);
        let ty = if lvl == MAX_LEVELS - 1 {
            PTE_TYPE_PAGE
        } else {
            PTE_TYPE_BLOCK
        };
        for i in 0..num {
            let pte = prot | ty | self.paddr_to_iopte(paddr + i * sz);
            entry(table, idx + i).store(pte, Ordering::Release);
        }
        if !self.cfg.coherent_walk {
            self.sync_pte(table, idx, num);
        }
    }

    fn leaf_value(&self, paddr: PhysAddr, prot: Iopte, lvl: usize) -> Iopte {
        let ty = if lvl == MAX_LEVELS - 1 {
            PTE_TYPE_PAGE
        } else {
            PTE_TYPE_BLOCK
        };
        prot | ty | self.paddr_to_iopte(paddr)
    }

    #[allow(clippy::too_many_arguments)]
    fn init_pte(
        &self,
        iova: usize,
        paddr: PhysAddr,
        prot: Iopte,
        lvl: usize,
        num: usize,
        table: PhysAddr,
        idx: usize,
        ops: PgtableOps,
    ) -> PagingResult {
        let sz = self.block_size(lvl);
        for i in 0..num {
            let old = entry(table, idx + i).load(Ordering::Acquire);
            if !iopte_valid(old) {
                continue;
            }
            if iopte_leaf(old, lvl) {
                // Only the identity domain sees the same range mapped twice.
                if self.idmapped && old == self.leaf_value(paddr + i * sz, prot, lvl) {
                    continue;
                }
                return Err(self.mapping_exists(iova + i * sz));
            }
            if iopte_table(old, lvl) {
                // Unmap and free the old table before overwriting it with a block.
                let mut ctx = UnmapCtx {
                    ops,
                    gather: None,
                    walker: None,
                };
                if self.__unmap(&mut ctx, iova + i * sz, sz, 1, lvl, table) != sz {
                    warn!("lpae: failed to replace table at {:#x}", iova + i * sz);
                    return Err(PagingError::InvalidArgument);
                }
            }
        }
        self.write_leaves(paddr, prot, lvl, num, table, idx);
        Ok(())
    }

    fn mapping_exists(&self, iova: usize) -> PagingError {
        debug!("lpae: iova {:#x} already mapped", iova);
        PagingError::AlreadyMapped
    }

    fn mapping_missing(&self, iova: usize) {
        if !self.idmapped {
            warn!("lpae: unmap of unmapped iova {:#x}", iova);
        }
    }

    /// Publish `new_table` in place of `curr`. Returns the value found in the
    /// slot, which equals `curr` when the install succeeded.
    fn install_table(&self, new_table: PhysAddr, table: PhysAddr, idx: usize, curr: Iopte) -> Iopte {
        let mut new = self.paddr_to_iopte(new_table) | PTE_TYPE_TABLE;
        if self.cfg.quirks.contains(IoPgtableQuirks::ARM_NS) {
            new |= DescriptorAttr::NSTABLE.bits();
        }

        // Ensure the table itself is visible before its PTE can be.
        dma_wmb();

        let slot = entry(table, idx);
        let old = match slot.compare_exchange(curr, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(v) | Err(v) => v,
        };
        if self.cfg.coherent_walk || old & DescriptorAttr::SW_SYNC.bits() != 0 {
            return old;
        }

        // Even if it's not ours, there's no point waiting; just kick it.
        self.sync_pte(table, idx, 1);
        if old == curr {
            slot.store(new | DescriptorAttr::SW_SYNC.bits(), Ordering::Release);
        }
        old
    }

    #[allow(clippy::too_many_arguments)]
    fn __map(
        &self,
        iova: usize,
        paddr: PhysAddr,
        size: usize,
        pgcount: usize,
        prot: Iopte,
        lvl: usize,
        table: PhysAddr,
        ops: PgtableOps,
        mapped: &mut usize,
    ) -> PagingResult {
        let idx = self.lvl_idx(iova, lvl);

        // If we can install a leaf entry at this level, then do so.
        if size == self.block_size(lvl) {
            let num = pgcount.min(self.entries_at(lvl) - idx);
            self.init_pte(iova, paddr, prot, lvl, num, table, idx, ops)?;
            *mapped += num * size;
            return Ok(());
        }

        // We can't allocate tables at the final level.
        if lvl >= MAX_LEVELS - 1 {
            warn!("lpae: no level left for size {:#x}", size);
            return Err(PagingError::InvalidArgument);
        }

        let mut pte = entry(table, idx).load(Ordering::Acquire);
        if !iopte_valid(pte) {
            let granule = self.granule();
            let new_table = ops
                .alloc
                .alloc_table(granule)
                .map_err(|_| PagingError::NoMemory)?;
            let old = self.install_table(new_table, table, idx, pte);
            if old != pte {
                ops.alloc.free_table(new_table, granule);
                pte = old;
            } else {
                pte = self.paddr_to_iopte(new_table) | PTE_TYPE_TABLE;
            }
        } else if !self.cfg.coherent_walk && pte & DescriptorAttr::SW_SYNC.bits() == 0 {
            self.sync_pte(table, idx, 1);
        }

        if !iopte_table(pte, lvl) {
            return Err(self.mapping_exists(iova));
        }

        // Rinse, repeat.
        let next = self.iopte_to_paddr(pte);
        self.__map(iova, paddr, size, pgcount, prot, lvl + 1, next, ops, mapped)
    }

    /// Map `pgcount` pages of `pgsize` at `iova`, stopping at the end of the
    /// last-level table. `mapped` accumulates the bytes actually installed.
    #[allow(clippy::too_many_arguments)]
    pub fn map_pages(
        &self,
        iova: usize,
        paddr: PhysAddr,
        pgsize: usize,
        pgcount: usize,
        prot: MemFlags,
        ops: PgtableOps,
        mapped: &mut usize,
    ) -> PagingResult {
        if pgsize == 0 || pgsize & self.cfg.pgsize_bitmap != pgsize {
            warn!("lpae: unsupported page size {:#x}", pgsize);
            return Err(PagingError::InvalidArgument);
        }
        if !self.iova_in_range(iova) || (paddr as u64) >> self.cfg.oas != 0 {
            warn!("lpae: {:#x} -> {:#x} out of range", iova, paddr);
            return Err(PagingError::OutOfRange);
        }

        // If no access, then nothing to do.
        if !prot.intersects(MemFlags::RW) {
            return Ok(());
        }

        let ns = self.cfg.quirks.contains(IoPgtableQuirks::ARM_NS);
        let prot = prot_to_pte(self.cfg.fmt, ns, prot);
        let ret = self.__map(
            iova,
            paddr,
            pgsize,
            pgcount,
            prot,
            self.start_level,
            self.pgd,
            ops,
            mapped,
        );
        // Synchronise all PTE updates for the new mapping before there's
        // a chance for anything to kick off a table walk for the new iova.
        wmb();
        ret
    }

    /// Largest supported page size for mapping `[iova, iova + size)` to
    /// `paddr`, and how many of them fit before a larger page could be used.
    pub fn pgsize_for(&self, iova: usize, paddr: PhysAddr, size: usize) -> (usize, usize) {
        let addr_merge = iova | paddr;
        let mut pgsizes = self.cfg.pgsize_bitmap & ((1usize << (usize::BITS - 1 - size.leading_zeros())) << 1).wrapping_sub(1);
        if addr_merge != 0 {
            pgsizes &= (1usize << addr_merge.trailing_zeros() << 1).wrapping_sub(1);
        }
        if pgsizes == 0 {
            return (0, 0);
        }
        let pgsize = 1usize << (usize::BITS - 1 - pgsizes.leading_zeros());
        let mut count = size / pgsize;

        // Stop at the next boundary where a larger page size becomes possible.
        let larger = self.cfg.pgsize_bitmap & !((pgsize << 1) - 1);
        if larger != 0 {
            let next = 1usize << larger.trailing_zeros();
            let offset = next - (addr_merge & (next - 1));
            if offset < size {
                count = count.min(offset / pgsize);
            }
        }
        (pgsize, count)
    }

    /// Map a whole range using the largest pages that fit.
    pub fn map_range(
        &self,
        mut iova: usize,
        mut paddr: PhysAddr,
        mut size: usize,
        prot: MemFlags,
        ops: PgtableOps,
    ) -> PagingResult {
        while size > 0 {
            let (pgsize, count) = self.pgsize_for(iova, paddr, size);
            if pgsize == 0 {
                return Err(PagingError::InvalidArgument);
            }
            let mut mapped = 0;
            self.map_pages(iova, paddr, pgsize, count, prot, ops, &mut mapped)?;
            if mapped == 0 {
                break;
            }
            iova += mapped;
            paddr += mapped;
            size -= mapped;
        }
        Ok(())
    }

    fn free_pgtable(&self, lvl: usize, table: PhysAddr, alloc: &dyn TableAllocator) {
        let table_size = if lvl == self.start_level {
            self.pgd_size()
        } else {
            self.granule()
        };
        // Only leaf entries at the last level.
        if lvl < MAX_LEVELS - 1 {
            for idx in 0..self.entries_at(lvl) {
                let pte = entry(table, idx).load(Ordering::Acquire);
                if iopte_table(pte, lvl) {
                    self.free_pgtable(lvl + 1, self.iopte_to_paddr(pte), alloc);
                }
            }
        }
        alloc.free_table(table, table_size);
    }

    /// Report every leaf below `table` to the walker.
    fn walk_table(&self, ctx: &mut UnmapCtx, lvl: usize, table: PhysAddr) {
        for idx in 0..self.entries_at(lvl) {
            let pte = entry(table, idx).load(Ordering::Acquire);
            if iopte_leaf(pte, lvl) {
                ctx.walk(self.iopte_to_paddr(pte), self.block_size(lvl));
            } else if iopte_table(pte, lvl) {
                self.walk_table(ctx, lvl + 1, self.iopte_to_paddr(pte));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_blk_unmap(
        &self,
        ctx: &mut UnmapCtx,
        iova: usize,
        size: usize,
        blk_pte: Iopte,
        lvl: usize,
        parent: PhysAddr,
        parent_idx: usize,
        pgcount: usize,
    ) -> usize {
        if lvl == MAX_LEVELS {
            warn!("lpae: split below the last level");
            return 0;
        }

        let tablesz = self.granule();
        let Ok(mut tablep) = ctx.ops.alloc.alloc_table(tablesz) else {
            return 0; // Bytes unmapped
        };

        let split_sz = self.block_size(lvl);
        let ptes_per_table = self.ptes_per_table();
        let mut unmap_idx_start = None;
        let mut num_entries = 0;
        if size == split_sz {
            let start = self.lvl_idx(iova, lvl);
            num_entries = pgcount.min(ptes_per_table - start);
            unmap_idx_start = Some(start);
        }

        let mut blk_paddr = self.iopte_to_paddr(blk_pte);
        let prot = iopte_prot(blk_pte);
        for i in 0..ptes_per_table {
            let unmapped = unmap_idx_start.is_some_and(|s| i >= s && i < s + num_entries);
            if unmapped {
                ctx.walk(blk_paddr, split_sz);
            } else {
                self.write_leaves(blk_paddr, prot, lvl, 1, tablep, i);
            }
            blk_paddr += split_sz;
        }

        let pte = self.install_table(tablep, parent, parent_idx, blk_pte);
        if pte != blk_pte {
            ctx.ops.alloc.free_table(tablep, tablesz);
            // We may race against someone unmapping another part of this
            // block, but anything else is invalid.
            if iopte_type(pte) != PTE_TYPE_TABLE {
                return 0;
            }
            tablep = self.iopte_to_paddr(pte);
        } else if unmap_idx_start.is_some() {
            for i in 0..num_entries {
                ctx.add_page(iova + i * size, size);
            }
            return num_entries * size;
        }

        self.__unmap(ctx, iova, size, pgcount, lvl, tablep)
    }

    fn __unmap(
        &self,
        ctx: &mut UnmapCtx,
        iova: usize,
        size: usize,
        pgcount: usize,
        lvl: usize,
        table: PhysAddr,
    ) -> usize {
        // Something went horribly wrong and we ran out of page table.
        if lvl == MAX_LEVELS {
            warn!("lpae: ran out of levels at {:#x}", iova);
            return 0;
        }

        let idx = self.lvl_idx(iova, lvl);
        let pte = entry(table, idx).load(Ordering::Acquire);
        if !iopte_valid(pte) {
            self.mapping_missing(iova);
            return 0;
        }

        // If the size matches this level, we're in the right place.
        if size == self.block_size(lvl) {
            let num_entries = pgcount.min(self.entries_at(lvl) - idx);
            let mut i = 0;
            while i < num_entries {
                let pte = entry(table, idx + i).load(Ordering::Acquire);
                if !iopte_valid(pte) {
                    warn!("lpae: hole at {:#x}", iova + i * size);
                    break;
                }
                self.clear_pte(table, idx + i);

                if iopte_table(pte, lvl) {
                    let next = self.iopte_to_paddr(pte);
                    // Also flush any partial walks.
                    ctx.ops
                        .tlb
                        .tlb_flush_walk(iova + i * size, size, self.granule());
                    if ctx.walker.is_some() {
                        self.walk_table(ctx, lvl + 1, next);
                    }
                    self.free_pgtable(lvl + 1, next, ctx.ops.alloc);
                } else {
                    ctx.add_page(iova + i * size, size);
                    ctx.walk(self.iopte_to_paddr(pte), size);
                }
                i += 1;
            }
            return i * size;
        } else if iopte_leaf(pte, lvl) {
            // Insert a table at the next level to map the old region,
            // minus the part we want to unmap.
            return self.split_blk_unmap(ctx, iova, size, pte, lvl + 1, table, idx, pgcount);
        }

        // Keep on walkin'
        let next = self.iopte_to_paddr(pte);
        self.__unmap(ctx, iova, size, pgcount, lvl + 1, next)
    }

    /// Unmap up to `pgcount` pages of `pgsize` at `iova`, splitting blocks as
    /// needed. Removed leaves are queued on `gather` and reported to `walker`.
    /// Returns the number of bytes unmapped.
    pub fn unmap_pages(
        &self,
        iova: usize,
        pgsize: usize,
        pgcount: usize,
        ops: PgtableOps,
        gather: Option<&mut IotlbGather>,
        walker: Option<&mut dyn FnMut(PhysAddr, usize)>,
    ) -> usize {
        if pgsize == 0 || pgsize & self.cfg.pgsize_bitmap != pgsize || pgcount == 0 {
            warn!("lpae: bad unmap size {:#x} x {}", pgsize, pgcount);
            return 0;
        }
        if !self.iova_in_range(iova) {
            warn!("lpae: unmap of {:#x} out of range", iova);
            return 0;
        }
        let mut ctx = UnmapCtx {
            ops,
            gather,
            walker,
        };
        self.__unmap(&mut ctx, iova, pgsize, pgcount, self.start_level, self.pgd)
    }

    pub fn iova_to_phys(&self, iova: usize) -> PhysAddr {
        if !self.iova_in_range(iova) {
            return 0;
        }
        let mut table = self.pgd;
        for lvl in self.start_level..MAX_LEVELS {
            let pte = entry(table, self.lvl_idx(iova, lvl)).load(Ordering::Acquire);
            if !iopte_valid(pte) {
                return 0;
            }
            if iopte_leaf(pte, lvl) {
                return self.iopte_to_paddr(pte) | (iova & (self.block_size(lvl) - 1));
            }
            if !iopte_table(pte, lvl) {
                return 0;
            }
            table = self.iopte_to_paddr(pte);
        }
        // Ran out of page tables to walk.
        0
    }

    /// The first non-table entry covering `iova` and its level. Invalid and
    /// annotated entries are returned as well.
    pub fn get_leaf(&self, iova: usize) -> Option<(Iopte, usize)> {
        if !self.iova_in_range(iova) {
            return None;
        }
        let mut table = self.pgd;
        let mut lvl = self.start_level;
        loop {
            let pte = entry(table, self.lvl_idx(iova, lvl)).load(Ordering::Acquire);
            if !iopte_table(pte, lvl) {
                return Some((pte, lvl));
            }
            table = self.iopte_to_paddr(pte);
            lvl += 1;
        }
    }

    /// Raw entry at exactly `lvl` on the walk of `iova`, if the walk gets there.
    pub fn pte_at_level(&self, iova: usize, lvl: usize) -> Option<Iopte> {
        if !self.iova_in_range(iova) || lvl < self.start_level || lvl >= MAX_LEVELS {
            return None;
        }
        let mut table = self.pgd;
        for cur in self.start_level..lvl {
            let pte = entry(table, self.lvl_idx(iova, cur)).load(Ordering::Acquire);
            if !iopte_table(pte, cur) {
                return None;
            }
            table = self.iopte_to_paddr(pte);
        }
        Some(entry(table, self.lvl_idx(iova, lvl)).load(Ordering::Acquire))
    }

    /// Visit the entries covering `[iova, iova + size)` in order. The visitor
    /// gets the address it was called for, the entry and its level, and can
    /// stop the walk by returning an error.
    pub fn walk_leaves(
        &self,
        iova: usize,
        size: usize,
        visitor: &mut dyn FnMut(usize, Iopte, usize) -> HvResult,
    ) -> HvResult {
        let end = iova.checked_add(size).ok_or(hv_err!(ERANGE))?;
        let mut addr = iova;
        while addr < end {
            let (pte, lvl) = self.get_leaf(addr).ok_or(hv_err!(ERANGE))?;
            visitor(addr, pte, lvl)?;
            let bs = self.block_size(lvl);
            addr = (addr & !(bs - 1)) + bs;
        }
        Ok(())
    }

    /// Store the invalid descriptor `annotation` at last level for every page
    /// of the range. Zero clears a previous annotation. Fails on a valid
    /// mapping anywhere in the range.
    pub fn annotate(
        &self,
        iova: usize,
        size: usize,
        annotation: Iopte,
        alloc: &dyn TableAllocator,
    ) -> PagingResult {
        let granule = self.granule();
        if iopte_valid(annotation) || (iova | size) & (granule - 1) != 0 {
            return Err(PagingError::InvalidArgument);
        }
        for addr in (iova..iova + size).step_by(granule) {
            if !self.iova_in_range(addr) {
                return Err(PagingError::OutOfRange);
            }
            let mut table = self.pgd;
            let mut lvl = self.start_level;
            loop {
                let idx = self.lvl_idx(addr, lvl);
                let pte = entry(table, idx).load(Ordering::Acquire);
                if lvl == MAX_LEVELS - 1 {
                    if iopte_valid(pte) {
                        return Err(PagingError::AlreadyMapped);
                    }
                    entry(table, idx).store(annotation, Ordering::Release);
                    if !self.cfg.coherent_walk {
                        self.sync_pte(table, idx, 1);
                    }
                    break;
                }
                if iopte_table(pte, lvl) {
                    table = self.iopte_to_paddr(pte);
                    lvl += 1;
                    continue;
                }
                if iopte_valid(pte) {
                    return Err(PagingError::MappedToHugePage);
                }
                if annotation == 0 {
                    // Nothing below to clear.
                    break;
                }
                let new_table = alloc
                    .alloc_table(granule)
                    .map_err(|_| PagingError::NoMemory)?;
                let old = self.install_table(new_table, table, idx, pte);
                if old != pte {
                    alloc.free_table(new_table, granule);
                    if !iopte_table(old, lvl) {
                        return Err(PagingError::AlreadyMapped);
                    }
                    table = self.iopte_to_paddr(old);
                } else {
                    table = new_table;
                }
                lvl += 1;
            }
        }
        Ok(())
    }

    /// Free every table, the root included.
    pub fn destroy(self, alloc: &dyn TableAllocator) {
        self.free_pgtable(self.start_level, self.pgd, alloc);
    }
}
