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
//! Guest stage-2 translation.
//!
//! Every leaf carries the guest's view of the page state in its software
//! bits, so ownership checks on the guest side are a table walk. Table pages
//! come from the memcache of the vCPU that triggered the change and return to
//! a per-VM pool when freed.

use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::addr::{is_aligned, pfn_to_phys, phys_to_pfn, phys_to_virt, PhysAddr};
use super::mem_protect::{HostMmu, HostMmuInner, OwnerId, PageState};
use super::memcache::HypMemcache;
use super::{MemFlags, PAGE_SHIFT, PAGE_SIZE};
use crate::arch::cpu::{flush_dcache_to_poc, tlb_flush_vmid, tlb_flush_vmid_ipa};
use crate::arch::paging::{
    IoPgtableCfg, IoPgtableFmt, IotlbGather, LpaePgtable, PageSize, PgtableOps, TableAllocator,
    TlbFlushOps,
};
use crate::arch::s2pt::{iopte_valid, s2_pte_to_prot, Iopte, MAX_LEVELS, PTE_MMIO_NOTE};
use crate::error::{HvErrorNum, HvResult};

/// Guest IPA space.
pub const GUEST_IPA_BITS: usize = 40;
const GUEST_PA_BITS: usize = 48;
const GUEST_PGSIZES: usize =
    PageSize::Size4K as usize | PageSize::Size2M as usize | PageSize::Size1G as usize;
/// Upper bound on leaves visited by one guest request.
const MAX_WALK_PTES: usize = 512;

fn guest_pgtable_cfg() -> IoPgtableCfg {
    IoPgtableCfg::new(
        IoPgtableFmt::Lpae64S2,
        GUEST_PGSIZES,
        GUEST_IPA_BITS,
        GUEST_PA_BITS,
        true,
    )
}

/// Guest-side state of the entry covering an IPA.
pub fn guest_page_state(pte: Iopte) -> PageState {
    if !iopte_valid(pte) {
        return match pte {
            PTE_MMIO_NOTE => PageState::NOPAGE | PageState::MMIO,
            _ => PageState::NOPAGE,
        };
    }
    let sw = s2_pte_to_prot(pte);
    let mut state = PageState::OWNED;
    if sw.contains(MemFlags::SW0) {
        state |= PageState::SHARED_OWNED;
    }
    if sw.contains(MemFlags::SW1) {
        state |= PageState::SHARED_BORROWED;
    }
    state
}

fn state_prot(prot: MemFlags, state: PageState) -> MemFlags {
    let mut prot = prot - MemFlags::SW_MASK;
    if state.contains(PageState::SHARED_OWNED) {
        prot |= MemFlags::SW0;
    }
    if state.contains(PageState::SHARED_BORROWED) {
        prot |= MemFlags::SW1;
    }
    prot
}

struct GuestAlloc<'a> {
    mc: RefCell<Option<&'a mut HypMemcache>>,
    pool: &'a Mutex<HypMemcache>,
}

impl<'a> GuestAlloc<'a> {
    fn new(mc: Option<&'a mut HypMemcache>, pool: &'a Mutex<HypMemcache>) -> Self {
        Self {
            mc: RefCell::new(mc),
            pool,
        }
    }
}

impl TableAllocator for GuestAlloc<'_> {
    fn alloc_table(&self, size: usize) -> HvResult<PhysAddr> {
        // Only the root is larger than a page, and it is donated up front.
        if size != PAGE_SIZE {
            return hv_result_err!(ENOMEM);
        }
        let paddr = self
            .mc
            .borrow_mut()
            .as_mut()
            .and_then(|mc| mc.pop())
            .ok_or(hv_err!(ENOMEM))?;
        unsafe { core::ptr::write_bytes(phys_to_virt(paddr), 0, PAGE_SIZE) };
        Ok(paddr)
    }

    fn free_table(&self, paddr: PhysAddr, size: usize) {
        let mut pool = self.pool.lock();
        for pa in (paddr..paddr + size).step_by(PAGE_SIZE) {
            unsafe { pool.push(pa) };
        }
    }
}

struct GuestTlb {
    vttbr: u64,
}

impl TlbFlushOps for GuestTlb {
    fn tlb_flush_walk(&self, _iova: usize, _size: usize, _granule: usize) {
        tlb_flush_vmid(self.vttbr);
    }

    fn tlb_add_page(&self, _gather: Option<&mut IotlbGather>, iova: usize, _granule: usize) {
        tlb_flush_vmid_ipa(self.vttbr, iova);
    }
}

/// The leaves found by a guest request walk.
#[derive(Debug, Clone, Copy)]
struct WalkData {
    ipa_start: usize,
    /// `None` for unmapped ranges.
    phys_start: Option<PhysAddr>,
    size: usize,
    prot: MemFlags,
}

/// A checked guest transition: `nr_pages` from `ipa`, backed by `phys`.
struct Transition {
    phys: PhysAddr,
    nr_pages: usize,
    prot: MemFlags,
}

pub struct GuestStage2 {
    vmid: u16,
    root: PhysAddr,
    pgt: Mutex<Option<LpaePgtable>>,
    /// Table pages released by unmaps, handed back on teardown.
    pool: Mutex<HypMemcache>,
    mmio_guard: AtomicBool,
}

impl GuestStage2 {
    /// Bytes the host has to donate for the root table.
    pub fn pgd_size() -> HvResult<usize> {
        Ok(LpaePgtable::pgd_size_for(guest_pgtable_cfg())?)
    }

    /// Build the stage-2 of `vmid` over `pgd`, memory the hypervisor already owns.
    pub fn new(vmid: u16, pgd: PhysAddr, pgd_size: usize) -> HvResult<Self> {
        unsafe { core::ptr::write_bytes(phys_to_virt(pgd), 0, pgd_size) };
        let pgt = LpaePgtable::new_with_pgd(guest_pgtable_cfg(), pgd, pgd_size)?;
        Ok(Self {
            vmid,
            root: pgt.root_paddr(),
            pgt: Mutex::new(Some(pgt)),
            pool: Mutex::new(HypMemcache::new()),
            mmio_guard: AtomicBool::new(false),
        })
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn vttbr(&self) -> u64 {
        ((self.vmid as u64) << 48) | self.root as u64
    }

    pub fn flush_tlb(&self) {
        tlb_flush_vmid(self.vttbr());
    }

    pub fn enroll_mmio_guard(&self) {
        self.mmio_guard.store(true, Ordering::Release);
    }

    pub fn mmio_guard_enrolled(&self) -> bool {
        self.mmio_guard.load(Ordering::Acquire)
    }

    pub fn pool_pages(&self) -> usize {
        self.pool.lock().nr_pages()
    }

    fn with_pgt<R>(&self, f: impl FnOnce(&LpaePgtable) -> HvResult<R>) -> HvResult<R> {
        let pgt = self.pgt.lock();
        match pgt.as_ref() {
            Some(pgt) => f(pgt),
            None => hv_result_err!(EPIPE, "guest stage-2 destroyed"),
        }
    }

    pub fn ipa_to_phys(&self, ipa: usize) -> Option<PhysAddr> {
        self.with_pgt(|pgt| Ok(pgt.iova_to_phys(ipa)))
            .ok()
            .filter(|&pa| pa != 0)
    }

    pub fn page_state(&self, ipa: usize) -> PageState {
        self.with_pgt(|pgt| Ok(pgt.get_leaf(ipa).map(|(pte, _)| guest_page_state(pte))))
            .ok()
            .flatten()
            .unwrap_or(PageState::NOPAGE)
    }

    /// Remove every valid leaf in `[ipa, ipa + size)`, splitting blocks that
    /// straddle the range. Returns the bytes unmapped.
    fn unmap_range(pgt: &LpaePgtable, ipa: usize, size: usize, ops: PgtableOps) -> usize {
        let end = ipa + size;
        let mut addr = ipa;
        let mut unmapped = 0;
        while addr < end {
            let Some((pte, lvl)) = pgt.get_leaf(addr) else {
                break;
            };
            let bs = pgt.block_size(lvl);
            let next = ((addr & !(bs - 1)) + bs).min(end);
            let mut cur = addr;
            while iopte_valid(pte) && cur < next {
                let (pgsize, count) = pgt.pgsize_for(cur, cur, next - cur);
                if pgsize == 0 {
                    break;
                }
                let n = pgt.unmap_pages(cur, pgsize, count, ops, None, None);
                if n == 0 {
                    return unmapped;
                }
                unmapped += n;
                cur += n;
            }
            addr = next;
        }
        unmapped
    }

    /// Rewrite the state of a mapped range, break-before-make.
    fn remap(
        pgt: &LpaePgtable,
        ipa: usize,
        phys: PhysAddr,
        size: usize,
        prot: MemFlags,
        state: PageState,
        ops: PgtableOps,
    ) -> HvResult {
        if Self::unmap_range(pgt, ipa, size, ops) != size {
            return hv_result_err!(ENOMEM);
        }
        Ok(pgt.map_range(ipa, phys, size, state_prot(prot, state), ops)?)
    }

    /// Walk the leaves of `[ipa, ipa + size)` expecting `desired` under
    /// `mask`. The walk stops early, successfully, at the first physically
    /// discontiguous leaf or after `MAX_WALK_PTES` leaves.
    fn walk_request(
        pgt: &LpaePgtable,
        host: Option<&HostMmuInner>,
        ipa: usize,
        size: usize,
        desired: PageState,
        mask: PageState,
    ) -> HvResult<WalkData> {
        let mut data = WalkData {
            ipa_start: 0,
            phys_start: None,
            size: 0,
            prot: MemFlags::empty(),
        };
        let mut left = MAX_WALK_PTES;
        let mut stopped = false;
        let ret = pgt.walk_leaves(ipa, size, &mut |addr, pte, lvl| {
            let state = guest_page_state(pte);
            if state & mask != desired & mask {
                return if state.contains(PageState::NOPAGE) {
                    hv_result_err!(EFAULT)
                } else {
                    hv_result_err!(EINVAL)
                };
            }
            let granule = pgt.block_size(lvl);
            let phys = match state.contains(PageState::NOPAGE) {
                true => None,
                false => {
                    let pa = pgt.iopte_to_paddr(pte);
                    if !host.map_or(true, |h| h.addr_is_memory(pa)) {
                        return hv_result_err!(EINVAL);
                    }
                    Some(pa)
                }
            };

            if data.size == 0 {
                data.ipa_start = addr & !(granule - 1);
                data.phys_start = phys;
                data.prot = if iopte_valid(pte) {
                    s2_pte_to_prot(pte) - MemFlags::SW_MASK
                } else {
                    MemFlags::empty()
                };
            } else if let Some(start) = data.phys_start {
                // Can only describe physically contiguous mappings.
                if phys != Some(start + data.size) {
                    stopped = true;
                    return hv_result_err!(E2BIG);
                }
            }
            data.size += granule;
            left -= 1;
            if left == 0 {
                stopped = true;
                return hv_result_err!(E2BIG);
            }
            Ok(())
        });
        match ret {
            Ok(()) => Ok(data),
            Err(e) if stopped && e.num() == HvErrorNum::E2BIG => Ok(data),
            Err(e) if e.num() == HvErrorNum::ERANGE => hv_result_err!(EINVAL),
            Err(e) => Err(e),
        }
    }

    /// Check a guest-initiated transition of `nr` pages at `ipa` and clip it
    /// to what one contiguous walk covers.
    #[allow(clippy::too_many_arguments)]
    fn request_transition(
        pgt: &LpaePgtable,
        host: &HostMmuInner,
        mc_pages: usize,
        min_pages: usize,
        ipa: usize,
        nr: usize,
        desired: PageState,
    ) -> HvResult<Transition> {
        let size = nr * PAGE_SIZE;
        let data = Self::walk_request(pgt, Some(host), ipa, size, desired, PageState::all())?;
        if data.ipa_start > ipa {
            return hv_result_err!(EINVAL);
        }
        let phys_start = data.phys_start.ok_or(hv_err!(EFAULT))?;

        // Not aligned with the block mapping: the block is split, which
        // needs table pages.
        let offset = ipa - data.ipa_start;
        if (offset != 0 || size < data.size) && mc_pages < min_pages {
            return hv_result_err!(ENOMEM);
        }
        Ok(Transition {
            phys: phys_start + offset,
            nr_pages: ((data.size - offset) >> PAGE_SHIFT).min(nr),
            prot: data.prot,
        })
    }

    fn ops<'a>(alloc: &'a GuestAlloc<'_>, tlb: &'a GuestTlb) -> PgtableOps<'a> {
        PgtableOps { alloc, tlb }
    }

    fn tlb(&self) -> GuestTlb {
        GuestTlb {
            vttbr: self.vttbr(),
        }
    }

    /// Move `nr` host pages at `pfn` into a protected guest at `gfn`.
    pub fn host_donate_guest(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        pfn: usize,
        gfn: usize,
        nr: usize,
    ) -> HvResult {
        self.host_map_guest(host_mmu, mc, pfn, gfn, nr, MemFlags::RW, PageState::OWNED)
    }

    /// Lend `nr` host pages to a non-protected guest; the host keeps them.
    pub fn host_share_guest(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        pfn: usize,
        gfn: usize,
        nr: usize,
        prot: MemFlags,
    ) -> HvResult {
        if !prot.intersects(MemFlags::RW) || !(MemFlags::RW | MemFlags::NOEXEC).contains(prot) {
            return hv_result_err!(EINVAL);
        }
        self.host_map_guest(host_mmu, mc, pfn, gfn, nr, prot, PageState::SHARED_BORROWED)
    }

    #[allow(clippy::too_many_arguments)]
    fn host_map_guest(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        pfn: usize,
        gfn: usize,
        nr: usize,
        prot: MemFlags,
        state: PageState,
    ) -> HvResult {
        if nr == 0 {
            return hv_result_err!(EINVAL);
        }
        let phys = pfn_to_phys(pfn);
        let ipa = pfn_to_phys(gfn);
        let size = nr * PAGE_SIZE;

        let mut host = host_mmu.lock();
        self.with_pgt(|pgt| {
            // The guest range must be completely unmapped, guards included.
            pgt.walk_leaves(ipa, size, &mut |addr, pte, _| match pte {
                0 => Ok(()),
                _ => {
                    debug!("guest {}: ipa {:#x} already in use", self.vmid, addr);
                    hv_result_err!(EPERM)
                }
            })?;

            match state {
                PageState::OWNED => host.donate_to_guest(phys, size)?,
                _ => host.share_with_guest(phys, size)?,
            }

            let alloc = GuestAlloc::new(Some(mc), &self.pool);
            let tlb = self.tlb();
            let ops = Self::ops(&alloc, &tlb);
            let prot = state_prot(prot | MemFlags::CACHE, state);
            if let Err(e) = pgt.map_range(ipa, phys, size, prot, ops) {
                Self::unmap_range(pgt, ipa, size, ops);
                let undo = match state {
                    PageState::OWNED => host.set_owner_locked(phys, size, OwnerId::Host),
                    _ => host.unshare_from_guest(phys, size),
                };
                if let Err(undo) = undo {
                    warn!("guest map: host range {:#x} not restored: {:?}", phys, undo);
                }
                return Err(e.into());
            }
            Ok(())
        })
    }

    /// Guest asks to share `nr` of its pages at `ipa` with the host.
    /// Returns how many pages were shared.
    pub fn guest_share_host(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        min_pages: usize,
        ipa: usize,
        nr: usize,
    ) -> HvResult<usize> {
        self.guest_transition(host_mmu, mc, min_pages, ipa, nr, true)
    }

    /// Inverse of [`Self::guest_share_host`].
    pub fn guest_unshare_host(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        min_pages: usize,
        ipa: usize,
        nr: usize,
    ) -> HvResult<usize> {
        self.guest_transition(host_mmu, mc, min_pages, ipa, nr, false)
    }

    fn guest_transition(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        min_pages: usize,
        ipa: usize,
        nr: usize,
        share: bool,
    ) -> HvResult<usize> {
        if nr == 0 || !is_aligned(ipa) {
            return hv_result_err!(EINVAL);
        }
        let (from, to) = match share {
            true => (PageState::OWNED, PageState::SHARED_OWNED),
            false => (PageState::SHARED_OWNED, PageState::OWNED),
        };

        let mut host = host_mmu.lock();
        self.with_pgt(|pgt| {
            let tx =
                Self::request_transition(pgt, &host, mc.nr_pages(), min_pages, ipa, nr, from)?;
            let size = tx.nr_pages * PAGE_SIZE;
            match share {
                true => host.accept_guest_share(tx.phys, size)?,
                false => host.accept_guest_unshare(tx.phys, size)?,
            }

            let alloc = GuestAlloc::new(Some(mc), &self.pool);
            let tlb = self.tlb();
            let ops = Self::ops(&alloc, &tlb);
            if let Err(e) = Self::remap(pgt, ipa, tx.phys, size, tx.prot, to, ops) {
                error!("guest {}: ipa {:#x} lost its mapping: {:?}", self.vmid, ipa, e);
                return Err(e);
            }
            Ok(tx.nr_pages)
        })
    }

    /// Unmap the page at `ipa` and give it back to the host. Returns the
    /// physical address released, 0 when nothing was mapped.
    pub fn guest_relinquish_to_host(
        &self,
        host_mmu: &HostMmu,
        mc: &mut HypMemcache,
        protected: bool,
        ipa: usize,
    ) -> HvResult<PhysAddr> {
        let ipa = ipa & !(PAGE_SIZE - 1);
        let mut host = host_mmu.lock();
        self.with_pgt(|pgt| {
            let (pte, lvl) = pgt.get_leaf(ipa).ok_or(hv_err!(EINVAL))?;
            if !iopte_valid(pte) {
                return Ok(0);
            }
            let expected = match protected {
                true => PageState::OWNED,
                false => PageState::SHARED_BORROWED,
            };
            if guest_page_state(pte) != expected {
                return hv_result_err!(EPERM);
            }
            let bs = pgt.block_size(lvl);
            let phys = pgt.iopte_to_paddr(pte) + (ipa & (bs - 1));

            let alloc = GuestAlloc::new(Some(mc), &self.pool);
            let tlb = self.tlb();
            if Self::unmap_range(pgt, ipa, PAGE_SIZE, Self::ops(&alloc, &tlb)) != PAGE_SIZE {
                return hv_result_err!(ENOMEM);
            }
            if protected {
                poison_page(phys);
            }
            if let Err(e) = host.set_owner_locked(phys, PAGE_SIZE, OwnerId::Host) {
                warn!("relinquish: {:#x} not returned to host: {:?}", phys, e);
            }
            Ok(phys)
        })
    }

    /// Mark `nr` unmapped pages at `ipa` as MMIO the guest allows the host
    /// to emulate. Returns how many pages are now guarded.
    /// Guard `nr` pages of MMIO at `ipa`. `nr_guarded` is set to the number of
    /// pages covered by the attempt, also when the annotation fails.
    pub fn install_ioguard(
        &self,
        mc: &mut HypMemcache,
        ipa: usize,
        nr: usize,
        nr_guarded: &mut usize,
    ) -> HvResult {
        if !self.mmio_guard_enrolled() {
            return hv_result_err!(EINVAL);
        }
        let size = nr.checked_mul(PAGE_SIZE).ok_or(hv_err!(EINVAL))?;
        if !is_aligned(ipa) || size == 0 {
            return hv_result_err!(EINVAL);
        }
        self.with_pgt(|pgt| {
            // Unmapped, guarded or not.
            let data = Self::walk_request(pgt, None, ipa, size, PageState::NOPAGE, !PageState::MMIO)?;
            let size = (data.size - (ipa - data.ipa_start)).min(size);
            let alloc = GuestAlloc::new(Some(mc), &self.pool);
            let ret = pgt.annotate(ipa, size, PTE_MMIO_NOTE, &alloc);
            *nr_guarded = size >> PAGE_SHIFT;
            Ok(ret?)
        })
    }

    pub fn remove_ioguard(&self, ipa: usize, nr: usize) -> HvResult<usize> {
        if !self.mmio_guard_enrolled() {
            return hv_result_err!(EINVAL);
        }
        let size = nr.checked_mul(PAGE_SIZE).ok_or(hv_err!(EINVAL))?;
        if !is_aligned(ipa) || size == 0 {
            return hv_result_err!(EINVAL);
        }
        self.with_pgt(|pgt| {
            let guarded = PageState::NOPAGE | PageState::MMIO;
            let data = Self::walk_request(pgt, None, ipa, size, guarded, PageState::all())?;
            // Guards are always last level entries.
            if data.ipa_start != ipa {
                warn!("ioguard: {:#x} is not a page guard", ipa);
            }
            let size = data.size.min(size);
            let alloc = GuestAlloc::new(None, &self.pool);
            pgt.annotate(ipa, size, 0, &alloc)?;
            Ok(size >> PAGE_SHIFT)
        })
    }

    fn is_ioguard_page(pgt: &LpaePgtable, ipa: usize) -> bool {
        matches!(pgt.get_leaf(ipa), Some((PTE_MMIO_NOTE, lvl)) if lvl == MAX_LEVELS - 1)
    }

    /// Whether a data abort of `len` bytes at `ipa` may go to the host.
    pub fn check_ioguard_page(&self, ipa: usize, len: usize) -> bool {
        if !self.mmio_guard_enrolled() {
            return true;
        }
        let end = ipa + len.max(1) - 1;
        self.with_pgt(|pgt| {
            let mut ok = Self::is_ioguard_page(pgt, ipa);
            if end & !(PAGE_SIZE - 1) != ipa & !(PAGE_SIZE - 1) {
                ok &= Self::is_ioguard_page(pgt, end);
            }
            Ok(ok)
        })
        .unwrap_or(false)
    }

    /// Take back a page of a dying guest. Guest-private content is wiped.
    pub fn host_reclaim_page(
        &self,
        host_mmu: &HostMmu,
        pfn: usize,
        ipa: usize,
        order: u32,
    ) -> HvResult {
        let size = PAGE_SIZE << order;
        let phys = pfn_to_phys(pfn);
        if order != 0 && size != PageSize::Size2M as usize {
            return hv_result_err!(EINVAL);
        }

        let mut host = host_mmu.lock();
        self.with_pgt(|pgt| {
            let (pte, lvl) = pgt.get_leaf(ipa).ok_or(hv_err!(EINVAL))?;
            if pgt.block_size(lvl) != size {
                return hv_result_err!(E2BIG);
            }
            if !iopte_valid(pte) {
                return hv_result_err!(ENOENT);
            }
            if pgt.iopte_to_paddr(pte) != phys {
                return hv_result_err!(EINVAL);
            }

            // Whole leaves only, so no table is needed.
            let alloc = GuestAlloc::new(None, &self.pool);
            let tlb = self.tlb();
            if pgt.unmap_pages(ipa, size, 1, Self::ops(&alloc, &tlb), None, None) != size {
                warn!("reclaim: ipa {:#x} not unmapped", ipa);
            }

            let state = guest_page_state(pte);
            let host_state = if state == PageState::OWNED {
                poison_page_range(phys, size);
                PageState::NOPAGE
            } else if state.contains(PageState::SHARED_BORROWED) {
                PageState::SHARED_OWNED
            } else {
                PageState::SHARED_BORROWED
            };
            if host.check_state_range(phys, size, host_state).is_err() {
                warn!("reclaim: host view of {:#x} is not {:?}", phys, host_state);
            }
            host.set_owner_locked(phys, size, OwnerId::Host)
        })
    }

    /// Free every table. The root ends up in the pool with the rest.
    pub fn destroy(&self) {
        if let Some(pgt) = self.pgt.lock().take() {
            let alloc = GuestAlloc::new(None, &self.pool);
            pgt.destroy(&alloc);
        }
    }

    /// Wipe the pooled table pages and return them through `teardown_mc`.
    pub fn drain_pool(&self, host_mmu: &HostMmu, teardown_mc: &mut HypMemcache) {
        let pages: Vec<PhysAddr> = {
            let mut pool = self.pool.lock();
            core::iter::from_fn(|| pool.pop()).collect()
        };
        for paddr in pages {
            poison_page(paddr);
            unsafe { teardown_mc.push(paddr) };
            if let Err(e) = host_mmu.donate_hyp_to_host_noclear(phys_to_pfn(paddr), 1) {
                warn!("drain pool: page {:#x} not returned: {:?}", paddr, e);
            }
        }
    }
}

fn poison_page_range(phys: PhysAddr, size: usize) {
    unsafe { core::ptr::write_bytes(phys_to_virt(phys), 0, size) };
    flush_dcache_to_poc(phys, size);
}

/// Wipe a page before the host can see it again.
pub fn poison_page(phys: PhysAddr) {
    poison_page_range(phys, PAGE_SIZE);
}
