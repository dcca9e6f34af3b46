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
//! Ownership of host physical pages.
//!
//! Every page of host RAM is owned by exactly one of the host, the hypervisor
//! or a guest. Transfers go through this module only, which keeps the page
//! metadata and the IOMMU identity domain in step.

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;
use core::ops::Range;

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::addr::{is_aligned, pfn_to_phys, phys_to_virt, PhysAddr};
use super::{MemFlags, PAGE_SIZE};
use crate::arch::cpu::flush_dcache_to_poc;
use crate::error::HvResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerId {
    Host,
    Hyp,
    Guest,
}

bitflags! {
    /// State of a page as seen by one component.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageState: u8 {
        const OWNED             = 0;
        const SHARED_OWNED      = 1 << 0;
        const SHARED_BORROWED   = 1 << 1;
        /// Device memory the host has mapped for DMA. Never transitions again.
        const MMIO_DMA          = Self::SHARED_OWNED.bits() | Self::SHARED_BORROWED.bits();
        const RESTRICTED_PROT   = 1 << 2;
        const MMIO              = 1 << 3;
        const NOPAGE            = 1 << 4;
    }
}

/// Receives the host stage-2 changes that must be mirrored into the IOMMU
/// identity domain. `prot` empty means unmap.
pub trait HostIdmap: Send + Sync {
    fn host_stage2_idmap(&self, start: PhysAddr, end: PhysAddr, prot: MemFlags);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HostPage {
    state: PageState,
    owner: OwnerId,
    dma_refs: u16,
    pins: u16,
    hyp_shared: bool,
}

impl HostPage {
    const DEFAULT: Self = Self {
        state: PageState::OWNED,
        owner: OwnerId::Host,
        dma_refs: 0,
        pins: 0,
        hyp_shared: false,
    };
}

pub struct HostMmuInner {
    ram: Vec<Range<PhysAddr>>,
    pages: BTreeMap<usize, HostPage>,
    idmap: Option<Weak<dyn HostIdmap>>,
}

pub struct HostMmu {
    inner: Mutex<HostMmuInner>,
}

impl HostMmuInner {
    fn find_ram(&self, paddr: PhysAddr) -> Option<&Range<PhysAddr>> {
        self.ram.iter().find(|r| r.contains(&paddr))
    }

    pub fn addr_is_memory(&self, paddr: PhysAddr) -> bool {
        self.find_ram(paddr).is_some()
    }

    pub fn range_is_memory(&self, start: PhysAddr, end: PhysAddr) -> bool {
        match self.find_ram(start) {
            Some(r) => end <= r.end && start < end,
            None => false,
        }
    }

    fn page(&self, paddr: PhysAddr) -> HostPage {
        self.pages
            .get(&(paddr / PAGE_SIZE))
            .copied()
            .unwrap_or(HostPage::DEFAULT)
    }

    fn update_page(&mut self, paddr: PhysAddr, f: impl FnOnce(&mut HostPage)) {
        let mut page = self.page(paddr);
        f(&mut page);
        if page == HostPage::DEFAULT {
            self.pages.remove(&(paddr / PAGE_SIZE));
        } else {
            self.pages.insert(paddr / PAGE_SIZE, page);
        }
    }

    fn pages_of(addr: PhysAddr, size: usize) -> impl Iterator<Item = PhysAddr> {
        (addr..addr + size).step_by(PAGE_SIZE)
    }

    fn notify_idmap(&self, start: PhysAddr, end: PhysAddr, prot: MemFlags) {
        if let Some(idmap) = self.idmap.as_ref().and_then(|w| w.upgrade()) {
            idmap.host_stage2_idmap(start, end, prot);
        }
    }

    pub fn host_state(&self, paddr: PhysAddr) -> PageState {
        self.page(paddr).state
    }

    pub fn owner(&self, paddr: PhysAddr) -> OwnerId {
        self.page(paddr).owner
    }

    pub fn is_range_refcounted(&self, addr: PhysAddr, nr_pages: usize) -> bool {
        Self::pages_of(addr, nr_pages * PAGE_SIZE).any(|pa| self.page(pa).dma_refs != 0)
    }

    /// Every page of the range must be in `state` from the host's view.
    pub fn check_state_range(&self, addr: PhysAddr, size: usize, state: PageState) -> HvResult {
        let end = addr + size;
        if size == 0 {
            return Ok(());
        }
        // Can't check the state of both MMIO and memory regions at once.
        if self.addr_is_memory(addr) != self.addr_is_memory(end - 1)
            || (self.addr_is_memory(addr) && !self.range_is_memory(addr, end))
        {
            return hv_result_err!(EINVAL);
        }
        if Self::pages_of(addr, size).any(|pa| self.page(pa).state != state) {
            return hv_result_err!(EPERM);
        }
        Ok(())
    }

    /// Change the host-side state of pages the host can still reach.
    pub fn set_state_range(&mut self, addr: PhysAddr, size: usize, state: PageState) {
        if self.page(addr).state.contains(PageState::NOPAGE) {
            self.notify_idmap(addr, addr + size, MemFlags::RW);
        }
        for pa in Self::pages_of(addr, size) {
            self.update_page(pa, |p| p.state = state);
        }
    }

    pub fn set_owner_locked(&mut self, addr: PhysAddr, size: usize, owner: OwnerId) -> HvResult {
        let is_memory = self.addr_is_memory(addr);
        let state = match owner {
            OwnerId::Host => PageState::OWNED,
            _ => PageState::NOPAGE,
        };
        for pa in Self::pages_of(addr, size) {
            self.update_page(pa, |p| {
                p.state = state;
                p.owner = owner;
            });
        }
        if !is_memory {
            return Ok(());
        }
        let prot = match owner {
            OwnerId::Host => MemFlags::RW,
            _ => MemFlags::empty(),
        };
        self.notify_idmap(addr, addr + size, prot);
        Ok(())
    }

    fn owned_by(&self, addr: PhysAddr, size: usize, owner: OwnerId) -> bool {
        Self::pages_of(addr, size).all(|pa| self.page(pa).owner == owner)
    }

    /// Host pages that may leave the host: RAM, owned, and not reachable by
    /// any device.
    fn check_host_exclusive(&self, addr: PhysAddr, size: usize) -> HvResult {
        if !self.range_is_memory(addr, addr + size) {
            return hv_result_err!(EPERM);
        }
        if self.is_range_refcounted(addr, size / PAGE_SIZE) {
            return hv_result_err!(EINVAL);
        }
        self.check_state_range(addr, size, PageState::OWNED)?;
        if !self.owned_by(addr, size, OwnerId::Host) {
            return hv_result_err!(EPERM);
        }
        Ok(())
    }

    /// Host leg of populating a protected guest: the pages become guest
    /// property and disappear from the host and its devices.
    pub fn donate_to_guest(&mut self, addr: PhysAddr, size: usize) -> HvResult {
        self.check_host_exclusive(addr, size)?;
        self.set_owner_locked(addr, size, OwnerId::Guest)
    }

    /// Host leg of lending pages to a non-protected guest.
    pub fn share_with_guest(&mut self, addr: PhysAddr, size: usize) -> HvResult {
        self.check_host_exclusive(addr, size)?;
        self.set_state_range(addr, size, PageState::SHARED_OWNED);
        Ok(())
    }

    pub fn unshare_from_guest(&mut self, addr: PhysAddr, size: usize) -> HvResult {
        self.check_state_range(addr, size, PageState::SHARED_OWNED)?;
        if !self.owned_by(addr, size, OwnerId::Host) {
            return hv_result_err!(EPERM);
        }
        self.set_state_range(addr, size, PageState::OWNED);
        Ok(())
    }

    /// Host leg of a guest sharing its own pages: the host may access them
    /// again but does not own them.
    pub fn accept_guest_share(&mut self, addr: PhysAddr, size: usize) -> HvResult {
        self.check_state_range(addr, size, PageState::NOPAGE)?;
        if !self.owned_by(addr, size, OwnerId::Guest) {
            return hv_result_err!(EPERM);
        }
        self.set_state_range(addr, size, PageState::SHARED_BORROWED);
        Ok(())
    }

    pub fn accept_guest_unshare(&mut self, addr: PhysAddr, size: usize) -> HvResult {
        self.check_state_range(addr, size, PageState::SHARED_BORROWED)?;
        if !self.owned_by(addr, size, OwnerId::Guest) {
            return hv_result_err!(EPERM);
        }
        if self.is_range_refcounted(addr, size / PAGE_SIZE) {
            return hv_result_err!(EINVAL);
        }
        self.set_owner_locked(addr, size, OwnerId::Guest)
    }

    fn use_dma_page(&mut self, paddr: PhysAddr) -> HvResult {
        let page = self.page(paddr);
        if !self.addr_is_memory(paddr) {
            if page.state == PageState::MMIO_DMA {
                return Ok(());
            }
            if page.owner != OwnerId::Host || page.state != PageState::OWNED {
                return hv_result_err!(EPERM);
            }
            self.update_page(paddr, |p| p.state = PageState::MMIO_DMA);
            return Ok(());
        }
        if page.state.contains(PageState::NOPAGE) {
            return hv_result_err!(EPERM);
        }
        // Shared with the hypervisor: still reachable by the host, but DMA
        // into hypervisor memory is never allowed.
        if page.hyp_shared {
            return hv_result_err!(EPERM);
        }
        if page.dma_refs == u16::MAX {
            return hv_result_err!(EBUSY);
        }
        self.update_page(paddr, |p| p.dma_refs += 1);
        Ok(())
    }

    fn unuse_dma_page(&mut self, paddr: PhysAddr) {
        if !self.addr_is_memory(paddr) {
            return;
        }
        self.update_page(paddr, |p| match p.dma_refs.checked_sub(1) {
            Some(refs) => p.dma_refs = refs,
            None => warn!("DMA refcount underflow at {:#x}", paddr),
        });
    }

    fn host_accessible(&self, paddr: PhysAddr) -> bool {
        !self.page(paddr).state.contains(PageState::NOPAGE)
    }
}

impl HostMmu {
    pub fn new(ram: &[Range<PhysAddr>]) -> Self {
        Self {
            inner: Mutex::new(HostMmuInner {
                ram: ram.to_vec(),
                pages: BTreeMap::new(),
                idmap: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HostMmuInner> {
        self.inner.lock()
    }

    pub fn set_idmap(&self, idmap: Weak<dyn HostIdmap>) {
        self.inner.lock().idmap = Some(idmap);
    }

    pub fn addr_is_memory(&self, paddr: PhysAddr) -> bool {
        self.inner.lock().addr_is_memory(paddr)
    }

    pub fn host_state(&self, paddr: PhysAddr) -> PageState {
        self.inner.lock().host_state(paddr)
    }

    pub fn owner(&self, paddr: PhysAddr) -> OwnerId {
        self.inner.lock().owner(paddr)
    }

    pub fn donate_host_to_hyp(&self, pfn: usize, nr_pages: usize, accept_mmio: bool) -> HvResult {
        let start = pfn_to_phys(pfn);
        let size = nr_pages * PAGE_SIZE;
        let mut host = self.inner.lock();
        if !accept_mmio && !host.range_is_memory(start, start + size) {
            return hv_result_err!(EPERM);
        }
        if host.range_is_memory(start, start + size) && host.is_range_refcounted(start, nr_pages) {
            return hv_result_err!(EINVAL);
        }
        host.check_state_range(start, size, PageState::OWNED)?;
        if HostMmuInner::pages_of(start, size).any(|pa| host.owner(pa) != OwnerId::Host) {
            return hv_result_err!(EPERM);
        }
        trace!("donate host->hyp {:#x} +{} pages", start, nr_pages);
        host.set_owner_locked(start, size, OwnerId::Hyp)
    }

    fn __donate_hyp_to_host(&self, pfn: usize, nr_pages: usize, clear: bool) -> HvResult {
        let start = pfn_to_phys(pfn);
        let size = nr_pages * PAGE_SIZE;
        let mut host = self.inner.lock();
        if HostMmuInner::pages_of(start, size).any(|pa| host.owner(pa) != OwnerId::Hyp) {
            return hv_result_err!(EPERM);
        }
        if clear && host.addr_is_memory(start) {
            unsafe { core::ptr::write_bytes(phys_to_virt(start), 0, size) };
            flush_dcache_to_poc(start, size);
        }
        trace!("donate hyp->host {:#x} +{} pages", start, nr_pages);
        host.set_owner_locked(start, size, OwnerId::Host)
    }

    /// Give pages back to the host after wiping them.
    pub fn donate_hyp_to_host(&self, pfn: usize, nr_pages: usize) -> HvResult {
        self.__donate_hyp_to_host(pfn, nr_pages, true)
    }

    /// Give pages back to the host with their content intact.
    pub fn donate_hyp_to_host_noclear(&self, pfn: usize, nr_pages: usize) -> HvResult {
        self.__donate_hyp_to_host(pfn, nr_pages, false)
    }

    /// Let the hypervisor read a host page, e.g. a shared structure.
    pub fn host_share_hyp(&self, pfn: usize) -> HvResult {
        let addr = pfn_to_phys(pfn);
        let mut host = self.inner.lock();
        host.check_state_range(addr, PAGE_SIZE, PageState::OWNED)?;
        if host.owner(addr) != OwnerId::Host || !host.addr_is_memory(addr) {
            return hv_result_err!(EPERM);
        }
        if host.page(addr).dma_refs != 0 {
            return hv_result_err!(EPERM);
        }
        host.set_state_range(addr, PAGE_SIZE, PageState::SHARED_OWNED);
        host.update_page(addr, |p| p.hyp_shared = true);
        Ok(())
    }

    pub fn host_unshare_hyp(&self, pfn: usize) -> HvResult {
        let addr = pfn_to_phys(pfn);
        let mut host = self.inner.lock();
        host.check_state_range(addr, PAGE_SIZE, PageState::SHARED_OWNED)?;
        if !host.page(addr).hyp_shared {
            return hv_result_err!(EPERM);
        }
        if host.page(addr).pins != 0 {
            return hv_result_err!(EBUSY);
        }
        host.set_state_range(addr, PAGE_SIZE, PageState::OWNED);
        host.update_page(addr, |p| p.hyp_shared = false);
        Ok(())
    }

    /// Pin host pages shared with the hypervisor so they cannot be unshared
    /// while the hypervisor holds a reference into them.
    pub fn pin_shared_mem(&self, from: PhysAddr, to: PhysAddr) -> HvResult {
        let start = from & !(PAGE_SIZE - 1);
        let mut host = self.inner.lock();
        let size = (to - start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if host.check_state_range(start, size, PageState::SHARED_OWNED).is_err()
            || HostMmuInner::pages_of(start, size).any(|pa| !host.page(pa).hyp_shared)
        {
            return hv_result_err!(EBUSY);
        }
        for pa in HostMmuInner::pages_of(start, size) {
            host.update_page(pa, |p| p.pins += 1);
        }
        Ok(())
    }

    pub fn unpin_shared_mem(&self, from: PhysAddr, to: PhysAddr) {
        let start = from & !(PAGE_SIZE - 1);
        let size = (to - start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut host = self.inner.lock();
        for pa in HostMmuInner::pages_of(start, size) {
            host.update_page(pa, |p| match p.pins.checked_sub(1) {
                Some(pins) => p.pins = pins,
                None => warn!("unpin of unpinned page {:#x}", pa),
            });
        }
    }

    /// Refcount host pages mapped into a device address space, so that the
    /// host cannot donate them while a device may still reach them.
    pub fn use_dma(&self, paddr: PhysAddr, size: usize) -> HvResult {
        if !is_aligned(paddr | size) {
            warn!("use_dma: unaligned range {:#x}+{:#x}", paddr, size);
            return hv_result_err!(EINVAL);
        }
        let mut host = self.inner.lock();
        let nr_pages = size / PAGE_SIZE;
        for i in 0..nr_pages {
            if let Err(e) = host.use_dma_page(paddr + i * PAGE_SIZE) {
                for j in (0..i).rev() {
                    host.unuse_dma_page(paddr + j * PAGE_SIZE);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn unuse_dma(&self, paddr: PhysAddr, size: usize) -> HvResult {
        let mut host = self.inner.lock();
        for pa in HostMmuInner::pages_of(paddr, size) {
            host.unuse_dma_page(pa);
        }
        Ok(())
    }

    /// Hold the host lock while the caller mirrors every host-reachable
    /// range somewhere else.
    pub fn snapshot(&self) -> HostSnapshot<'_> {
        HostSnapshot {
            host: self.inner.lock(),
        }
    }
}

pub struct HostSnapshot<'a> {
    host: MutexGuard<'a, HostMmuInner>,
}

impl HostSnapshot<'_> {
    /// Host-accessible RAM ranges, coalesced.
    pub fn ranges(&self) -> Vec<(PhysAddr, PhysAddr, MemFlags)> {
        let mut ret: Vec<(PhysAddr, PhysAddr, MemFlags)> = Vec::new();
        for region in self.host.ram.iter() {
            let mut pa = region.start;
            while pa < region.end {
                if self.host.host_accessible(pa) {
                    match ret.last_mut() {
                        Some((_, end, _)) if *end == pa => *end = pa + PAGE_SIZE,
                        _ => ret.push((pa, pa + PAGE_SIZE, MemFlags::RW)),
                    }
                }
                pa += PAGE_SIZE;
            }
        }
        ret
    }
}
