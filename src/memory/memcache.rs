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
//! Page caches exchanged with the host.
//!
//! A memcache is a stack of pages linked through their first word. The host
//! fills one with pages it owns and hands its address over; the hypervisor
//! takes ownership of each page before using it.

use super::addr::{phys_to_pfn, PhysAddr};
use super::mem_protect::HostMmu;
use crate::error::HvResult;

#[repr(C)]
#[derive(Debug, Default)]
pub struct HypMemcache {
    head: PhysAddr,
    nr_pages: usize,
}

impl HypMemcache {
    pub const fn new() -> Self {
        Self {
            head: 0,
            nr_pages: 0,
        }
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn is_empty(&self) -> bool {
        self.nr_pages == 0
    }

    /// # Safety
    ///
    /// `paddr` must be a page the caller owns and no longer uses.
    pub unsafe fn push(&mut self, paddr: PhysAddr) {
        (paddr as *mut PhysAddr).write_volatile(self.head);
        self.head = paddr;
        self.nr_pages += 1;
    }

    pub fn pop(&mut self) -> Option<PhysAddr> {
        if self.nr_pages == 0 {
            return None;
        }
        let paddr = self.head;
        self.head = unsafe { (paddr as *const PhysAddr).read_volatile() };
        self.nr_pages -= 1;
        Some(paddr)
    }

    /// Take pages from `host_mc` until `min_pages` are cached.
    pub fn topup(
        &mut self,
        min_pages: usize,
        host_mc: &mut HypMemcache,
        host_mmu: &HostMmu,
    ) -> HvResult {
        while self.nr_pages < min_pages {
            let paddr = host_mc.pop().ok_or(hv_err!(ENOMEM))?;
            if let Err(e) = host_mmu.donate_host_to_hyp(phys_to_pfn(paddr), 1, false) {
                warn!("memcache topup: page {:#x} refused: {:?}", paddr, e);
                return hv_result_err!(EINVAL);
            }
            unsafe { self.push(paddr) };
        }
        Ok(())
    }

    /// Return every cached page to the host through `host_mc`. Page
    /// contents are preserved so that the list links survive.
    pub fn drain_to_host(&mut self, host_mc: &mut HypMemcache, host_mmu: &HostMmu) {
        while let Some(paddr) = self.pop() {
            unsafe { host_mc.push(paddr) };
            if let Err(e) = host_mmu.donate_hyp_to_host_noclear(phys_to_pfn(paddr), 1) {
                warn!("memcache drain: page {:#x} not returned: {:?}", paddr, e);
            }
        }
    }
}
