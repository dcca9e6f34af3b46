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
//! Host structures the hypervisor keeps pinned while it uses them.
//!
//! The host may write to a shared structure at any time, so every field is
//! accessed with a single volatile load or store through [`read_once!`] and
//! [`write_once!`], and never cached as a reference.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};

use super::addr::{hva_to_phys, HostVirtAddr, PhysAddr};
use super::mem_protect::HostMmu;
use crate::error::HvResult;

/// Load one field of a [`HostShared`] structure.
#[macro_export]
macro_rules! read_once {
    ($shared:expr, $field:ident) => {
        unsafe { core::ptr::addr_of!((*$shared.as_ptr()).$field).read_volatile() }
    };
}

/// Store one field of a [`HostShared`] structure.
#[macro_export]
macro_rules! write_once {
    ($shared:expr, $field:ident, $val:expr) => {
        unsafe { core::ptr::addr_of_mut!((*$shared.as_ptr()).$field).write_volatile($val) }
    };
}

pub struct HostShared<T> {
    paddr: PhysAddr,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for HostShared<T> {}
unsafe impl<T> Sync for HostShared<T> {}

impl<T> HostShared<T> {
    /// Pin the host structure at `hva`. The host must have shared the pages
    /// with the hypervisor beforehand.
    pub fn pin(host_mmu: &HostMmu, hva: HostVirtAddr) -> HvResult<Self> {
        let paddr = hva_to_phys(hva);
        if paddr == 0 || paddr % align_of::<T>() != 0 {
            return hv_result_err!(EINVAL);
        }
        let end = paddr.checked_add(size_of::<T>()).ok_or(hv_err!(EINVAL))?;
        if host_mmu.pin_shared_mem(paddr, end).is_err() {
            debug!("host structure at {:#x} is not shared", paddr);
            return hv_result_err!(EBUSY);
        }
        Ok(Self {
            paddr,
            _marker: PhantomData,
        })
    }

    /// Drop the pin. Called once, when the hypervisor forgets the structure.
    pub fn unpin(&self, host_mmu: &HostMmu) {
        host_mmu.unpin_shared_mem(self.paddr, self.paddr + size_of::<T>());
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    pub fn as_ptr(&self) -> *mut T {
        self.paddr as *mut T
    }
}
