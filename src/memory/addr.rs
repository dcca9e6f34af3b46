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
//! Address types. The hypervisor maps physical memory 1:1, so a physical
//! address is also a valid pointer inside the hypervisor.

use super::{PAGE_SHIFT, PAGE_SIZE};

pub type PhysAddr = usize;
pub type GuestPhysAddr = usize;
pub type HostVirtAddr = usize;

pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

pub const fn is_aligned_to(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

pub const fn phys_to_pfn(paddr: PhysAddr) -> usize {
    paddr >> PAGE_SHIFT
}

pub const fn pfn_to_phys(pfn: usize) -> PhysAddr {
    pfn << PAGE_SHIFT
}

/// Host kernel virtual addresses handed over by the host are resolved
/// through its linear map, which is the identity in this hypervisor.
pub const fn hva_to_phys(hva: HostVirtAddr) -> PhysAddr {
    hva
}

pub const fn phys_to_virt(paddr: PhysAddr) -> *mut u8 {
    paddr as *mut u8
}
