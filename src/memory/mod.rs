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
pub mod addr;
pub mod frame;
pub mod guest;
pub mod mem_protect;
pub mod memcache;
pub mod mmio;
pub mod shared;

#[cfg(test)]
mod tests;

use bitflags::bitflags;

pub use addr::{GuestPhysAddr, HostVirtAddr, PhysAddr};
pub use frame::Frame;
pub use mem_protect::{HostIdmap, HostMmu, OwnerId, PageState};
pub use memcache::HypMemcache;
pub use shared::HostShared;
pub use mmio::*;

use crate::arch::paging;

pub const PAGE_SIZE: usize = paging::PageSize::Size4K as usize;
pub const PAGE_SHIFT: usize = 12;

bitflags! {
    /// Mapping attributes understood by the LPAE tables, shared by the IOMMU
    /// domains and the guest stage-2.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const CACHE         = 1 << 2;
        const NOEXEC        = 1 << 3;
        const MMIO          = 1 << 4;
        const PRIV          = 1 << 5;
        /// Software bits kept in leaf descriptors, used to track page state.
        const SW0           = 1 << 6;
        const SW1           = 1 << 7;
    }
}

impl MemFlags {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const SW_MASK: Self = Self::SW0.union(Self::SW1);
}
