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
//! VMSAv8-64 long descriptor encoding, shared by the IOMMU domains and the
//! guest stage-2 tables.
use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;

use super::paging::IoPgtableFmt;
use crate::memory::MemFlags;

pub type Iopte = u64;

bitflags! {
    /// Memory attribute fields in the VMSAv8-64 translation table format descriptors.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescriptorAttr: u64 {
        /// Whether the descriptor is valid.
        const VALID =       1 << 0;
        /// The descriptor gives the address of the next level of translation table or 4KB page.
        /// (not a 2M, 1G block)
        const NON_BLOCK =   1 << 1;
        /// Memory attributes index field.
        const ATTR      =   0b1111 << 2;
        /// Stage-1 only: non-secure output address.
        const NS        =   1 << 5;
        /// Access permission: accessable at EL0/1, Read / Write.
        const S2AP_R    =   1 << 6;
        /// Access permission: accessable at EL0/1, Write.
        const S2AP_W    =   1 << 7;
        /// Shareability: Inner Shareable (otherwise Outer Shareable).
        const INNER     =   1 << 8;
        /// Shareability: Inner or Outer Shareable (otherwise Non-shareable).
        const SHAREABLE =   1 << 9;
        /// The Access flag.
        const AF =          1 << 10;
        /// Stage-1 only: not global.
        const NG =          1 << 11;
        /// Execute never, both privilege levels.
        const XN =          3 << 53;
        /// Software: the entry has been cleaned to the point of coherency.
        const SW_SYNC =     1 << 55;
        /// Software: page state bits carried by leaf entries.
        const SW_STATE =    3 << 56;
        /// Table descriptors only: next level is non-secure.
        const NSTABLE =     1 << 63;
    }
}

impl DescriptorAttr {
    /// Stage-1 AP[1]: accessible from EL0.
    pub const AP_UNPRIV: Self = Self::S2AP_R;
    /// Stage-1 AP[2]: read only.
    pub const AP_RDONLY: Self = Self::S2AP_W;
    pub const SH_OS: Self = Self::SHAREABLE;
    pub const SH_IS: Self = Self::SHAREABLE.union(Self::INNER);
}

numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub enum MemType {
        Device = 1,
        NonCacheable = 5,
        Normal = 15,
    }
}

pub const PTE_TYPE_MASK: Iopte = 0x3;
pub const PTE_TYPE_BLOCK: Iopte = 1;
pub const PTE_TYPE_TABLE: Iopte = 3;
pub const PTE_TYPE_PAGE: Iopte = 3;

/// Output address bits [47:12]; bits [51:48] are folded into [15:12] for 64K granules.
pub const PTE_ADDR_MASK: Iopte = 0x0000_ffff_ffff_f000;
pub const PTE_ATTR_LO_MASK: Iopte = 0x3ff << 2;
/// XN plus the software state. The contiguous hint is dropped on block split.
pub const PTE_ATTR_HI_MASK: Iopte = (6 << 52) | DescriptorAttr::SW_STATE.bits();
pub const PTE_ATTR_MASK: Iopte = PTE_ATTR_LO_MASK | PTE_ATTR_HI_MASK;
pub const PTE_SW_STATE_SHIFT: u32 = 56;
const PTE_ATTRINDX_SHIFT: u32 = 2;

/// Invalid entry marking an IPA the guest registered as MMIO.
pub const PTE_MMIO_NOTE: Iopte = 0xaa << 2;

pub const MAX_LEVELS: usize = 4;

pub const TCR_TG0_4K: u64 = 0;
pub const TCR_TG0_64K: u64 = 1;
pub const TCR_TG0_16K: u64 = 2;
pub const TCR_TG1_16K: u64 = 1;
pub const TCR_TG1_4K: u64 = 2;
pub const TCR_TG1_64K: u64 = 3;

pub const TCR_SH_NS: u64 = 0;
pub const TCR_SH_OS: u64 = 2;
pub const TCR_SH_IS: u64 = 3;

pub const TCR_RGN_NC: u64 = 0;
pub const TCR_RGN_WBWA: u64 = 1;

pub const VTCR_SL0_MASK: u64 = 0x3;

pub const MAIR_ATTR_DEVICE: u64 = 0x04;
pub const MAIR_ATTR_NC: u64 = 0x44;
pub const MAIR_ATTR_INC_OWBRWA: u64 = 0xf4;
pub const MAIR_ATTR_WBRWA: u64 = 0xff;
pub const MAIR_ATTR_IDX_NC: u64 = 0;
pub const MAIR_ATTR_IDX_CACHE: u64 = 1;
pub const MAIR_ATTR_IDX_DEV: u64 = 2;
pub const MAIR_ATTR_IDX_INC_OCACHE: u64 = 3;

pub const fn mair_attr_shift(idx: u64) -> u64 {
    idx << 3
}

pub const MAIR_DEFAULT: u64 = (MAIR_ATTR_NC << mair_attr_shift(MAIR_ATTR_IDX_NC))
    | (MAIR_ATTR_WBRWA << mair_attr_shift(MAIR_ATTR_IDX_CACHE))
    | (MAIR_ATTR_DEVICE << mair_attr_shift(MAIR_ATTR_IDX_DEV))
    | (MAIR_ATTR_INC_OWBRWA << mair_attr_shift(MAIR_ATTR_IDX_INC_OCACHE));

/// TCR/VTCR PS encoding of an output address size.
pub fn oas_to_ps(oas: usize) -> Option<u64> {
    Some(match oas {
        32 => 0,
        36 => 1,
        40 => 2,
        42 => 3,
        44 => 4,
        48 => 5,
        52 => 6,
        _ => return None,
    })
}

pub fn iopte_type(pte: Iopte) -> Iopte {
    pte & PTE_TYPE_MASK
}

pub fn iopte_valid(pte: Iopte) -> bool {
    pte & DescriptorAttr::VALID.bits() != 0
}

pub fn iopte_leaf(pte: Iopte, lvl: usize) -> bool {
    if lvl == MAX_LEVELS - 1 {
        iopte_type(pte) == PTE_TYPE_PAGE
    } else {
        iopte_type(pte) == PTE_TYPE_BLOCK
    }
}

pub fn iopte_table(pte: Iopte, lvl: usize) -> bool {
    lvl < MAX_LEVELS - 1 && iopte_type(pte) == PTE_TYPE_TABLE
}

pub fn iopte_prot(pte: Iopte) -> Iopte {
    pte & PTE_ATTR_MASK
}

/// Encode mapping attributes for a leaf entry, without the type bits.
pub fn prot_to_pte(fmt: IoPgtableFmt, arm_ns: bool, prot: MemFlags) -> Iopte {
    let mut pte = DescriptorAttr::empty();
    match fmt {
        IoPgtableFmt::Lpae64S1 => {
            pte |= DescriptorAttr::NG;
            if !prot.contains(MemFlags::WRITE) && prot.contains(MemFlags::READ) {
                pte |= DescriptorAttr::AP_RDONLY;
            }
            if !prot.contains(MemFlags::PRIV) {
                pte |= DescriptorAttr::AP_UNPRIV;
            }
        }
        IoPgtableFmt::Lpae64S2 => {
            if prot.contains(MemFlags::READ) {
                pte |= DescriptorAttr::S2AP_R;
            }
            if prot.contains(MemFlags::WRITE) {
                pte |= DescriptorAttr::S2AP_W;
            }
        }
    }

    let mut bits = pte.bits();
    match fmt {
        IoPgtableFmt::Lpae64S2 => {
            let mem_type = if prot.contains(MemFlags::MMIO) {
                MemType::Device
            } else if prot.contains(MemFlags::CACHE) {
                MemType::Normal
            } else {
                MemType::NonCacheable
            };
            bits |= (mem_type as u64) << PTE_ATTRINDX_SHIFT;
        }
        IoPgtableFmt::Lpae64S1 => {
            if prot.contains(MemFlags::MMIO) {
                bits |= MAIR_ATTR_IDX_DEV << PTE_ATTRINDX_SHIFT;
            } else if prot.contains(MemFlags::CACHE) {
                bits |= MAIR_ATTR_IDX_CACHE << PTE_ATTRINDX_SHIFT;
            }
        }
    }

    let mut pte = DescriptorAttr::from_bits_retain(bits);
    if prot.contains(MemFlags::CACHE) {
        pte |= DescriptorAttr::SH_IS;
    } else {
        pte |= DescriptorAttr::SH_OS;
    }
    if prot.contains(MemFlags::NOEXEC) {
        pte |= DescriptorAttr::XN;
    }
    if arm_ns {
        pte |= DescriptorAttr::NS;
    }
    pte |= DescriptorAttr::AF;

    let sw = (prot.intersection(MemFlags::SW_MASK).bits() >> MemFlags::SW0.bits().trailing_zeros())
        << PTE_SW_STATE_SHIFT;
    pte.bits() | sw
}

/// Decode the stage-2 permissions and software state of a valid leaf.
pub fn s2_pte_to_prot(pte: Iopte) -> MemFlags {
    let attr = DescriptorAttr::from_bits_truncate(pte);
    let mut flags = MemFlags::empty();
    if attr.contains(DescriptorAttr::S2AP_R) {
        flags |= MemFlags::READ;
    }
    if attr.contains(DescriptorAttr::S2AP_W) {
        flags |= MemFlags::WRITE;
    }
    if attr.contains(DescriptorAttr::XN) {
        flags |= MemFlags::NOEXEC;
    }
    match MemType::try_from((pte & DescriptorAttr::ATTR.bits()) >> PTE_ATTRINDX_SHIFT) {
        Ok(MemType::Device) => flags |= MemFlags::MMIO,
        Ok(MemType::Normal) => flags |= MemFlags::CACHE,
        _ => {}
    }
    flags | pte_sw_state(pte)
}

/// The software state bits of a leaf, as `MemFlags::SW0 | MemFlags::SW1`.
pub fn pte_sw_state(pte: Iopte) -> MemFlags {
    let sw = (pte & DescriptorAttr::SW_STATE.bits()) >> PTE_SW_STATE_SHIFT;
    MemFlags::from_bits_truncate(sw << MemFlags::SW0.bits().trailing_zeros())
}
