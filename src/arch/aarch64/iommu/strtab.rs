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
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use tock_registers::interfaces::Readable;

use super::regs::*;
use crate::arch::cpu::wmb;
use crate::error::HvResult;
use crate::memory::addr::{align_up, phys_to_pfn};
use crate::memory::{Frame, HostMmu, PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// A stream table entry or a context descriptor: a run of little-endian
/// dwords in memory the device reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc(PhysAddr);

impl Desc {
    pub fn new(paddr: PhysAddr) -> Self {
        Self(paddr)
    }

    pub fn paddr(&self) -> PhysAddr {
        self.0
    }

    fn dword(&self, i: usize) -> &AtomicU64 {
        unsafe { &*((self.0 + i * 8) as *const AtomicU64) }
    }

    pub fn get(&self, i: usize) -> u64 {
        u64::from_le(self.dword(i).load(Ordering::Acquire))
    }

    /// Single-copy atomic store, the device may be reading the entry.
    pub fn set(&self, i: usize, val: u64) {
        self.dword(i).store(val.to_le(), Ordering::Release);
    }
}

pub struct StreamTable {
    base: PhysAddr,
    split: u32,
    num_entries: u32,
    num_l1_entries: u32,
    leaves: Vec<Frame>,
}

impl StreamTable {
    /// Take over the table the host has programmed in `STRTAB_BASE{,_CFG}`
    /// and disable every entry.
    pub fn from_regs(rp: &RegisterPage, host_mmu: &HostMmu) -> HvResult<Self> {
        let base = rp.STRTAB_BASE.get();
        if base & !(STRTAB_BASE_ADDR_MASK | STRTAB_BASE_RA) != 0 {
            return hv_result_err!(EINVAL, "smmu: bad STRTAB_BASE");
        }
        let cfg = rp.STRTAB_BASE_CFG.get() as u64;
        if cfg & !(STRTAB_BASE_CFG_FMT | STRTAB_BASE_CFG_SPLIT | STRTAB_BASE_CFG_LOG2SIZE) != 0 {
            return hv_result_err!(EINVAL, "smmu: bad STRTAB_BASE_CFG");
        }

        let fmt = field_get(STRTAB_BASE_CFG_FMT, cfg);
        let split = field_get(STRTAB_BASE_CFG_SPLIT, cfg) as u32;
        let log2size = field_get(STRTAB_BASE_CFG_LOG2SIZE, cfg) as u32;
        let num_entries = 1u32 << log2size;

        let (num_l1_entries, size) = match fmt {
            STRTAB_BASE_CFG_FMT_LINEAR => {
                if split != 0 {
                    return hv_result_err!(EINVAL);
                }
                (num_entries, num_entries as usize * STRTAB_STE_DWORDS * 8)
            }
            STRTAB_BASE_CFG_FMT_2LVL => {
                if !matches!(split, 6 | 8 | 10) {
                    return hv_result_err!(EINVAL);
                }
                let l1 = 1u32 << log2size.saturating_sub(split);
                (l1, l1 as usize * STRTAB_L1_DESC_DWORDS * 8)
            }
            _ => return hv_result_err!(EINVAL),
        };

        let base = (base & STRTAB_BASE_ADDR_MASK) as PhysAddr;
        let size = align_up(size);
        if base & (PAGE_SIZE - 1) != 0 {
            return hv_result_err!(EINVAL, "smmu: stream table not page aligned");
        }
        host_mmu.donate_host_to_hyp(phys_to_pfn(base), size >> PAGE_SHIFT, false)?;

        // Disable all STEs
        unsafe { core::ptr::write_bytes(base as *mut u8, 0, size) };
        info!(
            "smmu: stream table {:#x}, {} entries, split {}",
            base, num_entries, split
        );
        Ok(Self {
            base,
            split,
            num_entries,
            num_l1_entries,
            leaves: Vec::new(),
        })
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    fn l1_desc(&self, idx: u32) -> Desc {
        Desc::new(self.base + idx as usize * STRTAB_L1_DESC_DWORDS * 8)
    }

    fn alloc_l2(&mut self, idx: u32) -> HvResult {
        // Leaf tables must be page-sized
        if self.split + (STRTAB_STE_DWORDS.trailing_zeros()) + 3 != PAGE_SHIFT as u32 {
            return hv_result_err!(EINVAL);
        }
        let span = (self.split + 1) as u64;
        let table = Frame::new_zero()?;
        let l2ptr = table.start_paddr() as u64;
        if l2ptr & !STRTAB_L1_DESC_L2PTR_MASK != 0 {
            return hv_result_err!(EINVAL);
        }
        // Ensure the empty stream table is visible before the descriptor write.
        wmb();
        self.l1_desc(idx).set(0, l2ptr | span);
        self.leaves.push(table);
        Ok(())
    }

    /// The entry of `sid`, allocating its leaf table on first use.
    pub fn ste(&mut self, sid: u32) -> Option<Desc> {
        if sid >= self.num_entries {
            return None;
        }
        if self.split == 0 {
            return Some(Desc::new(
                self.base + sid as usize * STRTAB_STE_DWORDS * 8,
            ));
        }

        let idx = sid >> self.split;
        if idx >= self.num_l1_entries {
            return None;
        }
        let mut l1std = self.l1_desc(idx).get(0);
        if l1std == 0 {
            if let Err(e) = self.alloc_l2(idx) {
                warn!("smmu: no leaf table for sid {:#x}: {:?}", sid, e);
                return None;
            }
            l1std = self.l1_desc(idx).get(0);
        }

        let span = field_get(STRTAB_L1_DESC_SPAN, l1std);
        let idx = (sid & ((1 << self.split) - 1)) as u64;
        if span == 0 || idx >= 1 << (span - 1) {
            return None;
        }
        let l2 = (l1std & STRTAB_L1_DESC_L2PTR_MASK) as PhysAddr;
        Some(Desc::new(l2 + idx as usize * STRTAB_STE_DWORDS * 8))
    }
}
