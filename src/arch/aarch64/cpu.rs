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
//! CPU helpers: barriers, cache and TLB maintenance, delays.
//!
//! Everything that needs an EL2 instruction is only emitted for the real
//! target. Unit tests run as a normal process, where a full fence stands in
//! for the barriers and maintenance is a no-op.

#[cfg(all(target_arch = "aarch64", not(test)))]
use aarch64_cpu::{
    asm::barrier,
    registers::{Readable, Writeable, CNTFRQ_EL0, CNTPCT_EL0, MPIDR_EL1, VTTBR_EL2},
};
#[allow(unused_imports)]
use core::sync::atomic::{fence, Ordering};

use crate::memory::PhysAddr;

pub const MPIDR_HWID_BITMASK: u64 = 0xff00ffffff;
#[cfg(all(target_arch = "aarch64", not(test)))]
const CACHE_LINE_SIZE: usize = 64;

pub fn mpidr_to_cpuid(mpidr: u64) -> u64 {
    mpidr & MPIDR_HWID_BITMASK
}

/// Affinity field `level` (0..=3) of an MPIDR value.
pub fn mpidr_affinity_level(mpidr: u64, level: u32) -> u64 {
    let shift = match level {
        0..=2 => level * 8,
        _ => 32,
    };
    (mpidr >> shift) & 0xff
}

/// Mask selecting the affinity fields at and above `level`.
pub fn mpidr_affinity_mask(level: u32) -> u64 {
    match level {
        0 => MPIDR_HWID_BITMASK,
        1 => MPIDR_HWID_BITMASK & !0xff,
        2 => MPIDR_HWID_BITMASK & !0xffff,
        _ => MPIDR_HWID_BITMASK & !0xffffff,
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
pub fn this_cpu_id() -> usize {
    mpidr_to_cpuid(MPIDR_EL1.get()) as _
}

#[cfg(not(all(target_arch = "aarch64", not(test))))]
pub fn this_cpu_id() -> usize {
    0
}

/// Order normal memory writes before any later write, e.g. a device doorbell.
pub fn wmb() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    barrier::dsb(barrier::ST);
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::Release);
}

/// Make table updates visible to a non-CPU observer before publishing them.
pub fn dma_wmb() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    barrier::dmb(barrier::OSHST);
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::Release);
}

pub fn dsb_ish() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    barrier::dsb(barrier::ISH);
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::SeqCst);
}

pub fn isb() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    barrier::isb(barrier::SY);
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::SeqCst);
}

/// Clean and invalidate `[addr, addr + size)` to the point of coherency.
#[allow(unused_variables)]
pub fn flush_dcache_to_poc(addr: PhysAddr, size: usize) {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let start = addr & !(CACHE_LINE_SIZE - 1);
        for line in (start..addr + size).step_by(CACHE_LINE_SIZE) {
            unsafe { core::arch::asm!("dc civac, {}", in(reg) line) };
        }
        barrier::dsb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::SeqCst);
}

pub fn wfe() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    aarch64_cpu::asm::wfe();
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    core::hint::spin_loop();
}

pub fn sev() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    aarch64_cpu::asm::sev();
}

/// Busy-wait for `us` microseconds using the generic timer.
pub fn udelay(us: u64) {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let freq = CNTFRQ_EL0.get();
        let start = CNTPCT_EL0.get();
        let ticks = freq * us / 1_000_000;
        while CNTPCT_EL0.get().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }
    #[cfg(test)]
    {
        let start = std::time::Instant::now();
        while start.elapsed().as_micros() < us as u128 {
            core::hint::spin_loop();
        }
    }
    #[cfg(all(not(target_arch = "aarch64"), not(test)))]
    for _ in 0..us {
        core::hint::spin_loop();
    }
}

/// Invalidate every stage-1 and stage-2 TLB entry tagged with the VMID of `vttbr`.
#[allow(unused_variables)]
pub fn tlb_flush_vmid(vttbr: u64) {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let old = VTTBR_EL2.get();
        VTTBR_EL2.set(vttbr);
        barrier::isb(barrier::SY);
        barrier::dsb(barrier::ISHST);
        unsafe { core::arch::asm!("tlbi vmalls12e1is") };
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
        VTTBR_EL2.set(old);
        barrier::isb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::SeqCst);
}

/// Invalidate the stage-2 entries of one IPA for the VMID of `vttbr`.
#[allow(unused_variables)]
pub fn tlb_flush_vmid_ipa(vttbr: u64, ipa: usize) {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        let old = VTTBR_EL2.get();
        VTTBR_EL2.set(vttbr);
        barrier::isb(barrier::SY);
        barrier::dsb(barrier::ISHST);
        unsafe {
            core::arch::asm!("tlbi ipas2e1is, {}", in(reg) (ipa >> 12) as u64);
            barrier::dsb(barrier::ISH);
            core::arch::asm!("tlbi vmalle1is");
        }
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
        VTTBR_EL2.set(old);
        barrier::isb(barrier::SY);
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    fence(Ordering::SeqCst);
}
