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
//! HVCs issued by guests.
//!
//! A guest call is either handled here and the guest resumes with its return
//! registers set, or it is left for the host. When the hypervisor needs the
//! host to map memory or refill a memcache first, it queues a request, rewinds
//! the guest over the HVC and exits; the guest then retries the same call.

use super::smccc::*;
use crate::error::HvErrorNum;
use crate::memory::addr::is_aligned;
use crate::memory::{HostMmu, HypMemcache, PAGE_SIZE};
use crate::vcpu::{HypRequest, HypVcpu, MemDest, VcpuContext};
use crate::vm::PkvmVm;

/// Where the vCPU goes after a guest HVC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvcExit {
    /// Handled, back to the guest.
    Resume,
    /// The host finishes the call.
    ToHost,
    /// The host has to service the request ring before the guest retries.
    HypReq,
}

/// One guest HVC being handled on the vCPU that issued it.
pub struct GuestHyperCall<'a> {
    host_mmu: &'a HostMmu,
    smc: &'a dyn SecureMonitor,
    trng_available: bool,
    pub(super) vm: &'a PkvmVm,
    pub(super) vcpu: &'a HypVcpu,
    /// Written back to the vCPU once the call is done.
    pub(super) ctxt: VcpuContext,
}

impl<'a> GuestHyperCall<'a> {
    pub fn new(
        host_mmu: &'a HostMmu,
        smc: &'a dyn SecureMonitor,
        trng_available: bool,
        vm: &'a PkvmVm,
        vcpu: &'a HypVcpu,
    ) -> Self {
        Self {
            host_mmu,
            smc,
            trng_available,
            vm,
            vcpu,
            ctxt: vcpu.context(),
        }
    }

    pub fn handle(mut self) -> HvcExit {
        let fid = self.ctxt.function();
        let exit = match self.vcpu.is_protected() {
            true => self.handle_pvm(fid),
            false => self.handle_host_guest(fid),
        };
        trace!("vcpu {}: hvc {:#x} -> {:?}", self.vcpu.idx(), fid, exit);
        self.vcpu.set_context(self.ctxt);
        exit
    }

    fn arg(&self, n: usize) -> u64 {
        self.ctxt.arg(n)
    }

    pub(super) fn resume(&mut self, a0: u64, a1: u64, a2: u64, a3: u64) -> HvcExit {
        self.ctxt.set_retval(a0, a1, a2, a3);
        HvcExit::Resume
    }

    fn guest_err(&mut self) -> HvcExit {
        self.resume(SMCCC_RET_INVALID_PARAMETER, 0, 0, 0)
    }

    fn handle_pvm(&mut self, fid: u32) -> HvcExit {
        match fid {
            SMCCC_VERSION_FUNC_ID => self.resume(SMCCC_VERSION_1_1, 0, 0, 0),
            VENDOR_HYP_CALL_UID_FUNC_ID => {
                let [a0, a1, a2, a3] = VENDOR_HYP_UID_KVM;
                self.resume(a0, a1, a2, a3)
            }
            KvmFnId::FEATURES => self.resume(KVM_FEATURES, 0, 0, 0),
            KvmFnId::MMIO_GUARD_ENROLL => {
                self.vm.stage2().enroll_mmio_guard();
                self.resume(SMCCC_RET_SUCCESS, 0, 0, 0)
            }
            KvmFnId::MMIO_GUARD_MAP | KvmFnId::MMIO_RGUARD_MAP => self.install_ioguard(fid),
            KvmFnId::MMIO_GUARD_UNMAP | KvmFnId::MMIO_RGUARD_UNMAP => self.remove_ioguard(fid),
            KvmFnId::MMIO_GUARD_INFO | KvmFnId::HYP_MEMINFO => self.meminfo(),
            KvmFnId::MEM_SHARE => self.mem_share(),
            KvmFnId::MEM_UNSHARE => self.mem_unshare(),
            KvmFnId::MEM_RELINQUISH => self.mem_relinquish(),
            fid if is_trng_call(fid) => match self.trng_available {
                true => self.forward_trng(fid),
                false => self.resume(SMCCC_RET_NOT_SUPPORTED, 0, 0, 0),
            },
            _ => self.handle_psci(),
        }
    }

    /// Guests of the host only get the memory info and relinquish calls.
    fn handle_host_guest(&mut self, fid: u32) -> HvcExit {
        match fid {
            KvmFnId::HYP_MEMINFO => self.meminfo(),
            KvmFnId::MEM_RELINQUISH => self.mem_relinquish(),
            _ => HvcExit::ToHost,
        }
    }

    /// Ask the host to refill the vCPU memcache. None when the ring is full.
    fn request_memcache(&mut self) -> Option<HvcExit> {
        let nr_pages = self.vm.params().memcache_min_pages as u32;
        self.vcpu.hyp_req_reserve(HypRequest::Mem {
            dest: MemDest::VcpuMemcache,
            nr_pages,
        })?;
        self.ctxt.pc = self.ctxt.pc.wrapping_sub(4);
        Some(HvcExit::HypReq)
    }

    /// Ask the host to map `[ipa, ipa + nr pages)` and to refill the memcache
    /// while at it.
    fn request_map(&mut self, ipa: u64, nr_pages: u64) -> Option<HvcExit> {
        self.vcpu.hyp_req_reserve(HypRequest::Map {
            guest_ipa: ipa,
            size: nr_pages * PAGE_SIZE as u64,
        })?;
        self.request_memcache()
    }

    /// Legacy guests pass 0 pages and mean 1.
    fn share_args(&self) -> Option<(usize, usize)> {
        let (ipa, nr_pages, arg3) = (self.arg(1), self.arg(2), self.arg(3));
        let nr_pages = nr_pages.max(1);
        if arg3 != 0 || !is_aligned(ipa as usize) {
            return None;
        }
        Some((ipa as usize, nr_pages as usize))
    }

    fn with_memcache<R>(&self, f: impl FnOnce(&mut HypMemcache) -> R) -> R {
        f(&mut self.vcpu.memcache())
    }

    fn mem_share(&mut self) -> HvcExit {
        let Some((ipa, nr_pages)) = self.share_args() else {
            return self.guest_err();
        };
        let min_pages = self.vm.params().memcache_min_pages;
        let ret = self.with_memcache(|mc| {
            self.vm
                .stage2()
                .guest_share_host(self.host_mmu, mc, min_pages, ipa, nr_pages)
        });
        match ret {
            Ok(nr_shared) => {
                self.vm.add_shared_mem((nr_shared * PAGE_SIZE) as u64);
                self.resume(SMCCC_RET_SUCCESS, nr_shared as u64, 0, 0)
            }
            Err(e) if e.num() == HvErrorNum::EFAULT => self
                .request_map(ipa as u64, nr_pages as u64)
                .unwrap_or_else(|| self.guest_err()),
            Err(e) if e.num() == HvErrorNum::ENOMEM => {
                self.request_memcache().unwrap_or_else(|| self.guest_err())
            }
            Err(_) => self.guest_err(),
        }
    }

    fn mem_unshare(&mut self) -> HvcExit {
        let Some((ipa, nr_pages)) = self.share_args() else {
            return self.guest_err();
        };
        let min_pages = self.vm.params().memcache_min_pages;
        let ret = self.with_memcache(|mc| {
            self.vm
                .stage2()
                .guest_unshare_host(self.host_mmu, mc, min_pages, ipa, nr_pages)
        });
        match ret {
            Ok(nr_unshared) => {
                self.vm.sub_shared_mem((nr_unshared * PAGE_SIZE) as u64);
                self.resume(SMCCC_RET_SUCCESS, nr_unshared as u64, 0, 0)
            }
            Err(e) if e.num() == HvErrorNum::ENOMEM => {
                self.request_memcache().unwrap_or_else(|| self.guest_err())
            }
            Err(_) => self.guest_err(),
        }
    }

    /// Range variants reject a non-zero third argument, legacy ones guard
    /// a single page and ignore the rest.
    fn guard_args(&self, fid: u32, legacy: u32) -> Option<(usize, usize)> {
        let (ipa, nr_pages) = (self.arg(1) as usize, self.arg(2) as usize);
        if fid == legacy {
            return Some((ipa, 1));
        }
        (self.arg(3) == 0).then_some((ipa, nr_pages))
    }

    fn install_ioguard(&mut self, fid: u32) -> HvcExit {
        let Some((ipa, nr_pages)) = self.guard_args(fid, KvmFnId::MMIO_GUARD_MAP) else {
            return self.guest_err();
        };
        let mut nr_guarded = 0;
        let ret = self.with_memcache(|mc| {
            self.vm
                .stage2()
                .install_ioguard(mc, ipa, nr_pages, &mut nr_guarded)
        });
        let retval = match ret {
            Ok(()) => SMCCC_RET_SUCCESS,
            Err(e) if e.num() == HvErrorNum::ENOMEM => match self.request_memcache() {
                Some(exit) => return exit,
                None => SMCCC_RET_INVALID_PARAMETER,
            },
            Err(_) => SMCCC_RET_INVALID_PARAMETER,
        };
        self.resume(retval, nr_guarded as u64, 0, 0)
    }

    fn remove_ioguard(&mut self, fid: u32) -> HvcExit {
        let Some((ipa, nr_pages)) = self.guard_args(fid, KvmFnId::MMIO_GUARD_UNMAP) else {
            return self.guest_err();
        };
        match self.vm.stage2().remove_ioguard(ipa, nr_pages) {
            Ok(nr_unguarded) => self.resume(SMCCC_RET_SUCCESS, nr_unguarded as u64, 0, 0),
            Err(_) => self.guest_err(),
        }
    }

    fn meminfo(&mut self) -> HvcExit {
        if self.arg(1) != 0 || self.arg(2) != 0 || self.arg(3) != 0 {
            return self.guest_err();
        }
        self.resume(PAGE_SIZE as u64, KVM_FUNC_HAS_RANGE, 0, 0)
    }

    fn mem_relinquish(&mut self) -> HvcExit {
        if self.arg(2) != 0 || self.arg(3) != 0 {
            return self.guest_err();
        }
        let ipa = self.arg(1) as usize;
        let protected = self.vm.is_protected();
        let ret = self.with_memcache(|mc| {
            self.vm
                .stage2()
                .guest_relinquish_to_host(self.host_mmu, mc, protected, ipa)
        });
        match ret {
            // The host reclaims the page.
            Ok(pa) if pa != 0 => HvcExit::ToHost,
            // Nothing was mapped there.
            Ok(_) => self.resume(SMCCC_RET_SUCCESS, 0, 0, 0),
            Err(e) if e.num() == HvErrorNum::ENOMEM => {
                self.request_memcache().unwrap_or_else(|| self.guest_err())
            }
            Err(_) => self.guest_err(),
        }
    }

    /// The host cannot be trusted with randomness for protected guests.
    fn forward_trng(&mut self, fid: u32) -> HvcExit {
        let arg1 = match fid {
            TrngFnId::FEATURES | TrngFnId::RND32 | TrngFnId::RND64 => self.arg(1),
            _ => 0,
        };
        let [a0, a1, a2, a3] = self.smc.smc(fid, [arg1, 0, 0]);
        self.resume(a0, a1, a2, a3)
    }
}
