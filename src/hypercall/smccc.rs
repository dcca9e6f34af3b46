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
//! SMC Calling Convention identifiers and the secure monitor interface.
#![allow(non_snake_case)]

pub const SMCCC_VERSION_FUNC_ID: u32 = 0x8000_0000;
pub const SMCCC_VERSION_1_1: u64 = 0x10001;
pub const VENDOR_HYP_CALL_UID_FUNC_ID: u32 = 0x8600_ff01;

/// UID of the KVM vendor hypervisor service, 28b46fb6-2ec5-11e9-a9ca-4b564d003a74.
pub const VENDOR_HYP_UID_KVM: [u64; 4] = [0xb66f_b428, 0xe911_c52e, 0x564b_caa9, 0x743a_004d];

pub const SMCCC_RET_SUCCESS: u64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: u64 = -1i64 as u64;
pub const SMCCC_RET_INVALID_PARAMETER: u64 = -2i64 as u64;

/// Range variants of the guard and share calls exist.
pub const KVM_FUNC_HAS_RANGE: u64 = 1;

/// Function numbers inside the KVM vendor service.
pub mod KvmFunc {
    pub const FEATURES: u32 = 0;
    pub const HYP_MEMINFO: u32 = 2;
    pub const MEM_SHARE: u32 = 3;
    pub const MEM_UNSHARE: u32 = 4;
    pub const MMIO_GUARD_INFO: u32 = 5;
    pub const MMIO_GUARD_ENROLL: u32 = 6;
    pub const MMIO_GUARD_MAP: u32 = 7;
    pub const MMIO_GUARD_UNMAP: u32 = 8;
    pub const MEM_RELINQUISH: u32 = 9;
    pub const MMIO_RGUARD_MAP: u32 = 10;
    pub const MMIO_RGUARD_UNMAP: u32 = 11;
}

const fn kvm_fast_call64(func: u32) -> u32 {
    0xc600_0000 | func
}

pub mod KvmFnId {
    use super::{kvm_fast_call64, KvmFunc};

    pub const FEATURES: u32 = 0x8600_0000 | KvmFunc::FEATURES;
    pub const HYP_MEMINFO: u32 = kvm_fast_call64(KvmFunc::HYP_MEMINFO);
    pub const MEM_SHARE: u32 = kvm_fast_call64(KvmFunc::MEM_SHARE);
    pub const MEM_UNSHARE: u32 = kvm_fast_call64(KvmFunc::MEM_UNSHARE);
    pub const MMIO_GUARD_INFO: u32 = kvm_fast_call64(KvmFunc::MMIO_GUARD_INFO);
    pub const MMIO_GUARD_ENROLL: u32 = kvm_fast_call64(KvmFunc::MMIO_GUARD_ENROLL);
    pub const MMIO_GUARD_MAP: u32 = kvm_fast_call64(KvmFunc::MMIO_GUARD_MAP);
    pub const MMIO_GUARD_UNMAP: u32 = kvm_fast_call64(KvmFunc::MMIO_GUARD_UNMAP);
    pub const MEM_RELINQUISH: u32 = kvm_fast_call64(KvmFunc::MEM_RELINQUISH);
    pub const MMIO_RGUARD_MAP: u32 = kvm_fast_call64(KvmFunc::MMIO_RGUARD_MAP);
    pub const MMIO_RGUARD_UNMAP: u32 = kvm_fast_call64(KvmFunc::MMIO_RGUARD_UNMAP);
}

/// What `FEATURES` reports to protected guests.
pub const KVM_FEATURES: u64 = (1 << KvmFunc::FEATURES)
    | (1 << KvmFunc::HYP_MEMINFO)
    | (1 << KvmFunc::MEM_SHARE)
    | (1 << KvmFunc::MEM_UNSHARE)
    | (1 << KvmFunc::MMIO_GUARD_INFO)
    | (1 << KvmFunc::MMIO_GUARD_ENROLL)
    | (1 << KvmFunc::MMIO_GUARD_MAP)
    | (1 << KvmFunc::MMIO_GUARD_UNMAP)
    | (1 << KvmFunc::MMIO_RGUARD_MAP)
    | (1 << KvmFunc::MMIO_RGUARD_UNMAP)
    | (1 << KvmFunc::MEM_RELINQUISH);

pub mod TrngFnId {
    pub const VERSION: u32 = 0x8400_0050;
    pub const FEATURES: u32 = 0x8400_0051;
    pub const GET_UUID: u32 = 0x8400_0052;
    pub const RND32: u32 = 0x8400_0053;
    pub const RND64: u32 = 0xc400_0053;
}

pub fn is_trng_call(fid: u32) -> bool {
    matches!(
        fid,
        TrngFnId::VERSION..=TrngFnId::RND32 | TrngFnId::RND64
    )
}

/// Firmware below the hypervisor, reached with `smc`.
pub trait SecureMonitor: Send + Sync {
    fn smc(&self, fid: u32, args: [u64; 3]) -> [u64; 4];
}

/// The EL3 firmware of the running system.
#[cfg(all(target_arch = "aarch64", not(test)))]
pub struct ArmSecureMonitor;

#[cfg(all(target_arch = "aarch64", not(test)))]
impl SecureMonitor for ArmSecureMonitor {
    fn smc(&self, fid: u32, args: [u64; 3]) -> [u64; 4] {
        let mut ret = [fid as u64, args[0], args[1], args[2]];
        unsafe {
            core::arch::asm!(
                "smc #0",
                inout("x0") ret[0],
                inout("x1") ret[1],
                inout("x2") ret[2],
                inout("x3") ret[3],
                options(nomem, nostack)
            );
        }
        ret
    }
}
