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
//! PSCI for protected guests. Power state changes of vCPUs are decided here;
//! the host is only asked to schedule or stop them.
#![allow(non_snake_case)]

use super::pvm::{GuestHyperCall, HvcExit};
use super::smccc::SMCCC_VERSION_FUNC_ID;
use crate::arch::cpu::{mpidr_affinity_mask, MPIDR_HWID_BITMASK};
use crate::vcpu::{PowerState, ResetState, MP_STATE_STOPPED};

pub const PSCI_VERSION_1_1: u64 = 0x10001;

pub mod PsciFnId {
    pub const PSCI_VERSION: u32 = 0x8400_0000;
    pub const CPU_SUSPEND_32: u32 = 0x8400_0001;
    pub const CPU_SUSPEND_64: u32 = 0xc400_0001;
    pub const CPU_OFF: u32 = 0x8400_0002;
    pub const CPU_ON_32: u32 = 0x8400_0003;
    pub const CPU_ON_64: u32 = 0xc400_0003;
    pub const AFFINITY_INFO_32: u32 = 0x8400_0004;
    pub const AFFINITY_INFO_64: u32 = 0xc400_0004;
    pub const SYSTEM_OFF: u32 = 0x8400_0008;
    pub const SYSTEM_RESET: u32 = 0x8400_0009;
    pub const PSCI_FEATURES: u32 = 0x8400_000a;
    pub const SYSTEM_RESET2_32: u32 = 0x8400_0012;
    pub const SYSTEM_RESET2_64: u32 = 0xc400_0012;
}

pub mod PsciRet {
    pub const SUCCESS: u64 = 0;
    pub const NOT_SUPPORTED: u64 = -1i64 as u64;
    pub const INVALID_PARAMS: u64 = -2i64 as u64;
    pub const DENIED: u64 = -3i64 as u64;
    pub const ALREADY_ON: u64 = -4i64 as u64;
    pub const ON_PENDING: u64 = -5i64 as u64;
    pub const INTERNAL_FAILURE: u64 = -6i64 as u64;
}

fn valid_affinity(affinity: u64) -> bool {
    affinity & !MPIDR_HWID_BITMASK == 0
}

impl GuestHyperCall<'_> {
    pub(super) fn handle_psci(&mut self) -> HvcExit {
        use PsciFnId::*;

        match self.ctxt.function() {
            CPU_ON_32 => {
                self.narrow_to_32bit();
                self.psci_cpu_on()
            }
            CPU_ON_64 => self.psci_cpu_on(),
            CPU_OFF => self.psci_cpu_off(),
            AFFINITY_INFO_32 => {
                self.narrow_to_32bit();
                self.psci_affinity_info()
            }
            AFFINITY_INFO_64 => self.psci_affinity_info(),
            PSCI_VERSION => self.resume(PSCI_VERSION_1_1, 0, 0, 0),
            PSCI_FEATURES => self.psci_features(),
            SYSTEM_RESET | CPU_SUSPEND_32 | CPU_SUSPEND_64 | SYSTEM_OFF | SYSTEM_RESET2_32
            | SYSTEM_RESET2_64 => HvcExit::ToHost,
            _ => self.resume(PsciRet::NOT_SUPPORTED, 0, 0, 0),
        }
    }

    fn narrow_to_32bit(&mut self) {
        for reg in &mut self.ctxt.regs[1..4] {
            *reg &= u32::MAX as u64;
        }
    }

    /// Hand the target to the host for scheduling once it is ON_PENDING.
    fn psci_cpu_on(&mut self) -> HvcExit {
        let cpu_id = self.ctxt.arg(1);
        if !valid_affinity(cpu_id) {
            return self.resume(PsciRet::INVALID_PARAMS, 0, 0, 0);
        }
        let Some(target) = self.vm.mpidr_to_vcpu(cpu_id) else {
            return self.resume(PsciRet::INVALID_PARAMS, 0, 0, 0);
        };

        // Two callers may race to power on the same target.
        if let Err(state) = target.try_power_on() {
            let ret = match PowerState::try_from(state) {
                Ok(PowerState::OnPending) => PsciRet::ON_PENDING,
                Ok(PowerState::On) => PsciRet::ALREADY_ON,
                _ => PsciRet::INTERNAL_FAILURE,
            };
            return self.resume(ret, 0, 0, 0);
        }

        target.set_reset_state(ResetState {
            pc: self.ctxt.arg(2),
            r0: self.ctxt.arg(3),
            be: self.ctxt.is_be(),
            pending: true,
        });
        debug!(
            "vm {:#x}: vcpu {} powers on vcpu {}",
            self.vm.handle(),
            self.vcpu.idx(),
            target.idx()
        );
        HvcExit::ToHost
    }

    fn psci_cpu_off(&mut self) -> HvcExit {
        if self.vcpu.mp_state() == MP_STATE_STOPPED {
            warn!("vcpu {}: CPU_OFF while stopped", self.vcpu.idx());
        }
        if self.vcpu.power_state() != PowerState::On {
            warn!("vcpu {}: CPU_OFF while not on", self.vcpu.idx());
        }
        self.vcpu.set_mp_state(MP_STATE_STOPPED);
        self.vcpu.set_power_state(PowerState::Off);
        HvcExit::ToHost
    }

    fn psci_affinity_info(&mut self) -> HvcExit {
        let target_affinity = self.ctxt.arg(1);
        let lowest_level = self.ctxt.arg(2);
        if !valid_affinity(target_affinity) || lowest_level > 3 {
            return self.resume(PsciRet::INVALID_PARAMS, 0, 0, 0);
        }
        let mask = mpidr_affinity_mask(lowest_level as u32);
        let target_affinity = target_affinity & mask;

        let mut matching = 0;
        let mut ret = PowerState::Off as u64;
        for vcpu in self.vm.vcpus().iter() {
            if vcpu.mpidr() & mask != target_affinity {
                continue;
            }
            matching += 1;
            match PowerState::try_from(vcpu.raw_power_state()) {
                Ok(PowerState::On) => {
                    ret = PowerState::On as u64;
                    break;
                }
                Ok(PowerState::OnPending) => ret = PowerState::OnPending as u64,
                Ok(PowerState::Off) => {}
                Err(_) => {
                    ret = PsciRet::INTERNAL_FAILURE;
                    break;
                }
            }
        }
        if matching == 0 {
            ret = PsciRet::INVALID_PARAMS;
        }
        self.resume(ret, 0, 0, 0)
    }

    fn psci_features(&mut self) -> HvcExit {
        use PsciFnId::*;

        let ret = match self.ctxt.arg(1) as u32 {
            PSCI_VERSION | CPU_SUSPEND_32 | CPU_SUSPEND_64 | CPU_OFF | CPU_ON_32 | CPU_ON_64
            | AFFINITY_INFO_32 | AFFINITY_INFO_64 | SYSTEM_OFF | SYSTEM_RESET | PSCI_FEATURES
            | SYSTEM_RESET2_32 | SYSTEM_RESET2_64 | SMCCC_VERSION_FUNC_ID => PsciRet::SUCCESS,
            _ => PsciRet::NOT_SUPPORTED,
        };
        self.resume(ret, 0, 0, 0)
    }
}
