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
//! The hypervisor as a value: every object that lives as long as the system
//! does, and the entry points the exception vectors call into.

use alloc::sync::Arc;

use crate::arch::iommu::KvmIommu;
use crate::config::HvSystemConfig;
use crate::error::HvResult;
use crate::hypercall::{GuestHyperCall, HvcExit, HyperCall, HyperCallResult, SecureMonitor};
use crate::memory::{GuestPhysAddr, HostMmu, MMIOAccess, PhysAddr};
use crate::percpu::{PerCpu, PerCpuSet};
use crate::vm::{VmParams, VmRegistry};

pub struct Hypervisor {
    config: HvSystemConfig,
    host_mmu: Arc<HostMmu>,
    iommu: Arc<KvmIommu>,
    registry: VmRegistry,
    cpus: PerCpuSet,
    smc: Arc<dyn SecureMonitor>,
}

impl Hypervisor {
    pub fn new(config: HvSystemConfig, smc: Arc<dyn SecureMonitor>) -> HvResult<Self> {
        config.validate()?;
        let host_mmu = Arc::new(HostMmu::new(&config.ram_ranges()));
        let iommu = KvmIommu::init(&config.smmu_configs(), host_mmu.clone())?;
        let registry = VmRegistry::new(host_mmu.clone(), VmParams::from_config(&config));
        let cpus = PerCpuSet::new(config.num_cpus as usize);
        info!(
            "hypervisor up: {} cpus, {} RAM regions, {} SMMUs",
            cpus.len(),
            config.ram_regions().len(),
            iommu.smmus().len()
        );
        Ok(Self {
            config,
            host_mmu,
            iommu,
            registry,
            cpus,
            smc,
        })
    }

    pub fn config(&self) -> &HvSystemConfig {
        &self.config
    }

    pub fn host_mmu(&self) -> &HostMmu {
        &self.host_mmu
    }

    pub fn iommu(&self) -> &KvmIommu {
        &self.iommu
    }

    pub fn registry(&self) -> &VmRegistry {
        &self.registry
    }

    pub fn cpu(&self, cpu: usize) -> HvResult<&PerCpu> {
        self.cpus.get(cpu)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// A control call from the host running on `cpu`.
    pub fn handle_host_hcall(&self, cpu: usize, code: u64, args: [u64; 6]) -> HyperCallResult {
        let cpu = self.cpu(cpu)?;
        HyperCall::new(self, cpu).hypercall(code, args)
    }

    /// An HVC from the guest vCPU loaded on `cpu`.
    pub fn handle_guest_hvc(&self, cpu: usize) -> HvResult<HvcExit> {
        let loaded = self
            .cpu(cpu)?
            .loaded_vcpu()
            .ok_or(hv_err!(EINVAL, "no vcpu loaded"))?;
        let exit = GuestHyperCall::new(
            &self.host_mmu,
            self.smc.as_ref(),
            self.config.trng_available,
            &loaded.vm,
            &loaded.vcpu,
        )
        .handle();
        Ok(exit)
    }

    /// A guest data abort outside its memory. The access is returned for the
    /// host to emulate only when the MMIO guard lets it through.
    pub fn handle_guest_dabt(
        &self,
        cpu: usize,
        esr: u64,
        ipa: GuestPhysAddr,
    ) -> HvResult<Option<MMIOAccess>> {
        let loaded = self
            .cpu(cpu)?
            .loaded_vcpu()
            .ok_or(hv_err!(EINVAL, "no vcpu loaded"))?;
        let Some(access) = MMIOAccess::from_esr(esr, ipa) else {
            return Ok(None);
        };
        if !loaded.vm.stage2().check_ioguard_page(ipa, access.size) {
            warn!(
                "vm {:#x}: unguarded MMIO access at {:#x}",
                loaded.vm.handle(),
                ipa
            );
            return Ok(None);
        }
        Ok(Some(access))
    }

    /// A host access to an SMMU register window it gave away.
    pub fn handle_host_dabt(&self, regs: &mut [u64], esr: u64, addr: PhysAddr) -> bool {
        self.iommu.dabt_handler(regs, esr, addr)
    }
}

#[cfg(test)]
mod tests;
