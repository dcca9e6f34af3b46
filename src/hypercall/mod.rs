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
pub mod psci;
mod pvm;
pub mod smccc;

#[cfg(test)]
mod tests;

use core::convert::TryFrom;

use numeric_enum_macro::numeric_enum;

use crate::arch::iommu::DomainType;
use crate::error::HvResult;
use crate::hypervisor::Hypervisor;
use crate::memory::addr::{is_aligned, pfn_to_phys};
use crate::memory::{MemFlags, PAGE_SIZE};
use crate::percpu::{LoadedVcpu, PerCpu};

pub use pvm::{GuestHyperCall, HvcExit};
pub use smccc::SecureMonitor;

numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum HyperCallCode {
        InitVmTable = 0,
        InitVm = 1,
        InitVcpu = 2,
        StartTeardownVm = 3,
        FinalizeTeardownVm = 4,
        ReclaimDyingGuestPage = 5,
        VcpuLoad = 6,
        VcpuPut = 7,
        VcpuSync = 8,
        HostDonateGuest = 9,
        HostShareGuest = 10,
        TopupVcpuMemcache = 11,
        IommuAllocDomain = 12,
        IommuFreeDomain = 13,
        IommuAttachDev = 14,
        IommuDetachDev = 15,
        IommuMapPages = 16,
        IommuUnmapPages = 17,
        IommuIovaToPhys = 18,
    }
}

pub type HyperCallResult = HvResult<usize>;

/// A control call from the host, handled on the CPU that issued it.
pub struct HyperCall<'a> {
    hv: &'a Hypervisor,
    cpu: &'a PerCpu,
}

impl<'a> HyperCall<'a> {
    pub fn new(hv: &'a Hypervisor, cpu: &'a PerCpu) -> Self {
        Self { hv, cpu }
    }

    pub fn hypercall(&mut self, code: u64, args: [u64; 6]) -> HyperCallResult {
        let code = match HyperCallCode::try_from(code) {
            Ok(code) => code,
            Err(_) => {
                warn!("hypercall id={} unsupported!", code);
                return hv_result_err!(ENOSYS);
            }
        };
        let [arg0, arg1, arg2, arg3, arg4, arg5] = args;
        trace!("cpu {}: hypercall {:?} {:#x?}", self.cpu.id, code, args);
        match code {
            HyperCallCode::InitVmTable => self.init_vm_table(),
            HyperCallCode::InitVm => self.init_vm(arg0, arg1),
            HyperCallCode::InitVcpu => self.init_vcpu(arg0, arg1, arg2),
            HyperCallCode::StartTeardownVm => self.start_teardown_vm(arg0),
            HyperCallCode::FinalizeTeardownVm => self.finalize_teardown_vm(arg0),
            HyperCallCode::ReclaimDyingGuestPage => {
                self.reclaim_dying_guest_page(arg0, arg1, arg2, arg3)
            }
            HyperCallCode::VcpuLoad => self.vcpu_load(arg0, arg1),
            HyperCallCode::VcpuPut => self.vcpu_put(),
            HyperCallCode::VcpuSync => self.vcpu_sync(),
            HyperCallCode::HostDonateGuest => self.host_donate_guest(arg0, arg1, arg2),
            HyperCallCode::HostShareGuest => self.host_share_guest(arg0, arg1, arg2, arg3),
            HyperCallCode::TopupVcpuMemcache => self.topup_vcpu_memcache(),
            HyperCallCode::IommuAllocDomain => self.iommu_alloc_domain(arg0, arg1),
            HyperCallCode::IommuFreeDomain => self.iommu_free_domain(arg0),
            HyperCallCode::IommuAttachDev => self.iommu_attach_dev(arg0, arg1, arg2, arg3, arg4),
            HyperCallCode::IommuDetachDev => self.iommu_detach_dev(arg0, arg1, arg2, arg3),
            HyperCallCode::IommuMapPages => {
                self.iommu_map_pages(arg0, arg1, arg2, arg3, arg4, arg5)
            }
            HyperCallCode::IommuUnmapPages => self.iommu_unmap_pages(arg0, arg1, arg2, arg3),
            HyperCallCode::IommuIovaToPhys => self.iommu_iova_to_phys(arg0, arg1),
        }
    }

    fn loaded(&self) -> HvResult<LoadedVcpu> {
        self.cpu
            .loaded_vcpu()
            .ok_or(hv_err!(EINVAL, "no vcpu loaded"))
    }

    fn handle(arg: u64) -> HvResult<u32> {
        u32::try_from(arg).map_err(|_| hv_err!(EINVAL))
    }

    fn init_vm_table(&mut self) -> HyperCallResult {
        let capacity = self.hv.config().vm_table_size as usize;
        self.hv.registry().init_vm_table(capacity)?;
        info!("vm table ready, {} slots", capacity);
        Ok(0)
    }

    fn init_vm(&mut self, host_kvm: u64, pgd: u64) -> HyperCallResult {
        let handle = self
            .hv
            .registry()
            .create_vm(host_kvm as usize, pgd as usize)?;
        Ok(handle as usize)
    }

    fn init_vcpu(&mut self, handle: u64, host_vcpu: u64, hyp_reqs: u64) -> HyperCallResult {
        self.hv
            .registry()
            .init_vcpu(Self::handle(handle)?, host_vcpu as usize, hyp_reqs as usize)?;
        Ok(0)
    }

    fn start_teardown_vm(&mut self, handle: u64) -> HyperCallResult {
        self.hv.registry().start_teardown(Self::handle(handle)?)?;
        Ok(0)
    }

    fn finalize_teardown_vm(&mut self, handle: u64) -> HyperCallResult {
        self.hv.registry().finalize_teardown(Self::handle(handle)?)?;
        Ok(0)
    }

    fn reclaim_dying_guest_page(
        &mut self,
        handle: u64,
        pfn: u64,
        gfn: u64,
        order: u64,
    ) -> HyperCallResult {
        let order = u32::try_from(order).map_err(|_| hv_err!(EINVAL))?;
        self.hv.registry().reclaim_dying_guest_page(
            Self::handle(handle)?,
            pfn as usize,
            gfn as usize,
            order,
        )?;
        Ok(0)
    }

    fn vcpu_load(&mut self, handle: u64, idx: u64) -> HyperCallResult {
        self.hv
            .registry()
            .load_vcpu(self.cpu, Self::handle(handle)?, idx as usize)
            .ok_or(hv_err!(EINVAL, "vcpu not loadable"))?;
        Ok(0)
    }

    fn vcpu_put(&mut self) -> HyperCallResult {
        self.hv.registry().put_vcpu(self.cpu);
        Ok(0)
    }

    fn vcpu_sync(&mut self) -> HyperCallResult {
        self.loaded()?.vcpu.sync_to_host();
        Ok(0)
    }

    fn topup_vcpu_memcache(&mut self) -> HyperCallResult {
        let loaded = self.loaded()?;
        let min_pages = self.hv.registry().params().memcache_min_pages;
        loaded.vcpu.topup_memcache(self.hv.host_mmu(), min_pages)?;
        Ok(0)
    }

    /// Give host pages to the protected VM whose vCPU is loaded here.
    fn host_donate_guest(&mut self, pfn: u64, gfn: u64, nr_pages: u64) -> HyperCallResult {
        let loaded = self.loaded()?;
        if !loaded.vm.is_protected() {
            return hv_result_err!(EPERM);
        }
        let (pfn, gfn, nr_pages) = (pfn as usize, gfn as usize, nr_pages as usize);
        let host_mmu = self.hv.host_mmu();
        let min_pages = self.hv.registry().params().memcache_min_pages;
        loaded.vcpu.topup_memcache(host_mmu, min_pages)?;
        loaded.vm.stage2().host_donate_guest(
            host_mmu,
            &mut loaded.vcpu.memcache(),
            pfn,
            gfn,
            nr_pages,
        )?;

        let ipa = pfn_to_phys(gfn);
        if loaded.vm.pvmfw_range_contains(ipa) {
            loaded
                .vm
                .load_pvmfw_pages(ipa, pfn_to_phys(pfn), nr_pages * PAGE_SIZE)?;
        }
        Ok(0)
    }

    fn host_share_guest(&mut self, pfn: u64, gfn: u64, nr_pages: u64, prot: u64) -> HyperCallResult {
        let loaded = self.loaded()?;
        if loaded.vm.is_protected() {
            return hv_result_err!(EPERM);
        }
        let prot = MemFlags::from_bits(prot).ok_or(hv_err!(EINVAL))?;
        let host_mmu = self.hv.host_mmu();
        let min_pages = self.hv.registry().params().memcache_min_pages;
        loaded.vcpu.topup_memcache(host_mmu, min_pages)?;
        loaded.vm.stage2().host_share_guest(
            host_mmu,
            &mut loaded.vcpu.memcache(),
            pfn as usize,
            gfn as usize,
            nr_pages as usize,
            prot,
        )?;
        Ok(0)
    }

    fn iommu_alloc_domain(&mut self, domain_id: u64, ty: u64) -> HyperCallResult {
        let ty = u32::try_from(ty)
            .ok()
            .and_then(|ty| DomainType::try_from(ty).ok())
            .ok_or(hv_err!(EINVAL, "unknown domain type"))?;
        self.hv.iommu().alloc_domain(Self::handle(domain_id)?, ty)?;
        Ok(0)
    }

    fn iommu_free_domain(&mut self, domain_id: u64) -> HyperCallResult {
        self.hv.iommu().free_domain(Self::handle(domain_id)?)?;
        Ok(0)
    }

    fn iommu_attach_dev(
        &mut self,
        iommu_id: u64,
        domain_id: u64,
        sid: u64,
        pasid: u64,
        pasid_bits: u64,
    ) -> HyperCallResult {
        self.hv.iommu().attach_dev(
            iommu_id as usize,
            Self::handle(domain_id)?,
            sid as u32,
            pasid as u32,
            pasid_bits as u32,
        )?;
        Ok(0)
    }

    fn iommu_detach_dev(
        &mut self,
        iommu_id: u64,
        domain_id: u64,
        sid: u64,
        pasid: u64,
    ) -> HyperCallResult {
        self.hv.iommu().detach_dev(
            iommu_id as usize,
            Self::handle(domain_id)?,
            sid as u32,
            pasid as u32,
        )?;
        Ok(0)
    }

    /// Returns the number of bytes mapped.
    fn iommu_map_pages(
        &mut self,
        domain_id: u64,
        iova: u64,
        paddr: u64,
        pgsize: u64,
        pgcount: u64,
        prot: u64,
    ) -> HyperCallResult {
        let prot = MemFlags::from_bits(prot).ok_or(hv_err!(EINVAL))?;
        if !is_aligned(iova as usize) || !is_aligned(paddr as usize) {
            return hv_result_err!(EINVAL);
        }
        self.hv.iommu().map_pages(
            Self::handle(domain_id)?,
            iova as usize,
            paddr as usize,
            pgsize as usize,
            pgcount as usize,
            prot,
        )
    }

    /// Returns the number of bytes unmapped.
    fn iommu_unmap_pages(
        &mut self,
        domain_id: u64,
        iova: u64,
        pgsize: u64,
        pgcount: u64,
    ) -> HyperCallResult {
        self.hv.iommu().unmap_pages(
            Self::handle(domain_id)?,
            iova as usize,
            pgsize as usize,
            pgcount as usize,
        )
    }

    fn iommu_iova_to_phys(&mut self, domain_id: u64, iova: u64) -> HyperCallResult {
        self.hv
            .iommu()
            .iova_to_phys(Self::handle(domain_id)?, iova as usize)
    }
}
