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
//! IOMMU domains shared by all SMMUs.
//!
//! Domain 0 is the identity domain: it mirrors the host stage-2 so that
//! devices attached to it can reach exactly what the host CPU can. Other
//! domains are created by the host and only map pages the host owns.

mod cmdq;
mod regs;
mod smmuv3;
mod strtab;

#[cfg(test)]
mod tests;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::arch::paging::IotlbGather;
use crate::error::HvResult;
use crate::memory::{HostIdmap, HostMmu, MemFlags, PhysAddr};

pub use smmuv3::{DomainType, PowerDomain, SmmuConfig, SmmuDomain, SmmuFeatures, Smmuv3};

pub const IDMAP_ID: u32 = 0;
pub const MAX_DOMAINS: u32 = 1 << 16;
/// Pages unmapped between two TLB syncs.
pub const PADDR_CACHE_MAX: usize = 16;

const IOMMU_PROT_MASK: MemFlags = MemFlags::READ
    .union(MemFlags::WRITE)
    .union(MemFlags::CACHE)
    .union(MemFlags::NOEXEC)
    .union(MemFlags::MMIO)
    .union(MemFlags::PRIV);

pub struct IommuDomain {
    /// Zero once freed. Held by the owner and by every attached device.
    refs: AtomicU32,
    smmu: SmmuDomain,
}

impl IommuDomain {
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn smmu_domain(&self) -> &SmmuDomain {
        &self.smmu
    }
}

pub struct KvmIommu {
    smmus: Vec<Smmuv3>,
    domains: Mutex<BTreeMap<u32, Arc<IommuDomain>>>,
    host_mmu: Arc<HostMmu>,
    /// Host stage-2 changes are mirrored once the identity domain is populated.
    ready: AtomicBool,
}

impl KvmIommu {
    /// Probe every SMMU and build the identity domain from the current host
    /// stage-2.
    pub fn init(configs: &[SmmuConfig], host_mmu: Arc<HostMmu>) -> HvResult<Arc<Self>> {
        let mut smmus = Vec::with_capacity(configs.len());
        for (id, cfg) in configs.iter().enumerate() {
            smmus.push(Smmuv3::probe(id, cfg, &host_mmu)?);
        }
        let iommu = Arc::new(Self {
            smmus,
            domains: Mutex::new(BTreeMap::new()),
            host_mmu,
            ready: AtomicBool::new(false),
        });
        iommu.init_idmap()?;
        Ok(iommu)
    }

    fn init_idmap(self: &Arc<Self>) -> HvResult {
        let Some(smmu) = self
            .smmus
            .iter()
            .find(|s| s.features().contains(SmmuFeatures::TRANS_S2))
        else {
            info!("iommu: no stage-2 capable SMMU, no identity domain");
            return Ok(());
        };
        self.alloc_domain(IDMAP_ID, DomainType::Bypass)?;
        let idmap = self.domain(IDMAP_ID).ok_or(hv_err!(ENOENT))?;
        idmap.smmu.finalise(smmu.pgtable_cfg(DomainType::S2))?;

        let weak: Weak<dyn HostIdmap> = Arc::downgrade(self) as Weak<dyn HostIdmap>;
        self.host_mmu.set_idmap(weak);

        // Changes made after the snapshot go through host_stage2_idmap().
        let snap = self.host_mmu.snapshot();
        for (start, end, prot) in snap.ranges() {
            idmap.smmu.host_stage2_idmap(&self.smmus, start, end, prot);
        }
        self.ready.store(true, Ordering::Release);
        drop(snap);
        info!("iommu: identity domain ready on {} SMMU(s)", self.smmus.len());
        Ok(())
    }

    pub fn smmus(&self) -> &[Smmuv3] {
        &self.smmus
    }

    fn smmu(&self, id: usize) -> HvResult<&Smmuv3> {
        self.smmus.get(id).ok_or(hv_err!(EINVAL, "iommu: no such SMMU"))
    }

    pub fn domain(&self, id: u32) -> Option<Arc<IommuDomain>> {
        if id >= MAX_DOMAINS {
            return None;
        }
        self.domains.lock().get(&id).cloned()
    }

    fn domain_get(&self, id: u32) -> HvResult<Arc<IommuDomain>> {
        let domain = self.domain(id).ok_or(hv_err!(EINVAL))?;
        domain
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                (refs != 0).then_some(refs + 1)
            })
            .map_err(|_| hv_err!(EINVAL))?;
        Ok(domain)
    }

    fn domain_put(domain: &IommuDomain) {
        let old = domain.refs.fetch_sub(1, Ordering::AcqRel);
        if old <= 1 {
            error!("iommu: domain {} lost its owner reference", domain.smmu.id());
        }
    }

    pub fn alloc_domain(&self, id: u32, ty: DomainType) -> HvResult {
        if id >= MAX_DOMAINS {
            return hv_result_err!(EINVAL);
        }
        let mut domains = self.domains.lock();
        if domains.contains_key(&id) {
            return hv_result_err!(EINVAL, "iommu: domain in use");
        }
        domains.insert(
            id,
            Arc::new(IommuDomain {
                refs: AtomicU32::new(1),
                smmu: SmmuDomain::new(id, ty),
            }),
        );
        debug!("iommu: domain {} allocated as {:?}", id, ty);
        Ok(())
    }

    /// Free a domain with no device attached.
    pub fn free_domain(&self, id: u32) -> HvResult {
        let domain = {
            let mut domains = self.domains.lock();
            let domain = domains.get(&id).cloned().ok_or(hv_err!(EINVAL))?;
            if domain
                .refs
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return hv_result_err!(EINVAL, "iommu: domain still attached");
            }
            domains.remove(&id);
            domain
        };
        domain.smmu.free(&self.smmus);
        debug!("iommu: domain {} freed", id);
        Ok(())
    }

    pub fn attach_dev(
        &self,
        iommu_id: usize,
        domain_id: u32,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> HvResult {
        let smmu = self.smmu(iommu_id)?;
        let domain = self.domain_get(domain_id)?;
        let ret = smmu.attach_dev(&domain.smmu, sid, pasid, pasid_bits);
        if ret.is_err() {
            Self::domain_put(&domain);
        }
        ret
    }

    pub fn detach_dev(&self, iommu_id: usize, domain_id: u32, sid: u32, pasid: u32) -> HvResult {
        let smmu = self.smmu(iommu_id)?;
        let domain = self.domain(domain_id).ok_or(hv_err!(EINVAL))?;
        if domain.refs() <= 1 {
            return hv_result_err!(EINVAL, "iommu: nothing attached");
        }
        smmu.detach_dev(&domain.smmu, sid, pasid)?;
        Self::domain_put(&domain);
        Ok(())
    }

    /// Map host pages for DMA. Returns the number of bytes mapped.
    pub fn map_pages(
        &self,
        domain_id: u32,
        iova: usize,
        paddr: PhysAddr,
        pgsize: usize,
        pgcount: usize,
        prot: MemFlags,
    ) -> HvResult<usize> {
        if !IOMMU_PROT_MASK.contains(prot) || pgsize == 0 || pgcount == 0 {
            return hv_result_err!(EINVAL);
        }
        let size = pgsize.checked_mul(pgcount).ok_or(hv_err!(EINVAL))?;
        if iova.checked_add(size).is_none() || paddr.checked_add(size).is_none() {
            return hv_result_err!(EINVAL);
        }
        if domain_id == IDMAP_ID {
            return hv_result_err!(EINVAL, "iommu: identity domain follows the host");
        }

        let domain = self.domain_get(domain_id)?;
        if let Err(e) = self.host_mmu.use_dma(paddr, size) {
            Self::domain_put(&domain);
            return Err(e);
        }

        let mut total_mapped = 0;
        let ret = domain.smmu.map_pages(
            &self.smmus,
            iova,
            paddr,
            pgsize,
            pgcount,
            prot,
            &mut total_mapped,
        );
        // Pages not mapped are not in use for DMA either.
        if total_mapped < size {
            let rest = paddr + total_mapped;
            if let Err(e) = self.host_mmu.unuse_dma(rest, size - total_mapped) {
                warn!("iommu: lost DMA references at {:#x}: {:?}", rest, e);
            }
        }
        Self::domain_put(&domain);

        match ret {
            Err(e) if total_mapped == 0 => Err(e),
            Err(e) => {
                warn!("iommu: map of {:#x} stopped at {:#x}: {:?}", iova, total_mapped, e);
                Ok(total_mapped)
            }
            Ok(()) => Ok(total_mapped),
        }
    }

    /// Unmap pages and release them for the host. Returns the number of
    /// bytes unmapped.
    pub fn unmap_pages(
        &self,
        domain_id: u32,
        mut iova: usize,
        pgsize: usize,
        mut pgcount: usize,
    ) -> HvResult<usize> {
        if pgsize == 0 || pgcount == 0 {
            return hv_result_err!(EINVAL);
        }
        let size = pgsize.checked_mul(pgcount).ok_or(hv_err!(EINVAL))?;
        if iova.checked_add(size).is_none() || domain_id == IDMAP_ID {
            return hv_result_err!(EINVAL);
        }

        let domain = self.domain_get(domain_id)?;
        let mut gather = IotlbGather::new();
        let mut cache: Vec<(PhysAddr, usize)> = Vec::with_capacity(PADDR_CACHE_MAX);
        let mut total = 0;
        // A page is only handed back to the host once the TLBs can't reach it.
        while total < size {
            let batch = pgcount.min(PADDR_CACHE_MAX);
            let unmapped = domain.smmu.unmap_pages(
                &self.smmus,
                iova,
                pgsize,
                batch,
                &mut gather,
                &mut |paddr, len| cache.push((paddr, len)),
            );
            if unmapped == 0 {
                break;
            }
            domain.smmu.iotlb_sync(&self.smmus, &mut gather);
            for (paddr, len) in cache.drain(..) {
                if let Err(e) = self.host_mmu.unuse_dma(paddr, len) {
                    warn!("iommu: lost DMA references at {:#x}: {:?}", paddr, e);
                }
            }
            iova += unmapped;
            total += unmapped;
            pgcount -= (unmapped / pgsize).min(pgcount);
        }
        Self::domain_put(&domain);
        Ok(total)
    }

    pub fn iova_to_phys(&self, domain_id: u32, iova: usize) -> HvResult<PhysAddr> {
        let domain = self.domain_get(domain_id)?;
        let paddr = domain.smmu.iova_to_phys(iova);
        Self::domain_put(&domain);
        Ok(paddr)
    }

    /// Emulate a host access to a donated SMMU register window.
    pub fn dabt_handler(&self, regs: &mut [u64], esr: u64, addr: PhysAddr) -> bool {
        self.smmus
            .iter()
            .find(|smmu| smmu.contains(addr))
            .is_some_and(|smmu| smmu.dabt_device(regs, esr, (addr - smmu.mmio_addr()) as u32))
    }

    pub fn power_on(&self, iommu_id: usize) -> HvResult {
        self.smmu(iommu_id)?.power_on()
    }

    pub fn power_off(&self, iommu_id: usize) -> HvResult {
        self.smmu(iommu_id)?.power_off()
    }
}

impl HostIdmap for KvmIommu {
    fn host_stage2_idmap(&self, start: PhysAddr, end: PhysAddr, prot: MemFlags) {
        if !self.ready.load(Ordering::Acquire) {
            return;
        }
        if let Some(idmap) = self.domain(IDMAP_ID) {
            idmap.smmu.host_stage2_idmap(&self.smmus, start, end, prot);
        }
    }
}
