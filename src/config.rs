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
//! Boot-time description of the machine, handed over by the host.

use alloc::vec::Vec;
use core::ops::Range;

use crate::arch::iommu::{PowerDomain, SmmuConfig};
use crate::arch::trap::{CpuCaps, IdRegs};
use crate::consts::*;
use crate::error::HvResult;
use crate::memory::addr::is_aligned;
use crate::memory::PhysAddr;

pub const CONFIG_MAX_MEMORY_REGIONS: usize = 16;
pub const CONFIG_MAX_SMMUS: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HvConfigMemoryRegion {
    pub physical_start: u64,
    pub size: u64,
}

impl HvConfigMemoryRegion {
    pub const fn new(physical_start: u64, size: u64) -> Self {
        Self {
            physical_start,
            size,
        }
    }

    pub const fn new_empty() -> Self {
        Self::new(0, 0)
    }

    pub fn range(&self) -> Range<PhysAddr> {
        self.physical_start as PhysAddr..(self.physical_start + self.size) as PhysAddr
    }

    fn overlaps(&self, other: &Self) -> bool {
        let (a, b) = (self.range(), other.range());
        a.start < b.end && b.start < a.end
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HvSmmuConfig {
    pub base: u64,
    pub size: u64,
    /// 1 when the host drives power transitions through hypercalls.
    pub power_domain: u32,
    pub caches_clean_on_power_on: u32,
}

impl HvSmmuConfig {
    fn region(&self) -> HvConfigMemoryRegion {
        HvConfigMemoryRegion::new(self.base, self.size)
    }

    pub fn to_smmu_config(&self) -> SmmuConfig {
        SmmuConfig {
            mmio_addr: self.base as PhysAddr,
            mmio_size: self.size as usize,
            power_domain: match self.power_domain {
                1 => PowerDomain::HostHvc,
                _ => PowerDomain::None,
            },
            caches_clean_on_power_on: self.caches_clean_on_power_on != 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone)]
pub struct HvSystemConfig {
    pub num_cpus: u32,
    pub vm_table_size: u32,
    pub hyp_req_len: u32,
    pub memcache_min_pages: u32,
    num_ram_regions: u32,
    ram_regions: [HvConfigMemoryRegion; CONFIG_MAX_MEMORY_REGIONS],
    num_mmio_regions: u32,
    mmio_regions: [HvConfigMemoryRegion; CONFIG_MAX_MEMORY_REGIONS],
    num_smmus: u32,
    smmus: [HvSmmuConfig; CONFIG_MAX_SMMUS],
    pub host_hcr_el2: u64,
    pub hvhe: bool,
    pub trng_available: bool,
    pub pvmfw_base: u64,
    pub pvmfw_size: u64,
    pub pvmfw_load_addr: u64,
    pub id_regs: IdRegs,
    pub cpu_caps: CpuCaps,
}

impl Default for HvSystemConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            vm_table_size: DEFAULT_VM_TABLE_SIZE as u32,
            hyp_req_len: HYP_REQ_MAX as u32,
            memcache_min_pages: DEFAULT_MEMCACHE_MIN_PAGES as u32,
            num_ram_regions: 0,
            ram_regions: [HvConfigMemoryRegion::new_empty(); CONFIG_MAX_MEMORY_REGIONS],
            num_mmio_regions: 0,
            mmio_regions: [HvConfigMemoryRegion::new_empty(); CONFIG_MAX_MEMORY_REGIONS],
            num_smmus: 0,
            smmus: [HvSmmuConfig::default(); CONFIG_MAX_SMMUS],
            host_hcr_el2: 0,
            hvhe: false,
            trng_available: false,
            pvmfw_base: 0,
            pvmfw_size: 0,
            pvmfw_load_addr: INVALID_ADDRESS,
            id_regs: IdRegs::default(),
            cpu_caps: CpuCaps::default(),
        }
    }
}

impl HvSystemConfig {
    pub fn add_ram_region(&mut self, region: HvConfigMemoryRegion) -> HvResult {
        let idx = self.num_ram_regions as usize;
        if idx >= CONFIG_MAX_MEMORY_REGIONS {
            return hv_result_err!(E2BIG, "config: too many RAM regions");
        }
        self.ram_regions[idx] = region;
        self.num_ram_regions += 1;
        Ok(())
    }

    pub fn add_mmio_region(&mut self, region: HvConfigMemoryRegion) -> HvResult {
        let idx = self.num_mmio_regions as usize;
        if idx >= CONFIG_MAX_MEMORY_REGIONS {
            return hv_result_err!(E2BIG, "config: too many MMIO regions");
        }
        self.mmio_regions[idx] = region;
        self.num_mmio_regions += 1;
        Ok(())
    }

    pub fn add_smmu(&mut self, smmu: HvSmmuConfig) -> HvResult {
        let idx = self.num_smmus as usize;
        if idx >= CONFIG_MAX_SMMUS {
            return hv_result_err!(E2BIG, "config: too many SMMUs");
        }
        self.smmus[idx] = smmu;
        self.num_smmus += 1;
        Ok(())
    }

    pub fn ram_regions(&self) -> &[HvConfigMemoryRegion] {
        &self.ram_regions[..(self.num_ram_regions as usize).min(CONFIG_MAX_MEMORY_REGIONS)]
    }

    pub fn mmio_regions(&self) -> &[HvConfigMemoryRegion] {
        &self.mmio_regions[..(self.num_mmio_regions as usize).min(CONFIG_MAX_MEMORY_REGIONS)]
    }

    pub fn smmus(&self) -> &[HvSmmuConfig] {
        &self.smmus[..(self.num_smmus as usize).min(CONFIG_MAX_SMMUS)]
    }

    pub fn smmu_configs(&self) -> Vec<SmmuConfig> {
        self.smmus().iter().map(HvSmmuConfig::to_smmu_config).collect()
    }

    pub fn ram_ranges(&self) -> Vec<Range<PhysAddr>> {
        self.ram_regions().iter().map(HvConfigMemoryRegion::range).collect()
    }

    pub fn has_pvmfw(&self) -> bool {
        self.pvmfw_size != 0
    }

    pub fn validate(&self) -> HvResult {
        if self.num_cpus == 0 || self.num_cpus as usize > MAX_CPU_NUM {
            return hv_result_err!(EINVAL, "config: bad CPU count");
        }
        if self.vm_table_size == 0 {
            return hv_result_err!(EINVAL, "config: empty VM table");
        }
        // One slot carries the terminator.
        if self.hyp_req_len < 2 || self.hyp_req_len as usize > HYP_REQ_MAX {
            return hv_result_err!(EINVAL, "config: bad request ring length");
        }
        if self.num_ram_regions as usize > CONFIG_MAX_MEMORY_REGIONS
            || self.num_mmio_regions as usize > CONFIG_MAX_MEMORY_REGIONS
            || self.num_smmus as usize > CONFIG_MAX_SMMUS
        {
            return hv_result_err!(EINVAL, "config: region count out of range");
        }

        let regions: Vec<HvConfigMemoryRegion> = self
            .ram_regions()
            .iter()
            .chain(self.mmio_regions())
            .copied()
            .chain(self.smmus().iter().map(HvSmmuConfig::region))
            .collect();
        for (i, r) in regions.iter().enumerate() {
            if r.size == 0
                || !is_aligned(r.physical_start as usize)
                || !is_aligned(r.size as usize)
                || r.physical_start.checked_add(r.size).is_none()
            {
                return hv_result_err!(EINVAL, "config: malformed region");
            }
            if regions[..i].iter().any(|other| other.overlaps(r)) {
                warn!("config: region {:#x?} overlaps another one", r);
                return hv_result_err!(EINVAL, "config: overlapping regions");
            }
        }

        if self.has_pvmfw() {
            let fw = HvConfigMemoryRegion::new(self.pvmfw_base, self.pvmfw_size);
            let in_ram = self.ram_regions().iter().any(|r| {
                let (a, b) = (r.range(), fw.range());
                a.start <= b.start && b.end <= a.end
            });
            if !is_aligned(self.pvmfw_base as usize)
                || !is_aligned(self.pvmfw_load_addr as usize)
                || !in_ram
            {
                return hv_result_err!(EINVAL, "config: bad pvmfw image");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
