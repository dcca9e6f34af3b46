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
//! SMMUv3 driver.
//!
//! The host probes the SMMU and programs the queue and table base registers,
//! then hands the whole register window over. From then on the hypervisor
//! is the only one writing stream table entries, so the host can no longer
//! point a device at memory it does not own.
use alloc::vec::Vec;

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;
use spin::{Mutex, Once, RwLock};
use tock_registers::interfaces::{Readable, Writeable};

use super::cmdq::*;
use super::regs::*;
use super::strtab::{Desc, StreamTable};
use crate::arch::cpu::{flush_dcache_to_poc, udelay, wfe};
use crate::arch::paging::{
    FrameTableAllocator, IoPgtableCfg, IoPgtableFmt, IotlbGather, LpaePgtable, PgtableOps,
    TlbFlushOps,
};
use crate::error::{HvError, HvResult};
use crate::memory::addr::{is_aligned, phys_to_pfn};
use crate::memory::{Frame, HostMmu, MemFlags, PhysAddr, PAGE_SHIFT, PAGE_SIZE};

pub const ARM_SMMU_POLL_TIMEOUT_US: u64 = 100_000;

const SZ_2M: usize = 0x20_0000;
const SZ_1G: usize = 0x4000_0000;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SmmuFeatures: u32 {
        const TWO_LVL_STRTAB    = 1 << 0;
        const TRANS_S1          = 1 << 1;
        const TRANS_S2          = 1 << 2;
        const COHERENCY         = 1 << 3;
        const SEV               = 1 << 4;
        const RANGE_INV         = 1 << 5;
        const VMID16            = 1 << 6;
    }
}

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum DomainType {
        S1 = 0,
        S2 = 1,
        Bypass = 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDomain {
    /// Power is not managed through the hypervisor.
    None,
    /// The host asks for power transitions with a hypercall.
    HostHvc,
}

/// What the host tells about one SMMU instance.
#[derive(Debug, Clone, Copy)]
pub struct SmmuConfig {
    pub mmio_addr: PhysAddr,
    pub mmio_size: usize,
    pub power_domain: PowerDomain,
    /// Configuration and TLB caches are invalidated by the power-on reset.
    pub caches_clean_on_power_on: bool,
}

/// State protected by the per-instance lock.
struct SmmuState {
    power_is_off: bool,
    cmdq: CmdQueue,
    strtab: StreamTable,
    cd_tables: Vec<Frame>,
}

pub struct Smmuv3 {
    id: usize,
    rp: &'static RegisterPage,
    mmio_addr: PhysAddr,
    mmio_size: usize,
    features: SmmuFeatures,
    ssid_bits: u32,
    power_domain: PowerDomain,
    caches_clean_on_power_on: bool,
    pgtable_cfg_s1: IoPgtableCfg,
    pgtable_cfg_s2: IoPgtableCfg,
    inner: Mutex<SmmuState>,
}

fn oas_from_idr5(idr5: u32) -> usize {
    match field_get(IDR5_OAS, idr5 as u64) {
        0 => 32,
        1 => 36,
        2 => 40,
        3 => 42,
        4 => 44,
        5 => 48,
        _ => 52,
    }
}

impl Smmuv3 {
    /// Take over the SMMU described by `cfg` and reset it.
    pub fn probe(id: usize, cfg: &SmmuConfig, host_mmu: &HostMmu) -> HvResult<Self> {
        if !is_aligned(cfg.mmio_addr | cfg.mmio_size) || cfg.mmio_size < SMMU_MMIO_SIZE {
            return hv_result_err!(EINVAL, "smmu: bad register window");
        }
        host_mmu.donate_host_to_hyp(
            phys_to_pfn(cfg.mmio_addr),
            cfg.mmio_size >> PAGE_SHIFT,
            true,
        )?;
        let rp = unsafe { &*(cfg.mmio_addr as *const RegisterPage) };

        let idr0 = rp.IDR0.get();
        let idr1 = rp.IDR1.get() as u64;
        let idr3 = rp.IDR3.get();
        let idr5 = rp.IDR5.get();
        info!("smmu{}: IDR0 {:#x} IDR1 {:#x} IDR5 {:#x}", id, idr0, idr1, idr5);

        let mut features = SmmuFeatures::empty();
        if field_get(IDR0_ST_LVL, idr0 as u64) == IDR0_ST_LVL_2LVL {
            features |= SmmuFeatures::TWO_LVL_STRTAB;
        }
        for (bit, feat) in [
            (IDR0_S1P, SmmuFeatures::TRANS_S1),
            (IDR0_S2P, SmmuFeatures::TRANS_S2),
            (IDR0_COHACC, SmmuFeatures::COHERENCY),
            (IDR0_SEV, SmmuFeatures::SEV),
            (IDR0_VMID16, SmmuFeatures::VMID16),
        ] {
            if idr0 & bit != 0 {
                features |= feat;
            }
        }
        if idr3 & IDR3_RIL != 0 {
            features |= SmmuFeatures::RANGE_INV;
        }
        if !features.intersects(SmmuFeatures::TRANS_S1 | SmmuFeatures::TRANS_S2) {
            return hv_result_err!(ENODEV, "smmu: no translation support");
        }

        let mut pgsize_bitmap = 0;
        if idr5 & IDR5_GRAN4K != 0 {
            pgsize_bitmap |= PAGE_SIZE | SZ_2M | SZ_1G;
        }
        if idr5 & IDR5_GRAN16K != 0 {
            pgsize_bitmap |= 0x4000 | 0x200_0000;
        }
        if idr5 & IDR5_GRAN64K != 0 {
            pgsize_bitmap |= 0x1_0000 | 0x2000_0000;
        }
        let oas = oas_from_idr5(idr5);
        let coherent = features.contains(SmmuFeatures::COHERENCY);

        init_registers(rp)?;
        let cmdq = init_cmdq(rp, host_mmu, features)?;
        let strtab = StreamTable::from_regs(rp, host_mmu)?;

        let smmu = Self {
            id,
            rp,
            mmio_addr: cfg.mmio_addr,
            mmio_size: cfg.mmio_size,
            features,
            ssid_bits: field_get(IDR1_SSIDSIZE, idr1) as u32,
            power_domain: cfg.power_domain,
            caches_clean_on_power_on: cfg.caches_clean_on_power_on,
            pgtable_cfg_s1: IoPgtableCfg::new(IoPgtableFmt::Lpae64S1, pgsize_bitmap, 48, oas, coherent),
            pgtable_cfg_s2: IoPgtableCfg::new(IoPgtableFmt::Lpae64S2, pgsize_bitmap, oas, oas, coherent),
            inner: Mutex::new(SmmuState {
                power_is_off: false,
                cmdq,
                strtab,
                cd_tables: Vec::new(),
            }),
        };
        smmu.reset_device(&mut smmu.inner.lock())?;
        info!("smmu{}: ready, features {:?}", id, features);
        Ok(smmu)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn features(&self) -> SmmuFeatures {
        self.features
    }

    pub fn mmio_addr(&self) -> PhysAddr {
        self.mmio_addr
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.mmio_addr && addr < self.mmio_addr + self.mmio_size
    }

    pub fn pgtable_cfg(&self, ty: DomainType) -> &IoPgtableCfg {
        match ty {
            DomainType::S1 => &self.pgtable_cfg_s1,
            _ => &self.pgtable_cfg_s2,
        }
    }

    /// Wait until `cond` holds, for at most the poll timeout.
    fn wait(&self, mut cond: impl FnMut() -> bool) -> HvResult {
        let sev = self.features.contains(SmmuFeatures::SEV);
        for _ in 0..ARM_SMMU_POLL_TIMEOUT_US {
            if cond() {
                return Ok(());
            }
            if sev {
                wfe();
            } else {
                udelay(1);
            }
        }
        if cond() {
            return Ok(());
        }
        warn!("smmu{}: timed out", self.id);
        hv_result_err!(ETIMEDOUT)
    }

    fn write_cr0(&self, val: u32) -> HvResult {
        self.rp.CR0.set(val);
        self.wait(|| self.rp.CR0ACK.get() == val)
    }

    fn add_cmd(&self, st: &mut SmmuState, ent: &CmdqEnt) -> HvResult {
        if st.power_is_off {
            return hv_result_err!(EPIPE);
        }
        let cmd = ent.encode()?;
        self.wait(|| !st.cmdq.full(self.rp))?;
        st.cmdq.push(self.rp, cmd);
        Ok(())
    }

    fn sync_cmd(&self, st: &mut SmmuState) -> HvResult {
        self.add_cmd(st, &CmdqEnt::new(CMDQ_OP_CMD_SYNC))?;
        self.wait(|| st.cmdq.empty_now(self.rp))
    }

    fn send_cmd(&self, st: &mut SmmuState, ent: &CmdqEnt) -> HvResult {
        self.add_cmd(st, ent)?;
        self.sync_cmd(st)
    }

    fn skip_sync(&self, st: &SmmuState) -> bool {
        st.power_is_off && self.caches_clean_on_power_on
    }

    fn sync_ste(&self, st: &mut SmmuState, ste: Desc, sid: u32) -> HvResult {
        if !self.features.contains(SmmuFeatures::COHERENCY) {
            flush_dcache_to_poc(ste.paddr(), STRTAB_STE_DWORDS << 3);
        }
        if self.skip_sync(st) {
            return Ok(());
        }
        self.send_cmd(st, &CmdqEnt::cfgi_ste(sid))
    }

    fn sync_cd(&self, st: &mut SmmuState, cd: Desc, sid: u32, ssid: u32) -> HvResult {
        if !self.features.contains(SmmuFeatures::COHERENCY) {
            flush_dcache_to_poc(cd.paddr(), CTXDESC_CD_DWORDS << 3);
        }
        if self.skip_sync(st) {
            return Ok(());
        }
        self.send_cmd(st, &CmdqEnt::cfgi_cd(sid, ssid))
    }

    /// Invalidate all cached configuration and TLBs, then enable translation.
    fn reset_device(&self, st: &mut SmmuState) -> HvResult {
        self.write_cr0(CR0_CMDQEN)?;
        let ret = self
            .add_cmd(st, &CmdqEnt::new(CMDQ_OP_CFGI_ALL))
            .and_then(|_| self.add_cmd(st, &CmdqEnt::new(CMDQ_OP_TLBI_NSNH_ALL)))
            .and_then(|_| self.sync_cmd(st));
        if let Err(e) = ret {
            self.write_cr0(0)?;
            return Err(e);
        }
        self.write_cr0(CR0_SMMUEN | CR0_CMDQEN | CR0_ATSCHK | CR0_EVTQEN)
    }

    pub fn power_on(&self) -> HvResult {
        let mut st = self.inner.lock();
        let prev = st.power_is_off;
        st.power_is_off = false;
        // Re-enable and clean all caches.
        let ret = match self.power_domain {
            PowerDomain::HostHvc => self.reset_device(&mut st),
            PowerDomain::None => Ok(()),
        };
        if ret.is_err() {
            st.power_is_off = prev;
        }
        ret
    }

    pub fn power_off(&self) -> HvResult {
        let mut st = self.inner.lock();
        let prev = st.power_is_off;
        st.power_is_off = true;
        // GBPA aborts every transaction while the SMMU is disabled.
        let ret = match self.power_domain {
            PowerDomain::HostHvc => self.write_cr0(0),
            PowerDomain::None => Ok(()),
        };
        if ret.is_err() {
            st.power_is_off = prev;
        }
        ret
    }

    pub fn is_powered_off(&self) -> bool {
        self.inner.lock().power_is_off
    }

    /// Emulate a host access to a register of the donated window. Returns
    /// false when the access is not allowed.
    pub fn dabt_device(&self, regs: &mut [u64], esr: u64, off: u32) -> bool {
        let is_write = esr & ESR_ELX_WNR != 0;
        let len = 1usize << field_get(ESR_ELX_SAS, esr);
        let rd = field_get(ESR_ELX_SRT, esr) as usize;
        let read_write = u32::MAX;
        let read_only = if is_write { 0 } else { read_write };

        // Only 32-bit accesses, no 64-bit register needs emulating.
        if len != core::mem::size_of::<u32>() || off & 3 != 0 {
            return false;
        }
        let mask = match off {
            ARM_SMMU_EVTQ_PROD | ARM_SMMU_EVTQ_CONS | ARM_SMMU_GERRORN => read_write,
            ARM_SMMU_GERROR => read_only,
            _ => 0,
        };
        if mask == 0 {
            return false;
        }

        let reg = unsafe { &*((self.mmio_addr + off as usize) as *const tock_registers::registers::ReadWrite<u32>) };
        if is_write {
            let val = if rd < regs.len() { regs[rd] as u32 } else { 0 };
            reg.set(val & mask);
        } else if rd < regs.len() {
            regs[rd] = reg.get() as u64;
        }
        true
    }

    fn alloc_cd(&self, st: &mut SmmuState, pasid_bits: u32) -> HvResult<PhysAddr> {
        let size = (1usize << pasid_bits) * (CTXDESC_CD_DWORDS << 3);
        let nr_pages = size.div_ceil(PAGE_SIZE).next_power_of_two();
        // Linear tables up to 64K only, enough for 128 PASIDs.
        if nr_pages > 16 {
            return hv_result_err!(EINVAL);
        }
        let mut frame = Frame::new_contiguous(nr_pages, nr_pages.trailing_zeros() as usize)?;
        frame.clear();
        let paddr = frame.start_paddr();
        st.cd_tables.push(frame);
        Ok(paddr)
    }

    fn domain_compat(&self, dp: Option<&DomainPgtable>, ty: DomainType) -> bool {
        // Domain is empty.
        let Some(dp) = dp else {
            return true;
        };
        let needed = match ty {
            DomainType::S1 => SmmuFeatures::TRANS_S1,
            _ => SmmuFeatures::TRANS_S2,
        };
        if !self.features.contains(needed) {
            return false;
        }
        let mine = self.pgtable_cfg(ty);
        let theirs = &dp.src;
        mine.ias == theirs.ias
            && mine.oas == theirs.oas
            && mine.fmt == theirs.fmt
            && mine.pgsize_bitmap == theirs.pgsize_bitmap
            && mine.quirks == theirs.quirks
    }

    #[allow(clippy::too_many_arguments)]
    fn config_s1(
        &self,
        st: &mut SmmuState,
        domain: &SmmuDomain,
        cfg: &IoPgtableCfg,
        ste: Desc,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
        ent: &mut [u64; STRTAB_STE_DWORDS],
    ) -> HvResult<bool> {
        let val = ste.get(0);

        // A stage-1 domain can't join a device already translated at stage 2.
        if field_get(STRTAB_STE_0_CFG, val) == STRTAB_STE_0_CFG_S2_TRANS {
            return hv_result_err!(EBUSY);
        }

        let mut cd_table = (val & STRTAB_STE_0_S1CTXPTR_MASK) as PhysAddr;
        let mut nr_entries = 1u64 << field_get(STRTAB_STE_0_S1CDMAX, val);
        let mut update_ste = false;
        // This is the first pasid attached to this device.
        if cd_table == 0 {
            if pasid as u64 >= 1 << pasid_bits {
                return hv_result_err!(E2BIG);
            }
            cd_table = self.alloc_cd(st, pasid_bits)?;
            nr_entries = 1 << pasid_bits;
            ent[1] = field_prep(STRTAB_STE_1_S1DSS, STRTAB_STE_1_S1DSS_SSID0)
                | field_prep(STRTAB_STE_1_S1CIR, STRTAB_STE_1_S1C_CACHE_WBRA)
                | field_prep(STRTAB_STE_1_S1COR, STRTAB_STE_1_S1C_CACHE_WBRA)
                | field_prep(STRTAB_STE_1_S1CSH, SH_ISH);
            ent[0] = (cd_table as u64 & STRTAB_STE_0_S1CTXPTR_MASK)
                | field_prep(STRTAB_STE_0_CFG, STRTAB_STE_0_CFG_S1_TRANS)
                | field_prep(STRTAB_STE_0_S1CDMAX, pasid_bits as u64)
                | field_prep(STRTAB_STE_0_S1FMT, STRTAB_STE_0_S1FMT_LINEAR)
                | STRTAB_STE_0_V;
            update_ste = true;
        }

        if pasid as u64 >= nr_entries {
            return hv_result_err!(E2BIG);
        }
        let cd = Desc::new(cd_table + pasid as usize * (CTXDESC_CD_DWORDS << 3));
        // CD already used by another device.
        if cd.get(0) != 0 {
            return hv_result_err!(EBUSY);
        }

        cd.set(1, cfg.ttbr as u64 & CTXDESC_CD_1_TTB0_MASK);
        cd.set(2, 0);
        cd.set(3, cfg.mair);
        // STE is live.
        if !update_ste {
            if let Err(e) = self.sync_cd(st, cd, sid, pasid) {
                warn!("smmu{}: CD sync failed: {:?}", self.id, e);
            }
        }
        let tcr = &cfg.tcr;
        let val = field_prep(CTXDESC_CD_0_TCR_T0SZ, tcr.tsz)
            | field_prep(CTXDESC_CD_0_TCR_TG0, tcr.tg)
            | field_prep(CTXDESC_CD_0_TCR_IRGN0, tcr.irgn)
            | field_prep(CTXDESC_CD_0_TCR_ORGN0, tcr.orgn)
            | field_prep(CTXDESC_CD_0_TCR_SH0, tcr.sh)
            | field_prep(CTXDESC_CD_0_TCR_IPS, tcr.ps)
            | CTXDESC_CD_0_TCR_EPD1
            | CTXDESC_CD_0_AA64
            | CTXDESC_CD_0_R
            | CTXDESC_CD_0_A
            | CTXDESC_CD_0_ASET
            | field_prep(CTXDESC_CD_0_ASID, domain.id as u64)
            | CTXDESC_CD_0_V;
        cd.set(0, val);
        if !update_ste {
            if let Err(e) = self.sync_cd(st, cd, sid, pasid) {
                warn!("smmu{}: CD sync failed: {:?}", self.id, e);
            }
        }
        Ok(update_ste)
    }

    /// Point stream `sid` (and `pasid` for stage-1) at `domain`.
    pub fn attach_dev(
        &self,
        domain: &SmmuDomain,
        sid: u32,
        pasid: u32,
        pasid_bits: u32,
    ) -> HvResult {
        let mut state = domain.state.write();
        let mut st = self.inner.lock();
        let ste = st.strtab.ste(sid).ok_or(hv_err!(EINVAL))?;

        // Bypass is only offered on stage-2 capable instances.
        if state.ty == DomainType::Bypass {
            if !self.features.contains(SmmuFeatures::TRANS_S2) {
                return hv_result_err!(EINVAL);
            }
            state.ty = DomainType::S2;
        }
        let ty = state.ty;

        let node = state.iommus.iter().position(|n| n.smmu == self.id);
        if node.is_none() && !self.domain_compat(domain.pgtable.get(), ty) {
            return hv_result_err!(EBUSY);
        }

        let dp = match domain.pgtable.get() {
            Some(dp) => dp,
            None => domain.finalise(self.pgtable_cfg(ty))?,
        };

        let mut ent = [0u64; STRTAB_STE_DWORDS];
        let update_ste = if ty == DomainType::S2 {
            // Device already attached, or a pasid at stage 2.
            if ste.get(0) & !STRTAB_STE_0_S1CTXPTR_MASK != 0 || pasid != 0 {
                return hv_result_err!(EBUSY);
            }
            domain.config_s2(&dp.cfg, &mut ent);
            // Keep the CD pointer, CD tables are never freed.
            ent[0] |= ste.get(0);
            true
        } else {
            // The first attach of a sid sizes its CD table for good.
            let pasid_bits = pasid_bits.min(self.ssid_bits);
            self.config_s1(&mut st, domain, &dp.cfg, ste, sid, pasid, pasid_bits, &mut ent)?
        };

        if update_ste {
            // The SMMU may cache a disabled STE: fill it, sync, then enable.
            let old: [u64; STRTAB_STE_DWORDS] = core::array::from_fn(|i| ste.get(i));
            for (i, val) in ent.iter().enumerate().skip(1) {
                ste.set(i, *val);
            }
            if let Err(e) = self.sync_ste(&mut st, ste, sid) {
                for (i, val) in old.iter().enumerate().skip(1) {
                    ste.set(i, *val);
                }
                return Err(e);
            }
            ste.set(0, ent[0]);
            if let Err(e) = self.sync_ste(&mut st, ste, sid) {
                warn!("smmu{}: STE {:#x} enable not synced: {:?}", self.id, sid, e);
            }
        }

        match node {
            Some(i) => state.iommus[i].refs += 1,
            None => state.iommus.push(IommuNode {
                smmu: self.id,
                refs: 1,
            }),
        }
        debug!(
            "smmu{}: sid {:#x} pasid {} attached to domain {}",
            self.id, sid, pasid, domain.id
        );
        Ok(())
    }

    pub fn detach_dev(&self, domain: &SmmuDomain, sid: u32, pasid: u32) -> HvResult {
        let mut state = domain.state.write();
        let mut st = self.inner.lock();
        let ste = st.strtab.ste(sid).ok_or(hv_err!(ENODEV))?;

        if state.ty == DomainType::S1 {
            let val = ste.get(0);
            let nr_ssid = 1u64 << field_get(STRTAB_STE_0_S1CDMAX, val);
            if pasid as u64 >= nr_ssid {
                return hv_result_err!(E2BIG);
            }
            let cd_table = (val & STRTAB_STE_0_S1CTXPTR_MASK) as PhysAddr;
            if cd_table == 0 {
                warn!("smmu{}: stage-1 sid {:#x} without CD table", self.id, sid);
                return hv_result_err!(EINVAL);
            }
            let cd = Desc::new(cd_table + pasid as usize * (CTXDESC_CD_DWORDS << 3));
            if cd.get(0) & CTXDESC_CD_0_V == 0 {
                warn!("smmu{}: detaching invalid CD {}", self.id, pasid);
            }
            // Invalidate CD.
            cd.set(0, 0);
            if let Err(e) = self.sync_cd(&mut st, cd, sid, pasid) {
                warn!("smmu{}: CD {} invalidation failed: {:?}", self.id, pasid, e);
            }
            for i in 1..4 {
                cd.set(i, 0);
            }
            self.sync_cd(&mut st, cd, sid, pasid)?;
        } else {
            // Don't clear the CD pointer, it would leak the CD table.
            ste.set(0, ste.get(0) & STRTAB_STE_0_S1CTXPTR_MASK);
            self.sync_ste(&mut st, ste, sid)?;
            for i in 1..STRTAB_STE_DWORDS {
                ste.set(i, 0);
            }
            self.sync_ste(&mut st, ste, sid)?;
        }

        match state.iommus.iter().position(|n| n.smmu == self.id) {
            Some(i) => {
                state.iommus[i].refs -= 1;
                if state.iommus[i].refs == 0 {
                    state.iommus.swap_remove(i);
                }
            }
            None => warn!("smmu{}: not in domain {}", self.id, domain.id),
        }
        Ok(())
    }

    /// Invalidate `[iova, iova + size)` on this instance.
    fn tlb_inv_range(
        &self,
        cmd: &mut CmdqEnt,
        pgsize_bitmap: usize,
        mut iova: usize,
        size: usize,
        granule: usize,
    ) -> HvResult {
        let mut st = self.inner.lock();
        if self.skip_sync(&st) {
            return Ok(());
        }

        let range_inv = self.features.contains(SmmuFeatures::RANGE_INV);
        let end = iova + size;
        let mut inv_range = granule;
        let mut num_pages = 0usize;
        let mut tg = 0u32;
        if range_inv {
            // Leaf page size.
            tg = pgsize_bitmap.trailing_zeros();
            num_pages = size >> tg;
            // Page size 12, 14, 16 (log2) is encoded 1, 2, 3.
            cmd.tlbi.tg = ((tg - 10) / 2) as u8;
            if cmd.tlbi.leaf {
                cmd.tlbi.ttl = (4 - (granule.trailing_zeros() - 3) / (tg - 3)) as u8;
            } else if num_pages & CMDQ_TLBI_RANGE_NUM_MAX as usize == 1 {
                // Avoid scale and num both being 0.
                num_pages += 1;
            }
        }

        while iova < end {
            if range_inv {
                if num_pages == 0 {
                    break;
                }
                // Each round covers 5 bits worth of the aligned size left.
                let scale = num_pages.trailing_zeros();
                let num = (num_pages >> scale) & CMDQ_TLBI_RANGE_NUM_MAX as usize;
                cmd.tlbi.scale = scale as u8;
                cmd.tlbi.num = (num - 1) as u8;
                inv_range = num << (scale + tg);
                num_pages -= num << scale;
            }
            cmd.tlbi.addr = iova as u64;
            if let Err(e) = self.add_cmd(&mut st, cmd) {
                warn!("smmu{}: TLBI not queued: {:?}", self.id, e);
            }
            iova = match iova.checked_add(inv_range) {
                Some(next) => next,
                None => break,
            };
        }
        self.sync_cmd(&mut st)
    }

    fn tlb_inv_all(&self, cmd: &CmdqEnt) -> HvResult {
        let mut st = self.inner.lock();
        if self.skip_sync(&st) {
            return Ok(());
        }
        self.send_cmd(&mut st, cmd)
    }
}

/// The host left the queue base in `CMDQ_BASE`; take it over.
fn init_cmdq(rp: &RegisterPage, host_mmu: &HostMmu, features: SmmuFeatures) -> HvResult<CmdQueue> {
    let base = rp.CMDQ_BASE.get();
    if base & !(Q_BASE_RWA | Q_BASE_ADDR_MASK | Q_BASE_LOG2SIZE) != 0 {
        return hv_result_err!(EINVAL, "smmu: bad CMDQ_BASE");
    }
    let log2size = field_get(Q_BASE_LOG2SIZE, base) as u32;
    let size = CmdQueue::size_bytes(log2size);
    let addr = (base & Q_BASE_ADDR_MASK) as PhysAddr;
    if !is_aligned(addr) {
        return hv_result_err!(EINVAL, "smmu: command queue not page aligned");
    }
    if !features.contains(SmmuFeatures::COHERENCY) {
        debug!("smmu: non-coherent command queue at {:#x}", addr);
    }
    host_mmu.donate_host_to_hyp(phys_to_pfn(addr), size.div_ceil(PAGE_SIZE), false)?;

    unsafe { core::ptr::write_bytes(addr as *mut u8, 0, size) };
    rp.CMDQ_PROD.set(0);
    rp.CMDQ_CONS.set(0);
    Ok(CmdQueue::new(addr, log2size))
}

fn init_registers(rp: &RegisterPage) -> HvResult {
    // Fail closed: the host must have left GBPA aborting.
    if rp.GBPA.get() & GBPA_ABORT == 0 {
        return hv_result_err!(EINVAL, "smmu: GBPA does not abort");
    }

    rp.CR0.set(0);
    let mut acked = false;
    for _ in 0..ARM_SMMU_POLL_TIMEOUT_US {
        if rp.CR0ACK.get() == 0 {
            acked = true;
            break;
        }
        udelay(1);
    }
    if !acked {
        return hv_result_err!(ETIMEDOUT);
    }

    let cr1 = field_prep(CR1_TABLE_SH, SH_ISH)
        | field_prep(CR1_TABLE_OC, CR1_CACHE_WB)
        | field_prep(CR1_TABLE_IC, CR1_CACHE_WB)
        | field_prep(CR1_QUEUE_SH, SH_ISH)
        | field_prep(CR1_QUEUE_OC, CR1_CACHE_WB)
        | field_prep(CR1_QUEUE_IC, CR1_CACHE_WB);
    rp.CR1.set(cr1 as u32);
    rp.CR2.set(CR2_PTM);
    rp.IRQ_CTRL.set(0);

    let gerror = rp.GERROR.get();
    let gerrorn = rp.GERRORN.get();
    // Service Failure Mode is fatal
    if (gerror ^ gerrorn) & GERROR_SFM_ERR != 0 {
        return hv_result_err!(EIO, "smmu: service failure mode");
    }
    // Clear pending errors
    rp.GERRORN.set(gerror);
    Ok(())
}

struct IommuNode {
    smmu: usize,
    refs: u32,
}

struct DomainState {
    ty: DomainType,
    iommus: Vec<IommuNode>,
}

/// Page table of a domain, created by the first attach.
pub struct DomainPgtable {
    /// Configuration the table was requested with.
    src: IoPgtableCfg,
    /// Configuration after geometry is computed, immutable.
    cfg: IoPgtableCfg,
    pgt: Mutex<Option<LpaePgtable>>,
}

/// SMMU side of an IOMMU domain.
///
/// Lock order: `pgtable.pgt`, then `state`, then the instance locks.
pub struct SmmuDomain {
    id: u32,
    state: RwLock<DomainState>,
    pgtable: Once<DomainPgtable>,
}

pub struct DomainTlb<'a> {
    smmus: &'a [Smmuv3],
    domain: &'a SmmuDomain,
}

impl TlbFlushOps for DomainTlb<'_> {
    fn tlb_flush_walk(&self, iova: usize, size: usize, granule: usize) {
        self.domain.tlb_inv_range(self.smmus, iova, size, granule, false);
    }

    fn tlb_add_page(&self, gather: Option<&mut IotlbGather>, iova: usize, granule: usize) {
        match gather {
            Some(gather) => self.domain.gather_add_page(self.smmus, gather, iova, granule),
            None => self.domain.tlb_inv_range(self.smmus, iova, granule, granule, true),
        }
    }
}

impl SmmuDomain {
    pub fn new(id: u32, ty: DomainType) -> Self {
        Self {
            id,
            state: RwLock::new(DomainState {
                ty,
                iommus: Vec::new(),
            }),
            pgtable: Once::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn ty(&self) -> DomainType {
        self.state.read().ty
    }

    pub fn is_finalised(&self) -> bool {
        self.pgtable.get().is_some()
    }

    pub fn pgtable_cfg(&self) -> Option<&IoPgtableCfg> {
        self.pgtable.get().map(|dp| &dp.cfg)
    }

    /// Allocate the page table from `cfg`. The identity domain is populated
    /// by the caller.
    pub fn finalise(&self, cfg: &IoPgtableCfg) -> HvResult<&DomainPgtable> {
        self.pgtable.try_call_once(|| {
            let mut pgt = LpaePgtable::new(cfg.clone(), &FrameTableAllocator).map_err(HvError::from)?;
            if self.id == super::IDMAP_ID {
                pgt.set_idmapped();
            }
            Ok(DomainPgtable {
                src: cfg.clone(),
                cfg: pgt.cfg().clone(),
                pgt: Mutex::new(Some(pgt)),
            })
        })
    }

    fn config_s2(&self, cfg: &IoPgtableCfg, ent: &mut [u64; STRTAB_STE_DWORDS]) {
        let vtcr = &cfg.tcr;
        ent[0] = STRTAB_STE_0_V | field_prep(STRTAB_STE_0_CFG, STRTAB_STE_0_CFG_S2_TRANS);
        ent[1] = field_prep(STRTAB_STE_1_SHCFG, STRTAB_STE_1_SHCFG_INCOMING);
        ent[2] = field_prep(
            STRTAB_STE_2_VTCR,
            field_prep(STRTAB_STE_2_VTCR_S2PS, vtcr.ps)
                | field_prep(STRTAB_STE_2_VTCR_S2TG, vtcr.tg)
                | field_prep(STRTAB_STE_2_VTCR_S2SH0, vtcr.sh)
                | field_prep(STRTAB_STE_2_VTCR_S2OR0, vtcr.orgn)
                | field_prep(STRTAB_STE_2_VTCR_S2IR0, vtcr.irgn)
                | field_prep(STRTAB_STE_2_VTCR_S2SL0, vtcr.sl)
                | field_prep(STRTAB_STE_2_VTCR_S2T0SZ, vtcr.tsz),
        ) | field_prep(STRTAB_STE_2_S2VMID, self.id as u64)
            | STRTAB_STE_2_S2AA64
            | STRTAB_STE_2_S2R;
        ent[3] = cfg.ttbr as u64 & STRTAB_STE_3_S2TTB_MASK;
    }

    fn tlbi_template(&self, cfg: &IoPgtableCfg, leaf: bool) -> CmdqEnt {
        let mut cmd = CmdqEnt::default();
        cmd.tlbi.leaf = leaf;
        if cfg.fmt == IoPgtableFmt::Lpae64S2 {
            cmd.opcode = CMDQ_OP_TLBI_S2_IPA;
            cmd.tlbi.vmid = self.id as u16;
        } else {
            cmd.opcode = CMDQ_OP_TLBI_NH_VA;
            cmd.tlbi.asid = self.id as u16;
            // Domain IDs are unique across all VMs.
            cmd.tlbi.vmid = 0;
        }
        cmd
    }

    pub fn tlb_inv_range(&self, smmus: &[Smmuv3], iova: usize, size: usize, granule: usize, leaf: bool) {
        let Some(cfg) = self.pgtable_cfg() else {
            return;
        };
        if iova.checked_add(size).is_none() {
            warn!("domain {}: TLBI range overflows", self.id);
            return;
        }
        let state = self.state.read();
        for node in state.iommus.iter() {
            let mut cmd = self.tlbi_template(cfg, leaf);
            if let Err(e) = smmus[node.smmu].tlb_inv_range(&mut cmd, cfg.pgsize_bitmap, iova, size, granule) {
                warn!("domain {}: TLBI on smmu{} failed: {:?}", self.id, node.smmu, e);
            }
        }
    }

    pub fn tlb_flush_all(&self, smmus: &[Smmuv3]) {
        let Some(cfg) = self.pgtable_cfg() else {
            return;
        };
        let mut cmd = CmdqEnt::default();
        if cfg.fmt == IoPgtableFmt::Lpae64S2 {
            cmd.opcode = CMDQ_OP_TLBI_S12_VMALL;
            cmd.tlbi.vmid = self.id as u16;
        } else {
            cmd.opcode = CMDQ_OP_TLBI_NH_ASID;
            cmd.tlbi.asid = self.id as u16;
        }
        let state = self.state.read();
        for node in state.iommus.iter() {
            if let Err(e) = smmus[node.smmu].tlb_inv_all(&cmd) {
                warn!("domain {}: flush on smmu{} failed: {:?}", self.id, node.smmu, e);
            }
        }
    }

    pub fn iotlb_sync(&self, smmus: &[Smmuv3], gather: &mut IotlbGather) {
        if gather.pgsize != 0 {
            let size = gather.end - gather.start + 1;
            self.tlb_inv_range(smmus, gather.start, size, gather.pgsize, true);
        }
        gather.reset();
    }

    /// Queue a leaf invalidation. A page of another size, or one that would
    /// leave a hole in the gathered range, flushes the gather first.
    pub fn gather_add_page(&self, smmus: &[Smmuv3], gather: &mut IotlbGather, iova: usize, size: usize) {
        if (gather.pgsize != 0 && gather.pgsize != size) || gather.is_disjoint(iova, size) {
            self.iotlb_sync(smmus, gather);
        }
        gather.pgsize = size;
        gather.add_range(iova, size);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn map_pages(
        &self,
        smmus: &[Smmuv3],
        mut iova: usize,
        mut paddr: PhysAddr,
        pgsize: usize,
        mut pgcount: usize,
        prot: MemFlags,
        total_mapped: &mut usize,
    ) -> HvResult {
        let dp = self.pgtable.get().ok_or(hv_err!(EINVAL))?;
        let granule = 1usize << dp.cfg.pgsize_bitmap.trailing_zeros();
        if (iova | paddr | pgsize) & (granule - 1) != 0 {
            return hv_result_err!(EINVAL);
        }
        let tlb = DomainTlb { smmus, domain: self };
        let ops = PgtableOps {
            alloc: &FrameTableAllocator,
            tlb: &tlb,
        };
        let guard = dp.pgt.lock();
        let pgt = guard.as_ref().ok_or(hv_err!(EINVAL))?;
        while pgcount > 0 {
            let mut mapped = 0;
            pgt.map_pages(iova, paddr, pgsize, pgcount, prot, ops, &mut mapped)?;
            if mapped == 0 || mapped % pgsize != 0 || mapped > pgcount * pgsize {
                warn!("domain {}: bad map progress {:#x}", self.id, mapped);
                break;
            }
            pgcount -= mapped / pgsize;
            *total_mapped += mapped;
            iova += mapped;
            paddr += mapped;
        }
        Ok(())
    }

    pub fn unmap_pages(
        &self,
        smmus: &[Smmuv3],
        iova: usize,
        pgsize: usize,
        pgcount: usize,
        gather: &mut IotlbGather,
        walker: &mut dyn FnMut(PhysAddr, usize),
    ) -> usize {
        let Some(dp) = self.pgtable.get() else {
            return 0;
        };
        let granule = 1usize << dp.cfg.pgsize_bitmap.trailing_zeros();
        if (iova | pgsize) & (granule - 1) != 0 {
            return 0;
        }
        let tlb = DomainTlb { smmus, domain: self };
        let ops = PgtableOps {
            alloc: &FrameTableAllocator,
            tlb: &tlb,
        };
        let guard = dp.pgt.lock();
        match guard.as_ref() {
            Some(pgt) => pgt.unmap_pages(iova, pgsize, pgcount, ops, Some(gather), Some(walker)),
            None => 0,
        }
    }

    pub fn iova_to_phys(&self, iova: usize) -> PhysAddr {
        let Some(dp) = self.pgtable.get() else {
            return 0;
        };
        let guard = dp.pgt.lock();
        guard.as_ref().map_or(0, |pgt| pgt.iova_to_phys(iova))
    }

    /// Mirror a host stage-2 change. Empty `prot` unmaps.
    pub fn host_stage2_idmap(&self, smmus: &[Smmuv3], start: PhysAddr, end: PhysAddr, prot: MemFlags) {
        let Some(dp) = self.pgtable.get() else {
            return;
        };
        let end = if dp.cfg.oas >= usize::BITS as usize {
            end
        } else {
            end.min(1 << dp.cfg.oas)
        };
        if start >= end {
            return;
        }
        let mut prot = prot;
        if !prot.is_empty() && !prot.contains(MemFlags::MMIO) && dp.cfg.coherent_walk {
            prot |= MemFlags::CACHE;
        }

        let tlb = DomainTlb { smmus, domain: self };
        let ops = PgtableOps {
            alloc: &FrameTableAllocator,
            tlb: &tlb,
        };
        let guard = dp.pgt.lock();
        let Some(pgt) = guard.as_ref() else {
            return;
        };
        let mut start = start;
        let mut size = end - start;
        while size > 0 {
            let (pgsize, pgcount) = pgt.pgsize_for(start, start, size);
            if pgsize == 0 {
                warn!("idmap: unaligned range at {:#x}", start);
                return;
            }
            let done = if prot.is_empty() {
                pgt.unmap_pages(start, pgsize, pgcount, ops, None, None)
            } else {
                let mut mapped = 0;
                let ret = pgt.map_pages(start, start, pgsize, pgcount, prot, ops, &mut mapped);
                if let Err(e) = ret {
                    warn!("idmap: map {:#x} failed: {:?}", start, e);
                }
                mapped
            };
            if done == 0 {
                return;
            }
            size -= done;
            start += done;
        }
    }

    /// Flush the domain's TLB entries and free its page table.
    pub fn free(&self, smmus: &[Smmuv3]) {
        let Some(dp) = self.pgtable.get() else {
            return;
        };
        let pgt = dp.pgt.lock().take();
        self.tlb_flush_all(smmus);
        if let Some(pgt) = pgt {
            pgt.destroy(&FrameTableAllocator);
        }
    }

    pub fn nr_iommus(&self) -> usize {
        self.state.read().iommus.len()
    }
}
