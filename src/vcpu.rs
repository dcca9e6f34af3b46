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
//! Hypervisor-side vCPUs.
//!
//! A vCPU is registered once from the host's copy, then loaded on at most one
//! physical CPU at a time. Its PSCI power state is only ever advanced with
//! atomic operations so that guests racing on `CPU_ON` see a single winner.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use numeric_enum_macro::numeric_enum;
use spin::{Mutex, MutexGuard};

use crate::arch::cpu::MPIDR_HWID_BITMASK;
use crate::arch::trap::field::{DFR0_PMUVER, ISAR1_APA, ISAR1_API, ISAR1_GPA, ISAR1_GPI, PFR0_SVE};
use crate::arch::trap::{IdRegs, TrapConfig};
use crate::consts::HYP_REQ_MAX;
use crate::error::HvResult;
use crate::memory::{HostMmu, HostShared, HostVirtAddr, HypMemcache};
use crate::percpu::{LoadedVcpu, PerCpu};
use crate::vm::{PkvmVm, VmRegistry};
use crate::{read_once, write_once};

pub const MP_STATE_RUNNABLE: u32 = 0;
pub const MP_STATE_STOPPED: u32 = 1;

/// EL1h with all exceptions masked.
const PSTATE_RESET: u64 = 0x3c5;
const SCTLR_EL1_EE: u64 = 1 << 25;

const VCPU_NOT_LOADED: usize = usize::MAX;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum PowerState {
        On = 0,
        Off = 1,
        OnPending = 2,
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VcpuFeatures: u64 {
        const POWER_OFF = 1 << 0;
        const EL1_32BIT = 1 << 1;
        const PSCI_0_2 = 1 << 2;
        const PMU_V3 = 1 << 3;
        const SVE = 1 << 4;
        const PTRAUTH_ADDRESS = 1 << 5;
        const PTRAUTH_GENERIC = 1 << 6;
    }
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum HypReqType {
        Last = 0,
        Mem = 1,
        Map = 2,
    }
}

numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Eq, PartialEq, Copy, Clone)]
    pub enum MemDest {
        VcpuMemcache = 1,
        HypAlloc = 2,
    }
}

/// One slot of the request ring the host reads after an exit.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HypReq {
    pub ty: u8,
    pub dest: u8,
    pub nr_pages: u32,
    pub guest_ipa: u64,
    pub size: u64,
}

pub type HypReqRing = [HypReq; HYP_REQ_MAX];

/// Work the hypervisor asks the host to do before a vCPU can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypRequest {
    Mem { dest: MemDest, nr_pages: u32 },
    Map { guest_ipa: u64, size: u64 },
}

impl From<HypRequest> for HypReq {
    fn from(req: HypRequest) -> Self {
        match req {
            HypRequest::Mem { dest, nr_pages } => Self {
                ty: HypReqType::Mem as u8,
                dest: dest as u8,
                nr_pages,
                ..Default::default()
            },
            HypRequest::Map { guest_ipa, size } => Self {
                ty: HypReqType::Map as u8,
                guest_ipa,
                size,
                ..Default::default()
            },
        }
    }
}

impl HypReq {
    pub fn decode(&self) -> Option<HypRequest> {
        match HypReqType::try_from(self.ty).ok()? {
            HypReqType::Last => None,
            HypReqType::Mem => Some(HypRequest::Mem {
                dest: MemDest::try_from(self.dest).ok()?,
                nr_pages: self.nr_pages,
            }),
            HypReqType::Map => Some(HypRequest::Map {
                guest_ipa: self.guest_ipa,
                size: self.size,
            }),
        }
    }
}

/// The host's view of a vCPU, shared with the hypervisor while it exists.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HostVcpu {
    pub vcpu_id: u32,
    pub vcpu_idx: u32,
    pub mp_state: u32,
    pub cflags: u32,
    pub features: u64,
    pub regs: [u64; 31],
    pub pc: u64,
    pub pstate: u64,
    pub sctlr_el1: u64,
    /// Pages the host offers for this vCPU's stage-2 tables.
    pub memcache: HypMemcache,
}

/// Entry point recorded by `CPU_ON` and applied on the next load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetState {
    pub pc: u64,
    pub r0: u64,
    pub be: bool,
    pub pending: bool,
}

/// General purpose state of a vCPU as the hypervisor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuContext {
    pub regs: [u64; 31],
    pub pc: u64,
    pub pstate: u64,
    pub sctlr_el1: u64,
}

impl Default for VcpuContext {
    fn default() -> Self {
        Self {
            regs: [0; 31],
            pc: 0,
            pstate: PSTATE_RESET,
            sctlr_el1: 0,
        }
    }
}

impl VcpuContext {
    /// SMCCC function ID, the low 32 bits of X0.
    pub fn function(&self) -> u32 {
        self.regs[0] as u32
    }

    pub fn arg(&self, n: usize) -> u64 {
        self.regs[n]
    }

    pub fn set_retval(&mut self, a0: u64, a1: u64, a2: u64, a3: u64) {
        self.regs[..4].copy_from_slice(&[a0, a1, a2, a3]);
    }

    pub fn is_be(&self) -> bool {
        self.sctlr_el1 & SCTLR_EL1_EE != 0
    }
}

fn vcpu_id_to_mpidr(vcpu_id: u32) -> u64 {
    let id = vcpu_id as u64;
    let aff0 = id & 0xf;
    let aff1 = (id >> 4) & 0xff;
    let aff2 = (id >> 12) & 0xff;
    (aff0 | (aff1 << 8) | (aff2 << 16)) & MPIDR_HWID_BITMASK
}

/// Features a protected guest may enable on this system.
fn pvm_allowed_features(id_regs: &IdRegs) -> VcpuFeatures {
    let id = id_regs.sanitised();
    let field = |reg: u64, shift: usize| (reg >> shift) & 0xf;

    let mut allowed = VcpuFeatures::PSCI_0_2;
    if field(id.dfr0, DFR0_PMUVER) != 0 {
        allowed |= VcpuFeatures::PMU_V3;
    }
    if field(id.pfr0, PFR0_SVE) != 0 {
        allowed |= VcpuFeatures::SVE;
    }
    if field(id.isar1, ISAR1_APA) != 0 || field(id.isar1, ISAR1_API) != 0 {
        allowed |= VcpuFeatures::PTRAUTH_ADDRESS;
    }
    if field(id.isar1, ISAR1_GPA) != 0 || field(id.isar1, ISAR1_GPI) != 0 {
        allowed |= VcpuFeatures::PTRAUTH_GENERIC;
    }
    allowed
}

pub struct HypVcpu {
    idx: usize,
    vcpu_id: u32,
    mpidr: u64,
    protected: bool,
    features: VcpuFeatures,
    traps: TrapConfig,
    host_vcpu: HostShared<HostVcpu>,
    hyp_reqs: HostShared<HypReqRing>,
    hyp_req_len: usize,
    power_state: AtomicU32,
    mp_state: AtomicU32,
    reset_state: Mutex<ResetState>,
    ctxt: Mutex<VcpuContext>,
    memcache: Mutex<HypMemcache>,
    loaded_on: AtomicUsize,
}

impl HypVcpu {
    /// Register vCPU `idx` of `vm` from the pinned host structures.
    fn new(
        host_mmu: &HostMmu,
        vm: &PkvmVm,
        idx: usize,
        host_vcpu_hva: HostVirtAddr,
        hyp_reqs_hva: HostVirtAddr,
    ) -> HvResult<Self> {
        let host_vcpu = HostShared::<HostVcpu>::pin(host_mmu, host_vcpu_hva)
            .map_err(|_| hv_err!(EBUSY, "host vcpu not shared"))?;
        let hyp_reqs = match HostShared::<HypReqRing>::pin(host_mmu, hyp_reqs_hva) {
            Ok(reqs) => reqs,
            Err(_) => {
                host_vcpu.unpin(host_mmu);
                return hv_result_err!(EBUSY, "request ring not shared");
            }
        };

        let (features, reset, power) = match Self::init_state(vm, idx, &host_vcpu) {
            Ok(state) => state,
            Err(e) => {
                host_vcpu.unpin(host_mmu);
                hyp_reqs.unpin(host_mmu);
                return Err(e);
            }
        };

        let params = vm.params();
        let (traps, ctxt) = if vm.is_protected() {
            (
                TrapConfig::for_protected(&params.id_regs, &params.cpu_caps),
                VcpuContext::default(),
            )
        } else {
            let ctxt = VcpuContext {
                regs: read_once!(host_vcpu, regs),
                pc: read_once!(host_vcpu, pc),
                pstate: read_once!(host_vcpu, pstate),
                sctlr_el1: read_once!(host_vcpu, sctlr_el1),
            };
            (
                TrapConfig::for_host_guest(params.host_hcr_el2, &params.cpu_caps),
                ctxt,
            )
        };

        let vcpu_id = read_once!(host_vcpu, vcpu_id);
        let mp_state = read_once!(host_vcpu, mp_state);
        let vcpu = Self {
            idx,
            vcpu_id,
            mpidr: vcpu_id_to_mpidr(vcpu_id),
            protected: vm.is_protected(),
            features,
            traps,
            host_vcpu,
            hyp_reqs,
            hyp_req_len: params.hyp_req_len.min(HYP_REQ_MAX),
            power_state: AtomicU32::new(power as u32),
            mp_state: AtomicU32::new(mp_state),
            reset_state: Mutex::new(reset),
            ctxt: Mutex::new(ctxt),
            memcache: Mutex::new(HypMemcache::new()),
            loaded_on: AtomicUsize::new(VCPU_NOT_LOADED),
        };
        vcpu.write_req(0, HypReq::default());
        Ok(vcpu)
    }

    fn init_state(
        vm: &PkvmVm,
        idx: usize,
        host_vcpu: &HostShared<HostVcpu>,
    ) -> HvResult<(VcpuFeatures, ResetState, PowerState)> {
        if read_once!(host_vcpu, vcpu_idx) as usize != idx {
            return hv_result_err!(EINVAL, "vcpu index mismatch");
        }
        let host_features = VcpuFeatures::from_bits_truncate(read_once!(host_vcpu, features));
        let features = match vm.is_protected() {
            true => host_features & pvm_allowed_features(&vm.params().id_regs),
            false => host_features,
        };

        let mut reset = ResetState::default();
        let power = match read_once!(host_vcpu, mp_state) {
            MP_STATE_STOPPED => PowerState::Off,
            MP_STATE_RUNNABLE if vm.has_pvmfw() => {
                if !vm.claim_firmware_entry(idx) {
                    return hv_result_err!(EINVAL, "firmware entry vcpu already set");
                }
                reset.pending = true;
                PowerState::OnPending
            }
            MP_STATE_RUNNABLE => {
                let regs = read_once!(host_vcpu, regs);
                reset.pc = read_once!(host_vcpu, pc);
                reset.r0 = regs[0];
                reset.pending = true;
                PowerState::OnPending
            }
            _ => return hv_result_err!(EINVAL, "bad mp_state"),
        };
        Ok((features, reset, power))
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn mpidr(&self) -> u64 {
        self.mpidr
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn features(&self) -> VcpuFeatures {
        self.features
    }

    pub fn traps(&self) -> &TrapConfig {
        &self.traps
    }

    pub fn power_state(&self) -> PowerState {
        let raw = self.power_state.load(Ordering::Acquire);
        PowerState::try_from(raw).unwrap_or(PowerState::Off)
    }

    pub(crate) fn raw_power_state(&self) -> u32 {
        self.power_state.load(Ordering::Acquire)
    }

    /// Move OFF to ON_PENDING. On failure returns the state found instead.
    pub(crate) fn try_power_on(&self) -> Result<(), u32> {
        self.power_state
            .compare_exchange(
                PowerState::Off as u32,
                PowerState::OnPending as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    pub(crate) fn set_power_state(&self, state: PowerState) {
        self.power_state.store(state as u32, Ordering::Release);
    }

    pub fn mp_state(&self) -> u32 {
        self.mp_state.load(Ordering::Acquire)
    }

    /// Also visible to the host at once.
    pub(crate) fn set_mp_state(&self, state: u32) {
        self.mp_state.store(state, Ordering::Release);
        write_once!(self.host_vcpu, mp_state, state);
    }

    pub fn reset_state(&self) -> ResetState {
        *self.reset_state.lock()
    }

    pub(crate) fn set_reset_state(&self, reset: ResetState) {
        *self.reset_state.lock() = reset;
    }

    pub fn context(&self) -> VcpuContext {
        *self.ctxt.lock()
    }

    pub(crate) fn set_context(&self, ctxt: VcpuContext) {
        *self.ctxt.lock() = ctxt;
    }

    pub fn memcache(&self) -> MutexGuard<'_, HypMemcache> {
        self.memcache.lock()
    }

    /// Physical CPU this vCPU is loaded on.
    pub fn loaded_on(&self) -> Option<usize> {
        match self.loaded_on.load(Ordering::Acquire) {
            VCPU_NOT_LOADED => None,
            cpu => Some(cpu),
        }
    }

    fn read_req(&self, i: usize) -> HypReq {
        unsafe { (self.hyp_reqs.as_ptr() as *const HypReq).add(i).read_volatile() }
    }

    fn write_req(&self, i: usize, req: HypReq) {
        unsafe { (self.hyp_reqs.as_ptr() as *mut HypReq).add(i).write_volatile(req) }
    }

    /// Requests currently queued for the host, oldest first.
    pub fn pending_requests(&self) -> impl Iterator<Item = HypRequest> + '_ {
        (0..self.hyp_req_len)
            .map(|i| self.read_req(i))
            .take_while(|req| req.ty != HypReqType::Last as u8)
            .filter_map(|req| req.decode())
    }

    /// Queue `req` for the host. Fails when no slot is left in front of the
    /// terminator.
    pub fn hyp_req_reserve(&self, req: HypRequest) -> Option<usize> {
        let len = self.hyp_req_len;
        let i = (0..len)
            .find(|&i| self.read_req(i).ty == HypReqType::Last as u8)
            .unwrap_or(len);
        if i >= len {
            warn!("vcpu {}: request ring has no terminator", self.idx);
        }
        if i + 1 >= len {
            return None;
        }
        self.write_req(i, req.into());
        self.write_req(i + 1, HypReq::default());
        Some(i)
    }

    /// Move pages from the host's vCPU memcache into ours.
    pub fn topup_memcache(&self, host_mmu: &HostMmu, min_pages: usize) -> HvResult {
        let host_mc = unsafe { &mut *core::ptr::addr_of_mut!((*self.host_vcpu.as_ptr()).memcache) };
        self.memcache.lock().topup(min_pages, host_mc, host_mmu)
    }

    /// Reload a non-protected vCPU's registers from the host.
    pub(crate) fn sync_from_host(&self) {
        if self.protected {
            return;
        }
        let mut ctxt = self.ctxt.lock();
        ctxt.regs = read_once!(self.host_vcpu, regs);
        ctxt.pc = read_once!(self.host_vcpu, pc);
        ctxt.pstate = read_once!(self.host_vcpu, pstate);
        ctxt.sctlr_el1 = read_once!(self.host_vcpu, sctlr_el1);
    }

    /// Publish state back to the host. Registers of protected vCPUs stay private.
    pub fn sync_to_host(&self) {
        write_once!(self.host_vcpu, mp_state, self.mp_state());
        if self.protected {
            return;
        }
        let ctxt = self.context();
        write_once!(self.host_vcpu, regs, ctxt.regs);
        write_once!(self.host_vcpu, pc, ctxt.pc);
        write_once!(self.host_vcpu, pstate, ctxt.pstate);
        write_once!(self.host_vcpu, sctlr_el1, ctxt.sctlr_el1);
    }

    /// Apply the pending reset and power the vCPU on.
    pub fn reset(&self, vm: &PkvmVm) {
        let mut reset = self.reset_state.lock();
        if !reset.pending {
            warn!("vcpu {}: reset without a pending request", self.idx);
        }

        let mut ctxt = VcpuContext {
            pc: reset.pc,
            ..Default::default()
        };
        ctxt.regs[0] = reset.r0;
        if reset.be {
            ctxt.sctlr_el1 |= SCTLR_EL1_EE;
        }
        if vm.take_firmware_entry(self.idx) {
            // X0-X14 come from the VMM, X15 is the boot protocol version.
            let host_regs = read_once!(self.host_vcpu, regs);
            ctxt.regs[..=14].copy_from_slice(&host_regs[..=14]);
            ctxt.regs[15] = 0;
            ctxt.pc = vm.pvmfw_load_addr();
            vm.stage2().enroll_mmio_guard();
        }
        *self.ctxt.lock() = ctxt;
        reset.pending = false;

        if self.power_state() != PowerState::OnPending {
            warn!("vcpu {}: reset while not powering on", self.idx);
        }
        self.set_mp_state(MP_STATE_RUNNABLE);
        self.set_power_state(PowerState::On);
        debug!("vcpu {}: reset, pc {:#x}", self.idx, ctxt.pc);
    }

    /// Return everything the vCPU holds. The VM is already unreachable.
    pub(crate) fn teardown(&self, host_mmu: &HostMmu, teardown_mc: &mut HypMemcache) {
        self.memcache.lock().drain_to_host(teardown_mc, host_mmu);
        self.host_vcpu.unpin(host_mmu);
        self.hyp_reqs.unpin(host_mmu);
    }
}

impl VmRegistry {
    /// Register the next vCPU of `handle` from the host's copy.
    pub fn init_vcpu(
        &self,
        handle: u32,
        host_vcpu: HostVirtAddr,
        hyp_reqs: HostVirtAddr,
    ) -> HvResult {
        self.with_vm(handle, |vm| {
            if vm.is_dying() {
                return hv_result_err!(ENOENT);
            }
            let mut vcpus = vm.vcpus();
            let idx = vcpus.len();
            if idx >= vm.created_vcpus() {
                return hv_result_err!(EINVAL, "all vcpus created");
            }
            let vcpu = HypVcpu::new(self.host_mmu(), vm, idx, host_vcpu, hyp_reqs)?;
            debug!(
                "vm {:#x}: vcpu {} registered, power {:?}",
                handle,
                idx,
                vcpu.power_state()
            );
            vcpus.push(Arc::new(vcpu));
            Ok(())
        })
        .unwrap_or_else(|| hv_result_err!(ENOENT))
    }

    /// Load vCPU `idx` of `handle` on `cpu`.
    pub fn load_vcpu(&self, cpu: &PerCpu, handle: u32, idx: usize) -> Option<LoadedVcpu> {
        if cpu.has_loaded_vcpu() {
            warn!("cpu {}: a vcpu is already loaded", cpu.id);
            return None;
        }
        let loaded = self
            .with_vm(handle, |vm| {
                if vm.is_dying() {
                    return None;
                }
                let vcpu = vm.vcpu(idx)?;
                vcpu.loaded_on
                    .compare_exchange(VCPU_NOT_LOADED, cpu.id, Ordering::Acquire, Ordering::Relaxed)
                    .ok()?;
                VmRegistry::get_vm_raw(vm);
                Some(LoadedVcpu {
                    vm: vm.clone(),
                    vcpu,
                })
            })
            .flatten()?;

        cpu.set_loaded(loaded.clone());
        loaded.vcpu.sync_from_host();
        if loaded.vcpu.reset_state().pending {
            loaded.vcpu.reset(&loaded.vm);
        }
        Some(loaded)
    }

    /// Put whatever vCPU is loaded on `cpu`.
    pub fn put_vcpu(&self, cpu: &PerCpu) {
        let Some(loaded) = cpu.clear_loaded() else {
            return;
        };
        loaded.vcpu.sync_to_host();
        loaded.vcpu.loaded_on.store(VCPU_NOT_LOADED, Ordering::Release);
        VmRegistry::put_vm_raw(&loaded.vm);
    }
}
