use std::sync::{Arc, Mutex};
use std::vec::Vec;

use super::psci::{PsciFnId, PsciRet, PSCI_VERSION_1_1};
use super::smccc::*;
use super::*;
use crate::config::{HvConfigMemoryRegion, HvSystemConfig};
use crate::consts::INVALID_ADDRESS;
use crate::error::HvErrorNum;
use crate::memory::addr::phys_to_pfn;
use crate::memory::guest::GuestStage2;
use crate::memory::{OwnerId, PhysAddr, PAGE_SHIFT};
use crate::test_utils::TestRam;
use crate::vcpu::{
    HostVcpu, HypReqRing, HypRequest, MemDest, PowerState, VcpuContext, MP_STATE_RUNNABLE,
    MP_STATE_STOPPED,
};
use crate::vm::HostKvm;

const SZ_2M: usize = 0x20_0000;
const GUEST_PC: u64 = 0x4000_1000;
const PVMFW_LOAD_ADDR: u64 = 0x7fc0_0000;

/// Answers every call with a fixed pattern and remembers what it saw.
#[derive(Default)]
struct MockMonitor {
    calls: Mutex<Vec<(u32, [u64; 3])>>,
}

impl SecureMonitor for MockMonitor {
    fn smc(&self, fid: u32, args: [u64; 3]) -> [u64; 4] {
        self.calls.lock().unwrap().push((fid, args));
        [0, 0x1111, 0x2222, fid as u64]
    }
}

struct Fixture {
    ram: TestRam,
    hv: Hypervisor,
    smc: Arc<MockMonitor>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(|_, _| {})
    }

    fn with_config(tweak: impl FnOnce(&mut HvSystemConfig, &TestRam)) -> Self {
        let ram = TestRam::new(2048);
        let mut config = HvSystemConfig::default();
        config.num_cpus = 4;
        config.vm_table_size = 4;
        let range = ram.range();
        config
            .add_ram_region(HvConfigMemoryRegion::new(
                range.start as u64,
                (range.end - range.start) as u64,
            ))
            .unwrap();
        tweak(&mut config, &ram);
        let smc = Arc::new(MockMonitor::default());
        let hv = Hypervisor::new(config, smc.clone()).unwrap();
        let f = Self { ram, hv, smc };
        f.hcall(0, HyperCallCode::InitVmTable, &[]).unwrap();
        f
    }

    fn hcall(&self, cpu: usize, code: HyperCallCode, args: &[u64]) -> HyperCallResult {
        let mut regs = [0; 6];
        regs[..args.len()].copy_from_slice(args);
        self.hv.handle_host_hcall(cpu, code as u64, regs)
    }

    fn create_vm(&self, nr_vcpus: u32, protected: bool) -> u32 {
        let kvm = self.ram.share(
            self.hv.host_mmu(),
            HostKvm {
                created_vcpus: nr_vcpus,
                protected: protected as u32,
                pvmfw_load_addr: if protected { PVMFW_LOAD_ADDR } else { INVALID_ADDRESS },
                ..Default::default()
            },
        );
        let pgd = self.ram.pages(GuestStage2::pgd_size().unwrap() >> PAGE_SHIFT);
        self.hcall(0, HyperCallCode::InitVm, &[kvm as u64, pgd as u64])
            .unwrap() as u32
    }

    /// Returns the address of the host's copy of the vCPU.
    fn init_vcpu(&self, handle: u32, host_vcpu: HostVcpu) -> PhysAddr {
        let host_vcpu = self.ram.share(self.hv.host_mmu(), host_vcpu);
        let reqs = self.ram.share(self.hv.host_mmu(), HypReqRing::default());
        self.hcall(
            0,
            HyperCallCode::InitVcpu,
            &[handle as u64, host_vcpu as u64, reqs as u64],
        )
        .unwrap();
        host_vcpu
    }

    fn load(&self, cpu: usize, handle: u32, idx: usize) {
        self.hcall(cpu, HyperCallCode::VcpuLoad, &[handle as u64, idx as u64])
            .unwrap();
    }

    fn put(&self, cpu: usize) {
        self.hcall(cpu, HyperCallCode::VcpuPut, &[]).unwrap();
    }

    fn loaded(&self, cpu: usize) -> LoadedVcpu {
        self.hv.cpu(cpu).unwrap().loaded_vcpu().unwrap()
    }

    /// Issue an HVC from the vCPU loaded on `cpu`.
    fn hvc(&self, cpu: usize, fid: u32, args: [u64; 3]) -> (HvcExit, VcpuContext) {
        let loaded = self.loaded(cpu);
        let mut ctxt = loaded.vcpu.context();
        ctxt.regs[0] = fid as u64;
        ctxt.regs[1..4].copy_from_slice(&args);
        ctxt.pc = GUEST_PC;
        loaded.vcpu.set_context(ctxt);
        let exit = self.hv.handle_guest_hvc(cpu).unwrap();
        (exit, loaded.vcpu.context())
    }

    /// Give the loaded vCPU's host memcache `nr` pages and move them over.
    fn topup(&self, cpu: usize, host_vcpu: PhysAddr, nr: usize) {
        let host_mc = unsafe { &mut (*(host_vcpu as *mut HostVcpu)).memcache };
        self.ram.fill_memcache(host_mc, nr);
        self.hcall(cpu, HyperCallCode::TopupVcpuMemcache, &[]).unwrap();
    }

    /// 512 fresh pages starting on a 2M boundary.
    fn block(&self) -> PhysAddr {
        let next = self.ram.pages(0);
        self.ram.pages((SZ_2M - next % SZ_2M) % SZ_2M / PAGE_SIZE);
        self.ram.pages(SZ_2M / PAGE_SIZE)
    }
}

fn stopped(idx: u32) -> HostVcpu {
    HostVcpu {
        vcpu_id: idx,
        vcpu_idx: idx,
        mp_state: MP_STATE_STOPPED,
        ..Default::default()
    }
}

fn runnable(idx: u32, pc: u64) -> HostVcpu {
    HostVcpu {
        vcpu_id: idx,
        vcpu_idx: idx,
        mp_state: MP_STATE_RUNNABLE,
        pc,
        ..Default::default()
    }
}

/// A protected VM with vCPU 0 running on CPU 0 and the others stopped.
fn protected_vm(f: &Fixture, nr_vcpus: u32) -> (u32, PhysAddr) {
    let handle = f.create_vm(nr_vcpus, true);
    let host_vcpu = f.init_vcpu(handle, runnable(0, 0x8000_0000));
    for idx in 1..nr_vcpus {
        f.init_vcpu(handle, stopped(idx));
    }
    f.load(0, handle, 0);
    (handle, host_vcpu)
}

#[test]
fn test_unknown_host_call() {
    let f = Fixture::new();
    let err = f.hv.handle_host_hcall(0, 99, [0; 6]).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::ENOSYS);
    let err = f.hv.handle_host_hcall(4, 0, [0; 6]).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    // The table is only installed once.
    let err = f.hcall(0, HyperCallCode::InitVmTable, &[]).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EEXIST);
}

#[test]
fn test_host_vm_lifecycle() {
    let f = Fixture::new();
    let handle = f.create_vm(1, true);
    f.init_vcpu(handle, stopped(0));

    let err = f
        .hcall(0, HyperCallCode::VcpuLoad, &[handle as u64, 1])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    let err = f.hcall(0, HyperCallCode::VcpuSync, &[]).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);

    f.load(0, handle, 0);
    f.hcall(0, HyperCallCode::VcpuSync, &[]).unwrap();
    let err = f
        .hcall(0, HyperCallCode::StartTeardownVm, &[handle as u64])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EBUSY);
    f.put(0);

    f.hcall(0, HyperCallCode::StartTeardownVm, &[handle as u64])
        .unwrap();
    f.hcall(0, HyperCallCode::FinalizeTeardownVm, &[handle as u64])
        .unwrap();
    assert_eq!(f.hv.registry().nr_vms(), 0);
}

#[test]
fn test_guest_hvc_needs_a_loaded_vcpu() {
    let f = Fixture::new();
    let err = f.hv.handle_guest_hvc(0).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
}

#[test]
fn test_smccc_discovery() {
    let f = Fixture::new();
    protected_vm(&f, 1);

    let (exit, ctxt) = f.hvc(0, SMCCC_VERSION_FUNC_ID, [0; 3]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[0], SMCCC_VERSION_1_1);

    let (_, ctxt) = f.hvc(0, VENDOR_HYP_CALL_UID_FUNC_ID, [0; 3]);
    assert_eq!(ctxt.regs[..4], VENDOR_HYP_UID_KVM);

    let (_, ctxt) = f.hvc(0, KvmFnId::FEATURES, [0; 3]);
    assert_eq!(ctxt.regs[0], KVM_FEATURES);
    assert_ne!(ctxt.regs[0] & (1 << KvmFunc::MEM_SHARE), 0);

    let (_, ctxt) = f.hvc(0, KvmFnId::HYP_MEMINFO, [0; 3]);
    assert_eq!(ctxt.regs[..4], [PAGE_SIZE as u64, KVM_FUNC_HAS_RANGE, 0, 0]);
    let (_, ctxt) = f.hvc(0, KvmFnId::HYP_MEMINFO, [0, 0, 1]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);

    let (_, ctxt) = f.hvc(0, PsciFnId::PSCI_VERSION, [0; 3]);
    assert_eq!(ctxt.regs[0], PSCI_VERSION_1_1);
    let (_, ctxt) = f.hvc(0, PsciFnId::PSCI_FEATURES, [PsciFnId::CPU_ON_64 as u64, 0, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::SUCCESS);
    let (_, ctxt) = f.hvc(0, PsciFnId::PSCI_FEATURES, [0x8400_0005, 0, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::NOT_SUPPORTED);

    let (exit, ctxt) = f.hvc(0, 0xc600_00ff, [0; 3]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[0], PsciRet::NOT_SUPPORTED);

    // Power management of the whole system is the host's job.
    let (exit, ctxt) = f.hvc(0, PsciFnId::SYSTEM_RESET, [0; 3]);
    assert_eq!(exit, HvcExit::ToHost);
    assert_eq!(ctxt.regs[0], PsciFnId::SYSTEM_RESET as u64);
}

#[test]
fn test_psci_cpu_on_and_off() {
    let f = Fixture::new();
    let (handle, _) = protected_vm(&f, 2);
    let vm = f.hv.registry().get_vm(handle).unwrap();
    let target = vm.vcpu(1).unwrap();
    drop(vm);
    assert_eq!(target.power_state(), PowerState::Off);

    let (exit, _) = f.hvc(0, PsciFnId::CPU_ON_64, [1, 0x9000, 0x55]);
    assert_eq!(exit, HvcExit::ToHost);
    assert_eq!(target.power_state(), PowerState::OnPending);
    let reset = target.reset_state();
    assert!(reset.pending);
    assert_eq!((reset.pc, reset.r0), (0x9000, 0x55));

    let (_, ctxt) = f.hvc(0, PsciFnId::CPU_ON_64, [1, 0x9000, 0x55]);
    assert_eq!(ctxt.regs[0], PsciRet::ON_PENDING);
    let (_, ctxt) = f.hvc(0, PsciFnId::AFFINITY_INFO_64, [1, 0, 0]);
    assert_eq!(ctxt.regs[0], PowerState::OnPending as u64);

    // The host runs the target, which applies the entry point.
    f.load(1, handle, 1);
    assert_eq!(target.power_state(), PowerState::On);
    assert!(!target.reset_state().pending);
    let ctxt = target.context();
    assert_eq!((ctxt.pc, ctxt.regs[0]), (0x9000, 0x55));

    let (_, ctxt) = f.hvc(0, PsciFnId::CPU_ON_64, [1, 0x9000, 0x55]);
    assert_eq!(ctxt.regs[0], PsciRet::ALREADY_ON);
    let (_, ctxt) = f.hvc(0, PsciFnId::AFFINITY_INFO_64, [0, 1, 0]);
    assert_eq!(ctxt.regs[0], PowerState::On as u64);
    let (_, ctxt) = f.hvc(0, PsciFnId::AFFINITY_INFO_64, [0x5, 0, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::INVALID_PARAMS);
    let (_, ctxt) = f.hvc(0, PsciFnId::AFFINITY_INFO_64, [0, 4, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::INVALID_PARAMS);

    // Outside the MPIDR affinity fields.
    let (_, ctxt) = f.hvc(0, PsciFnId::CPU_ON_64, [1 << 40, 0, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::INVALID_PARAMS);
    let (_, ctxt) = f.hvc(0, PsciFnId::CPU_ON_64, [7, 0, 0]);
    assert_eq!(ctxt.regs[0], PsciRet::INVALID_PARAMS);

    let (exit, _) = f.hvc(1, PsciFnId::CPU_OFF, [0; 3]);
    assert_eq!(exit, HvcExit::ToHost);
    assert_eq!(target.power_state(), PowerState::Off);
    assert_eq!(target.mp_state(), MP_STATE_STOPPED);
    f.put(1);

    let (_, ctxt) = f.hvc(0, PsciFnId::AFFINITY_INFO_64, [1, 0, 0]);
    assert_eq!(ctxt.regs[0], PowerState::Off as u64);
}

#[test]
fn test_psci_32bit_calls_narrow_arguments() {
    let f = Fixture::new();
    let (handle, _) = protected_vm(&f, 2);

    let (exit, _) = f.hvc(0, PsciFnId::CPU_ON_32, [0xdead_0000_0000_0001, 0x1_0000_9000, 0]);
    assert_eq!(exit, HvcExit::ToHost);
    let target = f.hv.registry().get_vm(handle).unwrap().vcpu(1).unwrap();
    assert_eq!(target.reset_state().pc, 0x9000);
}

#[test]
fn test_psci_cpu_on_race_has_one_winner() {
    let f = Fixture::new();
    let handle = f.create_vm(3, true);
    f.init_vcpu(handle, runnable(0, 0x8000_0000));
    f.init_vcpu(handle, runnable(1, 0x8000_0000));
    f.init_vcpu(handle, stopped(2));
    f.load(0, handle, 0);
    f.load(1, handle, 1);

    let exits: Vec<(HvcExit, u64)> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..2)
            .map(|cpu| {
                let f = &f;
                s.spawn(move || {
                    let (exit, ctxt) = f.hvc(cpu, PsciFnId::CPU_ON_64, [2, 0x9000, cpu as u64]);
                    (exit, ctxt.regs[0])
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(exits.iter().filter(|(e, _)| *e == HvcExit::ToHost).count(), 1);
    let loser = exits.iter().find(|(e, _)| *e == HvcExit::Resume).unwrap();
    assert_eq!(loser.1, PsciRet::ON_PENDING);
}

#[test]
fn test_mem_share_asks_for_memcache() {
    let f = Fixture::new();
    let (_, host_vcpu) = protected_vm(&f, 1);
    let block = f.block();
    let ipa = 0x4000_0000u64;

    f.ram.fill_memcache(
        unsafe { &mut (*(host_vcpu as *mut HostVcpu)).memcache },
        2,
    );
    f.hcall(
        0,
        HyperCallCode::HostDonateGuest,
        &[phys_to_pfn(block) as u64, ipa >> PAGE_SHIFT, 512],
    )
    .unwrap();
    assert_eq!(f.hv.host_mmu().owner(block), OwnerId::Guest);

    // Sharing part of the 2M block splits it, and the memcache is short.
    let (exit, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [ipa, 4, 0]);
    assert_eq!(exit, HvcExit::HypReq);
    assert_eq!(ctxt.pc, GUEST_PC - 4);
    let loaded = f.loaded(0);
    let reqs: Vec<_> = loaded.vcpu.pending_requests().collect();
    assert_eq!(
        reqs,
        vec![HypRequest::Mem {
            dest: MemDest::VcpuMemcache,
            nr_pages: 2,
        }]
    );
    assert_eq!(loaded.vm.shared_mem(), 0);

    f.topup(0, host_vcpu, 2);
    let (exit, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [ipa, 4, 0]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[..2], [SMCCC_RET_SUCCESS, 4]);
    assert_eq!(loaded.vm.shared_mem(), 4 * PAGE_SIZE as u64);

    let (_, ctxt) = f.hvc(0, KvmFnId::MEM_UNSHARE, [ipa, 4, 0]);
    assert_eq!(ctxt.regs[..2], [SMCCC_RET_SUCCESS, 4]);
    assert_eq!(loaded.vm.shared_mem(), 0);
}

#[test]
fn test_mem_share_unmapped_asks_for_map() {
    let f = Fixture::new();
    protected_vm(&f, 1);
    let ipa = 0x5000_0000u64;

    let (exit, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [ipa, 2, 0]);
    assert_eq!(exit, HvcExit::HypReq);
    assert_eq!(ctxt.pc, GUEST_PC - 4);
    let reqs: Vec<_> = f.loaded(0).vcpu.pending_requests().collect();
    assert_eq!(
        reqs,
        vec![
            HypRequest::Map {
                guest_ipa: ipa,
                size: 2 * PAGE_SIZE as u64,
            },
            HypRequest::Mem {
                dest: MemDest::VcpuMemcache,
                nr_pages: 2,
            },
        ]
    );

    // Bad arguments never reach the stage-2.
    let (_, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [ipa + 8, 1, 0]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);
    let (_, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [ipa, 1, 1]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);
}

#[test]
fn test_full_request_ring_fails_the_call() {
    let f = Fixture::new();
    protected_vm(&f, 1);
    let vcpu = f.loaded(0).vcpu;
    while vcpu
        .hyp_req_reserve(HypRequest::Map {
            guest_ipa: 0,
            size: 0,
        })
        .is_some()
    {}

    let (exit, ctxt) = f.hvc(0, KvmFnId::MEM_SHARE, [0x5000_0000, 1, 0]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);
    assert_eq!(ctxt.pc, GUEST_PC);

    // A guard that can't get table pages still reports the pages it tried.
    f.hvc(0, KvmFnId::MMIO_GUARD_ENROLL, [0; 3]);
    let (exit, ctxt) = f.hvc(0, KvmFnId::MMIO_RGUARD_MAP, [0x9000_0000, 2, 0]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[..2], [SMCCC_RET_INVALID_PARAMETER, 2]);
    assert_eq!(ctxt.pc, GUEST_PC);
}

#[test]
fn test_retry_rewinds_pc_at_zero() {
    let f = Fixture::new();
    protected_vm(&f, 1);
    f.hvc(0, KvmFnId::MMIO_GUARD_ENROLL, [0; 3]);

    let vcpu = f.loaded(0).vcpu;
    let mut ctxt = vcpu.context();
    ctxt.regs[0] = KvmFnId::MMIO_RGUARD_MAP as u64;
    ctxt.regs[1..4].copy_from_slice(&[0x9000_0000, 1, 0]);
    ctxt.pc = 0;
    vcpu.set_context(ctxt);
    assert_eq!(f.hv.handle_guest_hvc(0).unwrap(), HvcExit::HypReq);
    assert_eq!(vcpu.context().pc, 0u64.wrapping_sub(4));
}

#[test]
fn test_mmio_guard() {
    let f = Fixture::new();
    let (_, host_vcpu) = protected_vm(&f, 1);
    let ipa = 0x9000_0000u64;
    // 4 byte write through x1.
    let esr = (0x24 << 26) | (1 << 24) | (2 << 22) | (1 << 16) | (1 << 6);

    // Not enrolled: everything goes to the host.
    assert!(f.hv.handle_guest_dabt(0, esr, ipa as usize).unwrap().is_some());
    let (_, ctxt) = f.hvc(0, KvmFnId::MMIO_GUARD_MAP, [ipa, 0, 0]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);

    let (_, ctxt) = f.hvc(0, KvmFnId::MMIO_GUARD_ENROLL, [0; 3]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_SUCCESS);
    assert!(f.hv.handle_guest_dabt(0, esr, ipa as usize).unwrap().is_none());

    // The guard needs table pages first.
    let (exit, _) = f.hvc(0, KvmFnId::MMIO_RGUARD_MAP, [ipa, 2, 0]);
    assert_eq!(exit, HvcExit::HypReq);
    f.topup(0, host_vcpu, 2);
    let (exit, ctxt) = f.hvc(0, KvmFnId::MMIO_RGUARD_MAP, [ipa, 2, 0]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[..2], [SMCCC_RET_SUCCESS, 2]);

    let access = f.hv.handle_guest_dabt(0, esr, ipa as usize + 8).unwrap().unwrap();
    assert_eq!(access.size, 4);
    assert!(access.is_write);
    assert_eq!(access.reg, 1);
    assert!(f
        .hv
        .handle_guest_dabt(0, esr, ipa as usize + 2 * PAGE_SIZE)
        .unwrap()
        .is_none());

    // Legacy unmap guards a single page.
    let (_, ctxt) = f.hvc(0, KvmFnId::MMIO_GUARD_UNMAP, [ipa, 7, 7]);
    assert_eq!(ctxt.regs[..2], [SMCCC_RET_SUCCESS, 1]);
    assert!(f.hv.handle_guest_dabt(0, esr, ipa as usize).unwrap().is_none());
    assert!(f
        .hv
        .handle_guest_dabt(0, esr, ipa as usize + PAGE_SIZE)
        .unwrap()
        .is_some());
    let (_, ctxt) = f.hvc(0, KvmFnId::MMIO_RGUARD_UNMAP, [ipa, 1, 1]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_INVALID_PARAMETER);
}

#[test]
fn test_relinquish() {
    let f = Fixture::new();
    let (_, host_vcpu) = protected_vm(&f, 1);
    let page = f.ram.pages(1);
    let gfn = 0x40100u64;

    // Nothing mapped there yet.
    f.topup(0, host_vcpu, 2);
    let (exit, ctxt) = f.hvc(0, KvmFnId::MEM_RELINQUISH, [gfn << PAGE_SHIFT, 0, 0]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[0], SMCCC_RET_SUCCESS);

    f.hcall(
        0,
        HyperCallCode::HostDonateGuest,
        &[phys_to_pfn(page) as u64, gfn, 1],
    )
    .unwrap();
    let (exit, _) = f.hvc(0, KvmFnId::MEM_RELINQUISH, [gfn << PAGE_SHIFT, 0, 0]);
    assert_eq!(exit, HvcExit::ToHost);
    assert_eq!(f.hv.host_mmu().owner(page), OwnerId::Host);
}

#[test]
fn test_trng_forwarding() {
    let f = Fixture::with_config(|config, _| config.trng_available = true);
    protected_vm(&f, 1);

    let (exit, ctxt) = f.hvc(0, TrngFnId::RND64, [192, 5, 6]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[..4], [0, 0x1111, 0x2222, TrngFnId::RND64 as u64]);
    f.hvc(0, TrngFnId::VERSION, [1, 2, 3]);
    assert_eq!(
        *f.smc.calls.lock().unwrap(),
        vec![(TrngFnId::RND64, [192, 0, 0]), (TrngFnId::VERSION, [0, 0, 0])]
    );

    let f = Fixture::new();
    protected_vm(&f, 1);
    let (_, ctxt) = f.hvc(0, TrngFnId::RND64, [192, 0, 0]);
    assert_eq!(ctxt.regs[0], SMCCC_RET_NOT_SUPPORTED);
    assert!(f.smc.calls.lock().unwrap().is_empty());
}

#[test]
fn test_host_guest_calls() {
    let f = Fixture::new();
    let handle = f.create_vm(1, false);
    f.init_vcpu(handle, runnable(0, 0x8000_0000));
    f.load(0, handle, 0);

    let (exit, ctxt) = f.hvc(0, KvmFnId::HYP_MEMINFO, [0; 3]);
    assert_eq!(exit, HvcExit::Resume);
    assert_eq!(ctxt.regs[0], PAGE_SIZE as u64);

    for fid in [KvmFnId::MEM_SHARE, KvmFnId::MMIO_GUARD_ENROLL, PsciFnId::CPU_ON_64] {
        let (exit, ctxt) = f.hvc(0, fid, [0x1000, 1, 0]);
        assert_eq!(exit, HvcExit::ToHost);
        assert_eq!(ctxt.regs[..4], [fid as u64, 0x1000, 1, 0]);
    }

    // Only protected VMs take donations, only the others borrow.
    let page = f.ram.pages(1);
    let err = f
        .hcall(0, HyperCallCode::HostDonateGuest, &[phys_to_pfn(page) as u64, 0x100, 1])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EPERM);
}

#[test]
fn test_host_share_guest() {
    let f = Fixture::new();
    let handle = f.create_vm(1, false);
    let host_vcpu = f.init_vcpu(handle, runnable(0, 0x8000_0000));
    f.load(0, handle, 0);
    f.ram.fill_memcache(
        unsafe { &mut (*(host_vcpu as *mut HostVcpu)).memcache },
        2,
    );
    let page = f.ram.pages(1);
    let rw = MemFlags::RW.bits();

    let err = f
        .hcall(
            0,
            HyperCallCode::HostShareGuest,
            &[phys_to_pfn(page) as u64, 0x100, 1, 1 << 40],
        )
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    f.hcall(
        0,
        HyperCallCode::HostShareGuest,
        &[phys_to_pfn(page) as u64, 0x100, 1, rw],
    )
    .unwrap();
    // The host still owns what it lends.
    assert_eq!(f.hv.host_mmu().owner(page), OwnerId::Host);
    let vm = f.loaded(0).vm;
    assert_eq!(vm.stage2().ipa_to_phys(0x100 << PAGE_SHIFT), Some(page));
}

#[test]
fn test_donation_loads_firmware() {
    let f = Fixture::with_config(|config, ram| {
        let fw = ram.pages(4);
        for i in 0..4 {
            unsafe { ((fw + i * PAGE_SIZE) as *mut u64).write(0xf00d_0000 + i as u64) };
        }
        config.pvmfw_base = fw as u64;
        config.pvmfw_size = 4 * PAGE_SIZE as u64;
        config.pvmfw_load_addr = PVMFW_LOAD_ADDR;
    });
    let (handle, host_vcpu) = protected_vm(&f, 1);
    let vm = f.loaded(0).vm;
    assert_eq!(vm.handle(), handle);
    assert_eq!(f.loaded(0).vcpu.context().pc, PVMFW_LOAD_ADDR);

    f.ram.fill_memcache(
        unsafe { &mut (*(host_vcpu as *mut HostVcpu)).memcache },
        2,
    );
    let page = f.ram.pages(1);
    let gfn = (PVMFW_LOAD_ADDR as usize + 2 * PAGE_SIZE) >> PAGE_SHIFT;
    f.hcall(
        0,
        HyperCallCode::HostDonateGuest,
        &[phys_to_pfn(page) as u64, gfn as u64, 1],
    )
    .unwrap();
    assert_eq!(unsafe { (page as *const u64).read() }, 0xf00d_0002);
}

#[test]
fn test_iommu_domain_calls() {
    let f = Fixture::new();
    let err = f
        .hcall(0, HyperCallCode::IommuAllocDomain, &[1, 2])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);

    f.hcall(0, HyperCallCode::IommuAllocDomain, &[1, 1]).unwrap();
    let err = f
        .hcall(0, HyperCallCode::IommuAllocDomain, &[1, 1])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    let err = f
        .hcall(0, HyperCallCode::IommuAttachDev, &[0, 1, 8, 0, 0])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    let err = f
        .hcall(0, HyperCallCode::IommuMapPages, &[1, 0x1001, 0x2000, 0x1000, 1, 3])
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    f.hcall(0, HyperCallCode::IommuFreeDomain, &[1]).unwrap();
    let err = f.hcall(0, HyperCallCode::IommuFreeDomain, &[1]).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
}
