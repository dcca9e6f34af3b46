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
//! The table of VMs the hypervisor knows about.
//!
//! A VM is named by a handle, its table index plus [`HANDLE_OFFSET`]. Every
//! user of a VM holds a reference count on it; teardown only starts when
//! nobody does, and a dying VM admits no new users.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, Once, RwLock};

use crate::arch::trap::{CpuCaps, IdRegs};
use crate::config::HvSystemConfig;
use crate::consts::*;
use crate::error::HvResult;
use crate::memory::addr::{hva_to_phys, is_aligned, pfn_to_phys, phys_to_pfn};
use crate::memory::guest::GuestStage2;
use crate::memory::{
    GuestPhysAddr, HostMmu, HostShared, HostVirtAddr, HypMemcache, PhysAddr, PAGE_SHIFT,
};
use crate::read_once;
use crate::vcpu::HypVcpu;

/// The host's view of a VM, shared with the hypervisor while the VM exists.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HostKvm {
    pub created_vcpus: u32,
    /// Non-zero for a protected VM.
    pub protected: u32,
    pub pvmfw_load_addr: u64,
    /// Pages the hypervisor gives back while the VM goes away.
    pub stage2_teardown_mc: HypMemcache,
}

/// System-wide settings every VM is created with.
#[derive(Debug, Clone, Copy)]
pub struct VmParams {
    pub hyp_req_len: usize,
    pub memcache_min_pages: usize,
    pub host_hcr_el2: u64,
    pub id_regs: IdRegs,
    pub cpu_caps: CpuCaps,
    pub pvmfw_base: PhysAddr,
    pub pvmfw_size: usize,
}

impl VmParams {
    pub fn from_config(config: &HvSystemConfig) -> Self {
        Self {
            hyp_req_len: config.hyp_req_len as usize,
            memcache_min_pages: config.memcache_min_pages as usize,
            host_hcr_el2: config.host_hcr_el2,
            id_regs: config.id_regs,
            cpu_caps: CpuCaps {
                hvhe: config.hvhe,
                ..config.cpu_caps
            },
            pvmfw_base: config.pvmfw_base as PhysAddr,
            pvmfw_size: config.pvmfw_size as usize,
        }
    }
}

const NO_VCPU: usize = usize::MAX;

pub struct PkvmVm {
    handle: u32,
    host_kvm: HostShared<HostKvm>,
    protected: bool,
    created_vcpus: usize,
    pvmfw_load_addr: u64,
    params: VmParams,
    stage2: GuestStage2,
    refcount: AtomicU32,
    /// Only changes under the table write lock.
    is_dying: AtomicBool,
    /// vCPUs in index order. The lock is the VM's vcpus lock.
    vcpus: Mutex<Vec<Arc<HypVcpu>>>,
    firmware_entry: AtomicUsize,
    shared_mem: AtomicU64,
    teardown_lock: Mutex<()>,
}

impl PkvmVm {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn vmid(&self) -> u16 {
        self.stage2.vmid()
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn is_dying(&self) -> bool {
        self.is_dying.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn stage2(&self) -> &GuestStage2 {
        &self.stage2
    }

    pub fn params(&self) -> &VmParams {
        &self.params
    }

    pub fn created_vcpus(&self) -> usize {
        self.created_vcpus
    }

    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.lock().len()
    }

    pub fn vcpu(&self, idx: usize) -> Option<Arc<HypVcpu>> {
        self.vcpus.lock().get(idx).cloned()
    }

    pub(crate) fn vcpus(&self) -> spin::MutexGuard<'_, Vec<Arc<HypVcpu>>> {
        self.vcpus.lock()
    }

    pub fn pvmfw_load_addr(&self) -> u64 {
        self.pvmfw_load_addr
    }

    pub fn has_pvmfw(&self) -> bool {
        self.protected && self.pvmfw_load_addr != INVALID_ADDRESS && self.params.pvmfw_size != 0
    }

    /// Index of the vCPU that will boot the firmware, if it has not yet.
    pub fn firmware_entry(&self) -> Option<usize> {
        match self.firmware_entry.load(Ordering::Acquire) {
            NO_VCPU => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn claim_firmware_entry(&self, idx: usize) -> bool {
        self.firmware_entry
            .compare_exchange(NO_VCPU, idx, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take_firmware_entry(&self, idx: usize) -> bool {
        self.firmware_entry
            .compare_exchange(idx, NO_VCPU, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bytes of guest memory currently shared with the host.
    pub fn shared_mem(&self) -> u64 {
        self.shared_mem.load(Ordering::Acquire)
    }

    pub(crate) fn add_shared_mem(&self, bytes: u64) {
        self.shared_mem.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn sub_shared_mem(&self, bytes: u64) {
        let prev = self.shared_mem.fetch_sub(bytes, Ordering::AcqRel);
        if prev < bytes {
            warn!("vm {:#x}: shared memory counter underflow", self.handle);
        }
    }

    /// Find a vCPU by the affinity fields of its MPIDR.
    pub fn mpidr_to_vcpu(&self, mpidr: u64) -> Option<Arc<HypVcpu>> {
        let mpidr = mpidr & crate::arch::cpu::MPIDR_HWID_BITMASK;
        self.vcpus.lock().iter().find(|v| v.mpidr() == mpidr).cloned()
    }

    /// Run `f` on the host's teardown memcache.
    pub(crate) fn with_teardown_mc<R>(&self, f: impl FnOnce(&mut HypMemcache) -> R) -> R {
        let _guard = self.teardown_lock.lock();
        let mc = unsafe {
            &mut *core::ptr::addr_of_mut!((*self.host_kvm.as_ptr()).stage2_teardown_mc)
        };
        f(mc)
    }

    pub(crate) fn pvmfw_range_contains(&self, ipa: GuestPhysAddr) -> bool {
        let start = self.pvmfw_load_addr as usize;
        self.has_pvmfw() && ipa >= start && ipa - start < self.params.pvmfw_size
    }

    /// Copy the firmware image into guest pages the host just donated.
    pub fn load_pvmfw_pages(&self, ipa: GuestPhysAddr, phys: PhysAddr, size: usize) -> HvResult {
        if !self.pvmfw_range_contains(ipa) {
            return hv_result_err!(EINVAL);
        }
        let offset = ipa - self.pvmfw_load_addr as usize;
        let size = size.min(self.params.pvmfw_size - offset);
        let src = self.params.pvmfw_base + offset;
        if !is_aligned(size) || !is_aligned(src) {
            return hv_result_err!(EINVAL);
        }
        unsafe { core::ptr::copy_nonoverlapping(src as *const u8, phys as *mut u8, size) };
        crate::arch::cpu::flush_dcache_to_poc(phys, size);
        Ok(())
    }
}

/// A counted reference to a live VM. Dropping it is `put_vm`.
pub struct VmRef(Arc<PkvmVm>);

impl VmRef {
    pub fn vm(&self) -> &Arc<PkvmVm> {
        &self.0
    }
}

impl Deref for VmRef {
    type Target = PkvmVm;

    fn deref(&self) -> &PkvmVm {
        &self.0
    }
}

impl Drop for VmRef {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::Release);
    }
}

type VmTable = Vec<Option<Arc<PkvmVm>>>;

fn handle_to_idx(handle: u32) -> Option<usize> {
    handle.checked_sub(HANDLE_OFFSET).map(|idx| idx as usize)
}

fn idx_to_handle(idx: usize) -> u32 {
    idx as u32 + HANDLE_OFFSET
}

fn slot(table: &VmTable, handle: u32) -> Option<&Arc<PkvmVm>> {
    table.get(handle_to_idx(handle)?)?.as_ref()
}

pub struct VmRegistry {
    table: Once<RwLock<VmTable>>,
    host_mmu: Arc<HostMmu>,
    params: VmParams,
}

impl VmRegistry {
    pub fn new(host_mmu: Arc<HostMmu>, params: VmParams) -> Self {
        Self {
            table: Once::new(),
            host_mmu,
            params,
        }
    }

    pub fn host_mmu(&self) -> &HostMmu {
        &self.host_mmu
    }

    pub fn params(&self) -> &VmParams {
        &self.params
    }

    /// Install a table of `capacity` slots. Only the first call succeeds.
    pub fn init_vm_table(&self, capacity: usize) -> HvResult {
        // VMID 0 belongs to the host.
        if capacity == 0 || capacity >= u16::MAX as usize {
            return hv_result_err!(EINVAL);
        }
        let mut fresh = false;
        self.table.call_once(|| {
            fresh = true;
            RwLock::new(vec![None; capacity])
        });
        if !fresh {
            return hv_result_err!(EEXIST, "VM table already initialised");
        }
        info!("VM table: {} slots", capacity);
        Ok(())
    }

    fn table(&self) -> HvResult<&RwLock<VmTable>> {
        self.table.get().ok_or(hv_err!(EINVAL, "VM table not initialised"))
    }

    /// Run `f` on the VM named by `handle` under the table read lock.
    pub(crate) fn with_vm<R>(&self, handle: u32, f: impl FnOnce(&Arc<PkvmVm>) -> R) -> Option<R> {
        let table = self.table().ok()?.read();
        slot(&table, handle).map(f)
    }

    pub fn nr_vms(&self) -> usize {
        self.table
            .get()
            .map_or(0, |t| t.read().iter().filter(|s| s.is_some()).count())
    }

    /// Create a VM from the host's `host_kvm`, using the pages at `pgd_hva`
    /// as the root of its stage-2. Returns the new handle.
    pub fn create_vm(&self, host_kvm_hva: HostVirtAddr, pgd_hva: HostVirtAddr) -> HvResult<u32> {
        let table = self.table()?;
        let pgd_size = GuestStage2::pgd_size()?;
        let host_kvm = HostShared::<HostKvm>::pin(&self.host_mmu, host_kvm_hva)?;

        let nr_vcpus = read_once!(host_kvm, created_vcpus) as usize;
        if nr_vcpus < 1 || nr_vcpus > MAX_VCPUS_PER_VM {
            host_kvm.unpin(&self.host_mmu);
            return hv_result_err!(EINVAL);
        }

        let pgd = hva_to_phys(pgd_hva);
        let nr_pgd_pages = pgd_size >> PAGE_SHIFT;
        if !is_aligned(pgd)
            || self
                .host_mmu
                .donate_host_to_hyp(phys_to_pfn(pgd), nr_pgd_pages, false)
                .is_err()
        {
            host_kvm.unpin(&self.host_mmu);
            return hv_result_err!(EINVAL);
        }

        let mut table = table.write();
        let stage2 = match table.iter().position(Option::is_none) {
            None => hv_result_err!(ENOMEM, "VM table full"),
            Some(idx) => GuestStage2::new((idx + 1) as u16, pgd, pgd_size).map(|s2| (idx, s2)),
        };
        let (idx, stage2) = match stage2 {
            Ok(v) => v,
            Err(e) => {
                drop(table);
                if let Err(e) = self.host_mmu.donate_hyp_to_host(phys_to_pfn(pgd), nr_pgd_pages) {
                    warn!("create_vm: pgd {:#x} not returned: {:?}", pgd, e);
                }
                host_kvm.unpin(&self.host_mmu);
                return Err(e);
            }
        };

        let protected = read_once!(host_kvm, protected) != 0;
        let pvmfw_load_addr = match protected {
            true => read_once!(host_kvm, pvmfw_load_addr),
            false => INVALID_ADDRESS,
        };
        let handle = idx_to_handle(idx);
        table[idx] = Some(Arc::new(PkvmVm {
            handle,
            host_kvm,
            protected,
            created_vcpus: nr_vcpus,
            pvmfw_load_addr,
            params: self.params,
            stage2,
            refcount: AtomicU32::new(0),
            is_dying: AtomicBool::new(false),
            vcpus: Mutex::new(Vec::with_capacity(nr_vcpus)),
            firmware_entry: AtomicUsize::new(NO_VCPU),
            shared_mem: AtomicU64::new(0),
            teardown_lock: Mutex::new(()),
        }));
        info!(
            "vm {:#x}: created, vmid {}, {} vcpu(s), protected: {}",
            handle,
            idx + 1,
            nr_vcpus,
            protected
        );
        Ok(handle)
    }

    /// Take a reference on a live VM.
    pub fn get_vm(&self, handle: u32) -> Option<VmRef> {
        self.with_vm(handle, |vm| {
            if vm.is_dying() {
                warn!("vm {:#x}: lookup of a dying VM", handle);
                return None;
            }
            vm.refcount.fetch_add(1, Ordering::AcqRel);
            Some(VmRef(vm.clone()))
        })
        .flatten()
    }

    pub fn put_vm(&self, vm: VmRef) {
        drop(vm);
    }

    /// Hold the refcount of a loaded vCPU's VM outside of a [`VmRef`].
    pub(crate) fn get_vm_raw(vm: &PkvmVm) {
        vm.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put_vm_raw(vm: &PkvmVm) {
        vm.refcount.fetch_sub(1, Ordering::Release);
    }

    pub fn start_teardown(&self, handle: u32) -> HvResult {
        let table = self.table()?.write();
        let vm = slot(&table, handle).ok_or(hv_err!(ENOENT))?;
        if vm.refcount() != 0 {
            warn!("vm {:#x}: teardown while in use", handle);
            return hv_result_err!(EBUSY);
        }
        if vm.is_dying() {
            return hv_result_err!(EINVAL);
        }
        vm.is_dying.store(true, Ordering::Release);
        debug!("vm {:#x}: dying", handle);
        Ok(())
    }

    /// Forget a dying VM and hand everything it holds back to the host.
    pub fn finalize_teardown(&self, handle: u32) -> HvResult {
        let vm = {
            let mut table = self.table()?.write();
            let vm = slot(&table, handle).ok_or(hv_err!(ENOENT))?;
            if !vm.is_dying() {
                return hv_result_err!(EBUSY);
            }
            // The VMID can be reused as soon as the slot is free.
            vm.stage2.flush_tlb();
            let idx = handle_to_idx(handle).ok_or(hv_err!(ENOENT))?;
            table[idx].take().ok_or(hv_err!(ENOENT))?
        };

        let host_mmu = &*self.host_mmu;
        vm.stage2.destroy();
        vm.with_teardown_mc(|mc| {
            vm.stage2.drain_pool(host_mmu, mc);
            for vcpu in vm.vcpus.lock().drain(..) {
                vcpu.teardown(host_mmu, mc);
            }
        });
        vm.host_kvm.unpin(host_mmu);
        info!("vm {:#x}: destroyed", handle);
        Ok(())
    }

    /// Give one page of a dying VM back to the host.
    pub fn reclaim_dying_guest_page(&self, handle: u32, pfn: usize, gfn: usize, order: u32) -> HvResult {
        let table = self.table()?.read();
        let vm = slot(&table, handle)
            .filter(|vm| vm.is_dying())
            .ok_or(hv_err!(EINVAL))?;
        vm.stage2
            .host_reclaim_page(&self.host_mmu, pfn, pfn_to_phys(gfn), order)?;
        vm.with_teardown_mc(|mc| vm.stage2.drain_pool(&self.host_mmu, mc));
        Ok(())
    }
}
