use super::cmdq::*;
use super::regs::*;
use super::strtab::Desc;
use super::*;
use crate::error::HvErrorNum;
use crate::memory::{PageState, PAGE_SIZE};
use crate::test_utils::{init_frame_pool, leak_pages};

use std::sync::atomic::AtomicBool;
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const RAM_PAGES: usize = 64;
const CMDQ_LOG2SIZE: u64 = 8;
const STRTAB_LOG2SIZE: u64 = 6;

fn reg_ptr<T>(base: PhysAddr, off: usize) -> *mut T {
    (base + off) as *mut T
}

fn read32(base: PhysAddr, off: usize) -> u32 {
    unsafe { core::ptr::read_volatile(reg_ptr(base, off)) }
}

fn write32(base: PhysAddr, off: usize, val: u32) {
    unsafe { core::ptr::write_volatile(reg_ptr(base, off), val) }
}

fn write64(base: PhysAddr, off: usize, val: u64) {
    unsafe { core::ptr::write_volatile(reg_ptr(base, off), val) }
}

/// Software SMMU: acknowledges CR0 writes and consumes the command queue
/// from a background thread, recording every command.
struct SmmuModel {
    regs: PhysAddr,
    cmdq: PhysAddr,
    strtab: PhysAddr,
    stall: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    cmds: Arc<StdMutex<Vec<[u64; 2]>>>,
    thread: Option<JoinHandle<()>>,
}

impl SmmuModel {
    /// Lay out the registers as firmware and the host driver leave them.
    fn new(cmdq: PhysAddr, strtab: PhysAddr) -> Self {
        let regs = leak_pages(SMMU_MMIO_SIZE / PAGE_SIZE);
        write32(regs, 0x00, IDR0_S1P | IDR0_S2P | IDR0_COHACC);
        write32(regs, 0x04, field_prep(IDR1_SSIDSIZE, 5) as u32);
        write32(regs, 0x14, 5 | IDR5_GRAN4K);
        write32(regs, 0x44, GBPA_ABORT);
        write64(regs, 0x80, strtab as u64);
        write32(
            regs,
            0x88,
            (field_prep(STRTAB_BASE_CFG_FMT, STRTAB_BASE_CFG_FMT_LINEAR)
                | field_prep(STRTAB_BASE_CFG_LOG2SIZE, STRTAB_LOG2SIZE)) as u32,
        );
        write64(regs, 0x90, cmdq as u64 | CMDQ_LOG2SIZE);

        let stall = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let cmds = Arc::new(StdMutex::new(Vec::new()));
        let thread = {
            let (stall, stop, cmds) = (stall.clone(), stop.clone(), cmds.clone());
            std::thread::spawn(move || {
                let mask = (2u32 << CMDQ_LOG2SIZE) - 1;
                let idx_mask = (1u32 << CMDQ_LOG2SIZE) - 1;
                while !stop.load(Ordering::Acquire) {
                    write32(regs, 0x24, read32(regs, 0x20));
                    if !stall.load(Ordering::Acquire) {
                        let prod = read32(regs, 0x98) & mask;
                        let mut cons = read32(regs, 0x9c) & mask;
                        while cons != prod {
                            let slot = cmdq + (cons & idx_mask) as usize * 16;
                            let cmd = unsafe {
                                [
                                    core::ptr::read_volatile(slot as *const u64),
                                    core::ptr::read_volatile((slot + 8) as *const u64),
                                ]
                            };
                            cmds.lock().unwrap().push(cmd);
                            cons = (cons + 1) & mask;
                        }
                        write32(regs, 0x9c, cons);
                    }
                    std::thread::sleep(Duration::from_micros(5));
                }
            })
        };
        Self {
            regs,
            cmdq,
            strtab,
            stall,
            stop,
            cmds,
            thread: Some(thread),
        }
    }

    fn config(&self) -> SmmuConfig {
        SmmuConfig {
            mmio_addr: self.regs,
            mmio_size: SMMU_MMIO_SIZE,
            power_domain: PowerDomain::HostHvc,
            caches_clean_on_power_on: true,
        }
    }

    fn opcodes(&self) -> Vec<u8> {
        self.cmds
            .lock()
            .unwrap()
            .iter()
            .map(|cmd| (cmd[0] & CMDQ_0_OP) as u8)
            .collect()
    }

    fn take_cmds(&self) -> Vec<[u64; 2]> {
        core::mem::take(&mut *self.cmds.lock().unwrap())
    }

    fn ste(&self, sid: u32) -> Desc {
        Desc::new(self.strtab + sid as usize * (STRTAB_STE_DWORDS << 3))
    }
}

impl Drop for SmmuModel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Fixture {
    model: SmmuModel,
    host: Arc<HostMmu>,
    iommu: Arc<KvmIommu>,
    ram: PhysAddr,
}

fn setup() -> Fixture {
    init_frame_pool();
    let ram = leak_pages(RAM_PAGES);
    let host = Arc::new(HostMmu::new(&[ram..ram + RAM_PAGES * PAGE_SIZE]));
    let model = SmmuModel::new(ram, ram + PAGE_SIZE);
    let iommu = KvmIommu::init(&[model.config()], host.clone()).unwrap();
    Fixture {
        model,
        host,
        iommu,
        ram,
    }
}

fn page(f: &Fixture, n: usize) -> PhysAddr {
    f.ram + n * PAGE_SIZE
}

#[test]
fn test_probe_takes_over_smmu() {
    let f = setup();
    // Queue and stream table now belong to the hypervisor.
    assert_eq!(f.host.owner(f.model.cmdq), crate::memory::OwnerId::Hyp);
    assert_eq!(f.host.owner(f.model.strtab), crate::memory::OwnerId::Hyp);
    assert_eq!(f.host.host_state(f.model.strtab), PageState::NOPAGE);

    let cr0 = read32(f.model.regs, 0x20);
    assert_eq!(cr0, CR0_SMMUEN | CR0_CMDQEN | CR0_ATSCHK | CR0_EVTQEN);
    let ops = f.model.opcodes();
    assert!(ops.contains(&CMDQ_OP_CFGI_ALL));
    assert!(ops.contains(&CMDQ_OP_TLBI_NSNH_ALL));
    // Every STE starts out disabled.
    assert_eq!(f.model.ste(0).get(0), 0);
}

#[test]
fn test_probe_rejects_open_gbpa() {
    init_frame_pool();
    let ram = leak_pages(8);
    let host = HostMmu::new(&[ram..ram + 8 * PAGE_SIZE]);
    let model = SmmuModel::new(ram, ram + PAGE_SIZE);
    write32(model.regs, 0x44, 0);
    let err = Smmuv3::probe(0, &model.config(), &host).err().unwrap();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
}

#[test]
fn test_idmap_follows_host() {
    let f = setup();
    let idmap = f.iommu.domain(IDMAP_ID).unwrap();
    let dom = idmap.smmu_domain();
    assert!(dom.is_finalised());

    let pa = page(&f, 10);
    assert_eq!(dom.iova_to_phys(pa + 0x10), pa + 0x10);
    // Hypervisor pages never show up.
    assert_eq!(dom.iova_to_phys(f.model.cmdq), 0);

    f.host.donate_host_to_hyp(pa / PAGE_SIZE, 1, false).unwrap();
    assert_eq!(dom.iova_to_phys(pa), 0);
    f.host.donate_hyp_to_host(pa / PAGE_SIZE, 1).unwrap();
    assert_eq!(dom.iova_to_phys(pa), pa);
}

#[test]
fn test_s2_attach_programs_ste() {
    let f = setup();
    f.iommu.alloc_domain(5, DomainType::S2).unwrap();
    f.model.take_cmds();
    f.iommu.attach_dev(0, 5, 3, 0, 0).unwrap();

    let ste = f.model.ste(3);
    let val = ste.get(0);
    assert_ne!(val & STRTAB_STE_0_V, 0);
    assert_eq!(field_get(STRTAB_STE_0_CFG, val), STRTAB_STE_0_CFG_S2_TRANS);
    assert_eq!(field_get(STRTAB_STE_2_S2VMID, ste.get(2)), 5);
    let dom = f.iommu.domain(5).unwrap();
    let ttbr = dom.smmu_domain().pgtable_cfg().unwrap().ttbr as u64;
    assert_eq!(ste.get(3), ttbr & STRTAB_STE_3_S2TTB_MASK);
    assert_eq!(dom.refs(), 2);

    let cmds = f.model.take_cmds();
    assert!(cmds
        .iter()
        .any(|c| (c[0] & CMDQ_0_OP) as u8 == CMDQ_OP_CFGI_STE && field_get(CMDQ_CFGI_0_SID, c[0]) == 3));

    // One domain per stream.
    f.iommu.alloc_domain(6, DomainType::S2).unwrap();
    let err = f.iommu.attach_dev(0, 6, 3, 0, 0).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EBUSY);
    assert_eq!(f.iommu.domain(6).unwrap().refs(), 1);
    // No pasid at stage 2.
    let err = f.iommu.attach_dev(0, 6, 4, 1, 0).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EBUSY);
    // Stream out of the table.
    assert!(f.iommu.attach_dev(0, 6, 1 << 10, 0, 0).is_err());
}

#[test]
fn test_s1_attach_uses_cd_table() {
    let f = setup();
    f.iommu.alloc_domain(7, DomainType::S1).unwrap();
    f.iommu.alloc_domain(8, DomainType::S1).unwrap();
    f.iommu.attach_dev(0, 7, 2, 0, 2).unwrap();

    let val = f.model.ste(2).get(0);
    assert_eq!(field_get(STRTAB_STE_0_CFG, val), STRTAB_STE_0_CFG_S1_TRANS);
    assert_eq!(field_get(STRTAB_STE_0_S1CDMAX, val), 2);
    let cd_table = (val & STRTAB_STE_0_S1CTXPTR_MASK) as PhysAddr;
    let cd0 = Desc::new(cd_table);
    assert_ne!(cd0.get(0) & CTXDESC_CD_0_V, 0);
    assert_eq!(field_get(CTXDESC_CD_0_ASID, cd0.get(0)), 7);

    // A second pasid on the live STE only writes its CD.
    f.model.take_cmds();
    f.iommu.attach_dev(0, 8, 2, 1, 2).unwrap();
    let cd1 = Desc::new(cd_table + (CTXDESC_CD_DWORDS << 3));
    assert_eq!(field_get(CTXDESC_CD_0_ASID, cd1.get(0)), 8);
    assert!(f.model.opcodes().contains(&CMDQ_OP_CFGI_CD));
    assert!(!f.model.opcodes().contains(&CMDQ_OP_CFGI_STE));

    assert_eq!(f.iommu.attach_dev(0, 8, 2, 1, 2).unwrap_err().num(), HvErrorNum::EBUSY);
    assert_eq!(f.iommu.attach_dev(0, 8, 2, 4, 2).unwrap_err().num(), HvErrorNum::E2BIG);

    // Stage-2 can't take over a stage-1 stream.
    f.iommu.alloc_domain(9, DomainType::S2).unwrap();
    assert_eq!(f.iommu.attach_dev(0, 9, 2, 0, 0).unwrap_err().num(), HvErrorNum::EBUSY);

    f.iommu.detach_dev(0, 8, 2, 1).unwrap();
    assert_eq!(cd1.get(0), 0);
    assert_eq!(f.iommu.domain(8).unwrap().refs(), 1);
}

#[test]
fn test_s2_detach_keeps_cd_pointer() {
    let f = setup();
    // A CD table left over from an earlier stage-1 user of the stream.
    let ctxptr = page(&f, 30) as u64;
    f.model.ste(6).set(0, ctxptr);

    f.iommu.alloc_domain(2, DomainType::S2).unwrap();
    f.iommu.attach_dev(0, 2, 6, 0, 0).unwrap();
    assert_eq!(f.model.ste(6).get(0) & STRTAB_STE_0_S1CTXPTR_MASK, ctxptr);
    f.iommu.detach_dev(0, 2, 6, 0).unwrap();
    assert_eq!(f.model.ste(6).get(0), ctxptr);
    for i in 1..STRTAB_STE_DWORDS {
        assert_eq!(f.model.ste(6).get(i), 0);
    }
}

#[test]
fn test_domain_lifetime() {
    let f = setup();
    assert_eq!(f.iommu.alloc_domain(MAX_DOMAINS, DomainType::S2).unwrap_err().num(), HvErrorNum::EINVAL);
    f.iommu.alloc_domain(3, DomainType::S2).unwrap();
    assert_eq!(f.iommu.alloc_domain(3, DomainType::S2).unwrap_err().num(), HvErrorNum::EINVAL);
    // Nothing attached yet.
    assert!(f.iommu.detach_dev(0, 3, 1, 0).is_err());

    f.iommu.attach_dev(0, 3, 1, 0, 0).unwrap();
    assert!(f.iommu.free_domain(3).is_err());
    f.iommu.detach_dev(0, 3, 1, 0).unwrap();
    assert_eq!(f.model.ste(1).get(0), 0);
    f.iommu.free_domain(3).unwrap();
    assert!(f.iommu.domain(3).is_none());
    assert!(f.iommu.free_domain(3).is_err());
    assert!(f.iommu.attach_dev(0, 3, 1, 0, 0).is_err());
    // The id can be reused.
    f.iommu.alloc_domain(3, DomainType::S1).unwrap();
}

#[test]
fn test_map_unmap_tracks_dma() {
    let f = setup();
    f.iommu.alloc_domain(4, DomainType::S2).unwrap();
    f.iommu.attach_dev(0, 4, 9, 0, 0).unwrap();

    let pa = page(&f, 20);
    let iova = 0x40_0000;
    let mapped = f
        .iommu
        .map_pages(4, iova, pa, PAGE_SIZE, 2, MemFlags::READ | MemFlags::WRITE)
        .unwrap();
    assert_eq!(mapped, 2 * PAGE_SIZE);
    assert_eq!(f.iommu.iova_to_phys(4, iova + PAGE_SIZE + 8).unwrap(), pa + PAGE_SIZE + 8);

    // The host can't give away a page a device may still write.
    assert_eq!(
        f.host.donate_host_to_hyp(pa / PAGE_SIZE, 1, false).unwrap_err().num(),
        HvErrorNum::EINVAL
    );
    // Nor map hypervisor memory.
    assert!(f
        .iommu
        .map_pages(4, 0x80_0000, f.model.cmdq, PAGE_SIZE, 1, MemFlags::READ)
        .is_err());
    // Unknown protection bits.
    assert!(f
        .iommu
        .map_pages(4, 0x80_0000, pa, PAGE_SIZE, 1, MemFlags::SW0)
        .is_err());

    f.model.take_cmds();
    assert_eq!(f.iommu.unmap_pages(4, iova, PAGE_SIZE, 2).unwrap(), 2 * PAGE_SIZE);
    assert_eq!(f.iommu.iova_to_phys(4, iova).unwrap(), 0);
    let cmds = f.model.take_cmds();
    let tlbi: Vec<_> = cmds
        .iter()
        .filter(|c| (c[0] & CMDQ_0_OP) as u8 == CMDQ_OP_TLBI_S2_IPA)
        .collect();
    assert!(!tlbi.is_empty());
    assert!(tlbi.iter().all(|c| field_get(CMDQ_TLBI_0_VMID, c[0]) == 4));

    f.host.donate_host_to_hyp(pa / PAGE_SIZE, 1, false).unwrap();
}

#[test]
fn test_unmap_in_batches() {
    let f = setup();
    f.iommu.alloc_domain(11, DomainType::S2).unwrap();
    // The page table is created by the first attach.
    let pa = page(&f, 24);
    assert!(f.iommu.map_pages(11, 0, pa, PAGE_SIZE, 1, MemFlags::READ).is_err());
    f.iommu.attach_dev(0, 11, 12, 0, 0).unwrap();
    let nr = PADDR_CACHE_MAX + 4;
    assert_eq!(
        f.iommu.map_pages(11, 0, pa, PAGE_SIZE, nr, MemFlags::READ).unwrap(),
        nr * PAGE_SIZE
    );
    assert_eq!(f.iommu.unmap_pages(11, 0, PAGE_SIZE, nr).unwrap(), nr * PAGE_SIZE);
    for i in 0..nr {
        assert_eq!(f.iommu.iova_to_phys(11, i * PAGE_SIZE).unwrap(), 0);
    }
    // Every page went back to the host.
    f.host.donate_host_to_hyp(pa / PAGE_SIZE, nr, false).unwrap();
}

#[test]
fn test_double_map_keeps_dma_refs_balanced() {
    let f = setup();
    f.iommu.alloc_domain(5, DomainType::S2).unwrap();
    f.iommu.attach_dev(0, 5, 3, 0, 0).unwrap();
    let pa = page(&f, 50);
    let iova = 0x40_0000;
    let rw = MemFlags::READ | MemFlags::WRITE;

    assert_eq!(f.iommu.map_pages(5, iova, pa, PAGE_SIZE, 1, rw).unwrap(), PAGE_SIZE);
    assert_eq!(
        f.iommu.map_pages(5, iova, pa, PAGE_SIZE, 1, rw).unwrap_err().num(),
        HvErrorNum::EEXIST
    );
    assert_eq!(f.iommu.iova_to_phys(5, iova).unwrap(), pa);

    // One unmap drops the only reference the device held.
    assert_eq!(f.iommu.unmap_pages(5, iova, PAGE_SIZE, 1).unwrap(), PAGE_SIZE);
    f.host.donate_host_to_hyp(pa / PAGE_SIZE, 1, false).unwrap();
}

#[test]
fn test_stalled_queue_times_out() {
    let f = setup();
    f.iommu.alloc_domain(2, DomainType::S2).unwrap();
    f.model.stall.store(true, Ordering::Release);

    let start = Instant::now();
    let err = f.iommu.attach_dev(0, 2, 5, 0, 0).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::ETIMEDOUT);
    assert!(start.elapsed() >= Duration::from_millis(100));

    // Nothing of the new STE is left behind.
    for i in 0..STRTAB_STE_DWORDS {
        assert_eq!(f.model.ste(5).get(i), 0);
    }
    assert_eq!(f.iommu.domain(2).unwrap().refs(), 1);

    f.model.stall.store(false, Ordering::Release);
    f.iommu.attach_dev(0, 2, 5, 0, 0).unwrap();
}

#[test]
fn test_s1_detach_clears_cd_when_sync_stalls() {
    let f = setup();
    f.iommu.alloc_domain(7, DomainType::S1).unwrap();
    f.iommu.attach_dev(0, 7, 4, 0, 1).unwrap();
    let cd_table = (f.model.ste(4).get(0) & STRTAB_STE_0_S1CTXPTR_MASK) as PhysAddr;
    let cd = Desc::new(cd_table);
    assert_ne!(cd.get(0), 0);

    f.model.stall.store(true, Ordering::Release);
    let err = f.iommu.detach_dev(0, 7, 4, 0).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::ETIMEDOUT);
    // The failed invalidation doesn't stop the CD from being wiped.
    for i in 0..4 {
        assert_eq!(cd.get(i), 0);
    }
    f.model.stall.store(false, Ordering::Release);
}

#[test]
fn test_power_cycle() {
    let f = setup();
    f.iommu.power_off(0).unwrap();
    assert_eq!(read32(f.model.regs, 0x20), 0);
    assert!(f.iommu.smmus()[0].is_powered_off());

    // Caches are clean on power on: no command while off.
    f.model.take_cmds();
    f.iommu.alloc_domain(1, DomainType::S2).unwrap();
    f.iommu.attach_dev(0, 1, 7, 0, 0).unwrap();
    assert!(f.model.take_cmds().is_empty());

    f.iommu.power_on(0).unwrap();
    assert!(!f.iommu.smmus()[0].is_powered_off());
    assert!(f.model.opcodes().contains(&CMDQ_OP_CFGI_ALL));
    assert_ne!(read32(f.model.regs, 0x20) & CR0_SMMUEN, 0);
    assert!(f.iommu.power_on(7).is_err());
}

#[test]
fn test_dabt_register_filter() {
    let f = setup();
    let mut regs = [0u64; 31];
    let esr_write = ESR_ELX_WNR | field_prep(ESR_ELX_SAS, 2) | field_prep(ESR_ELX_SRT, 3);
    let esr_read = field_prep(ESR_ELX_SAS, 2) | field_prep(ESR_ELX_SRT, 4);

    regs[3] = 0x5;
    assert!(f.iommu.dabt_handler(&mut regs, esr_write, f.model.regs + ARM_SMMU_GERRORN as usize));
    assert_eq!(read32(f.model.regs, ARM_SMMU_GERRORN as usize), 0x5);

    write32(f.model.regs, ARM_SMMU_GERROR as usize, 0x9);
    assert!(f.iommu.dabt_handler(&mut regs, esr_read, f.model.regs + ARM_SMMU_GERROR as usize));
    assert_eq!(regs[4], 0x9);
    // GERROR is read-only, CR0 is private, 64-bit accesses are refused.
    assert!(!f.iommu.dabt_handler(&mut regs, esr_write, f.model.regs + ARM_SMMU_GERROR as usize));
    assert!(!f.iommu.dabt_handler(&mut regs, esr_read, f.model.regs + ARM_SMMU_CR0 as usize));
    let esr_64 = field_prep(ESR_ELX_SAS, 3) | field_prep(ESR_ELX_SRT, 4);
    assert!(!f.iommu.dabt_handler(&mut regs, esr_64, f.model.regs + ARM_SMMU_EVTQ_PROD as usize));
    // Outside every SMMU.
    assert!(!f.iommu.dabt_handler(&mut regs, esr_read, f.ram));
}

#[test]
fn test_cmd_encoding() {
    let cmd = CmdqEnt::cfgi_cd(0x12, 3).encode().unwrap();
    assert_eq!(cmd[0] & CMDQ_0_OP, CMDQ_OP_CFGI_CD as u64);
    assert_eq!(field_get(CMDQ_CFGI_0_SID, cmd[0]), 0x12);
    assert_eq!(field_get(CMDQ_CFGI_0_SSID, cmd[0]), 3);
    assert!(CmdqEnt::new(0x7f).encode().is_err());
}
