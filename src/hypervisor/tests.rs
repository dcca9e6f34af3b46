use super::*;
use crate::config::HvConfigMemoryRegion;
use crate::error::HvErrorNum;
use crate::memory::OwnerId;
use crate::test_utils::TestRam;

struct NoMonitor;

impl SecureMonitor for NoMonitor {
    fn smc(&self, _fid: u32, _args: [u64; 3]) -> [u64; 4] {
        [u64::MAX, 0, 0, 0]
    }
}

fn config(ram: &TestRam) -> HvSystemConfig {
    let mut config = HvSystemConfig::default();
    config.num_cpus = 2;
    let range = ram.range();
    config
        .add_ram_region(HvConfigMemoryRegion::new(
            range.start as u64,
            (range.end - range.start) as u64,
        ))
        .unwrap();
    config
}

#[test]
fn test_new_validates_config() {
    let ram = TestRam::new(64);
    let mut bad = config(&ram);
    bad.num_cpus = 0;
    let err = Hypervisor::new(bad, Arc::new(NoMonitor)).err().unwrap();
    assert_eq!(err.num(), HvErrorNum::EINVAL);

    let mut bad = config(&ram);
    bad.vm_table_size = 0;
    assert!(Hypervisor::new(bad, Arc::new(NoMonitor)).is_err());
}

#[test]
fn test_new_builds_the_system() {
    let ram = TestRam::new(64);
    let hv = Hypervisor::new(config(&ram), Arc::new(NoMonitor)).unwrap();
    assert_eq!(hv.nr_cpus(), 2);
    assert!(hv.cpu(1).is_ok());
    assert_eq!(hv.cpu(2).err().unwrap().num(), HvErrorNum::EINVAL);
    assert!(hv.iommu().smmus().is_empty());
    assert_eq!(hv.registry().nr_vms(), 0);
    assert_eq!(hv.host_mmu().owner(ram.range().start), OwnerId::Host);
    assert_eq!(
        hv.registry().params().memcache_min_pages,
        hv.config().memcache_min_pages as usize
    );
}

#[test]
fn test_dabt_entry_points() {
    let ram = TestRam::new(64);
    let hv = Hypervisor::new(config(&ram), Arc::new(NoMonitor)).unwrap();
    let esr = (0x24 << 26) | (1 << 24) | (3 << 22);

    let err = hv.handle_guest_dabt(0, esr, 0x9000_0000).unwrap_err();
    assert_eq!(err.num(), HvErrorNum::EINVAL);
    // No SMMU window to emulate.
    let mut regs = [0u64; 31];
    assert!(!hv.handle_host_dabt(&mut regs, esr, 0x0900_0000));
}
