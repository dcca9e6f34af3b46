use super::*;
use crate::error::HvErrorNum;

fn base_config() -> HvSystemConfig {
    let mut config = HvSystemConfig {
        num_cpus: 4,
        ..Default::default()
    };
    config
        .add_ram_region(HvConfigMemoryRegion::new(0x4000_0000, 0x4000_0000))
        .unwrap();
    config
        .add_mmio_region(HvConfigMemoryRegion::new(0x0900_0000, 0x1000))
        .unwrap();
    config
}

#[test]
fn test_simple_config() {
    let mut config = base_config();
    config
        .add_smmu(HvSmmuConfig {
            base: 0x0905_0000,
            size: 0x2_0000,
            power_domain: 1,
            caches_clean_on_power_on: 1,
        })
        .unwrap();
    config.validate().unwrap();

    assert_eq!(config.ram_regions().len(), 1);
    assert_eq!(config.mmio_regions().len(), 1);
    assert_eq!(config.ram_ranges(), vec![0x4000_0000..0x8000_0000]);
    let smmus = config.smmu_configs();
    assert_eq!(smmus.len(), 1);
    assert_eq!(smmus[0].mmio_addr, 0x0905_0000);
    assert_eq!(smmus[0].power_domain, PowerDomain::HostHvc);
    assert!(smmus[0].caches_clean_on_power_on);
    assert!(!config.has_pvmfw());
}

#[test]
fn test_rejects_empty_tables() {
    let mut config = base_config();
    config.vm_table_size = 0;
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);

    let mut config = base_config();
    config.hyp_req_len = 1;
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);

    let mut config = base_config();
    config.num_cpus = 0;
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);
}

#[test]
fn test_rejects_overlapping_regions() {
    let mut config = base_config();
    config
        .add_mmio_region(HvConfigMemoryRegion::new(0x7fff_f000, 0x2000))
        .unwrap();
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);

    // SMMU windows count as well.
    let mut config = base_config();
    config
        .add_smmu(HvSmmuConfig {
            base: 0x0900_0000,
            size: 0x2_0000,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);

    let mut config = base_config();
    config
        .add_ram_region(HvConfigMemoryRegion::new(0x7fff_0000, 0x2_0000))
        .unwrap();
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);
}

#[test]
fn test_region_capacity() {
    let mut config = HvSystemConfig::default();
    for i in 0..CONFIG_MAX_MEMORY_REGIONS as u64 {
        config
            .add_ram_region(HvConfigMemoryRegion::new(i << 30, 0x1000))
            .unwrap();
    }
    let err = config
        .add_ram_region(HvConfigMemoryRegion::new(1 << 40, 0x1000))
        .unwrap_err();
    assert_eq!(err.num(), HvErrorNum::E2BIG);
    config.validate().unwrap();
}

#[test]
fn test_pvmfw_must_be_in_ram() {
    let mut config = base_config();
    config.pvmfw_base = 0x7000_0000;
    config.pvmfw_size = 0x20_0000;
    config.pvmfw_load_addr = 0x7fc0_0000;
    config.validate().unwrap();
    assert!(config.has_pvmfw());

    config.pvmfw_base = 0xbff0_0000;
    assert_eq!(config.validate().unwrap_err().num(), HvErrorNum::EINVAL);
}
