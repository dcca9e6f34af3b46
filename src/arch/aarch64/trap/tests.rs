use super::*;

fn field(shift: usize, val: u64) -> u64 {
    val << shift
}

/// A CPU implementing most optional features.
fn rich_cpu() -> IdRegs {
    IdRegs {
        pfr0: field(PFR0_EL0, 2)
            | field(PFR0_EL1, 2)
            | field(PFR0_EL2, 1)
            | field(PFR0_EL3, 1)
            | field(PFR0_GIC, 1)
            | field(PFR0_RAS, 2)
            | field(PFR0_SVE, 1)
            | field(PFR0_AMU, 1)
            | field(PFR0_DIT, 1),
        pfr1: field(PFR1_BT, 1) | field(PFR1_MTE, 2),
        dfr0: field(DFR0_DEBUGVER, 8) | field(DFR0_PMUVER, 4) | field(DFR0_TRACEVER, 1),
        mmfr0: field(MMFR0_PARANGE, 5) | field(MMFR0_ASIDBITS, 2) | field(MMFR0_FGT, 1),
        mmfr1: field(MMFR1_LO, 1) | field(MMFR1_PAN, 3) | field(MMFR1_VMIDBITS, 2),
        isar1: field(ISAR1_APA, 1) | field(ISAR1_GPA, 1) | 0xf,
    }
}

#[test]
fn test_read_id_reg_sanitises() {
    let ids = rich_cpu();

    let pfr0 = ids.read_id_reg(IdReg::Pfr0);
    assert_eq!(fget(PFR0_EL0, pfr0), 1);
    assert_eq!(fget(PFR0_EL1, pfr0), 1);
    assert_eq!(fget(PFR0_EL2, pfr0), 1);
    assert_eq!(fget(PFR0_RAS, pfr0), 1);
    assert_eq!(fget(PFR0_SVE, pfr0), 1);
    assert_eq!(fget(PFR0_AMU, pfr0), 0);
    assert_eq!(fget(PFR0_GIC, pfr0), 1);
    assert_eq!(fget(PFR0_DIT, pfr0), 1);
    // Not implemented stays not implemented.
    assert_eq!(fget(PFR0_FP, pfr0), 0);

    assert_eq!(ids.read_id_reg(IdReg::Pfr1), field(PFR1_BT, 1));
    assert_eq!(ids.read_id_reg(IdReg::Dfr0), 0);
    assert_eq!(
        ids.read_id_reg(IdReg::Mmfr0),
        field(MMFR0_PARANGE, 2) | field(MMFR0_ASIDBITS, 2)
    );
    assert_eq!(
        ids.read_id_reg(IdReg::Mmfr1),
        field(MMFR1_PAN, 3) | field(MMFR1_VMIDBITS, 2)
    );
    assert_eq!(
        ids.read_id_reg(IdReg::Isar1),
        field(ISAR1_APA, 1) | field(ISAR1_GPA, 1)
    );

    let small = IdRegs {
        mmfr0: field(MMFR0_PARANGE, 1),
        ..Default::default()
    };
    assert_eq!(small.read_id_reg(IdReg::Mmfr0), field(MMFR0_PARANGE, 1));
    assert_eq!(small.sanitised().mmfr0, field(MMFR0_PARANGE, 1));
}

#[test]
fn test_protected_traps_bare_cpu() {
    let traps = TrapConfig::for_protected(&IdRegs::default(), &CpuCaps::default());

    let hcr_expected = hcr::GUEST_FLAGS
        | hcr::TID1
        | hcr::TID3
        | hcr::TACR
        | hcr::TIDCP
        | hcr::RW
        | hcr::TERR
        | hcr::TEA
        | hcr::TID5
        | hcr::TLOR;
    assert_eq!(traps.hcr_el2, hcr_expected);
    assert_eq!(traps.hcr_el2 & (hcr::FIEN | hcr::ATA | hcr::DCT | hcr::E2H), 0);

    for bit in [cptr::TZ, cptr::TSM, cptr::TAM, cptr::TTA] {
        assert_ne!(traps.cptr_el2 & bit, 0, "cptr bit {:#x}", bit);
    }
    assert_eq!(traps.cptr_el2 & cptr::NVHE_RES1, cptr::NVHE_RES1);
    assert_eq!(traps.cptr_el2 & cptr::TFP, 0);

    let mdcr_expected = mdcr::TPM
        | mdcr::TPMCR
        | mdcr::TDRA
        | mdcr::TDA
        | mdcr::TDOSA
        | mdcr::TPMS
        | mdcr::TTRF
        | mdcr::TDCC;
    assert_eq!(traps.mdcr_el2, mdcr_expected);
}

#[test]
fn test_protected_traps_rich_cpu() {
    let caps = CpuCaps {
        ras: true,
        stage2_fwb: true,
        ..Default::default()
    };
    let traps = TrapConfig::for_protected(&rich_cpu(), &caps);

    // SVE is the only optional feature that survives sanitisation.
    assert_eq!(traps.cptr_el2 & cptr::TZ, 0);
    assert_ne!(traps.cptr_el2 & cptr::TAM, 0);
    assert_ne!(traps.cptr_el2 & cptr::TSM, 0);
    // RAS is capped below v1p1, MTE and LOR are hidden.
    assert_ne!(traps.hcr_el2 & hcr::TERR, 0);
    assert_ne!(traps.hcr_el2 & hcr::TID5, 0);
    assert_ne!(traps.hcr_el2 & hcr::TLOR, 0);
    assert_ne!(traps.hcr_el2 & hcr::FWB, 0);
    assert_eq!(traps.hcr_el2 & hcr::TID2, 0);
    // Debug is never exposed.
    assert_ne!(traps.mdcr_el2 & mdcr::TDA, 0);
    assert_ne!(traps.mdcr_el2 & mdcr::TDCC, 0);
}

#[test]
fn test_protected_traps_hvhe() {
    let caps = CpuCaps {
        hvhe: true,
        ..Default::default()
    };
    let traps = TrapConfig::for_protected(&IdRegs::default(), &caps);

    assert_ne!(traps.hcr_el2 & hcr::E2H, 0);
    // CPACR layout: enables are cleared instead of trap bits being set.
    assert_eq!(
        traps.cptr_el2 & (cptr::CPACR_ZEN_EL0EN | cptr::CPACR_ZEN_EL1EN),
        0
    );
    assert_eq!(
        traps.cptr_el2 & (cptr::CPACR_SMEN_EL0EN | cptr::CPACR_SMEN_EL1EN),
        0
    );
    assert_ne!(traps.cptr_el2 & cptr::CPACR_TTA, 0);
    assert_eq!(traps.cptr_el2 & cptr::CPACR_FPEN, cptr::CPACR_FPEN);
    assert_eq!(traps.cptr_el2 & (cptr::TZ | cptr::TSM), 0);
}

#[test]
fn test_host_guest_traps() {
    let host_hcr = hcr::TID2 | hcr::E2H;
    let traps = TrapConfig::for_host_guest(host_hcr, &CpuCaps::default());
    assert_eq!(traps.hcr_el2, hcr::GUEST_FLAGS | host_hcr);
    assert_eq!(traps.cptr_el2, cptr::NVHE_RES1);
    assert_eq!(traps.mdcr_el2, 0);
}
