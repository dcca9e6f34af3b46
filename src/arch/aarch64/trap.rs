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
//! Trap configuration of guest vCPUs.
//!
//! Protected guests only see a sanitised view of the CPU ID registers, and
//! every feature hidden from them is trapped in HCR_EL2, CPTR_EL2 and
//! MDCR_EL2.

use bit_field::BitField;
use static_assertions::const_assert;

#[cfg(all(target_arch = "aarch64", not(test)))]
use super::sysreg::read_sysreg;

#[allow(dead_code)]
pub mod hcr {
    pub const VM: u64 = 1 << 0;
    pub const SWIO: u64 = 1 << 1;
    pub const PTW: u64 = 1 << 2;
    pub const FMO: u64 = 1 << 3;
    pub const IMO: u64 = 1 << 4;
    pub const AMO: u64 = 1 << 5;
    pub const FB: u64 = 1 << 9;
    pub const BSU_IS: u64 = 1 << 10;
    pub const TWI: u64 = 1 << 13;
    pub const TWE: u64 = 1 << 14;
    pub const TID1: u64 = 1 << 16;
    pub const TID2: u64 = 1 << 17;
    pub const TID3: u64 = 1 << 18;
    pub const TSC: u64 = 1 << 19;
    pub const TIDCP: u64 = 1 << 20;
    pub const TACR: u64 = 1 << 21;
    pub const TSW: u64 = 1 << 22;
    pub const RW: u64 = 1 << 31;
    pub const E2H: u64 = 1 << 34;
    pub const TLOR: u64 = 1 << 35;
    pub const TERR: u64 = 1 << 36;
    pub const TEA: u64 = 1 << 37;
    pub const FWB: u64 = 1 << 46;
    pub const FIEN: u64 = 1 << 47;
    pub const AMVOFFEN: u64 = 1 << 51;
    pub const ATA: u64 = 1 << 56;
    pub const DCT: u64 = 1 << 57;
    pub const TID5: u64 = 1 << 58;

    /// Baseline for every guest.
    pub const GUEST_FLAGS: u64 = TSC
        | TSW
        | TWE
        | TWI
        | VM
        | BSU_IS
        | FB
        | TACR
        | AMO
        | SWIO
        | TIDCP
        | RW
        | TLOR
        | FMO
        | IMO
        | PTW
        | TID3;
}

#[allow(dead_code)]
pub mod cptr {
    pub const TZ: u64 = 1 << 8;
    pub const TFP: u64 = 1 << 10;
    pub const TSM: u64 = 1 << 12;
    pub const TTA: u64 = 1 << 20;
    pub const TAM: u64 = 1 << 30;
    pub const TCPAC: u64 = 1 << 31;
    pub const NVHE_RES1: u64 = (1 << 13) | (1 << 9) | 0xff;
    pub const NVHE_RES0: u64 = (0x1ff << 21) | (0x3f << 14) | (1 << 11);

    // CPACR_EL1 layout, used when the hypervisor runs with E2H set.
    pub const CPACR_ZEN_EL1EN: u64 = 1 << 16;
    pub const CPACR_ZEN_EL0EN: u64 = 1 << 17;
    pub const CPACR_FPEN: u64 = 3 << 20;
    pub const CPACR_SMEN_EL1EN: u64 = 1 << 24;
    pub const CPACR_SMEN_EL0EN: u64 = 1 << 25;
    pub const CPACR_TTA: u64 = 1 << 28;
}

#[allow(dead_code)]
pub mod mdcr {
    pub const HPMN_MASK: u64 = 0x1f;
    pub const TPMCR: u64 = 1 << 5;
    pub const TPM: u64 = 1 << 6;
    pub const HPME: u64 = 1 << 7;
    pub const TDA: u64 = 1 << 9;
    pub const TDOSA: u64 = 1 << 10;
    pub const TDRA: u64 = 1 << 11;
    pub const E2PB_SHIFT: u64 = 12;
    pub const E2PB_MASK: u64 = 0x3;
    pub const TPMS: u64 = 1 << 14;
    pub const TTRF: u64 = 1 << 19;
    pub const TDCC: u64 = 1 << 27;
    pub const MTPME: u64 = 1 << 28;
}

/// Shift of each 4-bit ID register field.
#[allow(dead_code)]
pub mod field {
    // ID_AA64PFR0_EL1
    pub const PFR0_EL0: usize = 0;
    pub const PFR0_EL1: usize = 4;
    pub const PFR0_EL2: usize = 8;
    pub const PFR0_EL3: usize = 12;
    pub const PFR0_FP: usize = 16;
    pub const PFR0_ADVSIMD: usize = 20;
    pub const PFR0_GIC: usize = 24;
    pub const PFR0_RAS: usize = 28;
    pub const PFR0_SVE: usize = 32;
    pub const PFR0_AMU: usize = 44;
    pub const PFR0_DIT: usize = 48;
    // ID_AA64PFR1_EL1
    pub const PFR1_BT: usize = 0;
    pub const PFR1_SSBS: usize = 4;
    pub const PFR1_MTE: usize = 8;
    pub const PFR1_SME: usize = 24;
    // ID_AA64DFR0_EL1
    pub const DFR0_DEBUGVER: usize = 0;
    pub const DFR0_TRACEVER: usize = 4;
    pub const DFR0_PMUVER: usize = 8;
    pub const DFR0_PMSVER: usize = 32;
    pub const DFR0_DOUBLELOCK: usize = 36;
    pub const DFR0_TRACEFILT: usize = 40;
    // ID_AA64MMFR0_EL1
    pub const MMFR0_PARANGE: usize = 0;
    pub const MMFR0_ASIDBITS: usize = 4;
    pub const MMFR0_BIGEND: usize = 8;
    pub const MMFR0_SNSMEM: usize = 12;
    pub const MMFR0_BIGENDEL0: usize = 16;
    pub const MMFR0_EXS: usize = 44;
    pub const MMFR0_FGT: usize = 56;
    // ID_AA64MMFR1_EL1
    pub const MMFR1_HAFDBS: usize = 0;
    pub const MMFR1_VMIDBITS: usize = 4;
    pub const MMFR1_HPDS: usize = 12;
    pub const MMFR1_LO: usize = 16;
    pub const MMFR1_PAN: usize = 20;
    pub const MMFR1_SPECSEI: usize = 24;
    pub const MMFR1_ETS: usize = 36;
    pub const MMFR1_CMOW: usize = 56;
    // ID_AA64ISAR1_EL1
    pub const ISAR1_APA: usize = 4;
    pub const ISAR1_API: usize = 8;
    pub const ISAR1_GPA: usize = 24;
    pub const ISAR1_GPI: usize = 28;
}

use field::*;

const fn fmask(shift: usize) -> u64 {
    0xf << shift
}

const fn fprep(shift: usize, val: u64) -> u64 {
    val << shift
}

const fn fget(shift: usize, reg: u64) -> u64 {
    (reg >> shift) & 0xf
}

const ELX_64BIT_ONLY: u64 = 1;
const SVE_IMP: u64 = 1;
const RAS_IMP: u64 = 1;
const RAS_V1P1: u64 = 2;
const PARANGE_40: u64 = 2;
const ASIDBITS_16: u64 = 2;

/// Features exposed to protected guests as implemented.
pub const PVM_PFR0_ALLOW: u64 =
    fmask(PFR0_FP) | fmask(PFR0_ADVSIMD) | fmask(PFR0_GIC) | fmask(PFR0_DIT);
/// Unsigned features capped for protected guests.
pub const PVM_PFR0_RESTRICT: u64 = fprep(PFR0_EL0, ELX_64BIT_ONLY)
    | fprep(PFR0_EL1, ELX_64BIT_ONLY)
    | fprep(PFR0_EL2, ELX_64BIT_ONLY)
    | fprep(PFR0_EL3, ELX_64BIT_ONLY)
    | fprep(PFR0_SVE, SVE_IMP)
    | fprep(PFR0_RAS, RAS_IMP);
pub const PVM_PFR1_ALLOW: u64 = fmask(PFR1_BT) | fmask(PFR1_SSBS);
pub const PVM_DFR0_ALLOW: u64 = 0;
pub const PVM_MMFR0_ALLOW: u64 =
    fmask(MMFR0_BIGEND) | fmask(MMFR0_SNSMEM) | fmask(MMFR0_BIGENDEL0) | fmask(MMFR0_EXS);
pub const PVM_MMFR0_RESTRICT: u64 =
    fprep(MMFR0_PARANGE, PARANGE_40) | fprep(MMFR0_ASIDBITS, ASIDBITS_16);
pub const PVM_MMFR1_ALLOW: u64 = fmask(MMFR1_HAFDBS)
    | fmask(MMFR1_VMIDBITS)
    | fmask(MMFR1_HPDS)
    | fmask(MMFR1_PAN)
    | fmask(MMFR1_SPECSEI)
    | fmask(MMFR1_ETS)
    | fmask(MMFR1_CMOW);
pub const PVM_ISAR1_ALLOW: u64 =
    fmask(ISAR1_APA) | fmask(ISAR1_API) | fmask(ISAR1_GPA) | fmask(ISAR1_GPI);

// Protected guests never run AArch32.
const_assert!(fget(PFR0_EL0, PVM_PFR0_RESTRICT) == ELX_64BIT_ONLY);
const_assert!(fget(PFR0_EL1, PVM_PFR0_RESTRICT) == ELX_64BIT_ONLY);
// Guests assume FP and AdvSIMD: their traps stay at the defaults.
const_assert!(fget(PFR0_FP, PVM_PFR0_ALLOW) != 0);
const_assert!(fget(PFR0_ADVSIMD, PVM_PFR0_ALLOW) != 0);
// No SME, MTE or trace for protected guests.
const_assert!(fget(PFR1_SME, PVM_PFR1_ALLOW) == 0);
const_assert!(fget(PFR1_MTE, PVM_PFR1_ALLOW) == 0);
const_assert!(fget(DFR0_TRACEVER, PVM_DFR0_ALLOW) == 0);

/// Raw ID register values of the boot CPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdRegs {
    pub pfr0: u64,
    pub pfr1: u64,
    pub dfr0: u64,
    pub mmfr0: u64,
    pub mmfr1: u64,
    pub isar1: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdReg {
    Pfr0,
    Pfr1,
    Dfr0,
    Mmfr0,
    Mmfr1,
    Isar1,
}

impl IdRegs {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    pub fn read_hw() -> Self {
        Self {
            pfr0: read_sysreg!(id_aa64pfr0_el1),
            pfr1: read_sysreg!(id_aa64pfr1_el1),
            dfr0: read_sysreg!(id_aa64dfr0_el1),
            mmfr0: read_sysreg!(id_aa64mmfr0_el1),
            mmfr1: read_sysreg!(id_aa64mmfr1_el1),
            isar1: read_sysreg!(id_aa64isar1_el1),
        }
    }

    fn raw(&self, reg: IdReg) -> u64 {
        match reg {
            IdReg::Pfr0 => self.pfr0,
            IdReg::Pfr1 => self.pfr1,
            IdReg::Dfr0 => self.dfr0,
            IdReg::Mmfr0 => self.mmfr0,
            IdReg::Mmfr1 => self.mmfr1,
            IdReg::Isar1 => self.isar1,
        }
    }

    /// The value of `reg` as seen by a protected guest.
    pub fn read_id_reg(&self, reg: IdReg) -> u64 {
        let (allow, restrict) = match reg {
            IdReg::Pfr0 => (PVM_PFR0_ALLOW, PVM_PFR0_RESTRICT),
            IdReg::Pfr1 => (PVM_PFR1_ALLOW, 0),
            IdReg::Dfr0 => (PVM_DFR0_ALLOW, 0),
            IdReg::Mmfr0 => (PVM_MMFR0_ALLOW, PVM_MMFR0_RESTRICT),
            IdReg::Mmfr1 => (PVM_MMFR1_ALLOW, 0),
            IdReg::Isar1 => (PVM_ISAR1_ALLOW, 0),
        };
        let hw = self.raw(reg);
        (hw & allow) | restricted_unsigned(hw, restrict)
    }

    /// The full sanitised view.
    pub fn sanitised(&self) -> Self {
        Self {
            pfr0: self.read_id_reg(IdReg::Pfr0),
            pfr1: self.read_id_reg(IdReg::Pfr1),
            dfr0: self.read_id_reg(IdReg::Dfr0),
            mmfr0: self.read_id_reg(IdReg::Mmfr0),
            mmfr1: self.read_id_reg(IdReg::Mmfr1),
            isar1: self.read_id_reg(IdReg::Isar1),
        }
    }
}

/// Each field of `restrict` caps the matching unsigned field of `hw`.
fn restricted_unsigned(hw: u64, restrict: u64) -> u64 {
    (0..64).step_by(4).fold(0, |acc, shift: usize| {
        let cap = restrict.get_bits(shift..shift + 4);
        if cap == 0 {
            return acc;
        }
        let val = hw.get_bits(shift..shift + 4).min(cap);
        acc | (val << shift)
    })
}

/// CPU capabilities that shape the baseline trap configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCaps {
    /// The hypervisor runs with HCR_EL2.E2H set, CPTR_EL2 has the CPACR layout.
    pub hvhe: bool,
    pub ras: bool,
    pub stage2_fwb: bool,
    pub mismatched_cache_type: bool,
}

impl CpuCaps {
    pub fn reset_cptr(&self) -> u64 {
        if self.hvhe {
            cptr::CPACR_FPEN
        } else {
            cptr::NVHE_RES1
        }
    }
}

/// Trap registers installed on every entry into a vCPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapConfig {
    pub hcr_el2: u64,
    pub cptr_el2: u64,
    pub mdcr_el2: u64,
}

impl TrapConfig {
    /// Non-protected guests run with the host's choice of traps.
    pub fn for_host_guest(host_hcr: u64, caps: &CpuCaps) -> Self {
        Self {
            hcr_el2: hcr::GUEST_FLAGS | host_hcr,
            cptr_el2: caps.reset_cptr(),
            mdcr_el2: 0,
        }
    }

    pub fn for_protected(id: &IdRegs, caps: &CpuCaps) -> Self {
        let mut traps = Self {
            hcr_el2: 0,
            cptr_el2: caps.reset_cptr(),
            mdcr_el2: 0,
        };
        traps.init_base(caps);
        traps.init_pfr0(id.read_id_reg(IdReg::Pfr0), caps);
        traps.init_pfr1(id.read_id_reg(IdReg::Pfr1), caps);
        traps.init_dfr0(id.read_id_reg(IdReg::Dfr0), caps);
        traps.init_mmfr0(id.read_id_reg(IdReg::Mmfr0));
        traps.init_mmfr1(id.read_id_reg(IdReg::Mmfr1));
        traps
    }

    fn apply(&mut self, hcr_set: u64, hcr_clear: u64, cptr_set: u64, cptr_clear: u64) {
        self.hcr_el2 = (self.hcr_el2 | hcr_set) & !hcr_clear;
        self.cptr_el2 = (self.cptr_el2 | cptr_set) & !cptr_clear;
    }

    fn init_base(&mut self, caps: &CpuCaps) {
        // Always trap the ID registers and implementation defined features.
        self.hcr_el2 = hcr::GUEST_FLAGS | hcr::TID3 | hcr::TACR | hcr::TIDCP | hcr::TID1;
        if caps.ras {
            self.hcr_el2 |= hcr::TEA | hcr::TERR;
        }
        if caps.stage2_fwb {
            self.hcr_el2 |= hcr::FWB;
        }
        if caps.mismatched_cache_type {
            self.hcr_el2 |= hcr::TID2;
        }
        if !caps.hvhe {
            self.cptr_el2 = (self.cptr_el2 | cptr::NVHE_RES1) & !cptr::NVHE_RES0;
        }
    }

    fn init_pfr0(&mut self, ids: u64, caps: &CpuCaps) {
        let mut hcr_set = hcr::RW;
        let (mut hcr_clear, mut cptr_set, mut cptr_clear) = (0, 0, 0);

        if caps.hvhe {
            hcr_set |= hcr::E2H;
        }
        // Trap RAS unless all current versions are supported.
        if fget(PFR0_RAS, ids) < RAS_V1P1 {
            hcr_set |= hcr::TERR | hcr::TEA;
            hcr_clear |= hcr::FIEN;
        }
        if fget(PFR0_AMU, ids) == 0 {
            hcr_clear |= hcr::AMVOFFEN;
            cptr_set |= cptr::TAM;
        }
        if fget(PFR0_SVE, ids) == 0 {
            if caps.hvhe {
                cptr_clear |= cptr::CPACR_ZEN_EL0EN | cptr::CPACR_ZEN_EL1EN;
            } else {
                cptr_set |= cptr::TZ;
            }
        }
        self.apply(hcr_set, hcr_clear, cptr_set, cptr_clear);
    }

    fn init_pfr1(&mut self, ids: u64, caps: &CpuCaps) {
        let (mut hcr_set, mut hcr_clear) = (0, 0);

        // Trap and treat tags as untagged without MTE.
        if fget(PFR1_MTE, ids) == 0 {
            hcr_set |= hcr::TID5;
            hcr_clear |= hcr::DCT | hcr::ATA;
        }
        if fget(PFR1_SME, ids) != 0 {
            warn!("SME exposed to a protected guest, trapping it anyway");
        }
        let (cptr_set, cptr_clear) = if caps.hvhe {
            (0, cptr::CPACR_SMEN_EL1EN | cptr::CPACR_SMEN_EL0EN)
        } else {
            (cptr::TSM, 0)
        };
        self.apply(hcr_set, hcr_clear, cptr_set, cptr_clear);
    }

    fn init_dfr0(&mut self, ids: u64, caps: &CpuCaps) {
        let (mut mdcr_set, mut mdcr_clear, mut cptr_set) = (0, 0, 0);

        if fget(DFR0_PMUVER, ids) == 0 {
            mdcr_set |= mdcr::TPM | mdcr::TPMCR;
            mdcr_clear |= mdcr::HPME | mdcr::MTPME | mdcr::HPMN_MASK;
        }
        if fget(DFR0_DEBUGVER, ids) == 0 {
            mdcr_set |= mdcr::TDRA | mdcr::TDA;
        }
        if fget(DFR0_DOUBLELOCK, ids) == 0 {
            mdcr_set |= mdcr::TDOSA;
        }
        if fget(DFR0_PMSVER, ids) == 0 {
            mdcr_set |= mdcr::TPMS;
            mdcr_clear |= mdcr::E2PB_MASK << mdcr::E2PB_SHIFT;
        }
        if fget(DFR0_TRACEFILT, ids) == 0 {
            mdcr_set |= mdcr::TTRF;
        }
        if fget(DFR0_TRACEVER, ids) == 0 {
            cptr_set |= if caps.hvhe {
                cptr::CPACR_TTA
            } else {
                cptr::TTA
            };
        }
        self.mdcr_el2 = (self.mdcr_el2 | mdcr_set) & !mdcr_clear;
        self.cptr_el2 |= cptr_set;
    }

    fn init_mmfr0(&mut self, ids: u64) {
        // Debug communications channel.
        if fget(MMFR0_FGT, ids) == 0 {
            self.mdcr_el2 |= mdcr::TDCC;
        }
    }

    fn init_mmfr1(&mut self, ids: u64) {
        if fget(MMFR1_LO, ids) == 0 {
            self.hcr_el2 |= hcr::TLOR;
        }
    }
}

#[cfg(test)]
mod tests;
