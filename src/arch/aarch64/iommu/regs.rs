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
//! SMMUv3 register window and the bit layouts of the in-memory structures.
use tock_registers::{
    register_structs,
    registers::{ReadOnly, ReadWrite},
};

/// Mask of bits `[h:l]`.
pub const fn genmask(h: u32, l: u32) -> u64 {
    (u64::MAX >> (63 - h)) & (u64::MAX << l)
}

pub fn field_prep(mask: u64, val: u64) -> u64 {
    (val << mask.trailing_zeros()) & mask
}

pub fn field_get(mask: u64, reg: u64) -> u64 {
    (reg & mask) >> mask.trailing_zeros()
}

// page0 + page1
register_structs! {
    #[allow(non_snake_case)]
    pub RegisterPage {
        (0x0000 => pub IDR0: ReadOnly<u32>),
        (0x0004 => pub IDR1: ReadOnly<u32>),
        (0x0008 => pub IDR2: ReadOnly<u32>),
        (0x000c => pub IDR3: ReadOnly<u32>),
        (0x0010 => pub IDR4: ReadOnly<u32>),
        (0x0014 => pub IDR5: ReadOnly<u32>),
        (0x0018 => pub IIDR: ReadOnly<u32>),
        (0x001c => pub AIDR: ReadOnly<u32>),
        (0x0020 => pub CR0: ReadWrite<u32>),
        (0x0024 => pub CR0ACK: ReadOnly<u32>),
        (0x0028 => pub CR1: ReadWrite<u32>),
        (0x002c => pub CR2: ReadWrite<u32>),
        (0x0030 => _reserved0),
        (0x0044 => pub GBPA: ReadWrite<u32>),
        (0x0048 => _reserved1),
        (0x0050 => pub IRQ_CTRL: ReadWrite<u32>),
        (0x0054 => pub IRQ_CTRLACK: ReadOnly<u32>),
        (0x0058 => _reserved2),
        (0x0060 => pub GERROR: ReadOnly<u32>),
        (0x0064 => pub GERRORN: ReadWrite<u32>),
        (0x0068 => pub GERROR_IRQ_CFG0: ReadWrite<u64>),
        (0x0070 => _reserved3),
        (0x0080 => pub STRTAB_BASE: ReadWrite<u64>),
        (0x0088 => pub STRTAB_BASE_CFG: ReadWrite<u32>),
        (0x008c => _reserved4),
        (0x0090 => pub CMDQ_BASE: ReadWrite<u64>),
        (0x0098 => pub CMDQ_PROD: ReadWrite<u32>),
        (0x009c => pub CMDQ_CONS: ReadWrite<u32>),
        (0x00a0 => pub EVTQ_BASE: ReadWrite<u64>),
        (0x00a8 => _reserved5),
        (0x00b0 => pub EVTQ_IRQ_CFG0: ReadWrite<u64>),
        (0x00b8 => pub EVTQ_IRQ_CFG1: ReadWrite<u32>),
        (0x00bc => pub EVTQ_IRQ_CFG2: ReadWrite<u32>),
        (0x00c0 => _reserved6),
        (0x100a8 => pub EVTQ_PROD: ReadWrite<u32>),
        (0x100ac => pub EVTQ_CONS: ReadWrite<u32>),
        (0x100b0 => _reserved7),
        (0x20000 => @END),
    }
}

unsafe impl Sync for RegisterPage {}

pub const SMMU_MMIO_SIZE: usize = 0x20000;

pub const ARM_SMMU_CR0: u32 = 0x20;
pub const ARM_SMMU_GERROR: u32 = 0x60;
pub const ARM_SMMU_GERRORN: u32 = 0x64;
pub const ARM_SMMU_EVTQ_PROD: u32 = 0x100a8;
pub const ARM_SMMU_EVTQ_CONS: u32 = 0x100ac;

pub const IDR0_S2P: u32 = 1 << 0;
pub const IDR0_S1P: u32 = 1 << 1;
pub const IDR0_COHACC: u32 = 1 << 4;
pub const IDR0_SEV: u32 = 1 << 14;
pub const IDR0_VMID16: u32 = 1 << 18;
pub const IDR0_ST_LVL: u64 = genmask(28, 27);
pub const IDR0_ST_LVL_2LVL: u64 = 1;

pub const IDR1_SIDSIZE: u64 = genmask(5, 0);
pub const IDR1_SSIDSIZE: u64 = genmask(10, 6);
pub const IDR1_CMDQS: u64 = genmask(25, 21);

pub const IDR3_RIL: u32 = 1 << 10;

pub const IDR5_OAS: u64 = genmask(2, 0);
pub const IDR5_GRAN4K: u32 = 1 << 4;
pub const IDR5_GRAN16K: u32 = 1 << 5;
pub const IDR5_GRAN64K: u32 = 1 << 6;

pub const CR0_SMMUEN: u32 = 1 << 0;
pub const CR0_EVTQEN: u32 = 1 << 2;
pub const CR0_CMDQEN: u32 = 1 << 3;
pub const CR0_ATSCHK: u32 = 1 << 4;

pub const CR1_QUEUE_IC: u64 = genmask(1, 0);
pub const CR1_QUEUE_OC: u64 = genmask(3, 2);
pub const CR1_QUEUE_SH: u64 = genmask(5, 4);
pub const CR1_TABLE_IC: u64 = genmask(7, 6);
pub const CR1_TABLE_OC: u64 = genmask(9, 8);
pub const CR1_TABLE_SH: u64 = genmask(11, 10);
pub const CR1_CACHE_WB: u64 = 1;
pub const SH_ISH: u64 = 3;

pub const CR2_PTM: u32 = 1 << 2;

pub const GBPA_ABORT: u32 = 1 << 20;
pub const GERROR_SFM_ERR: u32 = 1 << 8;

pub const Q_BASE_RWA: u64 = 1 << 62;
pub const Q_BASE_ADDR_MASK: u64 = genmask(51, 5);
pub const Q_BASE_LOG2SIZE: u64 = genmask(4, 0);

pub const STRTAB_BASE_RA: u64 = 1 << 62;
pub const STRTAB_BASE_ADDR_MASK: u64 = genmask(51, 6);
pub const STRTAB_BASE_CFG_LOG2SIZE: u64 = genmask(5, 0);
pub const STRTAB_BASE_CFG_SPLIT: u64 = genmask(10, 6);
pub const STRTAB_BASE_CFG_FMT: u64 = genmask(17, 16);
pub const STRTAB_BASE_CFG_FMT_LINEAR: u64 = 0;
pub const STRTAB_BASE_CFG_FMT_2LVL: u64 = 1;

pub const STRTAB_L1_DESC_DWORDS: usize = 1;
pub const STRTAB_L1_DESC_SPAN: u64 = genmask(4, 0);
pub const STRTAB_L1_DESC_L2PTR_MASK: u64 = genmask(51, 6);

pub const STRTAB_STE_DWORDS: usize = 8;
pub const STRTAB_STE_0_V: u64 = 1 << 0;
pub const STRTAB_STE_0_CFG: u64 = genmask(3, 1);
pub const STRTAB_STE_0_CFG_ABORT: u64 = 0;
pub const STRTAB_STE_0_CFG_BYPASS: u64 = 4;
pub const STRTAB_STE_0_CFG_S1_TRANS: u64 = 5;
pub const STRTAB_STE_0_CFG_S2_TRANS: u64 = 6;
pub const STRTAB_STE_0_S1FMT: u64 = genmask(5, 4);
pub const STRTAB_STE_0_S1FMT_LINEAR: u64 = 0;
pub const STRTAB_STE_0_S1CTXPTR_MASK: u64 = genmask(51, 6);
pub const STRTAB_STE_0_S1CDMAX: u64 = genmask(63, 59);

pub const STRTAB_STE_1_S1DSS: u64 = genmask(1, 0);
pub const STRTAB_STE_1_S1DSS_SSID0: u64 = 2;
pub const STRTAB_STE_1_S1C_CACHE_WBRA: u64 = 1;
pub const STRTAB_STE_1_S1CIR: u64 = genmask(3, 2);
pub const STRTAB_STE_1_S1COR: u64 = genmask(5, 4);
pub const STRTAB_STE_1_S1CSH: u64 = genmask(7, 6);
pub const STRTAB_STE_1_SHCFG: u64 = genmask(45, 44);
pub const STRTAB_STE_1_SHCFG_INCOMING: u64 = 1;

pub const STRTAB_STE_2_S2VMID: u64 = genmask(15, 0);
pub const STRTAB_STE_2_VTCR: u64 = genmask(50, 32);
pub const STRTAB_STE_2_VTCR_S2T0SZ: u64 = genmask(5, 0);
pub const STRTAB_STE_2_VTCR_S2SL0: u64 = genmask(7, 6);
pub const STRTAB_STE_2_VTCR_S2IR0: u64 = genmask(9, 8);
pub const STRTAB_STE_2_VTCR_S2OR0: u64 = genmask(11, 10);
pub const STRTAB_STE_2_VTCR_S2SH0: u64 = genmask(13, 12);
pub const STRTAB_STE_2_VTCR_S2TG: u64 = genmask(15, 14);
pub const STRTAB_STE_2_VTCR_S2PS: u64 = genmask(18, 16);
pub const STRTAB_STE_2_S2AA64: u64 = 1 << 51;
pub const STRTAB_STE_2_S2R: u64 = 1 << 58;

pub const STRTAB_STE_3_S2TTB_MASK: u64 = genmask(51, 4);

pub const CTXDESC_CD_DWORDS: usize = 8;
pub const CTXDESC_CD_0_TCR_T0SZ: u64 = genmask(5, 0);
pub const CTXDESC_CD_0_TCR_TG0: u64 = genmask(7, 6);
pub const CTXDESC_CD_0_TCR_IRGN0: u64 = genmask(9, 8);
pub const CTXDESC_CD_0_TCR_ORGN0: u64 = genmask(11, 10);
pub const CTXDESC_CD_0_TCR_SH0: u64 = genmask(13, 12);
pub const CTXDESC_CD_0_TCR_EPD1: u64 = 1 << 30;
pub const CTXDESC_CD_0_V: u64 = 1 << 31;
pub const CTXDESC_CD_0_TCR_IPS: u64 = genmask(34, 32);
pub const CTXDESC_CD_0_AA64: u64 = 1 << 41;
pub const CTXDESC_CD_0_R: u64 = 1 << 45;
pub const CTXDESC_CD_0_A: u64 = 1 << 46;
pub const CTXDESC_CD_0_ASET: u64 = 1 << 47;
pub const CTXDESC_CD_0_ASID: u64 = genmask(63, 48);
pub const CTXDESC_CD_1_TTB0_MASK: u64 = genmask(51, 4);

/// ESR_ELx fields of a data abort.
pub const ESR_ELX_WNR: u64 = 1 << 6;
pub const ESR_ELX_SAS: u64 = genmask(23, 22);
pub const ESR_ELX_SRT: u64 = genmask(20, 16);
