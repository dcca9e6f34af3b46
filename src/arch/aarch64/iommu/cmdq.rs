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
//! SMMUv3 command queue.
//!
//! The queue memory is written by the host at probe time and donated to the
//! hypervisor. Only the producer index is shadowed, the consumer index
//! always comes from the device.
use tock_registers::interfaces::{Readable, Writeable};

use super::regs::{field_prep, genmask, RegisterPage};
use crate::error::HvResult;
use crate::memory::PhysAddr;

pub const CMDQ_ENT_DWORDS: usize = 2;
const CMDQ_ENT_SIZE: usize = CMDQ_ENT_DWORDS << 3;

pub const CMDQ_OP_CFGI_STE: u8 = 0x03;
pub const CMDQ_OP_CFGI_ALL: u8 = 0x04;
pub const CMDQ_OP_CFGI_CD: u8 = 0x05;
pub const CMDQ_OP_TLBI_NH_ASID: u8 = 0x11;
pub const CMDQ_OP_TLBI_NH_VA: u8 = 0x12;
pub const CMDQ_OP_TLBI_S12_VMALL: u8 = 0x28;
pub const CMDQ_OP_TLBI_S2_IPA: u8 = 0x2a;
pub const CMDQ_OP_TLBI_NSNH_ALL: u8 = 0x30;
pub const CMDQ_OP_CMD_SYNC: u8 = 0x46;

pub const CMDQ_0_OP: u64 = genmask(7, 0);

pub const CMDQ_CFGI_0_SSID: u64 = genmask(31, 12);
pub const CMDQ_CFGI_0_SID: u64 = genmask(63, 32);
pub const CMDQ_CFGI_1_LEAF: u64 = 1 << 0;
pub const CMDQ_CFGI_1_RANGE: u64 = genmask(4, 0);

pub const CMDQ_TLBI_0_NUM: u64 = genmask(16, 12);
pub const CMDQ_TLBI_RANGE_NUM_MAX: u64 = 31;
pub const CMDQ_TLBI_0_SCALE: u64 = genmask(24, 20);
pub const CMDQ_TLBI_0_VMID: u64 = genmask(47, 32);
pub const CMDQ_TLBI_0_ASID: u64 = genmask(63, 48);
pub const CMDQ_TLBI_1_LEAF: u64 = 1 << 0;
pub const CMDQ_TLBI_1_TTL: u64 = genmask(9, 8);
pub const CMDQ_TLBI_1_TG: u64 = genmask(11, 10);
pub const CMDQ_TLBI_1_VA_MASK: u64 = genmask(63, 12);
pub const CMDQ_TLBI_1_IPA_MASK: u64 = genmask(51, 12);

pub const CMDQ_SYNC_0_CS: u64 = genmask(13, 12);
pub const CMDQ_SYNC_0_CS_SEV: u64 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct CfgiEnt {
    pub sid: u32,
    pub ssid: u32,
    pub leaf: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TlbiEnt {
    pub asid: u16,
    pub vmid: u16,
    pub num: u8,
    pub scale: u8,
    pub leaf: bool,
    pub ttl: u8,
    pub tg: u8,
    pub addr: u64,
}

/// A command before encoding. Only the fields of `opcode` are used.
#[derive(Debug, Default, Clone, Copy)]
pub struct CmdqEnt {
    pub opcode: u8,
    pub cfgi: CfgiEnt,
    pub tlbi: TlbiEnt,
}

impl CmdqEnt {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            ..Default::default()
        }
    }

    pub fn cfgi_ste(sid: u32) -> Self {
        let mut ent = Self::new(CMDQ_OP_CFGI_STE);
        ent.cfgi.sid = sid;
        ent.cfgi.leaf = true;
        ent
    }

    pub fn cfgi_cd(sid: u32, ssid: u32) -> Self {
        let mut ent = Self::new(CMDQ_OP_CFGI_CD);
        ent.cfgi.sid = sid;
        ent.cfgi.ssid = ssid;
        ent.cfgi.leaf = true;
        ent
    }

    pub fn encode(&self) -> HvResult<[u64; CMDQ_ENT_DWORDS]> {
        let mut cmd = [0u64; CMDQ_ENT_DWORDS];
        let cfgi = &self.cfgi;
        let tlbi = &self.tlbi;
        cmd[0] |= field_prep(CMDQ_0_OP, self.opcode as u64);

        match self.opcode {
            CMDQ_OP_CFGI_ALL => cmd[1] |= field_prep(CMDQ_CFGI_1_RANGE, 31),
            CMDQ_OP_CFGI_CD | CMDQ_OP_CFGI_STE => {
                if self.opcode == CMDQ_OP_CFGI_CD {
                    cmd[0] |= field_prep(CMDQ_CFGI_0_SSID, cfgi.ssid as u64);
                }
                cmd[0] |= field_prep(CMDQ_CFGI_0_SID, cfgi.sid as u64);
                cmd[1] |= field_prep(CMDQ_CFGI_1_LEAF, cfgi.leaf as u64);
            }
            CMDQ_OP_TLBI_NH_VA => {
                cmd[0] |= field_prep(CMDQ_TLBI_0_VMID, tlbi.vmid as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_NUM, tlbi.num as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_SCALE, tlbi.scale as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_ASID, tlbi.asid as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_LEAF, tlbi.leaf as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TTL, tlbi.ttl as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TG, tlbi.tg as u64);
                cmd[1] |= tlbi.addr & CMDQ_TLBI_1_VA_MASK;
            }
            CMDQ_OP_TLBI_NSNH_ALL => {}
            CMDQ_OP_TLBI_NH_ASID | CMDQ_OP_TLBI_S12_VMALL => {
                if self.opcode == CMDQ_OP_TLBI_NH_ASID {
                    cmd[0] |= field_prep(CMDQ_TLBI_0_ASID, tlbi.asid as u64);
                }
                cmd[0] |= field_prep(CMDQ_TLBI_0_VMID, tlbi.vmid as u64);
            }
            CMDQ_OP_TLBI_S2_IPA => {
                cmd[0] |= field_prep(CMDQ_TLBI_0_NUM, tlbi.num as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_SCALE, tlbi.scale as u64);
                cmd[0] |= field_prep(CMDQ_TLBI_0_VMID, tlbi.vmid as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_LEAF, tlbi.leaf as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TTL, tlbi.ttl as u64);
                cmd[1] |= field_prep(CMDQ_TLBI_1_TG, tlbi.tg as u64);
                cmd[1] |= tlbi.addr & CMDQ_TLBI_1_IPA_MASK;
            }
            CMDQ_OP_CMD_SYNC => cmd[0] |= field_prep(CMDQ_SYNC_0_CS, CMDQ_SYNC_0_CS_SEV),
            op => {
                warn!("smmu: unknown command opcode {:#x}", op);
                return hv_result_err!(EINVAL);
            }
        }
        Ok(cmd)
    }
}

pub struct CmdQueue {
    base: PhysAddr,
    log2size: u32,
    prod: u32,
}

impl CmdQueue {
    pub fn new(base: PhysAddr, log2size: u32) -> Self {
        Self {
            base,
            log2size,
            prod: 0,
        }
    }

    pub fn size_bytes(log2size: u32) -> usize {
        (1 << log2size) * CMDQ_ENT_SIZE
    }

    fn q_idx(&self, reg: u32) -> u32 {
        reg & ((1 << self.log2size) - 1)
    }

    fn q_wrap(&self, reg: u32) -> u32 {
        reg & (1 << self.log2size)
    }

    pub fn full(&self, rp: &RegisterPage) -> bool {
        let cons = rp.CMDQ_CONS.get();
        self.q_idx(self.prod) == self.q_idx(cons) && self.q_wrap(self.prod) != self.q_wrap(cons)
    }

    pub fn empty_now(&self, rp: &RegisterPage) -> bool {
        let cons = rp.CMDQ_CONS.get();
        self.q_idx(self.prod) == self.q_idx(cons) && self.q_wrap(self.prod) == self.q_wrap(cons)
    }

    /// Write `cmd` in the next free slot and publish it. The caller has
    /// checked that the queue is not full.
    pub fn push(&mut self, rp: &RegisterPage, cmd: [u64; CMDQ_ENT_DWORDS]) {
        let slot = self.base + self.q_idx(self.prod) as usize * CMDQ_ENT_SIZE;
        for (i, dword) in cmd.iter().enumerate() {
            unsafe { ((slot + i * 8) as *mut u64).write_volatile(dword.to_le()) };
        }
        self.prod = self.prod.wrapping_add(1) & ((2 << self.log2size) - 1);
        // The command must be visible before the doorbell.
        crate::arch::cpu::wmb();
        rp.CMDQ_PROD.set(self.q_idx(self.prod) | self.q_wrap(self.prod));
    }
}
