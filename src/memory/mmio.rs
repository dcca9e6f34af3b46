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
use bit_field::BitField;

use super::GuestPhysAddr;

/// Exception class of a data abort from a lower exception level.
pub const ESR_EC_DABT_LOW: u64 = 0x24;
const ESR_EC_SHIFT: usize = 26;

const ISS_ISV: usize = 24;
const ISS_SAS: core::ops::Range<usize> = 22..24;
const ISS_SSE: usize = 21;
const ISS_SRT: core::ops::Range<usize> = 16..21;
const ISS_SF: usize = 15;
const ISS_WNR: usize = 6;

/// A decoded guest data abort on an address that is not backed by memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MMIOAccess {
    /// Faulting IPA, including the offset within the page.
    pub address: GuestPhysAddr,
    /// Size of the access in bytes.
    pub size: usize,
    /// True if write access.
    pub is_write: bool,
    /// Register transferring the data, 31 is xzr.
    pub reg: usize,
    pub sign_extend: bool,
    /// 64-bit register width.
    pub sixty_four: bool,
}

impl MMIOAccess {
    /// Decode a data abort syndrome. `None` when the syndrome carries no
    /// valid instruction information, in which case the access can't be
    /// emulated.
    pub fn from_esr(esr: u64, address: GuestPhysAddr) -> Option<Self> {
        if esr.get_bits(ESR_EC_SHIFT..32) != ESR_EC_DABT_LOW || !esr.get_bit(ISS_ISV) {
            return None;
        }
        Some(Self {
            address,
            size: 1 << esr.get_bits(ISS_SAS),
            is_write: esr.get_bit(ISS_WNR),
            reg: esr.get_bits(ISS_SRT) as usize,
            sign_extend: esr.get_bit(ISS_SSE),
            sixty_four: esr.get_bit(ISS_SF),
        })
    }

    /// Last byte touched by the access.
    pub fn end(&self) -> GuestPhysAddr {
        self.address + self.size - 1
    }
}
