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
//! Control plane of a protected-VM hypervisor: VM and vCPU bookkeeping, guest
//! hypercalls and PSCI, host/guest page ownership and the SMMUv3 driver that
//! keeps DMA in line with it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
#[macro_use]
pub mod logging;

pub mod arch;
pub mod config;
pub mod consts;
pub mod memory;
pub mod hypercall;
pub mod hypervisor;
pub mod percpu;
pub mod vcpu;
pub mod vm;

#[cfg(test)]
mod test_utils;

pub use error::{HvError, HvErrorNum, HvResult};
pub use hypervisor::Hypervisor;
