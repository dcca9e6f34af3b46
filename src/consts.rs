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
pub use crate::memory::PAGE_SIZE;

pub const INVALID_ADDRESS: u64 = u64::MAX;

pub const MAX_CPU_NUM: usize = 16;

/// VM handles start here, so handle 0 never names a VM.
pub const HANDLE_OFFSET: u32 = 0x1000;

pub const DEFAULT_VM_TABLE_SIZE: usize = 64;

/// Entries in a vCPU request ring, the terminator included.
pub const HYP_REQ_MAX: usize = 16;

/// Pages a vCPU memcache needs to cover one stage-2 walk.
pub const DEFAULT_MEMCACHE_MIN_PAGES: usize = 2;

pub const MAX_VCPUS_PER_VM: usize = 64;
