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
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::HvResult;
use crate::vcpu::HypVcpu;
use crate::vm::PkvmVm;

/// A vCPU loaded on a physical CPU, with the VM reference that keeps it
/// alive.
#[derive(Clone)]
pub struct LoadedVcpu {
    pub vm: Arc<PkvmVm>,
    pub vcpu: Arc<HypVcpu>,
}

pub struct PerCpu {
    pub id: usize,
    /// Only written by the CPU itself.
    loaded: Mutex<Option<LoadedVcpu>>,
}

#[cfg(test)]
impl core::fmt::Debug for PerCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpu").field("id", &self.id).finish_non_exhaustive()
    }
}

impl PerCpu {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            loaded: Mutex::new(None),
        }
    }

    pub fn loaded_vcpu(&self) -> Option<LoadedVcpu> {
        self.loaded.lock().clone()
    }

    pub fn has_loaded_vcpu(&self) -> bool {
        self.loaded.lock().is_some()
    }

    pub(crate) fn set_loaded(&self, loaded: LoadedVcpu) {
        *self.loaded.lock() = Some(loaded);
    }

    pub(crate) fn clear_loaded(&self) -> Option<LoadedVcpu> {
        self.loaded.lock().take()
    }
}

pub struct PerCpuSet {
    cpus: Vec<PerCpu>,
}

impl PerCpuSet {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(PerCpu::new).collect(),
        }
    }

    pub fn get(&self, cpu: usize) -> HvResult<&PerCpu> {
        self.cpus.get(cpu).ok_or(hv_err!(EINVAL, "no such CPU"))
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}
