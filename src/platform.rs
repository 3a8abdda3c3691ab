// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::cpumask::CpuMask;

/// Kernel services the page cache consumes but does not own.
pub trait Platform: Send + Sync {
    /// Map an EPC range write-back cached, returning its virtual base.
    fn map_epc(&self, pa: usize, size: usize) -> Option<usize>;

    /// Undo [`Platform::map_epc`].
    fn unmap_epc(&self, pa: usize, size: usize);

    /// Broadcast a no-op IPI to every CPU in `mask` and wait for all of
    /// them to have taken it. Forcing the kernel boundary crossing is
    /// the entire point; the handler body is empty.
    fn kick_cpus(&self, mask: &CpuMask);

    /// Whether the calling task has a signal pending.
    fn signal_pending(&self) -> bool;

    /// Freezer hook for the reclaim daemon. Returns true if the daemon
    /// was suspended and should re-evaluate its wait condition.
    fn try_freeze(&self) -> bool {
        false
    }
}
