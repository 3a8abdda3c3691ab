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

//! Last-resort recovery: when only unreclaimable pages are left, an
//! entire enclave is torn down to get its memory back.

use std::sync::Arc;

use crate::encl::{AddressSpace, Encl, EnclFlags};
use crate::epc::lru::EpcLru;
use crate::epc::{EpcManager, EpcPage, PageOwner};
use crate::virt::VirtEpc;

enum OomVictim {
    Encl(Arc<Encl>),
    Virt(Arc<dyn VirtEpc>),
}

impl EpcManager {
    /// Kick one victim off `lru`'s unreclaimable list. An enclave or
    /// version-array page costs its whole enclave; a virtualized page
    /// is delegated to the virtualization backend.
    ///
    /// Returns whether a victim was found.
    pub fn epc_oom(&self, lru: &EpcLru) -> bool {
        let (_page, victim) = match lru.pop_oom_candidate(|page| self.oom_get_ref(page)) {
            Some(victim) => victim,
            None => return false,
        };

        match victim {
            OomVictim::Encl(encl) => self.oom_encl(&encl),
            OomVictim::Virt(virt) => virt.oom(),
        }
        true
    }

    fn oom_get_ref(&self, page: &EpcPage) -> Option<OomVictim> {
        match page.owner() {
            Some(PageOwner::Enclave(encl_page)) => encl_page.get_encl().map(OomVictim::Encl),
            Some(PageOwner::VersionArray(encl)) => encl.upgrade().map(OomVictim::Encl),
            Some(PageOwner::Virt(virt)) => {
                if virt.oom_get_ref() {
                    Some(OomVictim::Virt(virt))
                } else {
                    None
                }
            }
            None => None,
        }
    }

    fn oom_encl(&self, encl: &Arc<Encl>) {
        // Taken under the enclave lock so the fault path cannot install
        // new PTEs once the flag is visible.
        let old_flags = {
            let _inner = encl.lock();
            encl.set_flags(EnclFlags::OOM)
        };

        if old_flags.intersects(EnclFlags::DEAD_OR_OOM) || !old_flags.contains(EnclFlags::CREATED)
        {
            return;
        }

        loop {
            let version = encl.mm_list().version();

            for encl_mm in encl.mm_list().snapshot() {
                let mm = match encl_mm.get() {
                    Some(mm) => mm,
                    None => continue,
                };

                let space = mm.space();
                oom_zap(
                    space.as_ref(),
                    encl.id(),
                    encl.base(),
                    encl.base() + encl.size(),
                );
            }

            if encl.mm_list().version() == version {
                break;
            }
        }

        let mut inner = encl.lock();
        encl.destroy_locked(&mut inner);
    }
}

/// Zap every PTE in `[start, end)` that sits in a mapping owned by the
/// enclave, batching runs of adjacent owned mappings into single calls.
fn oom_zap(space: &dyn AddressSpace, encl_id: usize, start: usize, end: usize) {
    let mut pos = start;

    while pos < end {
        let vma = match space.find_vma(pos) {
            Some(vma) => vma,
            None => break,
        };
        if vma.start >= end {
            break;
        }
        if vma.encl_id != encl_id {
            pos = vma.end;
            continue;
        }

        let run_start = vma.start;
        let mut run_end = vma.end;
        while let Some(next) = space.find_vma(run_end) {
            if next.encl_id != encl_id || next.start != run_end || next.start >= end {
                break;
            }
            run_end = next.end;
        }

        space.zap_ptes(run_start, run_end - run_start);
        pos = run_end;
    }
}
