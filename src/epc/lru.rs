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

use std::collections::VecDeque;
use std::sync::Arc;

use spin::Mutex as SpinMutex;

use crate::encl::Encl;
use crate::epc::{EpcPage, EpcPageFlags};
use crate::error::EpcResult;

/// A page held by an in-flight reclaim batch, together with the enclave
/// reference taken at isolation. The reference is dropped when the page
/// leaves the batch, which may run the enclave's final teardown.
pub struct IsoPage {
    pub page: Arc<EpcPage>,
    pub encl: Arc<Encl>,
}

struct LruLists {
    reclaimable: VecDeque<Arc<EpcPage>>,
    unreclaimable: VecDeque<Arc<EpcPage>>,
}

/// Eviction tracking for a set of pages: one list of pages the hardware
/// may evict, one of pages it may not. Exactly one global instance
/// exists; cgroup-scoped instances come and go with their groups.
pub struct EpcLru {
    lists: SpinMutex<LruLists>,
}

impl Default for EpcLru {
    fn default() -> Self {
        Self::new()
    }
}

impl EpcLru {
    pub fn new() -> Self {
        Self {
            lists: SpinMutex::new(LruLists {
                reclaimable: VecDeque::new(),
                unreclaimable: VecDeque::new(),
            }),
        }
    }

    pub fn reclaimable_is_empty(&self) -> bool {
        self.lists.lock().reclaimable.is_empty()
    }

    /// Mark `page` with `flags` and append it to the matching list.
    pub fn record(&self, page: &Arc<EpcPage>, flags: EpcPageFlags) {
        let mut lists = self.lists.lock();
        if page
            .flags()
            .intersects(EpcPageFlags::RECLAIM_FLAGS)
        {
            warn!(
                "page {:#x} recorded with reclaim flags already set: {:?}",
                page.pa(),
                page.flags()
            );
        }
        page.set_flags(flags);
        if flags.contains(EpcPageFlags::RECLAIMABLE) {
            lists.reclaimable.push_back(page.clone());
        } else {
            lists.unreclaimable.push_back(page.clone());
        }
    }

    /// Remove `page` from its list and clear the reclaim flags.
    ///
    /// Fails with `EBUSY` while the page is owned by an in-flight
    /// reclaim; the caller must retry or leave the page for the
    /// reclaimer to free.
    pub fn drop_page(&self, page: &Arc<EpcPage>) -> EpcResult {
        let mut lists = self.lists.lock();
        let flags = page.flags();
        if flags.contains(EpcPageFlags::RECLAIMABLE)
            && flags.contains(EpcPageFlags::RECLAIM_IN_PROGRESS)
        {
            return epc_result_err!(EBUSY, "page is being reclaimed");
        }
        Self::unlink(&mut lists.reclaimable, page);
        Self::unlink(&mut lists.unreclaimable, page);
        page.clear_flags(EpcPageFlags::RECLAIM_FLAGS);
        Ok(())
    }

    /// Take up to `nr_to_scan` pages off the head of the reclaimable
    /// list into `dst`, tagging each `RECLAIM_IN_PROGRESS`. A page whose
    /// owner is already being freed is untracked instead of isolated.
    /// Both outcomes consume scan budget.
    pub fn isolate(&self, nr_to_scan: &mut usize, dst: &mut Vec<IsoPage>) {
        let mut lists = self.lists.lock();
        while *nr_to_scan > 0 {
            let page = match lists.reclaimable.pop_front() {
                Some(page) => page,
                None => break,
            };
            *nr_to_scan -= 1;

            let encl_page = match page.owner_encl_page() {
                Some(encl_page) => encl_page,
                None => {
                    warn!("reclaimable page {:#x} has no enclave owner", page.pa());
                    lists.reclaimable.push_front(page);
                    continue;
                }
            };

            match encl_page.get_encl() {
                Some(encl) => {
                    page.set_flags(EpcPageFlags::RECLAIM_IN_PROGRESS);
                    dst.push(IsoPage { page, encl });
                }
                None => {
                    // The owner is freeing the page; untrack it here so
                    // the teardown path can release it.
                    page.clear_flags(EpcPageFlags::RECLAIMABLE);
                }
            }
        }
    }

    /// Put a skipped page back so the next scan sees it last.
    pub(crate) fn return_to_tail(&self, page: &Arc<EpcPage>) {
        let mut lists = self.lists.lock();
        page.clear_flags(EpcPageFlags::RECLAIM_IN_PROGRESS);
        lists.reclaimable.push_back(page.clone());
    }

    /// Pop unreclaimable entries until `get_ref` manages to pin one's
    /// owner. Entries whose owner is already being freed are unlinked
    /// and skipped.
    pub(crate) fn pop_oom_candidate<T>(
        &self,
        get_ref: impl Fn(&EpcPage) -> Option<T>,
    ) -> Option<(Arc<EpcPage>, T)> {
        let mut lists = self.lists.lock();
        while let Some(page) = lists.unreclaimable.pop_front() {
            if let Some(owner_ref) = get_ref(&page) {
                return Some((page, owner_ref));
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn contains_reclaimable(&self, page: &Arc<EpcPage>) -> bool {
        self.lists
            .lock()
            .reclaimable
            .iter()
            .any(|entry| Arc::ptr_eq(entry, page))
    }

    #[cfg(test)]
    pub(crate) fn contains_unreclaimable(&self, page: &Arc<EpcPage>) -> bool {
        self.lists
            .lock()
            .unreclaimable
            .iter()
            .any(|entry| Arc::ptr_eq(entry, page))
    }

    #[cfg(test)]
    pub(crate) fn lens(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.reclaimable.len(), lists.unreclaimable.len())
    }

    fn unlink(list: &mut VecDeque<Arc<EpcPage>>, page: &Arc<EpcPage>) {
        if let Some(pos) = list.iter().position(|entry| Arc::ptr_eq(entry, page)) {
            list.remove(pos);
        }
    }
}
