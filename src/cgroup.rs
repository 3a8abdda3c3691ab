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

//! EPC cgroup charging hooks. The page cache calls these at allocation,
//! free and reclaim boundaries; the accounting policy itself lives with
//! the cgroup controller.

use std::sync::Arc;

use crate::epc::lru::{EpcLru, IsoPage};
use crate::error::EpcResult;

/// One charged group. A page holds a reference to the group it was
/// charged to until the charge is released.
pub trait EpcCgroup: Send + Sync {
    /// The LRU instance pages charged to this group are tracked on.
    fn lru(&self) -> &EpcLru;

    /// Release one page charge. `reclaimed` tells the controller whether
    /// the page left through the reclaimer or through a plain free.
    fn uncharge(&self, reclaimed: bool);
}

/// The controller side, consulted by the allocator and the reclaimer.
pub trait CgroupSubsys: Send + Sync {
    /// Charge one page to the calling task's group. On rejection the
    /// controller's error is returned to the allocation consumer
    /// unchanged.
    fn try_charge(&self, reclaim: bool) -> EpcResult<Arc<dyn EpcCgroup>>;

    /// Whether no group in the hierarchy rooted at `cg` (all groups for
    /// `None`) has a reclaimable page.
    fn lru_empty(&self, cg: Option<&Arc<dyn EpcCgroup>>) -> bool;

    /// Isolate up to `nr_to_scan` pages from the hierarchy rooted at
    /// `cg` into `dst`, decrementing `nr_to_scan` per scanned candidate.
    fn isolate_pages(
        &self,
        cg: Option<&Arc<dyn EpcCgroup>>,
        nr_to_scan: &mut usize,
        dst: &mut Vec<IsoPage>,
    );
}
