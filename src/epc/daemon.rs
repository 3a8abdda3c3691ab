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

//! The background reclaimer: sanitizes the pool at startup, then keeps
//! free pages above the high watermark.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex as StdMutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::consts::SCAN_BATCH;
use crate::epc::EpcManager;
use crate::error::EpcResult;

/// Upper bound on how stale the daemon's view of the watermark state
/// can get when the condition changes without an explicit wake.
const WAIT_TICK: Duration = Duration::from_millis(20);

pub(crate) struct WaitQueue {
    lock: StdMutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            lock: StdMutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Sleep until `cond` holds. Wakers notify under the same mutex, so
    /// a wakeup between the predicate check and the sleep cannot be
    /// lost.
    pub(crate) fn wait_until(&self, cond: impl Fn() -> bool) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !cond() {
            let (next, _timeout) = self
                .cond
                .wait_timeout(guard, WAIT_TICK)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
        }
    }

    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}

impl EpcManager {
    /// Start the long-lived reclaimer task. It owns pool sanitization,
    /// so no allocation succeeds before it has run.
    pub fn start_reclaimer(self: &Arc<Self>) -> EpcResult {
        let mut slot = self.daemon.lock();
        if slot.is_some() {
            return epc_result_err!(EEXIST, "reclaim daemon is already running");
        }

        let mgr = self.clone();
        let handle = thread::Builder::new()
            .name("epc-reclaimerd".into())
            .spawn(move || reclaimer_main(mgr))
            .map_err(|_| epc_err!(EIO, "failed to start the reclaim daemon"))?;
        *slot = Some(handle);
        Ok(())
    }
}

fn reclaimer_main(mgr: Arc<EpcManager>) {
    // Pages can be left initialized by a predecessor kernel.
    mgr.sanitize();

    while !mgr.stop.load(Ordering::Acquire) {
        if mgr.platform.try_freeze() {
            continue;
        }

        mgr.waitq.wait_until(|| {
            mgr.stop.load(Ordering::Acquire) || mgr.should_reclaim(mgr.high_watermark())
        });

        if mgr.should_reclaim(mgr.high_watermark()) {
            mgr.reclaim_pages(SCAN_BATCH, false, None);
        }
    }
}
