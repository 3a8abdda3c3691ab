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

//! Eviction of enclave pages to backing storage.
//!
//! The hardware dictates a three-phase protocol per batch: block the
//! page so no new mapping can load it, advance the enclave's tracking
//! epoch until no CPU can hold a stale view, then write the page out
//! bound to a version-array nonce slot.

use std::sync::Arc;
use std::thread;

use crate::cgroup::EpcCgroup;
use crate::consts::{MAX_BATCH, PAGE_SIZE, PAGE_SHIFT};
use crate::encl::{Backing, Encl, EnclFlags, EnclInner, EnclPage};
use crate::epc::lru::IsoPage;
use crate::epc::{EpcManager, EpcPage, EpcPageFlags};
use crate::error::EpcResult;
use crate::hw::{encls_warn, PageInfo};

struct Victim {
    iso: IsoPage,
    encl_page: Arc<EnclPage>,
    backing: Backing,
}

impl EpcManager {
    /// Scan up to `nr_to_scan` pages off the head of the targeted LRU
    /// and evict the ones that are old and have backing. Skipped pages
    /// move to the tail so scans cycle through the pool in rough LRU
    /// order.
    ///
    /// Returns the number of pages actually returned to their sections,
    /// not the number scanned.
    pub fn reclaim_pages(
        &self,
        nr_to_scan: usize,
        ignore_age: bool,
        cg: Option<&Arc<dyn EpcCgroup>>,
    ) -> usize {
        let mut nr = nr_to_scan;
        let mut iso: Vec<IsoPage> = Vec::new();

        // Take from the global LRU first even when groups are enabled;
        // pages there belong to no group and should leave asap.
        if cg.is_none() {
            self.global_lru().isolate(&mut nr, &mut iso);
        }
        if let Some(subsys) = &self.cgroups {
            subsys.isolate_pages(cg, &mut nr, &mut iso);
        }

        if iso.is_empty() {
            thread::yield_now();
            return 0;
        }

        let mut victims: Vec<Victim> = Vec::new();
        for ip in iso {
            let encl_page = match ip.page.owner_encl_page() {
                Some(encl_page) => encl_page,
                None => {
                    self.with_lru(&ip.page, |lru| lru.return_to_tail(&ip.page));
                    continue;
                }
            };

            if victims.len() < MAX_BATCH
                && (ignore_age || self.reclaimer_age(&ip.encl, &encl_page))
            {
                if let Ok(backing) = ip.encl.get_backing(encl_page.backing_index(&ip.encl)) {
                    {
                        let _inner = ip.encl.lock();
                        encl_page.set_reclaimed();
                    }
                    victims.push(Victim {
                        iso: ip,
                        encl_page,
                        backing,
                    });
                    continue;
                }
            }

            // Young, over the batch cap, or no backing slot: back to
            // the tail, and the isolation reference goes away.
            self.with_lru(&ip.page, |lru| lru.return_to_tail(&ip.page));
        }

        for victim in &victims {
            self.reclaimer_block(&victim.iso.encl, &victim.encl_page, &victim.iso.page);
        }

        let mut reclaimed = 0;
        for victim in victims {
            let Victim {
                iso,
                encl_page,
                backing,
            } = victim;

            match self.reclaimer_write(&iso.encl, &encl_page, &iso.page, &backing) {
                Ok(()) => {
                    iso.encl.put_backing(backing, true);
                    iso.page.clear_flags(EpcPageFlags::RECLAIM_FLAGS);
                    if let Some(cg) = iso.page.take_cgroup() {
                        cg.uncharge(true);
                    }
                    self.release_to_section(&iso.page);
                    reclaimed += 1;
                }
                Err(_) => {
                    // The page is intact; put it back where a later
                    // scan can retry it.
                    iso.encl.put_backing(backing, false);
                    self.with_lru(&iso.page, |lru| lru.return_to_tail(&iso.page));
                }
            }
        }

        thread::yield_now();
        reclaimed
    }

    /// Whether the page has gone unreferenced since the last scan. The
    /// access bit is test-and-cleared in every attached address space;
    /// a dead or OOM-killed enclave short-circuits to "old".
    fn reclaimer_age(&self, encl: &Arc<Encl>, encl_page: &EnclPage) -> bool {
        let mut old = true;
        for encl_mm in encl.mm_list().snapshot() {
            let mm = match encl_mm.get() {
                Some(mm) => mm,
                None => continue,
            };

            old = !mm.space().test_and_clear_young(encl_page.addr());

            if !old || encl.flags().intersects(EnclFlags::DEAD_OR_OOM) {
                break;
            }
        }

        if !old && !encl.flags().intersects(EnclFlags::DEAD_OR_OOM) {
            return false;
        }
        true
    }

    /// Tear the page out of every user address space, then mark it
    /// blocked so the hardware refuses new mappings. The walk restarts
    /// whenever an address space is attached mid-walk.
    fn reclaimer_block(&self, encl: &Arc<Encl>, encl_page: &EnclPage, epc_page: &EpcPage) {
        let addr = encl_page.addr();

        loop {
            let version = encl.mm_list().version();

            for encl_mm in encl.mm_list().snapshot() {
                let mm = match encl_mm.get() {
                    Some(mm) => mm,
                    None => continue,
                };

                let space = mm.space();
                if let Some(vma) = space.find_vma(addr) {
                    if vma.contains(addr) && vma.encl_id == encl.id() {
                        space.zap_ptes(addr, PAGE_SIZE);
                    }
                }
            }

            if encl.mm_list().version() == version {
                break;
            }
        }

        let _inner = encl.lock();
        // Blocking is skipped only once the enclave is fully dead.
        if !encl.flags().contains(EnclFlags::DEAD) {
            if let Err(err) = self.hw.eblock(self.epc_addr(epc_page)) {
                encls_warn("EBLOCK", &err);
            }
        }
    }

    /// Run the write-back instruction with the epoch-flush retry
    /// protocol. Called with the enclave lock held.
    fn encl_ewb(
        &self,
        encl: &Arc<Encl>,
        inner: &mut EnclInner,
        encl_page: &Arc<EnclPage>,
        epc_page: &Arc<EpcPage>,
        backing: &Backing,
    ) -> EpcResult {
        let va_page = match inner.va_pages.front() {
            Some(va_page) => va_page.clone(),
            None => return epc_result_err!(ENOMEM, "enclave has no version-array page"),
        };
        let va_offset = match va_page.alloc_slot() {
            Some(offset) => offset,
            None => return epc_result_err!(ENOMEM, "version arrays are full"),
        };
        if va_page.is_full() {
            inner.va_pages.rotate_left(1);
        }

        let pginfo = PageInfo {
            addr: 0,
            secs: 0,
            contents: backing.contents as u64,
            metadata: (backing.pcmd + backing.pcmd_offset) as u64,
        };
        let epc_addr = self.epc_addr(epc_page);
        let va_slot = self.epc_addr(va_page.epc_page()) + va_offset;

        let mut ret = self.hw.ewb(&pginfo, epc_addr, va_slot);
        if matches!(&ret, Err(err) if err.is_not_tracked()) {
            // A CPU may still be running inside the enclave with a
            // stale epoch. Advance the epoch and try again.
            if let Some(secs_epc) = inner.secs.as_ref().and_then(|secs| secs.epc_page()) {
                if let Err(err) = self.hw.etrack(self.epc_addr(&secs_epc)) {
                    encls_warn("ETRACK", &err);
                }
            }

            ret = self.hw.ewb(&pginfo, epc_addr, va_slot);
            if matches!(&ret, Err(err) if err.is_not_tracked()) {
                // Slow path: kick the straggling CPUs out through the
                // kernel boundary. The mask is computed after the track
                // above, so a CPU entering between mask and kick
                // already carries a fresh epoch.
                self.platform.kick_cpus(&encl.ewb_cpumask());
                ret = self.hw.ewb(&pginfo, epc_addr, va_slot);
            }
        }

        match ret {
            Ok(()) => {
                encl_page.set_va_slot(va_offset, &va_page);
                Ok(())
            }
            Err(err) => {
                encls_warn("EWB", &err);
                va_page.free_slot(va_offset);
                epc_result_err!(EIO, "write-back failed")
            }
        }
    }

    /// Phase three for one page: write it back (or remove it outright
    /// for a dead enclave), then retire the root page once the last
    /// child is gone.
    fn reclaimer_write(
        &self,
        encl: &Arc<Encl>,
        encl_page: &Arc<EnclPage>,
        epc_page: &Arc<EpcPage>,
        backing: &Backing,
    ) -> EpcResult {
        let mut inner = encl.lock();

        let result = if encl.flags().contains(EnclFlags::DEAD) {
            // Nobody will ever fault the contents back in.
            if let Err(err) = self.hw.eremove(self.epc_addr(epc_page)) {
                encls_warn("EREMOVE", &err);
            }
            Ok(())
        } else {
            self.encl_ewb(encl, &mut inner, encl_page, epc_page, backing)
        };

        if let Err(err) = result {
            encl_page.clear_reclaimed();
            return Err(err);
        }

        encl_page.set_epc_page(None);
        inner.secs_child_cnt -= 1;

        if inner.secs_child_cnt == 0 {
            if encl.flags().contains(EnclFlags::DEAD) {
                if let Some(secs) = inner.secs.take() {
                    if let Some(secs_epc) = secs.epc_page() {
                        let _ = self.drop_page(&secs_epc);
                        secs.set_epc_page(None);
                        self.free_page(&secs_epc);
                    }
                }
            } else if encl.flags().contains(EnclFlags::INITIALIZED) {
                self.evict_secs(encl, &mut inner);
            }
        }

        Ok(())
    }

    /// A childless initialized enclave keeps no resident root page;
    /// write it out the same way as any other page.
    fn evict_secs(&self, encl: &Arc<Encl>, inner: &mut EnclInner) {
        let secs = match inner.secs.clone() {
            Some(secs) => secs,
            None => return,
        };
        let secs_epc = match secs.epc_page() {
            Some(page) => page,
            None => return,
        };
        let secs_backing = match encl.get_backing(encl.size() >> PAGE_SHIFT) {
            Ok(backing) => backing,
            Err(_) => return,
        };

        match self.encl_ewb(encl, inner, &secs, &secs_epc, &secs_backing) {
            Ok(()) => {
                let _ = self.drop_page(&secs_epc);
                secs.set_epc_page(None);
                self.free_page(&secs_epc);
                inner.secs = None;
                encl.put_backing(secs_backing, true);
            }
            Err(_) => {
                encl.put_backing(secs_backing, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SCAN_BATCH;
    use crate::epc::PageOwner;
    use crate::error::EpcErrorNum;
    use crate::hw::{EnclsError, EnclsStatus};
    use crate::test_utils::{TestRig, TestSpace};
    use crate::cpumask::CpuMask;
    use crate::encl::Mm;

    #[test]
    fn direct_reclaim_on_allocation() {
        let rig = TestRig::new(&[3]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        let va_page = encl.add_va_page().unwrap();
        // Occupy the first nonce slot so the victim's binding is
        // distinguishable from an unset descriptor.
        assert_eq!(va_page.alloc_slot().unwrap(), 0);

        let page = encl.add_page(0x10000).unwrap();
        assert_eq!(mgr.nr_free_pages(), 0);

        let got = mgr
            .alloc_page(PageOwner::Virt(rig.virt.clone()), true)
            .unwrap();

        assert!(page.is_reclaimed());
        assert_eq!(page.va_offset(), 8);
        assert!(page.epc_page().is_none());
        assert!(page.va_page().is_some());
        assert_eq!(rig.hw.eblock_calls(), 1);
        assert_eq!(rig.hw.ewb_calls(), 1);
        assert_eq!(got.section_index(), 0);
        assert_eq!(mgr.nr_free_pages(), 0);
        rig.check_free_counts();

        // The backing pair was released dirty.
        assert_eq!(rig.backing.puts(), vec![true]);
    }

    #[test]
    fn not_tracked_runs_track_then_ipi() {
        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        encl.add_va_page().unwrap();
        let _page = encl.add_page(0x11000).unwrap();

        let mm = Mm::new(Box::new(TestSpace::new(encl.id())));
        let mut cpus = CpuMask::default();
        cpus.set_cpu(1);
        cpus.set_cpu(2);
        mm.set_cpumask(cpus);
        encl.attach_mm(&mm);

        rig.hw
            .script_ewb(Err(EnclsError::new(EnclsStatus::NotTracked)));
        rig.hw
            .script_ewb(Err(EnclsError::new(EnclsStatus::NotTracked)));

        let reclaimed = mgr.reclaim_pages(SCAN_BATCH, false, None);

        assert_eq!(reclaimed, 1);
        assert_eq!(rig.hw.etrack_calls(), 1);
        assert_eq!(rig.hw.ewb_calls(), 3);
        let kicked = rig.platform.kicked();
        assert_eq!(kicked.len(), 1);
        assert_eq!(kicked[0], cpus);
    }

    #[test]
    fn young_page_is_skipped_to_tail() {
        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        encl.add_va_page().unwrap();
        let page = encl.add_page(0x12000).unwrap();
        let epc_page = page.epc_page().unwrap();

        let space = TestSpace::new(encl.id());
        space.set_young(0x12000);
        let young = space.young_handle();
        let zapped = space.zap_handle();
        let mm = Mm::new(Box::new(space));
        encl.attach_mm(&mm);

        let reclaimed = mgr.reclaim_pages(SCAN_BATCH, false, None);

        assert_eq!(reclaimed, 0);
        assert!(!young.lock().contains(&0x12000));
        assert!(zapped.lock().is_empty());
        assert!(rig.backing.gets().is_empty());
        assert!(page.epc_page().is_some());
        assert!(!page.is_reclaimed());
        let flags = epc_page.flags();
        assert!(flags.contains(EpcPageFlags::RECLAIMABLE));
        assert!(!flags.contains(EpcPageFlags::RECLAIM_IN_PROGRESS));
        assert!(mgr.global_lru().contains_reclaimable(&epc_page));
    }

    #[test]
    fn backing_failure_skips_the_page() {
        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        encl.add_va_page().unwrap();
        let page = encl.add_page(0x15000).unwrap();
        let epc_page = page.epc_page().unwrap();

        rig.backing.set_fail(true);
        let reclaimed = mgr.reclaim_pages(SCAN_BATCH, false, None);

        assert_eq!(reclaimed, 0);
        assert!(!page.is_reclaimed());
        assert!(mgr.global_lru().contains_reclaimable(&epc_page));
        assert_eq!(rig.hw.eblock_calls(), 0);
        assert_eq!(rig.hw.ewb_calls(), 0);

        // The page survives for a later scan once backing comes back.
        rig.backing.set_fail(false);
        assert_eq!(mgr.reclaim_pages(SCAN_BATCH, false, None), 1);
        rig.check_free_counts();
    }

    #[test]
    fn failed_write_back_restores_the_page() {
        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        let va_page = encl.add_va_page().unwrap();
        let page = encl.add_page(0x13000).unwrap();
        let epc_page = page.epc_page().unwrap();

        rig.hw
            .script_ewb(Err(EnclsError::new(EnclsStatus::PgInvld)));

        let reclaimed = mgr.reclaim_pages(SCAN_BATCH, false, None);

        assert_eq!(reclaimed, 0);
        assert!(!page.is_reclaimed());
        assert!(page.epc_page().is_some());
        assert!(mgr.global_lru().contains_reclaimable(&epc_page));
        assert!(!epc_page
            .flags()
            .contains(EpcPageFlags::RECLAIM_IN_PROGRESS));
        // The nonce slot was released and the backing pair dropped
        // clean.
        assert_eq!(va_page.alloc_slot().unwrap(), 0);
        assert_eq!(rig.backing.puts(), vec![false]);
        assert_eq!(mgr.nr_free_pages(), 1);
    }

    #[test]
    fn last_child_takes_the_root_page_along() {
        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = &rig.mgr;

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        encl.mark_initialized();
        encl.add_va_page().unwrap();
        let page = encl.add_page(0x10000).unwrap();

        let reclaimed = mgr.reclaim_pages(SCAN_BATCH, false, None);

        assert_eq!(reclaimed, 1);
        assert!(page.epc_page().is_none());
        {
            let inner = encl.lock();
            assert!(inner.secs.is_none());
            assert_eq!(inner.secs_child_cnt, 0);
        }
        // Child and root both written back: two dirty releases, and
        // only the version-array page stays resident.
        assert_eq!(rig.backing.puts(), vec![true, true]);
        assert_eq!(rig.backing.gets(), vec![0, 16]);
        assert_eq!(mgr.nr_free_pages(), 3);
        rig.check_free_counts();
    }

    #[test]
    fn concurrent_drop_returns_busy_until_reclaim_finishes() {
        use crate::error::EpcResult;
        use std::sync::Barrier;

        let rig = TestRig::new(&[4]);
        rig.sanitize();
        let mgr = rig.mgr.clone();

        let encl = rig.encl(0x10000, 0x10000);
        encl.create().unwrap();
        encl.add_va_page().unwrap();
        let page = encl.add_page(0x14000).unwrap();
        let epc_page = page.epc_page().unwrap();

        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        rig.hw.gate_first_ewb(entered.clone(), release.clone());

        let reclaimer = {
            let mgr = mgr.clone();
            std::thread::spawn(move || mgr.reclaim_pages(SCAN_BATCH, false, None))
        };

        // The reclaimer is parked inside the write-back instruction, so
        // the page is owned by the in-flight batch right now.
        entered.wait();
        let flags = epc_page.flags();
        assert!(flags.contains(EpcPageFlags::RECLAIM_IN_PROGRESS));
        let busy: EpcResult = mgr.drop_page(&epc_page);
        assert_eq!(busy.unwrap_err().num(), EpcErrorNum::EBUSY);

        release.wait();
        assert_eq!(reclaimer.join().unwrap(), 1);

        assert!(epc_page.flags().is_empty());
        assert_eq!(mgr.nr_free_pages(), 2);
        rig.check_free_counts();
    }
}
