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

//! The protected page pool: per-section free lists, the packed page
//! descriptor, and the allocator with its synchronous-reclaim loop.

pub mod daemon;
pub mod lru;
pub mod oom;
pub mod reclaim;
pub mod sanitize;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::cgroup::{CgroupSubsys, EpcCgroup};
use crate::consts::{MAX_SECTIONS, NR_HIGH_PAGES, NR_LOW_PAGES, PAGE_SHIFT, PAGE_SIZE, SCAN_BATCH};
use crate::encl::{Encl, EnclPage};
use crate::error::EpcResult;
use crate::hw::{encls_warn, EnclsHw, EpcAddr};
use crate::platform::Platform;
use crate::virt::VirtEpc;

use daemon::WaitQueue;
use lru::EpcLru;

bitflags! {
    /// Flag bits packed into the low byte of a page descriptor.
    pub struct EpcPageFlags: u64 {
        /// Owned by an enclave page.
        const ENCLAVE             = 1 << 4;
        /// Holds replay-protection nonces; owned by an enclave.
        const VERSION_ARRAY       = 1 << 5;
        /// Eligible for eviction; tracked on a reclaimable LRU list.
        const RECLAIMABLE         = 1 << 6;
        /// Held by an in-flight reclaim batch.
        const RECLAIM_IN_PROGRESS = 1 << 7;
    }
}

impl EpcPageFlags {
    /// Tracking bits a page sheds when it leaves LRU custody.
    pub const RECLAIM_FLAGS: Self = Self {
        bits: Self::ENCLAVE.bits
            | Self::VERSION_ARRAY.bits
            | Self::RECLAIMABLE.bits
            | Self::RECLAIM_IN_PROGRESS.bits,
    };
}

const SECTION_MASK: u64 = (MAX_SECTIONS - 1) as u64;
const ADDR_MASK: u64 = !((PAGE_SIZE - 1) as u64);

/// What a page belongs to once allocated, discriminated by the
/// descriptor's `ENCLAVE`/`VERSION_ARRAY` bits.
#[derive(Clone)]
pub enum PageOwner {
    Enclave(Arc<EnclPage>),
    VersionArray(Weak<Encl>),
    Virt(Arc<dyn VirtEpc>),
}

/// One 4 KiB protected page. The descriptor packs the physical address,
/// the owning section index and the reclaim flag bits; flag transitions
/// that move the page between lists happen under the relevant list lock.
pub struct EpcPage {
    desc: AtomicU64,
    owner: SpinMutex<Option<PageOwner>>,
    cgroup: SpinMutex<Option<Arc<dyn EpcCgroup>>>,
}

impl EpcPage {
    fn new(pa: usize, section_index: usize) -> Arc<Self> {
        Arc::new(Self {
            desc: AtomicU64::new(pa as u64 | section_index as u64),
            owner: SpinMutex::new(None),
            cgroup: SpinMutex::new(None),
        })
    }

    pub fn pa(&self) -> usize {
        (self.desc.load(Ordering::Acquire) & ADDR_MASK) as usize
    }

    pub fn section_index(&self) -> usize {
        (self.desc.load(Ordering::Acquire) & SECTION_MASK) as usize
    }

    pub fn flags(&self) -> EpcPageFlags {
        EpcPageFlags::from_bits_truncate(self.desc.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: EpcPageFlags) {
        self.desc.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: EpcPageFlags) {
        self.desc.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn owner(&self) -> Option<PageOwner> {
        self.owner.lock().clone()
    }

    pub(crate) fn set_owner(&self, owner: Option<PageOwner>) {
        *self.owner.lock() = owner;
    }

    /// The owning enclave page, when the `ENCLAVE` discriminant is set.
    pub fn owner_encl_page(&self) -> Option<Arc<EnclPage>> {
        match &*self.owner.lock() {
            Some(PageOwner::Enclave(page)) => Some(page.clone()),
            _ => None,
        }
    }

    pub(crate) fn cgroup(&self) -> Option<Arc<dyn EpcCgroup>> {
        self.cgroup.lock().clone()
    }

    pub(crate) fn set_cgroup(&self, cg: Option<Arc<dyn EpcCgroup>>) {
        *self.cgroup.lock() = cg;
    }

    pub(crate) fn take_cgroup(&self) -> Option<Arc<dyn EpcCgroup>> {
        self.cgroup.lock().take()
    }
}

impl core::fmt::Debug for EpcPage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("EpcPage")
            .field("pa", &format_args!("{:#x}", self.pa()))
            .field("section", &self.section_index())
            .field("flags", &self.flags())
            .finish()
    }
}

pub(crate) struct SectionInner {
    pub(crate) free: VecDeque<Arc<EpcPage>>,
    pub(crate) unsanitized: VecDeque<Arc<EpcPage>>,
}

/// One hardware-reported contiguous EPC range, mapped write-back at
/// setup. Identity is the index into the manager's section array.
pub struct EpcSection {
    index: usize,
    pa: usize,
    va: usize,
    size: usize,
    /// Tracked outside the lock for cheap watermark checks; only
    /// accurate once sanitization has drained the unsanitized list.
    free_cnt: AtomicUsize,
    pub(crate) inner: SpinMutex<SectionInner>,
}

impl EpcSection {
    fn new(index: usize, pa: usize, va: usize, size: usize) -> Self {
        let nr_pages = size / PAGE_SIZE;
        let unsanitized = (0..nr_pages)
            .map(|i| EpcPage::new(pa + (i << PAGE_SHIFT), index))
            .collect();
        Self {
            index,
            pa,
            va,
            size,
            free_cnt: AtomicUsize::new(nr_pages),
            inner: SpinMutex::new(SectionInner {
                free: VecDeque::new(),
                unsanitized,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pa(&self) -> usize {
        self.pa
    }

    pub fn nr_pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn free_cnt(&self) -> usize {
        self.free_cnt.load(Ordering::Acquire)
    }
}

/// Process-wide page cache state: the section array, the global LRU and
/// the reclaim daemon.
pub struct EpcManager {
    sections: Vec<EpcSection>,
    global_lru: EpcLru,
    pub(crate) hw: Arc<dyn EnclsHw>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) cgroups: Option<Arc<dyn CgroupSubsys>>,
    low_watermark: AtomicUsize,
    high_watermark: AtomicUsize,
    pub(crate) waitq: WaitQueue,
    pub(crate) stop: AtomicBool,
    pub(crate) daemon: SpinMutex<Option<JoinHandle<()>>>,
}

impl core::fmt::Debug for EpcManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EpcManager")
            .field("sections", &self.sections.len())
            .finish()
    }
}

impl EpcManager {
    /// Query the hardware for the EPC layout and build the section
    /// pool. Every page starts on its section's unsanitized list.
    pub fn new(
        hw: Arc<dyn EnclsHw>,
        platform: Arc<dyn Platform>,
        cgroups: Option<Arc<dyn CgroupSubsys>>,
    ) -> EpcResult<Arc<Self>> {
        let ranges = hw.sections();
        if ranges.len() > MAX_SECTIONS {
            warn!(
                "{} EPC sections reported, using the first {}",
                ranges.len(),
                MAX_SECTIONS
            );
        }

        let mut sections: Vec<EpcSection> = Vec::new();
        for (index, range) in ranges.iter().take(MAX_SECTIONS).enumerate() {
            let va = match platform.map_epc(range.pa, range.size) {
                Some(va) => va,
                None => {
                    for section in &sections {
                        platform.unmap_epc(section.pa, section.size);
                    }
                    return epc_result_err!(
                        ENOMEM,
                        format!("no memory to map EPC section {:#x}", range.pa)
                    );
                }
            };
            info!(
                "EPC section {:#x}-{:#x}",
                range.pa,
                range.pa + range.size - 1
            );
            sections.push(EpcSection::new(index, range.pa, va, range.size));
        }

        if sections.is_empty() {
            return epc_result_err!(ENODEV, "there are zero EPC sections");
        }

        Ok(Arc::new(Self {
            sections,
            global_lru: EpcLru::new(),
            hw,
            platform,
            cgroups,
            low_watermark: AtomicUsize::new(NR_LOW_PAGES),
            high_watermark: AtomicUsize::new(NR_HIGH_PAGES),
            waitq: WaitQueue::new(),
            stop: AtomicBool::new(false),
            daemon: SpinMutex::new(None),
        }))
    }

    pub fn sections(&self) -> &[EpcSection] {
        &self.sections
    }

    pub fn global_lru(&self) -> &EpcLru {
        &self.global_lru
    }

    pub fn set_watermarks(&self, low: usize, high: usize) {
        self.low_watermark.store(low, Ordering::Release);
        self.high_watermark.store(high, Ordering::Release);
    }

    pub(crate) fn low_watermark(&self) -> usize {
        self.low_watermark.load(Ordering::Acquire)
    }

    pub(crate) fn high_watermark(&self) -> usize {
        self.high_watermark.load(Ordering::Acquire)
    }

    /// Virtual address the instruction set operates on.
    pub(crate) fn epc_addr(&self, page: &EpcPage) -> EpcAddr {
        let section = &self.sections[page.section_index()];
        section.va + (page.pa() - section.pa)
    }

    pub fn nr_free_pages(&self) -> usize {
        self.sections
            .iter()
            .map(|section| section.free_cnt())
            .sum()
    }

    pub(crate) fn can_reclaim(&self) -> bool {
        match &self.cgroups {
            Some(subsys) => !subsys.lru_empty(None),
            None => !self.global_lru.reclaimable_is_empty(),
        }
    }

    pub(crate) fn should_reclaim(&self, watermark: usize) -> bool {
        self.nr_free_pages() < watermark && self.can_reclaim()
    }

    /// Pop a free page, trying sections in index order.
    fn try_alloc_page(&self) -> Option<Arc<EpcPage>> {
        for section in &self.sections {
            let page = {
                let mut inner = section.inner.lock();
                let page = inner.free.pop_front();
                if page.is_some() {
                    section.free_cnt.fetch_sub(1, Ordering::AcqRel);
                }
                page
            };
            if let Some(page) = page {
                trace!("allocate EPC page: {:#x}", page.pa());
                return Some(page);
            }
        }
        None
    }

    /// Allocate one page for `owner`. With `reclaim` set the caller may
    /// sleep while pages are evicted on its behalf; without it an empty
    /// pool fails fast with `EBUSY`. Wakes the reclaim daemon when free
    /// pages fall below the low watermark.
    pub fn alloc_page(&self, owner: PageOwner, reclaim: bool) -> EpcResult<Arc<EpcPage>> {
        let cg = match &self.cgroups {
            Some(subsys) => Some(subsys.try_charge(reclaim)?),
            None => None,
        };

        let entry = loop {
            if let Some(page) = self.try_alloc_page() {
                break Ok(page);
            }

            if !self.can_reclaim() {
                break epc_result_err!(ENOMEM, "no free or reclaimable EPC pages");
            }

            if !reclaim {
                break epc_result_err!(EBUSY);
            }

            if self.platform.signal_pending() {
                break epc_result_err!(ERESTARTSYS);
            }

            self.reclaim_pages(SCAN_BATCH, false, None);
        };

        let entry = match entry {
            Ok(page) => {
                page.set_owner(Some(owner));
                if cg.is_some() {
                    page.set_cgroup(cg);
                }
                Ok(page)
            }
            Err(err) => {
                if let Some(cg) = cg {
                    cg.uncharge(false);
                }
                Err(err)
            }
        };

        if self.should_reclaim(self.low_watermark()) {
            self.waitq.wake();
        }

        entry
    }

    /// Return a page to its section. The remove instruction runs first;
    /// a failure there means the page state is unknown and the page is
    /// leaked rather than handed out again.
    pub fn free_page(&self, page: &Arc<EpcPage>) {
        let flags = page.flags() & EpcPageFlags::RECLAIM_FLAGS;
        if !flags.is_empty() {
            warn!("reclaim flags set during free: {:?}", flags);
        }

        if let Err(err) = self.hw.eremove(self.epc_addr(page)) {
            encls_warn("EREMOVE", &err);
            return;
        }

        if let Some(cg) = page.take_cgroup() {
            cg.uncharge(false);
        }
        self.release_to_section(page);
    }

    /// Put a clean page back on its section's free list.
    pub(crate) fn release_to_section(&self, page: &Arc<EpcPage>) {
        page.set_owner(None);
        let section = &self.sections[page.section_index()];
        let mut inner = section.inner.lock();
        inner.free.push_back(page.clone());
        section.free_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Track a freshly allocated page on the LRU appropriate for its
    /// charge.
    pub fn record_page(&self, page: &Arc<EpcPage>, flags: EpcPageFlags) {
        self.with_lru(page, |lru| lru.record(page, flags));
    }

    /// Untrack a page on its way to being freed. Fails with `EBUSY`
    /// while the reclaimer owns the page.
    pub fn drop_page(&self, page: &Arc<EpcPage>) -> EpcResult {
        self.with_lru(page, |lru| lru.drop_page(page))
    }

    pub(crate) fn with_lru<R>(&self, page: &EpcPage, f: impl FnOnce(&EpcLru) -> R) -> R {
        match page.cgroup() {
            Some(cg) => f(cg.lru()),
            None => f(&self.global_lru),
        }
    }

    /// Stop and join the reclaim daemon. Idempotent.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.waitq.wake();
        let handle = self.daemon.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for EpcManager {
    fn drop(&mut self) {
        for section in &self.sections {
            self.platform.unmap_epc(section.pa, section.size);
        }
    }
}
