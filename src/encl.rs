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

//! Enclave-side state the page cache operates on: the enclave control
//! block, per-page descriptors, version-array pages, the attached
//! address-space list and the backing-store contract.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bit_field::BitField;
use bitflags::bitflags;
use spin::{Mutex as SpinMutex, MutexGuard, RwLock, RwLockReadGuard};

use crate::consts::{PAGE_SHIFT, VA_SLOT_COUNT};
use crate::cpumask::CpuMask;
use crate::epc::{EpcManager, EpcPage, EpcPageFlags, PageOwner};
use crate::error::EpcResult;

bitflags! {
    /// Enclave lifecycle bits, set-once under the enclave lock.
    pub struct EnclFlags: usize {
        const CREATED     = 1 << 0;
        const INITIALIZED = 1 << 1;
        const DEAD        = 1 << 2;
        const OOM         = 1 << 3;
    }
}

impl EnclFlags {
    pub const DEAD_OR_OOM: Self = Self {
        bits: Self::DEAD.bits | Self::OOM.bits,
    };
}

/// The page was picked by the reclaimer and its contents may be gone.
const ENCL_PAGE_RECLAIMED: u64 = 1 << 0;
/// Byte offset of the nonce slot inside the page's version array,
/// 8-byte aligned, valid only after a successful write-back.
const ENCL_PAGE_VA_OFFSET_MASK: u64 = 0xff8;

static NEXT_ENCL_ID: AtomicUsize = AtomicUsize::new(1);

/// A page of ordinary memory holding an evicted page's ciphertext and
/// its integrity metadata.
#[derive(Debug)]
pub struct Backing {
    pub contents: usize,
    pub pcmd: usize,
    pub pcmd_offset: usize,
}

/// Shmem-backed store an enclave's evicted pages are written to.
pub trait BackingStore: Send + Sync {
    fn get_backing(&self, page_index: usize) -> EpcResult<Backing>;
    fn put_backing(&self, backing: Backing, dirty: bool);
}

/// A user mapping of enclave memory, as visible through one address
/// space.
#[derive(Clone, Copy, Debug)]
pub struct Vma {
    pub start: usize,
    pub end: usize,
    pub encl_id: usize,
}

impl Vma {
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// One user address space mapping the enclave. Callers hold the owning
/// [`Mm`]'s read lock across any of these operations.
pub trait AddressSpace: Send + Sync {
    /// Lowest mapping whose end is above `addr`, if any.
    fn find_vma(&self, addr: usize) -> Option<Vma>;

    /// Invalidate every PTE in `[addr, addr + len)`.
    fn zap_ptes(&self, addr: usize, len: usize);

    /// Atomically test and clear the access bit of the PTE mapping
    /// `addr`.
    fn test_and_clear_young(&self, addr: usize) -> bool;
}

pub struct Mm {
    space: RwLock<Box<dyn AddressSpace>>,
    /// CPUs that have run this address space. Readable without the
    /// address-space lock.
    cpus: SpinMutex<CpuMask>,
}

impl Mm {
    pub fn new(space: Box<dyn AddressSpace>) -> Arc<Self> {
        Arc::new(Self {
            space: RwLock::new(space),
            cpus: SpinMutex::new(CpuMask::default()),
        })
    }

    /// Take the address-space read lock.
    pub fn space(&self) -> RwLockReadGuard<'_, Box<dyn AddressSpace>> {
        self.space.read()
    }

    pub fn cpumask(&self) -> CpuMask {
        *self.cpus.lock()
    }

    pub fn set_cpumask(&self, mask: CpuMask) {
        *self.cpus.lock() = mask;
    }
}

pub struct EnclMm {
    mm: Weak<Mm>,
}

impl EnclMm {
    /// Upgrade to the address space unless it is already being torn
    /// down.
    pub fn get(&self) -> Option<Arc<Mm>> {
        self.mm.upgrade()
    }
}

/// The list of address spaces attached to an enclave. Mutators append
/// and bump the version with release ordering; walkers snapshot the
/// list, do their work, and re-check the version acquired at the start,
/// retrying the walk if it moved.
pub struct MmList {
    version: AtomicU64,
    list: RwLock<Vec<Arc<EnclMm>>>,
}

impl MmList {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            list: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, mm: &Arc<Mm>) {
        self.list.write().push(Arc::new(EnclMm {
            mm: Arc::downgrade(mm),
        }));
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<Arc<EnclMm>> {
        self.list.read().clone()
    }
}

/// One enclave page as the enclave sees it. `desc` is written under the
/// enclave lock.
pub struct EnclPage {
    addr: usize,
    desc: AtomicU64,
    encl: Weak<Encl>,
    epc_page: SpinMutex<Option<Arc<EpcPage>>>,
    va_page: SpinMutex<Option<Arc<VaPage>>>,
}

impl EnclPage {
    pub(crate) fn new(addr: usize, encl: Weak<Encl>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            desc: AtomicU64::new(0),
            encl,
            epc_page: SpinMutex::new(None),
            va_page: SpinMutex::new(None),
        })
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Upgrade the back reference unless the enclave is already being
    /// freed.
    pub fn get_encl(&self) -> Option<Arc<Encl>> {
        self.encl.upgrade()
    }

    pub fn epc_page(&self) -> Option<Arc<EpcPage>> {
        self.epc_page.lock().clone()
    }

    pub fn set_epc_page(&self, page: Option<Arc<EpcPage>>) {
        *self.epc_page.lock() = page;
    }

    pub fn is_reclaimed(&self) -> bool {
        self.desc.load(Ordering::Acquire) & ENCL_PAGE_RECLAIMED != 0
    }

    pub(crate) fn set_reclaimed(&self) {
        self.desc.fetch_or(ENCL_PAGE_RECLAIMED, Ordering::AcqRel);
    }

    pub(crate) fn clear_reclaimed(&self) {
        self.desc.fetch_and(!ENCL_PAGE_RECLAIMED, Ordering::AcqRel);
    }

    pub fn va_offset(&self) -> usize {
        (self.desc.load(Ordering::Acquire) & ENCL_PAGE_VA_OFFSET_MASK) as usize
    }

    pub fn va_page(&self) -> Option<Arc<VaPage>> {
        self.va_page.lock().clone()
    }

    /// Bind the nonce slot used by a successful write-back.
    pub(crate) fn set_va_slot(&self, offset: usize, va_page: &Arc<VaPage>) {
        debug_assert_eq!(offset as u64 & !ENCL_PAGE_VA_OFFSET_MASK, 0);
        self.desc
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |desc| {
                Some((desc & !ENCL_PAGE_VA_OFFSET_MASK) | offset as u64)
            })
            .ok();
        *self.va_page.lock() = Some(va_page.clone());
    }

    /// Index of the page in the enclave's backing store.
    pub(crate) fn backing_index(&self, encl: &Encl) -> usize {
        (self.addr - encl.base) >> PAGE_SHIFT
    }
}

struct VaSlots {
    bits: [u64; VA_SLOT_COUNT / 64],
    used: usize,
}

/// A version-array page: one nonce slot per evicted page.
pub struct VaPage {
    epc_page: Arc<EpcPage>,
    slots: SpinMutex<VaSlots>,
}

impl VaPage {
    fn new(epc_page: Arc<EpcPage>) -> Arc<Self> {
        Arc::new(Self {
            epc_page,
            slots: SpinMutex::new(VaSlots {
                bits: [0; VA_SLOT_COUNT / 64],
                used: 0,
            }),
        })
    }

    pub fn epc_page(&self) -> &Arc<EpcPage> {
        &self.epc_page
    }

    /// Take the first free slot, returning its byte offset within the
    /// page.
    pub fn alloc_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock();
        for (word_idx, word) in slots.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                word.set_bit(bit, true);
                slots.used += 1;
                return Some((word_idx * 64 + bit) * 8);
            }
        }
        None
    }

    pub fn free_slot(&self, offset: usize) {
        let slot = offset / 8;
        let mut slots = self.slots.lock();
        debug_assert!(slots.bits[slot / 64].get_bit(slot % 64));
        slots.bits[slot / 64].set_bit(slot % 64, false);
        slots.used -= 1;
    }

    pub fn is_full(&self) -> bool {
        self.slots.lock().used == VA_SLOT_COUNT
    }
}

/// State guarded by the enclave lock.
pub struct EnclInner {
    pub(crate) secs: Option<Arc<EnclPage>>,
    pub(crate) secs_child_cnt: usize,
    /// Version-array ring; the head page has a free slot unless the ring
    /// is fully occupied.
    pub(crate) va_pages: VecDeque<Arc<VaPage>>,
    pub(crate) pages: Vec<Arc<EnclPage>>,
}

pub struct Encl {
    id: usize,
    base: usize,
    size: usize,
    flags: AtomicUsize,
    inner: SpinMutex<EnclInner>,
    mm_list: MmList,
    backing: Arc<dyn BackingStore>,
    epc: Arc<EpcManager>,
}

impl Encl {
    pub fn new(
        epc: Arc<EpcManager>,
        backing: Arc<dyn BackingStore>,
        base: usize,
        size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENCL_ID.fetch_add(1, Ordering::Relaxed),
            base,
            size,
            flags: AtomicUsize::new(0),
            inner: SpinMutex::new(EnclInner {
                secs: None,
                secs_child_cnt: 0,
                va_pages: VecDeque::new(),
                pages: Vec::new(),
            }),
            mm_list: MmList::new(),
            backing,
            epc,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> EnclFlags {
        EnclFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: EnclFlags) -> EnclFlags {
        EnclFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Take the enclave lock.
    pub fn lock(&self) -> MutexGuard<'_, EnclInner> {
        self.inner.lock()
    }

    pub fn mm_list(&self) -> &MmList {
        &self.mm_list
    }

    pub fn attach_mm(&self, mm: &Arc<Mm>) {
        self.mm_list.add(mm);
    }

    pub(crate) fn get_backing(&self, page_index: usize) -> EpcResult<Backing> {
        self.backing.get_backing(page_index)
    }

    pub(crate) fn put_backing(&self, backing: Backing, dirty: bool) {
        self.backing.put_backing(backing, dirty);
    }

    /// Allocate and install the enclave's root page.
    pub fn create(self: &Arc<Self>) -> EpcResult {
        let secs = EnclPage::new(self.base + self.size, Arc::downgrade(self));
        let epc_page = self
            .epc
            .alloc_page(PageOwner::Enclave(secs.clone()), true)?;
        secs.set_epc_page(Some(epc_page.clone()));
        self.inner.lock().secs = Some(secs);
        self.epc.record_page(&epc_page, EpcPageFlags::ENCLAVE);
        self.set_flags(EnclFlags::CREATED);
        Ok(())
    }

    pub fn mark_initialized(&self) {
        self.set_flags(EnclFlags::INITIALIZED);
    }

    /// Add one child page at enclave linear address `addr`.
    pub fn add_page(self: &Arc<Self>, addr: usize) -> EpcResult<Arc<EnclPage>> {
        let page = EnclPage::new(addr, Arc::downgrade(self));
        let epc_page = self
            .epc
            .alloc_page(PageOwner::Enclave(page.clone()), true)?;
        page.set_epc_page(Some(epc_page.clone()));
        {
            let mut inner = self.inner.lock();
            inner.pages.push(page.clone());
            inner.secs_child_cnt += 1;
        }
        self.epc
            .record_page(&epc_page, EpcPageFlags::ENCLAVE | EpcPageFlags::RECLAIMABLE);
        Ok(page)
    }

    /// Grow the version-array ring by one page.
    pub fn add_va_page(self: &Arc<Self>) -> EpcResult<Arc<VaPage>> {
        let epc_page = self
            .epc
            .alloc_page(PageOwner::VersionArray(Arc::downgrade(self)), true)?;
        let va_page = VaPage::new(epc_page.clone());
        self.inner.lock().va_pages.push_front(va_page.clone());
        self.epc
            .record_page(&epc_page, EpcPageFlags::VERSION_ARRAY);
        Ok(va_page)
    }

    /// Union of the CPU masks of every attached address space. Callers
    /// issue the track instruction first; CPUs entering through an
    /// address space added during the walk start with a fresh epoch, so
    /// missing them here is fine.
    pub(crate) fn ewb_cpumask(&self) -> CpuMask {
        let mut mask = CpuMask::default();
        for encl_mm in self.mm_list.snapshot() {
            let mm = match encl_mm.get() {
                Some(mm) => mm,
                None => continue,
            };
            mask.or(&mm.cpumask());
        }
        mask
    }

    /// Release every EPC page of the enclave. Pages the reclaimer holds
    /// are skipped; the in-flight write-back frees them once it observes
    /// the dead enclave.
    pub(crate) fn destroy_locked(&self, inner: &mut EnclInner) {
        self.set_flags(EnclFlags::DEAD);

        let mut busy = Vec::new();
        for page in inner.pages.drain(..) {
            if let Some(epc_page) = page.epc_page() {
                if self.epc.drop_page(&epc_page).is_err() {
                    busy.push(page);
                    continue;
                }
                page.set_epc_page(None);
                inner.secs_child_cnt -= 1;
                self.epc.free_page(&epc_page);
            }
        }
        inner.pages = busy;

        while let Some(va_page) = inner.va_pages.pop_front() {
            let epc_page = va_page.epc_page().clone();
            if self.epc.drop_page(&epc_page).is_ok() {
                self.epc.free_page(&epc_page);
            }
        }

        if inner.secs_child_cnt == 0 {
            if let Some(secs) = inner.secs.take() {
                if let Some(epc_page) = secs.epc_page() {
                    if self.epc.drop_page(&epc_page).is_ok() {
                        secs.set_epc_page(None);
                        self.epc.free_page(&epc_page);
                    }
                }
            }
        }
    }
}

impl Drop for Encl {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        self.destroy_locked(&mut inner);
    }
}

impl core::fmt::Debug for Encl {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Encl")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("flags", &self.flags())
            .finish()
    }
}
