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

//! Shared test rig: scripted hardware, recording collaborators, and a
//! pool assembled from heap-fake section ranges.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use spin::Mutex as SpinMutex;

use crate::consts::PAGE_SIZE;
use crate::cpumask::CpuMask;
use crate::encl::{AddressSpace, Backing, BackingStore, Encl, Vma};
use crate::epc::EpcManager;
use crate::error::EpcResult;
use crate::hw::{EnclsHw, EnclsResult, EpcAddr, PageInfo, SectionRange};
use crate::platform::Platform;
use crate::virt::VirtEpc;

const SECTION_BASE: usize = 0x1000_0000;
const SECTION_STRIDE: usize = 0x0100_0000;

/// Instruction mock: calls are counted, results can be scripted per
/// leaf (first-in first-out, defaulting to success), and the first
/// write-back can be gated on a pair of barriers for cross-thread
/// interleaving tests.
pub(crate) struct MockHw {
    ranges: Vec<SectionRange>,
    eremove_script: SpinMutex<VecDeque<EnclsResult>>,
    ewb_script: SpinMutex<VecDeque<EnclsResult>>,
    eremove_count: AtomicUsize,
    eblock_count: AtomicUsize,
    etrack_count: AtomicUsize,
    ewb_count: AtomicUsize,
    ewb_gate: SpinMutex<Option<(Arc<Barrier>, Arc<Barrier>)>>,
}

impl MockHw {
    pub(crate) fn new(section_pages: &[usize]) -> Arc<Self> {
        let ranges = section_pages
            .iter()
            .enumerate()
            .map(|(i, nr_pages)| SectionRange {
                pa: SECTION_BASE + i * SECTION_STRIDE,
                size: nr_pages * PAGE_SIZE,
            })
            .collect();
        Arc::new(Self {
            ranges,
            eremove_script: SpinMutex::new(VecDeque::new()),
            ewb_script: SpinMutex::new(VecDeque::new()),
            eremove_count: AtomicUsize::new(0),
            eblock_count: AtomicUsize::new(0),
            etrack_count: AtomicUsize::new(0),
            ewb_count: AtomicUsize::new(0),
            ewb_gate: SpinMutex::new(None),
        })
    }

    pub(crate) fn script_eremove(&self, result: EnclsResult) {
        self.eremove_script.lock().push_back(result);
    }

    pub(crate) fn script_ewb(&self, result: EnclsResult) {
        self.ewb_script.lock().push_back(result);
    }

    pub(crate) fn gate_first_ewb(&self, entered: Arc<Barrier>, release: Arc<Barrier>) {
        *self.ewb_gate.lock() = Some((entered, release));
    }

    pub(crate) fn eremove_calls(&self) -> usize {
        self.eremove_count.load(Ordering::Acquire)
    }

    pub(crate) fn eblock_calls(&self) -> usize {
        self.eblock_count.load(Ordering::Acquire)
    }

    pub(crate) fn etrack_calls(&self) -> usize {
        self.etrack_count.load(Ordering::Acquire)
    }

    pub(crate) fn ewb_calls(&self) -> usize {
        self.ewb_count.load(Ordering::Acquire)
    }
}

impl EnclsHw for MockHw {
    fn sections(&self) -> Vec<SectionRange> {
        self.ranges.clone()
    }

    fn eremove(&self, _epc: EpcAddr) -> EnclsResult {
        self.eremove_count.fetch_add(1, Ordering::AcqRel);
        self.eremove_script.lock().pop_front().unwrap_or(Ok(()))
    }

    fn eblock(&self, _epc: EpcAddr) -> EnclsResult {
        self.eblock_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn etrack(&self, _secs: EpcAddr) -> EnclsResult {
        self.etrack_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn ewb(&self, _pginfo: &PageInfo, _epc: EpcAddr, _va_slot: EpcAddr) -> EnclsResult {
        let gate = self.ewb_gate.lock().take();
        if let Some((entered, release)) = gate {
            entered.wait();
            release.wait();
        }
        self.ewb_count.fetch_add(1, Ordering::AcqRel);
        self.ewb_script.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// Identity-maps sections, records IPI broadcasts, and fakes the
/// pending-signal state of the calling task.
pub(crate) struct TestPlatform {
    signal: AtomicBool,
    kicked: SpinMutex<Vec<CpuMask>>,
}

impl TestPlatform {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            signal: AtomicBool::new(false),
            kicked: SpinMutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_signal_pending(&self, pending: bool) {
        self.signal.store(pending, Ordering::Release);
    }

    pub(crate) fn kicked(&self) -> Vec<CpuMask> {
        self.kicked.lock().clone()
    }
}

impl Platform for TestPlatform {
    fn map_epc(&self, pa: usize, _size: usize) -> Option<usize> {
        Some(pa)
    }

    fn unmap_epc(&self, _pa: usize, _size: usize) {}

    fn kick_cpus(&self, mask: &CpuMask) {
        self.kicked.lock().push(*mask);
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }
}

/// Backing store that hands out stable fake page pairs and records the
/// get/put traffic.
pub(crate) struct TestBacking {
    fail: AtomicBool,
    gets: SpinMutex<Vec<usize>>,
    puts: SpinMutex<Vec<bool>>,
}

impl TestBacking {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            gets: SpinMutex::new(Vec::new()),
            puts: SpinMutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub(crate) fn gets(&self) -> Vec<usize> {
        self.gets.lock().clone()
    }

    pub(crate) fn puts(&self) -> Vec<bool> {
        self.puts.lock().clone()
    }
}

impl BackingStore for TestBacking {
    fn get_backing(&self, page_index: usize) -> EpcResult<Backing> {
        if self.fail.load(Ordering::Acquire) {
            return epc_result_err!(ENOMEM, "backing store exhausted");
        }
        self.gets.lock().push(page_index);
        Ok(Backing {
            contents: 0xb000_0000 + page_index * PAGE_SIZE,
            pcmd: 0xc000_0000 + (page_index / 32) * PAGE_SIZE,
            pcmd_offset: (page_index % 32) * 128,
        })
    }

    fn put_backing(&self, _backing: Backing, dirty: bool) {
        self.puts.lock().push(dirty);
    }
}

/// Address space with explicit mappings, a settable young set, and a
/// zap journal. Internals are shared so handles stay valid after the
/// space is boxed behind an [`Mm`](crate::encl::Mm).
pub(crate) struct TestSpace {
    encl_id: usize,
    vmas: Arc<SpinMutex<Vec<Vma>>>,
    young: Arc<SpinMutex<HashSet<usize>>>,
    zapped: Arc<SpinMutex<Vec<(usize, usize)>>>,
}

impl TestSpace {
    pub(crate) fn new(encl_id: usize) -> Self {
        Self {
            encl_id,
            vmas: Arc::new(SpinMutex::new(Vec::new())),
            young: Arc::new(SpinMutex::new(HashSet::new())),
            zapped: Arc::new(SpinMutex::new(Vec::new())),
        }
    }

    pub(crate) fn add_vma(&self, start: usize, end: usize) {
        self.add_vma_for(start, end, self.encl_id);
    }

    pub(crate) fn add_vma_for(&self, start: usize, end: usize, encl_id: usize) {
        let mut vmas = self.vmas.lock();
        vmas.push(Vma {
            start,
            end,
            encl_id,
        });
        vmas.sort_by_key(|vma| vma.start);
    }

    pub(crate) fn set_young(&self, addr: usize) {
        self.young.lock().insert(addr);
    }

    pub(crate) fn young_handle(&self) -> Arc<SpinMutex<HashSet<usize>>> {
        self.young.clone()
    }

    pub(crate) fn zap_handle(&self) -> Arc<SpinMutex<Vec<(usize, usize)>>> {
        self.zapped.clone()
    }
}

impl AddressSpace for TestSpace {
    fn find_vma(&self, addr: usize) -> Option<Vma> {
        self.vmas.lock().iter().find(|vma| vma.end > addr).copied()
    }

    fn zap_ptes(&self, addr: usize, len: usize) {
        self.zapped.lock().push((addr, len));
    }

    fn test_and_clear_young(&self, addr: usize) -> bool {
        self.young.lock().remove(&addr)
    }
}

/// Virtualization backend stub.
pub(crate) struct TestVirt {
    alive: AtomicBool,
    oomed: AtomicUsize,
}

impl TestVirt {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            oomed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub(crate) fn oom_count(&self) -> usize {
        self.oomed.load(Ordering::Acquire)
    }
}

impl VirtEpc for TestVirt {
    fn oom_get_ref(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn oom(&self) {
        self.oomed.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) struct TestRig {
    pub(crate) hw: Arc<MockHw>,
    pub(crate) platform: Arc<TestPlatform>,
    pub(crate) backing: Arc<TestBacking>,
    pub(crate) virt: Arc<TestVirt>,
    pub(crate) mgr: Arc<EpcManager>,
}

impl TestRig {
    pub(crate) fn new(section_pages: &[usize]) -> Self {
        let hw = MockHw::new(section_pages);
        let platform = TestPlatform::new();
        let mgr = EpcManager::new(hw.clone(), platform.clone(), None).unwrap();
        Self {
            hw,
            platform,
            backing: TestBacking::new(),
            virt: TestVirt::new(),
            mgr,
        }
    }

    /// Run both sanitization passes inline, as the daemon would at
    /// startup.
    pub(crate) fn sanitize(&self) {
        self.mgr.sanitize();
    }

    pub(crate) fn encl(&self, base: usize, size: usize) -> Arc<Encl> {
        Encl::new(self.mgr.clone(), self.backing.clone(), base, size)
    }

    pub(crate) fn unsanitized_total(&self) -> usize {
        self.mgr
            .sections()
            .iter()
            .map(|section| section.inner.lock().unsanitized.len())
            .sum()
    }

    /// Per-section free counters must agree with the free lists
    /// whenever no operation is mid-flight.
    pub(crate) fn check_free_counts(&self) {
        for section in self.mgr.sections() {
            assert_eq!(section.free_cnt(), section.inner.lock().free.len());
        }
    }
}

pub(crate) fn poll_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
