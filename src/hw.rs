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

//! Privileged EPC instruction interface.

use numeric_enum_macro::numeric_enum;

/// Virtual address of a mapped EPC page, the operand form the
/// instructions take.
pub type EpcAddr = usize;

numeric_enum! {
    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum EnclsStatus {
        InvalidSigStruct = 1,
        InvalidAttribute = 2,
        Blkstate = 3,
        InvalidMeasurement = 4,
        NotBlockable = 5,
        PgInvld = 6,
        EpcPageConflict = 7,
        PageNotBlocked = 10,
        NotTracked = 11,
        VaSlotOccupied = 12,
        ChildPresent = 13,
        EnclaveAct = 14,
        PrevTrkIncmpl = 17,
        PgIsSecs = 18,
    }
}

/// Nonzero status returned by an EPC instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EnclsError(u32);

impl EnclsError {
    pub fn new(status: EnclsStatus) -> Self {
        Self(status as u32)
    }

    pub fn from_code(code: u32) -> Self {
        Self(code)
    }

    pub fn code(&self) -> u32 {
        self.0
    }

    pub fn status(&self) -> Option<EnclsStatus> {
        EnclsStatus::try_from(self.0).ok()
    }

    pub fn is_not_tracked(&self) -> bool {
        self.status() == Some(EnclsStatus::NotTracked)
    }
}

impl core::fmt::Debug for EnclsError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.status() {
            Some(status) => write!(f, "{:?}({})", status, self.0),
            None => write!(f, "EnclsError({})", self.0),
        }
    }
}

pub type EnclsResult = Result<(), EnclsError>;

/// Page-info operand for the write-back instruction. `contents` and
/// `metadata` point at the backing pair the evicted page is written to.
#[repr(C)]
#[derive(Debug, Default)]
pub struct PageInfo {
    pub addr: u64,
    pub secs: u64,
    pub contents: u64,
    pub metadata: u64,
}

/// One hardware-reported contiguous EPC range.
#[derive(Clone, Copy, Debug)]
pub struct SectionRange {
    pub pa: usize,
    pub size: usize,
}

/// The privileged instruction set the page cache is built on. Every leaf
/// is atomic from software's point of view and reports failure through a
/// status code.
pub trait EnclsHw: Send + Sync {
    /// Hardware-reported EPC layout.
    fn sections(&self) -> Vec<SectionRange>;

    /// Return a page to pristine state. Fails with `ChildPresent` for a
    /// root page that still has children.
    fn eremove(&self, epc: EpcAddr) -> EnclsResult;

    /// Mark a page blocked so no new enclave mapping may load it.
    fn eblock(&self, epc: EpcAddr) -> EnclsResult;

    /// Advance the tracking epoch of the enclave rooted at `secs`.
    fn etrack(&self, secs: EpcAddr) -> EnclsResult;

    /// Write a blocked page out to its backing pair, binding the
    /// replay-protection nonce in `va_slot`. Fails with `NotTracked`
    /// while any CPU may still hold a stale epoch.
    fn ewb(&self, pginfo: &PageInfo, epc: EpcAddr, va_slot: EpcAddr) -> EnclsResult;
}

/// Hardware anomalies are logged and survived, never propagated to the
/// allocation consumer.
pub fn encls_warn(leaf: &str, err: &EnclsError) {
    warn!("{} returned {:?} ({:#x})", leaf, err, err.code());
}
