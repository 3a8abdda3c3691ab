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

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Upper bound on hardware-reported EPC sections.
pub const MAX_SECTIONS: usize = 8;

/// Pages scanned per reclaim invocation.
pub const SCAN_BATCH: usize = 16;

/// Hard cap on pages written back in one reclaim batch.
pub const MAX_BATCH: usize = 32;

/// Version-array slots per VA page (one 8-byte nonce per slot).
pub const VA_SLOT_COUNT: usize = PAGE_SIZE / 8;

/// Free-page count below which the reclaim daemon is woken.
pub const NR_LOW_PAGES: usize = 32;

/// Free-page count the daemon restores before sleeping again.
pub const NR_HIGH_PAGES: usize = 64;
