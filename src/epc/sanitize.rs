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

//! Boot-time cleansing of pages left initialized by a predecessor
//! kernel.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::thread;

use crate::epc::{EpcManager, EpcSection};

impl EpcManager {
    /// Drain one section's unsanitized list through the remove
    /// instruction. Pages the instruction rejects go back on the list
    /// tail for a later pass; root pages fail while they still hold
    /// children.
    pub(crate) fn sanitize_section(&self, section: &EpcSection) {
        let mut deferred = VecDeque::new();

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            {
                let mut inner = section.inner.lock();
                let page = match inner.unsanitized.pop_front() {
                    Some(page) => page,
                    None => break,
                };
                match self.hw.eremove(self.epc_addr(&page)) {
                    Ok(()) => inner.free.push_front(page),
                    Err(_) => deferred.push_back(page),
                }
            }

            thread::yield_now();
        }

        if !deferred.is_empty() {
            section.inner.lock().unsanitized.append(&mut deferred);
        }
    }

    /// Two full passes over every section: the first removes all child
    /// pages, the second catches the root pages they were keeping
    /// alive.
    pub(crate) fn sanitize(&self) {
        for section in self.sections() {
            self.sanitize_section(section);
        }

        for section in self.sections() {
            self.sanitize_section(section);

            if self.stop.load(Ordering::Acquire) {
                return;
            }
            if !section.inner.lock().unsanitized.is_empty() {
                warn!("EPC section {} has unsanitized pages", section.index());
            }
        }
    }
}
