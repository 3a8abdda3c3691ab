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

//! The provisioning gate: possession of an open handle on the device is
//! the capability that unlocks the provisioning-key attribute.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::EpcResult;

bitflags! {
    /// Enclave attribute bits.
    pub struct SgxAttributes: u64 {
        const INIT           = 1 << 0;
        const DEBUG          = 1 << 1;
        const MODE64BIT      = 1 << 2;
        const PROVISIONKEY   = 1 << 4;
        const EINITTOKEN_KEY = 1 << 5;
        const CET            = 1 << 6;
        const KSS            = 1 << 7;
    }
}

/// The device node. Carries no state; its identity is the capability.
pub struct ProvisionDev {
    _private: (),
}

/// An open handle on a provisioning device.
pub struct ProvisionHandle {
    dev: Arc<ProvisionDev>,
}

impl ProvisionDev {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { _private: () })
    }

    pub fn open(self: &Arc<Self>) -> ProvisionHandle {
        ProvisionHandle { dev: self.clone() }
    }

    /// Grant the provisioning-key attribute to a bearer of `handle`.
    /// A handle opened on any other device is rejected.
    pub fn authorize(
        self: &Arc<Self>,
        handle: &ProvisionHandle,
        attrs: &mut SgxAttributes,
    ) -> EpcResult {
        if !Arc::ptr_eq(self, &handle.dev) {
            return epc_result_err!(EINVAL, "handle does not refer to the provisioning device");
        }
        *attrs |= SgxAttributes::PROVISIONKEY;
        Ok(())
    }
}
