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

//! Management core for a hardware-protected page pool: per-section free
//! lists, LRU tracking, watermark-driven background reclaim with the
//! block/track/write-back eviction protocol, and whole-enclave OOM
//! recovery.

#[macro_use]
extern crate log;

#[macro_use]
pub mod error;

pub mod cgroup;
pub mod consts;
pub mod cpumask;
pub mod encl;
pub mod epc;
pub mod hw;
pub mod platform;
pub mod provision;
pub mod virt;

#[cfg(test)]
pub(crate) mod test_utils;

use std::sync::Arc;

use spin::Once;

use cgroup::CgroupSubsys;
use epc::EpcManager;
use error::EpcResult;
use hw::EnclsHw;
use platform::Platform;
use provision::ProvisionDev;

static EPC: Once<Arc<EpcManager>> = Once::new();
static PROVISION: Once<Arc<ProvisionDev>> = Once::new();

/// Bring up the process-wide page cache: section pool, reclaim daemon,
/// provisioning device. Partial setup is undone in reverse order on
/// failure.
pub fn init(
    hw: Arc<dyn EnclsHw>,
    platform: Arc<dyn Platform>,
    cgroups: Option<Arc<dyn CgroupSubsys>>,
) -> EpcResult<Arc<EpcManager>> {
    if EPC.is_completed() {
        return epc_result_err!(EEXIST, "the EPC manager is already initialized");
    }

    let mgr = EpcManager::new(hw, platform, cgroups)?;
    mgr.start_reclaimer()?;

    EPC.call_once(|| mgr.clone());
    PROVISION.call_once(ProvisionDev::new);
    Ok(mgr)
}

/// Tear the page cache down; the daemon is stopped and joined first.
pub fn teardown() {
    if let Some(mgr) = EPC.get() {
        mgr.shutdown();
    }
}

pub fn epc() -> Option<&'static Arc<EpcManager>> {
    EPC.get()
}

pub fn provision_dev() -> Option<&'static Arc<ProvisionDev>> {
    PROVISION.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EpcErrorNum;
    use crate::test_utils::{MockHw, TestPlatform};

    #[test]
    fn init_brings_up_the_singletons_once() {
        let mgr = init(MockHw::new(&[4]), TestPlatform::new(), None).unwrap();
        assert!(epc().is_some());
        assert!(provision_dev().is_some());

        let err = init(MockHw::new(&[4]), TestPlatform::new(), None).unwrap_err();
        assert_eq!(err.num(), EpcErrorNum::EEXIST);

        teardown();
        assert!(mgr.daemon.lock().is_none());
    }
}
