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

/// Hooks of the virtualized-EPC backend, which owns pages handed out to
/// guest VMs rather than to a host enclave.
pub trait VirtEpc: Send + Sync {
    /// Take a reference on the backing object for OOM victim selection.
    /// Returns false if the object is already being torn down.
    fn oom_get_ref(&self) -> bool;

    /// Reclaim the page by tearing down its guest mapping. The reference
    /// taken by [`VirtEpc::oom_get_ref`] is consumed.
    fn oom(&self);
}
