// Copyright 2025 Plagio Project
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

//! Process-wide "current index" handle for hosts that serve one index at a
//! time and hot-swap it on rebuild.
//!
//! Queries take a snapshot and keep running on it even while a newer index
//! is published; the old mapping is released when the last snapshot drops.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::shard::ShardIndex;

static CURRENT: RwLock<Option<Arc<ShardIndex>>> = RwLock::new(None);

/// Publish a newly loaded index, replacing the previous one.
pub fn publish(idx: Arc<ShardIndex>) {
    *CURRENT.write() = Some(idx);
}

/// Snapshot of the currently published index, if any.
pub fn snapshot() -> Option<Arc<ShardIndex>> {
    CURRENT.read().clone()
}

/// Drop the published index. In-flight snapshots stay valid.
pub fn clear() {
    *CURRENT.write() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_none_until_published() {
        // note: shares process state with other tests; only check the
        // publish/clear transitions we drive ourselves
        clear();
        assert!(snapshot().is_none());
    }
}
