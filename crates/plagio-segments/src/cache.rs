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

//! Bounded cache of loaded shard engines, keyed by index directory.
//!
//! Entries are reference-counted; a separate pin counter keeps an entry out
//! of eviction while a query uses it (pinning controls eviction, not
//! deallocation). Failed loads are cached and retried only after a backoff
//! window.

use lru::LruCache;
use parking_lot::Mutex;
use plagio_rs::ShardIndex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) struct EntryState {
    pub loaded: bool,
    pub ok: bool,
    pub err: String,
    pub engine: Option<Arc<ShardIndex>>,
    pub last_attempt: Option<Instant>,
}

pub(crate) struct CacheEntry {
    pub state: Mutex<EntryState>,
    pins: AtomicI64,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                loaded: false,
                ok: false,
                err: String::new(),
                engine: None,
                last_attempt: None,
            }),
            pins: AtomicI64::new(0),
        }
    }

    pub fn pinned(&self) -> bool {
        self.pins.load(Ordering::Relaxed) > 0
    }
}

/// Scoped pin: taken before a shard is used, released when the query is
/// done with it, so the evictor can never unmap an engine mid-search.
pub(crate) struct PinGuard<'a> {
    entry: &'a CacheEntry,
}

impl<'a> PinGuard<'a> {
    pub fn new(entry: &'a CacheEntry) -> Self {
        entry.pins.fetch_add(1, Ordering::Relaxed);
        Self { entry }
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.entry.pins.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) struct SegmentCache {
    // MRU at the front; the map itself is unbounded, capacity is enforced
    // manually so pinned entries can be skipped.
    lru: Mutex<LruCache<String, Arc<CacheEntry>>>,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self {
            lru: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Look up or insert the entry for `dir`. A hit is NOT promoted here;
    /// promotion happens only after successful use, so a failing shard
    /// cannot thrash the LRU order.
    pub fn get_or_create(&self, dir: &str, cache_max: usize) -> Arc<CacheEntry> {
        let mut lru = self.lru.lock();
        if let Some(e) = lru.peek(dir) {
            return e.clone();
        }
        let e = Arc::new(CacheEntry::new());
        lru.push(dir.to_string(), e.clone());
        Self::evict_if_needed(&mut lru, cache_max);
        e
    }

    fn evict_if_needed(lru: &mut LruCache<String, Arc<CacheEntry>>, max: usize) {
        if max == 0 {
            return;
        }
        let max_attempts = lru.len();
        let mut attempts = 0usize;
        while lru.len() > max && attempts < max_attempts {
            attempts += 1;
            let Some((dir, e)) = lru.pop_lru() else { break };
            if !e.pinned() {
                tracing::debug!(dir = %dir, "evicting shard engine");
                continue;
            }
            // pinned: rotate to MRU; bounded attempts prevent cycling when
            // every entry is pinned
            lru.push(dir, e);
        }
    }

    pub fn touch_after_success(&self, dir: &str) {
        self.lru.lock().promote(dir);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }
}

/// Load the entry's engine if needed. Failed loads are cached; a new
/// attempt is made only after `retry` has elapsed since the last one.
pub(crate) fn ensure_loaded_with_retry(dir: &str, entry: &CacheEntry, retry: Duration) {
    let mut st = entry.state.lock();

    if st.loaded {
        if st.ok {
            return;
        }
        if retry.is_zero() {
            return;
        }
        if let Some(t) = st.last_attempt {
            if t.elapsed() < retry {
                return;
            }
        }
        st.loaded = false;
    }

    st.last_attempt = Some(Instant::now());
    st.loaded = true;
    st.ok = false;
    st.err.clear();
    st.engine = None;

    match ShardIndex::open(dir) {
        Ok(engine) => {
            st.engine = Some(Arc::new(engine));
            st.ok = true;
        }
        Err(e) => {
            st.err = e.to_string();
            tracing::warn!(dir = %dir, error = %st.err, "shard load failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_skips_pinned_entries() {
        let cache = SegmentCache::new();
        let a = cache.get_or_create("a", 2);
        let _pin = PinGuard::new(&a);
        cache.get_or_create("b", 2);
        // inserting c overflows; a is pinned, so b (the LRU unpinned) goes
        cache.get_or_create("c", 2);
        assert_eq!(cache.len(), 2);
        let again = cache.get_or_create("a", 2);
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn all_pinned_bounds_eviction_attempts() {
        let cache = SegmentCache::new();
        let a = cache.get_or_create("a", 1);
        let b = cache.get_or_create("b", 1);
        let _pa = PinGuard::new(&a);
        let _pb = PinGuard::new(&b);
        // nothing evictable; must terminate and leave both present
        cache.get_or_create("a", 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_load_is_cached_until_backoff() {
        let entry = CacheEntry::new();
        ensure_loaded_with_retry("/no/such/dir", &entry, Duration::from_secs(3600));
        {
            let st = entry.state.lock();
            assert!(st.loaded && !st.ok);
            assert!(!st.err.is_empty());
        }
        let first_attempt = entry.state.lock().last_attempt;
        // within the backoff window: no new attempt
        ensure_loaded_with_retry("/no/such/dir", &entry, Duration::from_secs(3600));
        assert_eq!(entry.state.lock().last_attempt, first_attempt);
    }

    #[test]
    fn zero_backoff_never_retries() {
        let entry = CacheEntry::new();
        ensure_loaded_with_retry("/no/such/dir", &entry, Duration::ZERO);
        let first_attempt = entry.state.lock().last_attempt;
        ensure_loaded_with_retry("/no/such/dir", &entry, Duration::ZERO);
        assert_eq!(entry.state.lock().last_attempt, first_attempt);
    }
}
