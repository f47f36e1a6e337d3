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

//! Multi-shard aggregation: fan a query across index directories, merge
//! hits by document identity and return a globally ranked top-K as a JSON
//! document.
//!
//! Shards are loaded lazily into a bounded LRU cache ([`cache`]); a failing
//! shard is isolated and reported through `dirs_failed`, never as a request
//! failure.

use plagio_rs::shard::config::TOPK_HARD_MAX;
use plagio_rs::{SearchHit, ShardIndex};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

mod cache;
use cache::{ensure_loaded_with_retry, PinGuard, SegmentCache};

const LOCAL_K_HARD_MAX: usize = 8000;
const ND_DIRS_HARD_MAX: usize = 20_000;
const ERR_SNIP_MAX: usize = 512;

const SEG_CACHE_MAX_DEFAULT: usize = 256;
const SEG_LOAD_RETRY_MS_DEFAULT: u64 = 3000;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|n| n.min(1_000_000))
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default,
    }
}

fn safe_snip(mut s: String) -> String {
    if s.len() > ERR_SNIP_MAX {
        s.truncate(ERR_SNIP_MAX);
    }
    s
}

fn error_json(code: &str, message: &str) -> serde_json::Value {
    json!({
        "ok": false,
        "error": { "code": code, "message": message },
        "count": 0,
        "hits": [],
    })
}

/// Per-shard over-fetch: the same document can surface in several shards,
/// so each shard is asked for more than `k` to preserve recall.
fn choose_local_k(k: usize, n_dirs: usize) -> usize {
    let lk = if n_dirs <= 8 {
        k * 4
    } else if n_dirs <= 64 {
        k * 3
    } else if n_dirs <= 512 {
        k * 2
    } else {
        k
    };
    lk.max(k).min(LOCAL_K_HARD_MAX)
}

fn global_cache() -> &'static SegmentCache {
    static CACHE: OnceLock<SegmentCache> = OnceLock::new();
    CACHE.get_or_init(SegmentCache::new)
}

/// Aggregate state for one document identity across shards.
struct AggHit {
    best_index_dir: String,
    score: f64,
    jaccard: f64,
    containment: f64,
    cand_hits: u32,
    /// Shards where this key appeared; counted at most once per shard.
    found_in: u32,
    last_seen_dir: i64,
}

impl AggHit {
    fn new(dir: &str, di: i64, h: &SearchHit) -> Self {
        Self {
            best_index_dir: dir.to_string(),
            score: h.score,
            jaccard: h.jaccard,
            containment: h.containment,
            cand_hits: h.cand_hits,
            found_in: 1,
            last_seen_dir: di,
        }
    }

    fn merge(&mut self, dir: &str, di: i64, h: &SearchHit) {
        if self.last_seen_dir != di {
            self.found_in += 1;
            self.last_seen_dir = di;
        }
        if h.score > self.score {
            self.score = h.score;
            self.jaccard = h.jaccard;
            self.containment = h.containment;
            self.cand_hits = h.cand_hits;
            self.best_index_dir = dir.to_string();
        } else if h.cand_hits > self.cand_hits {
            self.cand_hits = h.cand_hits;
        }
    }
}

struct HeapItem<'a> {
    score: f64,
    key: &'a str,
    hit: &'a AggHit,
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.score.total_cmp(&other.score) == std::cmp::Ordering::Equal
    }
}
impl Eq for HeapItem<'_> {}
impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// Fan `query` across `index_dirs` and return the global top-`top_k` as a
/// JSON document. Argument errors yield `{ok: false, error: {...}}`; shard
/// failures are isolated and only counted.
pub fn search_many(query: &str, top_k: usize, index_dirs: &[String]) -> serde_json::Value {
    match catch_unwind(AssertUnwindSafe(|| {
        search_many_inner(query, top_k, index_dirs)
    })) {
        Ok(v) => v,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown".to_string());
            error_json("exception", &safe_snip(msg))
        }
    }
}

fn search_many_inner(query: &str, top_k: usize, index_dirs: &[String]) -> serde_json::Value {
    if index_dirs.is_empty() {
        return error_json("bad_request", "no index dirs");
    }
    if index_dirs.len() > ND_DIRS_HARD_MAX {
        return error_json("bad_request", "too many dirs");
    }
    if top_k == 0 {
        return error_json("bad_request", "top_k<=0");
    }
    if query.is_empty() {
        return error_json("bad_request", "empty query");
    }

    let k = top_k.min(TOPK_HARD_MAX);
    let debug = env_bool("SEG_DEBUG", false);
    let cache_max = env_usize("SEG_CACHE_MAX", SEG_CACHE_MAX_DEFAULT);
    let retry = Duration::from_millis(
        env_usize("SEG_LOAD_RETRY_MS", SEG_LOAD_RETRY_MS_DEFAULT as usize) as u64,
    );
    let local_k = choose_local_k(k, index_dirs.len());

    let mut agg: HashMap<String, AggHit> = HashMap::new();
    let mut stats_by_index: Vec<serde_json::Value> = Vec::new();
    let mut dirs_ok = 0usize;
    let mut dirs_failed = 0usize;

    for (di, dir) in index_dirs.iter().enumerate() {
        let di = di as i64;
        if dir.is_empty() {
            dirs_failed += 1;
            continue;
        }

        let entry = global_cache().get_or_create(dir, cache_max);
        ensure_loaded_with_retry(dir, &entry, retry);

        let engine: Arc<ShardIndex> = {
            let st = entry.state.lock();
            match (&st.engine, st.ok) {
                (Some(e), true) => e.clone(),
                _ => {
                    dirs_failed += 1;
                    if debug {
                        let err = if st.err.is_empty() {
                            "load_failed".to_string()
                        } else {
                            st.err.clone()
                        };
                        stats_by_index.push(json!({
                            "index_dir": dir,
                            "ok": false,
                            "error": safe_snip(err),
                        }));
                    }
                    continue;
                }
            }
        };

        // pin before touch/search so the evictor cannot drop the engine
        // while this query runs on it
        let _pin = PinGuard::new(&entry);
        global_cache().touch_after_success(dir);
        dirs_ok += 1;

        let (hits, st) = engine.search_with_stats(query, local_k);
        if debug {
            stats_by_index.push(json!({
                "index_dir": dir,
                "ok": true,
                "got": hits.len(),
                "local_k": local_k,
                "stats": st,
            }));
        }

        let ids = engine.doc_ids();
        for h in &hits {
            let real_id = ids.get(h.did as usize).filter(|s| !s.is_empty());
            match real_id {
                Some(id) => {
                    match agg.get_mut(id.as_str()) {
                        Some(ah) => ah.merge(dir, di, h),
                        None => {
                            agg.insert(id.clone(), AggHit::new(dir, di, h));
                        }
                    }
                }
                None => {
                    // no external id: key by dir + internal id, which cannot
                    // collide across shards
                    let key = format!("{}:{}", dir, h.did);
                    match agg.get_mut(&key) {
                        Some(ah) => ah.merge(dir, di, h),
                        None => {
                            agg.insert(key, AggHit::new(dir, di, h));
                        }
                    }
                }
            }
        }
    }

    // bounded min-heap over aggregate refs, then a final descending sort
    let mut heap: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::with_capacity(k);
    for (key, hit) in &agg {
        let item = HeapItem {
            score: hit.score,
            key,
            hit,
        };
        if heap.len() < k {
            heap.push(Reverse(item));
        } else if let Some(Reverse(min)) = heap.peek() {
            if item.score > min.score {
                heap.pop();
                heap.push(Reverse(item));
            }
        }
    }
    let mut ranked: Vec<HeapItem> = heap.into_iter().map(|r| r.0).collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let hits: Vec<serde_json::Value> = ranked
        .iter()
        .map(|item| {
            let h = item.hit;
            json!({
                "doc_id": item.key,
                "doc_uid": item.key,
                "best_index_dir": h.best_index_dir,
                "score": h.score,
                "jaccard": h.jaccard,
                "containment": h.containment,
                "cand_hits": h.cand_hits,
                "found_in": h.found_in,
            })
        })
        .collect();

    let mut out = json!({
        "ok": true,
        "top_k": k,
        "local_k": local_k,
        "dirs_ok": dirs_ok,
        "dirs_failed": dirs_failed,
        "unique_docs_considered": agg.len(),
        "count": hits.len(),
        "hits": hits,
    });
    if debug {
        out["stats_by_index"] = serde_json::Value::Array(stats_by_index);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_k_schedule() {
        assert_eq!(choose_local_k(10, 1), 40);
        assert_eq!(choose_local_k(10, 8), 40);
        assert_eq!(choose_local_k(10, 9), 30);
        assert_eq!(choose_local_k(10, 64), 30);
        assert_eq!(choose_local_k(10, 65), 20);
        assert_eq!(choose_local_k(10, 513), 10);
        assert_eq!(choose_local_k(5000, 1), LOCAL_K_HARD_MAX);
    }

    #[test]
    fn argument_errors_are_structured() {
        let v = search_many("", 10, &["x".to_string()]);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "bad_request");

        let v = search_many("q", 0, &["x".to_string()]);
        assert_eq!(v["error"]["code"], "bad_request");

        let v = search_many("q", 10, &[]);
        assert_eq!(v["error"]["code"], "bad_request");
    }

    #[test]
    fn missing_shard_is_isolated() {
        let dirs = vec!["/definitely/not/an/index".to_string()];
        let v = search_many("some query text long enough to matter", 5, &dirs);
        assert_eq!(v["ok"], true);
        assert_eq!(v["dirs_ok"], 0);
        assert_eq!(v["dirs_failed"], 1);
        assert_eq!(v["count"], 0);
    }
}
