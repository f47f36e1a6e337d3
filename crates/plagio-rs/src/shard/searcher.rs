//! Query evaluation over a loaded shard.
//!
//! The hot path allocates nothing in steady state: every intermediate lives
//! in thread-local buffers that are reused across queries and shrunk only
//! when a pathological query blows them past their ceilings.

use std::cell::RefCell;
use std::time::Instant;

use super::config::TOPK_HARD_MAX;
use super::{SearchHit, SearchStats, ShardIndex};
use crate::score::{combine, jc_compute};
use crate::shingle::{shingle_hashes, SHINGLE_K};
use crate::text::{normalize, tokenize_spans, TokenSpan};

const TLS_MAX_RAW_CAP: usize = 4_000_000;
const TLS_MAX_QHASH_CAP: usize = 8192;
const TLS_MAX_CAND_CAP: usize = 4096;

/// Query term with its cached postings range.
#[derive(Clone, Copy)]
struct QTerm {
    h: u64,
    df: u64,
    l: u64,
    r: u64,
}

#[derive(Clone, Copy)]
struct Scored {
    did: u32,
    score: f64,
    j: f64,
    c: f64,
    seed_hits: u32,
}

#[derive(Default)]
struct TlsBufs {
    spans: Vec<TokenSpan>,
    q_hashes: Vec<u64>,
    raw: Vec<u32>,
    cand: Vec<(u32, u32)>,
    inter_cnt: Vec<u16>,
    idx_all: Vec<usize>,
    qterms: Vec<QTerm>,
    scored: Vec<Scored>,
}

impl TlsBufs {
    fn clear_soft(&mut self) {
        self.spans.clear();
        self.q_hashes.clear();
        self.raw.clear();
        self.cand.clear();
        self.inter_cnt.clear();
        self.idx_all.clear();
        self.qterms.clear();
        self.scored.clear();

        // shrink only if a previous query blew past the ceilings
        if self.raw.capacity() > TLS_MAX_RAW_CAP {
            self.raw = Vec::new();
        }
        if self.q_hashes.capacity() > TLS_MAX_QHASH_CAP {
            self.q_hashes = Vec::new();
        }
        if self.cand.capacity() > TLS_MAX_CAND_CAP {
            self.cand = Vec::new();
        }
        if self.inter_cnt.capacity() > TLS_MAX_CAND_CAP {
            self.inter_cnt = Vec::new();
        }
        if self.idx_all.capacity() > TLS_MAX_QHASH_CAP {
            self.idx_all = Vec::new();
        }
        if self.qterms.capacity() > TLS_MAX_QHASH_CAP {
            self.qterms = Vec::new();
        }
        if self.scored.capacity() > TLS_MAX_CAND_CAP {
            self.scored = Vec::new();
        }
    }
}

thread_local! {
    static TLS: RefCell<TlsBufs> = RefCell::new(TlsBufs::default());
}

impl ShardIndex {
    /// Top-`top_k` hits for a free-text query, ordered by descending score.
    /// Malformed or too-short queries return an empty list, never an error.
    pub fn search(&self, text: &str, top_k: usize) -> Vec<SearchHit> {
        self.search_with_stats(text, top_k).0
    }

    pub fn search_with_stats(&self, text: &str, top_k: usize) -> (Vec<SearchHit>, SearchStats) {
        let mut st = SearchStats {
            index_version: self.index_version(),
            mmap_on: self.mmap_on(),
            ..SearchStats::default()
        };
        if top_k == 0 {
            return (Vec::new(), st);
        }
        let want = top_k.min(TOPK_HARD_MAX);
        let cfg = self.cfg().clone();
        let perf = cfg.perf_stats != 0;

        TLS.with(|tls| {
            let mut tls = tls.borrow_mut();
            tls.clear_soft();
            let TlsBufs {
                spans,
                q_hashes,
                raw,
                cand,
                inter_cnt,
                idx_all,
                qterms,
                scored,
            } = &mut *tls;

            let t = perf.then(Instant::now);
            let norm = normalize(text.as_bytes());
            if let Some(t) = t {
                st.t_norm_us = t.elapsed().as_micros() as u64;
            }

            let t = perf.then(Instant::now);
            tokenize_spans(&norm, spans);
            if let Some(t) = t {
                st.t_token_us = t.elapsed().as_micros() as u64;
            }

            let min_tokens = (cfg.w_min_query as usize).max(SHINGLE_K);
            if spans.len() < min_tokens {
                return (Vec::new(), st);
            }

            let t = perf.then(Instant::now);
            shingle_hashes(&norm, spans, SHINGLE_K, 0, q_hashes);
            q_hashes.sort_unstable();
            q_hashes.dedup();
            if let Some(t) = t {
                st.t_hash_us = t.elapsed().as_micros() as u64;
            }
            if q_hashes.is_empty() {
                return (Vec::new(), st);
            }

            // Resolve query hashes to postings ranges. The hashes are sorted,
            // so each lookup resumes from the previous insertion point.
            let t = perf.then(Instant::now);
            let mut hint = 0u64;
            for &h in q_hashes.iter() {
                let Some((l, r)) = self.find_postings_hint(h, &mut hint) else {
                    continue;
                };
                let df = r - l;
                if df == 0 || df > cfg.max_df_for_seed {
                    continue;
                }
                qterms.push(QTerm { h, df, l, r });
            }
            if qterms.is_empty() {
                return (Vec::new(), st);
            }

            if qterms.len() > cfg.max_q_uniq9 {
                // keep the rarest, then restore hash order
                qterms.select_nth_unstable_by(cfg.max_q_uniq9, |a, b| a.df.cmp(&b.df));
                qterms.truncate(cfg.max_q_uniq9);
                qterms.sort_unstable_by(|a, b| a.h.cmp(&b.h));
            }
            st.q_uniq_shingles = qterms.len() as u64;
            if let Some(t) = t {
                st.t_qterms_us = t.elapsed().as_micros() as u64;
            }

            // Seed selection: rarest terms first, admitted greedily while the
            // postings budget holds. The first seed is always admitted.
            let t = perf.then(Instant::now);
            idx_all.extend(0..qterms.len());
            let max_seeds = cfg.fetch_per_k.min(qterms.len());
            if idx_all.len() > max_seeds {
                idx_all.select_nth_unstable_by(max_seeds, |&a, &b| {
                    qterms[a].df.cmp(&qterms[b].df)
                });
                idx_all.truncate(max_seeds);
            }
            idx_all.sort_unstable_by(|&a, &b| qterms[a].df.cmp(&qterms[b].df));
            st.seeds_total = idx_all.len() as u64;

            let budget = cfg.seed_budget();
            let mut seeds_used = 0usize;
            let mut sum_df = 0u64;
            for &qi in idx_all.iter() {
                let df = qterms[qi].df;
                if seeds_used > 0 && sum_df + df > budget {
                    break;
                }
                sum_df += df;
                seeds_used += 1;
            }
            if seeds_used == 0 {
                return (Vec::new(), st);
            }
            st.seeds_used = seeds_used as u64;
            if let Some(t) = t {
                st.t_seeds_us = t.elapsed().as_micros() as u64;
            }

            // Gather raw candidate docids from seed postings, then
            // run-length-encode into (did, seed_hits).
            let t = perf.then(Instant::now);
            raw.reserve(sum_df as usize + 16);
            for &qi in idx_all[..seeds_used].iter() {
                let qt = qterms[qi];
                for p in qt.l..qt.r {
                    raw.push(self.did_at(p));
                }
            }
            if raw.is_empty() {
                return (Vec::new(), st);
            }
            raw.sort_unstable();

            cand.reserve(raw.len() / 4 + 16);
            let mut i = 0usize;
            while i < raw.len() {
                let did = raw[i];
                let mut cnt = 1u32;
                i += 1;
                while i < raw.len() && raw[i] == did {
                    cnt += 1;
                    i += 1;
                }
                cand.push((did, cnt));
            }
            st.cand_total_before_cap = cand.len() as u64;

            if cand.len() > cfg.max_cands_doc {
                // keep the strongest by seed hits, then restore did order
                cand.select_nth_unstable_by(cfg.max_cands_doc, |a, b| b.1.cmp(&a.1));
                cand.truncate(cfg.max_cands_doc);
            }
            cand.sort_unstable_by_key(|&(did, _)| did);
            st.cand_after_cap = cand.len() as u64;
            if let Some(t) = t {
                st.t_raw_us = t.elapsed().as_micros() as u64;
            }

            // Intersect every query term (not just seeds) against the sorted
            // candidate list.
            let t = perf.then(Instant::now);
            inter_cnt.resize(cand.len(), 0);
            for qt in qterms.iter() {
                st.inter_scanned_shingles += 1;
                let mut p = qt.l;
                let mut j = 0usize;
                while p < qt.r && j < cand.len() {
                    let did_p = self.did_at(p);
                    let did_c = cand[j].0;
                    if did_p < did_c {
                        p += 1;
                    } else if did_p > did_c {
                        j += 1;
                    } else {
                        if inter_cnt[j] != u16::MAX {
                            inter_cnt[j] += 1;
                        }
                        j += 1;
                        p += 1;
                        while p < qt.r && self.did_at(p) == did_p {
                            p += 1;
                        }
                    }
                }
            }
            if let Some(t) = t {
                st.t_inter_us = t.elapsed().as_micros() as u64;
            }

            let t = perf.then(Instant::now);
            scored.reserve(cand.len());
            let q_size = qterms.len() as i64;
            for (ci, &(did, seed_hits)) in cand.iter().enumerate() {
                let inter = inter_cnt[ci] as i64;
                if inter <= 0 {
                    continue;
                }
                let tok_len = self.tok_len_at(did);
                if tok_len < cfg.w_min_doc {
                    continue;
                }
                let t_size = tok_len as i64 - SHINGLE_K as i64 + 1;
                if t_size <= 0 {
                    continue;
                }
                let (j, c) = jc_compute(inter, q_size, t_size);
                let score = combine(j, c, cfg.alpha, cfg.w9);
                scored.push(Scored {
                    did,
                    score,
                    j,
                    c,
                    seed_hits,
                });
            }
            st.scored = scored.len() as u64;
            if scored.is_empty() {
                return (Vec::new(), st);
            }
            if let Some(t) = t {
                st.t_score_us = t.elapsed().as_micros() as u64;
            }

            let t = perf.then(Instant::now);
            let take = scored.len().min(want);
            if take < scored.len() {
                scored.select_nth_unstable_by(take, |a, b| b.score.total_cmp(&a.score));
                scored.truncate(take);
            }
            scored.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

            let hits: Vec<SearchHit> = scored
                .iter()
                .map(|s| SearchHit {
                    did: s.did,
                    score: s.score,
                    jaccard: s.j,
                    containment: s.c,
                    cand_hits: s.seed_hits,
                })
                .collect();
            if let Some(t) = t {
                st.t_topk_us = t.elapsed().as_micros() as u64;
            }

            (hits, st)
        })
    }
}
