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

//! Shingle hashing: 64-bit FNV-1a over `K` consecutive tokens joined by a
//! single ASCII space, streamed directly from token spans so the joined
//! string is never materialized. Also the 128-bit simhash document
//! fingerprint computed from the same token stream.

use crate::text::TokenSpan;

/// Window size in tokens. Fixed per index; changing it invalidates every
/// shard built with the previous value.
pub const SHINGLE_K: usize = 9;

const FNV_OFFSET: u64 = 1_469_598_103_934_665_603;
const FNV_PRIME: u64 = 1_099_511_628_211;

#[inline]
fn fnv1a64_step(mut h: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[inline]
fn fnv1a64_span_seed(norm: &str, span: &TokenSpan, seed: u64) -> u64 {
    let bytes = &norm.as_bytes()[span.off as usize..(span.off + span.len) as usize];
    fnv1a64_step(seed, bytes)
}

/// Hash of the window `toks[start..start+k]` as `tok SP tok SP ... tok`.
pub fn hash_shingle_at(norm: &str, toks: &[TokenSpan], start: usize, k: usize) -> u64 {
    let mut h = FNV_OFFSET;
    for (j, span) in toks[start..start + k].iter().enumerate() {
        if j > 0 {
            h ^= b' ' as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h = fnv1a64_span_seed(norm, span, h);
    }
    h
}

/// All window hashes at stride 1, at most `max_shingles` of them
/// (0 = unlimited). `out` is cleared and reused.
pub fn shingle_hashes(
    norm: &str,
    toks: &[TokenSpan],
    k: usize,
    max_shingles: usize,
    out: &mut Vec<u64>,
) {
    out.clear();
    if toks.len() < k {
        return;
    }
    let cnt = toks.len() - k + 1;
    let cap = if max_shingles > 0 {
        cnt.min(max_shingles)
    } else {
        cnt
    };
    out.reserve(cap);
    for pos in 0..cap {
        out.push(hash_shingle_at(norm, toks, pos, k));
    }
}

/// 128-bit simhash over per-token FNV-1a with two fixed seeds. Returned as
/// `(hi, lo)`; a bit is set iff its signed counter ended non-negative.
pub fn simhash128(norm: &str, toks: &[TokenSpan]) -> (u64, u64) {
    let mut v = [0i64; 128];

    for span in toks {
        let lo = fnv1a64_span_seed(norm, span, FNV_OFFSET);
        let hi = fnv1a64_span_seed(norm, span, FNV_PRIME);
        for i in 0..64 {
            v[i] += if (lo >> i) & 1 == 1 { 1 } else { -1 };
            v[64 + i] += if (hi >> i) & 1 == 1 { 1 } else { -1 };
        }
    }

    let mut hi = 0u64;
    let mut lo = 0u64;
    for i in 0..64 {
        if v[i] >= 0 {
            lo |= 1u64 << i;
        }
        if v[64 + i] >= 0 {
            hi |= 1u64 << i;
        }
    }
    (hi, lo)
}

/// Hamming distance between two 128-bit fingerprints. Stored per document
/// for future coarse prefiltering; not part of the current scoring.
pub fn simhash_distance(a: (u64, u64), b: (u64, u64)) -> u32 {
    (a.0 ^ b.0).count_ones() + (a.1 ^ b.1).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::{normalize, tokenize_spans};

    fn spans_of(text: &str) -> (String, Vec<TokenSpan>) {
        let norm = normalize(text.as_bytes());
        let mut toks = Vec::new();
        tokenize_spans(&norm, &mut toks);
        (norm, toks)
    }

    #[test]
    fn window_count_matches_token_count() {
        let (norm, toks) = spans_of("a b c d e f g h i j k l");
        let mut out = Vec::new();
        shingle_hashes(&norm, &toks, SHINGLE_K, 0, &mut out);
        assert_eq!(out.len(), toks.len() - SHINGLE_K + 1);
    }

    #[test]
    fn too_few_tokens_yield_nothing() {
        let (norm, toks) = spans_of("one two three");
        let mut out = vec![1, 2, 3];
        shingle_hashes(&norm, &toks, SHINGLE_K, 0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn max_shingles_caps_output() {
        let (norm, toks) = spans_of("a b c d e f g h i j k l m n o p");
        let mut out = Vec::new();
        shingle_hashes(&norm, &toks, SHINGLE_K, 3, &mut out);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn streaming_matches_joined_string_hash() {
        let (norm, toks) = spans_of("the quick brown fox jumps over the lazy dog again");
        let joined: Vec<String> = toks[0..SHINGLE_K]
            .iter()
            .map(|t| norm[t.off as usize..(t.off + t.len) as usize].to_string())
            .collect();
        let expected = fnv1a64_step(FNV_OFFSET, joined.join(" ").as_bytes());
        assert_eq!(hash_shingle_at(&norm, &toks, 0, SHINGLE_K), expected);
    }

    #[test]
    fn hashes_invariant_under_pre_normalization_noise() {
        let (n1, t1) = spans_of("The QUICK brown fox jumps over the lazy dog near rivers");
        let (n2, t2) = spans_of("the quick  Brown fox jumps over the lazy dog near rivers");
        let mut h1 = Vec::new();
        let mut h2 = Vec::new();
        shingle_hashes(&n1, &t1, SHINGLE_K, 0, &mut h1);
        shingle_hashes(&n2, &t2, SHINGLE_K, 0, &mut h2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn simhash_equal_for_equal_token_streams() {
        let (n1, t1) = spans_of("alpha beta gamma delta");
        let (n2, t2) = spans_of("Alpha  BETA gamma delta");
        assert_eq!(simhash128(&n1, &t1), simhash128(&n2, &t2));
    }

    #[test]
    fn simhash_differs_for_disjoint_texts() {
        let (n1, t1) = spans_of("alpha beta gamma delta epsilon zeta");
        let (n2, t2) = spans_of("один два три четыре пять шесть");
        assert_ne!(simhash128(&n1, &t1), simhash128(&n2, &t2));
    }

    #[test]
    fn simhash_distance_tracks_similarity() {
        let (n1, t1) = spans_of("alpha beta gamma delta epsilon zeta eta theta");
        let (n2, t2) = spans_of("alpha beta gamma delta epsilon zeta eta iota");
        let (n3, t3) = spans_of("один два три четыре пять шесть семь восемь");
        let a = simhash128(&n1, &t1);
        let b = simhash128(&n2, &t2);
        let c = simhash128(&n3, &t3);
        assert_eq!(simhash_distance(a, a), 0);
        assert!(simhash_distance(a, b) < simhash_distance(a, c));
    }
}
