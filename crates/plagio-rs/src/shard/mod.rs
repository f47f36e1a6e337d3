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

//! Shard module: the on-disk CSR v2 index format and its reader, writer and
//! searcher.
//!
//! Heavy logic lives in the submodules; this file holds the format constants
//! and the record types shared between them.

pub const MAGIC: [u8; 4] = *b"PLAG";
pub const VERSION: u32 = 2;

/// Packed header: magic[4], version u32, n_docs u32, uniq_cnt u64,
/// did_cnt u64, reserved0 u64, reserved1 u64. Little-endian, no padding.
pub const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 8 + 8 + 8;

/// Packed per-document record: tok_len u32, simhash_hi u64, simhash_lo u64.
pub const DOC_META_LEN: usize = 4 + 8 + 8;

pub const INDEX_BIN: &str = "index_native.bin";
pub const DOCIDS_JSON: &str = "index_native_docids.json";
pub const META_JSON: &str = "index_native_meta.json";
pub const CONFIG_JSON: &str = "index_config.json";

/// Fixed-size document metadata, positionally keyed by internal doc id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocMeta {
    pub tok_len: u32,
    pub simhash_hi: u64,
    pub simhash_lo: u64,
}

/// One scored hit from a single shard.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SearchHit {
    pub did: u32,
    pub score: f64,
    pub jaccard: f64,
    pub containment: f64,
    /// Seed postings that reached this document before intersection.
    pub cand_hits: u32,
}

/// Per-query counters; timing fields are filled only when `perf_stats` is
/// enabled in the index config.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SearchStats {
    pub q_uniq_shingles: u64,
    pub seeds_total: u64,
    pub seeds_used: u64,
    pub cand_total_before_cap: u64,
    pub cand_after_cap: u64,
    pub inter_scanned_shingles: u64,
    pub scored: u64,
    pub index_version: u32,
    pub mmap_on: bool,
    pub t_norm_us: u64,
    pub t_token_us: u64,
    pub t_hash_us: u64,
    pub t_qterms_us: u64,
    pub t_seeds_us: u64,
    pub t_raw_us: u64,
    pub t_inter_us: u64,
    pub t_score_us: u64,
    pub t_topk_us: u64,
}

mod error;
pub use error::LoadError;

pub mod config;
pub use config::IndexConfig;

mod reader;
pub use reader::ShardIndex;

mod searcher;

mod writer;
pub use writer::{SectionFiles, ShardWriter};

// Tests for the full write/read/search path live in `tests/shard_tests.rs`.
