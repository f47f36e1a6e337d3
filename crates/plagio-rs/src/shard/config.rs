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

//! Query-time configuration, read from `index_config.json` next to the
//! shard. Every knob is clamped against hard safety ceilings so a bad config
//! can degrade quality but never memory-bomb the process.

use serde::Deserialize;
use std::path::Path;

use crate::score::clamp01;

// Hard safety limits, not user-tunable.
pub const TOPK_HARD_MAX: usize = 2000;
pub const FETCH_PER_K_HARD_MAX: usize = 8192;
pub const MAX_CANDS_DOC_HARD_MAX: usize = 2_000_000;
pub const MAX_Q_UNIQ9_HARD_MAX: usize = 200_000;
pub const MAX_SUM_DF_HARD_MAX: u64 = 500_000_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Weights {
    alpha: f64,
    w9: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self { alpha: 0.60, w9: 0.90 }
    }
}

fn default_alpha() -> f64 {
    0.60
}

fn default_w9() -> f64 {
    0.90
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub w_min_doc: u32,
    pub w_min_query: u32,
    #[serde(rename = "fetch_per_k_doc")]
    pub fetch_per_k: usize,
    pub max_cands_doc: usize,
    pub max_df_for_seed: u64,

    pub max_q_uniq9: usize,
    /// Soft budget on total postings read across seeds; 0 means "fall back
    /// to `hard_max_sum_df_seeds`".
    pub max_sum_df_seeds: u64,
    pub hard_max_sum_df_seeds: u64,

    pub validate_postings_samples: usize,
    pub validate_postings_maxlen: usize,
    pub validate_did_samples: usize,
    pub validate_uniq_samples: usize,

    pub perf_stats: u32,

    #[serde(skip, default = "default_alpha")]
    pub alpha: f64,
    #[serde(skip, default = "default_w9")]
    pub w9: f64,

    #[serde(rename = "weights")]
    weights_raw: Option<Weights>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            w_min_doc: 8,
            w_min_query: 9,
            fetch_per_k: 64,
            max_cands_doc: 1000,
            max_df_for_seed: 200_000,
            max_q_uniq9: 4096,
            max_sum_df_seeds: 2_000_000,
            hard_max_sum_df_seeds: 10_000_000,
            validate_postings_samples: 256,
            validate_postings_maxlen: 64,
            validate_did_samples: 4096,
            validate_uniq_samples: 4096,
            perf_stats: 0,
            alpha: 0.60,
            w9: 0.90,
            weights_raw: None,
        }
    }
}

impl IndexConfig {
    /// Read `index_config.json` from `dir`. Absent or unparsable files fall
    /// back to defaults; the shard itself stays loadable.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(super::CONFIG_JSON);
        let mut cfg = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<IndexConfig>(&bytes) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("ignoring malformed {}: {}", path.display(), e);
                    IndexConfig::default()
                }
            },
            Err(_) => IndexConfig::default(),
        };
        cfg.clamp();
        cfg
    }

    /// Apply defaults for the nested weights object and clamp every knob.
    pub fn clamp(&mut self) {
        if let Some(w) = self.weights_raw.take() {
            self.alpha = w.alpha;
            self.w9 = w.w9;
        }
        self.alpha = clamp01(self.alpha);
        self.w9 = clamp01(self.w9);

        self.w_min_doc = self.w_min_doc.max(1);
        self.w_min_query = self.w_min_query.max(1);

        self.fetch_per_k = self.fetch_per_k.clamp(1, FETCH_PER_K_HARD_MAX);
        self.max_cands_doc = self.max_cands_doc.clamp(1, MAX_CANDS_DOC_HARD_MAX);
        self.max_df_for_seed = self.max_df_for_seed.max(1);

        self.max_q_uniq9 = self.max_q_uniq9.clamp(128, MAX_Q_UNIQ9_HARD_MAX);
        self.max_sum_df_seeds = self.max_sum_df_seeds.min(MAX_SUM_DF_HARD_MAX);
        self.hard_max_sum_df_seeds = self
            .hard_max_sum_df_seeds
            .clamp(1_000_000, MAX_SUM_DF_HARD_MAX);

        self.validate_postings_maxlen = self.validate_postings_maxlen.max(16);
    }

    /// Effective seed budget: the soft cap when set, the hard cap otherwise.
    pub fn seed_budget(&self) -> u64 {
        if self.max_sum_df_seeds > 0 {
            self.max_sum_df_seeds
        } else {
            self.hard_max_sum_df_seeds
        }
    }
}
