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

//! Inspect an index directory: header fields, validation outcome, config
//! in effect, and optionally the simhash distance between two documents.

use anyhow::{bail, Result};
use clap::Parser;
use plagio_rs::shingle::simhash_distance;
use plagio_rs::ShardIndex;

#[derive(Parser, Debug)]
#[command(name = "plag-inspect", about = "Inspect a built index directory")]
struct Args {
    /// Index directory produced by index_builder
    index_dir: std::path::PathBuf,
    /// Print the first N doc ids
    #[arg(long, default_value_t = 0)]
    head: usize,
    /// Compare the simhash fingerprints of two internal doc ids
    #[arg(long, num_args = 2, value_names = ["DID_A", "DID_B"])]
    simhash: Option<Vec<u32>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let idx = ShardIndex::open(&args.index_dir)?;
    println!(
        "version={} mmap={} docs={} uniq={} did={} approx_bytes={}",
        idx.index_version(),
        idx.mmap_on(),
        idx.doc_count(),
        idx.uniq_count(),
        idx.did_count(),
        idx.approx_bytes()
    );
    let cfg = idx.cfg();
    println!(
        "config: w_min_doc={} w_min_query={} alpha={} w9={} fetch_per_k={} max_cands_doc={} max_df_for_seed={} max_q_uniq9={} sum_df_budget={}",
        cfg.w_min_doc,
        cfg.w_min_query,
        cfg.alpha,
        cfg.w9,
        cfg.fetch_per_k,
        cfg.max_cands_doc,
        cfg.max_df_for_seed,
        cfg.max_q_uniq9,
        cfg.seed_budget()
    );

    for (did, id) in idx.doc_ids().iter().take(args.head).enumerate() {
        let meta = idx.doc_meta(did as u32).unwrap_or_default();
        println!("{}\t{}\ttok_len={}", did, id, meta.tok_len);
    }

    if let Some(pair) = args.simhash {
        let (a, b) = (pair[0], pair[1]);
        let (Some(ma), Some(mb)) = (idx.doc_meta(a), idx.doc_meta(b)) else {
            bail!("doc id out of range (docs={})", idx.doc_count());
        };
        let dist = simhash_distance(
            (ma.simhash_hi, ma.simhash_lo),
            (mb.simhash_hi, mb.simhash_lo),
        );
        println!("simhash_distance({}, {}) = {}", a, b, dist);
    }
    Ok(())
}
