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

use anyhow::Result;
use clap::Parser;
use plagio_rs::ShardIndex;

#[derive(Parser, Debug)]
#[command(name = "plag-search", about = "Query a single index directory")]
struct Args {
    /// Index directory produced by index_builder
    index_dir: std::path::PathBuf,
    /// Query text
    query: String,
    /// Number of hits to return
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    /// Emit JSON (NDJSON, one hit per line)
    #[arg(long)]
    json: bool,
    /// Print query execution stats to stderr
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let idx = ShardIndex::open(&args.index_dir)?;
    let (hits, st) = idx.search_with_stats(&args.query, args.top_k);

    if args.stats {
        eprintln!(
            "q_uniq={} seeds={}/{} cand={}->{} scored={}",
            st.q_uniq_shingles,
            st.seeds_used,
            st.seeds_total,
            st.cand_total_before_cap,
            st.cand_after_cap,
            st.scored
        );
    }

    for h in hits {
        let doc_id = idx
            .doc_ids()
            .get(h.did as usize)
            .map(String::as_str)
            .unwrap_or("");
        if args.json {
            let v = serde_json::json!({
                "did": h.did,
                "doc_id": doc_id,
                "score": h.score,
                "jaccard": h.jaccard,
                "containment": h.containment,
                "cand_hits": h.cand_hits,
            });
            println!("{}", v);
        } else {
            println!(
                "{}\t{}\tscore={:.4} j={:.4} c={:.4} hits={}",
                h.did, doc_id, h.score, h.jaccard, h.containment, h.cand_hits
            );
        }
    }
    Ok(())
}
