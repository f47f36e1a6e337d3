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
use plagio_rs::IndexBuilder;

#[derive(Parser, Debug)]
#[command(
    name = "index_builder",
    about = "Build a CSR shingle index from a JSONL corpus"
)]
struct Args {
    /// Input corpus: one JSON object per line with "doc_id" and "text"
    corpus_jsonl: std::path::PathBuf,
    /// Output index directory (created if missing)
    out_dir: std::path::PathBuf,
    /// Override worker thread count (default: PLAGIO_THREADS or hardware)
    #[arg(long)]
    threads: Option<usize>,
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut builder = IndexBuilder::new(&args.corpus_jsonl, &args.out_dir);
    if let Some(n) = args.threads {
        builder = builder.threads(n);
    }
    let s = builder.build()?;
    println!(
        "[index_builder] built {}: docs={} uniq9={} did9={} lines={} bad_docs={} workers={} runs_final={}",
        args.out_dir.display(),
        s.docs_ok,
        s.uniq_cnt,
        s.did_cnt,
        s.lines_total,
        s.docs_bad,
        s.workers,
        s.runs_final
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(e) = run() {
        eprintln!("index_builder: {:#}", e);
        std::process::exit(1);
    }
}
