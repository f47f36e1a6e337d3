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

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "seg-search",
    about = "Query several index directories and merge the results"
)]
struct Args {
    /// Query text
    query: String,
    /// Index directories to fan out across
    #[arg(required = true)]
    index_dirs: Vec<String>,
    /// Number of hits in the merged result
    #[arg(long, default_value_t = 10)]
    top_k: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let out = plagio_segments::search_many(&args.query, args.top_k, &args.index_dirs);
    println!("{}", out);
    if out["ok"] != serde_json::Value::Bool(true) {
        std::process::exit(1);
    }
}
