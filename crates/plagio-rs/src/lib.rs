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

//! Shingle-overlap near-duplicate retrieval core: JSONL corpus in, compact
//! CSR index on disk, top-K similarity search out.
//!
//! The crate splits along the data flow: `text` and `shingle` are the pure
//! functions everything hashes through, `index` is the out-of-core builder,
//! `shard` is the on-disk format plus the read-only query engine, `score`
//! is the Jaccard/containment combination.

pub mod current;
pub mod index;
pub mod score;
pub mod shard;
pub mod shingle;
pub mod text;

// Re-export the surface most callers want without digging through modules.
pub use crate::index::{BuildSummary, IndexBuilder};
pub use crate::shard::{
    DocMeta, IndexConfig, LoadError, SearchHit, SearchStats, ShardIndex,
};
pub use crate::shingle::SHINGLE_K;
pub use crate::text::{normalize, tokenize_spans, TokenSpan};
