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

//! The builder pipeline: one reader thread feeding line batches through a
//! bounded channel to a pool of workers, each spilling sorted posting runs
//! to disk, followed by an external merge and atomic publication.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread;

use super::runs::{
    merge_runs_to_csr, reduce_runs_multipass, write_run_file, PairRec, RUN_KIND_LOCAL,
};
use crate::shard::{DocMeta, SectionFiles, ShardWriter, VERSION};
use crate::shingle::{shingle_hashes, simhash128, SHINGLE_K};
use crate::text::{normalize, tokenize_spans, TokenSpan};

const LINES_BATCH: usize = 2048;
const QUEUE_MAX_BATCH: usize = 32;

const MAX_TOKENS_PER_DOC: usize = 100_000;
const MAX_SHINGLES_PER_DOC: usize = 50_000;
const SHINGLE_STRIDE: u32 = 1;

const RUN_MAX_PAIRS_DEFAULT: usize = 2_000_000;

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"),
        Err(_) => default,
    }
}

fn run_max_pairs_from_env() -> usize {
    env_usize("PLAGIO_RUN_MAX_PAIRS", RUN_MAX_PAIRS_DEFAULT).clamp(1_000, 50_000_000)
}

fn worker_count(explicit: Option<usize>) -> usize {
    let avail = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let env = std::env::var("PLAGIO_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0);
    explicit.or(env).unwrap_or_else(|| avail.min(16)).max(1)
}

#[derive(Deserialize)]
struct CorpusLine {
    #[serde(default)]
    doc_id: String,
    #[serde(default)]
    text: String,
}

/// Per-worker state: local doc tables, scratch buffers and the in-RAM run
/// buffer. No locks; worker-local doc ids are rebased during the merge.
struct WorkerCtx {
    tid: u32,
    runs_dir: PathBuf,

    doc_ids: Vec<String>,
    docs_meta: Vec<DocMeta>,

    spans: Vec<TokenSpan>,
    doc_hashes: Vec<u64>,

    run_recs: Vec<PairRec>,
    run_paths: Vec<PathBuf>,
    run_seq: u32,
    run_max_pairs: usize,

    docs_ok: u64,
    docs_bad: u64,
    pairs_emitted: u64,
}

impl WorkerCtx {
    fn new(tid: u32, runs_dir: PathBuf, run_max_pairs: usize) -> Self {
        Self {
            tid,
            runs_dir,
            doc_ids: Vec::with_capacity(1024),
            docs_meta: Vec::with_capacity(1024),
            spans: Vec::with_capacity(256),
            doc_hashes: Vec::with_capacity(4096),
            run_recs: Vec::with_capacity(run_max_pairs.min(1 << 20)),
            run_paths: Vec::new(),
            run_seq: 0,
            run_max_pairs,
            docs_ok: 0,
            docs_bad: 0,
            pairs_emitted: 0,
        }
    }

    fn process_batch(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            if line.is_empty() {
                continue;
            }
            self.process_line(line)?;
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str) -> Result<()> {
        let rec: CorpusLine = match serde_json::from_str(line) {
            Ok(rec) => rec,
            Err(_) => {
                self.docs_bad += 1;
                return Ok(());
            }
        };
        if rec.doc_id.is_empty() || rec.text.is_empty() {
            self.docs_bad += 1;
            return Ok(());
        }

        let norm = normalize(rec.text.as_bytes());
        tokenize_spans(&norm, &mut self.spans);
        if self.spans.len() > MAX_TOKENS_PER_DOC {
            self.spans.truncate(MAX_TOKENS_PER_DOC);
        }
        if self.spans.len() < SHINGLE_K {
            self.docs_bad += 1;
            return Ok(());
        }

        let (hi, lo) = simhash128(&norm, &self.spans);
        let dm = DocMeta {
            tok_len: self.spans.len() as u32,
            simhash_hi: hi,
            simhash_lo: lo,
        };

        let ldoc = self.doc_ids.len() as u32;
        self.doc_ids.push(rec.doc_id);
        self.docs_meta.push(dm);
        self.docs_ok += 1;

        shingle_hashes(
            &norm,
            &self.spans,
            SHINGLE_K,
            MAX_SHINGLES_PER_DOC,
            &mut self.doc_hashes,
        );
        // per-doc dedup saves a lot downstream
        self.doc_hashes.sort_unstable();
        self.doc_hashes.dedup();

        for &h in &self.doc_hashes {
            self.run_recs.push(PairRec { h, doc: ldoc });
        }
        self.pairs_emitted += self.doc_hashes.len() as u64;

        if self.run_recs.len() >= self.run_max_pairs {
            self.flush_run()?;
        }
        Ok(())
    }

    fn flush_run(&mut self) -> Result<()> {
        if self.run_recs.is_empty() {
            return Ok(());
        }
        let path = self
            .runs_dir
            .join(format!("run_local_t{}_{}.bin", self.tid, self.run_seq));
        self.run_seq += 1;
        write_run_file(&path, RUN_KIND_LOCAL, self.tid, &mut self.run_recs)?;
        self.run_paths.push(path);

        self.run_recs.clear();
        if self.run_recs.capacity() > self.run_max_pairs * 2 {
            self.run_recs = Vec::with_capacity(self.run_max_pairs);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub lines_total: u64,
    pub docs_ok: u64,
    pub docs_bad: u64,
    pub pairs_emitted: u64,
    pub uniq_cnt: u64,
    pub did_cnt: u64,
    pub workers: usize,
    pub runs_final: usize,
}

/// Builds a shard directory from a JSONL corpus.
pub struct IndexBuilder {
    corpus: PathBuf,
    out_dir: PathBuf,
    threads: Option<usize>,
}

impl IndexBuilder {
    pub fn new(corpus: impl AsRef<Path>, out_dir: impl AsRef<Path>) -> Self {
        Self {
            corpus: corpus.as_ref().to_path_buf(),
            out_dir: out_dir.as_ref().to_path_buf(),
            threads: None,
        }
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    pub fn build(self) -> Result<BuildSummary> {
        if cfg!(target_endian = "big") {
            bail!("index builder writes little-endian sections only");
        }

        let corpus = File::open(&self.corpus)
            .with_context(|| format!("open corpus {}", self.corpus.display()))?;

        std::fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("create out dir {}", self.out_dir.display()))?;
        let runs_dir = self.out_dir.join("_runs");
        let tmp_dir = self.out_dir.join("_tmp");
        std::fs::create_dir_all(&runs_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        let workers = worker_count(self.threads);
        let run_max_pairs = run_max_pairs_from_env();
        let merge_max_way = env_usize("PLAGIO_MERGE_MAX_WAY", 64).max(8);
        let keep_tmp = env_bool("PLAGIO_TMP_KEEP", false);

        log::info!(
            "building {} from {}: workers={} run_max_pairs={} merge_max_way={}",
            self.out_dir.display(),
            self.corpus.display(),
            workers,
            run_max_pairs,
            merge_max_way
        );

        // Reader feeds batches through a bounded channel; a full queue blocks
        // the reader, which is the back-pressure contract.
        let (tx, rx) = sync_channel::<Vec<String>>(QUEUE_MAX_BATCH);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for tid in 0..workers {
            let rx = Arc::clone(&rx);
            let mut ctx = WorkerCtx::new(tid as u32, runs_dir.clone(), run_max_pairs);
            handles.push(thread::spawn(move || -> Result<WorkerCtx> {
                loop {
                    let batch = {
                        let guard = rx.lock().unwrap();
                        guard.recv()
                    };
                    match batch {
                        Ok(lines) => ctx.process_batch(&lines)?,
                        Err(_) => break,
                    }
                }
                ctx.flush_run()?;
                Ok(ctx)
            }));
        }
        // workers hold the only receiver handles now; if they all die, the
        // channel closes and the reader stops instead of blocking on send
        drop(rx);

        let mut lines_total = 0u64;
        {
            let mut reader = BufReader::new(corpus);
            let mut batch: Vec<String> = Vec::with_capacity(LINES_BATCH);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).context("read corpus line")?;
                if n == 0 {
                    break;
                }
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                batch.push(trimmed.to_string());
                lines_total += 1;

                if batch.len() >= LINES_BATCH {
                    if tx.send(std::mem::replace(
                        &mut batch,
                        Vec::with_capacity(LINES_BATCH),
                    ))
                    .is_err()
                    {
                        break; // a worker died; its error surfaces at join
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.send(batch);
            }
        }
        drop(tx);

        let mut ctxs = Vec::with_capacity(workers);
        for h in handles {
            let ctx = h
                .join()
                .map_err(|_| anyhow!("index worker panicked"))??;
            ctxs.push(ctx);
        }

        // Global doc ids by prefix sum over per-worker counts; records in the
        // run files keep local ids until the merge rebases them.
        let mut doc_offsets = Vec::with_capacity(ctxs.len());
        let mut acc: u64 = 0;
        for ctx in &ctxs {
            doc_offsets.push(acc as u32);
            acc += ctx.doc_ids.len() as u64;
        }
        if acc == 0 {
            bail!("no valid documents in corpus (lines={})", lines_total);
        }
        if acc > u32::MAX as u64 {
            bail!("corpus exceeds u32 doc id space: {} docs", acc);
        }

        let mut doc_ids: Vec<String> = Vec::with_capacity(acc as usize);
        let mut docs_meta: Vec<DocMeta> = Vec::with_capacity(acc as usize);
        let mut run_paths: Vec<PathBuf> = Vec::new();
        let mut docs_ok = 0u64;
        let mut docs_bad = 0u64;
        let mut pairs_emitted = 0u64;

        for ctx in ctxs {
            docs_ok += ctx.docs_ok;
            docs_bad += ctx.docs_bad;
            pairs_emitted += ctx.pairs_emitted;
            doc_ids.extend(ctx.doc_ids);
            docs_meta.extend(ctx.docs_meta);
            run_paths.extend(ctx.run_paths);
        }
        if run_paths.is_empty() {
            bail!("no runs produced for {} docs", doc_ids.len());
        }

        let reduced =
            reduce_runs_multipass(run_paths, &tmp_dir, merge_max_way, Some(&doc_offsets))?;

        let sections = SectionFiles {
            hashes: tmp_dir.join("hashes.bin"),
            offsets: tmp_dir.join("offsets.bin"),
            docids: tmp_dir.join("docids.bin"),
        };
        let (uniq_cnt, did_cnt) =
            merge_runs_to_csr(&reduced, Some(&doc_offsets), &sections)?;

        let mut meta = serde_json::json!({
            "config": {
                "k": SHINGLE_K,
                "stride": SHINGLE_STRIDE,
                "max_tokens": MAX_TOKENS_PER_DOC,
                "max_shingles": MAX_SHINGLES_PER_DOC,
                "bin_version": VERSION,
                "merge_max_way": merge_max_way,
                "thresholds": { "plag_thr": 0.7, "partial_thr": 0.3 },
            },
            "stats": {
                "lines_total": lines_total,
                "docs_ok": docs_ok,
                "docs_bad": docs_bad,
                "pairs_emitted_pre_dedup": pairs_emitted,
                "uniq9_cnt": uniq_cnt,
                "did9_cnt": did_cnt,
                "workers": workers,
                "runs_final": reduced.len(),
            },
        });
        if env_bool("PLAGIO_META_DOCS_MAP", false) {
            // huge on corpora with millions of docs, hence opt-in
            let mut map = serde_json::Map::with_capacity(doc_ids.len());
            for (id, dm) in doc_ids.iter().zip(&docs_meta) {
                map.insert(
                    id.clone(),
                    serde_json::json!({
                        "tok_len": dm.tok_len,
                        "simhash_hi": dm.simhash_hi,
                        "simhash_lo": dm.simhash_lo,
                    }),
                );
            }
            meta["docs_meta"] = serde_json::Value::Object(map);
        }

        ShardWriter::new(&self.out_dir, &tmp_dir).publish(
            &docs_meta,
            &doc_ids,
            &sections,
            uniq_cnt,
            did_cnt,
            &meta,
        )?;

        if !keep_tmp {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            let _ = std::fs::remove_dir_all(&runs_dir);
        }

        let summary = BuildSummary {
            lines_total,
            docs_ok,
            docs_bad,
            pairs_emitted,
            uniq_cnt,
            did_cnt,
            workers,
            runs_final: reduced.len(),
        };
        log::info!(
            "built {}: docs={} uniq={} did={} bad={}",
            self.out_dir.display(),
            summary.docs_ok,
            summary.uniq_cnt,
            summary.did_cnt,
            summary.docs_bad
        );
        Ok(summary)
    }
}
