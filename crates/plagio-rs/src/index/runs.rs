//! Posting run files: the external-memory representation the builder spills
//! to and merges from.
//!
//! A run is a header (`RUN1`, kind, worker id, record count) followed by
//! packed 12-byte `(hash u64, doc u32)` records sorted by `(hash, doc)` and
//! deduped. Kind 1 runs carry worker-local doc ids; kind 2 runs are global.

use anyhow::{bail, Context, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::shard::SectionFiles;

pub(crate) const RUN_MAGIC: [u8; 4] = *b"RUN1";
pub(crate) const RUN_KIND_LOCAL: u32 = 1;
pub(crate) const RUN_KIND_GLOBAL: u32 = 2;

const PAIR_REC_LEN: usize = 12;
const MERGE_BUF_RECS: usize = 1 << 16;

/// One posting record. Field order gives the derived `Ord` the merge key
/// `(h, doc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PairRec {
    pub h: u64,
    pub doc: u32,
}

fn write_run_header<W: Write>(w: &mut W, kind: u32, tid: u32, count: u64) -> Result<()> {
    w.write_all(&RUN_MAGIC)?;
    w.write_all(&kind.to_le_bytes())?;
    w.write_all(&tid.to_le_bytes())?;
    w.write_all(&count.to_le_bytes())?;
    Ok(())
}

/// Sort, dedup and persist a run buffer. The buffer is left sorted so the
/// caller can clear and reuse it.
pub(crate) fn write_run_file(
    path: &Path,
    kind: u32,
    tid: u32,
    recs: &mut Vec<PairRec>,
) -> Result<()> {
    recs.sort_unstable();
    recs.dedup();

    let f = File::create(path).with_context(|| format!("create run {}", path.display()))?;
    let mut w = BufWriter::new(f);
    write_run_header(&mut w, kind, tid, recs.len() as u64)?;
    for rec in recs.iter() {
        w.write_all(&rec.h.to_le_bytes())?;
        w.write_all(&rec.doc.to_le_bytes())?;
    }
    w.flush()?;
    Ok(())
}

/// Buffered reader over one run file, mapping local doc ids to global ones
/// on the fly during the first merge pass.
pub(crate) struct RunReader {
    path: PathBuf,
    r: BufReader<File>,
    kind: u32,
    tid: u32,
    count: u64,
    read: u64,
    byte_buf: Vec<u8>,
    buf: Vec<PairRec>,
    idx: usize,
}

impl RunReader {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open run {}", path.display()))?;
        let mut r = BufReader::new(f);
        let mut hdr = [0u8; 4 + 4 + 4 + 8];
        r.read_exact(&mut hdr)
            .with_context(|| format!("bad run header: {}", path.display()))?;
        if hdr[0..4] != RUN_MAGIC {
            bail!("bad run magic: {}", path.display());
        }
        let kind = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
        let tid = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let count = u64::from_le_bytes(hdr[12..20].try_into().unwrap());
        Ok(Self {
            path: path.to_path_buf(),
            r,
            kind,
            tid,
            count,
            read: 0,
            byte_buf: Vec::new(),
            buf: Vec::with_capacity(MERGE_BUF_RECS),
            idx: 0,
        })
    }

    fn refill(&mut self) -> Result<bool> {
        if self.read >= self.count {
            return Ok(false);
        }
        let left = self.count - self.read;
        let want = left.min(MERGE_BUF_RECS as u64) as usize;

        self.byte_buf.resize(want * PAIR_REC_LEN, 0);
        self.r
            .read_exact(&mut self.byte_buf)
            .with_context(|| format!("truncated run: {}", self.path.display()))?;

        self.buf.clear();
        self.idx = 0;
        for chunk in self.byte_buf.chunks_exact(PAIR_REC_LEN) {
            self.buf.push(PairRec {
                h: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                doc: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
            });
        }
        self.read += want as u64;
        Ok(true)
    }

    /// Next record with a global doc id, or `None` when exhausted.
    pub(crate) fn next_global(&mut self, doc_offsets: Option<&[u32]>) -> Result<Option<PairRec>> {
        if self.idx >= self.buf.len() && !self.refill()? {
            return Ok(None);
        }
        let mut rec = self.buf[self.idx];
        self.idx += 1;

        match self.kind {
            RUN_KIND_GLOBAL => {}
            RUN_KIND_LOCAL => {
                let offsets = doc_offsets
                    .with_context(|| format!("local run without doc offsets: {}", self.path.display()))?;
                let base = *offsets
                    .get(self.tid as usize)
                    .with_context(|| format!("bad tid {} in run {}", self.tid, self.path.display()))?;
                rec.doc += base;
            }
            k => bail!("unknown run kind {} in {}", k, self.path.display()),
        }
        Ok(Some(rec))
    }
}

fn prime_heap(
    readers: &mut [RunReader],
    doc_offsets: Option<&[u32]>,
) -> Result<BinaryHeap<(Reverse<PairRec>, usize)>> {
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (i, rdr) in readers.iter_mut().enumerate() {
        if let Some(rec) = rdr.next_global(doc_offsets)? {
            heap.push((Reverse(rec), i));
        }
    }
    Ok(heap)
}

/// Merge several runs into one global run, deduping `(h, doc)`. Returns the
/// record count written.
pub(crate) fn merge_runs_to_global(
    inputs: &[PathBuf],
    out_path: &Path,
    doc_offsets: Option<&[u32]>,
) -> Result<u64> {
    let mut readers = inputs
        .iter()
        .map(|p| RunReader::open(p))
        .collect::<Result<Vec<_>>>()?;
    let mut heap = prime_heap(&mut readers, doc_offsets)?;

    let f = File::create(out_path)
        .with_context(|| format!("create merged run {}", out_path.display()))?;
    let mut w = BufWriter::new(f);
    // count is unknown until the end; patched below
    write_run_header(&mut w, RUN_KIND_GLOBAL, 0, 0)?;

    let mut written = 0u64;
    let mut last: Option<PairRec> = None;

    while let Some((Reverse(rec), ri)) = heap.pop() {
        if let Some(next) = readers[ri].next_global(doc_offsets)? {
            heap.push((Reverse(next), ri));
        }
        if last != Some(rec) {
            w.write_all(&rec.h.to_le_bytes())?;
            w.write_all(&rec.doc.to_le_bytes())?;
            written += 1;
            last = Some(rec);
        }
    }

    w.flush()?;
    let mut f = w.into_inner()?;
    f.seek(SeekFrom::Start(0))?;
    write_run_header(&mut f, RUN_KIND_GLOBAL, 0, written)?;

    Ok(written)
}

/// Reduce the run count below `max_way` with repeated grouped merges, so the
/// final merge never exceeds the open-file budget. After the first pass all
/// surviving runs are global.
pub(crate) fn reduce_runs_multipass(
    mut runs: Vec<PathBuf>,
    tmp_dir: &Path,
    max_way: usize,
    mut doc_offsets: Option<&[u32]>,
) -> Result<Vec<PathBuf>> {
    let max_way = max_way.max(8);
    let mut pass = 0usize;

    while runs.len() > max_way {
        let mut next = Vec::with_capacity(runs.len().div_ceil(max_way));
        for group in runs.chunks(max_way) {
            let out = tmp_dir.join(format!("run_global_p{}_g{}.bin", pass, next.len()));
            merge_runs_to_global(group, &out, doc_offsets)?;
            next.push(out);
        }
        for old in &runs {
            let _ = std::fs::remove_file(old);
        }
        runs = next;
        pass += 1;
        doc_offsets = None;
    }
    Ok(runs)
}

/// Final merge: stream the remaining runs directly into the three CSR
/// section files. Returns `(uniq_hashes, postings)` written.
pub(crate) fn merge_runs_to_csr(
    run_paths: &[PathBuf],
    doc_offsets: Option<&[u32]>,
    sections: &SectionFiles,
) -> Result<(u64, u64)> {
    let mut readers = run_paths
        .iter()
        .map(|p| RunReader::open(p))
        .collect::<Result<Vec<_>>>()?;
    let mut heap = prime_heap(&mut readers, doc_offsets)?;

    let mut f_hash = BufWriter::new(
        File::create(&sections.hashes).context("create hashes section")?,
    );
    let mut f_off = BufWriter::new(
        File::create(&sections.offsets).context("create offsets section")?,
    );
    let mut f_doc = BufWriter::new(
        File::create(&sections.docids).context("create docids section")?,
    );

    let mut pairs_written = 0u64;
    let mut hashes_written = 0u64;
    let mut cur_h: Option<u64> = None;
    let mut last_doc: Option<u32> = None;

    while let Some((Reverse(rec), ri)) = heap.pop() {
        if let Some(next) = readers[ri].next_global(doc_offsets)? {
            heap.push((Reverse(next), ri));
        }

        if cur_h != Some(rec.h) {
            f_hash.write_all(&rec.h.to_le_bytes())?;
            f_off.write_all(&pairs_written.to_le_bytes())?;
            hashes_written += 1;
            cur_h = Some(rec.h);
            last_doc = None;
        }
        // per-row dedup of (h, doc)
        if last_doc != Some(rec.doc) {
            f_doc.write_all(&rec.doc.to_le_bytes())?;
            pairs_written += 1;
            last_doc = Some(rec.doc);
        }
    }

    // terminating offset
    f_off.write_all(&pairs_written.to_le_bytes())?;

    f_hash.flush()?;
    f_off.flush()?;
    f_doc.flush()?;

    Ok((hashes_written, pairs_written))
}
