use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::config::IndexConfig;
use super::{DocMeta, LoadError, DOCIDS_JSON, DOC_META_LEN, HEADER_LEN, INDEX_BIN, MAGIC};

// Legacy flat-postings indexes are converted in RAM; beyond this many
// postings the caller must rebuild as v2.
const V1_POSTINGS_MAX: u64 = 50_000_000;

const VALIDATE_WINDOW: u64 = 65_536;

/// A loaded shard: read-only after `open`, safe to share across threads.
///
/// v2 indexes are memory-mapped and consumed zero-copy; legacy v1 indexes
/// are converted to in-RAM CSR at load. Document-id strings are always
/// owned.
pub struct ShardIndex {
    cfg: IndexConfig,
    doc_ids: Vec<String>,

    n_docs: u32,
    uniq_cnt: u64,
    did_cnt: u64,
    index_version: u32,

    // v2: mmap plus byte offsets of each section
    mmap: Option<Mmap>,
    docs_off: usize,
    uniq_off: usize,
    off_off: usize,
    did_off: usize,

    // v1 fallback storage
    docs_mem: Vec<DocMeta>,
    uniq_mem: Vec<u64>,
    off_mem: Vec<u64>,
    did_mem: Vec<u32>,
}

#[inline]
fn le_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

#[inline]
fn le_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

impl ShardIndex {
    /// Open the index in `dir`, validating the format and the CSR
    /// invariants. Fails with a typed error; never publishes a partially
    /// usable engine.
    pub fn open(dir: impl AsRef<Path>) -> Result<ShardIndex, LoadError> {
        let dir = dir.as_ref();

        if cfg!(target_endian = "big") {
            return Err(LoadError::Format(
                "index format is little-endian only".into(),
            ));
        }

        let cfg = IndexConfig::load(dir);

        let docids_path = dir.join(DOCIDS_JSON);
        let docids_bytes = std::fs::read(&docids_path)?;
        let mut doc_ids: Vec<String> = serde_json::from_slice(&docids_bytes)
            .map_err(|e| LoadError::Format(format!("bad {}: {}", DOCIDS_JSON, e)))?;

        let bin_path = dir.join(INDEX_BIN);
        let file = File::open(&bin_path)?;

        let mut head = [0u8; 8];
        {
            let mut r = &file;
            r.read_exact(&mut head)?;
            r.seek(SeekFrom::Start(0))?;
        }
        if head[0..4] != MAGIC {
            return Err(LoadError::Format("bad magic".into()));
        }
        let version = le_u32(&head, 4);

        let mut idx = match version {
            2 => Self::load_v2_mmap(cfg, &file)?,
            1 => Self::load_v1_build_csr(cfg, &file)?,
            v => return Err(LoadError::Format(format!("unsupported version {}", v))),
        };

        if doc_ids.len() > idx.n_docs as usize {
            doc_ids.truncate(idx.n_docs as usize);
        }
        idx.doc_ids = doc_ids;

        log::info!(
            "loaded {}: v{} docs={} uniq={} did={} mmap={}",
            dir.display(),
            idx.index_version,
            idx.n_docs,
            idx.uniq_cnt,
            idx.did_cnt,
            idx.mmap.is_some()
        );
        Ok(idx)
    }

    fn load_v2_mmap(cfg: IndexConfig, file: &File) -> Result<ShardIndex, LoadError> {
        let mmap = unsafe { Mmap::map(file)? };
        #[cfg(unix)]
        {
            // postings access is effectively random: lower_bound + row slices
            let _ = mmap.advise(memmap2::Advice::Random);
        }

        if mmap.len() < HEADER_LEN {
            return Err(LoadError::Format("file too small".into()));
        }
        let n_docs = le_u32(&mmap, 8);
        let uniq_cnt = le_u64(&mmap, 12);
        let did_cnt = le_u64(&mmap, 20);

        if n_docs == 0 || uniq_cnt == 0 {
            return Err(LoadError::Invariant("empty docs or uniq table".into()));
        }

        let docs_off = HEADER_LEN;
        let uniq_off = (n_docs as usize)
            .checked_mul(DOC_META_LEN)
            .and_then(|b| docs_off.checked_add(b))
            .ok_or_else(|| LoadError::Format("docs section size overflow".into()))?;
        let off_off = (uniq_cnt as usize)
            .checked_mul(8)
            .and_then(|b| uniq_off.checked_add(b))
            .ok_or_else(|| LoadError::Format("uniq section size overflow".into()))?;
        let did_off = (uniq_cnt as usize + 1)
            .checked_mul(8)
            .and_then(|b| off_off.checked_add(b))
            .ok_or_else(|| LoadError::Format("off section size overflow".into()))?;
        let end = (did_cnt as usize)
            .checked_mul(4)
            .and_then(|b| did_off.checked_add(b))
            .ok_or_else(|| LoadError::Format("did section size overflow".into()))?;
        if end > mmap.len() {
            return Err(LoadError::Format("truncated index sections".into()));
        }

        let idx = ShardIndex {
            cfg,
            doc_ids: Vec::new(),
            n_docs,
            uniq_cnt,
            did_cnt,
            index_version: 2,
            mmap: Some(mmap),
            docs_off,
            uniq_off,
            off_off,
            did_off,
            docs_mem: Vec::new(),
            uniq_mem: Vec::new(),
            off_mem: Vec::new(),
            did_mem: Vec::new(),
        };

        idx.validate_csr_basic()?;
        idx.validate_uniq_sorted_sample()?;
        idx.validate_postings_sorted_sample()?;
        Ok(idx)
    }

    fn load_v1_build_csr(cfg: IndexConfig, file: &File) -> Result<ShardIndex, LoadError> {
        let mut r = BufReader::new(file);
        let mut head = [0u8; 4 + 4 + 4 + 8 + 8];
        r.read_exact(&mut head)?;
        let n_docs = le_u32(&head, 8);
        let n_post9 = le_u64(&head, 12);
        let n_post13 = le_u64(&head, 20);

        if n_docs == 0 {
            return Err(LoadError::Invariant("v1 index with zero docs".into()));
        }
        if n_post9 > V1_POSTINGS_MAX {
            return Err(LoadError::Format(
                "v1 postings too large; rebuild as v2".into(),
            ));
        }

        let mut docs_mem = Vec::with_capacity(n_docs as usize);
        let mut rec = [0u8; DOC_META_LEN];
        for _ in 0..n_docs {
            r.read_exact(&mut rec)
                .map_err(|_| LoadError::Format("truncated v1 docs meta".into()))?;
            docs_mem.push(DocMeta {
                tok_len: le_u32(&rec, 0),
                simhash_hi: le_u64(&rec, 4),
                simhash_lo: le_u64(&rec, 12),
            });
        }

        let mut postings: Vec<(u64, u32)> = Vec::with_capacity(n_post9 as usize);
        let mut pair = [0u8; 12];
        for _ in 0..n_post9 {
            r.read_exact(&mut pair)
                .map_err(|_| LoadError::Format("truncated v1 postings".into()))?;
            postings.push((le_u64(&pair, 0), le_u32(&pair, 8)));
        }
        // the secondary posting list of the v1 layout is obsolete; skip it
        for _ in 0..n_post13 {
            r.read_exact(&mut pair)
                .map_err(|_| LoadError::Format("truncated v1 tail postings".into()))?;
        }

        postings.sort_unstable();
        postings.dedup();

        let mut uniq_mem: Vec<u64> = Vec::with_capacity(postings.len() / 4 + 1);
        let mut off_mem: Vec<u64> = Vec::with_capacity(postings.len() / 4 + 2);
        let mut did_mem: Vec<u32> = Vec::with_capacity(postings.len());

        let mut i = 0usize;
        while i < postings.len() {
            let h = postings[i].0;
            uniq_mem.push(h);
            off_mem.push(did_mem.len() as u64);
            while i < postings.len() && postings[i].0 == h {
                did_mem.push(postings[i].1);
                i += 1;
            }
        }
        off_mem.push(did_mem.len() as u64);

        let idx = ShardIndex {
            cfg,
            doc_ids: Vec::new(),
            n_docs,
            uniq_cnt: uniq_mem.len() as u64,
            did_cnt: did_mem.len() as u64,
            index_version: 1,
            mmap: None,
            docs_off: 0,
            uniq_off: 0,
            off_off: 0,
            did_off: 0,
            docs_mem,
            uniq_mem,
            off_mem,
            did_mem,
        };

        if idx.uniq_cnt == 0 {
            return Err(LoadError::Invariant("v1 index with no postings".into()));
        }
        idx.validate_csr_basic()?;
        idx.validate_uniq_sorted_sample()?;
        Ok(idx)
    }

    // ---- section accessors -------------------------------------------------

    #[inline]
    pub(crate) fn uniq_at(&self, i: u64) -> u64 {
        match &self.mmap {
            Some(m) => le_u64(m, self.uniq_off + (i as usize) * 8),
            None => self.uniq_mem[i as usize],
        }
    }

    #[inline]
    pub(crate) fn off_at(&self, i: u64) -> u64 {
        match &self.mmap {
            Some(m) => le_u64(m, self.off_off + (i as usize) * 8),
            None => self.off_mem[i as usize],
        }
    }

    #[inline]
    pub(crate) fn did_at(&self, pos: u64) -> u32 {
        match &self.mmap {
            Some(m) => le_u32(m, self.did_off + (pos as usize) * 4),
            None => self.did_mem[pos as usize],
        }
    }

    #[inline]
    pub(crate) fn tok_len_at(&self, did: u32) -> u32 {
        if did >= self.n_docs {
            return 0;
        }
        match &self.mmap {
            Some(m) => le_u32(m, self.docs_off + (did as usize) * DOC_META_LEN),
            None => self.docs_mem[did as usize].tok_len,
        }
    }

    /// Full metadata record for a document.
    pub fn doc_meta(&self, did: u32) -> Option<DocMeta> {
        if did >= self.n_docs {
            return None;
        }
        Some(match &self.mmap {
            Some(m) => {
                let base = self.docs_off + (did as usize) * DOC_META_LEN;
                DocMeta {
                    tok_len: le_u32(m, base),
                    simhash_hi: le_u64(m, base + 4),
                    simhash_lo: le_u64(m, base + 12),
                }
            }
            None => self.docs_mem[did as usize],
        })
    }

    /// Postings range for hash `h`, searching from `hint` forward. The hint
    /// is advanced to the insertion point so a sorted sequence of probes
    /// degrades to a single sweep over `uniq`.
    #[inline]
    pub(crate) fn find_postings_hint(&self, h: u64, hint: &mut u64) -> Option<(u64, u64)> {
        let n = self.uniq_cnt;
        if n == 0 {
            return None;
        }
        if *hint > n {
            *hint = 0;
        }

        let mut lo = *hint;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.uniq_at(mid) < h {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        *hint = lo;
        if lo == n || self.uniq_at(lo) != h {
            return None;
        }
        let l = self.off_at(lo);
        let r = self.off_at(lo + 1);
        if l < r {
            Some((l, r))
        } else {
            None
        }
    }

    // ---- validation --------------------------------------------------------

    fn validate_csr_basic(&self) -> Result<(), LoadError> {
        let u = self.uniq_cnt;
        let d = self.did_cnt;
        let n = self.n_docs;

        if self.off_at(0) != 0 {
            return Err(LoadError::Invariant("off[0] != 0".into()));
        }
        if self.off_at(u) != d {
            return Err(LoadError::Invariant("off[uniq_cnt] != did_cnt".into()));
        }
        for i in 0..u {
            let a = self.off_at(i);
            let b = self.off_at(i + 1);
            if a > b {
                return Err(LoadError::Invariant(format!("off not monotonic at {}", i)));
            }
            if b > d {
                return Err(LoadError::Invariant(format!("off[{}] beyond did_cnt", i + 1)));
            }
        }

        if d == 0 {
            return Ok(());
        }

        let check_window = |start: u64, len: u64| -> Result<(), LoadError> {
            let end = d.min(start + len);
            for i in start..end {
                if self.did_at(i) >= n {
                    return Err(LoadError::Invariant(format!("did out of range at {}", i)));
                }
            }
            Ok(())
        };

        if d <= 3 * VALIDATE_WINDOW {
            // modest index: scan everything
            check_window(0, d)?;
        } else {
            check_window(0, VALIDATE_WINDOW)?;
            let mid = d / 2;
            check_window(mid.saturating_sub(VALIDATE_WINDOW / 2), VALIDATE_WINDOW)?;
            check_window(d - VALIDATE_WINDOW, VALIDATE_WINDOW)?;

            let samples = self.cfg.validate_did_samples;
            if samples > 0 && d > 1 {
                let mut rng =
                    StdRng::seed_from_u64(0xC0FFEE ^ d ^ ((n as u64) << 1));
                for _ in 0..samples {
                    let pos = rng.gen_range(0..d);
                    if self.did_at(pos) >= n {
                        return Err(LoadError::Invariant(format!(
                            "did out of range at sampled {}",
                            pos
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_uniq_sorted_sample(&self) -> Result<(), LoadError> {
        let u = self.uniq_cnt;
        if u == 0 {
            return Err(LoadError::Invariant("uniq_cnt == 0".into()));
        }

        let check_win = |start: u64| -> Result<(), LoadError> {
            if start >= u {
                return Ok(());
            }
            let end = u.min(start + VALIDATE_WINDOW);
            let mut prev = self.uniq_at(start);
            for i in start + 1..end {
                let cur = self.uniq_at(i);
                if cur <= prev {
                    return Err(LoadError::Invariant(format!("uniq not ascending at {}", i)));
                }
                prev = cur;
            }
            Ok(())
        };

        check_win(0)?;
        if u > VALIDATE_WINDOW {
            check_win(u / 2)?;
            check_win(u - VALIDATE_WINDOW)?;
        }

        let samples = self.cfg.validate_uniq_samples.min(200_000);
        if samples > 0 && u > 1 {
            let mut rng = StdRng::seed_from_u64(0x1234_5678 ^ u);
            for _ in 0..samples {
                let k = rng.gen_range(1..u);
                if self.uniq_at(k) <= self.uniq_at(k - 1) {
                    return Err(LoadError::Invariant(format!(
                        "uniq not ascending at sampled {}",
                        k
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_postings_sorted_sample(&self) -> Result<(), LoadError> {
        let u = self.uniq_cnt;
        let d = self.did_cnt;
        let n = self.n_docs;
        let samples = self.cfg.validate_postings_samples;
        if samples == 0 || u == 0 {
            return Ok(());
        }

        let mut rng = StdRng::seed_from_u64(0xBADC0DE ^ u ^ (d << 1) ^ n as u64);
        for _ in 0..samples {
            let i = rng.gen_range(0..u);
            let l = self.off_at(i);
            let r = self.off_at(i + 1);
            if l > r || r > d {
                return Err(LoadError::Invariant(format!("bad row bounds at {}", i)));
            }
            let len = r - l;
            if len <= 1 {
                continue;
            }
            // bounded prefix scan per sampled row
            let check_len = len.min(self.cfg.validate_postings_maxlen as u64);
            let mut prev = self.did_at(l);
            if prev >= n {
                return Err(LoadError::Invariant(format!("did out of range in row {}", i)));
            }
            for k in 1..check_len {
                let cur = self.did_at(l + k);
                if cur >= n {
                    return Err(LoadError::Invariant(format!("did out of range in row {}", i)));
                }
                if cur <= prev {
                    return Err(LoadError::Invariant(format!(
                        "row {} postings not strictly ascending",
                        i
                    )));
                }
                prev = cur;
            }
        }
        Ok(())
    }

    // ---- introspection -----------------------------------------------------

    pub fn cfg(&self) -> &IndexConfig {
        &self.cfg
    }
    pub fn doc_count(&self) -> u32 {
        self.n_docs
    }
    pub fn uniq_count(&self) -> u64 {
        self.uniq_cnt
    }
    pub fn did_count(&self) -> u64 {
        self.did_cnt
    }
    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }
    pub fn index_version(&self) -> u32 {
        self.index_version
    }
    pub fn mmap_on(&self) -> bool {
        self.mmap.is_some()
    }

    /// Rough resident footprint, for cache budgeting.
    pub fn approx_bytes(&self) -> u64 {
        let mut b = 0u64;
        b += (self.doc_ids.capacity() * std::mem::size_of::<String>()) as u64;
        for s in &self.doc_ids {
            b += s.capacity() as u64;
        }
        if let Some(m) = &self.mmap {
            return b + m.len() as u64;
        }
        b += (self.uniq_mem.capacity() * 8) as u64;
        b += (self.off_mem.capacity() * 8) as u64;
        b += (self.did_mem.capacity() * 4) as u64;
        b += (self.docs_mem.capacity() * std::mem::size_of::<DocMeta>()) as u64;
        b
    }
}
