use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{DocMeta, DOCIDS_JSON, INDEX_BIN, MAGIC, META_JSON, VERSION};

/// Temp files holding the three merged CSR sections, in final byte layout.
pub struct SectionFiles {
    pub hashes: PathBuf,
    pub offsets: PathBuf,
    pub docids: PathBuf,
}

/// Assembles and atomically publishes the final shard file set. Every
/// output is written to a temp path, fsynced, then renamed into place, so a
/// crash mid-publish leaves the previous index untouched.
pub struct ShardWriter {
    out_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ShardWriter {
    pub fn new(out_dir: impl AsRef<Path>, tmp_dir: impl AsRef<Path>) -> Self {
        Self {
            out_dir: out_dir.as_ref().to_path_buf(),
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
        }
    }

    pub fn publish(
        &self,
        docs_meta: &[DocMeta],
        doc_ids: &[String],
        sections: &SectionFiles,
        uniq_cnt: u64,
        did_cnt: u64,
        meta: &serde_json::Value,
    ) -> Result<()> {
        if cfg!(target_endian = "big") {
            bail!("refusing to write raw little-endian sections on a big-endian host");
        }
        if docs_meta.len() != doc_ids.len() {
            bail!(
                "docs meta / doc ids length mismatch: {} vs {}",
                docs_meta.len(),
                doc_ids.len()
            );
        }
        if docs_meta.len() > u32::MAX as usize {
            bail!("too many documents for u32 doc ids");
        }

        let bin_tmp = self.tmp_dir.join(format!("{}.tmp", INDEX_BIN));
        {
            let f = File::create(&bin_tmp)
                .with_context(|| format!("create {}", bin_tmp.display()))?;
            let mut w = BufWriter::new(f);

            w.write_all(&MAGIC)?;
            w.write_all(&VERSION.to_le_bytes())?;
            w.write_all(&(docs_meta.len() as u32).to_le_bytes())?;
            w.write_all(&uniq_cnt.to_le_bytes())?;
            w.write_all(&did_cnt.to_le_bytes())?;
            w.write_all(&0u64.to_le_bytes())?; // reserved0
            w.write_all(&0u64.to_le_bytes())?; // reserved1

            for dm in docs_meta {
                w.write_all(&dm.tok_len.to_le_bytes())?;
                w.write_all(&dm.simhash_hi.to_le_bytes())?;
                w.write_all(&dm.simhash_lo.to_le_bytes())?;
            }

            for path in [&sections.hashes, &sections.offsets, &sections.docids] {
                let mut sec = File::open(path)
                    .with_context(|| format!("open section {}", path.display()))?;
                std::io::copy(&mut sec, &mut w)
                    .with_context(|| format!("copy section {}", path.display()))?;
            }

            w.flush()?;
            w.into_inner()?.sync_all().context("fsync index bin")?;
        }
        self.replace_into_out_dir(&bin_tmp, INDEX_BIN)?;

        let docids_tmp = self.tmp_dir.join(format!("{}.tmp", DOCIDS_JSON));
        {
            let f = File::create(&docids_tmp)
                .with_context(|| format!("create {}", docids_tmp.display()))?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer(&mut w, doc_ids).context("encode doc ids")?;
            w.flush()?;
            w.into_inner()?.sync_all().context("fsync doc ids")?;
        }
        self.replace_into_out_dir(&docids_tmp, DOCIDS_JSON)?;

        let meta_tmp = self.tmp_dir.join(format!("{}.tmp", META_JSON));
        {
            let f = File::create(&meta_tmp)
                .with_context(|| format!("create {}", meta_tmp.display()))?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer(&mut w, meta).context("encode meta")?;
            w.flush()?;
            w.into_inner()?.sync_all().context("fsync meta")?;
        }
        self.replace_into_out_dir(&meta_tmp, META_JSON)?;

        Ok(())
    }

    /// Rename `tmp` over `out_dir/name`, then fsync the directory so the
    /// rename itself survives power loss.
    fn replace_into_out_dir(&self, tmp: &Path, name: &str) -> Result<()> {
        let dst = self.out_dir.join(name);
        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(tmp, &dst)
            .with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
        #[cfg(unix)]
        {
            if let Ok(d) = File::open(&self.out_dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}
