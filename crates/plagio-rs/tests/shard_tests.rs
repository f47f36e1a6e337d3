use anyhow::Result;
use std::io::Write;

use plagio_rs::{IndexBuilder, LoadError, ShardIndex};

mod common;
use common::{words, write_corpus};

fn build_small(dir: &std::path::Path) -> Result<std::path::PathBuf> {
    let corpus = dir.join("corpus.jsonl");
    write_corpus(
        &corpus,
        &[
            ("doc-a", "the quick brown fox jumps over the lazy dog near the river"),
            ("doc-b", &words(30)),
        ],
    )?;
    let out = dir.join("index");
    IndexBuilder::new(&corpus, &out).threads(1).build()?;
    Ok(out)
}

#[test]
fn build_open_roundtrip() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;

    let idx = ShardIndex::open(&out)?;
    assert_eq!(idx.doc_count(), 2);
    assert_eq!(idx.index_version(), 2);
    assert!(idx.mmap_on());
    assert_eq!(idx.doc_ids(), &["doc-a".to_string(), "doc-b".to_string()]);

    // tok_len in docs meta equals the tokenizer's count
    let meta = idx.doc_meta(0).unwrap();
    assert_eq!(meta.tok_len, 12);
    let meta = idx.doc_meta(1).unwrap();
    assert_eq!(meta.tok_len, 30);

    assert!(idx.uniq_count() > 0);
    assert!(idx.did_count() >= idx.uniq_count());
    assert!(idx.approx_bytes() > 0);
    Ok(())
}

#[test]
fn open_is_idempotent() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;
    let a = ShardIndex::open(&out)?;
    let b = ShardIndex::open(&out)?;
    assert_eq!(a.doc_count(), b.doc_count());
    assert_eq!(a.uniq_count(), b.uniq_count());
    assert_eq!(a.did_count(), b.did_count());
    Ok(())
}

#[test]
fn corrupt_magic_is_rejected() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;

    let bin = out.join("index_native.bin");
    let mut bytes = std::fs::read(&bin)?;
    bytes[0] = b'X';
    std::fs::write(&bin, &bytes)?;

    match ShardIndex::open(&out) {
        Err(LoadError::Format(msg)) => assert!(msg.contains("magic")),
        other => panic!("expected format error, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn unsupported_version_is_rejected() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;

    let bin = out.join("index_native.bin");
    let mut bytes = std::fs::read(&bin)?;
    bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
    std::fs::write(&bin, &bytes)?;

    assert!(matches!(
        ShardIndex::open(&out),
        Err(LoadError::Format(_))
    ));
    Ok(())
}

#[test]
fn truncated_sections_are_rejected() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;

    let bin = out.join("index_native.bin");
    let bytes = std::fs::read(&bin)?;
    std::fs::write(&bin, &bytes[..bytes.len() - 16])?;

    assert!(matches!(
        ShardIndex::open(&out),
        Err(LoadError::Format(_))
    ));
    Ok(())
}

#[test]
fn out_of_range_docid_fails_invariant_check() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;

    let bin = out.join("index_native.bin");
    let mut bytes = std::fs::read(&bin)?;
    // last 4 bytes are the final entry of the did section
    let n = bytes.len();
    bytes[n - 4..].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    std::fs::write(&bin, &bytes)?;

    assert!(matches!(
        ShardIndex::open(&out),
        Err(LoadError::Invariant(_))
    ));
    Ok(())
}

#[test]
fn missing_docids_file_is_an_error() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = build_small(td.path())?;
    std::fs::remove_file(out.join("index_native_docids.json"))?;
    assert!(matches!(ShardIndex::open(&out), Err(LoadError::Io(_))));
    Ok(())
}

#[test]
fn legacy_v1_is_converted_in_memory() -> Result<()> {
    let td = tempfile::tempdir()?;
    let out = td.path().join("v1index");
    std::fs::create_dir_all(&out)?;

    // v1 layout: magic, version=1, n_docs, n_post9, n_post13, docs meta,
    // then flat (hash, did) pairs
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"PLAG");
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&2u64.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    // doc 0 meta
    bytes.extend_from_slice(&12u32.to_le_bytes());
    bytes.extend_from_slice(&0xAAu64.to_le_bytes());
    bytes.extend_from_slice(&0xBBu64.to_le_bytes());
    // postings, deliberately unsorted
    for (h, did) in [(7u64, 0u32), (5u64, 0u32)] {
        bytes.extend_from_slice(&h.to_le_bytes());
        bytes.extend_from_slice(&did.to_le_bytes());
    }
    std::fs::write(out.join("index_native.bin"), &bytes)?;

    let mut dj = std::fs::File::create(out.join("index_native_docids.json"))?;
    write!(dj, "{}", serde_json::json!(["legacy-doc"]))?;

    let idx = ShardIndex::open(&out)?;
    assert_eq!(idx.index_version(), 1);
    assert!(!idx.mmap_on());
    assert_eq!(idx.doc_count(), 1);
    assert_eq!(idx.uniq_count(), 2);
    assert_eq!(idx.did_count(), 2);
    assert_eq!(idx.doc_meta(0).unwrap().tok_len, 12);
    Ok(())
}
