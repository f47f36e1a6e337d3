use anyhow::Result;
use std::io::Write;
use std::path::Path;

use plagio_rs::IndexBuilder;
use plagio_segments::search_many;

fn write_corpus(path: &Path, docs: &[(&str, &str)]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    for (doc_id, text) in docs {
        writeln!(f, "{}", serde_json::json!({ "doc_id": doc_id, "text": text }))?;
    }
    Ok(())
}

fn words(range: std::ops::Range<usize>) -> String {
    range.map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}

fn build_shard(dir: &Path, name: &str, docs: &[(&str, &str)]) -> Result<String> {
    let corpus = dir.join(format!("{}.jsonl", name));
    write_corpus(&corpus, docs)?;
    let out = dir.join(name);
    IndexBuilder::new(&corpus, &out).threads(1).build()?;
    Ok(out.to_string_lossy().into_owned())
}

#[test]
fn cross_shard_dedup_by_doc_id() -> Result<()> {
    let td = tempfile::tempdir()?;
    let shared = words(0..30);
    let s1 = build_shard(
        td.path(),
        "s1",
        &[("shared-doc", &shared), ("only-1", &words(100..130))],
    )?;
    let s2 = build_shard(
        td.path(),
        "s2",
        &[("shared-doc", &shared), ("only-2", &words(200..230))],
    )?;

    let v = search_many(&words(0..30), 10, &[s1, s2]);
    assert_eq!(v["ok"], true);
    assert_eq!(v["dirs_ok"], 2);
    assert_eq!(v["dirs_failed"], 0);
    assert_eq!(v["count"], 1);

    let hit = &v["hits"][0];
    assert_eq!(hit["doc_id"], "shared-doc");
    assert_eq!(hit["doc_uid"], "shared-doc");
    assert_eq!(hit["found_in"], 2);
    // identical copies: best score is the per-shard score
    assert!((hit["score"].as_f64().unwrap() - 0.9).abs() < 1e-9);
    Ok(())
}

#[test]
fn best_score_wins_across_shards() -> Result<()> {
    let td = tempfile::tempdir()?;
    let exact = words(0..30);
    let diluted = format!("{} {}", words(0..30), words(300..340));
    let s1 = build_shard(td.path(), "b1", &[("doc", &diluted)])?;
    let s2 = build_shard(td.path(), "b2", &[("doc", &exact)])?;

    let v = search_many(&exact, 10, &[s1, s2.clone()]);
    assert_eq!(v["count"], 1);
    let hit = &v["hits"][0];
    assert_eq!(hit["found_in"], 2);
    // the exact copy in shard 2 dominates
    assert!((hit["score"].as_f64().unwrap() - 0.9).abs() < 1e-9);
    assert_eq!(hit["best_index_dir"], serde_json::Value::String(s2));
    Ok(())
}

#[test]
fn failed_shards_are_isolated() -> Result<()> {
    let td = tempfile::tempdir()?;
    let s1 = build_shard(td.path(), "ok1", &[("doc", &words(0..30))])?;
    let missing = td.path().join("missing").to_string_lossy().into_owned();

    let v = search_many(&words(0..30), 10, &[missing, s1]);
    assert_eq!(v["ok"], true);
    assert_eq!(v["dirs_ok"], 1);
    assert_eq!(v["dirs_failed"], 1);
    assert_eq!(v["count"], 1);
    Ok(())
}

#[test]
fn fallback_keys_use_dir_and_internal_id() -> Result<()> {
    let td = tempfile::tempdir()?;
    let shard = build_shard(td.path(), "nofids", &[("doc", &words(0..30))])?;
    // strip the external ids: hits must fall back to "<dir>:<did>" keys
    std::fs::write(
        Path::new(&shard).join("index_native_docids.json"),
        "[]",
    )?;

    let v = search_many(&words(0..30), 10, &[shard.clone()]);
    assert_eq!(v["count"], 1);
    let hit = &v["hits"][0];
    let expected = format!("{}:0", shard);
    assert_eq!(hit["doc_uid"], serde_json::Value::String(expected.clone()));
    assert_eq!(hit["doc_id"], serde_json::Value::String(expected));
    assert_eq!(hit["found_in"], 1);
    Ok(())
}

#[test]
fn global_ranking_merges_distinct_docs() -> Result<()> {
    let td = tempfile::tempdir()?;
    let query = words(0..30);
    let near = format!("{} {}", words(0..30), words(400..420));
    let s1 = build_shard(td.path(), "g1", &[("exact", &query)])?;
    let s2 = build_shard(td.path(), "g2", &[("near", &near)])?;

    let v = search_many(&query, 10, &[s1, s2]);
    assert_eq!(v["count"], 2);
    assert_eq!(v["hits"][0]["doc_id"], "exact");
    assert_eq!(v["hits"][1]["doc_id"], "near");
    let s0 = v["hits"][0]["score"].as_f64().unwrap();
    let s1 = v["hits"][1]["score"].as_f64().unwrap();
    assert!(s0 > s1);

    // top_k = 1 keeps only the global best
    let q = words(0..30);
    let dirs: Vec<String> = v["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["best_index_dir"].as_str().unwrap().to_string())
        .collect();
    let v1 = search_many(&q, 1, &dirs);
    assert_eq!(v1["count"], 1);
    assert_eq!(v1["hits"][0]["doc_id"], "exact");
    Ok(())
}
