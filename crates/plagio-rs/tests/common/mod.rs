use anyhow::Result;
use std::io::Write;
use std::path::Path;

/// Write a JSONL corpus file from (doc_id, text) pairs.
pub fn write_corpus(path: &Path, docs: &[(&str, &str)]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    for (doc_id, text) in docs {
        let line = serde_json::json!({ "doc_id": doc_id, "text": text });
        writeln!(f, "{}", line)?;
    }
    Ok(())
}

/// `n` distinct synthetic tokens: "w0 w1 w2 ...".
pub fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
}
