// =============================================================================
// storage.rs — THE ARTIFACT VAULT
// =============================================================================
//
// Every output of this pipeline is a JSON file, and every JSON file is
// written the same three ways:
//
//   1. Atomically. We write to a .tmp sibling and rename, because a consumer
//      reading a half-written insurers.json would be worse than a consumer
//      reading yesterday's. Rename is atomic on the filesystems we care
//      about; the tmp file is the price of sleeping at night.
//
//   2. Compressed, for the bulky raw aggregates. Gzip in, gzip out. The
//      monthly artifacts are read back by the next run as a cache, so they
//      round-trip through the same serde types.
//
//   3. Snapshotted, for the published artifacts. A dated copy lands in the
//      snapshots directory on every run, and a pruning pass keeps the pile
//      from growing until the disk files a complaint of its own.
// =============================================================================

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

/// Write a value as minified JSON, atomically (tmp + rename).
pub fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let json = serde_json::to_vec(value).context("serializing JSON payload")?;
    let tmp = tmp_sibling(path);
    fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    debug!(path = %path.display(), bytes = json.len(), "artifact written");
    Ok(())
}

/// Write a value as gzipped minified JSON, atomically.
pub fn write_json_gz<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let json = serde_json::to_vec(value).context("serializing JSON payload")?;
    let tmp = tmp_sibling(path);
    {
        let file = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(&json)
            .with_context(|| format!("compressing into {}", tmp.display()))?;
        enc.finish()
            .with_context(|| format!("finishing gzip stream {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    debug!(path = %path.display(), "gzipped artifact written");
    Ok(())
}

/// Read a gzipped JSON artifact back into a typed value.
pub fn read_json_gz<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file =
        fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut json = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut json)
        .with_context(|| format!("decompressing {}", path.display()))?;
    serde_json::from_slice(&json).with_context(|| format!("parsing {}", path.display()))
}

/// Read a plain JSON artifact.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

/// Write a dated gzipped snapshot: `<dir>/<stem>_<YYYY-MM-DD>.json.gz`.
/// Re-running on the same day overwrites the same snapshot, which is the
/// behavior we want: one snapshot per day per artifact.
pub fn snapshot_json_gz<T: Serialize>(value: &T, dir: &Path, stem: &str) -> Result<PathBuf> {
    let day = Utc::now().format("%Y-%m-%d");
    let path = dir.join(format!("{stem}_{day}.json.gz"));
    write_json_gz(value, &path)?;
    info!(path = %path.display(), "snapshot written");
    Ok(path)
}

/// Delete the oldest snapshots for a stem, keeping the newest `keep`.
/// Date-stamped names sort chronologically, so a plain sort is a timeline.
/// Returns how many files were removed.
pub fn prune_snapshots(dir: &Path, stem: &str, keep: usize) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let prefix = format!("{stem}_");
    let mut snapshots: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(".json.gz"))
                .unwrap_or(false)
        })
        .collect();
    snapshots.sort();

    let mut removed = 0;
    if snapshots.len() > keep {
        let doomed = snapshots.len() - keep;
        for path in snapshots.into_iter().take(doomed) {
            fs::remove_file(&path)
                .with_context(|| format!("removing old snapshot {}", path.display()))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed = removed, stem = stem, "old snapshots pruned");
    }
    Ok(removed)
}

/// Read `meta.count` from an existing artifact, if the file exists and is
/// well-formed. Used by the publication guardrails: a missing or corrupt
/// previous artifact just means there is nothing to regress against.
pub fn read_existing_count(path: &Path) -> Option<u64> {
    let value: serde_json::Value = read_json(path).ok()?;
    value.get("meta")?.get("count")?.as_u64().filter(|c| *c > 0)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        value: u64,
    }

    #[test]
    fn test_json_gz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json.gz");
        let doc = Doc {
            name: "porto".to_string(),
            value: 42,
        };
        write_json_gz(&doc, &path).unwrap();
        let back: Doc = read_json_gz(&path).unwrap();
        assert_eq!(back, doc);
        // No tmp file left behind.
        assert!(!path.with_file_name("doc.json.gz.tmp").exists());
    }

    #[test]
    fn test_atomic_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            name: "azul".to_string(),
            value: 7,
        };
        write_json_atomic(&doc, &path).unwrap();
        let back: Doc = read_json(&path).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_read_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json.gz");
        assert!(read_json_gz::<Doc>(&missing).is_err());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for day in ["2025-01-01", "2025-01-02", "2025-01-03"] {
            let path = dir.path().join(format!("insurers_full_{day}.json.gz"));
            write_json_gz(&serde_json::json!({"day": day}), &path).unwrap();
        }
        let removed = prune_snapshots(dir.path(), "insurers_full", 2).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir
            .path()
            .join("insurers_full_2025-01-01.json.gz")
            .exists());
        assert!(dir.path().join("insurers_full_2025-01-03.json.gz").exists());
    }

    #[test]
    fn test_read_existing_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("insurers.json");
        write_json_atomic(
            &serde_json::json!({"meta": {"count": 231}, "insurers": []}),
            &path,
        )
        .unwrap();
        assert_eq!(read_existing_count(&path), Some(231));
        assert_eq!(read_existing_count(&dir.path().join("missing.json")), None);
    }
}
