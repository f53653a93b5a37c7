//! Snapshot envelope and crash-safe file writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::graph::GraphData;

/// Format tag written into every snapshot.
pub const SNAPSHOT_FORMAT: &str = "kg-snapshot/1";

/// On-disk document wrapping one graph.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    saved_at: DateTime<Utc>,
    /// Hex SHA-256 of the compact canonical JSON of `graph`
    checksum: String,
    graph: serde_json::Value,
}

/// A verified snapshot read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    pub data: GraphData,
}

fn checksum(graph: &serde_json::Value) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(graph)?);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Serialize `data` into a pretty-printed envelope.
pub fn encode(data: &GraphData, saved_at: DateTime<Utc>) -> Result<Vec<u8>> {
    // Checksum over a Value so key order is canonical on both sides.
    let graph = serde_json::to_value(data)?;
    let envelope = Envelope {
        format: SNAPSHOT_FORMAT.to_string(),
        saved_at,
        checksum: checksum(&graph)?,
        graph,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Parse and verify an envelope read from `path`.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<Snapshot> {
    let corrupt = |reason: String| Error::corrupt_snapshot(path, reason);

    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("invalid JSON: {e}")))?;
    if envelope.format != SNAPSHOT_FORMAT {
        return Err(corrupt(format!("unknown format {:?}", envelope.format)));
    }

    let actual = checksum(&envelope.graph)?;
    if actual != envelope.checksum {
        return Err(corrupt(format!(
            "checksum mismatch (stored {}, computed {})",
            envelope.checksum, actual
        )));
    }

    let data: GraphData = serde_json::from_value(envelope.graph)
        .map_err(|e| corrupt(format!("invalid graph: {e}")))?;
    Ok(Snapshot {
        saved_at: envelope.saved_at,
        data,
    })
}

/// Read and verify the snapshot at `path`.
pub fn read(path: &Path) -> Result<Snapshot> {
    let bytes = fs::read(path).map_err(|e| Error::storage_io(path, e))?;
    decode(path, &bytes)
}

/// Sibling temp file used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to the temp sibling of `path` and fsync it.
///
/// The target itself is untouched until [`commit_temp`].
pub fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp = temp_path(path);
    let io = |e| Error::storage_io(&tmp, e);

    let mut file = File::create(&tmp).map_err(io)?;
    file.write_all(bytes).map_err(io)?;
    file.flush().map_err(io)?;
    file.sync_all().map_err(io)?;
    Ok(tmp)
}

/// Atomically replace `path` with a previously written temp file.
pub fn commit_temp(tmp: &Path, path: &Path) -> Result<()> {
    fs::rename(tmp, path).map_err(|e| Error::storage_io(path, e))?;

    // Persist the rename itself. Not every platform can open a directory.
    if let Some(dir) = path.parent() {
        if let Ok(handle) = OpenOptions::new().read(true).open(dir) {
            let _ = handle.sync_all();
        }
    }
    Ok(())
}

/// Write `bytes` to `path` so the target holds either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes)?;
    commit_temp(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NodeContent, Scope};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> GraphData {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut graph = Graph::new(Scope::User);
        graph
            .put_node(NodeContent::new("auth", "JWT at the gateway").with_notes(["rotates daily"]), None, now)
            .unwrap();
        graph.to_data()
    }

    #[test]
    fn test_encode_decode() {
        let now = Utc::now();
        let bytes = encode(&sample(), now).unwrap();
        let snapshot = decode(Path::new("graph.json"), &bytes).unwrap();
        assert_eq!(snapshot.data, sample());
        assert_eq!(snapshot.saved_at, now);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let bytes = encode(&sample(), Utc::now()).unwrap();
        let text = String::from_utf8(bytes).unwrap().replace("rotates daily", "rotates weekly");

        let err = decode(Path::new("graph.json"), text.as_bytes()).unwrap_err();
        match err {
            Error::CorruptSnapshot { reason, .. } => assert!(reason.contains("checksum")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_garbage_and_unknown_format_rejected() {
        let path = Path::new("graph.json");
        assert!(matches!(decode(path, b"{ not json"), Err(Error::CorruptSnapshot { .. })));

        let mut doc: serde_json::Value =
            serde_json::from_slice(&encode(&sample(), Utc::now()).unwrap()).unwrap();
        doc["format"] = "something-else".into();
        let bytes = serde_json::to_vec(&doc).unwrap();
        assert!(matches!(decode(path, &bytes), Err(Error::CorruptSnapshot { .. })));
    }

    #[test]
    fn test_crash_safe_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");

        let old = encode(&sample(), Utc::now()).unwrap();
        write_atomic(&path, &old).unwrap();

        // Crash after the temp write but before the rename.
        let tmp = write_temp(&path, b"{\"half\": ").unwrap();
        assert!(tmp.exists());

        let survived = read(&path).unwrap();
        assert_eq!(survived.data, sample());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        write_atomic(&path, &encode(&GraphData::default(), Utc::now()).unwrap()).unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        assert_eq!(temp_path(&path).file_name().unwrap(), "graph.json.tmp");
    }
}
