//! On-disk persistence: LZ4-compressed bincode with atomic replacement.
//!
//! Used by the history cache and the index document store. Writes go to a
//! temp file that is renamed over the target, so a failed write leaves the
//! previous state readable.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use crate::error::SyncError;
use crate::{semantic_prefix, stable_hash};

/// Magic bytes identifying LZ4-compressed data files.
pub const LZ4_MAGIC: &[u8; 4] = b"LZ4S";

/// Save a serializable value with LZ4 frame compression, atomically.
pub fn save_compressed<T: serde::Serialize>(path: &Path, data: &T, label: &str) -> Result<(), SyncError> {
    let start = Instant::now();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));

    {
        let file = std::fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(LZ4_MAGIC)?;
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);
        bincode::serialize_into(&mut encoder, data)?;
        let mut writer = encoder.finish().map_err(std::io::Error::other)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    debug!(
        label,
        path = %path.display(),
        kb = size / 1024,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Saved compressed data"
    );
    Ok(())
}

/// Load a value written by [`save_compressed`].
/// Returns `Err(SyncError::IndexLoad)` with a descriptive message on failure.
pub fn load_compressed<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Result<T, SyncError> {
    let path_str = path.display().to_string();
    let start = Instant::now();

    let file = std::fs::File::open(path).map_err(|e| SyncError::IndexLoad {
        path: path_str.clone(),
        message: format!("cannot open file: {}", e),
    })?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(|e| SyncError::IndexLoad {
        path: path_str.clone(),
        message: format!("read error (magic bytes): {}", e),
    })?;
    if &magic != LZ4_MAGIC {
        return Err(SyncError::IndexLoad {
            path: path_str,
            message: "not a compressed data file (bad magic)".to_string(),
        });
    }

    let decoder = lz4_flex::frame::FrameDecoder::new(reader);
    let value = bincode::deserialize_from(decoder).map_err(|e| SyncError::IndexLoad {
        path: path_str.clone(),
        message: format!("LZ4 deserialization failed: {}", e),
    })?;

    debug!(label, path = %path_str, elapsed_ms = start.elapsed().as_millis() as u64, "Loaded compressed data");
    Ok(value)
}

/// Data file path for a root directory: `<base>/<prefix>_<hash>.<ext>`.
pub fn data_path_for(root: &Path, base: &Path, ext: &str) -> PathBuf {
    let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let hash = stable_hash(&[canonical.to_string_lossy().as_bytes(), ext.as_bytes()]);
    let prefix = semantic_prefix(&canonical);
    base.join(format!("{}_{:08x}.{}", prefix, hash as u32, ext))
}

/// Compress a text blob (xref output) into an LZ4 frame.
pub fn compress_text(text: &str) -> Result<Vec<u8>, SyncError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(text.as_bytes())?;
    encoder.finish().map_err(|e| SyncError::Io(std::io::Error::other(e)))
}

/// Inverse of [`compress_text`].
pub fn decompress_text(bytes: &[u8]) -> Result<String, SyncError> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(bytes);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data.bin");
        let mut data: BTreeMap<String, u64> = BTreeMap::new();
        data.insert("/a.c\u{0}00000000000000000001".to_string(), 1);
        data.insert("/b.c\u{0}00000000000000000002".to_string(), 2);

        save_compressed(&path, &data, "test").unwrap();
        let loaded: BTreeMap<String, u64> = load_compressed(&path, "test").unwrap();
        assert_eq!(loaded, data);
        assert!(!PathBuf::from(format!("{}.tmp", path.display())).exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_compressed::<Vec<u8>>(&dir.path().join("missing.bin"), "test").unwrap_err();
        assert!(matches!(err, SyncError::IndexLoad { .. }));
    }

    #[test]
    fn test_load_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.bin");
        std::fs::write(&path, b"JUNKJUNK").unwrap();
        let err = load_compressed::<Vec<u8>>(&path, "test").unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.bin");
        save_compressed(&path, &vec![1u32, 2, 3], "test").unwrap();
        save_compressed(&path, &vec![4u32], "test").unwrap();
        let loaded: Vec<u32> = load_compressed(&path, "test").unwrap();
        assert_eq!(loaded, vec![4]);
    }

    #[test]
    fn test_data_path_for_distinguishes_ext_and_root() {
        let base = Path::new("/data");
        let a = data_path_for(Path::new("/src/proj"), base, "history");
        let b = data_path_for(Path::new("/src/proj"), base, "index");
        let c = data_path_for(Path::new("/other/proj"), base, "history");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("proj_"));
        assert!(a.to_string_lossy().ends_with(".history"));
    }

    #[test]
    fn test_text_compression_roundtrip() {
        let text = "<a name=\"1\">1</a> fn main() {}\n".repeat(50);
        let packed = compress_text(&text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress_text(&packed).unwrap(), text);
    }
}
