//! Content analysis seam and cross-reference output.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SyncError;
use crate::storage::{compress_text, decompress_text};
use crate::tokenize;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8192;

/// Result of analyzing one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnalyzedDocument {
    /// token → 1-based line numbers, ascending and distinct
    pub fields: HashMap<String, Vec<u32>>,
    pub token_count: usize,
    /// Cross-reference rendering, when the analyzer produces one.
    pub xref: Option<String>,
}

/// Turns file content into indexable fields.
///
/// Returns `UnsupportedContent` for files the analyzer refuses; the caller
/// skips those.
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    fn analyze(&self, content: &[u8], path: &Path) -> Result<AnalyzedDocument, SyncError>;
}

/// Line-oriented text analyzer built on the crate tokenizer.
#[derive(Clone, Debug)]
pub struct PlainTextAnalyzer {
    min_token_len: usize,
    xref: bool,
}

impl PlainTextAnalyzer {
    pub fn new(min_token_len: usize, xref: bool) -> Self {
        Self { min_token_len, xref }
    }
}

impl Analyzer for PlainTextAnalyzer {
    fn name(&self) -> &str {
        "plain"
    }

    fn analyze(&self, content: &[u8], path: &Path) -> Result<AnalyzedDocument, SyncError> {
        let sniff = &content[..content.len().min(BINARY_SNIFF_LEN)];
        if sniff.contains(&0) {
            return Err(SyncError::UnsupportedContent {
                path: path.display().to_string(),
                reason: "binary content".to_string(),
            });
        }
        let text = String::from_utf8_lossy(content);

        let mut doc = AnalyzedDocument::default();
        let mut xref = self.xref.then(String::new);
        for (idx, line) in text.lines().enumerate() {
            let line_no = idx as u32 + 1;
            for token in tokenize(line, self.min_token_len) {
                doc.token_count += 1;
                let lines = doc.fields.entry(token).or_default();
                if lines.last() != Some(&line_no) {
                    lines.push(line_no);
                }
            }
            if let Some(out) = xref.as_mut() {
                let _ = writeln!(out, "{:>6} {}", line_no, line);
            }
        }
        doc.xref = xref;
        Ok(doc)
    }
}

// ─── Xref output ────────────────────────────────────────────────────

/// Cross-reference files mirrored under `<root>/<relative path>`.
#[derive(Clone, Debug)]
pub struct XrefStore {
    root: PathBuf,
    compress: bool,
}

impl XrefStore {
    pub fn new(root: PathBuf, compress: bool) -> Self {
        Self { root, compress }
    }

    pub fn path_for(&self, rel: &str) -> PathBuf {
        let path = self.root.join(rel.trim_start_matches('/'));
        if self.compress {
            let mut name = path.into_os_string();
            name.push(".lz4");
            PathBuf::from(name)
        } else {
            path
        }
    }

    pub fn write(&self, rel: &str, text: &str) -> Result<(), SyncError> {
        let path = self.path_for(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.compress {
            std::fs::write(&path, compress_text(text)?)?;
        } else {
            std::fs::write(&path, text)?;
        }
        Ok(())
    }

    pub fn read(&self, rel: &str) -> Result<Option<String>, SyncError> {
        let path = self.path_for(rel);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.compress {
            decompress_text(&bytes).map(Some)
        } else {
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
    }

    /// Delete the xref of `rel` and its directory if that became empty.
    pub fn remove(&self, rel: &str) -> Result<(), SyncError> {
        let path = self.path_for(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent().filter(|p| *p != self.root) {
            // fails while other entries remain
            if std::fs::remove_dir(parent).is_ok() {
                debug!(dir = %parent.display(), "Removed empty xref directory");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_fields() {
        let analyzer = PlainTextAnalyzer::new(2, false);
        let doc = analyzer
            .analyze(b"int main() {\n  return helper(main);\n}\n", Path::new("/a.c"))
            .unwrap();
        assert_eq!(doc.fields["main"], vec![1, 2]);
        assert_eq!(doc.fields["helper"], vec![2]);
        assert_eq!(doc.token_count, 5);
        assert!(doc.xref.is_none());
    }

    #[test]
    fn test_binary_rejected() {
        let analyzer = PlainTextAnalyzer::new(2, true);
        let err = analyzer.analyze(b"\x7fELF\0\0\x01", Path::new("/bin/tool")).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedContent { .. }));
    }

    #[test]
    fn test_xref_numbered_lines() {
        let analyzer = PlainTextAnalyzer::new(2, true);
        let doc = analyzer.analyze(b"first\nsecond", Path::new("/t.txt")).unwrap();
        assert_eq!(doc.xref.as_deref(), Some("     1 first\n     2 second\n"));
    }

    #[test]
    fn test_xref_store_write_read_remove() {
        let tmp = tempfile::tempdir().unwrap();
        for compress in [true, false] {
            let store = XrefStore::new(tmp.path().join("xref"), compress);
            store.write("/proj/src/a.c", "     1 int a;\n").unwrap();
            store.write("/proj/b.c", "     1 int b;\n").unwrap();
            assert_eq!(store.path_for("/proj/b.c").extension().unwrap() == "lz4", compress);
            assert_eq!(store.read("/proj/src/a.c").unwrap().as_deref(), Some("     1 int a;\n"));

            store.remove("/proj/src/a.c").unwrap();
            assert!(!tmp.path().join("xref/proj/src").exists());
            store.remove("/proj/src/a.c").unwrap();
            assert!(store.read("/proj/src/a.c").unwrap().is_none());
            // parent with remaining entries stays
            assert!(tmp.path().join("xref/proj").exists());
            store.remove("/proj/b.c").unwrap();
        }
    }
}
